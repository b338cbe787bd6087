use super::{FrameSource, SourceConnector};
use crate::error::Result;

/// Connector for the continuous-pull variant: an RTSP stream decoded through
/// GStreamer. Only available on Linux with the `rtsp` feature; without it,
/// `connect` reports a capture error and the camera worker keeps retrying,
/// which leaves the poll variant fully usable in portable builds.
pub struct RtspConnector {
    url: String,
    name: String,
}

impl RtspConnector {
    pub fn new(url: String, name: String) -> Self {
        Self { url, name }
    }
}

impl SourceConnector for RtspConnector {
    #[cfg(all(target_os = "linux", feature = "rtsp"))]
    fn connect(&self) -> Result<Box<dyn FrameSource>> {
        gst::open(&self.url, &self.name)
    }

    #[cfg(not(all(target_os = "linux", feature = "rtsp")))]
    fn connect(&self) -> Result<Box<dyn FrameSource>> {
        tracing::warn!(
            "{}: RTSP capture requested but this build has no `rtsp` feature",
            self.name
        );
        Err(crate::error::TagRelayError::capture(
            "built without RTSP support (enable the `rtsp` feature)",
        ))
    }

    fn describe(&self) -> String {
        format!("rtsp {}", self.url)
    }
}

#[cfg(all(target_os = "linux", feature = "rtsp"))]
mod gst {
    use super::*;
    use crate::error::TagRelayError;
    use crate::frame::FrameData;
    use gstreamer::prelude::*;
    use gstreamer::Pipeline;
    use gstreamer_app::AppSink;
    use gstreamer_video::VideoInfo;
    use image::RgbImage;
    use std::time::SystemTime;
    use tracing::{debug, info};

    const PULL_TIMEOUT_SECS: u64 = 5;

    pub(super) fn open(url: &str, name: &str) -> Result<Box<dyn FrameSource>> {
        gstreamer::init().map_err(|e| {
            TagRelayError::capture(format!("failed to initialize GStreamer: {}", e))
        })?;

        // max-buffers=1 drop=true keeps internal buffering minimal so
        // latency does not accumulate on a slow consumer.
        let pipeline_desc = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! \
             appsink name=sink sync=false max-buffers=1 drop=true",
            url
        );
        debug!("{}: creating GStreamer pipeline: {}", name, pipeline_desc);

        let pipeline = gstreamer::parse::launch(&pipeline_desc)
            .map_err(|e| TagRelayError::capture(format!("failed to create pipeline: {}", e)))?
            .downcast::<Pipeline>()
            .map_err(|_| TagRelayError::capture("failed to downcast to Pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| TagRelayError::capture("appsink element missing from pipeline"))?
            .downcast::<AppSink>()
            .map_err(|_| TagRelayError::capture("failed to downcast to AppSink"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| TagRelayError::capture(format!("failed to start pipeline: {}", e)))?;

        info!("{}: RTSP stream opened", name);

        Ok(Box::new(RtspSource {
            pipeline,
            appsink,
            name: name.to_string(),
            frame_counter: 0,
        }))
    }

    struct RtspSource {
        pipeline: Pipeline,
        appsink: AppSink,
        name: String,
        frame_counter: u64,
    }

    impl FrameSource for RtspSource {
        fn read_frame(&mut self) -> Result<FrameData> {
            let sample = self
                .appsink
                .try_pull_sample(gstreamer::ClockTime::from_seconds(PULL_TIMEOUT_SECS))
                .ok_or_else(|| {
                    TagRelayError::capture(format!("{}: no sample within timeout", self.name))
                })?;

            let buffer = sample
                .buffer()
                .ok_or_else(|| TagRelayError::capture("no buffer in sample"))?;
            let caps = sample
                .caps()
                .ok_or_else(|| TagRelayError::capture("no caps in sample"))?;
            let video_info = VideoInfo::from_caps(caps)
                .map_err(|e| TagRelayError::capture(format!("failed to get video info: {}", e)))?;

            let width = video_info.width();
            let height = video_info.height();
            let stride = video_info.stride()[0] as usize;

            let map = buffer
                .map_readable()
                .map_err(|e| TagRelayError::capture(format!("failed to map buffer: {}", e)))?;

            // Rows may be padded; copy them out at their packed width.
            let row_bytes = width as usize * 3;
            let mut pixels = Vec::with_capacity(row_bytes * height as usize);
            for row in 0..height as usize {
                let start = row * stride;
                pixels.extend_from_slice(&map.as_slice()[start..start + row_bytes]);
            }

            let image = RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
                TagRelayError::capture(format!(
                    "{}: sample size mismatch for {}x{}",
                    self.name, width, height
                ))
            })?;

            let id = self.frame_counter;
            self.frame_counter += 1;
            Ok(FrameData::new(id, SystemTime::now(), image))
        }
    }

    impl Drop for RtspSource {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
            debug!("{}: RTSP stream released", self.name);
        }
    }
}
