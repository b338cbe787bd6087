mod rtsp;
mod snapshot;

pub use rtsp::RtspConnector;
pub use snapshot::{SnapshotConnector, SnapshotSource, SnapshotStats};

use crate::config::{CameraTarget, SourceConfig};
use crate::error::Result;
use crate::frame::FrameData;
use std::time::Duration;

/// An open frame source. `read_frame` blocks until a fresh frame is
/// available or a bounded timeout elapses; any error means the source must
/// be dropped and reopened by the worker.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<FrameData>;
}

/// Factory for a camera's frame source. `connect` performs the full open
/// (including any probe) so that a failure keeps the camera worker in its
/// Connecting state; the worker owns the retry/backoff loop.
pub trait SourceConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn FrameSource>>;

    /// Human-readable description for logging
    fn describe(&self) -> String;
}

/// Build the connector matching a camera's configured source.
pub fn connector_for(camera: &CameraTarget) -> Box<dyn SourceConnector> {
    match &camera.source {
        SourceConfig::Rtsp { url } => {
            Box::new(RtspConnector::new(url.clone(), camera.name.clone()))
        }
        SourceConfig::Snapshot {
            url,
            username,
            password,
            interval_secs,
            timeout_secs,
        } => Box::new(SnapshotConnector::new(
            url.clone(),
            username.clone(),
            password.clone(),
            Duration::from_secs_f64(*interval_secs),
            Duration::from_secs_f64(*timeout_secs),
            camera.name.clone(),
        )),
    }
}
