use crate::config::{CameraTarget, TagRelayConfig};
use crate::detector::SharedDetector;
use crate::filter::{self, AreaBounds};
use crate::frame::AnnotatedFrame;
use crate::relay::{ProtocolRelay, RelayTarget};
use crate::roi::RoiStore;
use crate::source::{self, SourceConnector};
use crate::table::DetectionTable;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How often blocking backoff waits re-check the stop flag
const STOP_POLL_SLICE: Duration = Duration::from_millis(100);

/// Lifecycle of one camera worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    /// Trying to open the frame source, with backoff between attempts
    Connecting,
    /// Reading and processing frames
    Streaming,
    /// Terminal: the worker has exited and released its source
    Stopped,
}

/// Builds a camera's source connector; replaceable so embedders and tests
/// can supply their own frame sources.
pub type ConnectorFactory =
    Box<dyn Fn(&CameraTarget) -> Box<dyn SourceConnector> + Send + Sync>;

/// Owns one processing pipeline per configured camera plus the protocol
/// relay, and starts/stops them as a unit.
///
/// The workers share nothing except the detector lock, the detections
/// table, and their per-camera bounded output channels.
pub struct CameraProcessor {
    config: TagRelayConfig,
    detector: SharedDetector,
    table: Arc<DetectionTable>,
    roi_store: Arc<RoiStore>,
    connector_factory: ConnectorFactory,

    stop_flag: Arc<AtomicBool>,
    states: Arc<Mutex<HashMap<usize, CameraState>>>,
    dropped_frames: HashMap<usize, Arc<AtomicU64>>,
    outputs: HashMap<usize, Receiver<AnnotatedFrame>>,
    workers: Vec<(String, JoinHandle<()>)>,
    relay: Option<ProtocolRelay>,
}

impl CameraProcessor {
    pub fn new(config: TagRelayConfig, detector: SharedDetector) -> Self {
        let roi_store = Arc::new(RoiStore::new(&config.roi_file));
        Self {
            config,
            detector,
            table: Arc::new(DetectionTable::new()),
            roi_store,
            connector_factory: Box::new(|camera| source::connector_for(camera)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            states: Arc::new(Mutex::new(HashMap::new())),
            dropped_frames: HashMap::new(),
            outputs: HashMap::new(),
            workers: Vec::new(),
            relay: None,
        }
    }

    /// Replace how source connectors are built for each camera.
    pub fn set_connector_factory(&mut self, factory: ConnectorFactory) {
        self.connector_factory = factory;
    }

    /// Shared detections table (read by the relay and status logging).
    pub fn table(&self) -> Arc<DetectionTable> {
        Arc::clone(&self.table)
    }

    /// Consumer end of a camera's annotated-frame channel. The producer
    /// never blocks on it; a slow consumer just misses frames.
    pub fn output(&self, camera_index: usize) -> Option<Receiver<AnnotatedFrame>> {
        self.outputs.get(&camera_index).cloned()
    }

    pub fn state(&self, camera_index: usize) -> Option<CameraState> {
        self.states.lock().get(&camera_index).copied()
    }

    /// Frames dropped on a full output channel for one camera
    pub fn dropped_frames(&self, camera_index: usize) -> u64 {
        self.dropped_frames
            .get(&camera_index)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        !self.stop_flag.load(Ordering::Relaxed) && !self.workers.is_empty()
    }

    /// Start one worker per camera plus the protocol relay.
    pub fn start(&mut self) -> crate::error::Result<()> {
        if !self.workers.is_empty() {
            warn!("camera processor already started");
            return Ok(());
        }

        for camera in &self.config.cameras {
            self.table.register_camera(camera.index);
        }

        let relay_targets = RelayTarget::from_cameras(&self.config.cameras);
        self.relay = Some(ProtocolRelay::start(
            self.config.relay.clone(),
            relay_targets,
            self.config.status_targets.clone(),
            Arc::clone(&self.table),
        )?);

        for camera in self.config.cameras.clone() {
            let (tx, rx) = bounded(self.config.processing.frame_channel_capacity);
            self.outputs.insert(camera.index, rx);

            let dropped = Arc::new(AtomicU64::new(0));
            self.dropped_frames.insert(camera.index, Arc::clone(&dropped));

            let context = WorkerContext {
                connector: (self.connector_factory)(&camera),
                camera,
                detector: Arc::clone(&self.detector),
                table: Arc::clone(&self.table),
                roi_store: Arc::clone(&self.roi_store),
                output: tx,
                stop: Arc::clone(&self.stop_flag),
                states: Arc::clone(&self.states),
                dropped,
                connect_backoff: Duration::from_secs_f64(
                    self.config.processing.connect_backoff_secs,
                ),
                read_backoff: Duration::from_secs_f64(
                    self.config.processing.read_retry_backoff_secs,
                ),
            };

            let thread_name = format!("camera-{}", context.camera.index);
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || camera_worker(context))?;
            self.workers.push((thread_name, handle));
        }

        info!("camera processor started with {} worker(s)", self.workers.len());
        Ok(())
    }

    /// Cooperative stop: raise the shared flag, join every worker within a
    /// bounded timeout, then stop the relay.
    pub fn stop(&mut self) {
        if self.stop_flag.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("stopping camera processor");

        for (name, handle) in self.workers.drain(..) {
            if !join_with_timeout(handle, WORKER_JOIN_TIMEOUT) {
                warn!("worker {} did not stop within timeout", name);
            }
        }

        if let Some(mut relay) = self.relay.take() {
            relay.stop();
        }

        info!("camera processor stopped");
    }
}

impl Drop for CameraProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.is_finished() {
        let _ = handle.join();
        true
    } else {
        false
    }
}

/// Sleep in bounded slices, returning false as soon as the stop flag rises.
fn wait_cancellable(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(STOP_POLL_SLICE));
    }
}

struct WorkerContext {
    camera: CameraTarget,
    connector: Box<dyn SourceConnector>,
    detector: SharedDetector,
    table: Arc<DetectionTable>,
    roi_store: Arc<RoiStore>,
    output: Sender<AnnotatedFrame>,
    stop: Arc<AtomicBool>,
    states: Arc<Mutex<HashMap<usize, CameraState>>>,
    dropped: Arc<AtomicU64>,
    connect_backoff: Duration,
    read_backoff: Duration,
}

impl WorkerContext {
    fn set_state(&self, state: CameraState) {
        self.states.lock().insert(self.camera.index, state);
    }
}

/// One camera's acquisition-and-processing loop.
///
/// Connecting retries the source open with backoff; Streaming reads a
/// frame, runs the detection-and-filter stage, publishes the annotated
/// frame without blocking, and overwrites the camera's table entry. A read
/// failure releases the source and goes back to Connecting. The stop flag
/// is observed at every loop iteration and inside every backoff wait.
fn camera_worker(ctx: WorkerContext) {
    let bounds = AreaBounds {
        min: ctx.camera.min_tag_area,
        max: ctx.camera.max_tag_area,
    };
    let mut source = None;
    ctx.set_state(CameraState::Connecting);

    while !ctx.stop.load(Ordering::Relaxed) {
        if source.is_none() {
            match ctx.connector.connect() {
                Ok(opened) => {
                    info!(
                        "connected to {} ({})",
                        ctx.camera.name,
                        ctx.connector.describe()
                    );
                    source = Some(opened);
                    ctx.set_state(CameraState::Streaming);
                }
                Err(e) => {
                    warn!(
                        "failed to connect to {} ({}): {}, retrying in {:.0}s",
                        ctx.camera.name,
                        ctx.camera.host,
                        e,
                        ctx.connect_backoff.as_secs_f64()
                    );
                    wait_cancellable(&ctx.stop, ctx.connect_backoff);
                    continue;
                }
            }
        }
        let opened = match source.as_mut() {
            Some(opened) => opened,
            None => continue,
        };

        let frame = match opened.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    "frame loss from {} ({}): {}, reconnecting",
                    ctx.camera.name, ctx.camera.host, e
                );
                source = None;
                ctx.set_state(CameraState::Connecting);
                wait_cancellable(&ctx.stop, ctx.read_backoff);
                continue;
            }
        };

        let roi = ctx.roi_store.load(&ctx.camera.host);
        let stage =
            filter::process_frame(&frame, roi, &ctx.detector, bounds, &ctx.camera.name);
        let ids: Vec<u32> = stage.detections.keys().copied().collect();

        let annotated = AnnotatedFrame {
            camera_index: ctx.camera.index,
            frame_id: frame.id,
            timestamp: frame.timestamp,
            pixels: stage.annotated,
        };
        match ctx.output.try_send(annotated) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                ctx.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                // Display sink gone; the table and relay still need frames.
            }
        }

        ctx.table.record(ctx.camera.index, ids);
    }

    drop(source);
    ctx.set_state(CameraState::Stopped);
    debug!("worker for {} stopped", ctx.camera.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessingConfig, RelayConfig, SourceConfig};
    use crate::detector::{self, MarkerDetector, RawDetection};
    use crate::error::{Result, TagRelayError};
    use crate::frame::FrameData;
    use crate::source::FrameSource;
    use image::{GrayImage, RgbImage};
    use std::time::SystemTime;

    struct MockSource {
        width: u32,
        height: u32,
        counter: u64,
    }

    impl FrameSource for MockSource {
        fn read_frame(&mut self) -> Result<FrameData> {
            // Pace the loop like a real camera.
            std::thread::sleep(Duration::from_millis(10));
            let id = self.counter;
            self.counter += 1;
            Ok(FrameData::new(
                id,
                SystemTime::now(),
                RgbImage::new(self.width, self.height),
            ))
        }
    }

    struct MockConnector {
        width: u32,
        height: u32,
        reachable: bool,
    }

    impl SourceConnector for MockConnector {
        fn connect(&self) -> Result<Box<dyn FrameSource>> {
            if !self.reachable {
                return Err(TagRelayError::capture("mock endpoint unreachable"));
            }
            Ok(Box::new(MockSource {
                width: self.width,
                height: self.height,
                counter: 0,
            }))
        }

        fn describe(&self) -> String {
            format!("mock {}x{}", self.width, self.height)
        }
    }

    /// Reports markers 1 and 2 for 64-pixel-wide frames, nothing otherwise.
    struct DimKeyedDetector;

    impl MarkerDetector for DimKeyedDetector {
        fn detect(&mut self, image: &GrayImage) -> Result<Vec<RawDetection>> {
            if image.width() != 64 {
                return Ok(Vec::new());
            }
            let square = |x: f32, y: f32, side: f32| {
                [(x, y), (x + side, y), (x + side, y + side), (x, y + side)]
            };
            Ok(vec![
                RawDetection {
                    id: 1,
                    corners: square(2.0, 2.0, 20.0),
                },
                RawDetection {
                    id: 2,
                    corners: square(30.0, 10.0, 15.0),
                },
            ])
        }

        fn name(&self) -> &str {
            "dim-keyed"
        }
    }

    fn camera(name: &str, index: usize) -> CameraTarget {
        CameraTarget {
            name: name.to_string(),
            index,
            host: format!("10.0.0.{}", 10 + index),
            source: SourceConfig::Rtsp {
                url: format!("rtsp://10.0.0.{}/s", 10 + index),
            },
            min_tag_area: 100.0,
            max_tag_area: 10000.0,
            modbus: None,
        }
    }

    fn test_config(cameras: Vec<CameraTarget>) -> TagRelayConfig {
        TagRelayConfig {
            roi_file: "nonexistent-roi.toml".to_string(),
            processing: ProcessingConfig {
                frame_channel_capacity: 3,
                connect_backoff_secs: 0.1,
                read_retry_backoff_secs: 0.1,
            },
            relay: RelayConfig::default(),
            cameras,
            status_targets: Vec::new(),
        }
    }

    fn mock_factory() -> ConnectorFactory {
        Box::new(|camera: &CameraTarget| {
            let connector: Box<dyn SourceConnector> = match camera.index {
                0 => Box::new(MockConnector {
                    width: 64,
                    height: 48,
                    reachable: true,
                }),
                1 => Box::new(MockConnector {
                    width: 32,
                    height: 24,
                    reachable: true,
                }),
                _ => Box::new(MockConnector {
                    width: 0,
                    height: 0,
                    reachable: false,
                }),
            };
            connector
        })
    }

    #[test]
    fn test_output_channel_never_blocks_producer() {
        let (tx, _rx) = bounded::<AnnotatedFrame>(3);
        let frame = AnnotatedFrame {
            camera_index: 0,
            frame_id: 0,
            timestamp: SystemTime::now(),
            pixels: RgbImage::new(4, 4),
        };

        for _ in 0..3 {
            tx.try_send(frame.clone()).unwrap();
        }

        let start = Instant::now();
        for _ in 0..100 {
            assert!(matches!(
                tx.try_send(frame.clone()),
                Err(TrySendError::Full(_))
            ));
        }
        // 100 rejected publishes must return essentially immediately.
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_three_camera_pipeline_states_and_table() {
        let config = test_config(vec![
            camera("cam0", 0),
            camera("cam1", 1),
            camera("cam2", 2),
        ]);
        let detector = detector::shared(Box::new(DimKeyedDetector));

        let mut processor = CameraProcessor::new(config, detector);
        processor.set_connector_factory(mock_factory());
        processor.start().unwrap();

        // Give the workers a few processing cycles.
        std::thread::sleep(Duration::from_millis(400));

        assert_eq!(processor.state(0), Some(CameraState::Streaming));
        assert_eq!(processor.state(1), Some(CameraState::Streaming));
        assert_eq!(processor.state(2), Some(CameraState::Connecting));

        let table = processor.table();
        assert_eq!(table.ids_for(0), vec![1, 2]);
        assert!(table.ids_for(1).is_empty());
        assert!(table.ids_for(2).is_empty());

        // Nobody drains cam0's channel, so overflow frames were dropped
        // without stalling the worker.
        assert!(processor.dropped_frames(0) > 0);

        processor.stop();
        assert_eq!(processor.state(0), Some(CameraState::Stopped));
        assert_eq!(processor.state(2), Some(CameraState::Stopped));
    }

    #[test]
    fn test_output_carries_annotated_frames() {
        let config = test_config(vec![camera("cam0", 0)]);
        let detector = detector::shared(Box::new(DimKeyedDetector));

        let mut processor = CameraProcessor::new(config, detector);
        processor.set_connector_factory(Box::new(|_| {
            Box::new(MockConnector {
                width: 64,
                height: 48,
                reachable: true,
            })
        }));
        let output = {
            processor.start().unwrap();
            processor.output(0).unwrap()
        };

        let frame = output
            .recv_timeout(Duration::from_secs(2))
            .expect("no annotated frame produced");
        assert_eq!(frame.camera_index, 0);
        assert_eq!(frame.pixels.dimensions(), (64, 48));

        processor.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let config = test_config(vec![camera("cam0", 0)]);
        let detector = detector::shared(Box::new(DimKeyedDetector));

        let mut processor = CameraProcessor::new(config, detector);
        processor.set_connector_factory(mock_factory());
        processor.start().unwrap();

        processor.stop();
        processor.stop();
        assert!(!processor.is_running());
    }
}
