pub mod config;
pub mod detector;
pub mod error;
pub mod filter;
pub mod frame;
pub mod processor;
pub mod relay;
pub mod roi;
pub mod source;
pub mod table;

pub use config::{CameraTarget, ModbusDestination, SourceConfig, StatusTarget, TagRelayConfig};
pub use detector::{MarkerDetector, NullDetector, RawDetection, SharedDetector};
pub use error::{Result, TagRelayError};
pub use filter::{AreaBounds, DetectedMarker, FrameDetections, ACCEPTED_IDS};
pub use frame::{AnnotatedFrame, FrameData};
pub use processor::{CameraProcessor, CameraState, ConnectorFactory};
pub use relay::{encode_mask, HeartbeatSchedule, ProtocolRelay, RelayTarget};
pub use roi::{RoiRect, RoiStore};
pub use source::{FrameSource, RtspConnector, SnapshotConnector, SourceConnector};
pub use table::DetectionTable;
