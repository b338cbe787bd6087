use image::RgbImage;
use std::time::SystemTime;

/// A single captured frame with its metadata.
///
/// Frames are value types: the snapshot poller hands copies to consumers so
/// a slow consumer can never stall the fetch loop.
#[derive(Debug, Clone)]
pub struct FrameData {
    /// Monotonically increasing per-source frame identifier
    pub id: u64,
    /// Timestamp when the frame was captured
    pub timestamp: SystemTime,
    /// Decoded RGB pixels
    pub pixels: RgbImage,
}

impl FrameData {
    pub fn new(id: u64, timestamp: SystemTime, pixels: RgbImage) -> Self {
        Self {
            id,
            timestamp,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Frame age in milliseconds
    pub fn age_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Check if the frame is older than the given duration
    pub fn is_older_than(&self, duration: std::time::Duration) -> bool {
        SystemTime::now()
            .duration_since(self.timestamp)
            .map(|age| age > duration)
            .unwrap_or(false)
    }
}

/// An annotated frame paired with the index of the camera that produced it,
/// as handed to the display sink.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub camera_index: usize,
    pub frame_id: u64,
    pub timestamp: SystemTime,
    pub pixels: RgbImage,
}
