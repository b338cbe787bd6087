use crate::error::Result;
use image::GrayImage;
use parking_lot::Mutex;
use std::sync::Arc;

/// A marker reported by the external detection capability: a numeric ID and
/// four ordered corner points in the coordinates of the image it was given.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub id: u32,
    pub corners: [(f32, f32); 4],
}

/// Interface to the external fiducial detection capability.
///
/// The capability is treated as a pure function from a single-channel image
/// to zero or more detections. Implementations are not required to be safe
/// for concurrent invocation; callers go through [`SharedDetector`], which
/// serializes every call behind one process-wide lock.
pub trait MarkerDetector: Send {
    /// Detect markers in a grayscale image.
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<RawDetection>>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Process-wide detector handle. All cameras share one instance and the
/// mutex serializes calls into it.
pub type SharedDetector = Arc<Mutex<Box<dyn MarkerDetector>>>;

pub fn shared(detector: Box<dyn MarkerDetector>) -> SharedDetector {
    Arc::new(Mutex::new(detector))
}

/// Placeholder backend used when no real detector is compiled in. Every
/// frame yields zero detections, which keeps the rest of the pipeline
/// exercisable without the external capability.
pub struct NullDetector;

impl MarkerDetector for NullDetector {
    fn detect(&mut self, _image: &GrayImage) -> Result<Vec<RawDetection>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "null"
    }
}
