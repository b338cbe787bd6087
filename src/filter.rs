use crate::detector::{RawDetection, SharedDetector};
use crate::frame::FrameData;
use crate::roi::RoiRect;
use image::{imageops, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Marker IDs the pipeline accepts; everything else is discarded.
pub const ACCEPTED_IDS: std::ops::RangeInclusive<u32> = 1..=4;

const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const CENTER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const ROI_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Inclusive per-camera area window for accepted markers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaBounds {
    pub min: f64,
    pub max: f64,
}

impl AreaBounds {
    pub fn contains(&self, area: f64) -> bool {
        area >= self.min && area <= self.max
    }
}

/// A detected marker with its derived geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedMarker {
    pub id: u32,
    pub corners: [(f32, f32); 4],
    pub center: (f32, f32),
    pub area: f64,
}

impl DetectedMarker {
    pub fn from_raw(raw: RawDetection) -> Self {
        let area = polygon_area(&raw.corners);
        let center = corner_centroid(&raw.corners);
        Self {
            id: raw.id,
            corners: raw.corners,
            center,
            area,
        }
    }
}

/// At most one marker per accepted ID: the largest instance in the frame.
pub type FrameDetections = BTreeMap<u32, DetectedMarker>;

/// Result of running one frame through the stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Full frame with the ROI bounds and accepted markers drawn in
    pub annotated: RgbImage,
    pub detections: FrameDetections,
}

/// Quadrilateral area via the shoelace formula. Sign-independent; invariant
/// under cyclic rotation of the corners.
pub fn polygon_area(corners: &[(f32, f32); 4]) -> f64 {
    let x: Vec<f64> = corners.iter().map(|c| c.0 as f64).collect();
    let y: Vec<f64> = corners.iter().map(|c| c.1 as f64).collect();

    0.5 * ((x[0] * y[1] + x[1] * y[2] + x[2] * y[3] + x[3] * y[0])
        - (y[0] * x[1] + y[1] * x[2] + y[2] * x[3] + y[3] * x[0]))
        .abs()
}

fn corner_centroid(corners: &[(f32, f32); 4]) -> (f32, f32) {
    let (sx, sy) = corners
        .iter()
        .fold((0.0f32, 0.0f32), |(sx, sy), c| (sx + c.0, sy + c.1));
    (sx / 4.0, sy / 4.0)
}

/// Reduce raw detections to the accepted set: ID within [`ACCEPTED_IDS`],
/// area inside `bounds`, and only the largest instance per ID (strictly
/// greater area replaces the incumbent, so equal areas keep the first seen).
pub fn filter_detections(
    raw: Vec<RawDetection>,
    bounds: AreaBounds,
    camera_name: &str,
) -> FrameDetections {
    let had_any = !raw.is_empty();
    let mut largest: FrameDetections = BTreeMap::new();
    let mut accepted_info: Vec<String> = Vec::new();

    for detection in raw {
        if !ACCEPTED_IDS.contains(&detection.id) {
            continue;
        }

        let marker = DetectedMarker::from_raw(detection);
        if !bounds.contains(marker.area) {
            debug!(
                "camera {}: marker ID {} filtered by area {:.1} (range {:.1}-{:.1})",
                camera_name, marker.id, marker.area, bounds.min, bounds.max
            );
            continue;
        }

        accepted_info.push(format!("ID {} (area {:.1})", marker.id, marker.area));

        match largest.get(&marker.id) {
            Some(existing) if existing.area >= marker.area => {}
            _ => {
                largest.insert(marker.id, marker);
            }
        }
    }

    if !accepted_info.is_empty() {
        info!(
            "camera {}: detected markers - {}",
            camera_name,
            accepted_info.join(", ")
        );
    } else if had_any {
        debug!("camera {}: markers detected but all filtered out", camera_name);
    }

    largest
}

/// Run one frame through the stage: clamp the ROI, crop, grayscale, invoke
/// the detector under its lock, filter, and annotate.
///
/// A degenerate ROI yields empty detections without error. A detector
/// failure is logged and the frame is treated as having no markers; the
/// camera loop keeps running.
pub fn process_frame(
    frame: &FrameData,
    roi: Option<RoiRect>,
    detector: &SharedDetector,
    bounds: AreaBounds,
    camera_name: &str,
) -> StageOutput {
    let full = RoiRect::new(0, 0, frame.width() as i32, frame.height() as i32);
    let clamped = match roi.unwrap_or(full).clamp_to(frame.width(), frame.height()) {
        Some(clamped) => clamped,
        None => {
            debug!("camera {}: ROI degenerate after clamping, skipping frame", camera_name);
            return StageOutput {
                annotated: frame.pixels.clone(),
                detections: BTreeMap::new(),
            };
        }
    };

    let mut region =
        imageops::crop_imm(&frame.pixels, clamped.x, clamped.y, clamped.w, clamped.h).to_image();
    let gray = imageops::grayscale(&region);

    // The detector handle is not safe for concurrent invocation; the lock
    // spans exactly the detect call.
    let raw = {
        let mut guard = detector.lock();
        match guard.detect(&gray) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("camera {}: detector invocation failed: {}", camera_name, e);
                Vec::new()
            }
        }
    };

    let detections = filter_detections(raw, bounds, camera_name);

    for marker in detections.values() {
        draw_marker(&mut region, marker);
    }

    let mut annotated = frame.pixels.clone();
    imageops::replace(&mut annotated, &region, clamped.x as i64, clamped.y as i64);
    draw_hollow_rect_mut(
        &mut annotated,
        Rect::at(clamped.x as i32, clamped.y as i32).of_size(clamped.w, clamped.h),
        ROI_COLOR,
    );

    StageOutput {
        annotated,
        detections,
    }
}

fn draw_marker(canvas: &mut RgbImage, marker: &DetectedMarker) {
    for i in 0..4 {
        let start = marker.corners[i];
        let end = marker.corners[(i + 1) % 4];
        draw_line_segment_mut(canvas, start, end, OUTLINE_COLOR);
    }
    draw_filled_circle_mut(
        canvas,
        (marker.center.0 as i32, marker.center.1 as i32),
        5,
        CENTER_COLOR,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{self, MarkerDetector};
    use crate::error::{Result, TagRelayError};
    use image::GrayImage;
    use std::time::SystemTime;

    fn square(origin: (f32, f32), side: f32) -> [(f32, f32); 4] {
        let (x, y) = origin;
        [(x, y), (x + side, y), (x + side, y + side), (x, y + side)]
    }

    struct ScriptedDetector(Vec<RawDetection>);

    impl MarkerDetector for ScriptedDetector {
        fn detect(&mut self, _image: &GrayImage) -> Result<Vec<RawDetection>> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct FailingDetector;

    impl MarkerDetector for FailingDetector {
        fn detect(&mut self, _image: &GrayImage) -> Result<Vec<RawDetection>> {
            Err(TagRelayError::detector("backend offline"))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn test_frame(width: u32, height: u32) -> FrameData {
        FrameData::new(1, SystemTime::now(), RgbImage::new(width, height))
    }

    const BOUNDS: AreaBounds = AreaBounds {
        min: 100.0,
        max: 10000.0,
    };

    #[test]
    fn test_polygon_area_unit_square() {
        let area = polygon_area(&square((0.0, 0.0), 1.0));
        assert!((area - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_polygon_area_cyclic_rotation_invariant() {
        let corners = [(2.0, 1.0), (7.0, 2.0), (8.0, 6.0), (1.0, 5.0)];
        let base = polygon_area(&corners);

        for shift in 1..4 {
            let mut rotated = corners;
            rotated.rotate_left(shift);
            assert!((polygon_area(&rotated) - base).abs() < 1e-9);
        }
    }

    #[test]
    fn test_polygon_area_sign_independent() {
        let clockwise = [(0.0, 0.0), (0.0, 3.0), (4.0, 3.0), (4.0, 0.0)];
        let counter = [(0.0, 0.0), (4.0, 0.0), (4.0, 3.0), (0.0, 3.0)];
        assert!((polygon_area(&clockwise) - polygon_area(&counter)).abs() < 1e-9);
        assert!((polygon_area(&clockwise) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_filter_rejects_unaccepted_ids() {
        let raw = vec![
            RawDetection {
                id: 0,
                corners: square((0.0, 0.0), 20.0),
            },
            RawDetection {
                id: 5,
                corners: square((0.0, 0.0), 20.0),
            },
        ];
        assert!(filter_detections(raw, BOUNDS, "cam").is_empty());
    }

    #[test]
    fn test_filter_rejects_out_of_bounds_area() {
        let raw = vec![
            RawDetection {
                id: 1,
                corners: square((0.0, 0.0), 5.0), // area 25, below min
            },
            RawDetection {
                id: 2,
                corners: square((0.0, 0.0), 200.0), // area 40000, above max
            },
        ];
        assert!(filter_detections(raw, BOUNDS, "cam").is_empty());
    }

    #[test]
    fn test_filter_area_bounds_inclusive() {
        let raw = vec![RawDetection {
            id: 1,
            corners: square((0.0, 0.0), 10.0), // area exactly 100
        }];
        let detections = filter_detections(raw, BOUNDS, "cam");
        assert_eq!(detections.len(), 1);
    }

    #[test]
    fn test_filter_keeps_largest_per_id() {
        let small = RawDetection {
            id: 1,
            corners: square((0.0, 0.0), 15.0), // area 225
        };
        let large = RawDetection {
            id: 1,
            corners: square((30.0, 30.0), 40.0), // area 1600
        };
        let detections = filter_detections(vec![small, large.clone()], BOUNDS, "cam");

        assert_eq!(detections.len(), 1);
        let kept = &detections[&1];
        assert_eq!(kept.corners, large.corners);
        // The entry's area dominates every same-ID candidate in the frame.
        assert!(kept.area >= 225.0);
    }

    #[test]
    fn test_filter_equal_area_keeps_first() {
        let first = RawDetection {
            id: 2,
            corners: square((0.0, 0.0), 20.0),
        };
        let second = RawDetection {
            id: 2,
            corners: square((50.0, 50.0), 20.0),
        };
        let detections = filter_detections(vec![first.clone(), second], BOUNDS, "cam");
        assert_eq!(detections[&2].corners, first.corners);
    }

    #[test]
    fn test_marker_centroid() {
        let marker = DetectedMarker::from_raw(RawDetection {
            id: 1,
            corners: square((10.0, 20.0), 10.0),
        });
        assert_eq!(marker.center, (15.0, 25.0));
    }

    #[test]
    fn test_process_frame_degenerate_roi_is_empty() {
        let frame = test_frame(64, 48);
        let detector = detector::shared(Box::new(ScriptedDetector(vec![RawDetection {
            id: 1,
            corners: square((0.0, 0.0), 20.0),
        }])));

        let roi = Some(RoiRect::new(64, 0, 10, 10));
        let output = process_frame(&frame, roi, &detector, BOUNDS, "cam");

        assert!(output.detections.is_empty());
        assert_eq!(output.annotated.dimensions(), (64, 48));
    }

    #[test]
    fn test_process_frame_full_frame_detection() {
        let frame = test_frame(64, 48);
        let detector = detector::shared(Box::new(ScriptedDetector(vec![
            RawDetection {
                id: 1,
                corners: square((2.0, 2.0), 20.0),
            },
            RawDetection {
                id: 3,
                corners: square((30.0, 10.0), 15.0),
            },
        ])));

        let output = process_frame(&frame, None, &detector, BOUNDS, "cam");

        assert_eq!(
            output.detections.keys().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(output.annotated.dimensions(), (64, 48));
    }

    #[test]
    fn test_process_frame_detector_failure_is_empty() {
        let frame = test_frame(32, 32);
        let detector = detector::shared(Box::new(FailingDetector));

        let output = process_frame(&frame, None, &detector, BOUNDS, "cam");
        assert!(output.detections.is_empty());
    }
}
