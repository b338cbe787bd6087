use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Region of interest in source-frame pixel coordinates.
///
/// Values come straight from the store file and may be out of range for a
/// given frame; [`RoiRect::clamp_to`] is applied before any cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl RoiRect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// Clamp the rectangle to a frame of the given dimensions.
    ///
    /// Returns `None` when the clamped width or height is zero or negative,
    /// which callers treat as "no detectable region" rather than an error.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<ClampedRoi> {
        let x = self.x.max(0);
        let y = self.y.max(0);
        let w = self.w.min(frame_width as i32 - x);
        let h = self.h.min(frame_height as i32 - y);

        if w <= 0 || h <= 0 {
            return None;
        }

        Some(ClampedRoi {
            x: x as u32,
            y: y as u32,
            w: w as u32,
            h: h as u32,
        })
    }
}

/// A rectangle guaranteed to lie within its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClampedRoi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Normalize a camera host into a store key, e.g. `10.16.9.52` ->
/// `ip_10_16_9_52`.
pub fn host_to_key(host: &str) -> String {
    format!("ip_{}", host.replace(['.', ':'], "_"))
}

/// Flat file mapping normalized camera keys to ROI rectangles.
///
/// Reads are tolerant: a missing file, missing key, or malformed entry all
/// yield `None` and the caller falls back to the full frame. Writes rewrite
/// the entire file; concurrent writers must be serialized by the caller.
#[derive(Debug, Clone)]
pub struct RoiStore {
    path: PathBuf,
}

impl RoiStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the ROI for a camera host. Absent or unreadable entries are
    /// reported at debug level and yield `None`.
    pub fn load(&self, host: &str) -> Option<RoiRect> {
        let key = host_to_key(host);
        let entries = match self.read_entries() {
            Ok(entries) => entries,
            Err(e) => {
                debug!("ROI store {} not readable: {}", self.path.display(), e);
                return None;
            }
        };

        match entries.get(&key) {
            Some(rect) => Some(*rect),
            None => {
                debug!("no ROI entry for {} in {}", key, self.path.display());
                None
            }
        }
    }

    /// Store the ROI for a camera host, preserving every other entry.
    ///
    /// This is a read-modify-rewrite of the whole file: existing entries
    /// (except the one being replaced) are read back and the file is written
    /// out again with the updated set.
    pub fn save(&self, host: &str, rect: RoiRect) -> Result<()> {
        let key = host_to_key(host);

        let mut entries = self.read_entries().unwrap_or_default();
        entries.insert(key, rect);

        let rendered = toml::to_string_pretty(&entries)?;
        std::fs::write(&self.path, rendered)?;
        Ok(())
    }

    fn read_entries(&self) -> Result<BTreeMap<String, RoiRect>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let table: BTreeMap<String, toml::Value> = toml::from_str(&raw)?;

        // Entries that do not parse as rectangles are skipped, not fatal.
        let mut entries = BTreeMap::new();
        for (key, value) in table {
            match value.try_into::<RoiRect>() {
                Ok(rect) => {
                    entries.insert(key, rect);
                }
                Err(e) => {
                    warn!(
                        "skipping malformed ROI entry {} in {}: {}",
                        key,
                        self.path.display(),
                        e
                    );
                }
            }
        }
        Ok(entries)
    }
}
