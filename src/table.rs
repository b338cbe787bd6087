use parking_lot::Mutex;
use std::collections::HashMap;

/// Process-wide table of the marker IDs seen in each camera's most recent
/// processed frame.
///
/// The map never leaks: all access goes through the typed methods below,
/// each of which takes and releases the lock internally. Writers are the
/// per-camera workers (one key each); the reader is the protocol relay.
#[derive(Debug, Default)]
pub struct DetectionTable {
    inner: Mutex<HashMap<usize, Vec<u32>>>,
}

impl DetectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create an empty entry for a camera so readers observe every
    /// configured camera from the moment the system starts.
    pub fn register_camera(&self, camera_index: usize) {
        self.inner.lock().entry(camera_index).or_default();
    }

    /// Overwrite a camera's entry with the IDs from its latest frame.
    /// A frame with no accepted markers records an empty list; the entry is
    /// never removed.
    pub fn record(&self, camera_index: usize, ids: Vec<u32>) {
        self.inner.lock().insert(camera_index, ids);
    }

    /// Copy out a camera's current ID list. Unknown cameras read as empty.
    pub fn ids_for(&self, camera_index: usize) -> Vec<u32> {
        self.inner
            .lock()
            .get(&camera_index)
            .cloned()
            .unwrap_or_default()
    }

    /// Copy of the whole table, for status logging.
    pub fn snapshot(&self) -> HashMap<usize, Vec<u32>> {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_seeds_empty_entry() {
        let table = DetectionTable::new();
        table.register_camera(2);

        let snapshot = table.snapshot();
        assert_eq!(snapshot.get(&2), Some(&Vec::new()));
    }

    #[test]
    fn test_record_overwrites() {
        let table = DetectionTable::new();
        table.record(0, vec![1, 2]);
        assert_eq!(table.ids_for(0), vec![1, 2]);

        table.record(0, vec![3]);
        assert_eq!(table.ids_for(0), vec![3]);
    }

    #[test]
    fn test_empty_frame_clears_but_keeps_entry() {
        let table = DetectionTable::new();
        table.record(1, vec![4]);
        table.record(1, Vec::new());

        assert!(table.ids_for(1).is_empty());
        assert!(table.snapshot().contains_key(&1));
    }

    #[test]
    fn test_unknown_camera_reads_empty() {
        let table = DetectionTable::new();
        assert!(table.ids_for(9).is_empty());
    }

    #[test]
    fn test_register_does_not_clobber_existing() {
        let table = DetectionTable::new();
        table.record(0, vec![1]);
        table.register_camera(0);
        assert_eq!(table.ids_for(0), vec![1]);
    }
}
