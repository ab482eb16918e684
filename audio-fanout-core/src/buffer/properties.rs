use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::shared::SharedAudioBuffer;

#[derive(Debug, Clone)]
struct PropertyEntry {
    sequence: u64,
    name: String,
    value: String,
}

/// Property side-table of a [`SharedAudioBuffer`].
///
/// A property set while the buffer tail is at sequence `n` applies to chunk
/// `n` and everything after it, until it is set again. Readers look values up
/// at their own cursor position, so two readers at different positions can
/// see different values for the same name.
pub struct BufferProperties {
    buffer: Arc<SharedAudioBuffer>,
    entries: Mutex<Vec<PropertyEntry>>,
}

impl BufferProperties {
    pub fn new(buffer: Arc<SharedAudioBuffer>) -> Self {
        Self {
            buffer,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Record `value` for `name` at the buffer's current tail.
    pub fn set(&self, name: &str, value: &str) {
        let sequence = self.buffer.tail();
        let low_water_mark = self.buffer.low_water_mark();

        let mut entries = self.entries.lock();
        entries.push(PropertyEntry {
            sequence,
            name: name.to_string(),
            value: value.to_string(),
        });
        prune(&mut entries, low_water_mark);
    }

    /// Value of `name` in effect for the chunk at `sequence`.
    pub fn value_at(&self, name: &str, sequence: u64) -> Option<String> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|entry| entry.name == name && entry.sequence <= sequence)
            .map(|entry| entry.value.clone())
    }

    /// Most recently set value of `name`.
    pub fn latest(&self, name: &str) -> Option<String> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|entry| entry.name == name)
            .map(|entry| entry.value.clone())
    }

    /// Number of entries currently retained.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Drop entries below the low-water mark, keeping the newest one per name so
/// lookups at the low-water mark still resolve.
fn prune(entries: &mut Vec<PropertyEntry>, low_water_mark: u64) {
    let mut seen = HashSet::new();
    let mut keep = vec![false; entries.len()];
    for (index, entry) in entries.iter().enumerate().rev() {
        keep[index] = entry.sequence > low_water_mark || seen.insert(entry.name.clone());
    }

    let mut flags = keep.into_iter();
    entries.retain(|_| flags.next().unwrap_or(false));
}
