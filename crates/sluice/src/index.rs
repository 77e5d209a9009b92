//! Fragment number -> (duration, size, start time, start byte) lookup.
//!
//! Entry `i` describes fragment `i`; slot 0 is the initialization segment.
//! Unknown durations and sizes count as zero in the prefix sums, but for
//! searching an unknown entry covers everything from its start onwards until
//! a later [`FragmentIndex::set`] narrows it.

use std::time::Duration;

use tracing::trace;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Entry {
    duration: Option<Duration>,
    size: Option<u64>,
    start_time: Duration,
    start_byte: u64,
}

/// Position of a fragment on the stream timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentStart {
    pub time: Duration,
    pub byte_offset: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FragmentIndex {
    entries: Vec<Entry>,
}

impl FragmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what is known about fragment `index`.
    ///
    /// Missing slots before `index` are created as unknown. A `None` never
    /// replaces a value already recorded, so calling this again with a
    /// concrete size refines an earlier unknown one.
    pub fn set(&mut self, index: u32, duration: Option<Duration>, size: Option<u64>) {
        let index = index as usize;
        let old_len = self.entries.len();
        if old_len <= index {
            self.entries.resize(index + 1, Entry::default());
        }

        let entry = &mut self.entries[index];
        let changed = (duration.is_some() && entry.duration != duration)
            || (size.is_some() && entry.size != size);
        if let Some(duration) = duration {
            entry.duration = Some(duration);
        }
        if let Some(size) = size {
            entry.size = Some(size);
        }
        if changed {
            trace!(index, ?duration, ?size, "Refined fragment index entry");
        }
        // gap slots created above have no start yet
        self.recompute_from(index.min(old_len));
    }

    fn recompute_from(&mut self, index: usize) {
        let (mut time, mut byte) = match index.checked_sub(1).map(|i| self.entries[i]) {
            Some(prev) => (
                prev.start_time + prev.duration.unwrap_or_default(),
                prev.start_byte + prev.size.unwrap_or(0),
            ),
            None => (Duration::ZERO, 0),
        };
        for entry in &mut self.entries[index..] {
            entry.start_time = time;
            entry.start_byte = byte;
            time += entry.duration.unwrap_or_default();
            byte += entry.size.unwrap_or(0);
        }
    }

    pub fn get_start(&self, index: u32) -> Option<FragmentStart> {
        self.entries.get(index as usize).map(|e| FragmentStart {
            time: e.start_time,
            byte_offset: e.start_byte,
        })
    }

    pub fn duration(&self, index: u32) -> Option<Duration> {
        self.entries.get(index as usize).and_then(|e| e.duration)
    }

    pub fn size(&self, index: u32) -> Option<u64> {
        self.entries.get(index as usize).and_then(|e| e.size)
    }

    /// Number of slots, the initialization slot included.
    pub fn frag_count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all sizes, when every size is known.
    pub fn total_bytes(&self) -> Option<u64> {
        self.entries.iter().try_fold(0u64, |acc, e| Some(acc + e.size?))
    }

    /// Fragment whose time span contains `t`; past the end, the last one.
    pub fn find_by_time(&self, t: Duration) -> Option<u32> {
        self.find(|e| e.duration.map(|d| e.start_time + d), t)
    }

    /// Fragment whose byte span contains `pos`; past the end, the last one.
    pub fn find_by_byte(&self, pos: u64) -> Option<u32> {
        self.find(|e| e.size.map(|s| e.start_byte + s), pos)
    }

    fn find<T: Ord>(&self, end: impl Fn(&Entry) -> Option<T>, target: T) -> Option<u32> {
        if self.entries.is_empty() {
            return None;
        }
        // Spans before the first unknown entry are contiguous and bounded.
        let known = self
            .entries
            .iter()
            .position(|e| end(e).is_none())
            .unwrap_or(self.entries.len());
        let hit = self.entries[..known]
            .partition_point(|e| end(e).is_some_and(|stop| stop <= target));
        let index = if hit < known {
            hit
        } else if known < self.entries.len() {
            known
        } else {
            self.entries.len() - 1
        };
        Some(index as u32)
    }
}
