use crate::types::EventRecord;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Bounded, most-recent-first list of event records.
pub struct HistoryBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<EventRecord>>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Prepend `record`, dropping the oldest entries beyond capacity.
    ///
    /// `received_at` is clamped so it never precedes the current head,
    /// keeping arrival order and timestamp order identical even if the
    /// wall clock steps backwards. Returns the record as stored.
    pub fn append(&self, mut record: EventRecord) -> EventRecord {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(head) = entries.front() {
            if record.received_at < head.received_at {
                record.received_at = head.received_at;
            }
        }
        entries.push_front(record.clone());
        entries.truncate(self.capacity);
        record
    }

    /// Point-in-time copy, most recent first.
    pub fn snapshot(&self) -> Vec<EventRecord> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    /// Empty the buffer, returning how many entries were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
