//! Perf log: a bounded ring of engine profiling dumps for sampled commands.

use std::collections::VecDeque;

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct PerfEntry {
    pub cmd_name: String,
    pub duration_us: u64,
    pub perf_context: String,
}

pub struct PerfLog {
    max_len: usize,
    entries: Mutex<VecDeque<PerfEntry>>,
}

impl PerfLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_entry(&self, entry: PerfEntry) {
        if self.max_len == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.max_len {
            entries.pop_front();
        }
    }

    /// Most recent first.
    pub fn entries(&self, count: usize) -> Vec<PerfEntry> {
        self.entries
            .lock()
            .iter()
            .rev()
            .take(count)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.entries.lock().clear();
    }
}
