//! Slow-query log: a bounded ring of the argvs of commands that ran past the
//! configured threshold.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;

const MAX_RECORDED_ARGS: usize = 32;

#[derive(Debug, Clone)]
pub struct SlowlogEntry {
    pub id: u64,
    pub timestamp: u64,
    pub duration_us: u64,
    pub args: Vec<Vec<u8>>,
}

pub struct SlowLog {
    slower_than_us: i64,
    max_len: usize,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<SlowlogEntry>>,
}

impl SlowLog {
    pub fn new(slower_than_us: i64, max_len: usize) -> Self {
        Self {
            slower_than_us,
            max_len,
            next_id: AtomicU64::new(0),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_entry_if_needed(&self, args: &[Bytes], duration_us: u64) {
        if self.slower_than_us < 0 || (duration_us as i64) < self.slower_than_us {
            return;
        }
        if self.max_len == 0 {
            return;
        }
        let entry = SlowlogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            duration_us,
            args: args
                .iter()
                .take(MAX_RECORDED_ARGS)
                .map(|arg| arg.to_vec())
                .collect(),
        };
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.max_len {
            entries.pop_front();
        }
    }

    /// Most recent first.
    pub fn entries(&self, count: usize) -> Vec<SlowlogEntry> {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect()
    }

    #[test]
    fn test_threshold() {
        let slowlog = SlowLog::new(1000, 8);
        slowlog.push_entry_if_needed(&args(&["get", "a"]), 999);
        assert_eq!(slowlog.len(), 0);
        slowlog.push_entry_if_needed(&args(&["get", "b"]), 1000);
        assert_eq!(slowlog.len(), 1);
    }

    #[test]
    fn test_disabled_and_zero_threshold() {
        let disabled = SlowLog::new(-1, 8);
        disabled.push_entry_if_needed(&args(&["x"]), u64::MAX);
        assert_eq!(disabled.len(), 0);

        let everything = SlowLog::new(0, 8);
        everything.push_entry_if_needed(&args(&["x"]), 0);
        assert_eq!(everything.len(), 1);
    }

    #[test]
    fn test_ring_is_bounded_and_ordered() {
        let slowlog = SlowLog::new(0, 2);
        for i in 0..5 {
            slowlog.push_entry_if_needed(&args(&[&i.to_string()]), i);
        }
        assert_eq!(slowlog.len(), 2);
        let entries = slowlog.entries(10);
        assert_eq!(entries[0].duration_us, 4);
        assert_eq!(entries[1].duration_us, 3);

        slowlog.reset();
        assert!(slowlog.is_empty());
    }
}
