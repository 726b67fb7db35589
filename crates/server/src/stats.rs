//! Server-wide counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Default)]
pub struct CommandStat {
    pub calls: AtomicU64,
    pub latency_us: AtomicU64,
}

#[derive(Default)]
pub struct Stats {
    inbound_bytes: AtomicU64,
    total_calls: AtomicU64,
    commands: RwLock<HashMap<String, Arc<CommandStat>>>,
}

impl Stats {
    pub fn incr_inbound_bytes(&self, n: u64) {
        self.inbound_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inbound_bytes(&self) -> u64 {
        self.inbound_bytes.load(Ordering::Relaxed)
    }

    pub fn incr_calls(&self, command: &str) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.command_stat(command)
            .calls
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_latency(&self, us: u64, command: &str) {
        self.command_stat(command)
            .latency_us
            .fetch_add(us, Ordering::Relaxed);
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// `(name, calls, total latency us)` per command, for INFO.
    pub fn command_stats(&self) -> Vec<(String, u64, u64)> {
        let mut stats: Vec<(String, u64, u64)> = self
            .commands
            .read()
            .iter()
            .map(|(name, stat)| {
                (
                    name.clone(),
                    stat.calls.load(Ordering::Relaxed),
                    stat.latency_us.load(Ordering::Relaxed),
                )
            })
            .collect();
        stats.sort();
        stats
    }

    fn command_stat(&self, command: &str) -> Arc<CommandStat> {
        if let Some(stat) = self.commands.read().get(command) {
            return stat.clone();
        }
        self.commands
            .write()
            .entry(command.to_string())
            .or_default()
            .clone()
    }
}
