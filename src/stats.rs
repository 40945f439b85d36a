//! Ambient connection/command counters (C7). Lightweight and
//! lock-free, the same shape the teacher keeps its pool occupancy counters
//! in: plain atomics behind a `once_cell` static, incremented inline by
//! whoever touches the thing being counted.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub commands_processed: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

impl Stats {
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outstanding_connections(&self) -> u64 {
        self.connections_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.connections_closed.load(Ordering::Relaxed))
    }
}

pub static STATS: once_cell::sync::Lazy<Stats> = once_cell::sync::Lazy::new(Stats::default);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outstanding_connections_tracks_open_minus_closed() {
        let stats = Stats::default();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        assert_eq!(stats.outstanding_connections(), 1);
    }
}
