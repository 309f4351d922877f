//! Process-wide cache of per-stream first/last timestamps, keyed by
//! data table name.
//!
//! First timestamps never change once known. Last timestamps keep
//! moving while a stream is alive, so cached entries expire after the
//! configured cache time and are refreshed from the store on the next
//! lookup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nntsc_core::Timestamp;

#[derive(Default)]
struct TableTimes {
    first: HashMap<i32, Timestamp>,
    last: HashMap<i32, (Timestamp, Instant)>,
}

pub struct StreamCache {
    cachetime: Duration,
    tables: Mutex<HashMap<String, TableTimes>>,
}

impl StreamCache {
    pub fn new(cachetime: Duration) -> Self {
        StreamCache { cachetime, tables: Mutex::new(HashMap::new()) }
    }

    pub fn first(&self, table: &str, stream_id: i32) -> Option<Timestamp> {
        let tables = self.tables.lock().unwrap();
        tables.get(table)?.first.get(&stream_id).copied()
    }

    pub fn last(&self, table: &str, stream_id: i32) -> Option<Timestamp> {
        let tables = self.tables.lock().unwrap();
        let (ts, stored) = tables.get(table)?.last.get(&stream_id)?;
        if stored.elapsed() >= self.cachetime {
            return None;
        }
        Some(*ts)
    }

    pub fn store_first(&self, table: &str, stream_id: i32, ts: Timestamp) {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(table.to_string())
            .or_default()
            .first
            .entry(stream_id)
            .or_insert(ts);
    }

    pub fn store_last(&self, table: &str, stream_id: i32, ts: Timestamp) {
        let mut tables = self.tables.lock().unwrap();
        let entry = tables.entry(table.to_string()).or_default();
        match entry.last.get(&stream_id) {
            // A cached value never moves backwards, but its freshness
            // window restarts.
            Some((existing, _)) if *existing > ts => {
                let existing = *existing;
                entry.last.insert(stream_id, (existing, Instant::now()));
            }
            _ => {
                entry.last.insert(stream_id, (ts, Instant::now()));
            }
        }
    }
}

/// True when a stream seen between `first` and `last` overlaps the
/// query window `[start, end]`.
pub fn stream_active(first: Timestamp, last: Timestamp, start: Timestamp, end: Timestamp) -> bool {
    first <= end && last >= start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_timestamp_is_sticky() {
        let cache = StreamCache::new(Duration::from_secs(300));
        cache.store_first("data_amp_icmp", 1, 1000);
        cache.store_first("data_amp_icmp", 1, 500);
        assert_eq!(cache.first("data_amp_icmp", 1), Some(1000));
    }

    #[test]
    fn last_timestamp_only_advances() {
        let cache = StreamCache::new(Duration::from_secs(300));
        cache.store_last("data_amp_icmp", 1, 2000);
        cache.store_last("data_amp_icmp", 1, 1500);
        assert_eq!(cache.last("data_amp_icmp", 1), Some(2000));
        cache.store_last("data_amp_icmp", 1, 2500);
        assert_eq!(cache.last("data_amp_icmp", 1), Some(2500));
    }

    #[test]
    fn expired_last_is_refetched() {
        let cache = StreamCache::new(Duration::ZERO);
        cache.store_last("data_amp_icmp", 1, 2000);
        assert_eq!(cache.last("data_amp_icmp", 1), None);
    }

    #[test]
    fn tables_are_independent() {
        let cache = StreamCache::new(Duration::from_secs(300));
        cache.store_first("data_amp_icmp", 1, 1000);
        assert_eq!(cache.first("data_amp_dns", 1), None);
    }

    #[test]
    fn activity_window() {
        // Overlapping in any way counts; empty streams (0, 0) only
        // match windows starting at or before zero.
        assert!(stream_active(1000, 2000, 1500, 1600));
        assert!(stream_active(1000, 2000, 2000, 3000));
        assert!(stream_active(1000, 2000, 0, 1000));
        assert!(!stream_active(1000, 2000, 2001, 3000));
        assert!(!stream_active(1000, 2000, 0, 999));
        assert!(!stream_active(0, 0, 1, 100));
    }
}
