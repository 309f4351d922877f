//! # NNTSC Store - PostgreSQL Gateway and Query Engine
//!
//! Everything that talks to the relational store lives here:
//!
//! - [`DbInsert`]: schema-aware, batched, transactional writes used by
//!   the ingestion pipeline: stream registration, data rows, partition
//!   management and last-timestamp bookkeeping
//! - [`DbSelector`]: the read side used by the query server: catalogue
//!   and schema queries, and portal-backed history queries with
//!   optional binning, aggregation and percentiles
//! - [`StreamCache`]: the process-wide first/last timestamp cache used
//!   to restrict queries to streams active in the requested window
//! - [`schema`]: table and aggregate bootstrap plus rollup views
//!
//! All failures surface as [`nntsc_core::StoreError`] kinds so callers
//! can choose between retry, skip and abort.

pub mod cache;
pub mod connection;
pub mod insert;
pub mod rows;
pub mod schema;
pub mod select;

pub use cache::StreamCache;
pub use connection::DbConnection;
pub use insert::DbInsert;
pub use select::{DbSelector, FrequencyEstimator, QueryChunk};

/// Width of one data-table partition.
pub const PARTITION_WEEK: i64 = 7 * 24 * 60 * 60;

/// Start of the weekly partition containing `ts`.
pub fn partition_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(PARTITION_WEEK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_boundaries() {
        assert_eq!(partition_start(0), 0);
        assert_eq!(partition_start(1), 0);
        assert_eq!(partition_start(PARTITION_WEEK), PARTITION_WEEK);
        assert_eq!(partition_start(PARTITION_WEEK + 1), PARTITION_WEEK);
        assert_eq!(partition_start(PARTITION_WEEK * 3 - 1), PARTITION_WEEK * 2);
    }
}
