//! Decoded measurement payloads.
//!
//! The per-test byte decoders are replaceable black boxes; what reaches
//! the parsers is one of these normalized shapes.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// A decoded broker message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// An active-probing test report: one entry per target probed in
    /// this measurement round. The entries keep the decoder's JSON
    /// shape; each parser deserializes the fields it knows.
    TestResults(Vec<serde_json::Value>),
    /// A passive-classification counter report.
    Lpi(LpiStats),
}

/// Per-protocol counters from a passive classification monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LpiStats {
    /// Monitor identifier.
    pub monitor: String,
    #[serde(default)]
    pub user: String,
    /// Traffic direction, `in` or `out`.
    #[serde(default)]
    pub dir: String,
    /// Reporting frequency in seconds.
    pub freq: i64,
    /// Which counter this report carries, e.g. `bytes`, `pkts`,
    /// `new_flows`, `activeusers`.
    pub metric: String,
    pub timestamp: Timestamp,
    /// Protocol name to counter value.
    pub results: Vec<(String, i64)>,
}
