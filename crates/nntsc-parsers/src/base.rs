//! Shared parser plumbing: the local key→id map, stream registration
//! and row insertion with the matching export-bus side effects.

use std::collections::HashMap;

use tracing::debug;

use nntsc_core::{
    CollectionSpec, DataRow, EventSender, FieldValue, StoreError, StreamKey, Timestamp,
};
use nntsc_store::DbInsert;

pub struct ParserCore {
    spec: CollectionSpec,
    streams: HashMap<StreamKey, i32>,
}

impl ParserCore {
    pub fn new(spec: CollectionSpec) -> Self {
        ParserCore { spec, streams: HashMap::new() }
    }

    pub fn spec(&self) -> CollectionSpec {
        self.spec
    }

    /// Build the stream key for a row using the collection's unique
    /// columns, in declaration order.
    pub fn key_from_row(&self, row: &DataRow) -> StreamKey {
        self.spec
            .tables
            .unique_columns
            .iter()
            .map(|col| row.get(*col).map(FieldValue::key_str).unwrap_or_default())
            .collect()
    }

    /// Remember an existing stream loaded from the store.
    pub fn register_existing(&mut self, stream: &DataRow) {
        let Some(id) = stream.get("stream_id").and_then(FieldValue::as_integer) else {
            return;
        };
        let key = self.key_from_row(stream);
        self.streams.insert(key, id as i32);
    }

    pub fn known_stream(&self, key: &StreamKey) -> Option<i32> {
        self.streams.get(key).copied()
    }

    /// Look up or create the stream for `key`. Creation publishes a
    /// single stream-birth event; losing the insert race to another
    /// writer publishes nothing and adopts the winner's id.
    pub async fn stream_for(
        &mut self,
        db: &mut DbInsert,
        bus: &EventSender,
        key: StreamKey,
        name: String,
        props: DataRow,
        ts: Timestamp,
    ) -> Result<i32, StoreError> {
        if let Some(id) = self.streams.get(&key) {
            return Ok(*id);
        }

        let colid = db.collection_id(self.spec.module, self.spec.modsubtype).await?;
        let (stream_id, created) = db.insert_stream(&self.spec, &name, ts, &props).await?;
        self.streams.insert(key, stream_id);

        if created {
            debug!(collection = %self.spec.name(), stream_id, "new stream");
            bus.publish_stream(colid, self.spec.name(), stream_id, props).await;
        }
        Ok(stream_id)
    }

    /// Insert one measurement row and publish the matching live event.
    pub async fn insert_data(
        &self,
        db: &mut DbInsert,
        bus: &EventSender,
        stream_id: i32,
        ts: Timestamp,
        row: DataRow,
    ) -> Result<(), StoreError> {
        db.insert_data(&self.spec, stream_id, ts, &row).await?;
        bus.publish_live(self.spec.name(), stream_id, ts, row);
        Ok(())
    }
}

/// Median of an already sorted slice; the mean of the two middle
/// entries when the length is even.
pub fn median_of_sorted(sorted: &[i64]) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2)
    }
}

/// Address family from the text form of an address.
pub fn address_family(address: &str) -> &'static str {
    if address.contains('.') {
        "ipv4"
    } else {
        "ipv6"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_odd_and_even() {
        assert_eq!(median_of_sorted(&[]), None);
        assert_eq!(median_of_sorted(&[7]), Some(7));
        assert_eq!(median_of_sorted(&[120, 130, 140]), Some(130));
        assert_eq!(median_of_sorted(&[100, 120, 130, 150]), Some(125));
    }

    #[test]
    fn family_detection() {
        assert_eq!(address_family("10.0.0.1"), "ipv4");
        assert_eq!(address_family("2001:db8::1"), "ipv6");
    }
}
