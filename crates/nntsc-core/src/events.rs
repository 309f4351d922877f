//! Events carried by the export bus from the ingestion pipeline to the
//! broker exchange and to in-process subscribers (the query server).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{DataRow, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExportEvent {
    /// A stream was created. Always delivered before any Live event for
    /// the same stream id.
    StreamBirth {
        collection_id: i32,
        collection: String,
        stream_id: i32,
        attributes: DataRow,
    },
    /// One measurement row was inserted.
    Live {
        collection: String,
        stream_id: i32,
        timestamp: Timestamp,
        row: DataRow,
    },
    /// A store batch covering this collection committed; everything up
    /// to `timestamp` is durable.
    Push {
        collection_id: i32,
        timestamp: Timestamp,
    },
}

impl ExportEvent {
    /// Topic the event is forwarded to on the outbound exchange.
    pub fn topic(&self) -> Option<&str> {
        match self {
            ExportEvent::StreamBirth { collection, .. } | ExportEvent::Live { collection, .. } => {
                Some(collection)
            }
            ExportEvent::Push { .. } => None,
        }
    }

    /// Live events and commit checkpoints may be shed under pressure;
    /// stream births may not.
    pub fn droppable(&self) -> bool {
        matches!(self, ExportEvent::Live { .. } | ExportEvent::Push { .. })
    }
}

/// Producer handle for the export bus.
///
/// Publishing never blocks the ingestion path for droppable events:
/// when the bounded queue is full, live records and checkpoints are
/// shed and counted. Stream births wait for room instead, since
/// subscribers must not miss a birth that precedes live data.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ExportEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    pub fn channel(depth: usize) -> (EventSender, mpsc::Receiver<ExportEvent>) {
        let (tx, rx) = mpsc::channel(depth);
        (EventSender { tx, dropped: Arc::new(AtomicU64::new(0)) }, rx)
    }

    pub async fn publish_stream(
        &self,
        collection_id: i32,
        collection: String,
        stream_id: i32,
        attributes: DataRow,
    ) {
        let event = ExportEvent::StreamBirth { collection_id, collection, stream_id, attributes };
        // Failure here means the drain task is gone, which only happens
        // during shutdown.
        let _ = self.tx.send(event).await;
    }

    pub fn publish_live(
        &self,
        collection: String,
        stream_id: i32,
        timestamp: Timestamp,
        row: DataRow,
    ) {
        self.try_publish(ExportEvent::Live { collection, stream_id, timestamp, row });
    }

    pub fn publish_push(&self, collection_id: i32, timestamp: Timestamp) {
        self.try_publish(ExportEvent::Push { collection_id, timestamp });
    }

    fn try_publish(&self, event: ExportEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of droppable events shed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
