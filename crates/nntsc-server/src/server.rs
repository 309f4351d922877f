//! Query server.
//!
//! One task per client connection reads framed requests, answers
//! catalogue queries, streams history chunks and forwards live export
//! events matching the connection's subscriptions. Slow or vanished
//! clients cancel their own queries: history chunks flow through a
//! bounded channel whose closed receiver aborts the store-side portal
//! within one fetch.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nntsc_core::{
    Collection, DataRow, DatabaseConfig, ExportEvent, ExporterConfig, StoreError, Timestamp,
};
use nntsc_proto::{
    msgtype, reqtype, AggregatorSpec, CancelContext, CancelNotice, CollectionList, HistoryBlock,
    Labels, LiveRecord, Message, NntscCodec, ProtocolError, PushCheckpoint, Request,
    SchemaDescription, StreamBatch, SubscribeRequest, VersionCheck, PROTOCOL_VERSION,
};
use nntsc_store::{DbSelector, QueryChunk, StreamCache};

use crate::bus::BusSubscriptions;

/// Streams per STREAMS message; keeps bodies well inside the frame
/// limit.
const STREAMS_PER_MESSAGE: usize = 100;

type MsgSink = SplitSink<Framed<TcpStream, NntscCodec>, Message>;

pub struct QueryServer {
    config: ExporterConfig,
    db_config: DatabaseConfig,
    cache: Arc<StreamCache>,
    subscriptions: Arc<BusSubscriptions>,
    cancel: CancellationToken,
}

impl QueryServer {
    pub fn new(
        config: ExporterConfig,
        db_config: DatabaseConfig,
        cache: Arc<StreamCache>,
        subscriptions: Arc<BusSubscriptions>,
        cancel: CancellationToken,
    ) -> Self {
        QueryServer { config, db_config, cache, subscriptions, cancel }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener =
            TcpListener::bind((self.config.listen.as_str(), self.config.port)).await?;
        info!(listen = %self.config.listen, port = self.config.port, "query server listening");

        loop {
            let (socket, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let db_config = self.db_config.clone();
            let cache = Arc::clone(&self.cache);
            let (events, evicted) = self.subscriptions.subscribe(self.config.queue_depth);
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                handle_connection(socket, peer, db_config, cache, events, evicted, cancel).await;
            });
        }
        Ok(())
    }
}

/// Live interest registered by a SUBSCRIBE that reached its history
/// end with an open-ended window.
struct LiveSubscription {
    collection: String,
    streams: HashSet<i32>,
    start: Timestamp,
    columns: Vec<String>,
}

impl LiveSubscription {
    fn matches(&self, collection: &str, stream_id: i32, ts: Timestamp) -> bool {
        self.collection == collection && ts >= self.start && self.streams.contains(&stream_id)
    }
}

struct Connection {
    peer: SocketAddr,
    selector: DbSelector,
    catalogue: Vec<Collection>,
    live: Vec<LiveSubscription>,
    /// Collection names whose stream births this client receives.
    watched: HashSet<String>,
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    db_config: DatabaseConfig,
    cache: Arc<StreamCache>,
    mut events: mpsc::Receiver<ExportEvent>,
    evicted: CancellationToken,
    cancel: CancellationToken,
) {
    debug!(%peer, "client connected");
    let framed = Framed::new(socket, NntscCodec::new());
    let (mut sink, mut requests) = framed.split();

    if sink
        .send(Message::VersionCheck(VersionCheck { version: PROTOCOL_VERSION as u32 }))
        .await
        .is_err()
    {
        return;
    }

    let selector = match DbSelector::connect(&db_config, cache).await {
        Ok(selector) => selector,
        Err(e) => {
            warn!(%peer, error = %e, "no database connection for client");
            return;
        }
    };

    let mut conn = Connection {
        peer,
        selector,
        catalogue: Vec::new(),
        live: Vec::new(),
        watched: HashSet::new(),
    };

    loop {
        let survived = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = evicted.cancelled() => {
                // Our bounded event queue overflowed: this client is
                // too slow to keep its subscription.
                warn!(%peer, "event queue overflowed, disconnecting slow client");
                let _ = send(&mut sink, cancelled(msgtype::LIVE, CancelContext::None)).await;
                break;
            }
            frame = requests.next() => match frame {
                None => break,
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "bad frame from client");
                    break;
                }
                Some(Ok(message)) => conn.handle_request(message, &mut sink).await,
            },
            event = events.recv() => match event {
                None => {
                    // Either an eviction raced the closed channel or
                    // the drain itself is gone for shutdown.
                    if evicted.is_cancelled() {
                        warn!(%peer, "event queue overflowed, disconnecting slow client");
                        let _ = send(&mut sink, cancelled(msgtype::LIVE, CancelContext::None)).await;
                    }
                    break;
                }
                Some(event) => conn.forward_event(event, &mut sink).await,
            },
        };

        if !survived {
            break;
        }
    }

    debug!(%peer, "client disconnected");
}

impl Connection {
    /// Handle one request; false means the connection must close.
    async fn handle_request(&mut self, message: Message, sink: &mut MsgSink) -> bool {
        match message {
            Message::Request(request) => self.handle_catalogue_request(request, sink).await,
            Message::Subscribe(sub) => self.handle_subscribe(sub, sink).await,
            Message::Aggregate(req) => {
                let Some(collection) = self.collection_by_id(req.collection).await else {
                    return self
                        .send_history_cancel(sink, req.collection.to_string(), req.labels, req.start, req.end, false)
                        .await;
                };
                let aggcols = req.aggregator.apply(&req.columns);
                let query = HistoryQuery::Aggregated {
                    aggcols,
                    groups: req.groups,
                    binsize: req.binsize,
                };
                self.run_history(sink, collection, req.labels, req.start, req.end, query)
                    .await
                    .is_some()
            }
            Message::Percentile(req) => {
                let Some(collection) = self.collection_by_id(req.collection).await else {
                    return self
                        .send_history_cancel(sink, req.collection.to_string(), req.labels, req.start, req.end, false)
                        .await;
                };
                let query = HistoryQuery::Percentile {
                    binsize: req.binsize,
                    ntile_columns: req.ntile_columns,
                    other_columns: req.other_columns,
                    ntile_aggregator: req.ntile_aggregator,
                    other_aggregator: req.other_aggregator,
                };
                self.run_history(sink, collection, req.labels, req.start, req.end, query)
                    .await
                    .is_some()
            }
            other => {
                debug!(peer = %self.peer, msgtype = other.msgtype(), "ignoring unexpected message");
                true
            }
        }
    }

    async fn handle_catalogue_request(&mut self, request: Request, sink: &mut MsgSink) -> bool {
        match request.reqtype {
            reqtype::COLLECTIONS => match self.selector.list_collections().await {
                Ok(collections) => {
                    self.catalogue = collections.clone();
                    send(sink, Message::Collections(CollectionList { collections })).await
                }
                Err(e) => {
                    warn!(error = %e, "collection listing failed");
                    send(
                        sink,
                        cancelled(msgtype::COLLECTIONS, CancelContext::None),
                    )
                    .await
                }
            },
            reqtype::SCHEMAS => {
                let col_id = request.collection as i32;
                let name = self
                    .collection_by_id(col_id)
                    .await
                    .map(|c| c.name())
                    .unwrap_or_default();
                match self.selector.collection_schema(col_id).await {
                    Ok((stream_schema, data_schema)) => {
                        send(
                            sink,
                            Message::Schemas(SchemaDescription {
                                collection: name,
                                stream_schema,
                                data_schema,
                            }),
                        )
                        .await
                    }
                    Err(e) => {
                        warn!(error = %e, col_id, "schema request failed");
                        send(
                            sink,
                            cancelled(
                                msgtype::SCHEMAS,
                                CancelContext::Schemas { collection: col_id },
                            ),
                        )
                        .await
                    }
                }
            }
            reqtype::STREAMS => {
                let col_id = request.collection as i32;
                let min_id = request.start as i32;
                let Some(collection) = self.collection_by_id(col_id).await else {
                    return send(
                        sink,
                        cancelled(
                            msgtype::STREAMS,
                            CancelContext::Streams { collection: col_id, boundary: min_id },
                        ),
                    )
                    .await;
                };
                match self.selector.streams_for_collection(col_id, min_id).await {
                    Ok(streams) => {
                        let name = collection.name();
                        // Asking for streams implies wanting to hear
                        // about new ones as they appear.
                        self.watched.insert(name.clone());
                        for message in stream_batches(&name, streams) {
                            if !send(sink, message).await {
                                return false;
                            }
                        }
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, col_id, "stream listing failed");
                        send(
                            sink,
                            cancelled(
                                msgtype::STREAMS,
                                CancelContext::Streams { collection: col_id, boundary: min_id },
                            ),
                        )
                        .await
                    }
                }
            }
            reqtype::ACTIVE_STREAMS => {
                // Permanently retired; refuse while keeping the wire
                // constant stable.
                send(
                    sink,
                    cancelled(
                        msgtype::STREAMS,
                        CancelContext::Streams {
                            collection: request.collection as i32,
                            boundary: 0,
                        },
                    ),
                )
                .await
            }
            other => {
                debug!(reqtype = other, "unknown request type");
                true
            }
        }
    }

    async fn handle_subscribe(&mut self, sub: SubscribeRequest, sink: &mut MsgSink) -> bool {
        let collection = match self.selector.collection_named(&sub.collection).await {
            Ok(collection) => collection,
            Err(e) => {
                warn!(error = %e, collection = %sub.collection, "subscribe to unknown collection");
                return self
                    .send_history_cancel(sink, sub.collection, sub.labels, sub.start, sub.end, false)
                    .await;
            }
        };

        let query = if sub.aggregators.is_empty() {
            HistoryQuery::Raw { columns: sub.columns.clone() }
        } else {
            let spec = if sub.aggregators.len() == 1 {
                AggregatorSpec::Single(sub.aggregators[0].clone())
            } else {
                AggregatorSpec::PerColumn(sub.aggregators.clone())
            };
            HistoryQuery::Aggregated {
                aggcols: spec.apply(&sub.columns),
                groups: Vec::new(),
                binsize: 0,
            }
        };

        let name = collection.name();
        let outcome = self
            .run_history(sink, collection, sub.labels.clone(), sub.start, sub.end, query)
            .await;
        let Some(filtered) = outcome else { return false };

        // An open-ended window keeps the subscription alive for live
        // records; a finite one is history-only.
        if sub.end == 0 {
            let streams: HashSet<i32> = filtered.values().flatten().copied().collect();
            self.watched.insert(name.clone());
            self.live.push(LiveSubscription {
                collection: name,
                streams,
                start: sub.start,
                columns: sub.columns,
            });
        }
        true
    }

    /// Stream one historical query to the client. Returns the filtered
    /// labels on success and `None` when the connection must close.
    async fn run_history(
        &mut self,
        sink: &mut MsgSink,
        collection: Collection,
        labels: Labels,
        start: Timestamp,
        end: Timestamp,
        query: HistoryQuery,
    ) -> Option<Labels> {
        let name = collection.name();
        // An open end means "until now and beyond" for the history
        // part of the query.
        let history_end = if end == 0 { i64::MAX } else { end };

        let filtered = match self
            .selector
            .filter_active_streams(collection.id, &labels, start, history_end)
            .await
        {
            Ok(filtered) => filtered,
            Err(e) => {
                warn!(error = %e, collection = %name, "active-stream filter failed");
                self.send_history_cancel(sink, name, labels, start, end, false)
                    .await;
                return None;
            }
        };

        let (tx, mut rx) = mpsc::channel::<QueryChunk>(4);
        let selector = &mut self.selector;
        let col_id = collection.id;
        let filtered_for_query = filtered.clone();

        let query_task = async move {
            let result = match &query {
                HistoryQuery::Raw { columns } => {
                    selector
                        .select_data(col_id, &filtered_for_query, columns, start, history_end, &tx)
                        .await
                }
                HistoryQuery::Aggregated { aggcols, groups, binsize } => {
                    selector
                        .select_aggregated(
                            col_id,
                            &filtered_for_query,
                            aggcols,
                            start,
                            history_end,
                            groups,
                            *binsize,
                            &tx,
                        )
                        .await
                }
                HistoryQuery::Percentile {
                    binsize,
                    ntile_columns,
                    other_columns,
                    ntile_aggregator,
                    other_aggregator,
                } => {
                    selector
                        .select_percentile(
                            col_id,
                            &filtered_for_query,
                            start,
                            history_end,
                            *binsize,
                            ntile_columns,
                            other_columns,
                            ntile_aggregator,
                            other_aggregator,
                            &tx,
                        )
                        .await
                }
            };
            drop(tx);
            result
        };

        let sink_name = name.clone();
        let send_task = async move {
            while let Some(chunk) = rx.recv().await {
                let block = history_block(&sink_name, chunk);
                if let Err(e) = send_history(sink, block).await {
                    debug!(error = %e, "history send failed");
                    return (sink, false);
                }
            }
            (sink, true)
        };

        let (query_result, (sink, send_ok)) = tokio::join!(query_task, send_task);

        if !send_ok {
            return None;
        }

        match query_result {
            Ok(()) => Some(filtered),
            // The send side vanished first; the connection is gone.
            Err(StoreError::Interrupted) => None,
            Err(e) => {
                warn!(error = %e, collection = %name, "history query failed");
                // Tell the client how far the query got, then close.
                self.send_history_cancel(sink, name, labels, start, end, true)
                    .await;
                None
            }
        }
    }

    async fn send_history_cancel(
        &mut self,
        sink: &mut MsgSink,
        collection: String,
        labels: Labels,
        start: Timestamp,
        end: Timestamp,
        more: bool,
    ) -> bool {
        send(
            sink,
            cancelled(
                msgtype::HISTORY,
                CancelContext::History { collection, labels, start, end, more },
            ),
        )
        .await
    }

    async fn forward_event(&mut self, event: ExportEvent, sink: &mut MsgSink) -> bool {
        match event {
            ExportEvent::Live { collection, stream_id, timestamp, row } => {
                let Some(sub) = self
                    .live
                    .iter()
                    .find(|s| s.matches(&collection, stream_id, timestamp))
                else {
                    return true;
                };
                let data = project_columns(row, &sub.columns);
                send(
                    sink,
                    Message::Live(LiveRecord { collection, stream_id, timestamp, data }),
                )
                .await
            }
            ExportEvent::StreamBirth { collection, stream_id, mut attributes, .. } => {
                if !self.watched.contains(&collection) {
                    return true;
                }
                attributes.insert("stream_id".to_string(), (stream_id as i64).into());
                send(
                    sink,
                    Message::Streams(StreamBatch {
                        collection,
                        more: false,
                        streams: vec![attributes],
                    }),
                )
                .await
            }
            ExportEvent::Push { collection_id, timestamp } => {
                let subscribed = self
                    .catalogue
                    .iter()
                    .find(|c| c.id == collection_id)
                    .map(|c| self.live.iter().any(|s| s.collection == c.name()))
                    .unwrap_or(false);
                if !subscribed {
                    return true;
                }
                send(
                    sink,
                    Message::Push(PushCheckpoint { collection: collection_id, timestamp }),
                )
                .await
            }
        }
    }

    async fn collection_by_id(&mut self, id: i32) -> Option<Collection> {
        if let Some(found) = self.catalogue.iter().find(|c| c.id == id) {
            return Some(found.clone());
        }
        match self.selector.list_collections().await {
            Ok(collections) => {
                self.catalogue = collections;
                self.catalogue.iter().find(|c| c.id == id).cloned()
            }
            Err(e) => {
                warn!(error = %e, "catalogue refresh failed");
                None
            }
        }
    }
}

enum HistoryQuery {
    Raw {
        columns: Vec<String>,
    },
    Aggregated {
        aggcols: Vec<(String, String)>,
        groups: Vec<String>,
        binsize: i64,
    },
    Percentile {
        binsize: i64,
        ntile_columns: Vec<String>,
        other_columns: Vec<String>,
        ntile_aggregator: String,
        other_aggregator: String,
    },
}

fn history_block(collection: &str, chunk: QueryChunk) -> HistoryBlock {
    HistoryBlock {
        collection: collection.to_string(),
        label: chunk.label,
        data: chunk.rows,
        more: !chunk.last_in_label,
        binsize: chunk.binsize,
    }
}

fn cancelled(request: u8, context: CancelContext) -> Message {
    Message::QueryCancelled(CancelNotice { request, context })
}

/// Restrict a live row to the subscribed columns. Timestamp and stream
/// id always survive.
fn project_columns(row: DataRow, columns: &[String]) -> DataRow {
    if columns.is_empty() {
        return row;
    }
    row.into_iter()
        .filter(|(key, _)| {
            key == "timestamp" || key == "stream_id" || columns.iter().any(|c| c == key)
        })
        .collect()
}

/// Page a stream listing into bounded STREAMS messages, `more` set on
/// all but the last.
fn stream_batches(collection: &str, streams: Vec<DataRow>) -> Vec<Message> {
    if streams.is_empty() {
        return vec![Message::Streams(StreamBatch {
            collection: collection.to_string(),
            more: false,
            streams: Vec::new(),
        })];
    }

    let total = streams.len();
    let mut batches = Vec::new();
    let mut taken = 0;
    let mut chunk = Vec::with_capacity(STREAMS_PER_MESSAGE.min(total));

    for stream in streams {
        chunk.push(stream);
        taken += 1;
        if chunk.len() == STREAMS_PER_MESSAGE || taken == total {
            batches.push(Message::Streams(StreamBatch {
                collection: collection.to_string(),
                more: taken != total,
                streams: std::mem::take(&mut chunk),
            }));
        }
    }
    batches
}

async fn send(sink: &mut MsgSink, message: Message) -> bool {
    match sink.send(message).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "send to client failed");
            false
        }
    }
}

/// Send a history block, splitting it in half when the compressed body
/// overflows the frame limit.
async fn send_history(sink: &mut MsgSink, block: HistoryBlock) -> Result<(), ProtocolError> {
    let fallback = block.clone();
    match sink.send(Message::History(block)).await {
        Ok(()) => Ok(()),
        Err(ProtocolError::Oversize(_)) if fallback.data.len() > 1 => {
            let mut first = fallback.clone();
            let mut second = fallback;
            let mid = first.data.len() / 2;
            second.data = first.data.split_off(mid);
            first.more = true;
            Box::pin(send_history(sink, first)).await?;
            Box::pin(send_history(sink, second)).await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_subscription_matching() {
        let sub = LiveSubscription {
            collection: "amp_icmp".into(),
            streams: HashSet::from([1, 2]),
            start: 1000,
            columns: vec![],
        };
        assert!(sub.matches("amp_icmp", 1, 1120));
        assert!(!sub.matches("amp_icmp", 3, 1120));
        assert!(!sub.matches("amp_dns", 1, 1120));
        assert!(!sub.matches("amp_icmp", 1, 999));
    }

    #[test]
    fn column_projection_keeps_identity_columns() {
        let mut row = DataRow::new();
        row.insert("timestamp".to_string(), 1000i64.into());
        row.insert("stream_id".to_string(), 1i64.into());
        row.insert("median".to_string(), 130i64.into());
        row.insert("loss".to_string(), 0i64.into());

        let projected = project_columns(row.clone(), &["median".to_string()]);
        assert_eq!(projected.len(), 3);
        assert!(projected.contains_key("timestamp"));
        assert!(projected.contains_key("median"));
        assert!(!projected.contains_key("loss"));

        assert_eq!(project_columns(row.clone(), &[]), row);
    }

    #[test]
    fn stream_listing_pages_with_more_flags() {
        let streams: Vec<DataRow> = (0..250)
            .map(|i| {
                let mut row = DataRow::new();
                row.insert("stream_id".to_string(), (i as i64).into());
                row
            })
            .collect();

        let batches = stream_batches("amp_icmp", streams);
        assert_eq!(batches.len(), 3);
        let flags: Vec<bool> = batches
            .iter()
            .map(|m| match m {
                Message::Streams(batch) => batch.more,
                _ => panic!("not a streams message"),
            })
            .collect();
        assert_eq!(flags, vec![true, true, false]);
    }

    #[test]
    fn empty_stream_listing_still_replies() {
        let batches = stream_batches("amp_icmp", Vec::new());
        assert_eq!(batches.len(), 1);
        match &batches[0] {
            Message::Streams(batch) => {
                assert!(!batch.more);
                assert!(batch.streams.is_empty());
            }
            _ => panic!("not a streams message"),
        }
    }
}
