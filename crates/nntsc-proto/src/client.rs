//! Client library for the query server.
//!
//! The client performs the version handshake on connect, offers one
//! method per request kind and hands every inbound message back to the
//! caller. Legacy callers that think in stream-id lists rather than
//! labels are converted transparently: each id becomes its own label
//! named after the id.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::warn;

use crate::{
    codec::ProtocolError, msgtype, reqtype, AggregateRequest, AggregatorSpec, Labels, Message,
    NntscCodec, PercentileRequest, Request, SubscribeRequest, PROTOCOL_VERSION,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("server requires protocol version {server}, this client speaks {client}")]
    VersionMismatch { server: u32, client: u32 },

    #[error("connection closed by server")]
    Disconnected,

    #[error("{0}")]
    Unsupported(String),
}

/// Streams of interest for a subscription or query, either labelled or
/// as a legacy flat list.
#[derive(Debug, Clone)]
pub enum StreamSelection {
    Labels(Labels),
    Streams(Vec<i32>),
}

impl StreamSelection {
    fn into_labels(self) -> Labels {
        match self {
            StreamSelection::Labels(labels) => labels,
            StreamSelection::Streams(streams) => convert_streams_to_labels(&streams),
        }
    }
}

/// Each stream id becomes its own label, named after the id.
pub fn convert_streams_to_labels(streams: &[i32]) -> Labels {
    streams.iter().map(|id| (id.to_string(), vec![*id])).collect()
}

#[derive(Debug)]
pub struct NntscClient<S = TcpStream> {
    framed: Framed<S, NntscCodec>,
}

impl NntscClient<TcpStream> {
    /// Connect and complete the version handshake.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> NntscClient<S> {
    /// Perform the handshake over an established transport.
    pub async fn from_stream(stream: S) -> Result<Self, ClientError> {
        let mut framed = Framed::new(stream, NntscCodec::new());

        match framed.next().await {
            Some(Ok(Message::VersionCheck(check))) => {
                if check.version != PROTOCOL_VERSION as u32 {
                    warn!(
                        server = check.version,
                        client = PROTOCOL_VERSION,
                        "protocol version mismatch, disconnecting"
                    );
                    return Err(ClientError::VersionMismatch {
                        server: check.version,
                        client: PROTOCOL_VERSION as u32,
                    });
                }
            }
            Some(Ok(_)) => {
                return Err(ClientError::Unsupported(
                    "server did not open with a version check".to_string(),
                ))
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ClientError::Disconnected),
        }

        Ok(NntscClient { framed })
    }

    async fn send(&mut self, message: Message) -> Result<(), ClientError> {
        self.framed.send(message).await.map_err(Into::into)
    }

    pub async fn request_collections(&mut self) -> Result<(), ClientError> {
        self.send(Message::Request(Request {
            reqtype: reqtype::COLLECTIONS,
            collection: 0,
            start: 0,
        }))
        .await
    }

    pub async fn request_schemas(&mut self, collection: u32) -> Result<(), ClientError> {
        self.send(Message::Request(Request {
            reqtype: reqtype::SCHEMAS,
            collection,
            start: 0,
        }))
        .await
    }

    /// Ask for all streams of a collection with id above `min_stream_id`.
    pub async fn request_streams(
        &mut self,
        collection: u32,
        min_stream_id: u32,
    ) -> Result<(), ClientError> {
        self.send(Message::Request(Request {
            reqtype: reqtype::STREAMS,
            collection,
            start: min_stream_id,
        }))
        .await
    }

    /// Active-stream queries were retired; the request type constant
    /// remains only so old byte streams still parse.
    pub async fn request_active_streams(&mut self, _collection: u32) -> Result<(), ClientError> {
        Err(ClientError::Unsupported(
            "requesting active streams is no longer supported".to_string(),
        ))
    }

    /// Subscribe to a collection: history over `[start, end]` first,
    /// live records afterwards if `end` is zero.
    pub async fn subscribe(
        &mut self,
        collection: &str,
        columns: Vec<String>,
        selection: StreamSelection,
        start: i64,
        end: i64,
        aggregators: Vec<String>,
    ) -> Result<(), ClientError> {
        self.send(Message::Subscribe(SubscribeRequest {
            collection: collection.to_string(),
            start,
            end,
            columns,
            labels: selection.into_labels(),
            aggregators,
        }))
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn request_aggregate(
        &mut self,
        collection: i32,
        selection: StreamSelection,
        start: i64,
        end: i64,
        columns: Vec<String>,
        binsize: i64,
        groups: Vec<String>,
        aggregator: AggregatorSpec,
    ) -> Result<(), ClientError> {
        self.send(Message::Aggregate(AggregateRequest {
            collection,
            start,
            end,
            labels: selection.into_labels(),
            columns,
            groups,
            binsize,
            aggregator,
        }))
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn request_percentiles(
        &mut self,
        collection: i32,
        selection: StreamSelection,
        start: i64,
        end: i64,
        binsize: i64,
        ntile_columns: Vec<String>,
        other_columns: Vec<String>,
        ntile_aggregator: &str,
        other_aggregator: &str,
    ) -> Result<(), ClientError> {
        self.send(Message::Percentile(PercentileRequest {
            collection,
            start,
            end,
            labels: selection.into_labels(),
            binsize,
            ntile_columns,
            other_columns,
            ntile_aggregator: ntile_aggregator.to_string(),
            other_aggregator: other_aggregator.to_string(),
        }))
        .await
    }

    /// Next message from the server; `None` once the connection
    /// closes. A mid-stream `QUERY_CANCELLED` arrives here like any
    /// other message and carries the resumption context.
    pub async fn receive(&mut self) -> Result<Option<Message>, ClientError> {
        match self.framed.next().await {
            Some(Ok(Message::VersionCheck(_))) => {
                // Harmless re-announcement; skip to the next message.
                Box::pin(self.receive()).await
            }
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Message kinds a server may push without a matching outstanding
/// request.
pub fn is_unsolicited(message: &Message) -> bool {
    matches!(message.msgtype(), msgtype::LIVE | msgtype::PUSH | msgtype::STREAMS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VersionCheck;
    use futures::SinkExt;

    #[test]
    fn stream_lists_become_singleton_labels() {
        let labels = convert_streams_to_labels(&[1, 2, 17]);
        assert_eq!(labels.len(), 3);
        assert_eq!(labels["1"], vec![1]);
        assert_eq!(labels["17"], vec![17]);
    }

    #[tokio::test]
    async fn handshake_accepts_matching_version() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let mut server = Framed::new(server_end, NntscCodec::new());

        let handshake = tokio::spawn(async move {
            server
                .send(Message::VersionCheck(VersionCheck { version: 1 }))
                .await
                .unwrap();
            server
        });

        let client = NntscClient::from_stream(client_end).await;
        assert!(client.is_ok());
        handshake.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_version_mismatch() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let mut server = Framed::new(server_end, NntscCodec::new());

        tokio::spawn(async move {
            let _ = server
                .send(Message::VersionCheck(VersionCheck { version: 0 }))
                .await;
        });

        match NntscClient::from_stream(client_end).await {
            Err(ClientError::VersionMismatch { server: 0, client: 1 }) => {}
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refuses_active_stream_requests() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let mut server = Framed::new(server_end, NntscCodec::new());
        tokio::spawn(async move {
            let _ = server
                .send(Message::VersionCheck(VersionCheck { version: 1 }))
                .await;
            // Hold the connection open while the client tries.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });

        let mut client = NntscClient::from_stream(client_end).await.unwrap();
        assert!(matches!(
            client.request_active_streams(1).await,
            Err(ClientError::Unsupported(_))
        ));
    }
}
