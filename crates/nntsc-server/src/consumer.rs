//! Broker consumer: drains the ingest queue, drives the parsers and
//! owns the commit/ack discipline.
//!
//! Messages are processed in batches of `commit_freq`. Once a batch of
//! store inserts commits, the consumer position is committed back to
//! the broker, acknowledging everything up to the newest message. A
//! transient store or broker failure abandons the batch without
//! acknowledging, tears the consumer down and rebuilds it after a
//! backoff, so the broker redelivers the unacked messages.

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::ClientConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nntsc_core::{BrokerConfig, EventSender, StoreError, Timestamp};
use nntsc_parsers::ParserRegistry;
use nntsc_store::DbInsert;

/// Backoff after a failed connect or a torn-down channel: ten seconds,
/// doubling per consecutive failure, capped at two minutes.
fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(4);
    Duration::from_secs((10u64 << exp).min(120))
}

enum LoopExit {
    Shutdown,
    Reconnect,
}

pub struct BrokerConsumer {
    config: BrokerConfig,
    db: DbInsert,
    registry: ParserRegistry,
    bus: EventSender,
    cancel: CancellationToken,
    /// Highest measurement timestamp per collection in the current
    /// batch, flushed as PUSH checkpoints on commit.
    batch_checkpoints: HashMap<i32, Timestamp>,
    pending: usize,
}

impl BrokerConsumer {
    pub fn new(
        config: BrokerConfig,
        db: DbInsert,
        registry: ParserRegistry,
        bus: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        BrokerConsumer {
            config,
            db,
            registry,
            bus,
            cancel,
            batch_checkpoints: HashMap::new(),
            pending: 0,
        }
    }

    /// Validate the broker configuration by building (not connecting)
    /// a consumer. Configuration mistakes surface here, at startup.
    pub fn validate(config: &BrokerConfig) -> anyhow::Result<()> {
        let _probe: StreamConsumer = Self::client_config(config).create()?;
        Ok(())
    }

    fn client_config(config: &BrokerConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap())
            .set("group.id", "nntsc")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false");
        if !config.password.is_empty() {
            client_config
                .set("security.protocol", "sasl_plaintext")
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", &config.username)
                .set("sasl.password", &config.password);
        }
        client_config
    }

    pub async fn run(mut self) {
        // Consecutive failures since the last committed batch; drives
        // the reconnect backoff.
        let mut failures: u32 = 0;

        while !self.cancel.is_cancelled() {
            let consumer: StreamConsumer = match Self::client_config(&self.config).create() {
                Ok(consumer) => consumer,
                Err(e) => {
                    failures += 1;
                    error!(error = %e, "failed to build broker consumer");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff(failures)) => continue,
                    }
                }
            };
            if let Err(e) = consumer.subscribe(&[&self.config.queue]) {
                failures += 1;
                error!(error = %e, queue = %self.config.queue, "broker subscribe failed");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff(failures)) => continue,
                }
            }

            info!(queue = %self.config.queue, "consuming from broker");

            match self.consume(&consumer, &mut failures).await {
                LoopExit::Shutdown => break,
                LoopExit::Reconnect => {
                    // Dropping the consumer releases the unacked
                    // messages for redelivery.
                    drop(consumer);
                    failures += 1;
                    warn!(wait = ?backoff(failures), "broker channel abandoned, reconnecting");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff(failures)) => {}
                    }
                }
            }
        }

        info!("broker consumer stopped");
    }

    async fn consume(&mut self, consumer: &StreamConsumer, failures: &mut u32) -> LoopExit {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Drain what we have, then leave cleanly.
                    if self.pending > 0 {
                        let _ = self.flush(consumer).await;
                    }
                    return LoopExit::Shutdown;
                }
                message = consumer.recv() => message,
            };

            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "broker receive failed");
                    self.abandon_batch().await;
                    return LoopExit::Reconnect;
                }
            };

            match self.handle_message(&message).await {
                Ok(()) => self.pending += 1,
                Err(StoreError::Data(reason)) => {
                    // Bad payloads are logged, acked and forgotten.
                    warn!(%reason, "dropping undecodable message");
                    self.pending += 1;
                }
                Err(StoreError::DuplicateKey(reason)) => {
                    // Stream races resolve inside insert_stream; a
                    // duplicate surfacing here is a replayed row.
                    warn!(%reason, "dropping duplicate measurement");
                    self.pending += 1;
                }
                Err(StoreError::Interrupted) => {
                    self.abandon_batch().await;
                    return LoopExit::Shutdown;
                }
                Err(e) => {
                    warn!(error = %e, "store failure, requeueing current batch");
                    self.abandon_batch().await;
                    return LoopExit::Reconnect;
                }
            }

            if self.pending >= self.config.commit_freq {
                match self.flush(consumer).await {
                    Ok(()) => *failures = 0,
                    Err(StoreError::Interrupted) => return LoopExit::Shutdown,
                    Err(e) => {
                        warn!(error = %e, "batch commit failed, requeueing");
                        return LoopExit::Reconnect;
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, message: &BorrowedMessage<'_>) -> Result<(), StoreError> {
        let (test, source) = headers_of(message)?;
        let ts = message
            .timestamp()
            .to_millis()
            .map(|ms| ms / 1000)
            .ok_or_else(|| StoreError::Data("message carries no timestamp".to_string()))?;
        let raw = message
            .payload()
            .ok_or_else(|| StoreError::Data("message carries no payload".to_string()))?;

        let decoder = self
            .registry
            .decoder(&test)
            .ok_or_else(|| StoreError::Data(format!("unknown test: '{test}'")))?;
        let payload = decoder.decode(raw)?;

        let parser = self
            .registry
            .route(&test, &payload)
            .ok_or_else(|| StoreError::Data(format!("no parser for test '{test}'")))?;
        let spec = parser.spec();

        parser
            .process(&mut self.db, &self.bus, ts, &payload, &source)
            .await?;

        let colid = self.db.collection_id(spec.module, spec.modsubtype).await?;
        let checkpoint = self.batch_checkpoints.entry(colid).or_insert(ts);
        *checkpoint = (*checkpoint).max(ts);
        Ok(())
    }

    async fn flush(&mut self, consumer: &StreamConsumer) -> Result<(), StoreError> {
        self.db.commit_batch().await?;

        // Multi-ack everything up to the newest processed message.
        if let Err(e) = consumer.commit_consumer_state(CommitMode::Sync) {
            warn!(error = %e, "offset commit failed");
            return Err(StoreError::Operational(e.to_string()));
        }

        debug!(messages = self.pending, "batch committed");
        self.pending = 0;
        for (colid, ts) in self.batch_checkpoints.drain() {
            self.bus.publish_push(colid, ts);
        }
        Ok(())
    }

    async fn abandon_batch(&mut self) {
        self.pending = 0;
        self.batch_checkpoints.clear();
        if let Err(e) = self.db.rollback_batch().await {
            warn!(error = %e, "rollback failed, reconnecting to store");
            self.db.reconnect(Duration::from_secs(10)).await;
        }
    }
}

fn headers_of(message: &BorrowedMessage<'_>) -> Result<(String, String), StoreError> {
    let headers = message
        .headers()
        .ok_or_else(|| StoreError::Data("message carries no headers".to_string()))?;

    let mut test = None;
    let mut source = None;
    for header in headers.iter() {
        let value = header
            .value
            .and_then(|v| std::str::from_utf8(v).ok())
            .unwrap_or_default()
            .to_string();
        match header.key {
            "test" => test = Some(value),
            "source" => source = Some(value),
            _ => {}
        }
    }

    match (test, source) {
        (Some(test), Some(source)) => Ok((test, source)),
        (None, _) => Err(StoreError::Data("message carries no test header".to_string())),
        (_, None) => Err(StoreError::Data("message carries no source header".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(0), Duration::from_secs(10));
        assert_eq!(backoff(1), Duration::from_secs(10));
        assert_eq!(backoff(2), Duration::from_secs(20));
        assert_eq!(backoff(3), Duration::from_secs(40));
        assert_eq!(backoff(4), Duration::from_secs(80));
        assert_eq!(backoff(5), Duration::from_secs(120));
        assert_eq!(backoff(50), Duration::from_secs(120));
    }
}
