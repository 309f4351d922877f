//! Export bus drain.
//!
//! A single task owns the receiving end of the bus queue and fans each
//! event out twice: to the broker's outbound exchange and to every
//! in-process subscriber (query-server connections). The producer side
//! never blocks on a slow exchange or a slow client; droppable events
//! are shed instead, while stream births are retried until delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nntsc_core::{BrokerConfig, ExportEvent};

/// How long a stream birth may wait for room in one subscriber queue
/// before that subscriber counts as overflowed.
const STREAM_SEND_TIMEOUT: Duration = Duration::from_secs(5);

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ExportEvent>,
    /// Cancelled when the subscriber's queue overflows; the owning
    /// connection must notify its client and disconnect.
    evicted: CancellationToken,
}

/// Registry of in-process subscribers. The query server adds one entry
/// per client connection; entries disappear when their receiver is
/// dropped or when their bounded queue overflows.
#[derive(Default)]
pub struct BusSubscriptions {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl BusSubscriptions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subscriber with the given queue depth. The returned
    /// token fires if the queue overflows, at which point no further
    /// events will be delivered to this subscriber.
    pub fn subscribe(&self, depth: usize) -> (mpsc::Receiver<ExportEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(depth);
        let evicted = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap()
            .push(Subscriber { id, tx, evicted: evicted.clone() });
        debug!(subscriber = id, "export bus subscriber added");
        (rx, evicted)
    }

    /// Events undeliverable because a subscriber queue overflowed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn fan_out(&self, event: &ExportEvent) {
        // Snapshot the sender list so a subscriber appearing mid-send
        // does not deadlock with the registry lock held across awaits.
        let senders: Vec<(u64, mpsc::Sender<ExportEvent>, CancellationToken)> = {
            let subs = self.subscribers.lock().unwrap();
            subs.iter()
                .map(|s| (s.id, s.tx.clone(), s.evicted.clone()))
                .collect()
        };

        let mut gone = Vec::new();
        for (id, tx, evicted) in senders {
            let overflowed = if event.droppable() {
                match tx.try_send(event.clone()) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            } else {
                // Stream births may wait briefly for room, but a stuck
                // client must not stall delivery to everyone else.
                match tokio::time::timeout(STREAM_SEND_TIMEOUT, tx.send(event.clone())).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => false,
                    Err(_) => true,
                }
            };

            if overflowed {
                // The connection owning this queue cannot keep up;
                // evict it rather than shedding its events silently.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber = id, "subscriber queue overflowed, evicting");
                evicted.cancel();
            }
            gone.push(id);
        }

        if !gone.is_empty() {
            let mut subs = self.subscribers.lock().unwrap();
            subs.retain(|s| !gone.contains(&s.id));
        }
    }
}

/// The drain task: owns the queue receiver and the broker producer.
pub struct ExportDrain {
    rx: mpsc::Receiver<ExportEvent>,
    producer: FutureProducer,
    exchange: String,
    subscriptions: Arc<BusSubscriptions>,
    cancel: CancellationToken,
    shed: u64,
}

impl ExportDrain {
    pub fn new(
        config: &BrokerConfig,
        rx: mpsc::Receiver<ExportEvent>,
        subscriptions: Arc<BusSubscriptions>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap())
            .set("message.timeout.ms", "30000");
        if !config.password.is_empty() {
            client_config
                .set("security.protocol", "sasl_plaintext")
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", &config.username)
                .set("sasl.password", &config.password);
        }
        let producer = client_config.create()?;

        Ok(ExportDrain {
            rx,
            producer,
            exchange: config.exchange.clone(),
            subscriptions,
            cancel,
            shed: 0,
        })
    }

    pub async fn run(mut self) {
        info!(exchange = %self.exchange, "export drain running");
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            // Local subscribers first: the query server must see a
            // stream birth before any of its live rows.
            self.subscriptions.fan_out(&event).await;
            self.forward_to_broker(&event).await;
        }
        info!(shed = self.shed, "export drain stopped");
    }

    async fn forward_to_broker(&mut self, event: &ExportEvent) {
        let Some(topic) = event.topic() else { return };
        let topic = topic.to_string();

        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "unencodable export event");
                return;
            }
        };

        loop {
            let record = FutureRecord::to(&self.exchange)
                .key(&topic)
                .payload(&payload);
            match self.producer.send(record, Duration::from_secs(0)).await {
                Ok(_) => return,
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _))
                    if event.droppable() =>
                {
                    self.shed += 1;
                    return;
                }
                Err((e, _)) => {
                    if event.droppable() {
                        self.shed += 1;
                        warn!(error = %e, "dropping undeliverable export event");
                        return;
                    }
                    // Stream births must reach the exchange; keep
                    // trying until shutdown.
                    warn!(error = %e, "stream birth not delivered, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nntsc_core::DataRow;

    fn live(ts: i64) -> ExportEvent {
        ExportEvent::Live {
            collection: "amp_icmp".into(),
            stream_id: 1,
            timestamp: ts,
            row: DataRow::new(),
        }
    }

    fn birth(id: i32) -> ExportEvent {
        ExportEvent::StreamBirth {
            collection_id: 1,
            collection: "amp_icmp".into(),
            stream_id: id,
            attributes: DataRow::new(),
        }
    }

    #[tokio::test]
    async fn overflowing_subscribers_are_evicted() {
        let subs = BusSubscriptions::new();
        let (mut rx, evicted) = subs.subscribe(1);

        subs.fan_out(&live(1)).await;
        subs.fan_out(&live(2)).await;

        assert_eq!(subs.dropped(), 1);
        assert!(evicted.is_cancelled());
        assert_eq!(subs.subscribers.lock().unwrap().len(), 0);

        // What made it into the queue before the overflow is still
        // readable; nothing arrives afterwards.
        assert!(matches!(
            rx.recv().await.unwrap(),
            ExportEvent::Live { timestamp: 1, .. }
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_births_evict_after_the_timeout() {
        let subs = BusSubscriptions::new();
        let (_rx, evicted) = subs.subscribe(1);

        subs.fan_out(&live(1)).await;
        // The queue is full and nobody is reading; the birth must not
        // stall the drain forever.
        subs.fan_out(&birth(5)).await;

        assert!(evicted.is_cancelled());
        assert_eq!(subs.dropped(), 1);
        assert_eq!(subs.subscribers.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned_without_eviction() {
        let subs = BusSubscriptions::new();
        let (rx, evicted) = subs.subscribe(1);
        drop(rx);

        subs.fan_out(&birth(1)).await;
        assert_eq!(subs.subscribers.lock().unwrap().len(), 0);
        assert!(!evicted.is_cancelled());
        assert_eq!(subs.dropped(), 0);
    }

    #[tokio::test]
    async fn births_are_delivered_before_subsequent_lives() {
        let subs = BusSubscriptions::new();
        let (mut rx, _evicted) = subs.subscribe(8);

        subs.fan_out(&birth(5)).await;
        subs.fan_out(&live(10)).await;

        assert!(matches!(rx.recv().await.unwrap(), ExportEvent::StreamBirth { stream_id: 5, .. }));
        assert!(matches!(rx.recv().await.unwrap(), ExportEvent::Live { .. }));
    }
}
