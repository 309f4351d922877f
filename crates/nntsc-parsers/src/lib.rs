//! # NNTSC Parsers - Measurement Normalization
//!
//! Parsers turn decoded measurement payloads into streams and data
//! rows. Each parser declares its tables, keeps a local map from
//! stream key to stream id, registers unseen streams lazily and
//! publishes a stream-birth event exactly once per key plus one live
//! event per inserted row.
//!
//! Three families are implemented:
//!
//! - **Active probing** (`amp`): icmp, tcpping, dns, http, traceroute
//!   and throughput, with one stream and one row per probed target
//! - **Passive classification** (`lpi`): byte, packet, flow and user
//!   counters, one stream per protocol, suppressed until the first
//!   non-zero value
//! - **RRD** (`rrd`): smokeping and muninbytes, driven by the RRD
//!   poller with raw sample cells rather than broker payloads

pub mod amp_dns;
pub mod amp_http;
pub mod amp_icmp;
pub mod amp_tcpping;
pub mod amp_throughput;
pub mod amp_traceroute;
pub mod base;
pub mod decode;
pub mod lpi;
pub mod rrd_muninbytes;
pub mod rrd_smokeping;

use std::collections::HashMap;

use async_trait::async_trait;

use nntsc_core::{CollectionSpec, DataRow, EventSender, Payload, StoreError, Timestamp};
use nntsc_store::DbInsert;

pub use decode::{JsonLpiDecoder, JsonTestDecoder, PayloadDecoder};

/// A parser driven by the RRD poller: streams are declared up front
/// from the RRD list file, and data arrives as raw sample cells.
#[async_trait]
pub trait RrdParser: Send {
    fn spec(&self) -> CollectionSpec;

    /// Load an existing stream row into the local key→id map.
    fn register_existing(&mut self, stream: &DataRow);

    /// Register (or look up) the stream described by an RRD list entry.
    async fn insert_stream(
        &mut self,
        db: &mut DbInsert,
        bus: &EventSender,
        params: &HashMap<String, String>,
    ) -> Result<i32, StoreError>;

    /// Convert one fetched sample row and insert it.
    async fn process_row(
        &mut self,
        db: &mut DbInsert,
        bus: &EventSender,
        stream_id: i32,
        ts: Timestamp,
        cells: &[Option<f64>],
    ) -> Result<(), StoreError>;
}

/// A measurement parser driven by the broker consumer.
#[async_trait]
pub trait Parser: Send {
    /// The collection this parser feeds.
    fn spec(&self) -> CollectionSpec;

    /// Load an existing stream row into the local key→id map. Called
    /// once per stream at startup.
    fn register_existing(&mut self, stream: &DataRow);

    /// Normalize one payload: look up or create the streams it touches,
    /// insert their rows and advance their last timestamps.
    async fn process(
        &mut self,
        db: &mut DbInsert,
        bus: &EventSender,
        ts: Timestamp,
        payload: &Payload,
        source: &str,
    ) -> Result<(), StoreError>;
}

/// All parsers known to the daemon, addressable by the `test` header
/// carried on broker messages.
pub struct ParserRegistry {
    parsers: HashMap<&'static str, Box<dyn Parser>>,
    decoders: HashMap<&'static str, Box<dyn PayloadDecoder>>,
}

impl ParserRegistry {
    /// The full parser set.
    pub fn standard() -> Self {
        let mut registry = ParserRegistry {
            parsers: HashMap::new(),
            decoders: HashMap::new(),
        };

        registry.add("icmp", Box::new(amp_icmp::AmpIcmpParser::new()));
        registry.add("tcpping", Box::new(amp_tcpping::AmpTcppingParser::new()));
        registry.add("dns", Box::new(amp_dns::AmpDnsParser::new()));
        registry.add("http", Box::new(amp_http::AmpHttpParser::new()));
        registry.add("traceroute", Box::new(amp_traceroute::AmpTracerouteParser::new()));
        registry.add("throughput", Box::new(amp_throughput::AmpThroughputParser::new()));
        registry.add("lpi_bytes", Box::new(lpi::LpiParser::bytes()));
        registry.add("lpi_packets", Box::new(lpi::LpiParser::packets()));
        registry.add("lpi_flows", Box::new(lpi::LpiParser::flows()));
        registry.add("lpi_users", Box::new(lpi::LpiParser::users()));

        for test in ["icmp", "tcpping", "dns", "http", "traceroute", "throughput"] {
            registry.decoders.insert(test, Box::new(JsonTestDecoder));
        }
        registry.decoders.insert("lpi", Box::new(JsonLpiDecoder));

        registry
    }

    fn add(&mut self, name: &'static str, parser: Box<dyn Parser>) {
        self.parsers.insert(name, parser);
    }

    /// Table declarations for every collection the daemon owns,
    /// including the RRD collections the poller feeds.
    pub fn collection_specs(&self) -> Vec<CollectionSpec> {
        let mut specs: Vec<CollectionSpec> = self.parsers.values().map(|p| p.spec()).collect();
        specs.push(rrd_smokeping::SPEC);
        specs.push(rrd_muninbytes::SPEC);
        specs.sort_by_key(|s| (s.module, s.modsubtype));
        specs
    }

    pub fn decoder(&self, test: &str) -> Option<&dyn PayloadDecoder> {
        self.decoders.get(test).map(|d| d.as_ref())
    }

    /// The parser responsible for a decoded payload. LPI reports are
    /// routed by their metric; everything else by test name.
    pub fn route(&mut self, test: &str, payload: &Payload) -> Option<&mut Box<dyn Parser>> {
        let name = match (test, payload) {
            ("lpi", Payload::Lpi(stats)) => lpi::family_for_metric(&stats.metric)?,
            _ => test,
        };
        self.parsers.get_mut(name)
    }

    /// Reload every parser's key→id map from the store.
    pub async fn register_existing(&mut self, db: &mut DbInsert) -> Result<usize, StoreError> {
        let mut total = 0;
        for parser in self.parsers.values_mut() {
            let spec = parser.spec();
            for stream in db.select_streams(&spec).await? {
                parser.register_existing(&stream);
                total += 1;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_broker_test() {
        let mut registry = ParserRegistry::standard();
        for test in ["icmp", "tcpping", "dns", "http", "traceroute", "throughput"] {
            assert!(registry.decoder(test).is_some(), "{test} has no decoder");
            let payload = Payload::TestResults(vec![]);
            assert!(registry.route(test, &payload).is_some(), "{test} has no parser");
        }
        assert!(registry.decoder("lpi").is_some());
        assert!(registry.decoder("smokeping").is_none());
    }

    #[test]
    fn lpi_reports_route_by_metric() {
        let mut registry = ParserRegistry::standard();
        for (metric, family) in [
            ("bytes", "lpi_bytes"),
            ("pkts", "lpi_packets"),
            ("new_flows", "lpi_flows"),
            ("activeusers", "lpi_users"),
        ] {
            let payload = Payload::Lpi(nntsc_core::LpiStats {
                monitor: "mon".into(),
                user: "all".into(),
                dir: "in".into(),
                freq: 300,
                metric: metric.into(),
                timestamp: 1000,
                results: vec![],
            });
            let parser = registry.route("lpi", &payload).expect(metric);
            assert_eq!(parser.spec().name(), family);
        }

        let unknown = Payload::Lpi(nntsc_core::LpiStats {
            monitor: "mon".into(),
            user: "all".into(),
            dir: "in".into(),
            freq: 300,
            metric: "weather".into(),
            timestamp: 1000,
            results: vec![],
        });
        assert!(registry.route("lpi", &unknown).is_none());
    }

    #[test]
    fn collection_specs_are_unique() {
        let registry = ParserRegistry::standard();
        let specs = registry.collection_specs();
        assert_eq!(specs.len(), 12);
        let mut names: Vec<String> = specs.iter().map(|s| s.name()).collect();
        names.dedup();
        assert_eq!(names.len(), 12);
    }
}
