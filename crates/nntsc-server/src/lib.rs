//! # NNTSC Server - Pipeline Tasks and Query Server
//!
//! The long-running tasks of the collector daemon:
//!
//! - [`bus`]: the export bus drain forwarding stream births and live
//!   records to the broker's outbound exchange and to in-process
//!   subscribers
//! - [`consumer`]: the broker consumer driving the parsers in batches
//!   with commit/ack discipline and reconnect backoff
//! - [`rrd`]: the RRD poller reading new samples from configured RRD
//!   files on a fixed cadence
//! - [`server`]: the TCP query server answering catalogue, history and
//!   subscription requests

pub mod bus;
pub mod consumer;
pub mod rrd;
pub mod server;

pub use bus::{BusSubscriptions, ExportDrain};
pub use consumer::BrokerConsumer;
pub use rrd::{CommandRrdSource, RrdPoller, RrdSource};
pub use server::QueryServer;
