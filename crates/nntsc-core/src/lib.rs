//! # NNTSC Core - Shared Types and Abstractions
//!
//! This crate provides the vocabulary shared by the NNTSC ingestion
//! pipeline, the store gateway and the query server:
//!
//! - **Data model**: collections, streams, measurement rows and the
//!   column/index descriptions parsers use to declare their tables
//! - **Error taxonomy**: the [`StoreError`] kinds that drive retry,
//!   skip and abort decisions throughout the pipeline
//! - **Export events**: the messages carried by the export bus from the
//!   ingestion pipeline to the broker exchange and the query server
//! - **Configuration**: the YAML configuration model for the daemon
//! - **Payloads**: the decoded measurement payloads handed to parsers

pub mod config;
pub mod error;
pub mod events;
pub mod payload;
pub mod types;

pub use config::{BrokerConfig, Config, DatabaseConfig, ExporterConfig, RrdConfig};
pub use error::StoreError;
pub use events::{EventSender, ExportEvent};
pub use payload::{LpiStats, Payload};
pub use types::{
    Collection, CollectionSpec, ColumnSpec, ColumnType, DataRow, FieldValue, IndexSpec, Rollup,
    StreamKey, TableDefinitions, Timestamp,
};
