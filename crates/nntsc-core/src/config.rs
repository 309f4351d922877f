//! YAML configuration model for the collector daemon.
//!
//! Every optional value falls back to a documented default so a minimal
//! configuration only has to name the database and the broker host.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub rrd: RrdConfig,
    /// Optional time-series store. Carried through configuration only;
    /// rollups are materialized in the relational store.
    #[serde(default)]
    pub timeseries: Option<TimeseriesConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, serde_yaml::Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| <serde_yaml::Error as serde::de::Error>::custom(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Seconds a cached stream last-timestamp stays valid in the query
    /// engine before it is refreshed from the store.
    #[serde(default = "default_cachetime")]
    pub cachetime: u64,
}

impl DatabaseConfig {
    /// Connection string in the libpq key/value format.
    pub fn connstr(&self) -> String {
        let mut s = format!(
            "host={} port={} dbname={} user={}",
            self.host, self.port, self.name, self.user
        );
        if !self.password.is_empty() {
            s.push_str(&format!(" password={}", self.password));
        }
        s
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_broker_user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// The ingest queue the consumer subscribes to.
    #[serde(default = "default_broker_queue")]
    pub queue: String,
    /// Messages accumulated before the store batch is committed and the
    /// broker is acked.
    #[serde(default = "default_commit_freq")]
    pub commit_freq: usize,
    /// Outbound exchange live/stream events are forwarded to.
    #[serde(default = "default_export_exchange")]
    pub exchange: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: default_db_host(),
            port: default_broker_port(),
            username: default_broker_user(),
            password: String::new(),
            queue: default_broker_queue(),
            commit_freq: default_commit_freq(),
            exchange: default_export_exchange(),
        }
    }
}

impl BrokerConfig {
    pub fn bootstrap(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_export_port")]
    pub port: u16,
    /// Upper bound on undelivered export events queued in-process.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        ExporterConfig {
            listen: default_listen(),
            port: default_export_port(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrdConfig {
    /// File listing the RRDs to poll; empty means RRD polling is off.
    #[serde(default)]
    pub list: Option<PathBuf>,
    #[serde(default = "default_rrd_interval")]
    pub poll_interval: u64,
}

impl Default for RrdConfig {
    fn default() -> Self {
        RrdConfig { list: None, poll_interval: default_rrd_interval() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeseriesConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: String,
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_cachetime() -> u64 {
    300
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_user() -> String {
    "amp".to_string()
}

fn default_broker_queue() -> String {
    "amp-nntsc".to_string()
}

fn default_commit_freq() -> usize {
    50
}

fn default_export_exchange() -> String {
    "nntsc-export".to_string()
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_export_port() -> u16 {
    61234
}

fn default_queue_depth() -> usize {
    4096
}

fn default_rrd_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "database:\n  name: nntsc\n  user: cuz\n",
        )
        .unwrap();
        assert_eq!(cfg.broker.username, "amp");
        assert_eq!(cfg.broker.port, 5672);
        assert_eq!(cfg.broker.queue, "amp-nntsc");
        assert_eq!(cfg.broker.commit_freq, 50);
        assert_eq!(cfg.rrd.poll_interval, 30);
        assert!(cfg.timeseries.is_none());
        assert_eq!(cfg.database.connstr(), "host=localhost port=5432 dbname=nntsc user=cuz");
    }
}
