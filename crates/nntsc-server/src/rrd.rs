//! RRD poller.
//!
//! Periodically reads new AVERAGE samples from the configured RRD
//! files and feeds them to the RRD parsers. The reader itself is an
//! external collaborator behind [`RrdSource`]; the shipped binding
//! shells out to the `rrdtool` program.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nntsc_core::{EventSender, FieldValue, StoreError};
use nntsc_parsers::{rrd_muninbytes, rrd_smokeping, RrdParser};
use nntsc_store::DbInsert;

#[derive(Debug, thiserror::Error)]
pub enum RrdError {
    #[error("rrdtool failed: {0}")]
    Tool(String),
    #[error("unparsable rrdtool output: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct RrdInfo {
    /// Sample resolution in seconds.
    pub step: i64,
    /// Rows held at the highest resolution.
    pub rows: i64,
}

#[derive(Debug, Clone)]
pub struct RrdFetch {
    pub step: i64,
    /// `(timestamp, cells)` pairs in ascending timestamp order.
    pub rows: Vec<(i64, Vec<Option<f64>>)>,
}

pub trait RrdSource: Send + Sync {
    /// Timestamp of the most recent sample.
    fn last(&self, path: &Path) -> Result<i64, RrdError>;

    fn info(&self, path: &Path) -> Result<RrdInfo, RrdError>;

    /// AVERAGE samples covering `(start, end]`.
    fn fetch(&self, path: &Path, start: i64, end: i64) -> Result<RrdFetch, RrdError>;
}

/// Production binding: the `rrdtool` command-line program.
pub struct CommandRrdSource;

impl CommandRrdSource {
    fn run(&self, args: &[&str]) -> Result<String, RrdError> {
        let output = std::process::Command::new("rrdtool").args(args).output()?;
        if !output.status.success() {
            return Err(RrdError::Tool(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RrdSource for CommandRrdSource {
    fn last(&self, path: &Path) -> Result<i64, RrdError> {
        let out = self.run(&["last", &path.to_string_lossy()])?;
        out.trim()
            .parse()
            .map_err(|_| RrdError::Parse(format!("bad 'last' output: {out}")))
    }

    fn info(&self, path: &Path) -> Result<RrdInfo, RrdError> {
        let out = self.run(&["info", &path.to_string_lossy()])?;
        let mut step = None;
        let mut rows = None;
        for line in out.lines() {
            let Some((key, value)) = line.split_once(" = ") else { continue };
            match key.trim() {
                "step" => step = value.trim().parse().ok(),
                "rra[0].rows" => rows = value.trim().parse().ok(),
                _ => {}
            }
        }
        match (step, rows) {
            (Some(step), Some(rows)) => Ok(RrdInfo { step, rows }),
            _ => Err(RrdError::Parse("info output missing step or rra rows".to_string())),
        }
    }

    fn fetch(&self, path: &Path, start: i64, end: i64) -> Result<RrdFetch, RrdError> {
        let out = self.run(&[
            "fetch",
            &path.to_string_lossy(),
            "AVERAGE",
            "-s",
            &start.to_string(),
            "-e",
            &end.to_string(),
        ])?;
        parse_fetch_output(&out)
    }
}

fn parse_fetch_output(out: &str) -> Result<RrdFetch, RrdError> {
    let mut rows = Vec::new();
    let mut previous_ts = None;
    let mut step = 0;

    for line in out.lines() {
        let line = line.trim();
        let Some((ts, cells)) = line.split_once(':') else { continue };
        let Ok(ts) = ts.trim().parse::<i64>() else { continue };

        let cells: Vec<Option<f64>> = cells
            .split_whitespace()
            .map(|cell| match cell {
                "nan" | "-nan" | "NaN" | "U" => None,
                other => other.parse::<f64>().ok(),
            })
            .collect();

        if let Some(previous) = previous_ts {
            step = ts - previous;
        }
        previous_ts = Some(ts);
        rows.push((ts, cells));
    }

    Ok(RrdFetch { step, rows })
}

/// Align the fetch window: pull `endts` back to a resolution boundary,
/// start from whichever is later of the last committed sample and the
/// oldest retained row, and never let the window invert.
pub fn rejig_times(last_sample: i64, minres: i64, highrows: i64, last_ts: i64) -> (i64, i64) {
    let mut endts = last_sample;
    if endts % minres != 0 {
        endts -= endts % minres;
    }
    let mut startts = endts - highrows * minres;
    if last_ts > startts {
        startts = last_ts;
    }
    if endts < startts {
        endts = startts;
    }
    (startts, endts)
}

enum PollOutcome {
    Continue,
    Retry,
    Halt,
}

struct RrdStream {
    stream_id: i32,
    subtype: &'static str,
    filename: PathBuf,
    minres: i64,
    highrows: i64,
    last_ts: i64,
    last_commit: i64,
}

pub struct RrdPoller<S: RrdSource> {
    source: S,
    db: DbInsert,
    bus: EventSender,
    parsers: HashMap<&'static str, Box<dyn RrdParser>>,
    rrds: Vec<RrdStream>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl<S: RrdSource> RrdPoller<S> {
    /// Create streams for every entry of the RRD list file, reload the
    /// poller state from the store and return a ready poller.
    pub async fn bootstrap(
        source: S,
        mut db: DbInsert,
        bus: EventSender,
        list: &Path,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, StoreError> {
        let mut parsers: HashMap<&'static str, Box<dyn RrdParser>> = HashMap::new();
        parsers.insert("smokeping", Box::new(rrd_smokeping::RrdSmokepingParser::new()));
        parsers.insert("muninbytes", Box::new(rrd_muninbytes::RrdMuninbytesParser::new()));

        for parser in parsers.values_mut() {
            let spec = parser.spec();
            for stream in db.select_streams(&spec).await? {
                parser.register_existing(&stream);
            }
        }

        let raw = std::fs::read_to_string(list)
            .map_err(|e| StoreError::Data(format!("unreadable RRD list {}: {e}", list.display())))?;

        for mut entry in parse_rrd_list(&raw) {
            let Some(subtype) = entry.get("type").cloned() else { continue };
            let Some(parser) = parsers.get_mut(subtype.as_str()) else {
                warn!(subtype, "ignoring RRD entry with unknown type");
                continue;
            };
            let Some(file) = entry.get("file").cloned() else {
                warn!("ignoring RRD entry without a file");
                continue;
            };

            match source.info(Path::new(&file)) {
                Ok(info) => {
                    entry.entry("minres".to_string()).or_insert(info.step.to_string());
                    entry.entry("highrows".to_string()).or_insert(info.rows.to_string());
                }
                Err(e) => {
                    warn!(file, error = %e, "cannot inspect RRD, skipping");
                    continue;
                }
            }

            match parser.insert_stream(&mut db, &bus, &entry).await {
                Ok(stream_id) => {
                    debug!(file, stream_id, "RRD stream ready");
                }
                Err(StoreError::Data(reason)) => {
                    warn!(file, %reason, "bad RRD stream description");
                }
                Err(e) => return Err(e),
            }
        }
        db.commit_batch().await?;

        // Poll state: one entry per registered RRD stream, resuming
        // from the stream's last committed timestamp.
        let mut rrds = Vec::new();
        for (&subtype, parser) in &parsers {
            let spec = parser.spec();
            for stream in db.select_streams(&spec).await? {
                let get_int = |name: &str| stream.get(name).and_then(FieldValue::as_integer);
                let Some(stream_id) = get_int("stream_id") else { continue };
                let Some(filename) = stream.get("filename").and_then(FieldValue::as_text) else {
                    continue;
                };
                rrds.push(RrdStream {
                    stream_id: stream_id as i32,
                    subtype,
                    filename: PathBuf::from(filename),
                    minres: get_int("minres").unwrap_or(300),
                    highrows: get_int("highrows").unwrap_or(1008),
                    last_ts: get_int("lasttimestamp").unwrap_or(0),
                    last_commit: get_int("lasttimestamp").unwrap_or(0),
                });
            }
        }

        info!(rrds = rrds.len(), "RRD poller ready");
        Ok(RrdPoller { source, db, bus, parsers, rrds, poll_interval, cancel })
    }

    pub async fn run(mut self) {
        loop {
            match self.poll_all().await {
                PollOutcome::Continue => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                PollOutcome::Retry => {
                    // Roll every stream back to its checkpoint so the
                    // next pass re-reads exactly what was lost.
                    warn!("reverting RRD timestamps to the last safe value");
                    for rrd in &mut self.rrds {
                        rrd.last_ts = rrd.last_commit;
                    }
                    let _ = self.db.rollback_batch().await;
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                    }
                }
                PollOutcome::Halt => break,
            }
        }
        info!("RRD poller stopped");
    }

    async fn poll_all(&mut self) -> PollOutcome {
        for index in 0..self.rrds.len() {
            if self.cancel.is_cancelled() {
                return PollOutcome::Halt;
            }
            match self.poll_one(index).await {
                Ok(()) => {}
                Err(StoreError::Interrupted) => return PollOutcome::Halt,
                Err(e) if e.is_transient() => return PollOutcome::Retry,
                Err(e) => {
                    // Bad data or a coding problem with one RRD should
                    // not stall the others.
                    warn!(error = %e, "error while inserting RRD data");
                }
            }
        }
        PollOutcome::Continue
    }

    async fn poll_one(&mut self, index: usize) -> Result<(), StoreError> {
        let (stream_id, subtype, filename, minres, highrows, last_ts) = {
            let rrd = &mut self.rrds[index];
            rrd.last_commit = rrd.last_ts;
            (
                rrd.stream_id,
                rrd.subtype,
                rrd.filename.clone(),
                rrd.minres,
                rrd.highrows,
                rrd.last_ts,
            )
        };

        let last_sample = match self.source.last(&filename) {
            Ok(ts) => ts,
            Err(e) => {
                warn!(file = %filename.display(), error = %e, "cannot read RRD");
                return Ok(());
            }
        };

        let (startts, endts) = rejig_times(last_sample, minres, highrows, last_ts);
        if endts <= startts {
            return Ok(());
        }

        let fetch = match self.source.fetch(&filename, startts, endts) {
            Ok(fetch) => fetch,
            Err(e) => {
                warn!(file = %filename.display(), error = %e, "RRD fetch failed");
                return Ok(());
            }
        };

        let parser = self
            .parsers
            .get_mut(subtype)
            .ok_or_else(|| StoreError::Coding(format!("no parser for RRD type {subtype}")))?;

        let mut newest = last_ts;
        for (ts, cells) in &fetch.rows {
            if *ts <= last_ts || *ts > endts {
                continue;
            }
            if cells.iter().all(Option::is_none) {
                continue;
            }
            parser
                .process_row(&mut self.db, &self.bus, stream_id, *ts, cells)
                .await?;
            newest = newest.max(*ts);
        }

        if newest > last_ts {
            self.db.update_last_timestamp(&[stream_id], newest).await?;
            self.db.commit_batch().await?;
            self.rrds[index].last_ts = newest;
        }
        Ok(())
    }
}

/// Parse the RRD list file: `key=value` lines, `#` comments, a `type`
/// line opening each new entry.
pub fn parse_rrd_list(raw: &str) -> Vec<HashMap<String, String>> {
    let mut entries = Vec::new();
    let mut current: HashMap<String, String> = HashMap::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else { continue };
        let (key, value) = (key.trim(), value.trim());

        if key == "type" && !current.is_empty() {
            entries.push(std::mem::take(&mut current));
        }
        current.insert(key.to_string(), value.to_string());
    }
    if !current.is_empty() {
        entries.push(current);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejig_aligns_to_resolution_boundary() {
        // 1000 % 300 != 0, so the end pulls back to 900.
        let (start, end) = rejig_times(1000, 300, 10, 0);
        assert_eq!(end, 900);
        assert_eq!(start, 900 - 10 * 300);
    }

    #[test]
    fn rejig_resumes_from_last_committed() {
        let (start, end) = rejig_times(3000, 300, 1008, 1500);
        assert_eq!(start, 1500);
        assert_eq!(end, 3000);
    }

    #[test]
    fn rejig_never_inverts_the_window() {
        let (start, end) = rejig_times(1000, 300, 10, 2000);
        assert_eq!(start, 2000);
        assert_eq!(end, 2000);
    }

    #[test]
    fn list_file_parses_into_entries() {
        let raw = "# smokeping targets\n\
                   type=smokeping\n\
                   file=/var/lib/smokeping/probe.rrd\n\
                   source=waikato\n\
                   host=example.org\n\
                   family=ipv4\n\
                   name=smokeping example\n\
                   \n\
                   type=muninbytes\n\
                   file=/var/lib/munin/sw1.rrd\n\
                   switch=sw1\n\
                   interface=ge-0/0/1\n\
                   direction=received\n\
                   name=munin sw1\n";
        let entries = parse_rrd_list(raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["type"], "smokeping");
        assert_eq!(entries[0]["host"], "example.org");
        assert_eq!(entries[1]["type"], "muninbytes");
        assert_eq!(entries[1]["interface"], "ge-0/0/1");
    }

    #[test]
    fn fetch_output_parses_timestamps_and_nans() {
        let out = "            loss  median\n\
                   \n\
                   900: 0.0 1.2e-02\n\
                   1200: nan nan\n\
                   1500: 1.0 2.0e-02\n";
        let fetch = parse_fetch_output(out).unwrap();
        assert_eq!(fetch.rows.len(), 3);
        assert_eq!(fetch.step, 300);
        assert_eq!(fetch.rows[0].0, 900);
        assert_eq!(fetch.rows[1].1, vec![None, None]);
        assert_eq!(fetch.rows[2].1, vec![Some(1.0), Some(0.02)]);
    }
}
