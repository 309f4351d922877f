//! Read side of the store gateway.
//!
//! Queries execute on a dedicated connection with a portal bound inside
//! a transaction, so result sets stream back in fixed-size chunks and
//! never materialize server-side state past the transaction. Rows are
//! handed to the caller through a bounded channel as [`QueryChunk`]s,
//! ordered by `(label, timestamp)`; dropping the receiving end cancels
//! the query at the next chunk boundary.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_postgres::types::ToSql;
use tracing::{debug, warn};
use uuid::Uuid;

use nntsc_core::{Collection, DataRow, DatabaseConfig, StoreError, Timestamp};

use crate::cache::{stream_active, StreamCache};
use crate::connection::DbConnection;
use crate::rows::row_to_datarow;

/// Rows fetched from a portal per round trip.
const FETCH_SIZE: i32 = 100;

/// Stream ids grouped under client-chosen labels.
pub type Labels = HashMap<String, Vec<i32>>;

/// One chunk of query results for a single label.
#[derive(Debug, Clone)]
pub struct QueryChunk {
    pub label: String,
    pub rows: Vec<DataRow>,
    /// Which column carries the representative timestamp for each row.
    pub ts_column: &'static str,
    /// Requested binsize, or the inferred measurement cadence for
    /// aggregated queries.
    pub binsize: i64,
    /// Set on the final chunk of each label.
    pub last_in_label: bool,
}

struct CollectionTables {
    datatable: String,
    streamtable: String,
    data_columns: Vec<String>,
}

/// The query engine. One selector per query-server connection; never
/// shared across tasks.
pub struct DbSelector {
    conn: DbConnection,
    cache: Arc<StreamCache>,
    selector_id: String,
    tables: HashMap<i32, CollectionTables>,
}

impl DbSelector {
    pub async fn connect(
        config: &DatabaseConfig,
        cache: Arc<StreamCache>,
    ) -> Result<Self, StoreError> {
        let conn = DbConnection::connect(config).await?;
        let selector_id = Uuid::new_v4().simple().to_string();
        debug!(selector = %selector_id, "query connection established");
        Ok(DbSelector { conn, cache, selector_id, tables: HashMap::new() })
    }

    pub fn id(&self) -> &str {
        &self.selector_id
    }

    /// The full collection catalogue.
    pub async fn list_collections(&mut self) -> Result<Vec<Collection>, StoreError> {
        let rows = self
            .conn
            .client()
            .query(
                "SELECT id, module, modsubtype, streamtable, datatable \
                 FROM collections ORDER BY id",
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| Collection {
                id: row.get(0),
                module: row.get(1),
                modsubtype: row.get(2),
                streamtable: row.get(3),
                datatable: row.get(4),
            })
            .collect())
    }

    pub async fn collection_named(&mut self, name: &str) -> Result<Collection, StoreError> {
        self.list_collections()
            .await?
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| StoreError::Data(format!("unknown collection {name}")))
    }

    /// Column names of the stream table and the data table for a
    /// collection, in declaration order.
    pub async fn collection_schema(
        &mut self,
        col_id: i32,
    ) -> Result<(Vec<String>, Vec<String>), StoreError> {
        let tables = self.tables(col_id).await?;
        let streamtable = tables.streamtable.clone();
        let datatable = tables.datatable.clone();

        let stream_cols = self.table_columns(&streamtable).await?;
        let data_cols = self.table_columns(&datatable).await?;
        Ok((stream_cols, data_cols))
    }

    /// Streams of a collection with id greater than `min_stream_id`,
    /// joined with their common attributes. Clients page through new
    /// streams with this.
    pub async fn streams_for_collection(
        &mut self,
        col_id: i32,
        min_stream_id: i32,
    ) -> Result<Vec<DataRow>, StoreError> {
        let tables = self.tables(col_id).await?;
        let sql = format!(
            "SELECT st.*, s.name, s.firsttimestamp, s.lasttimestamp \
             FROM {} st JOIN streams s ON s.id = st.stream_id \
             WHERE st.stream_id > $1 ORDER BY st.stream_id",
            tables.streamtable
        );
        let rows = self.conn.client().query(&sql, &[&min_stream_id]).await?;
        rows.iter().map(row_to_datarow).collect()
    }

    /// Drop the streams whose `[first, last]` window does not intersect
    /// `[start, end]` from each label, filling cache misses from the
    /// store.
    pub async fn filter_active_streams(
        &mut self,
        col_id: i32,
        labels: &Labels,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Labels, StoreError> {
        let datatable = self.tables(col_id).await?.datatable.clone();

        let mut filtered = Labels::new();
        for (label, streams) in labels {
            let mut keep = Vec::new();
            for &sid in streams {
                let first = match self.cache.first(&datatable, sid) {
                    Some(ts) => ts,
                    None => {
                        let ts = self.query_timestamp(&datatable, sid, "min").await?;
                        self.cache.store_first(&datatable, sid, ts);
                        ts
                    }
                };
                let last = match self.cache.last(&datatable, sid) {
                    Some(ts) => ts,
                    None => {
                        let ts = self.query_timestamp(&datatable, sid, "max").await?;
                        self.cache.store_last(&datatable, sid, ts);
                        ts
                    }
                };
                if stream_active(first, last, start, end) {
                    keep.push(sid);
                }
            }
            filtered.insert(label.clone(), keep);
        }
        Ok(filtered)
    }

    /// Raw history: every selected column of every row in the window,
    /// per label, ordered by timestamp.
    pub async fn select_data(
        &mut self,
        col_id: i32,
        labels: &Labels,
        selectcols: &[String],
        start: Timestamp,
        end: Timestamp,
        out: &mpsc::Sender<QueryChunk>,
    ) -> Result<(), StoreError> {
        let tables = self.tables(col_id).await?;
        let datatable = tables.datatable.clone();
        let mut cols = sanitise_columns(&tables.data_columns, selectcols);
        ensure_column(&mut cols, "timestamp");
        ensure_column(&mut cols, "stream_id");

        for (label, streams) in ordered_labels(labels) {
            if streams.is_empty() {
                send_chunk(out, empty_chunk(label, "timestamp", 0)).await?;
                continue;
            }

            let mut params = SqlParams::new();
            let sql = format!(
                "SELECT {} FROM {datatable} \
                 WHERE timestamp >= {} AND timestamp <= {} AND stream_id = ANY({}) \
                 ORDER BY timestamp",
                cols.join(", "),
                params.push(start),
                params.push(end),
                params.push(streams.clone()),
            );

            self.run_portal(&sql, params, label, "timestamp", 0, None, out)
                .await?;
        }
        Ok(())
    }

    /// Binned and aggregated history. With `binsize == 0` and no
    /// grouping columns this degenerates to a raw query over the
    /// aggregation columns.
    #[allow(clippy::too_many_arguments)]
    pub async fn select_aggregated(
        &mut self,
        col_id: i32,
        labels: &Labels,
        aggcols: &[(String, String)],
        start: Timestamp,
        end: Timestamp,
        groupcols: &[String],
        binsize: i64,
        out: &mpsc::Sender<QueryChunk>,
    ) -> Result<(), StoreError> {
        if binsize == 0 && groupcols.is_empty() {
            let plain: Vec<String> = aggcols.iter().map(|(c, _)| c.clone()).collect();
            return self.select_data(col_id, labels, &plain, start, end, out).await;
        }

        let tables = self.tables(col_id).await?;
        let datatable = tables.datatable.clone();

        let mut groups = sanitise_columns(&tables.data_columns, groupcols);
        groups.retain(|g| g != "stream_id" && g != "timestamp");

        let aggcols = filter_aggregation_columns(&tables.data_columns, aggcols);
        let aggexprs = apply_aggregation(&aggcols)?;
        if aggexprs.is_empty() {
            return Err(StoreError::Data("no usable aggregation columns".to_string()));
        }

        for (label, streams) in ordered_labels(labels) {
            if streams.is_empty() {
                let tscol = if binsize > 0 { "binstart" } else { "min_timestamp" };
                send_chunk(out, empty_chunk(label, tscol, binsize)).await?;
                continue;
            }

            let mut params = SqlParams::new();
            let where_clause = format!(
                "timestamp >= {} AND timestamp <= {} AND stream_id = ANY({})",
                params.push(start),
                params.push(end),
                params.push(streams.clone()),
            );

            let mut select_parts = groups.clone();
            let (sql, tscol) = if binsize > 0 {
                let bin = format!("(timestamp - (timestamp % {}::bigint))", params.push(binsize));
                select_parts.push(format!("{bin} AS binstart"));
                select_parts.extend(aggexprs.iter().cloned());
                // The maximum timestamp in the bin is the best
                // representative point when plotting the series.
                select_parts.push("max(timestamp) AS timestamp".to_string());

                let mut group_by = vec!["binstart".to_string()];
                group_by.extend(groups.iter().cloned());
                (
                    format!(
                        "SELECT {} FROM {datatable} WHERE {where_clause} \
                         GROUP BY {} ORDER BY binstart",
                        select_parts.join(", "),
                        group_by.join(", "),
                    ),
                    "binstart",
                )
            } else {
                select_parts.extend(aggexprs.iter().cloned());
                select_parts.push("min(timestamp) AS min_timestamp".to_string());
                select_parts.push("max(timestamp) AS timestamp".to_string());
                let group_by = if groups.is_empty() {
                    String::new()
                } else {
                    format!(" GROUP BY {}", groups.join(", "))
                };
                (
                    format!(
                        "SELECT {} FROM {datatable} WHERE {where_clause}\
                         {group_by} ORDER BY min_timestamp",
                        select_parts.join(", "),
                    ),
                    "min_timestamp",
                )
            };

            self.run_portal(
                &sql,
                params,
                label,
                tscol,
                binsize,
                Some(FrequencyEstimator::new(binsize)),
                out,
            )
            .await?;
        }
        Ok(())
    }

    /// Per-bin percentile breakdown: the main column is split into ten
    /// ntiles per bin, each aggregated with `ntile_fn`, and delivered
    /// as a sorted `values` array. Remaining columns aggregate across
    /// the per-ntile values with `other_fn`.
    #[allow(clippy::too_many_arguments)]
    pub async fn select_percentile(
        &mut self,
        col_id: i32,
        labels: &Labels,
        start: Timestamp,
        end: Timestamp,
        binsize: i64,
        ntile_columns: &[String],
        other_columns: &[String],
        ntile_fn: &str,
        other_fn: &str,
        out: &mpsc::Sender<QueryChunk>,
    ) -> Result<(), StoreError> {
        let tables = self.tables(col_id).await?;
        let datatable = tables.datatable.clone();

        let ntile_cols = sanitise_columns(&tables.data_columns, ntile_columns);
        let Some(ntile_col) = ntile_cols.first().cloned() else {
            return Err(StoreError::Data("no usable percentile column".to_string()));
        };
        if ntile_cols.len() > 1 {
            warn!(extra = ntile_cols.len() - 1, "ignoring extra percentile columns");
        }
        let mut others = sanitise_columns(&tables.data_columns, other_columns);
        others.retain(|c| c != &ntile_col && c != "timestamp" && c != "stream_id");

        let ntile_agg = aggregate_function(ntile_fn)?;
        let other_agg = aggregate_function(other_fn)?;

        for (label, streams) in ordered_labels(labels) {
            if streams.is_empty() {
                send_chunk(out, empty_chunk(label, "binstart", binsize)).await?;
                continue;
            }

            let mut params = SqlParams::new();
            // A non-positive binsize means one bin across the window.
            let effective_bin = if binsize > 0 { binsize } else { (end - start).max(1) };
            let bin_param = params.push(effective_bin);
            let bin = format!("(timestamp - (timestamp % {bin_param}::bigint))");

            let mut inner_cols = vec![
                "timestamp".to_string(),
                ntile_col.clone(),
                format!("{bin} AS binstart"),
                format!(
                    "ntile(10) OVER (PARTITION BY {bin} ORDER BY {ntile_col}) AS tile"
                ),
            ];
            inner_cols.extend(others.iter().cloned());

            let mut pertile_cols = vec![
                "binstart".to_string(),
                "tile".to_string(),
                "max(timestamp) AS ts".to_string(),
                format!("{ntile_agg}({ntile_col})::float8 AS tileval"),
            ];
            for other in &others {
                pertile_cols.push(format!("{other_agg}({other})::float8 AS {other}"));
            }

            let mut outer_cols = vec![
                "binstart".to_string(),
                "max(ts) AS timestamp".to_string(),
                "array_agg(tileval ORDER BY tileval) AS \"values\"".to_string(),
            ];
            for other in &others {
                outer_cols.push(format!("{other_agg}({other})::float8 AS {other}"));
            }

            let sql = format!(
                "WITH measurements AS ( \
                     SELECT {inner} FROM {datatable} \
                     WHERE timestamp >= {p_start} AND timestamp <= {p_end} \
                       AND stream_id = ANY({p_streams}) AND {ntile_col} IS NOT NULL \
                 ), pertile AS ( \
                     SELECT {pertile} FROM measurements GROUP BY binstart, tile \
                 ) SELECT {outer} FROM pertile GROUP BY binstart ORDER BY binstart",
                inner = inner_cols.join(", "),
                p_start = params.push(start),
                p_end = params.push(end),
                p_streams = params.push(streams.clone()),
                pertile = pertile_cols.join(", "),
                outer = outer_cols.join(", "),
            );

            self.run_portal(&sql, params, label, "binstart", binsize, None, out)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_portal(
        &mut self,
        sql: &str,
        params: SqlParams,
        label: String,
        ts_column: &'static str,
        binsize: i64,
        mut estimator: Option<FrequencyEstimator>,
        out: &mpsc::Sender<QueryChunk>,
    ) -> Result<(), StoreError> {
        let refs = params.as_refs();
        let tx = self.conn.client_mut().transaction().await?;
        let portal = tx.bind(sql, &refs).await?;

        loop {
            let fetched = tx.query_portal(&portal, FETCH_SIZE).await?;
            let done = fetched.len() < FETCH_SIZE as usize;

            let mut rows = Vec::with_capacity(fetched.len());
            for row in &fetched {
                let converted = row_to_datarow(row)?;
                if let Some(est) = estimator.as_mut() {
                    est.observe(&converted, ts_column);
                }
                rows.push(converted);
            }

            let chunk_binsize = match &estimator {
                Some(est) => est.estimate(),
                None => binsize,
            };
            send_chunk(
                out,
                QueryChunk {
                    label: label.clone(),
                    rows,
                    ts_column,
                    binsize: chunk_binsize,
                    last_in_label: done,
                },
            )
            .await?;

            if done {
                break;
            }
        }

        // Read-only work; rolling back closes the portal.
        tx.rollback().await?;
        Ok(())
    }

    async fn query_timestamp(
        &mut self,
        datatable: &str,
        stream_id: i32,
        agg: &str,
    ) -> Result<Timestamp, StoreError> {
        let sql = format!("SELECT {agg}(timestamp) FROM {datatable} WHERE stream_id = $1");
        let row = self.conn.client().query_one(&sql, &[&stream_id]).await?;
        let ts: Option<i64> = row.get(0);
        Ok(ts.unwrap_or(0))
    }

    async fn tables(&mut self, col_id: i32) -> Result<&CollectionTables, StoreError> {
        if !self.tables.contains_key(&col_id) {
            let row = self
                .conn
                .client()
                .query_opt(
                    "SELECT streamtable, datatable FROM collections WHERE id = $1",
                    &[&col_id],
                )
                .await?
                .ok_or_else(|| StoreError::Data(format!("unknown collection id {col_id}")))?;

            let streamtable: String = row.get(0);
            let datatable: String = row.get(1);
            let data_columns = self.table_columns(&datatable).await?;
            self.tables.insert(
                col_id,
                CollectionTables { datatable, streamtable, data_columns },
            );
        }
        Ok(&self.tables[&col_id])
    }

    async fn table_columns(&mut self, table: &str) -> Result<Vec<String>, StoreError> {
        let rows = self
            .conn
            .client()
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_name = $1 ORDER BY ordinal_position",
                &[&table],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }
}

async fn send_chunk(
    out: &mpsc::Sender<QueryChunk>,
    chunk: QueryChunk,
) -> Result<(), StoreError> {
    // A dropped receiver means the client went away; treat it as a
    // cancellation rather than an error worth reporting.
    out.send(chunk).await.map_err(|_| StoreError::Interrupted)
}

fn empty_chunk(label: String, ts_column: &'static str, binsize: i64) -> QueryChunk {
    QueryChunk { label, rows: Vec::new(), ts_column, binsize, last_in_label: true }
}

fn ordered_labels(labels: &Labels) -> Vec<(String, Vec<i32>)> {
    let mut ordered: Vec<(String, Vec<i32>)> = labels
        .iter()
        .map(|(label, streams)| (label.clone(), streams.clone()))
        .collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));
    ordered
}

/// Keep only columns that exist in the table, preserving request order
/// and dropping duplicates. This is what stands between client input
/// and the generated SQL.
fn sanitise_columns(available: &[String], wanted: &[String]) -> Vec<String> {
    let mut kept = Vec::new();
    for col in wanted {
        if available.iter().any(|a| a == col) && !kept.contains(col) {
            kept.push(col.clone());
        }
    }
    kept
}

fn ensure_column(cols: &mut Vec<String>, name: &str) {
    if !cols.iter().any(|c| c == name) {
        cols.push(name.to_string());
    }
}

fn filter_aggregation_columns(
    available: &[String],
    aggcols: &[(String, String)],
) -> Vec<(String, String)> {
    aggcols
        .iter()
        .filter(|(col, _)| available.iter().any(|a| a == col))
        .cloned()
        .collect()
}

fn aggregate_function(name: &str) -> Result<&'static str, StoreError> {
    Ok(match name {
        "avg" | "average" | "mean" => "avg",
        "min" => "min",
        "max" => "max",
        "sum" => "sum",
        "count" => "count",
        "stddev" => "stddev",
        "most" => "most",
        other => {
            return Err(StoreError::Data(format!(
                "unsupported aggregator function: {other}"
            )))
        }
    })
}

/// Build the SELECT expressions for an aggregated query. Columns that
/// appear more than once are renamed `<col>_<fn>` so the result keeps
/// one column per aggregation.
fn apply_aggregation(aggcols: &[(String, String)]) -> Result<Vec<String>, StoreError> {
    let names: Vec<&String> = aggcols.iter().map(|(c, _)| c).collect();
    let rename = {
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        unique.len() < names.len()
    };

    let mut exprs = Vec::new();
    for (col, func) in aggcols {
        let label = if rename { format!("{col}_{func}") } else { col.clone() };

        let expr = if func == "most_array" {
            // Array-valued columns: join, take the mode of the joined
            // strings, split again.
            format!("string_to_array(most(array_to_string({col}, ',')), ',') AS {label}")
        } else {
            let sqlfunc = aggregate_function(func)?;
            match sqlfunc {
                // Integer averages come back as numerics; force a type
                // the row converter understands.
                "avg" | "stddev" | "sum" => format!("{sqlfunc}({col})::float8 AS {label}"),
                "count" => format!("count({col})::bigint AS {label}"),
                _ => format!("{sqlfunc}({col}) AS {label}"),
            }
        };
        exprs.push(expr);
    }
    Ok(exprs)
}

/// Infers the underlying measurement cadence of an aggregated result
/// by tallying the differences between consecutive row timestamps.
///
/// When at least 90% of consecutive bins sit exactly one requested
/// binsize apart the request was coarser than the measurement frequency
/// and the requested binsize is the answer. Otherwise the strongest
/// mode of the timestamp differences is used, provided it covers at
/// least half of them, clamped to no less than 300 seconds.
pub struct FrequencyEstimator {
    requested: i64,
    diffs: HashMap<i64, u32>,
    perfect_bins: u32,
    total_diffs: u32,
    rows: u64,
    last_ts: i64,
    last_bin: i64,
}

impl FrequencyEstimator {
    pub fn new(requested: i64) -> Self {
        FrequencyEstimator {
            requested,
            diffs: HashMap::new(),
            perfect_bins: 0,
            total_diffs: 0,
            rows: 0,
            last_ts: 0,
            last_bin: 0,
        }
    }

    fn observe(&mut self, row: &DataRow, ts_column: &str) {
        let Some(ts) = row.get("timestamp").and_then(|v| v.as_integer()) else {
            return;
        };
        let bin = row
            .get(ts_column)
            .and_then(|v| v.as_integer())
            .unwrap_or(ts);

        self.rows += 1;
        if self.rows > 1 {
            if bin - self.last_bin == self.requested {
                self.perfect_bins += 1;
            }
            *self.diffs.entry(ts - self.last_ts).or_insert(0) += 1;
            self.total_diffs += 1;
        }
        self.last_ts = ts;
        self.last_bin = bin;
    }

    pub fn observe_timestamps(&mut self, ts: i64, bin: i64) {
        let mut row = DataRow::new();
        row.insert("timestamp".to_string(), ts.into());
        row.insert("binstart".to_string(), bin.into());
        self.observe(&row, "binstart");
    }

    pub fn estimate(&self) -> i64 {
        let fallback = self.requested.max(300);
        if self.rows <= 1 || self.total_diffs == 0 {
            return fallback;
        }

        if self.perfect_bins as f64 / self.total_diffs as f64 > 0.9 {
            return self.requested;
        }

        // Require a strong mode: at least half of all differences.
        let strongest = self.diffs.iter().max_by_key(|(_, count)| **count);
        match strongest {
            Some((diff, count)) if *count as f64 >= 0.5 * self.total_diffs as f64 => {
                (*diff).max(300)
            }
            _ => fallback,
        }
    }
}

struct SqlParams {
    values: Vec<Box<dyn ToSql + Sync + Send>>,
}

impl SqlParams {
    fn new() -> Self {
        SqlParams { values: Vec::new() }
    }

    /// Bind a value and get back its placeholder.
    fn push(&mut self, value: impl ToSql + Sync + Send + 'static) -> String {
        self.values.push(Box::new(value));
        format!("${}", self.values.len())
    }

    fn as_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn sanitise_drops_unknown_and_duplicate_columns() {
        let available = strings(&["stream_id", "timestamp", "median", "loss"]);
        let wanted = strings(&["median", "median", "loss; DROP TABLE streams", "loss"]);
        assert_eq!(sanitise_columns(&available, &wanted), strings(&["median", "loss"]));
    }

    #[test]
    fn aggregation_exprs_rename_on_duplicates() {
        let aggcols = vec![
            ("median".to_string(), "avg".to_string()),
            ("median".to_string(), "stddev".to_string()),
        ];
        let exprs = apply_aggregation(&aggcols).unwrap();
        assert_eq!(exprs[0], "avg(median)::float8 AS median_avg");
        assert_eq!(exprs[1], "stddev(median)::float8 AS median_stddev");
    }

    #[test]
    fn aggregation_exprs_keep_name_when_unique() {
        let aggcols = vec![("loss".to_string(), "sum".to_string())];
        let exprs = apply_aggregation(&aggcols).unwrap();
        assert_eq!(exprs[0], "sum(loss)::float8 AS loss");
    }

    #[test]
    fn most_array_round_trips_through_text() {
        let aggcols = vec![("path".to_string(), "most_array".to_string())];
        let exprs = apply_aggregation(&aggcols).unwrap();
        assert_eq!(
            exprs[0],
            "string_to_array(most(array_to_string(path, ',')), ',') AS path"
        );
    }

    #[test]
    fn unknown_aggregator_is_rejected() {
        let aggcols = vec![("loss".to_string(), "pg_sleep".to_string())];
        assert!(apply_aggregation(&aggcols).is_err());
    }

    #[test]
    fn estimator_prefers_requested_binsize_when_bins_line_up() {
        let mut est = FrequencyEstimator::new(60);
        for i in 0..20 {
            est.observe_timestamps(1000 + i * 60, 960 + i * 60);
        }
        assert_eq!(est.estimate(), 60);
    }

    #[test]
    fn estimator_falls_back_to_measurement_frequency() {
        // Requested 60s bins over a 600s cadence: bins are sparse, so
        // the mode of the timestamp differences wins.
        let mut est = FrequencyEstimator::new(60);
        for i in 0..20 {
            est.observe_timestamps(1000 + i * 600, 960 + i * 600);
        }
        assert_eq!(est.estimate(), 600);
    }

    #[test]
    fn estimator_clamps_fast_cadence_to_five_minutes() {
        // 30s measurement cadence with 10s bins: the mode is 30s but
        // anything under five minutes is rounded up.
        let mut est = FrequencyEstimator::new(10);
        for i in 0..20 {
            est.observe_timestamps(1000 + i * 30, 1000 + i * 30);
        }
        assert_eq!(est.estimate(), 300);
    }

    #[test]
    fn estimator_defaults_when_too_few_rows() {
        let est = FrequencyEstimator::new(60);
        assert_eq!(est.estimate(), 300);

        let est = FrequencyEstimator::new(900);
        assert_eq!(est.estimate(), 900);
    }

    #[test]
    fn estimator_needs_a_strong_mode() {
        let mut est = FrequencyEstimator::new(60);
        // Wildly varying cadence, no mode reaching half the diffs.
        let mut ts = 1000;
        for (i, step) in [100, 700, 250, 900, 401, 333, 512, 645].iter().enumerate() {
            est.observe_timestamps(ts, 960 + i as i64 * 60);
            ts += step;
        }
        assert_eq!(est.estimate(), 300);
    }
}
