//! Write side of the store gateway.
//!
//! One `DbInsert` is owned by one ingestion task. Inserts accumulate in
//! an open transaction until [`DbInsert::commit_batch`] makes them
//! durable; a failed batch rolls back leaving no rows visible, and the
//! owning task decides whether to retry (transient errors) or drop the
//! offending input (data errors).

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio_postgres::types::ToSql;
use tracing::{debug, warn};

use nntsc_core::{
    CollectionSpec, ColumnSpec, DataRow, DatabaseConfig, FieldValue, StoreError, Timestamp,
};

use crate::connection::DbConnection;
use crate::{partition_start, PARTITION_WEEK};

pub struct DbInsert {
    conn: DbConnection,
    config: DatabaseConfig,
    in_transaction: bool,
    /// Partition start timestamps already known to exist, per data
    /// table. Cleared on rollback since partition DDL participates in
    /// the transaction.
    partitions: HashMap<String, BTreeSet<i64>>,
    collection_ids: HashMap<(String, String), i32>,
}

impl DbInsert {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let conn = DbConnection::connect(config).await?;
        Ok(DbInsert {
            conn,
            config: config.clone(),
            in_transaction: false,
            partitions: HashMap::new(),
            collection_ids: HashMap::new(),
        })
    }

    /// Tear down the current connection and build a fresh one. Any open
    /// transaction is gone with the old connection.
    pub async fn reconnect(&mut self, retrywait: Duration) {
        crate::connection::note_reconnect("insert gateway");
        self.conn = DbConnection::connect_retrying(&self.config, retrywait).await;
        self.in_transaction = false;
        self.partitions.clear();
    }

    /// Whether the fixed tables exist, i.e. whether the schema has
    /// been built in this database.
    pub async fn schema_ready(&mut self) -> Result<bool, StoreError> {
        let row = self
            .conn
            .client()
            .query_one(
                "SELECT count(*) FROM pg_tables WHERE tablename IN ('collections', 'streams')",
                &[],
            )
            .await?;
        let found: i64 = row.get(0);
        Ok(found == 2)
    }

    /// Load the partitions that already exist so the first insert into
    /// each week does not re-issue DDL.
    pub async fn prime_partitions(&mut self) -> Result<(), StoreError> {
        let rows = self
            .conn
            .client()
            .query(
                "SELECT tablename::text FROM pg_tables WHERE tablename LIKE 'part_%'",
                &[],
            )
            .await?;

        for row in rows {
            let name: String = row.get(0);
            let Some(stripped) = name.strip_prefix("part_") else { continue };
            let Some((table, start)) = stripped.rsplit_once('_') else { continue };
            let Ok(start) = start.parse::<i64>() else { continue };
            self.partitions
                .entry(table.to_string())
                .or_default()
                .insert(start);
        }
        Ok(())
    }

    /// Direct client access for the schema bootstrap, which runs
    /// outside the batching discipline.
    pub(crate) fn raw_client(&self) -> &tokio_postgres::Client {
        self.conn.client()
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            self.conn.client().batch_execute("BEGIN").await?;
            self.in_transaction = true;
        }
        Ok(())
    }

    /// Commit everything inserted since the last batch boundary.
    pub async fn commit_batch(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Ok(());
        }
        let result = self.conn.client().batch_execute("COMMIT").await;
        self.in_transaction = false;
        if let Err(e) = result {
            self.partitions.clear();
            return Err(e.into());
        }
        Ok(())
    }

    /// Discard everything inserted since the last batch boundary.
    pub async fn rollback_batch(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.partitions.clear();
        self.conn.client().batch_execute("ROLLBACK").await?;
        Ok(())
    }

    pub async fn collection_id(
        &mut self,
        module: &str,
        modsubtype: &str,
    ) -> Result<i32, StoreError> {
        let key = (module.to_string(), modsubtype.to_string());
        if let Some(id) = self.collection_ids.get(&key) {
            return Ok(*id);
        }

        let row = self
            .conn
            .client()
            .query_opt(
                "SELECT id FROM collections WHERE module = $1 AND modsubtype = $2",
                &[&module, &modsubtype],
            )
            .await?;

        match row {
            Some(row) => {
                let id: i32 = row.get(0);
                self.collection_ids.insert(key, id);
                Ok(id)
            }
            None => Err(StoreError::Coding(format!(
                "no collection registered for {module}:{modsubtype}"
            ))),
        }
    }

    /// Register a stream, returning its id and whether it was created
    /// by this call. Idempotent on the collection's unique key: losing
    /// a creation race hands back the winner's id.
    pub async fn insert_stream(
        &mut self,
        spec: &CollectionSpec,
        name: &str,
        first_ts: Timestamp,
        props: &DataRow,
    ) -> Result<(i32, bool), StoreError> {
        self.begin().await?;

        if let Some(existing) = self.find_stream(spec, props).await? {
            return Ok((existing, false));
        }

        let colid = self.collection_id(spec.module, spec.modsubtype).await?;

        self.conn
            .client()
            .batch_execute("SAVEPOINT newstream")
            .await?;

        match self.create_stream(spec, colid, name, first_ts, props).await {
            Ok(id) => {
                self.conn
                    .client()
                    .batch_execute("RELEASE SAVEPOINT newstream")
                    .await?;
                debug!(stream_id = id, collection = %spec.name(), "created stream");
                Ok((id, true))
            }
            Err(StoreError::DuplicateKey(_)) => {
                // Another writer registered the same key between our
                // lookup and the insert.
                self.conn
                    .client()
                    .batch_execute("ROLLBACK TO SAVEPOINT newstream")
                    .await?;
                match self.find_stream(spec, props).await? {
                    Some(existing) => Ok((existing, false)),
                    None => Err(StoreError::DuplicateKey(format!(
                        "stream key conflict for {} but no existing row",
                        spec.name()
                    ))),
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn find_stream(
        &mut self,
        spec: &CollectionSpec,
        props: &DataRow,
    ) -> Result<Option<i32>, StoreError> {
        let mut clauses = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

        for (n, col) in spec.tables.unique_columns.iter().enumerate() {
            let value = props.get(*col).ok_or_else(|| {
                StoreError::Data(format!("stream attributes missing key column {col}"))
            })?;
            let column = stream_column(spec, col)?;
            clauses.push(match column.kind.bind_cast() {
                Some(cast) => format!("\"{col}\" = CAST(${} AS {cast})", n + 1),
                None => format!("\"{col}\" = ${}", n + 1),
            });
            params.push(value);
        }

        let sql = format!(
            "SELECT stream_id FROM {} WHERE {}",
            spec.streamtable,
            clauses.join(" AND ")
        );
        let row = self.conn.client().query_opt(&sql, &params).await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn create_stream(
        &mut self,
        spec: &CollectionSpec,
        colid: i32,
        name: &str,
        first_ts: Timestamp,
        props: &DataRow,
    ) -> Result<i32, StoreError> {
        let row = self
            .conn
            .client()
            .query_one(
                "INSERT INTO streams (collection, name, firsttimestamp, lasttimestamp) \
                 VALUES ($1, $2, $3, $3) RETURNING id",
                &[&colid, &name, &first_ts],
            )
            .await?;
        let stream_id: i32 = row.get(0);

        let mut columns = vec!["stream_id".to_string()];
        let mut placeholders = vec!["$1".to_string()];
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&stream_id];

        for col in spec.tables.stream_columns {
            let Some(value) = props.get(col.name) else { continue };
            columns.push(format!("\"{}\"", col.name));
            let n = params.len() + 1;
            placeholders.push(match col.kind.bind_cast() {
                Some(cast) => format!("CAST(${n} AS {cast})"),
                None => format!("${n}"),
            });
            params.push(value);
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            spec.streamtable,
            columns.join(", "),
            placeholders.join(", ")
        );
        self.conn.client().execute(&sql, &params).await?;

        Ok(stream_id)
    }

    /// Insert one measurement row. Duplicate `(stream_id, timestamp)`
    /// rows are ignored so replays stay idempotent.
    pub async fn insert_data(
        &mut self,
        spec: &CollectionSpec,
        stream_id: i32,
        ts: Timestamp,
        row: &DataRow,
    ) -> Result<(), StoreError> {
        self.begin().await?;
        self.ensure_partition(spec.datatable, ts).await?;

        let mut columns = vec!["stream_id".to_string(), "timestamp".to_string()];
        let mut placeholders = vec!["$1".to_string(), "$2".to_string()];
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&stream_id, &ts];
        let null = FieldValue::Null;

        for col in spec.tables.data_columns {
            let value = row.get(col.name).unwrap_or(&null);
            columns.push(col.name.to_string());
            let n = params.len() + 1;
            placeholders.push(match col.kind.bind_cast() {
                Some(cast) => format!("CAST(${n} AS {cast})"),
                None => format!("${n}"),
            });
            params.push(value);
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (stream_id, timestamp) DO NOTHING",
            spec.datatable,
            columns.join(", "),
            placeholders.join(", ")
        );
        self.conn.client().execute(&sql, &params).await?;
        Ok(())
    }

    /// Advance `lasttimestamp` for the given streams. Only ever moves
    /// forward.
    pub async fn update_last_timestamp(
        &mut self,
        stream_ids: &[i32],
        ts: Timestamp,
    ) -> Result<(), StoreError> {
        if stream_ids.is_empty() {
            return Ok(());
        }
        self.begin().await?;
        self.conn
            .client()
            .execute(
                "UPDATE streams SET lasttimestamp = $1 \
                 WHERE id = ANY($2) AND lasttimestamp < $1",
                &[&ts, &stream_ids],
            )
            .await?;
        Ok(())
    }

    /// All streams of a collection joined with their common attributes,
    /// used to reload parser key maps at startup.
    pub async fn select_streams(
        &mut self,
        spec: &CollectionSpec,
    ) -> Result<Vec<DataRow>, StoreError> {
        let colid = match self.collection_id(spec.module, spec.modsubtype).await {
            Ok(id) => id,
            // Schema not built yet; nothing to reload.
            Err(StoreError::Coding(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let sql = format!(
            "SELECT st.*, s.name, s.firsttimestamp, s.lasttimestamp \
             FROM {} st JOIN streams s ON s.id = st.stream_id \
             WHERE s.collection = $1 ORDER BY st.stream_id",
            spec.streamtable
        );
        let rows = self.conn.client().query(&sql, &[&colid]).await?;
        rows.iter().map(crate::rows::row_to_datarow).collect()
    }

    async fn ensure_partition(&mut self, table: &str, ts: Timestamp) -> Result<(), StoreError> {
        let start = partition_start(ts);
        if self
            .partitions
            .get(table)
            .is_some_and(|known| known.contains(&start))
        {
            return Ok(());
        }

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS part_{table}_{start} PARTITION OF {table} \
             FOR VALUES FROM ({start}) TO ({end})",
            end = start + PARTITION_WEEK
        );
        if let Err(e) = self.conn.client().batch_execute(&sql).await {
            warn!(table, start, error = %e, "partition creation failed");
            return Err(e.into());
        }

        self.partitions.entry(table.to_string()).or_default().insert(start);
        Ok(())
    }
}

fn stream_column<'a>(
    spec: &'a CollectionSpec,
    name: &str,
) -> Result<&'a ColumnSpec, StoreError> {
    spec.tables
        .stream_columns
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| StoreError::Coding(format!("unknown stream column {name}")))
}
