//! Schema bootstrap: the two fixed tables, per-collection stream and
//! data tables, the `most` aggregate and the optional rollup views.

use tracing::info;

use nntsc_core::{CollectionSpec, StoreError};

use crate::insert::DbInsert;

impl DbInsert {
    async fn ddl(&mut self, sql: &str) -> Result<(), StoreError> {
        self.raw_client().batch_execute(sql).await.map_err(Into::into)
    }

    /// Create the fixed tables and every parser-declared table that is
    /// missing, then make sure each collection is registered.
    pub async fn build_schema(&mut self, specs: &[CollectionSpec]) -> Result<(), StoreError> {
        self.ddl(
            "CREATE TABLE IF NOT EXISTS collections ( \
                 id SERIAL PRIMARY KEY, \
                 module VARCHAR NOT NULL, \
                 modsubtype VARCHAR NOT NULL, \
                 streamtable VARCHAR NOT NULL, \
                 datatable VARCHAR NOT NULL, \
                 UNIQUE (module, modsubtype))",
        )
        .await?;

        self.ddl(
            "CREATE TABLE IF NOT EXISTS streams ( \
                 id SERIAL PRIMARY KEY, \
                 collection INTEGER NOT NULL REFERENCES collections (id), \
                 name VARCHAR NOT NULL UNIQUE, \
                 firsttimestamp BIGINT, \
                 lasttimestamp BIGINT NOT NULL DEFAULT 0)",
        )
        .await?;
        self.ddl("CREATE INDEX IF NOT EXISTS index_streams_collection ON streams (collection)")
            .await?;

        self.create_most_aggregate().await?;

        for spec in specs {
            self.create_collection_tables(spec).await?;
            self.register_collection(spec).await?;
        }

        info!(collections = specs.len(), "database schema ready");
        Ok(())
    }

    /// The `most` aggregate: the statistically most common value, ties
    /// broken by ordering so results stay deterministic.
    async fn create_most_aggregate(&mut self) -> Result<(), StoreError> {
        self.ddl("DROP AGGREGATE IF EXISTS most (anyelement) CASCADE")
            .await?;
        self.ddl("DROP FUNCTION IF EXISTS most_final (anyarray)")
            .await?;
        self.ddl(
            "CREATE FUNCTION most_final (anyarray) RETURNS anyelement AS $$ \
                 SELECT a FROM unnest($1) a \
                 GROUP BY a ORDER BY count(*) DESC, a LIMIT 1 \
             $$ LANGUAGE SQL IMMUTABLE",
        )
        .await?;
        self.ddl(
            "CREATE AGGREGATE most (anyelement) ( \
                 SFUNC = array_append, \
                 STYPE = anyarray, \
                 FINALFUNC = most_final, \
                 INITCOND = '{}')",
        )
        .await?;
        Ok(())
    }

    async fn create_collection_tables(&mut self, spec: &CollectionSpec) -> Result<(), StoreError> {
        let mut stream_cols = vec![
            "stream_id INTEGER PRIMARY KEY REFERENCES streams (id)".to_string(),
        ];
        for col in spec.tables.stream_columns {
            // Quoted so stream attributes may use reserved words
            // ("user" in the lpi tables).
            let mut def = format!("\"{}\" {}", col.name, col.kind.sql());
            if !col.nullable {
                def.push_str(" NOT NULL");
            }
            if let Some(default) = col.default {
                def.push_str(&format!(" DEFAULT {default}"));
            }
            stream_cols.push(def);
        }
        let unique: Vec<String> = spec
            .tables
            .unique_columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect();
        stream_cols.push(format!("UNIQUE ({})", unique.join(", ")));

        self.ddl(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            spec.streamtable,
            stream_cols.join(", ")
        ))
        .await?;

        for index in spec.tables.stream_indexes {
            let cols: Vec<String> = index.columns.iter().map(|c| format!("\"{c}\"")).collect();
            self.ddl(&format!(
                "CREATE INDEX IF NOT EXISTS index_{}_{} ON {} ({})",
                spec.streamtable,
                index.columns.join("_"),
                spec.streamtable,
                cols.join(", ")
            ))
            .await?;
        }

        let mut data_cols = vec![
            "stream_id INTEGER NOT NULL REFERENCES streams (id)".to_string(),
            "timestamp BIGINT NOT NULL".to_string(),
        ];
        for col in spec.tables.data_columns {
            let mut def = format!("{} {}", col.name, col.kind.sql());
            if !col.nullable {
                def.push_str(" NOT NULL");
            }
            data_cols.push(def);
        }
        data_cols.push("PRIMARY KEY (stream_id, timestamp)".to_string());

        self.ddl(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) PARTITION BY RANGE (timestamp)",
            spec.datatable,
            data_cols.join(", ")
        ))
        .await?;

        for index in spec.tables.data_indexes {
            let cols = index.columns.join(", ");
            self.ddl(&format!(
                "CREATE INDEX IF NOT EXISTS index_{}_{} ON {} ({})",
                spec.datatable,
                index.columns.join("_"),
                spec.datatable,
                cols
            ))
            .await?;
        }

        Ok(())
    }

    async fn register_collection(&mut self, spec: &CollectionSpec) -> Result<(), StoreError> {
        self.raw_client()
            .execute(
                "INSERT INTO collections (module, modsubtype, streamtable, datatable) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (module, modsubtype) DO NOTHING",
                &[
                    &spec.module,
                    &spec.modsubtype,
                    &spec.streamtable,
                    &spec.datatable,
                ],
            )
            .await?;
        Ok(())
    }

    /// Materialize the rollups parsers declared, one view per
    /// collection, binned at five minutes.
    pub async fn create_rollup_views(&mut self, specs: &[CollectionSpec]) -> Result<(), StoreError> {
        for spec in specs {
            if spec.rollups.is_empty() {
                continue;
            }

            let mut selects = Vec::new();
            for rollup in spec.rollups {
                let func = match rollup.aggregate {
                    "mean" | "avg" => "avg",
                    "stddev" => "stddev",
                    "sum" => "sum",
                    "count" => "count",
                    "max" => "max",
                    "min" => "min",
                    other => {
                        return Err(StoreError::Coding(format!(
                            "unknown rollup aggregate {other} for {}",
                            spec.name()
                        )))
                    }
                };
                selects.push(format!(
                    "{func}({})::float8 AS {}",
                    rollup.column, rollup.label
                ));
            }

            self.ddl(&format!(
                "CREATE OR REPLACE VIEW cq_{table} AS \
                 SELECT stream_id, (timestamp - (timestamp % 300)) AS binstart, {cols} \
                 FROM {table} GROUP BY stream_id, binstart",
                table = spec.datatable,
                cols = selects.join(", ")
            ))
            .await?;
            info!(collection = %spec.name(), "registered rollup view");
        }
        Ok(())
    }
}
