//! Postgres-backed stores: COPY staging + merge bulk writes, pgvector
//! nearest-neighbor search, trigram headword index.
//!
//! Workers open their own connection on their own runtime; a store handle is
//! one connection plus the prepared schema.

use super::{
    Checkpoint, CheckpointStore, EntryFilter, EntryStore, InsertOutcome, RawStore, StoreProvider,
    StoredRaw, TransformLogStore,
};
use crate::embedding::SharedVectorCache;
use crate::entry::Entry;
use crate::errors::PipelineError;
use crate::pipeline::TransformStep;
use crate::records::{Origin, RawRecord};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::SinkExt;
use pgvector::Vector;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_postgres::types::{Json, ToSql};
use tokio_postgres::{Client, NoTls, Row, Transaction};

/// Rows accumulated per COPY chunk before flushing to the socket.
const COPY_CHUNK_ROWS: usize = 512;

/// Default embedding dimension when the provider is not told otherwise.
pub const DEFAULT_DIMENSION: usize = 768;

async fn connect(database_url: &str) -> Result<Client, PipelineError> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(|err| {
            PipelineError::transient(format!("failed to connect to Postgres: {err}"))
        })?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("postgres connection error: {err}");
        }
    });
    Ok(client)
}

fn db_err(context: &str, err: tokio_postgres::Error) -> PipelineError {
    PipelineError::transient(format!("{context}: {err}"))
}

fn schema_err(context: &str, err: tokio_postgres::Error) -> PipelineError {
    PipelineError::fatal(format!("{context}: {err}"))
}

/// Appends one COPY text-format field, escaping delimiter bytes.
fn copy_field(buf: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => buf.push_str("\\\\"),
            '\t' => buf.push_str("\\t"),
            '\n' => buf.push_str("\\n"),
            '\r' => buf.push_str("\\r"),
            _ => buf.push(ch),
        }
    }
}

fn copy_null(buf: &mut String) {
    buf.push_str("\\N");
}

fn vector_literal(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 8 + 2);
    out.push('[');
    for (i, value) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&value.to_string());
    }
    out.push(']');
    out
}

/// Streams pre-rendered COPY text rows into `stage_sql`.
async fn copy_rows(
    transaction: &Transaction<'_>,
    stage_sql: &str,
    rows: impl Iterator<Item = String>,
) -> Result<(), PipelineError> {
    let sink = transaction
        .copy_in(stage_sql)
        .await
        .map_err(|err| db_err("failed to open COPY stream", err))?;
    futures_util::pin_mut!(sink);

    let mut buf = String::new();
    let mut pending = 0usize;
    for row in rows {
        buf.push_str(&row);
        pending += 1;
        if pending >= COPY_CHUNK_ROWS {
            sink.send(Bytes::from(std::mem::take(&mut buf)))
                .await
                .map_err(|err| db_err("failed to write COPY chunk", err))?;
            pending = 0;
        }
    }
    if !buf.is_empty() {
        sink.send(Bytes::from(buf))
            .await
            .map_err(|err| db_err("failed to write COPY chunk", err))?;
    }
    sink.finish()
        .await
        .map_err(|err| db_err("failed to finish COPY stream", err))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Raw store
// ---------------------------------------------------------------------------

/// Postgres raw record store.
pub struct PgRawStore {
    client: tokio::sync::Mutex<Client>,
}

impl PgRawStore {
    /// Connects and ensures the raw tables exist.
    pub async fn connect(database_url: &str) -> Result<Self, PipelineError> {
        let client = connect(database_url).await?;
        let store = Self {
            client: tokio::sync::Mutex::new(client),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), PipelineError> {
        let client = self.client.lock().await;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS raw_records (
                    id BIGSERIAL PRIMARY KEY,
                    source_id TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    checksum VARCHAR(64) NOT NULL UNIQUE,
                    file_path TEXT NOT NULL,
                    line_no BIGINT NOT NULL,
                    ingested_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE INDEX IF NOT EXISTS raw_records_source_idx
                    ON raw_records (source_id, id);
                CREATE TABLE IF NOT EXISTS transform_log (
                    raw_checksum VARCHAR(64) NOT NULL,
                    step_name TEXT NOT NULL,
                    step_version TEXT NOT NULL,
                    at_epoch_ms BIGINT NOT NULL,
                    duration_ms BIGINT NOT NULL,
                    ok BOOLEAN NOT NULL,
                    error TEXT
                );
                CREATE INDEX IF NOT EXISTS transform_log_checksum_idx
                    ON transform_log (raw_checksum);",
            )
            .await
            .map_err(|err| schema_err("failed to ensure raw schema", err))
    }

    fn render_row(record: &RawRecord) -> String {
        let mut row = String::new();
        copy_field(&mut row, &record.source_id);
        row.push('\t');
        copy_field(
            &mut row,
            &serde_json::to_string(&record.payload).unwrap_or_else(|_| "null".to_string()),
        );
        row.push('\t');
        copy_field(&mut row, &record.checksum);
        row.push('\t');
        copy_field(&mut row, &record.origin.file_path);
        row.push('\t');
        row.push_str(&record.origin.line_no.to_string());
        row.push('\n');
        row
    }
}

#[async_trait]
impl RawStore for PgRawStore {
    async fn bulk_insert(&self, records: &[RawRecord]) -> Result<InsertOutcome, PipelineError> {
        if records.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let mut client = self.client.lock().await;
        let transaction = client
            .transaction()
            .await
            .map_err(|err| db_err("failed to begin raw insert transaction", err))?;

        transaction
            .batch_execute(
                "CREATE TEMPORARY TABLE raw_stage (
                    source_id TEXT,
                    payload JSONB,
                    checksum VARCHAR(64),
                    file_path TEXT,
                    line_no BIGINT
                ) ON COMMIT DROP",
            )
            .await
            .map_err(|err| db_err("failed to create raw staging table", err))?;

        copy_rows(
            &transaction,
            "COPY raw_stage (source_id, payload, checksum, file_path, line_no) FROM STDIN",
            records.iter().map(Self::render_row),
        )
        .await?;

        // A checksum that already exists must carry the same payload.
        let conflict = transaction
            .query_opt(
                "SELECT r.checksum
                 FROM raw_records r
                 JOIN raw_stage s ON s.checksum = r.checksum
                 WHERE s.payload <> r.payload
                 LIMIT 1",
                &[],
            )
            .await
            .map_err(|err| db_err("failed integrity check on raw batch", err))?;
        if let Some(row) = conflict {
            let checksum: String = row.get(0);
            return Err(PipelineError::integrity(format!(
                "checksum {checksum} already stored with a different payload"
            ))
            .with_item(checksum));
        }

        let inserted = transaction
            .execute(
                "INSERT INTO raw_records (source_id, payload, checksum, file_path, line_no)
                 SELECT DISTINCT ON (checksum) source_id, payload, checksum, file_path, line_no
                 FROM raw_stage
                 ORDER BY checksum, line_no
                 ON CONFLICT (checksum) DO NOTHING",
                &[],
            )
            .await
            .map_err(|err| db_err("failed to merge raw batch", err))?;

        transaction
            .commit()
            .await
            .map_err(|err| db_err("failed to commit raw batch", err))?;

        Ok(InsertOutcome {
            inserted: inserted as usize,
            deduplicated: records.len() - inserted as usize,
        })
    }

    async fn scan(
        &self,
        source_id: Option<&str>,
        after_cursor: u64,
        limit: usize,
    ) -> Result<Vec<StoredRaw>, PipelineError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT id, source_id, payload, checksum, file_path, line_no
                 FROM raw_records
                 WHERE ($1::text IS NULL OR source_id = $1) AND id > $2
                 ORDER BY id
                 LIMIT $3",
                &[&source_id, &(after_cursor as i64), &(limit as i64)],
            )
            .await
            .map_err(|err| db_err("failed to scan raw records", err))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let payload: Json<Value> = row.get("payload");
                StoredRaw {
                    cursor: row.get::<_, i64>("id") as u64,
                    record: RawRecord {
                        source_id: row.get("source_id"),
                        payload: payload.0,
                        checksum: row.get("checksum"),
                        origin: Origin {
                            file_path: row.get("file_path"),
                            line_no: row.get::<_, i64>("line_no") as u64,
                        },
                    },
                }
            })
            .collect())
    }

    async fn count(&self, source_id: Option<&str>) -> Result<u64, PipelineError> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM raw_records WHERE ($1::text IS NULL OR source_id = $1)",
                &[&source_id],
            )
            .await
            .map_err(|err| db_err("failed to count raw records", err))?;
        Ok(row.get::<_, i64>(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Entry store
// ---------------------------------------------------------------------------

/// Postgres typed entry store with a pgvector cosine index and a trigram
/// index over headwords.
pub struct PgEntryStore {
    client: tokio::sync::Mutex<Client>,
    dimension: usize,
}

impl PgEntryStore {
    /// Connects and ensures the entry schema and indexes exist.
    pub async fn connect(database_url: &str, dimension: usize) -> Result<Self, PipelineError> {
        let client = connect(database_url).await?;
        let store = Self {
            client: tokio::sync::Mutex::new(client),
            dimension,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), PipelineError> {
        let client = self.client.lock().await;
        client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS vector")
            .await
            .map_err(|err| schema_err("failed to ensure pgvector extension", err))?;
        client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS pg_trgm")
            .await
            .map_err(|err| schema_err("failed to ensure pg_trgm extension", err))?;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS entries (
                    id VARCHAR(32) PRIMARY KEY,
                    headword TEXT NOT NULL,
                    ipa TEXT NOT NULL,
                    language VARCHAR(3) NOT NULL,
                    definition TEXT NOT NULL,
                    etymology TEXT,
                    pos_tag TEXT,
                    embedding VECTOR({dims}),
                    raw_checksum VARCHAR(64) NOT NULL,
                    source_id TEXT NOT NULL,
                    pipeline_fingerprint TEXT NOT NULL,
                    quality DOUBLE PRECISION NOT NULL,
                    validation_errors JSONB NOT NULL DEFAULT '[]',
                    created_at_epoch_ms BIGINT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS entries_language_idx ON entries (language, id);
                CREATE INDEX IF NOT EXISTS entries_source_idx ON entries (source_id, id);
                CREATE INDEX IF NOT EXISTS entries_headword_trgm_idx
                    ON entries USING GIN (headword gin_trgm_ops);
                CREATE INDEX IF NOT EXISTS entries_embedding_idx
                    ON entries USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100);",
                dims = self.dimension
            ))
            .await
            .map_err(|err| schema_err("failed to ensure entry schema", err))
    }

    fn render_row(entry: &Entry) -> String {
        let mut row = String::new();
        copy_field(&mut row, &entry.id);
        row.push('\t');
        copy_field(&mut row, &entry.headword);
        row.push('\t');
        copy_field(&mut row, &entry.ipa);
        row.push('\t');
        copy_field(&mut row, &entry.language);
        row.push('\t');
        copy_field(&mut row, &entry.definition);
        row.push('\t');
        match &entry.etymology {
            Some(etymology) => copy_field(&mut row, etymology),
            None => copy_null(&mut row),
        }
        row.push('\t');
        match &entry.pos_tag {
            Some(pos_tag) => copy_field(&mut row, pos_tag),
            None => copy_null(&mut row),
        }
        row.push('\t');
        match &entry.embedding {
            Some(embedding) => copy_field(&mut row, &vector_literal(embedding)),
            None => copy_null(&mut row),
        }
        row.push('\t');
        copy_field(&mut row, &entry.raw_checksum);
        row.push('\t');
        copy_field(&mut row, &entry.source_id);
        row.push('\t');
        copy_field(&mut row, &entry.pipeline_fingerprint);
        row.push('\t');
        row.push_str(&entry.quality.to_string());
        row.push('\t');
        copy_field(
            &mut row,
            &serde_json::to_string(&entry.validation_errors).unwrap_or_else(|_| "[]".to_string()),
        );
        row.push('\t');
        row.push_str(&entry.created_at_epoch_ms.to_string());
        row.push('\n');
        row
    }

    fn row_to_entry(row: &Row) -> Entry {
        let embedding: Option<Vector> = row.get("embedding");
        let validation_errors: Json<Vec<String>> = row.get("validation_errors");
        Entry {
            id: row.get("id"),
            headword: row.get("headword"),
            ipa: row.get("ipa"),
            language: row.get("language"),
            definition: row.get("definition"),
            etymology: row.get("etymology"),
            pos_tag: row.get("pos_tag"),
            embedding: embedding.map(|vector| vector.to_vec()),
            raw_checksum: row.get("raw_checksum"),
            source_id: row.get("source_id"),
            pipeline_fingerprint: row.get("pipeline_fingerprint"),
            quality: row.get("quality"),
            validation_errors: validation_errors.0,
            created_at_epoch_ms: row.get::<_, i64>("created_at_epoch_ms") as u64,
        }
    }

    fn filter_sql(filter: &EntryFilter, params_from: usize) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        let mut next = params_from;
        if let Some(source_id) = &filter.source_id {
            clauses.push(format!("source_id = ${next}"));
            values.push(source_id.clone());
            next += 1;
        }
        if let Some(language) = &filter.language {
            clauses.push(format!("language = ${next}"));
            values.push(language.clone());
        }
        if filter.missing_embedding {
            clauses.push("embedding IS NULL".to_string());
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" AND {}", clauses.join(" AND "))
        };
        (sql, values)
    }
}

#[async_trait]
impl EntryStore for PgEntryStore {
    async fn bulk_upsert(&self, entries: &[Entry]) -> Result<usize, PipelineError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut client = self.client.lock().await;
        let transaction = client
            .transaction()
            .await
            .map_err(|err| db_err("failed to begin entry upsert transaction", err))?;

        transaction
            .batch_execute(&format!(
                "CREATE TEMPORARY TABLE entries_stage (
                    id VARCHAR(32),
                    headword TEXT,
                    ipa TEXT,
                    language VARCHAR(3),
                    definition TEXT,
                    etymology TEXT,
                    pos_tag TEXT,
                    embedding VECTOR({dims}),
                    raw_checksum VARCHAR(64),
                    source_id TEXT,
                    pipeline_fingerprint TEXT,
                    quality DOUBLE PRECISION,
                    validation_errors JSONB,
                    created_at_epoch_ms BIGINT
                ) ON COMMIT DROP",
                dims = self.dimension
            ))
            .await
            .map_err(|err| db_err("failed to create entry staging table", err))?;

        copy_rows(
            &transaction,
            "COPY entries_stage (id, headword, ipa, language, definition, etymology, pos_tag, \
             embedding, raw_checksum, source_id, pipeline_fingerprint, quality, \
             validation_errors, created_at_epoch_ms) FROM STDIN",
            entries.iter().map(Self::render_row),
        )
        .await?;

        // Later pipelines overwrite earlier fields; a present embedding is
        // never replaced by an absent one.
        let merged = transaction
            .execute(
                "INSERT INTO entries (id, headword, ipa, language, definition, etymology,
                    pos_tag, embedding, raw_checksum, source_id, pipeline_fingerprint,
                    quality, validation_errors, created_at_epoch_ms)
                 SELECT DISTINCT ON (id) id, headword, ipa, language, definition, etymology,
                    pos_tag, embedding, raw_checksum, source_id, pipeline_fingerprint,
                    quality, validation_errors, created_at_epoch_ms
                 FROM entries_stage
                 ORDER BY id, created_at_epoch_ms DESC
                 ON CONFLICT (id) DO UPDATE SET
                    headword = EXCLUDED.headword,
                    ipa = EXCLUDED.ipa,
                    language = EXCLUDED.language,
                    definition = EXCLUDED.definition,
                    etymology = EXCLUDED.etymology,
                    pos_tag = EXCLUDED.pos_tag,
                    embedding = COALESCE(EXCLUDED.embedding, entries.embedding),
                    raw_checksum = EXCLUDED.raw_checksum,
                    source_id = EXCLUDED.source_id,
                    pipeline_fingerprint = EXCLUDED.pipeline_fingerprint,
                    quality = EXCLUDED.quality,
                    validation_errors = EXCLUDED.validation_errors,
                    created_at_epoch_ms = EXCLUDED.created_at_epoch_ms",
                &[],
            )
            .await
            .map_err(|err| db_err("failed to merge entry batch", err))?;

        transaction
            .commit()
            .await
            .map_err(|err| db_err("failed to commit entry batch", err))?;
        Ok(merged as usize)
    }

    async fn bulk_update_embeddings(
        &self,
        updates: &[(String, Vec<f32>)],
    ) -> Result<usize, PipelineError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = updates.iter().map(|(id, _)| id.clone()).collect();
        let vectors: Vec<Vector> = updates
            .iter()
            .map(|(_, vector)| Vector::from(vector.clone()))
            .collect();

        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE entries
                 SET embedding = data.embedding
                 FROM (SELECT unnest($1::text[]) AS id, unnest($2::vector[]) AS embedding) AS data
                 WHERE entries.id = data.id",
                &[&ids, &vectors],
            )
            .await
            .map_err(|err| db_err("failed to bulk update embeddings", err))?;
        Ok(updated as usize)
    }

    async fn get(&self, id: &str) -> Result<Option<Entry>, PipelineError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT * FROM entries WHERE id = $1", &[&id])
            .await
            .map_err(|err| db_err("failed to fetch entry", err))?;
        Ok(row.map(|row| Self::row_to_entry(&row)))
    }

    async fn scan(
        &self,
        filter: &EntryFilter,
        after_id: &str,
        limit: usize,
    ) -> Result<Vec<Entry>, PipelineError> {
        let (filter_sql, filter_values) = Self::filter_sql(filter, 3);
        let sql = format!(
            "SELECT * FROM entries WHERE id > $1{filter_sql} ORDER BY id LIMIT $2"
        );
        let limit = limit as i64;
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&after_id, &limit];
        for value in &filter_values {
            params.push(value);
        }

        let client = self.client.lock().await;
        let rows = client
            .query(&sql, &params)
            .await
            .map_err(|err| db_err("failed to scan entries", err))?;
        Ok(rows.iter().map(Self::row_to_entry).collect())
    }

    async fn knn(
        &self,
        vector: &[f32],
        k: usize,
        filter: &EntryFilter,
    ) -> Result<Vec<(Entry, f32)>, PipelineError> {
        let (filter_sql, filter_values) = Self::filter_sql(filter, 3);
        let sql = format!(
            "SELECT *, 1 - (embedding <=> $1) AS similarity
             FROM entries
             WHERE embedding IS NOT NULL{filter_sql}
             ORDER BY embedding <=> $1
             LIMIT $2"
        );
        let query = Vector::from(vector.to_vec());
        let k = k as i64;
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&query, &k];
        for value in &filter_values {
            params.push(value);
        }

        let client = self.client.lock().await;
        let rows = client
            .query(&sql, &params)
            .await
            .map_err(|err| db_err("failed to run knn query", err))?;
        Ok(rows
            .iter()
            .map(|row| {
                let similarity: f64 = row.get("similarity");
                (Self::row_to_entry(row), similarity as f32)
            })
            .collect())
    }

    async fn count(&self, filter: &EntryFilter) -> Result<u64, PipelineError> {
        let (filter_sql, filter_values) = Self::filter_sql(filter, 1);
        let sql = format!("SELECT COUNT(*) FROM entries WHERE TRUE{filter_sql}");
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        for value in &filter_values {
            params.push(value);
        }

        let client = self.client.lock().await;
        let row = client
            .query_one(&sql, &params)
            .await
            .map_err(|err| db_err("failed to count entries", err))?;
        Ok(row.get::<_, i64>(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Checkpoints and transform log
// ---------------------------------------------------------------------------

/// Postgres checkpoint store.
pub struct PgCheckpointStore {
    client: tokio::sync::Mutex<Client>,
}

impl PgCheckpointStore {
    /// Connects and ensures the checkpoint table exists.
    pub async fn connect(database_url: &str) -> Result<Self, PipelineError> {
        let client = connect(database_url).await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS checkpoints (
                    pipeline_name TEXT NOT NULL,
                    at_epoch_ms BIGINT NOT NULL,
                    total BIGINT NOT NULL,
                    processed BIGINT NOT NULL,
                    succeeded BIGINT NOT NULL,
                    failed BIGINT NOT NULL,
                    skipped BIGINT NOT NULL,
                    per_source_cursor JSONB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS checkpoints_pipeline_idx
                    ON checkpoints (pipeline_name, at_epoch_ms DESC);",
            )
            .await
            .map_err(|err| schema_err("failed to ensure checkpoint schema", err))?;
        Ok(Self {
            client: tokio::sync::Mutex::new(client),
        })
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO checkpoints (pipeline_name, at_epoch_ms, total, processed,
                    succeeded, failed, skipped, per_source_cursor)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &checkpoint.pipeline_name,
                    &(checkpoint.at_epoch_ms as i64),
                    &(checkpoint.total as i64),
                    &(checkpoint.processed as i64),
                    &(checkpoint.succeeded as i64),
                    &(checkpoint.failed as i64),
                    &(checkpoint.skipped as i64),
                    &Json(&checkpoint.per_source_cursor),
                ],
            )
            .await
            .map_err(|err| db_err("failed to save checkpoint", err))?;
        Ok(())
    }

    async fn latest(&self, pipeline_name: &str) -> Result<Option<Checkpoint>, PipelineError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM checkpoints
                 WHERE pipeline_name = $1
                 ORDER BY at_epoch_ms DESC
                 LIMIT 1",
                &[&pipeline_name],
            )
            .await
            .map_err(|err| db_err("failed to load checkpoint", err))?;
        Ok(row.map(|row| {
            let cursors: Json<HashMap<String, u64>> = row.get("per_source_cursor");
            Checkpoint {
                pipeline_name: row.get("pipeline_name"),
                at_epoch_ms: row.get::<_, i64>("at_epoch_ms") as u64,
                total: row.get::<_, i64>("total") as u64,
                processed: row.get::<_, i64>("processed") as u64,
                succeeded: row.get::<_, i64>("succeeded") as u64,
                failed: row.get::<_, i64>("failed") as u64,
                skipped: row.get::<_, i64>("skipped") as u64,
                per_source_cursor: cursors.0,
            }
        }))
    }
}

/// Postgres transform log.
pub struct PgTransformLogStore {
    client: tokio::sync::Mutex<Client>,
}

impl PgTransformLogStore {
    /// Connects; the table is created by [`PgRawStore`]'s schema setup, but
    /// is ensured here as well so the log can be used standalone.
    pub async fn connect(database_url: &str) -> Result<Self, PipelineError> {
        let client = connect(database_url).await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS transform_log (
                    raw_checksum VARCHAR(64) NOT NULL,
                    step_name TEXT NOT NULL,
                    step_version TEXT NOT NULL,
                    at_epoch_ms BIGINT NOT NULL,
                    duration_ms BIGINT NOT NULL,
                    ok BOOLEAN NOT NULL,
                    error TEXT
                )",
            )
            .await
            .map_err(|err| schema_err("failed to ensure transform log schema", err))?;
        Ok(Self {
            client: tokio::sync::Mutex::new(client),
        })
    }
}

#[async_trait]
impl TransformLogStore for PgTransformLogStore {
    async fn append(
        &self,
        raw_checksum: &str,
        steps: &[TransformStep],
    ) -> Result<(), PipelineError> {
        if steps.is_empty() {
            return Ok(());
        }
        let mut client = self.client.lock().await;
        let transaction = client
            .transaction()
            .await
            .map_err(|err| db_err("failed to begin transform log append", err))?;
        let statement = transaction
            .prepare(
                "INSERT INTO transform_log (raw_checksum, step_name, step_version,
                    at_epoch_ms, duration_ms, ok, error)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .await
            .map_err(|err| db_err("failed to prepare transform log insert", err))?;
        for step in steps {
            transaction
                .execute(
                    &statement,
                    &[
                        &raw_checksum,
                        &step.step_name,
                        &step.step_version,
                        &(step.at_epoch_ms as i64),
                        &(step.duration_ms as i64),
                        &step.ok,
                        &step.error,
                    ],
                )
                .await
                .map_err(|err| db_err("failed to append transform log step", err))?;
        }
        transaction
            .commit()
            .await
            .map_err(|err| db_err("failed to commit transform log append", err))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared vector cache
// ---------------------------------------------------------------------------

/// Shared embedding cache backed by a Postgres key/value table.
///
/// Owns a private current-thread runtime so the synchronous
/// [`SharedVectorCache`] contract can be served from any worker thread.
pub struct PgVectorCache {
    runtime: tokio::runtime::Runtime,
    client: tokio::sync::Mutex<Client>,
}

impl PgVectorCache {
    /// Connects and ensures the cache table exists.
    pub fn connect(database_url: &str) -> Result<Self, PipelineError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| PipelineError::fatal(format!("failed to build cache runtime: {err}")))?;
        let client = runtime.block_on(async {
            let client = connect(database_url).await?;
            client
                .batch_execute(
                    "CREATE TABLE IF NOT EXISTS embedding_cache (
                        text_hash VARCHAR(64) PRIMARY KEY,
                        embedding REAL[] NOT NULL
                    )",
                )
                .await
                .map_err(|err| schema_err("failed to ensure embedding cache schema", err))?;
            Ok::<_, PipelineError>(client)
        })?;
        Ok(Self {
            runtime,
            client: tokio::sync::Mutex::new(client),
        })
    }
}

impl SharedVectorCache for PgVectorCache {
    fn get_many(&self, hashes: &[String]) -> Result<Vec<Option<Vec<f32>>>, PipelineError> {
        self.runtime.block_on(async {
            let client = self.client.lock().await;
            let rows = client
                .query(
                    "SELECT text_hash, embedding FROM embedding_cache WHERE text_hash = ANY($1)",
                    &[&hashes],
                )
                .await
                .map_err(|err| db_err("failed to read embedding cache", err))?;
            let mut found: HashMap<String, Vec<f32>> = rows
                .into_iter()
                .map(|row| (row.get("text_hash"), row.get("embedding")))
                .collect();
            Ok(hashes.iter().map(|hash| found.remove(hash)).collect())
        })
    }

    fn put_many(&self, items: &[(String, Vec<f32>)]) -> Result<(), PipelineError> {
        if items.is_empty() {
            return Ok(());
        }
        self.runtime.block_on(async {
            let mut client = self.client.lock().await;
            let transaction = client
                .transaction()
                .await
                .map_err(|err| db_err("failed to begin cache write", err))?;
            let statement = transaction
                .prepare(
                    "INSERT INTO embedding_cache (text_hash, embedding)
                     VALUES ($1, $2)
                     ON CONFLICT (text_hash) DO NOTHING",
                )
                .await
                .map_err(|err| db_err("failed to prepare cache write", err))?;
            for (hash, vector) in items {
                transaction
                    .execute(&statement, &[hash, vector])
                    .await
                    .map_err(|err| db_err("failed to write cache row", err))?;
            }
            transaction
                .commit()
                .await
                .map_err(|err| db_err("failed to commit cache write", err))
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Store provider that opens one Postgres connection per handle, on the
/// calling worker's runtime.
#[derive(Clone)]
pub struct PgStoreProvider {
    database_url: String,
    dimension: usize,
}

impl PgStoreProvider {
    /// Provider for the given connection string and embedding dimension.
    pub fn new(database_url: impl Into<String>, dimension: usize) -> Self {
        Self {
            database_url: database_url.into(),
            dimension: if dimension == 0 {
                DEFAULT_DIMENSION
            } else {
                dimension
            },
        }
    }
}

#[async_trait]
impl StoreProvider for PgStoreProvider {
    async fn raw_store(&self) -> Result<Arc<dyn RawStore>, PipelineError> {
        Ok(Arc::new(PgRawStore::connect(&self.database_url).await?))
    }

    async fn entry_store(&self) -> Result<Arc<dyn EntryStore>, PipelineError> {
        Ok(Arc::new(
            PgEntryStore::connect(&self.database_url, self.dimension).await?,
        ))
    }

    async fn checkpoint_store(&self) -> Result<Arc<dyn CheckpointStore>, PipelineError> {
        Ok(Arc::new(
            PgCheckpointStore::connect(&self.database_url).await?,
        ))
    }

    async fn transform_log(&self) -> Result<Arc<dyn TransformLogStore>, PipelineError> {
        Ok(Arc::new(
            PgTransformLogStore::connect(&self.database_url).await?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_fields_escape_delimiters() {
        let mut buf = String::new();
        copy_field(&mut buf, "a\tb\nc\\d");
        assert_eq!(buf, "a\\tb\\nc\\\\d");
    }

    #[test]
    fn vector_literal_renders_pgvector_syntax() {
        assert_eq!(vector_literal(&[1.0, -0.5, 0.25]), "[1,-0.5,0.25]");
        assert_eq!(vector_literal(&[]), "[]");
    }

    #[test]
    fn filter_sql_numbers_params_after_fixed_ones() {
        let filter = EntryFilter {
            source_id: Some("wikt".to_string()),
            language: Some("en".to_string()),
            missing_embedding: true,
        };
        let (sql, values) = PgEntryStore::filter_sql(&filter, 3);
        assert_eq!(
            sql,
            " AND source_id = $3 AND language = $4 AND embedding IS NULL"
        );
        assert_eq!(values, vec!["wikt".to_string(), "en".to_string()]);
    }
}
