//! Hydration: rebuild a table's mirror from the row source
//!
//! Every run writes a fresh generation (`namespace:table#<n>`) of primary
//! records and secondary-index sets, then swaps the table's generation
//! pointer. Readers keep resolving the previous generation until the swap,
//! and that generation survives until the next run purges it.

use crate::error::{MirrorError, Result};
use crate::keys::TableKeys;
use crate::models::{stringify, IndexSpec, PrimaryKey, Record, Row, RowFilter};
use crate::source::RowSource;
use crate::storage::{current_generation, KeyValueStore, Pipeline};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Buffered ops before a pipeline is flushed.
pub const DEFAULT_PIPELINE_DEPTH: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HydratorConfig {
    /// A pipeline is flushed once it holds more ops than this.
    pub max_pipeline_depth: usize,
}

impl Default for HydratorConfig {
    fn default() -> Self {
        Self {
            max_pipeline_depth: DEFAULT_PIPELINE_DEPTH,
        }
    }
}

/// What to mirror and how to index it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydrationRequest {
    /// Source table, optionally qualified (`DB.SCHEMA.TABLE`).
    pub table: String,
    pub namespace: String,
    pub primary_key: PrimaryKey,
    pub row_filter: RowFilter,
    pub indexes: Vec<IndexSpec>,
}

impl HydrationRequest {
    pub fn new(table: &str, namespace: &str, primary_key: PrimaryKey) -> Self {
        Self {
            table: table.to_string(),
            namespace: namespace.to_string(),
            primary_key,
            row_filter: RowFilter::default(),
            indexes: Vec::new(),
        }
    }

    pub fn filter(mut self, row_filter: RowFilter) -> Self {
        self.row_filter = row_filter;
        self
    }

    pub fn index(mut self, spec: IndexSpec) -> Self {
        self.indexes.push(spec);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(MirrorError::validation("hydration table is empty"));
        }
        if self.namespace.is_empty() {
            return Err(MirrorError::validation("hydration namespace is empty"));
        }
        Ok(())
    }
}

/// Outcome of one hydration run.
#[derive(Debug, Clone, Serialize)]
pub struct HydrationReport {
    pub namespace: String,
    pub table: String,
    pub generation: u64,
    pub previous_generation: Option<u64>,
    pub rows: usize,
    pub records_written: usize,
    pub index_memberships: usize,
    pub batches: usize,
    pub purged_keys: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u128,
}

/// Flushes a pipeline whenever it grows past the configured depth.
struct BatchWriter<'a, S: KeyValueStore + ?Sized> {
    store: &'a S,
    pipeline: Pipeline,
    max_depth: usize,
    batches: usize,
}

impl<'a, S: KeyValueStore + ?Sized> BatchWriter<'a, S> {
    fn new(store: &'a S, max_depth: usize) -> Self {
        Self {
            store,
            pipeline: Pipeline::new(),
            max_depth,
            batches: 0,
        }
    }

    fn pipeline(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    fn flush_if_full(&mut self) -> Result<()> {
        if self.pipeline.depth() > self.max_depth {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pipeline.is_empty() {
            return Ok(());
        }
        let applied = self.store.execute(self.pipeline.take())?;
        self.batches += 1;
        info!(ops = applied, batch = self.batches, "Flushed pipeline");
        Ok(())
    }
}

/// Bulk loader from a row source into the store.
pub struct Hydrator<S: KeyValueStore, R: RowSource> {
    store: Arc<S>,
    source: Arc<R>,
    config: HydratorConfig,
}

impl<S: KeyValueStore, R: RowSource> Hydrator<S, R> {
    pub fn new(store: Arc<S>, source: Arc<R>) -> Self {
        Self::with_config(store, source, HydratorConfig::default())
    }

    pub fn with_config(store: Arc<S>, source: Arc<R>, config: HydratorConfig) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// Rebuild the mirror of `request.table`.
    ///
    /// Errors abort the run. Batches already flushed stay in the new
    /// generation, which readers never see because the pointer is only
    /// swapped after the final flush; the next run purges them.
    #[instrument(skip(self, request), fields(table = %request.table, namespace = %request.namespace))]
    pub async fn hydrate(&self, request: &HydrationRequest) -> Result<HydrationReport> {
        request.validate()?;
        let started_at = Utc::now();
        let timer = Instant::now();
        let store = self.store.as_ref();

        let base = TableKeys::new(&request.namespace, &request.table);
        let previous_generation = current_generation(store, &base)?;
        let purged_keys = self.purge_stale(&base, previous_generation)?;

        let next = store.incr(&base.sequence_key(), 1)?;
        let generation = u64::try_from(next).map_err(|_| MirrorError::WrongType {
            key: base.sequence_key(),
            expected: "positive generation counter",
        })?;
        let target = base.with_generation(generation);
        info!(generation, previous = ?previous_generation, "Hydrating {}", target);

        let rows = self.source.fetch(&request.table, &request.row_filter).await?;

        let mut writer = BatchWriter::new(store, self.config.max_pipeline_depth);
        let mut index_memberships = 0;
        for row in &rows {
            let record = Record::from_row(record_id(&request.primary_key, row)?, row);
            debug!(key = %target.record_key(&record.id), "Hydrating record");

            for spec in &request.indexes {
                let value = spec.value_for(&record).map_err(|field| {
                    MirrorError::validation(format!(
                        "index {} reads field '{}' which row {} does not have",
                        spec.name, field, record.id
                    ))
                })?;
                let key = target.index_key(&spec.name, &value);
                debug!(index = %key, id = %record.id, "Adding index membership");
                writer.pipeline().sadd(key, record.id.clone());
                index_memberships += 1;
            }
            writer.pipeline().hset(target.record_key(&record.id), record.fields);
            writer.flush_if_full()?;
        }
        writer.flush()?;

        store.set(&base.current_pointer_key(), &generation.to_string())?;

        let report = HydrationReport {
            namespace: base.namespace.clone(),
            table: base.table.clone(),
            generation,
            previous_generation,
            rows: rows.len(),
            records_written: rows.len(),
            index_memberships,
            batches: writer.batches,
            purged_keys,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: timer.elapsed().as_millis(),
        };
        info!(
            rows = report.rows,
            index_memberships = report.index_memberships,
            batches = report.batches,
            elapsed_ms = report.elapsed_ms as u64,
            "Hydration complete"
        );
        Ok(report)
    }

    /// Delete every key of the table except the live generation's.
    fn purge_stale(&self, base: &TableKeys, live: Option<u64>) -> Result<usize> {
        let live = live.map(|g| base.with_generation(g));
        let mut stale = self.store.scan(&base.all_pattern())?;
        stale.extend(self.store.scan(&base.all_generations_pattern())?);
        stale.retain(|key| !live.as_ref().is_some_and(|keys| keys.owns(key)));

        let mut writer = BatchWriter::new(self.store.as_ref(), self.config.max_pipeline_depth);
        for key in &stale {
            writer.pipeline().delete(key.as_str());
            writer.flush_if_full()?;
        }
        writer.flush()?;
        if !stale.is_empty() {
            info!(keys = stale.len(), "Purged stale mirror keys under {}", base);
        }
        Ok(stale.len())
    }
}

fn record_id(primary_key: &PrimaryKey, row: &Row) -> Result<String> {
    match primary_key {
        PrimaryKey::Guid => Ok(Uuid::new_v4().to_string()),
        PrimaryKey::Field(field) => match row.get(field).map(stringify) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(MirrorError::validation(format!(
                "row has no value for primary key field '{}'",
                field
            ))),
        },
    }
}
