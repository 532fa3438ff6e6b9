//! Analytical row sources for hydration
//!
//! `DataFusionSource` wraps an Apache DataFusion `SessionContext`: tables are
//! registered from Arrow batches or CSV / Parquet / NDJSON files and the row
//! filter is pushed down as a DataFusion expression, so only matching rows
//! leave the scan. Rows come back as JSON objects via the Arrow JSON writer.

use crate::error::{MirrorError, Result};
use crate::models::{Combinator, Row, RowFilter};
use arrow::datatypes::DataType;
use arrow::json::writer::JsonArray;
use arrow::json::WriterBuilder;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::execution::context::SessionContext;
use datafusion::logical_expr::{cast, ident, lit, Expr};
use datafusion::prelude::{CsvReadOptions, NdJsonReadOptions, ParquetReadOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info};

/// Upstream source of rows for a table.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch(&self, table: &str, filter: &RowFilter) -> Result<Vec<Row>>;
}

/// DataFusion-backed source.
pub struct DataFusionSource {
    ctx: SessionContext,
}

impl Default for DataFusionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFusionSource {
    pub fn new() -> Self {
        Self {
            ctx: SessionContext::new(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Register an in-memory batch as table `name`.
    pub fn register_batch(&self, name: &str, batch: RecordBatch) -> Result<()> {
        self.ctx.register_batch(name, batch)?;
        Ok(())
    }

    /// Register a file, picking the reader from its extension
    /// (`csv`, `parquet`, `json`/`ndjson`).
    pub async fn register_file(&self, name: &str, path: &Path) -> Result<()> {
        let location = path
            .to_str()
            .ok_or_else(|| MirrorError::SourceFetch(format!("non UTF-8 path {}", path.display())))?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("csv") => {
                self.ctx
                    .register_csv(name, location, CsvReadOptions::new())
                    .await?
            }
            Some("parquet") => {
                self.ctx
                    .register_parquet(name, location, ParquetReadOptions::default())
                    .await?
            }
            Some("json") | Some("ndjson") => {
                let options = NdJsonReadOptions::default()
                    .file_extension(if extension.as_deref() == Some("json") { ".json" } else { ".ndjson" });
                self.ctx.register_json(name, location, options).await?
            }
            _ => {
                return Err(MirrorError::SourceFetch(format!(
                    "unsupported source file {}",
                    path.display()
                )))
            }
        }
        info!(table = name, path = %path.display(), "Registered source table");
        Ok(())
    }
}

/// Render the row filter as a DataFusion predicate; columns are compared as
/// strings so `level=1` matches an integer column.
pub fn filter_expr(filter: &RowFilter) -> Option<Expr> {
    let mut terms = filter
        .predicates
        .iter()
        .map(|p| cast(ident(&p.field), DataType::Utf8).eq(lit(p.value.clone())));
    let first = terms.next()?;
    Some(terms.fold(first, |acc, term| match filter.combinator {
        Combinator::All => acc.and(term),
        Combinator::Any => acc.or(term),
    }))
}

/// Convert Arrow batches to JSON rows, nulls kept as explicit `null`.
pub fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Row>> {
    if batches.iter().all(|b| b.num_rows() == 0) {
        return Ok(Vec::new());
    }
    let mut writer = WriterBuilder::new()
        .with_explicit_nulls(true)
        .build::<_, JsonArray>(Vec::new());
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    let buf = writer.into_inner();
    serde_json::from_slice(&buf)
        .map_err(|e| MirrorError::SourceFetch(format!("undecodable row batch: {}", e)))
}

#[async_trait]
impl RowSource for DataFusionSource {
    async fn fetch(&self, table: &str, filter: &RowFilter) -> Result<Vec<Row>> {
        let mut df = self.ctx.table(table).await?;
        if let Some(predicate) = filter_expr(filter) {
            debug!(table, predicate = %predicate, "Pushing down row filter");
            df = df.filter(predicate)?;
        }
        let batches = df.collect().await?;
        let rows = batches_to_rows(&batches)?;
        info!(table, rows = rows.len(), "Fetched source rows");
        Ok(rows)
    }
}

/// In-process source holding rows per table.
#[derive(Default)]
pub struct MemorySource {
    tables: RwLock<HashMap<String, Vec<Row>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rows of `table`.
    pub fn insert_table(&self, table: &str, rows: Vec<Row>) {
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(table.to_string(), rows);
        }
    }

    /// Build rows from JSON objects; non-object values are skipped.
    pub fn rows(values: Vec<serde_json::Value>) -> Vec<Row> {
        values
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RowSource for MemorySource {
    async fn fetch(&self, table: &str, filter: &RowFilter) -> Result<Vec<Row>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| MirrorError::SourceFetch("memory source lock poisoned".to_string()))?;
        let rows = tables
            .get(table)
            .ok_or_else(|| MirrorError::SourceFetch(format!("table '{}' not found", table)))?;
        Ok(rows.iter().filter(|row| filter.matches(row)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RowPredicate;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema};
    use serde_json::json;
    use std::sync::Arc;

    fn accounts_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("aws_account_id", DataType::Utf8, false),
            Field::new("env", DataType::Utf8, true),
            Field::new("level", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["111", "222", "333"])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some("Prod"), Some("Lab"), None])) as ArrayRef,
                Arc::new(Int64Array::from(vec![1, 2, 1])) as ArrayRef,
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_datafusion_fetch_all_rows_keeps_nulls() -> Result<()> {
        let source = DataFusionSource::new();
        source.register_batch("vw_aws_accounts", accounts_batch())?;

        let rows = source.fetch("vw_aws_accounts", &RowFilter::default()).await?;
        assert_eq!(rows.len(), 3);
        let third = rows.iter().find(|r| r["aws_account_id"] == json!("333")).unwrap();
        assert_eq!(third.get("env"), Some(&serde_json::Value::Null));
        assert_eq!(third["level"], json!(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_datafusion_pushes_down_all_and_any() -> Result<()> {
        let source = DataFusionSource::new();
        source.register_batch("vw_aws_accounts", accounts_batch())?;

        let all = RowFilter::new(
            vec![RowPredicate::new("level", "1"), RowPredicate::new("env", "Prod")],
            Combinator::All,
        );
        let rows = source.fetch("vw_aws_accounts", &all).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["aws_account_id"], json!("111"));

        let any = RowFilter::new(
            vec![RowPredicate::new("env", "Lab"), RowPredicate::new("aws_account_id", "333")],
            Combinator::Any,
        );
        let rows = source.fetch("vw_aws_accounts", &any).await?;
        assert_eq!(rows.len(), 2);

        let none = RowFilter::new(vec![RowPredicate::new("env", "Dev")], Combinator::All);
        assert!(source.fetch("vw_aws_accounts", &none).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_table_is_source_error() {
        let source = DataFusionSource::new();
        let err = source.fetch("nope", &RowFilter::default()).await.unwrap_err();
        assert!(matches!(err, MirrorError::SourceFetch(_)));
    }

    #[tokio::test]
    async fn test_memory_source_filters() {
        let source = MemorySource::new();
        source.insert_table(
            "regions",
            MemorySource::rows(vec![
                json!({"id": 1, "region": "us"}),
                json!({"id": 2, "region": "eu"}),
            ]),
        );
        let filter = RowFilter::new(vec![RowPredicate::new("region", "eu")], Combinator::All);
        let rows = source.fetch("regions", &filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(2));
        assert!(source.fetch("missing", &filter).await.is_err());
    }

    #[test]
    fn test_filter_expr_shape() {
        assert!(filter_expr(&RowFilter::default()).is_none());
        let expr = filter_expr(&RowFilter::new(
            vec![RowPredicate::new("a", "1"), RowPredicate::new("b", "2")],
            Combinator::Any,
        ))
        .unwrap();
        assert!(expr.to_string().contains("OR"));
    }
}
