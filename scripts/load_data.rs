//! Load data script for mirror_db
//!
//! Builds a sample AWS accounts table as an Arrow RecordBatch, registers it
//! with DataFusion and hydrates it into the sled mirror:
//! - Hashes: one per account, keyed by AWS_ACCOUNT_ID
//! - Index sets: LEVEL, ENV and a composite BU_ENV index
//! Run: cargo run --bin load_data

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use mirror_db::indexing::{HydrationRequest, Hydrator};
use mirror_db::models::{Filter, PrimaryKey, SortOrder, TopN};
use mirror_db::query::QueryExecutor;
use mirror_db::source::DataFusionSource;
use mirror_db::storage::SledStore;
use std::sync::Arc;
use tracing::info;

const NAMESPACE: &str = "cms_sre";
const TABLE: &str = "VW_AWS_ACCOUNTS";

fn create_accounts_batch() -> Result<RecordBatch, Box<dyn std::error::Error>> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("AWS_ACCOUNT_ID", DataType::Utf8, false),
        Field::new("ACCOUNT_NAME", DataType::Utf8, false),
        Field::new("BU", DataType::Utf8, true),
        Field::new("ENV", DataType::Utf8, true),
        Field::new("LEVEL", DataType::Int64, false),
        Field::new("CREATED", DataType::Utf8, false),
    ]));

    let mut ids = Vec::new();
    let mut names = Vec::new();
    let mut bus = Vec::new();
    let mut envs = Vec::new();
    let mut levels = Vec::new();
    let mut created = Vec::new();
    for i in 0..10i64 {
        ids.push(format!("{:012}", 100_000_000_000 + i));
        names.push(format!("account-{}", i));
        bus.push(if i % 3 == 0 { None } else { Some(if i % 2 == 0 { "payments" } else { "search" }) });
        envs.push(Some(["Prod", "Lab", "Dev"][(i % 3) as usize]));
        levels.push(1 + i % 2);
        created.push(format!("2024-0{}-1{}", 1 + i % 9, i % 10));
    }

    Ok(RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(ids)) as ArrayRef,
            Arc::new(StringArray::from(names)) as ArrayRef,
            Arc::new(StringArray::from(bus)) as ArrayRef,
            Arc::new(StringArray::from(envs)) as ArrayRef,
            Arc::new(Int64Array::from(levels)) as ArrayRef,
            Arc::new(StringArray::from(created)) as ArrayRef,
        ],
    )?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let _guard = mirror_db::logging::init("info", false, None);

    // Open the sled mirror
    let store = Arc::new(SledStore::open("mirror_data")?);

    let source = DataFusionSource::new();
    source.register_batch(TABLE, create_accounts_batch()?)?;

    let request = HydrationRequest::new(TABLE, NAMESPACE, PrimaryKey::Field("AWS_ACCOUNT_ID".to_string()))
        .index("LEVEL".parse()?)
        .index("ENV".parse()?)
        .index("BU_ENV:BU:ENV".parse()?);
    let report = Hydrator::new(store.clone(), Arc::new(source)).hydrate(&request).await?;
    info!(
        generation = report.generation,
        records = report.records_written,
        memberships = report.index_memberships,
        "Loaded sample accounts"
    );

    // Demo search: production or lab accounts at level 1, newest first
    let executor = QueryExecutor::new(store.clone());
    let filter = Filter::union(NAMESPACE, TABLE)
        .criterion("ENV", "Prod")
        .criterion("ENV", "Lab")
        .sort("CREATED", SortOrder::Desc)
        .top(TopN::Count(5));
    let records = executor.try_search(&filter)?;
    info!(results = records.len(), "Sample search done");
    println!("{}", serde_json::to_string_pretty(&records)?);

    let composite = Filter::union(NAMESPACE, TABLE).criterion("BU_ENV", "payments|*");
    info!(results = executor.try_search(&composite)?.len(), "Composite index search done");

    store.flush()?;
    Ok(())
}
