//! mirror_db CLI
//!
//! Hydrates analytical tables into the local sled mirror and queries it.
//! - hydrate: source file (csv / parquet / json) -> hashes + index sets
//! - search:  filter JSON -> sorted, truncated records
//! - get / dump: single record or whole table
//!
//! Usage:
//!   cargo run --bin load_data    # populate sample data
//!   cargo run --bin mirror_db -- search -f @filter.json

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use mirror_db::config::{hydrator_config, load_filter, query_config, Args, Command};
use mirror_db::indexing::{HydrationRequest, Hydrator};
use mirror_db::models::RowFilter;
use mirror_db::query::QueryExecutor;
use mirror_db::source::DataFusionSource;
use mirror_db::storage::SledStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let _log_guard = mirror_db::logging::init(&args.log_level, args.log_json, args.log_dir.as_deref());

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        return Err(e.into());
    }

    let store = Arc::new(SledStore::open_with_limits(&args.db_path, args.script_limits())?);
    info!(path = %args.db_path.display(), "Opened mirror");

    match args.command {
        Command::Hydrate {
            table,
            source,
            namespace,
            primary_key,
            indexes,
            predicates,
            combinator,
            pipeline_depth,
        } => {
            let rows = DataFusionSource::new();
            rows.register_file(&table, &source).await?;

            let mut request = HydrationRequest::new(&table, &namespace, primary_key)
                .filter(RowFilter::new(predicates, combinator));
            for spec in indexes {
                request = request.index(spec);
            }
            let hydrator = Hydrator::with_config(store.clone(), Arc::new(rows), hydrator_config(pipeline_depth));
            let report = hydrator.hydrate(&request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Search { filter, chunk_size } => {
            let filter = load_filter(&filter)?;
            let executor = QueryExecutor::with_config(store.clone(), query_config(chunk_size));
            let records = executor.try_search(&filter)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Get { namespace, table, id } => {
            let executor = QueryExecutor::new(store.clone());
            match executor.lookup(&namespace, &table, &id)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => return Err(format!("no record {} in {}:{}", id, namespace, table).into()),
            }
        }
        Command::Dump { namespace, table } => {
            let executor = QueryExecutor::new(store.clone());
            let records = executor.all_records(&namespace, &table)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    store.flush()?;
    Ok(())
}
