//! Configuration for the mirror CLI
//!
//! CLI arguments and environment variable handling using clap.

use crate::error::{MirrorError, Result};
use crate::indexing::{HydratorConfig, DEFAULT_PIPELINE_DEPTH};
use crate::models::{Combinator, Filter, IndexSpec, PrimaryKey, RowPredicate};
use crate::query::{QueryConfig, DEFAULT_CHUNK_SIZE};
use crate::storage::ScriptLimits;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// mirror_db - hash/set mirror of analytical tables with pattern search
#[derive(Parser, Debug, Clone)]
#[command(name = "mirror_db")]
#[command(about = "Hydrate analytical tables into a key-value mirror and search them")]
pub struct Args {
    /// Directory of the sled mirror
    #[arg(long, env = "MIRROR_DB_PATH", default_value = "mirror_data")]
    pub db_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Also write JSON logs to a daily rolling file in this directory
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Emit stderr logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Steps an atomic store primitive may take before it is aborted
    #[arg(long, env = "MIRROR_SCRIPT_MAX_STEPS")]
    pub script_max_steps: Option<u64>,

    /// Wall-clock limit for an atomic store primitive, in milliseconds
    #[arg(long, env = "MIRROR_SCRIPT_TIMEOUT_MS")]
    pub script_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Rebuild a table's mirror from a csv, parquet or json file
    Hydrate {
        /// Source table name (also the mirrored table)
        #[arg(short, long)]
        table: String,

        /// File holding the table rows
        #[arg(short, long)]
        source: PathBuf,

        #[arg(short, long)]
        namespace: String,

        /// Primary key column, or GUID for generated ids
        #[arg(short = 'k', long, default_value = "GUID")]
        primary_key: PrimaryKey,

        /// Secondary index, NAME or NAME:field1:field2 (repeatable)
        #[arg(short, long = "index")]
        indexes: Vec<IndexSpec>,

        /// Row filter predicate, field=value (repeatable)
        #[arg(short = 'w', long = "where")]
        predicates: Vec<RowPredicate>,

        /// How row filter predicates combine (all, any)
        #[arg(short = 'm', long = "match", default_value = "all")]
        combinator: Combinator,

        /// Buffered writes per pipeline flush
        #[arg(long, env = "MIRROR_PIPELINE_DEPTH", default_value_t = DEFAULT_PIPELINE_DEPTH)]
        pipeline_depth: usize,
    },
    /// Run a filter against the mirror
    Search {
        /// Filter JSON, or @path to read it from a file
        #[arg(short, long)]
        filter: String,

        /// Ids resolved per store call
        #[arg(long, env = "MIRROR_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Print one record by id
    Get {
        #[arg(short, long)]
        namespace: String,
        #[arg(short, long)]
        table: String,
        #[arg(short, long)]
        id: String,
    },
    /// Print every record of a table
    Dump {
        #[arg(short, long)]
        namespace: String,
        #[arg(short, long)]
        table: String,
    },
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.script_max_steps == Some(0) {
            return Err(MirrorError::validation("script max steps must be positive"));
        }
        if self.script_timeout_ms == Some(0) {
            return Err(MirrorError::validation("script timeout must be positive"));
        }
        match &self.command {
            Command::Hydrate { pipeline_depth: 0, .. } => {
                Err(MirrorError::validation("pipeline depth must be positive"))
            }
            Command::Search { chunk_size: 0, .. } => Err(MirrorError::validation("chunk size must be positive")),
            _ => Ok(()),
        }
    }

    pub fn script_limits(&self) -> ScriptLimits {
        let mut limits = ScriptLimits::unlimited();
        if let Some(steps) = self.script_max_steps {
            limits = limits.with_max_steps(steps);
        }
        if let Some(ms) = self.script_timeout_ms {
            limits = limits.with_timeout(Duration::from_millis(ms));
        }
        limits
    }
}

pub fn hydrator_config(pipeline_depth: usize) -> HydratorConfig {
    HydratorConfig {
        max_pipeline_depth: pipeline_depth,
    }
}

pub fn query_config(chunk_size: usize) -> QueryConfig {
    QueryConfig { chunk_size }
}

/// Parse a filter given inline or as `@path`.
pub fn load_filter(arg: &str) -> Result<Filter> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| MirrorError::validation(format!("cannot read filter file {}: {}", path, e)))?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}
