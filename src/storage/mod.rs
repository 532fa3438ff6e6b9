//! Key-value store adapter
//!
//! The mirror needs a store with scalar keys, hash objects, sets, glob key
//! scans, pipelined writes and two atomic server-side primitives:
//! `scan_and_collect` (pattern scan + set union) and `resolve_records`
//! (id chunk to primary records). `SledStore` persists to disk, `MemoryStore`
//! stays in-process. Both serialize writers against the atomic primitives with
//! a store-wide gate, and both enforce optional script limits the way a
//! scripting store kills long-running scripts.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::error::{MirrorError, Result};
use crate::keys::TableKeys;
use crate::models::Record;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

/// Kind of value stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    String,
    Hash,
    Set,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::String => "string",
            KeyKind::Hash => "hash",
            KeyKind::Set => "set",
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            KeyKind::String => b's',
            KeyKind::Hash => b'h',
            KeyKind::Set => b'm',
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b's' => Some(KeyKind::String),
            b'h' => Some(KeyKind::Hash),
            b'm' => Some(KeyKind::Set),
            _ => None,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single buffered write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Set { key: String, value: String },
    Delete { key: String },
    HSet { key: String, fields: BTreeMap<String, String> },
    SAdd { key: String, members: Vec<String> },
}

/// Ordered batch of writes sent to the store in one round trip.
///
/// Like a store pipeline it is not a transaction: ops apply in order and a
/// failure leaves the earlier ones applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    ops: Vec<Op>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(Op::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(Op::Delete { key: key.into() });
        self
    }

    pub fn hset(&mut self, key: impl Into<String>, fields: BTreeMap<String, String>) -> &mut Self {
        self.ops.push(Op::HSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(Op::SAdd {
            key: key.into(),
            members: vec![member.into()],
        });
        self
    }

    /// Number of buffered ops.
    pub fn depth(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Hand the buffered ops over, leaving the pipeline empty.
    pub fn take(&mut self) -> Pipeline {
        std::mem::take(self)
    }
}

/// Resource budget for the atomic primitives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptLimits {
    /// Maximum keys / ids one primitive may visit.
    pub max_steps: Option<u64>,
    /// Maximum wall time of one primitive.
    pub timeout: Option<Duration>,
}

impl ScriptLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn start(&self, operation: &'static str) -> ScriptClock {
        ScriptClock {
            operation,
            limits: *self,
            steps: 0,
            started: Instant::now(),
        }
    }
}

/// Step/time accounting for one running primitive.
pub(crate) struct ScriptClock {
    operation: &'static str,
    limits: ScriptLimits,
    steps: u64,
    started: Instant,
}

impl ScriptClock {
    pub(crate) fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if let Some(max) = self.limits.max_steps {
            if self.steps > max {
                return Err(MirrorError::script_aborted(
                    self.operation,
                    format!("step budget of {} exceeded", max),
                ));
            }
        }
        if let Some(timeout) = self.limits.timeout {
            if self.started.elapsed() > timeout {
                return Err(MirrorError::script_aborted(
                    self.operation,
                    format!("time limit of {}ms reached", timeout.as_millis()),
                ));
            }
        }
        Ok(())
    }
}

/// Capabilities the Hydrator and Query Executor need from the store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn key_kind(&self, key: &str) -> Result<Option<KeyKind>>;

    /// Atomically add `by` to an integer string key (missing key counts as 0).
    fn incr(&self, key: &str, by: i64) -> Result<i64>;

    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>>;

    fn smembers(&self, key: &str) -> Result<BTreeSet<String>>;

    /// Keys matching a glob pattern.
    fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    /// Apply buffered writes in order; returns the number of ops applied.
    fn execute(&self, pipeline: Pipeline) -> Result<usize>;

    /// Atomic: union the members of every set key matching `pattern`.
    /// Keys of other kinds are skipped.
    fn scan_and_collect(&self, pattern: &str) -> Result<BTreeSet<String>>;

    /// Atomic: resolve a chunk of ids to primary records under `table`.
    /// Ids without a record come back as placeholders, in input order.
    fn resolve_records(&self, ids: &[String], table: &TableKeys) -> Result<Vec<Record>>;

    /// Atomic: hash keys matching `pattern`.
    fn scan_hashes(&self, pattern: &str) -> Result<Vec<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut pipe = Pipeline::new();
        pipe.set(key, value);
        self.execute(pipe).map(|_| ())
    }

    fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut pipe = Pipeline::new();
        for key in keys {
            pipe.delete(key.as_str());
        }
        self.execute(pipe)
    }

    fn hset(&self, key: &str, fields: BTreeMap<String, String>) -> Result<()> {
        let mut pipe = Pipeline::new();
        pipe.hset(key, fields);
        self.execute(pipe).map(|_| ())
    }

    fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut pipe = Pipeline::new();
        pipe.sadd(key, member);
        self.execute(pipe).map(|_| ())
    }
}

/// Generation the table's pointer currently names, if any.
pub fn current_generation<S: KeyValueStore + ?Sized>(store: &S, table: &TableKeys) -> Result<Option<u64>> {
    let key = table.current_pointer_key();
    match store.get(&key)? {
        None => Ok(None),
        Some(raw) => raw.parse::<u64>().map(Some).map_err(|_| MirrorError::WrongType {
            key,
            expected: "generation number",
        }),
    }
}

/// Keys readers should use for `namespace:table`: the current generation if
/// a pointer exists, the unversioned layout otherwise.
pub fn resolve_table<S: KeyValueStore + ?Sized>(store: &S, namespace: &str, table: &str) -> Result<TableKeys> {
    let base = TableKeys::new(namespace, table);
    Ok(match current_generation(store, &base)? {
        Some(generation) => base.with_generation(generation),
        None => base,
    })
}

pub(crate) fn parse_counter(key: &str, raw: Option<&str>) -> Result<i64> {
    match raw {
        None => Ok(0),
        Some(s) => s.parse::<i64>().map_err(|_| MirrorError::WrongType {
            key: key.to_string(),
            expected: "integer string",
        }),
    }
}

pub(crate) fn wrong_type(key: &str, expected: KeyKind) -> MirrorError {
    MirrorError::WrongType {
        key: key.to_string(),
        expected: expected.as_str(),
    }
}
