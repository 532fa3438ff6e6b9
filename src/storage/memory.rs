use super::{parse_counter, wrong_type, KeyKind, KeyValueStore, Op, Pipeline, ScriptLimits};
use crate::error::{MirrorError, Result};
use crate::keys::{GlobPattern, TableKeys};
use crate::models::Record;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

impl Value {
    fn kind(&self) -> KeyKind {
        match self {
            Value::Str(_) => KeyKind::String,
            Value::Hash(_) => KeyKind::Hash,
            Value::Set(_) => KeyKind::Set,
        }
    }
}

/// In-process store; the whole keyspace sits behind one lock, so every
/// operation is atomic with respect to every other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Value>>,
    limits: ScriptLimits,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: ScriptLimits) -> Self {
        Self {
            data: RwLock::default(),
            limits,
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Value>>> {
        self.data
            .read()
            .map_err(|_| MirrorError::StoreUnavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Value>>> {
        self.data
            .write()
            .map_err(|_| MirrorError::StoreUnavailable("memory store lock poisoned".to_string()))
    }

    fn matching<'a>(
        data: &'a BTreeMap<String, Value>,
        pattern: &GlobPattern,
    ) -> impl Iterator<Item = (&'a String, &'a Value)> + 'a {
        let prefix = pattern.literal_prefix().to_string();
        data.range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.read()?.get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key, KeyKind::String)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read()?.contains_key(key))
    }

    fn key_kind(&self, key: &str) -> Result<Option<KeyKind>> {
        Ok(self.read()?.get(key).map(Value::kind))
    }

    fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut data = self.write()?;
        let current = match data.get(key) {
            None => 0,
            Some(Value::Str(s)) => parse_counter(key, Some(s.as_str()))?,
            Some(_) => return Err(wrong_type(key, KeyKind::String)),
        };
        let next = current.checked_add(by).ok_or_else(|| MirrorError::WrongType {
            key: key.to_string(),
            expected: "integer in range",
        })?;
        data.insert(key.to_string(), Value::Str(next.to_string()));
        Ok(next)
    }

    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        match self.read()?.get(key) {
            None => Ok(BTreeMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key, KeyKind::Hash)),
        }
    }

    fn smembers(&self, key: &str) -> Result<BTreeSet<String>> {
        match self.read()?.get(key) {
            None => Ok(BTreeSet::new()),
            Some(Value::Set(s)) => Ok(s.clone()),
            Some(_) => Err(wrong_type(key, KeyKind::Set)),
        }
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let glob = GlobPattern::new(pattern)?;
        let data = self.read()?;
        Ok(Self::matching(&data, &glob)
            .filter(|(k, _)| glob.matches(k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn execute(&self, pipeline: Pipeline) -> Result<usize> {
        let mut data = self.write()?;
        let mut applied = 0;
        for op in pipeline.ops() {
            match op {
                Op::Set { key, value } => {
                    data.insert(key.clone(), Value::Str(value.clone()));
                }
                Op::Delete { key } => {
                    data.remove(key);
                }
                Op::HSet { key, fields } => {
                    match data
                        .entry(key.clone())
                        .or_insert_with(|| Value::Hash(BTreeMap::new()))
                    {
                        Value::Hash(h) => h.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone()))),
                        _ => return Err(wrong_type(key, KeyKind::Hash)),
                    }
                }
                Op::SAdd { key, members } => {
                    match data
                        .entry(key.clone())
                        .or_insert_with(|| Value::Set(BTreeSet::new()))
                    {
                        Value::Set(s) => s.extend(members.iter().cloned()),
                        _ => return Err(wrong_type(key, KeyKind::Set)),
                    }
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    fn scan_and_collect(&self, pattern: &str) -> Result<BTreeSet<String>> {
        let glob = GlobPattern::new(pattern)?;
        let data = self.read()?;
        let mut clock = self.limits.start("scan_and_collect");
        let mut members = BTreeSet::new();
        for (key, value) in Self::matching(&data, &glob) {
            clock.tick()?;
            if let (true, Value::Set(s)) = (glob.matches(key), value) {
                members.extend(s.iter().cloned());
            }
        }
        Ok(members)
    }

    fn resolve_records(&self, ids: &[String], table: &TableKeys) -> Result<Vec<Record>> {
        let data = self.read()?;
        let mut clock = self.limits.start("resolve_records");
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            clock.tick()?;
            match data.get(&table.record_key(id)) {
                Some(Value::Hash(h)) if !h.is_empty() => records.push(Record::new(id.clone(), h.clone())),
                _ => records.push(Record::placeholder(id.clone())),
            }
        }
        Ok(records)
    }

    fn scan_hashes(&self, pattern: &str) -> Result<Vec<String>> {
        let glob = GlobPattern::new(pattern)?;
        let data = self.read()?;
        let mut clock = self.limits.start("scan_hashes");
        let mut keys = Vec::new();
        for (key, value) in Self::matching(&data, &glob) {
            clock.tick()?;
            if matches!(value, Value::Hash(_)) && glob.matches(key) {
                keys.push(key.clone());
            }
        }
        Ok(keys)
    }
}
