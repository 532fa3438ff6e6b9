use super::{parse_counter, wrong_type, KeyKind, KeyValueStore, Op, Pipeline, ScriptLimits};
use crate::error::{MirrorError, Result};
use crate::keys::{GlobPattern, TableKeys};
use crate::models::Record;
use sled::Db;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

/// Sled-backed store.
///
/// Trees, one per kind of value:
/// - `keys`: logical key -> kind tag (drives scans, TYPE and deletes)
/// - `strings`: key -> value
/// - `hashes`: key \0 field -> value
/// - `sets`: key \0 member -> ()
///
/// Writers hold the gate exclusively and the atomic primitives hold it
/// shared, so a scan never sees half of a pipeline.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    keys: sled::Tree,
    strings: sled::Tree,
    hashes: sled::Tree,
    sets: sled::Tree,
    gate: Arc<RwLock<()>>,
    limits: ScriptLimits,
}

impl SledStore {
    /// Open or create the sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_limits(path, ScriptLimits::unlimited())
    }

    pub fn open_with_limits(path: impl AsRef<Path>, limits: ScriptLimits) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self::from_db(db, limits)?;
        info!(path = %path.as_ref().display(), "Opened mirror store");
        Ok(store)
    }

    fn from_db(db: Db, limits: ScriptLimits) -> Result<Self> {
        let keys = db.open_tree("keys")?;
        let strings = db.open_tree("strings")?;
        let hashes = db.open_tree("hashes")?;
        let sets = db.open_tree("sets")?;
        Ok(Self {
            db,
            keys,
            strings,
            hashes,
            sets,
            gate: Arc::new(RwLock::new(())),
            limits,
        })
    }

    /// Flush dirty pages to disk; returns bytes flushed.
    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }

    fn shared(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.gate
            .read()
            .map_err(|_| MirrorError::StoreUnavailable("store gate poisoned".to_string()))
    }

    fn exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.gate
            .write()
            .map_err(|_| MirrorError::StoreUnavailable("store gate poisoned".to_string()))
    }

    fn kind(&self, key: &str) -> Result<Option<KeyKind>> {
        Ok(self
            .keys
            .get(key.as_bytes())?
            .and_then(|tag| tag.first().copied())
            .and_then(KeyKind::from_tag))
    }

    /// Create `key` as `kind`, or confirm it already is one.
    fn claim(&self, key: &str, kind: KeyKind) -> Result<()> {
        match self.kind(key)? {
            None => {
                self.keys.insert(key.as_bytes(), vec![kind.tag()])?;
                Ok(())
            }
            Some(existing) if existing == kind => Ok(()),
            Some(_) => Err(wrong_type(key, kind)),
        }
    }

    fn remove_key(&self, key: &str) -> Result<bool> {
        match self.kind(key)? {
            None => return Ok(false),
            Some(KeyKind::String) => {
                self.strings.remove(key.as_bytes())?;
            }
            Some(KeyKind::Hash) => clear_prefix(&self.hashes, &sub_prefix(key))?,
            Some(KeyKind::Set) => clear_prefix(&self.sets, &sub_prefix(key))?,
        }
        self.keys.remove(key.as_bytes())?;
        Ok(true)
    }

    fn read_hash(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let prefix = sub_prefix(key);
        let mut fields = BTreeMap::new();
        for item in self.hashes.scan_prefix(&prefix) {
            let (k, v) = item?;
            fields.insert(decode(&k[prefix.len()..])?, decode(&v)?);
        }
        Ok(fields)
    }

    fn read_set(&self, key: &str) -> Result<BTreeSet<String>> {
        let prefix = sub_prefix(key);
        let mut members = BTreeSet::new();
        for item in self.sets.scan_prefix(&prefix) {
            let (k, _) = item?;
            members.insert(decode(&k[prefix.len()..])?);
        }
        Ok(members)
    }

    /// Keys whose name starts with the pattern's literal prefix, with kinds.
    fn candidates<'a>(
        &'a self,
        glob: &'a GlobPattern,
    ) -> impl Iterator<Item = Result<(String, Option<KeyKind>)>> + 'a {
        self.keys
            .scan_prefix(glob.literal_prefix().as_bytes())
            .map(|item| -> Result<(String, Option<KeyKind>)> {
                let (k, tag) = item?;
                Ok((decode(&k)?, tag.first().copied().and_then(KeyKind::from_tag)))
            })
    }

    fn apply(&self, op: &Op) -> Result<()> {
        match op {
            Op::Set { key, value } => {
                check_key(key)?;
                if self.kind(key)? != Some(KeyKind::String) {
                    self.remove_key(key)?;
                    self.keys.insert(key.as_bytes(), vec![KeyKind::String.tag()])?;
                }
                self.strings.insert(key.as_bytes(), value.as_bytes())?;
            }
            Op::Delete { key } => {
                self.remove_key(key)?;
            }
            Op::HSet { key, fields } => {
                check_key(key)?;
                self.claim(key, KeyKind::Hash)?;
                for (field, value) in fields {
                    self.hashes.insert(sub_key(key, field), value.as_bytes())?;
                }
            }
            Op::SAdd { key, members } => {
                check_key(key)?;
                self.claim(key, KeyKind::Set)?;
                for member in members {
                    self.sets.insert(sub_key(key, member), Vec::<u8>::new())?;
                }
            }
        }
        Ok(())
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _gate = self.shared()?;
        match self.kind(key)? {
            None => Ok(None),
            Some(KeyKind::String) => self
                .strings
                .get(key.as_bytes())?
                .map(|v| decode(&v))
                .transpose(),
            Some(_) => Err(wrong_type(key, KeyKind::String)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let _gate = self.shared()?;
        Ok(self.keys.contains_key(key.as_bytes())?)
    }

    fn key_kind(&self, key: &str) -> Result<Option<KeyKind>> {
        let _gate = self.shared()?;
        self.kind(key)
    }

    fn incr(&self, key: &str, by: i64) -> Result<i64> {
        check_key(key)?;
        let _gate = self.exclusive()?;
        let current = match self.kind(key)? {
            None => 0,
            Some(KeyKind::String) => {
                let raw = self.strings.get(key.as_bytes())?.map(|v| decode(&v)).transpose()?;
                parse_counter(key, raw.as_deref())?
            }
            Some(_) => return Err(wrong_type(key, KeyKind::String)),
        };
        let next = current.checked_add(by).ok_or_else(|| MirrorError::WrongType {
            key: key.to_string(),
            expected: "integer in range",
        })?;
        self.keys.insert(key.as_bytes(), vec![KeyKind::String.tag()])?;
        self.strings.insert(key.as_bytes(), next.to_string().as_bytes())?;
        Ok(next)
    }

    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let _gate = self.shared()?;
        match self.kind(key)? {
            None => Ok(BTreeMap::new()),
            Some(KeyKind::Hash) => self.read_hash(key),
            Some(_) => Err(wrong_type(key, KeyKind::Hash)),
        }
    }

    fn smembers(&self, key: &str) -> Result<BTreeSet<String>> {
        let _gate = self.shared()?;
        match self.kind(key)? {
            None => Ok(BTreeSet::new()),
            Some(KeyKind::Set) => self.read_set(key),
            Some(_) => Err(wrong_type(key, KeyKind::Set)),
        }
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let glob = GlobPattern::new(pattern)?;
        let _gate = self.shared()?;
        let mut keys = Vec::new();
        for item in self.candidates(&glob) {
            let (key, _) = item?;
            if glob.matches(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn execute(&self, pipeline: Pipeline) -> Result<usize> {
        let _gate = self.exclusive()?;
        let mut applied = 0;
        for op in pipeline.ops() {
            self.apply(op)?;
            applied += 1;
        }
        Ok(applied)
    }

    fn scan_and_collect(&self, pattern: &str) -> Result<BTreeSet<String>> {
        let glob = GlobPattern::new(pattern)?;
        let _gate = self.shared()?;
        let mut clock = self.limits.start("scan_and_collect");
        let mut members = BTreeSet::new();
        for item in self.candidates(&glob) {
            clock.tick()?;
            let (key, kind) = item?;
            if kind == Some(KeyKind::Set) && glob.matches(&key) {
                members.extend(self.read_set(&key)?);
            }
        }
        Ok(members)
    }

    fn resolve_records(&self, ids: &[String], table: &TableKeys) -> Result<Vec<Record>> {
        let _gate = self.shared()?;
        let mut clock = self.limits.start("resolve_records");
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            clock.tick()?;
            let key = table.record_key(id);
            let fields = match self.kind(&key)? {
                Some(KeyKind::Hash) => self.read_hash(&key)?,
                _ => BTreeMap::new(),
            };
            if fields.is_empty() {
                records.push(Record::placeholder(id.clone()));
            } else {
                records.push(Record::new(id.clone(), fields));
            }
        }
        Ok(records)
    }

    fn scan_hashes(&self, pattern: &str) -> Result<Vec<String>> {
        let glob = GlobPattern::new(pattern)?;
        let _gate = self.shared()?;
        let mut clock = self.limits.start("scan_hashes");
        let mut keys = Vec::new();
        for item in self.candidates(&glob) {
            clock.tick()?;
            let (key, kind) = item?;
            if kind == Some(KeyKind::Hash) && glob.matches(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.contains('\0') {
        return Err(MirrorError::validation(format!("key contains NUL byte: {:?}", key)));
    }
    Ok(())
}

fn sub_prefix(key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(key.len() + 1);
    prefix.extend_from_slice(key.as_bytes());
    prefix.push(0);
    prefix
}

fn sub_key(key: &str, sub: &str) -> Vec<u8> {
    let mut k = sub_prefix(key);
    k.extend_from_slice(sub.as_bytes());
    k
}

fn clear_prefix(tree: &sled::Tree, prefix: &[u8]) -> Result<()> {
    let mut batch = sled::Batch::default();
    for item in tree.scan_prefix(prefix) {
        let (k, _) = item?;
        batch.remove(k);
    }
    tree.apply_batch(batch)?;
    Ok(())
}

fn decode(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| MirrorError::StoreUnavailable(format!("non UTF-8 data in store: {}", e)))
}
