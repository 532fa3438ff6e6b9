//! Query Executor for the mirror
//!
//! Each criterion becomes one glob pattern over a table's index entries and
//! one atomic `scan_and_collect` call in the store. Candidate id sets are
//! folded with the filter's union/intersect operation, resolved to records in
//! bounded chunks, sorted and truncated.
//! E.g., union of `REGION = us*` and `ENV = Prod`, sorted by `CREATION_DATE`.

use crate::error::{MirrorError, Result};
use crate::keys::TableKeys;
use crate::models::{Filter, Operation, Record, SortOrder, TopN};
use crate::storage::{resolve_table, KeyValueStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Ids resolved to records per atomic store call.
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConfig {
    pub chunk_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Read-only view of the mirror; never writes to the store.
pub struct QueryExecutor<S: KeyValueStore> {
    store: Arc<S>,
    config: QueryConfig,
}

impl<S: KeyValueStore> QueryExecutor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, QueryConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: QueryConfig) -> Self {
        Self { store, config }
    }

    /// Run a filter, failing closed: any error is logged and yields an
    /// empty result. Use [`QueryExecutor::try_search`] to tell the two apart.
    #[instrument(skip(self, filter), fields(namespace = %filter.namespace, table = %filter.parent_key))]
    pub fn search(&self, filter: &Filter) -> Vec<Record> {
        match self.try_search(filter) {
            Ok(records) => records,
            Err(e) => {
                report_failure(&e);
                Vec::new()
            }
        }
    }

    /// Run a filter, surfacing validation and store errors.
    pub fn try_search(&self, filter: &Filter) -> Result<Vec<Record>> {
        filter.validate()?;
        let timer = Instant::now();
        let table = resolve_table(self.store.as_ref(), &filter.namespace, &filter.parent_key)?;

        let ids = self.candidates(&table, filter)?;
        let mut records = self.resolve(&ids, &table)?;
        if let Some(field) = filter.sort_by.as_deref() {
            sort_records(&mut records, field, filter.sort_order);
        }
        truncate(&mut records, filter.top_n);

        info!(
            operation = ?filter.operation,
            criteria = filter.criteria.len(),
            matched = ids.len(),
            returned = records.len(),
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "Search on {}",
            table
        );
        Ok(records)
    }

    /// Fold each criterion's candidate set with the filter's operation.
    fn candidates(&self, table: &TableKeys, filter: &Filter) -> Result<BTreeSet<String>> {
        let mut combined: Option<BTreeSet<String>> = None;
        for criterion in &filter.criteria {
            let pattern = table.index_pattern(&criterion.index, &criterion.criteria);
            let members = self.store.scan_and_collect(&pattern)?;
            debug!(pattern = %pattern, members = members.len(), "Collected criterion members");

            let next = match combined.take() {
                None => members,
                Some(acc) => combine(filter.operation, acc, members),
            };
            if filter.operation == Operation::Intersect && next.is_empty() {
                return Ok(next);
            }
            combined = Some(next);
        }
        Ok(combined.unwrap_or_default())
    }

    /// Resolve ids to records in chunks of at most `chunk_size`, preserving
    /// id order. Missing records come back as placeholders.
    pub fn resolve(&self, ids: &BTreeSet<String>, table: &TableKeys) -> Result<Vec<Record>> {
        let ids: Vec<String> = ids.iter().cloned().collect();
        let mut records = Vec::with_capacity(ids.len());
        for (i, chunk) in ids.chunks(self.config.chunk_size.max(1)).enumerate() {
            debug!(chunk = i, ids = chunk.len(), "Resolving chunk");
            records.extend(self.store.resolve_records(chunk, table)?);
        }
        Ok(records)
    }

    /// Primary record of `id`, if the mirror has it.
    pub fn lookup(&self, namespace: &str, table: &str, id: &str) -> Result<Option<Record>> {
        if id.is_empty() {
            return Err(MirrorError::validation("lookup id is empty"));
        }
        let table = resolve_table(self.store.as_ref(), namespace, table)?;
        let fields = self.store.hgetall(&table.record_key(id))?;
        Ok((!fields.is_empty()).then(|| Record::new(id, fields)))
    }

    /// Every primary record of the table's live generation, ordered by id.
    pub fn all_records(&self, namespace: &str, table: &str) -> Result<Vec<Record>> {
        let table = resolve_table(self.store.as_ref(), namespace, table)?;
        let prefix = format!("{}:", table.prefix());
        let ids: BTreeSet<String> = self
            .store
            .scan_hashes(&table.all_pattern())?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        self.resolve(&ids, &table)
    }
}

/// Union or intersection of two candidate sets.
pub fn combine(operation: Operation, mut acc: BTreeSet<String>, members: BTreeSet<String>) -> BTreeSet<String> {
    match operation {
        Operation::Union => {
            acc.extend(members);
            acc
        }
        Operation::Intersect => {
            acc.retain(|id| members.contains(id));
            acc
        }
    }
}

/// Stable sort on one field's string value; a missing field sorts as "".
/// `member` sorts by id unless the records carry such a field.
pub fn sort_records(records: &mut [Record], field: &str, order: SortOrder) {
    fn value<'r>(record: &'r Record, field: &str) -> &'r str {
        record.get(field).unwrap_or("")
    }
    match order {
        SortOrder::Asc => records.sort_by(|a, b| value(a, field).cmp(value(b, field))),
        SortOrder::Desc => records.sort_by(|a, b| value(b, field).cmp(value(a, field))),
    }
}

pub fn truncate(records: &mut Vec<Record>, top_n: TopN) {
    if let TopN::Count(n) = top_n {
        records.truncate(n);
    }
}

fn report_failure(err: &MirrorError) {
    match err {
        MirrorError::StoreScriptAborted { operation, .. } => warn!(
            operation = %operation,
            error = %err,
            "Too many results, narrow down the search (store limit reached)"
        ),
        MirrorError::Validation(_) => warn!(error = %err, "Rejected search filter"),
        _ => error!(error = %err, "Search failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::{HydrationRequest, Hydrator};
    use crate::models::PrimaryKey;
    use crate::source::MemorySource;
    use crate::storage::{MemoryStore, Pipeline, ScriptLimits};
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Unversioned mirror of AMIs seeded straight into the store.
    fn ami_store(limits: ScriptLimits) -> Arc<MemoryStore> {
        let store = MemoryStore::with_limits(limits);
        let table = TableKeys::new("ig", "VW_ALL_AMI_DATA");
        let amis = [
            ("a1", "al2023-ami-1", "us-east-1", "2024-03-01"),
            ("a2", "al2023-ami-2", "us-west-2", "2024-01-15"),
            ("a3", "amzn2-ami-1", "us-east-1", "2023-11-30"),
            ("a4", "al2023-ami-3", "eu-west-1", "2024-01-15"),
        ];
        let mut pipe = Pipeline::new();
        for (id, name, region, created) in amis {
            pipe.hset(
                table.record_key(id),
                fields(&[("ID", id), ("NAME", name), ("REGION", region), ("CREATION_DATE", created)]),
            );
            pipe.sadd(table.index_key("NAME", name), id);
            pipe.sadd(table.index_key("REGION", region), id);
        }
        store.execute(pipe).unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_region_scenario_through_hydration() -> Result<()> {
        let source = MemorySource::new();
        source.insert_table(
            "regions",
            MemorySource::rows(vec![
                json!({"id": 1, "region": "us"}),
                json!({"id": 2, "region": "us"}),
                json!({"id": 3, "region": "eu"}),
            ]),
        );
        let store = Arc::new(MemoryStore::new());
        let request = HydrationRequest::new("regions", "ns", PrimaryKey::Field("id".to_string()))
            .index("REGION:region".parse().unwrap());
        Hydrator::new(store.clone(), Arc::new(source)).hydrate(&request).await?;

        let executor = QueryExecutor::new(store);
        let us = executor.try_search(&Filter::union("ns", "regions").criterion("REGION", "us"))?;
        assert_eq!(ids(&us), vec!["1", "2"]);

        let both = executor.try_search(
            &Filter::union("ns", "regions")
                .criterion("REGION", "us")
                .criterion("REGION", "eu"),
        )?;
        assert_eq!(ids(&both), vec!["1", "2", "3"]);

        let neither = executor.try_search(
            &Filter::intersect("ns", "regions")
                .criterion("REGION", "us")
                .criterion("REGION", "eu"),
        )?;
        assert!(neither.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_member_column_yields_one_result_key() -> Result<()> {
        let source = MemorySource::new();
        source.insert_table(
            "users",
            MemorySource::rows(vec![json!({"id": "1", "member": "alice", "k": "x"})]),
        );
        let store = Arc::new(MemoryStore::new());
        let request = HydrationRequest::new("users", "ns", PrimaryKey::Field("id".to_string()))
            .index("K:k".parse().unwrap());
        Hydrator::new(store.clone(), Arc::new(source)).hydrate(&request).await?;

        let records = QueryExecutor::new(store).try_search(&Filter::union("ns", "users").criterion("K", "x"))?;
        let text = serde_json::to_string(&records)?;
        assert_eq!(text.matches("\"member\"").count(), 1);

        let back: Vec<Record> = serde_json::from_str(&text)?;
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].get("member"), Some("alice"));
        assert_eq!(back[0].get("id"), Some("1"));
        Ok(())
    }

    #[test]
    fn test_sort_by_member_uses_ids() {
        let executor = QueryExecutor::new(ami_store(ScriptLimits::unlimited()));
        let filter = Filter::union("ig", "VW_ALL_AMI_DATA")
            .criterion("NAME", "*")
            .sort("member", SortOrder::Desc);
        assert_eq!(ids(&executor.search(&filter)), vec!["a4", "a3", "a2", "a1"]);
    }

    #[test]
    fn test_wildcards_and_intersect() {
        let executor = QueryExecutor::new(ami_store(ScriptLimits::unlimited()));
        let filter = Filter::intersect("ig", "VW_ALL_AMI_DATA")
            .criterion("NAME", "al2023*")
            .criterion("REGION", "us-*");
        assert_eq!(ids(&executor.search(&filter)), vec!["a1", "a2"]);
    }

    #[test]
    fn test_disjoint_union_adds_counts() {
        let executor = QueryExecutor::new(ami_store(ScriptLimits::unlimited()));
        let east = Filter::union("ig", "VW_ALL_AMI_DATA").criterion("REGION", "us-east-1");
        let eu = Filter::union("ig", "VW_ALL_AMI_DATA").criterion("REGION", "eu-*");
        let both = Filter::union("ig", "VW_ALL_AMI_DATA")
            .criterion("REGION", "us-east-1")
            .criterion("REGION", "eu-*");
        let mut inter = both.clone();
        inter.operation = Operation::Intersect;

        let (a, b) = (executor.search(&east).len(), executor.search(&eu).len());
        assert_eq!(executor.search(&both).len(), a + b);
        assert!(executor.search(&inter).is_empty());
    }

    #[test]
    fn test_empty_criterion_is_identity_and_annihilator() {
        let executor = QueryExecutor::new(ami_store(ScriptLimits::unlimited()));
        let union = Filter::union("ig", "VW_ALL_AMI_DATA")
            .criterion("REGION", "ap-*")
            .criterion("REGION", "us-west-2");
        assert_eq!(ids(&executor.search(&union)), vec!["a2"]);

        let intersect = Filter::intersect("ig", "VW_ALL_AMI_DATA")
            .criterion("REGION", "ap-*")
            .criterion("REGION", "us-west-2");
        assert!(executor.search(&intersect).is_empty());
    }

    #[test]
    fn test_sort_and_top_n() {
        let executor = QueryExecutor::new(ami_store(ScriptLimits::unlimited()));
        let base = Filter::union("ig", "VW_ALL_AMI_DATA").criterion("NAME", "*");

        let asc = executor.search(&base.clone().sort("CREATION_DATE", SortOrder::Asc));
        assert_eq!(ids(&asc), vec!["a3", "a2", "a4", "a1"]);

        let desc = executor.search(&base.clone().sort("CREATION_DATE", SortOrder::Desc));
        // a2 and a4 tie and keep their id order
        assert_eq!(ids(&desc), vec!["a1", "a2", "a4", "a3"]);

        let top = executor.search(
            &base
                .clone()
                .sort("CREATION_DATE", SortOrder::Desc)
                .top(TopN::Count(2)),
        );
        assert_eq!(ids(&top), vec!["a1", "a2"]);

        assert_eq!(executor.search(&base.clone().top(TopN::All)).len(), 4);
        assert_eq!(executor.search(&base.top(TopN::Count(10))).len(), 4);
    }

    #[test]
    fn test_vanished_record_becomes_placeholder() {
        let store = ami_store(ScriptLimits::unlimited());
        let table = TableKeys::new("ig", "VW_ALL_AMI_DATA");
        store.delete(&[table.record_key("a3")]).unwrap();

        let executor = QueryExecutor::new(store);
        let records = executor.search(
            &Filter::union("ig", "VW_ALL_AMI_DATA")
                .criterion("REGION", "us-east-1")
                .sort("NAME", SortOrder::Asc),
        );
        assert_eq!(records.len(), 2);
        // placeholder has no NAME, so it sorts first
        assert_eq!(records[0].id, "a3");
        assert!(records[0].is_placeholder());
        assert_eq!(records[0].get("note"), Some("no data found"));
        assert_eq!(records[1].get("NAME"), Some("al2023-ami-1"));
    }

    #[test]
    fn test_store_abort_fails_closed() {
        let executor = QueryExecutor::new(ami_store(ScriptLimits::unlimited().with_max_steps(2)));
        let filter = Filter::union("ig", "VW_ALL_AMI_DATA").criterion("NAME", "*");

        assert!(executor.search(&filter).is_empty());
        let err = executor.try_search(&filter).unwrap_err();
        assert!(err.is_script_abort());
        assert!(err.to_string().contains("scan_and_collect"));
    }

    #[test]
    fn test_resolve_abort_fails_closed() {
        // each criterion scans one key; resolving four ids exceeds a budget of 3
        let store = ami_store(ScriptLimits::unlimited().with_max_steps(3));
        let executor = QueryExecutor::new(store);
        let filter = Filter::union("ig", "VW_ALL_AMI_DATA").criterion("REGION", "us-east-1");
        assert_eq!(executor.try_search(&filter).unwrap().len(), 2);

        let wide = Filter::union("ig", "VW_ALL_AMI_DATA")
            .criterion("REGION", "us-east-1")
            .criterion("REGION", "us-west-2")
            .criterion("REGION", "eu-west-1");
        let err = executor.try_search(&wide).unwrap_err();
        assert!(err.to_string().contains("resolve_records"));
        assert!(executor.search(&wide).is_empty());
    }

    #[test]
    fn test_invalid_filter_is_rejected_not_run() {
        let executor = QueryExecutor::new(ami_store(ScriptLimits::unlimited()));
        let empty = Filter::union("ig", "VW_ALL_AMI_DATA");
        assert!(matches!(executor.try_search(&empty), Err(MirrorError::Validation(_))));
        assert!(executor.search(&empty).is_empty());
    }

    #[test]
    fn test_unknown_table_is_empty() {
        let executor = QueryExecutor::new(ami_store(ScriptLimits::unlimited()));
        let filter = Filter::union("ig", "NOPE").criterion("NAME", "*");
        assert!(executor.try_search(&filter).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_and_all_records() {
        let executor = QueryExecutor::new(ami_store(ScriptLimits::unlimited()));
        let a2 = executor.lookup("ig", "VW_ALL_AMI_DATA", "a2").unwrap().unwrap();
        assert_eq!(a2.get("REGION"), Some("us-west-2"));
        assert!(executor.lookup("ig", "VW_ALL_AMI_DATA", "zz").unwrap().is_none());
        assert!(executor.lookup("ig", "VW_ALL_AMI_DATA", "").is_err());

        let all = executor.all_records("ig", "VW_ALL_AMI_DATA").unwrap();
        assert_eq!(ids(&all), vec!["a1", "a2", "a3", "a4"]);
        assert!(all.iter().all(|r| !r.is_placeholder()));
    }

    #[test]
    fn test_combine() {
        let a: BTreeSet<String> = ["1", "2"].iter().map(|s| s.to_string()).collect();
        let b: BTreeSet<String> = ["2", "3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(combine(Operation::Union, a.clone(), b.clone()).len(), 3);
        let both: Vec<String> = combine(Operation::Intersect, a, b).into_iter().collect();
        assert_eq!(both, vec!["2"]);
    }

    fn seeded_store(present: &BTreeSet<String>, missing: &BTreeSet<String>) -> (Arc<MemoryStore>, TableKeys) {
        let store = MemoryStore::new();
        let table = TableKeys::new("ns", "t");
        let mut pipe = Pipeline::new();
        for id in present {
            pipe.hset(table.record_key(id), fields(&[("v", id)]));
        }
        for id in missing {
            pipe.sadd(table.index_key("IDX", "x"), id.as_str());
        }
        store.execute(pipe).unwrap();
        (Arc::new(store), table)
    }

    proptest! {
        #[test]
        fn prop_chunking_neither_loses_nor_duplicates(
            ids in prop::collection::btree_set("[a-z0-9]{1,6}", 0..40),
            chunk_size in prop_oneof![Just(1usize), Just(7usize), Just(100_000usize)],
        ) {
            let present: BTreeSet<String> = ids.iter().filter(|id| id.len() % 2 == 0).cloned().collect();
            let missing: BTreeSet<String> = ids.difference(&present).cloned().collect();
            let (store, table) = seeded_store(&present, &missing);

            let executor = QueryExecutor::with_config(store, QueryConfig { chunk_size });
            let records = executor.resolve(&ids, &table).unwrap();

            let resolved: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            let expected: Vec<String> = ids.iter().cloned().collect();
            prop_assert_eq!(resolved, expected);
            for r in &records {
                prop_assert_eq!(r.is_placeholder(), !present.contains(&r.id));
            }
        }

        #[test]
        fn prop_sort_is_ordered_and_stable(
            keys in prop::collection::vec(prop_oneof![Just("a"), Just("b"), Just("c"), Just("")], 0..30),
            desc in any::<bool>(),
        ) {
            let mut records: Vec<Record> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| {
                    let seq = format!("{:03}", i);
                    let mut f = fields(&[("seq", seq.as_str())]);
                    if !k.is_empty() {
                        f.insert("K".to_string(), k.to_string());
                    }
                    Record::new(i.to_string(), f)
                })
                .collect();
            let order = if desc { SortOrder::Desc } else { SortOrder::Asc };
            sort_records(&mut records, "K", order);

            for pair in records.windows(2) {
                let (a, b) = (pair[0].get("K").unwrap_or(""), pair[1].get("K").unwrap_or(""));
                if desc {
                    prop_assert!(a >= b);
                } else {
                    prop_assert!(a <= b);
                }
                if a == b {
                    prop_assert!(pair[0].get("seq") < pair[1].get("seq"));
                }
            }
        }

        #[test]
        fn prop_top_n_is_exact_prefix(n in 1usize..10, len in 0usize..12) {
            let mut records: Vec<Record> = (0..len).map(|i| Record::new(format!("{:02}", i), BTreeMap::new())).collect();
            let full = records.clone();
            truncate(&mut records, TopN::Count(n));
            prop_assert_eq!(records.len(), n.min(len));
            prop_assert_eq!(&records[..], &full[..n.min(len)]);
        }
    }
}
