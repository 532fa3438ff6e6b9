use crate::error::{MirrorError, Result};
use crate::keys::INDEX_VALUE_SEPARATOR;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One source row as delivered by a row source.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Result key carrying a record's id.
pub const ID_FIELD: &str = "member";

/// Field written into placeholder records.
pub const PLACEHOLDER_FIELD: &str = "note";
pub const PLACEHOLDER_NOTE: &str = "no data found";

/// Sentinel primary key name requesting a generated id per row.
pub const GUID_SENTINEL: &str = "GUID";

/// Stringify a source value the way records store it (null becomes "").
pub fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A primary record: field name to string value, fields kept sorted.
///
/// Serialized as one flat object: `member` holds the id, unless the record
/// has its own `member` field, which then takes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let id_entry = !self.fields.contains_key(ID_FIELD);
        let mut map = serializer.serialize_map(Some(self.fields.len() + usize::from(id_entry)))?;
        if id_entry {
            map.serialize_entry(ID_FIELD, &self.id)?;
        }
        for (field, value) in &self.fields {
            map.serialize_entry(field, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut fields = BTreeMap::<String, String>::deserialize(deserializer)?;
        let id = fields
            .remove(ID_FIELD)
            .ok_or_else(|| serde::de::Error::missing_field(ID_FIELD))?;
        Ok(Record::new(id, fields))
    }
}

impl Record {
    pub fn new(id: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a record from a source row, coercing every value to a string.
    pub fn from_row(id: impl Into<String>, row: &Row) -> Self {
        let fields = row
            .iter()
            .map(|(k, v)| (k.clone(), stringify(v)))
            .collect();
        Self::new(id, fields)
    }

    /// Stand-in for an id whose primary record could not be resolved.
    pub fn placeholder(id: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(PLACEHOLDER_FIELD.to_string(), PLACEHOLDER_NOTE.to_string());
        Self::new(id, fields)
    }

    pub fn is_placeholder(&self) -> bool {
        self.fields.len() == 1
            && self.fields.get(PLACEHOLDER_FIELD).map(String::as_str) == Some(PLACEHOLDER_NOTE)
    }

    /// Value of `field`; `member` falls back to the id when the record has
    /// no field of that name.
    pub fn get(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(value) => Some(value.as_str()),
            None if field == ID_FIELD => Some(self.id.as_str()),
            None => None,
        }
    }
}

// --- Query input ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[serde(alias = "UNION")]
    Union,
    #[serde(alias = "INTERSECT")]
    Intersect,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// How many records survive truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopN {
    #[default]
    All,
    Count(usize),
}

impl Serialize for TopN {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            TopN::All => serializer.serialize_str("ALL"),
            TopN::Count(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for TopN {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(0) => Err(serde::de::Error::custom("top_n must be a positive integer")),
            Raw::Count(n) => Ok(TopN::Count(n as usize)),
            Raw::Text(s) if s == "ALL" => Ok(TopN::All),
            Raw::Text(s) => Err(serde::de::Error::custom(format!(
                "top_n must be a positive integer or \"ALL\", got \"{}\"",
                s
            ))),
        }
    }
}

/// One index lookup: `index` name plus a value pattern (may hold wildcards).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    pub index: String,
    pub criteria: String,
}

impl Criterion {
    pub fn new(index: impl Into<String>, criteria: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            criteria: criteria.into(),
        }
    }
}

/// Query filter, validated when deserialized or built.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "FilterPayload")]
pub struct Filter {
    pub operation: Operation,
    pub namespace: String,
    #[serde(rename = "parentKey")]
    pub parent_key: String,
    pub criteria: Vec<Criterion>,
    #[serde(rename = "sortby", skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(rename = "sortorder")]
    pub sort_order: SortOrder,
    pub top_n: TopN,
}

#[derive(Deserialize)]
struct FilterPayload {
    operation: Operation,
    namespace: String,
    #[serde(rename = "parentKey", alias = "parent_key")]
    parent_key: String,
    criteria: Vec<Criterion>,
    #[serde(default)]
    sortby: Option<String>,
    #[serde(default)]
    sortorder: Option<SortOrder>,
    #[serde(default, alias = "topN")]
    top_n: Option<TopN>,
}

impl TryFrom<FilterPayload> for Filter {
    type Error = MirrorError;

    fn try_from(raw: FilterPayload) -> Result<Self> {
        let filter = Filter {
            operation: raw.operation,
            namespace: raw.namespace,
            parent_key: raw.parent_key,
            criteria: raw.criteria,
            sort_by: raw.sortby,
            sort_order: raw.sortorder.unwrap_or_default(),
            top_n: raw.top_n.unwrap_or_default(),
        };
        filter.validate()?;
        Ok(filter)
    }
}

impl Filter {
    pub fn new(operation: Operation, namespace: &str, parent_key: &str) -> Self {
        Self {
            operation,
            namespace: namespace.to_string(),
            parent_key: parent_key.to_string(),
            criteria: Vec::new(),
            sort_by: None,
            sort_order: SortOrder::Asc,
            top_n: TopN::All,
        }
    }

    pub fn union(namespace: &str, parent_key: &str) -> Self {
        Self::new(Operation::Union, namespace, parent_key)
    }

    pub fn intersect(namespace: &str, parent_key: &str) -> Self {
        Self::new(Operation::Intersect, namespace, parent_key)
    }

    pub fn criterion(mut self, index: &str, pattern: &str) -> Self {
        self.criteria.push(Criterion::new(index, pattern));
        self
    }

    pub fn sort(mut self, field: &str, order: SortOrder) -> Self {
        self.sort_by = Some(field.to_string());
        self.sort_order = order;
        self
    }

    pub fn top(mut self, top_n: TopN) -> Self {
        self.top_n = top_n;
        self
    }

    /// Reject filters the executor cannot run meaningfully.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(MirrorError::validation("filter namespace is empty"));
        }
        if self.parent_key.is_empty() {
            return Err(MirrorError::validation("filter parent_key is empty"));
        }
        if self.criteria.is_empty() {
            return Err(MirrorError::validation("filter has no criteria"));
        }
        for (i, c) in self.criteria.iter().enumerate() {
            if c.index.is_empty() {
                return Err(MirrorError::validation(format!("criterion {} has no index", i)));
            }
            if c.criteria.is_empty() {
                return Err(MirrorError::validation(format!(
                    "criterion {} on index {} has no value",
                    i, c.index
                )));
            }
        }
        if let Some(field) = &self.sort_by {
            if field.is_empty() {
                return Err(MirrorError::validation("sortby is empty"));
            }
        }
        if self.top_n == TopN::Count(0) {
            return Err(MirrorError::validation("top_n must be a positive integer"));
        }
        Ok(())
    }
}

// --- Hydration input ---

/// Secondary index specification, `IndexName[:Field1[:Field2...]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
}

impl IndexSpec {
    /// Composite index value: listed field values joined with `|`, in order.
    /// Returns the first field missing from the record.
    pub fn value_for(&self, record: &Record) -> std::result::Result<String, &str> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            match record.fields.get(field) {
                Some(v) => parts.push(v.as_str()),
                None => return Err(field.as_str()),
            }
        }
        Ok(parts.join(INDEX_VALUE_SEPARATOR))
    }
}

impl FromStr for IndexSpec {
    type Err = MirrorError;

    fn from_str(spec: &str) -> Result<Self> {
        let tokens: Vec<&str> = spec.split(':').collect();
        if tokens.iter().any(|t| t.is_empty()) {
            return Err(MirrorError::validation(format!("malformed index spec '{}'", spec)));
        }
        let name = tokens[0].to_string();
        let fields = if tokens.len() > 1 {
            tokens[1..].iter().map(|t| t.to_string()).collect()
        } else {
            vec![name.clone()]
        };
        Ok(Self { name, fields })
    }
}

impl TryFrom<String> for IndexSpec {
    type Error = MirrorError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<IndexSpec> for String {
    fn from(spec: IndexSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.len() == 1 && self.fields[0] == self.name {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.name, self.fields.join(":"))
        }
    }
}

/// Where record ids come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryKey {
    Field(String),
    /// Fresh random id per row.
    Guid,
}

impl FromStr for PrimaryKey {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Err(MirrorError::validation("primary key field is empty")),
            GUID_SENTINEL => Ok(PrimaryKey::Guid),
            field => Ok(PrimaryKey::Field(field.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    #[default]
    All,
    Any,
}

impl FromStr for Combinator {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(Combinator::All),
            "ANY" => Ok(Combinator::Any),
            other => Err(MirrorError::validation(format!(
                "row filter combinator must be ALL or ANY, got '{}'",
                other
            ))),
        }
    }
}

/// Single-field equality predicate against the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPredicate {
    pub field: String,
    pub value: String,
}

impl RowPredicate {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

impl FromStr for RowPredicate {
    type Err = MirrorError;

    /// `field=value`
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((field, value)) if !field.is_empty() => Ok(Self::new(field, value)),
            _ => Err(MirrorError::validation(format!(
                "row predicate must look like field=value, got '{}'",
                s
            ))),
        }
    }
}

/// Ordered predicates combined with ALL (and) or ANY (or).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowFilter {
    pub predicates: Vec<RowPredicate>,
    pub combinator: Combinator,
}

impl RowFilter {
    pub fn new(predicates: Vec<RowPredicate>, combinator: Combinator) -> Self {
        Self {
            predicates,
            combinator,
        }
    }

    /// Build from the single-key `{field: value}` maps used by callers.
    pub fn from_maps(maps: &[BTreeMap<String, String>], combinator: Combinator) -> Self {
        let predicates = maps
            .iter()
            .flat_map(|m| m.iter().map(|(k, v)| RowPredicate::new(k, v)))
            .collect();
        Self::new(predicates, combinator)
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Evaluate against an in-memory row, comparing stringified values.
    pub fn matches(&self, row: &Row) -> bool {
        if self.predicates.is_empty() {
            return true;
        }
        let hit = |p: &RowPredicate| row.get(&p.field).map(stringify).as_deref() == Some(p.value.as_str());
        match self.combinator {
            Combinator::All => self.predicates.iter().all(hit),
            Combinator::Any => self.predicates.iter().any(hit),
        }
    }
}
