//! Key layout of the mirror and store glob patterns
//!
//! Every key of a mirrored table lives under a table prefix:
//! `namespace:table` (unversioned) or `namespace:table#<generation>`.
//! Primary records are `<prefix>:<id>` hashes, index entries are
//! `<prefix>:<INDEX>:<value>` sets. The generation pointer and sequence
//! counter sit beside the prefix (`namespace:table@current`, `@seq`) so that
//! table-wide patterns never match them.

use crate::error::{MirrorError, Result};
use regex::Regex;
use std::fmt;

/// Separator between composite index field values.
pub const INDEX_VALUE_SEPARATOR: &str = "|";

/// Key prefix of one mirrored table, optionally pinned to a generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableKeys {
    pub namespace: String,
    pub table: String,
    pub generation: Option<u64>,
}

impl TableKeys {
    /// Unversioned layout (`namespace:table`).
    pub fn new(namespace: &str, table: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            table: parent_key(table).to_string(),
            generation: None,
        }
    }

    pub fn with_generation(&self, generation: u64) -> Self {
        Self {
            generation: Some(generation),
            ..self.clone()
        }
    }

    pub fn prefix(&self) -> String {
        match self.generation {
            Some(generation) => format!("{}:{}#{}", self.namespace, self.table, generation),
            None => format!("{}:{}", self.namespace, self.table),
        }
    }

    pub fn record_key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix(), id)
    }

    pub fn index_key(&self, index: &str, value: &str) -> String {
        format!("{}:{}:{}", self.prefix(), index, value)
    }

    /// Pattern over the index entries of `index`; `value_pattern` keeps its
    /// wildcards.
    pub fn index_pattern(&self, index: &str, value_pattern: &str) -> String {
        format!("{}:{}:{}", escape_glob(&self.prefix()), index, value_pattern)
    }

    /// Every key of this prefix (records and index entries).
    pub fn all_pattern(&self) -> String {
        format!("{}:*", escape_glob(&self.prefix()))
    }

    /// Every generation-tagged key of the table, whatever the generation.
    pub fn all_generations_pattern(&self) -> String {
        format!("{}#*", escape_glob(&self.unversioned().prefix()))
    }

    pub fn unversioned(&self) -> Self {
        Self {
            generation: None,
            ..self.clone()
        }
    }

    pub fn current_pointer_key(&self) -> String {
        format!("{}:{}@current", self.namespace, self.table)
    }

    pub fn sequence_key(&self) -> String {
        format!("{}:{}@seq", self.namespace, self.table)
    }

    /// True if `key` belongs to this exact prefix.
    pub fn owns(&self, key: &str) -> bool {
        key.strip_prefix(&self.prefix())
            .is_some_and(|rest| rest.starts_with(':'))
    }
}

impl fmt::Display for TableKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix())
    }
}

/// Parent key of a (possibly fully qualified) source table name:
/// `DB.SCHEMA.VW_ACCOUNTS` mirrors under `VW_ACCOUNTS`.
pub fn parent_key(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

/// Escape store glob metacharacters so `literal` only matches itself.
pub fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Compiled store glob pattern.
///
/// Supports `*` (any run), `?` (one char), `[abc]`, `[^a]`/`[!a]`, `[a-z]`
/// classes and `\` escapes. Matching covers the whole key.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
    literal_prefix: String,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut re = String::from("(?s)^");
        let mut literal_prefix = String::new();
        let mut in_prefix = true;
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    in_prefix = false;
                    re.push_str(".*");
                }
                '?' => {
                    in_prefix = false;
                    re.push('.');
                }
                '[' => {
                    in_prefix = false;
                    let mut class = String::from("[");
                    if matches!(chars.peek(), Some('^') | Some('!')) {
                        chars.next();
                        class.push('^');
                    }
                    let mut closed = false;
                    while let Some(inner) = chars.next() {
                        match inner {
                            ']' => {
                                closed = true;
                                break;
                            }
                            '\\' => {
                                if let Some(escaped) = chars.next() {
                                    class.push_str(&regex::escape(&escaped.to_string()));
                                }
                            }
                            '-' => class.push('-'),
                            other => class.push_str(&regex::escape(&other.to_string())),
                        }
                    }
                    if !closed {
                        return Err(MirrorError::validation(format!(
                            "unterminated character class in pattern '{}'",
                            pattern
                        )));
                    }
                    class.push(']');
                    re.push_str(&class);
                }
                '\\' => {
                    let escaped = chars.next().unwrap_or('\\');
                    if in_prefix {
                        literal_prefix.push(escaped);
                    }
                    re.push_str(&regex::escape(&escaped.to_string()));
                }
                other => {
                    if in_prefix {
                        literal_prefix.push(other);
                    }
                    re.push_str(&regex::escape(&other.to_string()));
                }
            }
        }
        re.push('$');

        let regex = Regex::new(&re)
            .map_err(|e| MirrorError::validation(format!("invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
            literal_prefix,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Leading literal part of the pattern; every match starts with it.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_key_layout() {
        let keys = TableKeys::new("cms_sre", "DB.SCHEMA.VW_AWS_ACCOUNTS");
        assert_eq!(keys.prefix(), "cms_sre:VW_AWS_ACCOUNTS");
        assert_eq!(keys.record_key("42"), "cms_sre:VW_AWS_ACCOUNTS:42");

        let gen = keys.with_generation(3);
        assert_eq!(gen.index_key("ENV", "Prod"), "cms_sre:VW_AWS_ACCOUNTS#3:ENV:Prod");
        assert_eq!(gen.current_pointer_key(), "cms_sre:VW_AWS_ACCOUNTS@current");
        assert_eq!(gen.sequence_key(), "cms_sre:VW_AWS_ACCOUNTS@seq");
        assert!(gen.owns("cms_sre:VW_AWS_ACCOUNTS#3:ENV:Prod"));
        assert!(!gen.owns("cms_sre:VW_AWS_ACCOUNTS#31:ENV:Prod"));
    }

    #[test]
    fn test_glob_wildcards() {
        let p = GlobPattern::new("ns:t:NAME:al2023*").unwrap();
        assert!(p.matches("ns:t:NAME:al2023-ami-x86"));
        assert!(p.matches("ns:t:NAME:al2023"));
        assert!(!p.matches("ns:t:NAME:amzn2"));
        assert_eq!(p.literal_prefix(), "ns:t:NAME:al2023");

        let q = GlobPattern::new("ns:t:REGION:us-e?st-1").unwrap();
        assert!(q.matches("ns:t:REGION:us-east-1"));
        assert!(!q.matches("ns:t:REGION:us-eaast-1"));
    }

    #[test]
    fn test_glob_classes_and_escapes() {
        let p = GlobPattern::new("k:[a-c]x").unwrap();
        assert!(p.matches("k:bx"));
        assert!(!p.matches("k:dx"));

        let n = GlobPattern::new("k:[^a]x").unwrap();
        assert!(n.matches("k:bx"));
        assert!(!n.matches("k:ax"));

        let e = GlobPattern::new("k:a\\*b").unwrap();
        assert!(e.matches("k:a*b"));
        assert!(!e.matches("k:axb"));

        assert!(GlobPattern::new("k:[abc").is_err());
    }

    #[test]
    fn test_regex_metachars_are_literal() {
        let p = GlobPattern::new("ns:t:V:1.5|2").unwrap();
        assert!(p.matches("ns:t:V:1.5|2"));
        assert!(!p.matches("ns:t:V:1x5|2"));
    }

    #[test]
    fn test_escaped_prefix_survives_generation_patterns() {
        let keys = TableKeys::new("ns", "t").with_generation(7);
        let p = GlobPattern::new(&keys.index_pattern("REGION", "u*")).unwrap();
        assert!(p.matches("ns:t#7:REGION:us"));
        assert!(!p.matches("ns:t#8:REGION:us"));

        let all = GlobPattern::new(&keys.all_generations_pattern()).unwrap();
        assert!(all.matches("ns:t#1:abc"));
        assert!(!all.matches("ns:t:abc"));
        assert!(!all.matches("ns:t@current"));
    }
}
