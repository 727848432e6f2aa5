//! Ordered SNI routing rules.
//!
//! A routing table is a plain sequence of (pattern, target) rules. Rules are
//! tried in declaration order and the first pattern that matches anywhere in
//! the server name wins. The table is loaded once and never mutated, so it
//! is shared between sessions without locking.

use std::fmt;

use regex::Regex;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use tracing::debug;

/// A single routing rule: server-name pattern and backend `host:port`.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pattern: Regex,
    target: String,
}

impl RoutingRule {
    /// Compile a rule. The pattern is an unanchored regular expression.
    pub fn new(pattern: &str, target: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            target: target.into(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn matches(&self, server_name: &str) -> bool {
        self.pattern.is_match(server_name)
    }
}

/// Immutable, ordered routing table.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
}

impl RoutingTable {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    /// Build a table from `(pattern, target)` pairs, preserving their order.
    pub fn from_pairs<I, P, T>(pairs: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (P, T)>,
        P: AsRef<str>,
        T: Into<String>,
    {
        let rules = pairs
            .into_iter()
            .map(|(pattern, target)| RoutingRule::new(pattern.as_ref(), target))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Resolve a server name to the target of the first matching rule.
    ///
    /// An empty server name never matches.
    pub fn resolve(&self, server_name: &str) -> Option<&str> {
        if server_name.is_empty() {
            return None;
        }

        let (index, rule) = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(server_name))?;

        debug!(
            server_name = %server_name,
            rule_index = index,
            pattern = %rule.pattern(),
            target = %rule.target(),
            "Route matched"
        );
        Some(rule.target())
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Accepts a JSON array whose entries are either
/// `{"pattern": "...", "target": "..."}` or the grouped form
/// `{"<pattern>": "<target>", ...}`. Grouped entries expand in document
/// order.
impl<'de> Deserialize<'de> for RoutingTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(TableVisitor)
    }
}

struct TableVisitor;

impl<'de> Visitor<'de> for TableVisitor {
    type Value = RoutingTable;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a list of routing rules")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut rules = Vec::new();
        while let Some(RuleEntry(entry)) = seq.next_element()? {
            for (pattern, target) in entry {
                let rule = RoutingRule::new(&pattern, target).map_err(|e| {
                    de::Error::custom(format!("invalid rule pattern {pattern:?}: {e}"))
                })?;
                rules.push(rule);
            }
        }
        Ok(RoutingTable { rules })
    }
}

/// One element of the rules array, as ordered (pattern, target) pairs.
struct RuleEntry(Vec<(String, String)>);

impl<'de> Deserialize<'de> for RuleEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RuleEntryVisitor)
    }
}

struct RuleEntryVisitor;

impl<'de> Visitor<'de> for RuleEntryVisitor {
    type Value = RuleEntry;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a rule object mapping pattern to target")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        while let Some((key, value)) = map.next_entry::<String, String>()? {
            pairs.push((key, value));
        }

        let explicit = |name: &str| pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v);
        if pairs.len() == 2 {
            if let (Some(pattern), Some(target)) = (explicit("pattern"), explicit("target")) {
                return Ok(RuleEntry(vec![(pattern.clone(), target.clone())]));
            }
        }

        Ok(RuleEntry(pairs))
    }
}
