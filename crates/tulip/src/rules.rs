//! Sorted policy-rule storage.
//!
//! Rules are fixed-width tuples of [`RULE_WIDTH`] strings, padded with empty
//! strings past the logical end so the in-memory shape always matches the six
//! value columns of the storage schema. [`RuleSet`] keeps rules in
//! lexicographic order, which makes exact lookups and literal-prefix filters
//! binary searches instead of scans.

use std::cmp::Ordering;
use std::fmt;

use sha2::{Digest, Sha256};

/// Number of value positions in a stored rule. Matches the `v0..v5` columns
/// of the rule table.
pub const RULE_WIDTH: usize = 6;

/// Which of the two rule caches a rule belongs to.
///
/// Base policies (`p`) are matched directly against requests; grouping
/// policies (`g`) express role membership and are only consulted to expand a
/// request's subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyType {
    /// Base policy, wire tag `"p"`.
    P,
    /// Grouping (role) policy, wire tag `"g"`.
    G,
}

impl PolicyType {
    /// The tag stored in the `ptype` column and carried by notifications.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::P => "p",
            PolicyType::G => "g",
        }
    }

    /// Parse a wire tag. Returns `None` for tags this manager does not
    /// cache, so callers can drop them explicitly.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "p" => Some(PolicyType::P),
            "g" => Some(PolicyType::G),
            _ => None,
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single policy rule: exactly [`RULE_WIDTH`] values, empty strings only as
/// trailing padding.
///
/// Ordering is lexicographic by position with byte-wise string comparison,
/// which is the order [`RuleSet`] maintains.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rule([String; RULE_WIDTH]);

impl Rule {
    /// Build a rule from up to [`RULE_WIDTH`] values, padding the tail with
    /// empty strings.
    ///
    /// # Panics
    /// Panics when more than [`RULE_WIDTH`] values are given.
    pub fn from_parts<S: AsRef<str>>(values: &[S]) -> Self {
        assert!(
            values.len() <= RULE_WIDTH,
            "rule has {} values, the schema stores at most {RULE_WIDTH}",
            values.len()
        );
        let mut parts: [String; RULE_WIDTH] = Default::default();
        for (slot, value) in parts.iter_mut().zip(values) {
            *slot = value.as_ref().to_string();
        }
        Self(parts)
    }

    /// Value at position `index`.
    pub fn get(&self, index: usize) -> &str {
        &self.0[index]
    }

    /// All positions, padding included.
    pub fn values(&self) -> &[String] {
        &self.0
    }

    /// Number of positions before the trailing padding starts.
    pub fn logical_len(&self) -> usize {
        self.0
            .iter()
            .position(|value| value.is_empty())
            .unwrap_or(RULE_WIDTH)
    }

    /// Whether the first `query.len()` positions equal `query` exactly.
    pub fn starts_with(&self, query: &[&str]) -> bool {
        query.len() <= RULE_WIDTH
            && self
                .0
                .iter()
                .zip(query)
                .all(|(value, wanted)| value == wanted)
    }

    /// Whether this rule matches a pattern: an empty pattern position is a
    /// wildcard, a non-empty position demands exact equality.
    pub fn matches(&self, pattern: &[&str]) -> bool {
        pattern
            .iter()
            .zip(&self.0)
            .all(|(wanted, value)| wanted.is_empty() || value == wanted)
    }

    fn prefix_cmp(&self, query: &[&str]) -> Ordering {
        self.0
            .iter()
            .take(query.len())
            .map(String::as_str)
            .cmp(query.iter().copied())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0[..self.logical_len()].join(", "))
    }
}

/// Content hash identifying a rule in durable storage.
///
/// The hash covers the policy type and the non-empty prefix of the rule,
/// joined by `","`, so trailing padding never changes the id and repeated
/// inserts of the same logical rule collapse onto one row.
pub fn rule_id(ptype: PolicyType, rule: &Rule) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ptype.as_str().as_bytes());
    for value in &rule.values()[..rule.logical_len()] {
        hasher.update(b",");
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// A collection of rules kept in lexicographic order.
///
/// [`insert`](RuleSet::insert) and [`remove`](RuleSet::remove) preserve the
/// order and never introduce duplicates. The bulk-load path
/// ([`push_unsorted`](RuleSet::push_unsorted) + [`sort`](RuleSet::sort))
/// sorts without deduplicating, matching what a full table scan produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort an arbitrary rule list into a set. Duplicates survive; only
    /// `insert` deduplicates.
    pub fn from_rules(mut rules: Vec<Rule>) -> Self {
        rules.sort();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Insert a copy of `rule` at its sorted position. No-op when an equal
    /// rule is already stored.
    pub fn insert(&mut self, rule: &Rule) {
        let index = self.rules.partition_point(|stored| stored < rule);
        if self.rules.get(index).is_some_and(|stored| stored == rule) {
            return;
        }
        self.rules.insert(index, rule.clone());
    }

    /// Remove the rule equal to `rule`, if stored.
    pub fn remove(&mut self, rule: &Rule) {
        let index = self.rules.partition_point(|stored| stored < rule);
        if self.rules.get(index).is_some_and(|stored| stored == rule) {
            self.rules.remove(index);
        }
    }

    /// First stored rule whose leading positions equal `query`.
    pub fn find(&self, query: &[&str]) -> Option<&Rule> {
        let index = self
            .rules
            .partition_point(|stored| stored.prefix_cmp(query) == Ordering::Less);
        let rule = self.rules.get(index)?;
        rule.starts_with(query).then_some(rule)
    }

    /// Rules matching a per-position pattern; empty positions are wildcards.
    ///
    /// The literal prefix of the pattern is contiguous in sort order, so it is
    /// narrowed with two binary searches per position. Past the first
    /// wildcard sort order stops helping and the surviving window is scanned
    /// linearly.
    pub fn filter(&self, pattern: &[&str]) -> Vec<Rule> {
        assert!(
            pattern.len() <= RULE_WIDTH,
            "filter pattern has {} positions, rules have {RULE_WIDTH}",
            pattern.len()
        );
        let mut window: &[Rule] = &self.rules;
        let mut position = 0;
        while position < pattern.len() && !pattern[position].is_empty() {
            let literal = pattern[position];
            let start = window.partition_point(|rule| rule.get(position) < literal);
            window = &window[start..];
            let end = window.partition_point(|rule| rule.get(position) <= literal);
            window = &window[..end];
            position += 1;
        }
        window
            .iter()
            .filter(|rule| rule.matches(pattern))
            .cloned()
            .collect()
    }

    /// Append without maintaining order; callers must [`sort`](Self::sort)
    /// before any lookup.
    pub(crate) fn push_unsorted(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Restore sorted order after a bulk append.
    pub(crate) fn sort(&mut self) {
        self.rules.sort();
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}
