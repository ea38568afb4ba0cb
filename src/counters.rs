//! Pointwise-additive counter maps accumulated through an execution.
//!
//! Counters form a commutative monoid: the zero is the empty map and merge
//! is pointwise addition. The evaluator keeps counters keyed by submission
//! id and only flattens on request, so independent submissions stay
//! distinguishable until the user asks for totals.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Identity of a single counter: a group plus a name within that group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatKey {
    pub group: String,
    pub name: String,
}

impl StatKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Identifier of one `Writer::execute` call, monotonically fresh per writer.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "submission-{}", self.0)
    }
}

/// Counters grouped by the submission that produced them.
pub type CountersById = HashMap<SubmissionId, Counters>;

/// An immutable map from [`StatKey`] to a signed 64-bit count.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    entries: BTreeMap<StatKey, i64>,
}

impl Counters {
    /// The monoid identity.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The stored value, distinguishing a missing key from an explicit zero.
    pub fn get(&self, key: &StatKey) -> Option<i64> {
        self.entries.get(key).copied()
    }

    /// The effective value: zero on a missing key.
    pub fn value(&self, key: &StatKey) -> i64 {
        self.get(key).unwrap_or(0)
    }

    pub fn keys(&self) -> impl Iterator<Item = &StatKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StatKey, i64)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when any key is present, even with an explicit zero value.
    pub fn is_non_zero(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Functional insert, overwriting any existing value for the key.
    pub fn with(mut self, key: StatKey, amount: i64) -> Self {
        self.entries.insert(key, amount);
        self
    }

    /// Pointwise sum of two counter maps.
    pub fn merge(&self, other: &Counters) -> Counters {
        let mut entries = self.entries.clone();
        for (key, amount) in &other.entries {
            *entries.entry(key.clone()).or_insert(0) += amount;
        }
        Counters { entries }
    }

    pub fn merge_all<'a>(counters: impl IntoIterator<Item = &'a Counters>) -> Counters {
        counters
            .into_iter()
            .fold(Counters::empty(), |acc, c| acc.merge(c))
    }

    /// Collapse a by-submission view into plain totals.
    pub fn flatten_by_id(by_id: &CountersById) -> Counters {
        Counters::merge_all(by_id.values())
    }

    /// Adapter from the raw group/name stat map a flow submitter reports.
    pub fn from_raw(raw: &HashMap<String, HashMap<String, i64>>) -> Counters {
        let mut entries = BTreeMap::new();
        for (group, stats) in raw {
            for (name, amount) in stats {
                entries.insert(StatKey::new(group.clone(), name.clone()), *amount);
            }
        }
        Counters { entries }
    }
}

impl FromIterator<(StatKey, i64)> for Counters {
    fn from_iter<I: IntoIterator<Item = (StatKey, i64)>>(iter: I) -> Self {
        Counters {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Merge two by-submission views. Two entries under one id describe the
/// same submission and are identical by construction, so the existing
/// entry wins; summing here would double-count a de-duplicated write
/// observed from several branches.
pub fn merge_by_id(mut left: CountersById, right: CountersById) -> CountersById {
    for (id, counters) in right {
        left.entry(id).or_insert(counters);
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(name: &str) -> StatKey {
        StatKey::new("test", name)
    }

    #[test]
    fn missing_key_is_distinct_from_zero_for_get() {
        let counters = Counters::empty().with(key("written"), 0);
        assert_eq!(counters.get(&key("written")), Some(0));
        assert_eq!(counters.get(&key("read")), None);
        assert_eq!(counters.value(&key("read")), 0);
        assert!(counters.is_non_zero());
    }

    #[test]
    fn merge_is_pointwise() {
        let a = Counters::empty().with(key("a"), 2).with(key("b"), 3);
        let b = Counters::empty().with(key("b"), 4).with(key("c"), -1);
        let merged = a.merge(&b);
        assert_eq!(merged.value(&key("a")), 2);
        assert_eq!(merged.value(&key("b")), 7);
        assert_eq!(merged.value(&key("c")), -1);
    }

    #[test]
    fn flatten_sums_across_submissions() {
        let mut by_id = CountersById::new();
        by_id.insert(SubmissionId(1), Counters::empty().with(key("rows"), 10));
        by_id.insert(SubmissionId(2), Counters::empty().with(key("rows"), 5));
        assert_eq!(Counters::flatten_by_id(&by_id).value(&key("rows")), 15);
    }

    #[test]
    fn merge_by_id_keeps_submissions_apart() {
        let mut left = CountersById::new();
        left.insert(SubmissionId(1), Counters::empty().with(key("rows"), 1));
        let mut right = CountersById::new();
        right.insert(SubmissionId(2), Counters::empty().with(key("rows"), 2));
        let merged = merge_by_id(left, right);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_by_id_never_double_counts_one_submission() {
        let mut left = CountersById::new();
        left.insert(SubmissionId(1), Counters::empty().with(key("rows"), 5));
        let merged = merge_by_id(left.clone(), left);
        assert_eq!(Counters::flatten_by_id(&merged).value(&key("rows")), 5);
    }

    #[test]
    fn from_raw_adapts_grouped_stats() {
        let mut raw = HashMap::new();
        raw.insert(
            "io".to_string(),
            HashMap::from([("bytes".to_string(), 42i64)]),
        );
        let counters = Counters::from_raw(&raw);
        assert_eq!(counters.value(&StatKey::new("io", "bytes")), 42);
    }

    fn arb_counters() -> impl Strategy<Value = Counters> {
        prop::collection::btree_map(
            ("[a-c]{1,2}", "[a-c]{1,2}").prop_map(|(g, n)| StatKey::new(g, n)),
            -1000i64..1000,
            0..8,
        )
        .prop_map(|entries| entries.into_iter().collect())
    }

    proptest! {
        #[test]
        fn merge_is_associative(a in arb_counters(), b in arb_counters(), c in arb_counters()) {
            prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        }

        #[test]
        fn merge_is_commutative(a in arb_counters(), b in arb_counters()) {
            prop_assert_eq!(a.merge(&b), b.merge(&a));
        }

        #[test]
        fn empty_is_identity(a in arb_counters()) {
            prop_assert_eq!(a.merge(&Counters::empty()), a.clone());
            prop_assert_eq!(Counters::empty().merge(&a), a);
        }
    }
}
