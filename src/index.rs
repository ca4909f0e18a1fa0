//! Sorted key index for range queries and run-grouped prefix scans
//!
//! The index is a snapshot: it is rebuilt from scratch out of the local store
//! after every mutation and never patched in place.

use crate::store::LocalStore;

/// A contiguous block of the sorted key array.
///
/// Every member is prefix-compatible with `representative` (the shorter of
/// the two is a literal prefix of the longer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub representative: String,
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeIndex {
    keys: Vec<String>,
    runs: Vec<Run>,
}

impl RangeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh index over the current key set of `store`
    pub fn build(store: &LocalStore) -> Self {
        let mut keys: Vec<String> = store.keys().cloned().collect();
        keys.sort_unstable();
        let runs = partition_runs(&keys);
        Self { keys, runs }
    }

    /// Keys in `[start, end]`, both bounds inclusive, in byte order
    pub fn range_query(&self, start: &str, end: &str) -> Vec<String> {
        let lower = self.keys.partition_point(|k| k.as_str() < start);
        let upper = self.keys.partition_point(|k| k.as_str() <= end);
        if lower >= upper {
            return Vec::new();
        }
        self.keys[lower..upper].to_vec()
    }

    /// Keys of every run whose representative starts with `prefix`.
    ///
    /// Runs are matched as a whole on their representative only. A key that
    /// starts with `prefix` but sits in a run with a shorter representative
    /// (e.g. `ab` under `a` for prefix `ab`) is not returned.
    pub fn prefix_scan(&self, prefix: &str) -> Vec<String> {
        self.runs
            .iter()
            .filter(|run| run.representative.starts_with(prefix))
            .flat_map(|run| self.keys[run.start..run.start + run.len].iter().cloned())
            .collect()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn partition_runs(keys: &[String]) -> Vec<Run> {
    let mut runs = Vec::new();
    let Some(first) = keys.first() else {
        return runs;
    };

    let mut representative = first;
    let mut start = 0;
    for (i, key) in keys.iter().enumerate().skip(1) {
        if !prefix_compatible(representative, key) {
            runs.push(Run {
                representative: representative.clone(),
                start,
                len: i - start,
            });
            representative = key;
            start = i;
        }
    }
    runs.push(Run {
        representative: representative.clone(),
        start,
        len: keys.len() - start,
    });
    runs
}

/// True when the shorter string is a byte prefix of the longer one
fn prefix_compatible(a: &str, b: &str) -> bool {
    a.bytes().zip(b.bytes()).all(|(x, y)| x == y)
}
