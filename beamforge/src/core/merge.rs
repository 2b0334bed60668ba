//! Disjoint merge of per-unit file deltas produced by parallel sub-searches.

use std::collections::BTreeMap;

use thiserror::Error;

/// Two units produced the same path. Fatal: units own distinct files by construction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("merge conflict: '{path}' written by both '{first}' and '{second}'")]
pub struct MergeConflict {
    pub path: String,
    pub first: String,
    pub second: String,
}

/// Merge unit deltas (unit name → path → value it produced) into one map.
///
/// Iterates units in name order, so the reported conflict is deterministic.
pub fn merge_disjoint<V: Clone>(
    units: &BTreeMap<String, BTreeMap<String, V>>,
) -> Result<BTreeMap<String, V>, MergeConflict> {
    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
    let mut merged = BTreeMap::new();
    for (unit, files) in units {
        for (path, content) in files {
            if let Some(first) = owners.insert(path.as_str(), unit.as_str()) {
                return Err(MergeConflict {
                    path: path.clone(),
                    first: first.to_string(),
                    second: unit.clone(),
                });
            }
            merged.insert(path.clone(), content.clone());
        }
    }
    Ok(merged)
}
