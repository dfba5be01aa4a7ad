use crate::alloc::{dir_is_empty, numbered_dirs};
use crate::codec::{has_failure, read_config};
use crate::error::{IoContext, Result, SweepError};
use crate::value::ConcreteConfig;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub pending: Vec<ConcreteConfig>,
    /// Directories whose record satisfied one pending config.
    pub matched: Vec<PathBuf>,
}

impl FilterOutcome {
    pub fn skipped(&self) -> usize {
        self.matched.len()
    }
}

/// Removes from `pending` every config already recorded under `output_dir`.
///
/// Each record satisfies at most one pending entry, so duplicated configs
/// need as many records as they have copies. Directories without a record
/// must be empty; anything else is reported as corruption.
pub fn filter_completed(pending: Vec<ConcreteConfig>, output_dir: &Path) -> Result<FilterOutcome> {
    let canonical: Vec<Value> = pending.iter().map(|c| c.to_json()).collect();
    let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, value) in canonical.iter().enumerate() {
        buckets.entry(canonical_digest(value)).or_default().push(idx);
    }

    let mut done = vec![false; pending.len()];
    let mut matched = Vec::new();
    if output_dir.is_dir() {
        for (_, dir) in numbered_dirs(output_dir)? {
            let Some(record) = read_config(&dir)? else {
                if dir_is_empty(&dir)? {
                    continue;
                }
                return Err(SweepError::StructuralCorruption { dir });
            };
            let Some(candidates) = buckets.get_mut(&canonical_digest(&record)) else {
                continue;
            };
            if let Some(pos) = candidates.iter().position(|&i| canonical[i] == record) {
                done[candidates.remove(pos)] = true;
                matched.push(dir);
            }
        }
    }

    let pending = pending
        .into_iter()
        .zip(done)
        .filter_map(|(config, done)| (!done).then_some(config))
        .collect();
    Ok(FilterOutcome { pending, matched })
}

/// Deletes every trial directory that recorded a failure so it can be re-run.
pub fn clear_failed(output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut cleared = Vec::new();
    if !output_dir.is_dir() {
        return Ok(cleared);
    }
    for (_, dir) in numbered_dirs(output_dir)? {
        if has_failure(&dir) && read_config(&dir)?.is_some() {
            fs::remove_dir_all(&dir).at(&dir)?;
            cleared.push(dir);
        }
    }
    Ok(cleared)
}

/// `sha256:<hex>` over the value serialized with recursively sorted keys.
pub fn canonical_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(&sorted(value)).unwrap_or_default();
    format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
