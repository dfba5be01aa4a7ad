pub mod alloc;
pub mod analysis;
pub mod codec;
pub mod engine;
pub mod error;
pub mod expand;
pub mod filter;
pub mod glob;
pub mod registry;
pub mod value;

use chrono::Utc;
use error::IoContext;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

pub use alloc::{AllocationLock, DirAllocator};
pub use analysis::{flatten, is_subset, load_results, query, MissingPolicy, ResultRow};
pub use codec::{OpaqueValue, ResultValue, Scalar, StoredValue, TrialOutput};
pub use engine::{
    BatchSummary, Experiment, FailurePolicy, Kwargs, Plan, RunOptions, Runner, TrialRecord,
    TrialStatus,
};
pub use error::{Result, SweepError};
pub use expand::expand;
pub use filter::filter_completed;
pub use registry::ExperimentRegistry;
pub use value::{ConcreteConfig, ConfigMap, ConfigValue};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).at(path)
}

/// Writes through a temp file in the same directory, then renames over `path`.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp).at(&tmp)?;
    file.write_all(bytes).at(&tmp)?;
    file.sync_all().at(&tmp)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).at(path);
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).at(path)?;
    atomic_write_bytes(path, &bytes)
}
