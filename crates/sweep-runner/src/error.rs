use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T, E = SweepError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SweepError {
    /// Malformed template; raised before any directory is touched.
    #[error("expansion error at {path}: {message}")]
    Expansion { path: String, message: String },

    #[error("allocation error in {}: {message}", .dir.display())]
    Allocation { dir: PathBuf, message: String },

    #[error("trial failed in {}: {message}", .dir.display())]
    Trial { dir: PathBuf, message: String },

    #[error("cannot encode result '{key}': {message}")]
    Encode { key: String, message: String },

    #[error("cannot persist result '{key}' in {}: {message}", .dir.display())]
    Persistence {
        dir: PathBuf,
        key: String,
        message: String,
    },

    #[error(
        "{} is not empty but has no config.json; it was not created by a sweep run",
        .dir.display()
    )]
    StructuralCorruption { dir: PathBuf },

    #[error("unregistered experiment '{id}' (registered: {registered})")]
    UnregisteredExperiment { id: String, registered: String },

    #[error("experiment '{id}' could not be constructed: {message}")]
    ExperimentSetup { id: String, message: String },

    #[error("worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SweepError {
    pub(crate) fn expansion(path: &str, message: impl Into<String>) -> Self {
        SweepError::Expansion {
            path: path.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn allocation(dir: &Path, message: impl Into<String>) -> Self {
        SweepError::Allocation {
            dir: dir.to_path_buf(),
            message: message.into(),
        }
    }
}

pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| SweepError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl<T> IoContext<T> for serde_json::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| SweepError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}
