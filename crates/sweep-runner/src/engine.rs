use crate::alloc::{AllocationLock, DirAllocator, DEFAULT_DIGITS, LOCK_FILE};
use crate::codec::{write_failure, write_record, TrialOutput};
use crate::error::{Result, SweepError};
use crate::expand::expand;
use crate::filter::{clear_failed, filter_completed};
use crate::value::{ConcreteConfig, ConfigMap, FieldKind};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub type Kwargs = ConfigMap;

pub trait Experiment: Send + Sync {
    fn run(&self, kwargs: &Kwargs) -> anyhow::Result<TrialOutput>;

    /// Maps a config to keyword arguments; one per top-level key by default.
    fn make_kwargs(&self, config: &ConcreteConfig) -> anyhow::Result<Kwargs> {
        Ok(config.clone())
    }

    fn description(&self, config: &ConcreteConfig) -> String {
        config.to_json().to_string()
    }
}

impl<F> Experiment for F
where
    F: Fn(&Kwargs) -> anyhow::Result<TrialOutput> + Send + Sync,
{
    fn run(&self, kwargs: &Kwargs) -> anyhow::Result<TrialOutput> {
        self(kwargs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Write `config.json` and `err.txt`, then continue with the next config.
    #[default]
    Record,
    /// Release the trial's directory and stop the batch.
    Abort,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub parallel: bool,
    /// Worker threads in parallel mode; defaults to available cores minus one.
    pub workers: Option<usize>,
    pub failure_policy: FailurePolicy,
    /// Re-run configs whose record holds `err.txt`.
    pub retry_failed: bool,
    pub digits: usize,
    /// Use a lock file so concurrent processes can share the output directory.
    pub lock_file: bool,
    pub lock_timeout: Duration,
    /// Draw a progress bar on stderr showing each trial's description.
    pub progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            workers: None,
            failure_policy: FailurePolicy::default(),
            retry_failed: false,
            digits: DEFAULT_DIGITS,
            lock_file: true,
            lock_timeout: Duration::from_secs(30),
            progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRecord {
    pub dir: PathBuf,
    pub status: TrialStatus,
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
    pub trial_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub total: usize,
    pub pending: Vec<ConcreteConfig>,
}

impl Plan {
    pub fn skipped(&self) -> usize {
        self.total - self.pending.len()
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

pub struct Runner {
    experiment: Arc<dyn Experiment>,
    allocator: DirAllocator,
    options: RunOptions,
}

impl Runner {
    /// Creates `output_dir` if needed. Appending to an existing one is allowed.
    pub fn new(
        experiment: Arc<dyn Experiment>,
        output_dir: impl Into<PathBuf>,
        options: RunOptions,
    ) -> Result<Self> {
        let output_dir = output_dir.into();
        let lock = if options.lock_file {
            AllocationLock::with_lock_file(output_dir.join(LOCK_FILE), options.lock_timeout)
        } else {
            AllocationLock::in_process()
        };
        let allocator = DirAllocator::new(output_dir, options.digits, lock);
        allocator.ensure_output_dir()?;
        Ok(Self {
            experiment,
            allocator,
            options,
        })
    }

    pub fn output_dir(&self) -> &Path {
        self.allocator.output_dir()
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn plan(&self, template: &Value) -> Result<Plan> {
        let configs = expand(template)?;
        let total = configs.len();
        let outcome = filter_completed(configs, self.output_dir())?;
        Ok(Plan {
            total,
            pending: outcome.pending,
        })
    }

    pub fn run_batch(&self, template: &Value) -> Result<BatchSummary> {
        let configs = expand(template)?;
        let total = configs.len();
        if self.options.retry_failed {
            let cleared = clear_failed(self.output_dir())?;
            if !cleared.is_empty() {
                tracing::info!("cleared {} failed trials for retry", cleared.len());
            }
        }
        let pending = filter_completed(configs, self.output_dir())?.pending;
        let skipped = total - pending.len();
        tracing::info!(
            "{} configurations, skipping {} already on disk, running {}",
            total,
            skipped,
            pending.len()
        );

        let progress = self.progress_bar(pending.len());
        let records = if self.options.parallel {
            self.run_parallel(&pending, &progress)
        } else {
            pending
                .iter()
                .enumerate()
                .map(|(idx, config)| self.run_trial(config, idx + 1, pending.len(), &progress))
                .collect::<Result<Vec<_>>>()
        };
        let records = match records {
            Ok(records) => {
                progress.finish_with_message("done");
                records
            }
            Err(err) => {
                progress.abandon();
                return Err(err);
            }
        };

        let failed = records
            .iter()
            .filter(|r| r.status == TrialStatus::Failed)
            .count();
        Ok(BatchSummary {
            total,
            skipped,
            completed: records.len() - failed,
            failed,
            trial_dirs: records.into_iter().map(|r| r.dir).collect(),
        })
    }

    /// Runs `config` as given: no expansion, no filtering.
    ///
    /// Strings below `_dt`/`_td` keys are still parsed.
    pub fn run_one(&self, config: &Value) -> Result<TrialRecord> {
        let config = match config {
            Value::Object(map) => ConfigMap::from_json(map, FieldKind::Plain)
                .map_err(|message| SweepError::expansion("$", message))?,
            other => {
                return Err(SweepError::expansion(
                    "$",
                    format!("a single config must be a mapping, got {}", other),
                ))
            }
        };
        self.run_trial(&config, 1, 1, &ProgressBar::hidden())
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.options.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }

    fn run_parallel(&self, pending: &[ConcreteConfig], progress: &ProgressBar) -> Result<Vec<TrialRecord>> {
        let workers = self.options.workers.unwrap_or_else(default_workers).max(1);
        tracing::info!("dispatching to {} workers", workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("sweep-worker-{}", i))
            .build()?;
        let total = pending.len();
        pool.install(|| {
            pending
                .par_iter()
                .enumerate()
                .map(|(idx, config)| self.run_trial(config, idx + 1, total, progress))
                .collect()
        })
    }

    fn run_trial(
        &self,
        config: &ConcreteConfig,
        position: usize,
        total: usize,
        progress: &ProgressBar,
    ) -> Result<TrialRecord> {
        let dir = self.allocator.allocate()?;
        let description = self.experiment.description(config);
        if progress.is_hidden() {
            tracing::info!("[{}/{}] {} -> {}", position, total, description, dir.display());
        } else {
            tracing::debug!("[{}/{}] {} -> {}", position, total, description, dir.display());
            progress.set_message(description);
        }

        let record = self.finish_trial(dir, config);
        progress.inc(1);
        record
    }

    fn finish_trial(&self, dir: PathBuf, config: &ConcreteConfig) -> Result<TrialRecord> {
        match self.invoke(config) {
            Ok(output) => match write_record(&dir, config, &output) {
                Ok(_) => Ok(TrialRecord {
                    dir,
                    status: TrialStatus::Completed,
                }),
                Err(err) => {
                    // Marked failed so a resume cannot mistake it for a complete record.
                    if let Err(mark) = write_failure(&dir, config, &err.to_string()) {
                        tracing::warn!("cannot mark {} as failed: {}", dir.display(), mark);
                    }
                    Err(err)
                }
            },
            Err(message) => match self.options.failure_policy {
                FailurePolicy::Record => {
                    tracing::warn!("trial in {} failed: {}", dir.display(), message);
                    write_failure(&dir, config, &message)?;
                    Ok(TrialRecord {
                        dir,
                        status: TrialStatus::Failed,
                    })
                }
                FailurePolicy::Abort => {
                    self.allocator.release(&dir)?;
                    Err(SweepError::Trial { dir, message })
                }
            },
        }
    }

    // Errors and panics both come back as the rendered message.
    fn invoke(&self, config: &ConcreteConfig) -> std::result::Result<TrialOutput, String> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let kwargs = self.experiment.make_kwargs(config)?;
            self.experiment.run(&kwargs)
        }));
        match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(format!("{:#}", err)),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Err(format!("trial panicked: {}", detail))
            }
        }
    }
}
