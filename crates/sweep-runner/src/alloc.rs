use crate::error::{IoContext, Result, SweepError};
use crate::ensure_dir;
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_DIGITS: usize = 6;
pub const LOCK_FILE: &str = ".sweep.lock";

const LOCK_POLL: Duration = Duration::from_millis(25);

/// Clones share one in-process mutex; the optional lock file extends exclusion
/// to other processes using the same output directory.
#[derive(Debug, Clone)]
pub struct AllocationLock {
    local: Arc<Mutex<()>>,
    lock_file: Option<PathBuf>,
    timeout: Duration,
}

impl AllocationLock {
    pub fn in_process() -> Self {
        Self {
            local: Arc::new(Mutex::new(())),
            lock_file: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn with_lock_file(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            local: Arc::new(Mutex::new(())),
            lock_file: Some(path.into()),
            timeout,
        }
    }

    pub fn acquire(&self) -> Result<AllocationGuard<'_>> {
        let local = self.local.lock();
        let file = match &self.lock_file {
            Some(path) => Some(acquire_lock_file(path, self.timeout)?),
            None => None,
        };
        Ok(AllocationGuard {
            _file: file,
            _local: local,
        })
    }
}

pub struct AllocationGuard<'a> {
    // Dropped first: the file is released while the mutex is still held.
    _file: Option<LockFileGuard>,
    _local: MutexGuard<'a, ()>,
}

#[derive(Debug)]
struct LockFileGuard {
    path: PathBuf,
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_lock_file(path: &Path, timeout: Duration) -> Result<LockFileGuard> {
    let started = Instant::now();
    loop {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let payload = json!({
                    "pid": std::process::id(),
                    "acquired_at": Utc::now().to_rfc3339(),
                });
                let _ = writeln!(file, "{}", payload);
                let _ = file.sync_all();
                return Ok(LockFileGuard {
                    path: path.to_path_buf(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Some(holder) = dead_holder(path) {
                    tracing::warn!(
                        "removing stale lock {} left by exited process {}",
                        path.display(),
                        holder
                    );
                    remove_if_unchanged(path, holder);
                }
                if started.elapsed() >= timeout {
                    let holder = fs::read_to_string(path).unwrap_or_default();
                    return Err(SweepError::allocation(
                        path.parent().unwrap_or(path),
                        format!(
                            "lock {} still held after {:?} by {}; remove it if that process is gone",
                            path.display(),
                            timeout,
                            holder.trim()
                        ),
                    ));
                }
                tracing::debug!("waiting for allocation lock {}", path.display());
                thread::sleep(LOCK_POLL);
            }
            Err(e) => return Err(e).at(path),
        }
    }
}

fn dead_holder(path: &Path) -> Option<u32> {
    let pid = holder_pid(&fs::read_to_string(path).ok()?)?;
    if pid == std::process::id() || process_alive(pid) {
        return None;
    }
    Some(pid)
}

fn holder_pid(payload: &str) -> Option<u32> {
    let value: serde_json::Value = serde_json::from_str(payload.trim()).ok()?;
    value.get("pid")?.as_u64().and_then(|pid| u32::try_from(pid).ok())
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Elsewhere only the holder or the timeout ends a lock.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

// Another waiter may already have replaced the stale file with its own lock.
fn remove_if_unchanged(path: &Path, stale_pid: u32) {
    let still_stale = fs::read_to_string(path)
        .ok()
        .and_then(|payload| holder_pid(&payload))
        == Some(stale_pid);
    if still_stale {
        let _ = fs::remove_file(path);
    }
}

#[derive(Debug, Clone)]
pub struct DirAllocator {
    output_dir: PathBuf,
    digits: usize,
    lock: AllocationLock,
}

impl DirAllocator {
    pub fn new(output_dir: impl Into<PathBuf>, digits: usize, lock: AllocationLock) -> Self {
        Self {
            output_dir: output_dir.into(),
            digits,
            lock,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn allocate(&self) -> Result<PathBuf> {
        let _guard = self.lock.acquire()?;
        let idx = next_free_index(&self.output_dir)?;
        let path = self.output_dir.join(format_index(idx, self.digits));
        match fs::create_dir(&path) {
            Ok(()) => Ok(path),
            // Leftover from an aborted run: reusable only while empty.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if dir_is_empty(&path)? {
                    Ok(path)
                } else {
                    Err(SweepError::allocation(
                        &path,
                        "directory already exists and is not empty",
                    ))
                }
            }
            Err(e) => Err(e).at(&path),
        }
    }

    /// Gives back a reserved directory. Refuses if anything was written to it.
    pub fn release(&self, dir: &Path) -> Result<()> {
        let _guard = self.lock.acquire()?;
        if !dir_is_empty(dir)? {
            return Err(SweepError::allocation(
                dir,
                "refusing to release a directory that is not empty",
            ));
        }
        fs::remove_dir(dir).at(dir)
    }

    pub fn ensure_output_dir(&self) -> Result<()> {
        ensure_dir(&self.output_dir)
    }
}

pub fn format_index(idx: u64, digits: usize) -> String {
    format!("{:0width$}", idx, width = digits)
}

pub fn numbered_dirs(output_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(output_dir).at(output_dir)? {
        let entry = entry.at(output_dir)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(idx) = name.parse::<u64>() else {
            continue;
        };
        if entry.path().is_dir() {
            out.push((idx, entry.path()));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(out)
}

/// First `n` such that `n` is missing from the run `1, 2, ...` on disk.
pub fn next_free_index(output_dir: &Path) -> Result<u64> {
    let mut last = 0u64;
    for (idx, _) in numbered_dirs(output_dir)? {
        if idx == last {
            continue;
        }
        if idx != last + 1 {
            break;
        }
        last = idx;
    }
    Ok(last + 1)
}

pub fn dir_is_empty(dir: &Path) -> Result<bool> {
    Ok(fs::read_dir(dir).at(dir)?.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn temp_output(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sweep_alloc_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn names_are_zero_padded() {
        assert_eq!(format_index(1, 6), "000001");
        assert_eq!(format_index(1234567, 6), "1234567");
    }

    #[test]
    fn allocation_starts_at_one_and_extends() {
        let out = temp_output("extend");
        let alloc = DirAllocator::new(&out, DEFAULT_DIGITS, AllocationLock::in_process());
        assert_eq!(alloc.allocate().expect("first"), out.join("000001"));
        assert_eq!(alloc.allocate().expect("second"), out.join("000002"));
        assert_eq!(alloc.allocate().expect("third"), out.join("000003"));
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn allocation_fills_gaps() {
        let out = temp_output("gaps");
        ensure_dir(&out.join("000001")).expect("1");
        ensure_dir(&out.join("000003")).expect("3");
        let alloc = DirAllocator::new(&out, DEFAULT_DIGITS, AllocationLock::in_process());
        assert_eq!(alloc.allocate().expect("gap"), out.join("000002"));
        assert_eq!(alloc.allocate().expect("next"), out.join("000004"));
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn missing_first_directory_is_filled() {
        let out = temp_output("first");
        ensure_dir(&out.join("000002")).expect("2");
        assert_eq!(next_free_index(&out).expect("idx"), 1);
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn non_numeric_entries_are_ignored() {
        let out = temp_output("ignore");
        ensure_dir(&out.join("000001")).expect("1");
        ensure_dir(&out.join("notes")).expect("notes");
        fs::write(out.join(LOCK_FILE), b"{}").expect("lock");
        fs::write(out.join("000002"), b"file, not dir").expect("file");
        let found: Vec<u64> = numbered_dirs(&out)
            .expect("list")
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(found, vec![1]);
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let out = temp_output("concurrent");
        let alloc = DirAllocator::new(&out, DEFAULT_DIGITS, AllocationLock::in_process());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let alloc = alloc.clone();
                thread::spawn(move || {
                    (0..4)
                        .map(|_| alloc.allocate().expect("allocate"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut names = BTreeSet::new();
        for handle in handles {
            for path in handle.join().expect("thread") {
                assert!(names.insert(path), "duplicate allocation");
            }
        }
        assert_eq!(names.len(), 64);
        assert_eq!(next_free_index(&out).expect("idx"), 65);
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn lock_file_excludes_and_times_out() {
        let out = temp_output("lockfile");
        let lock = AllocationLock::with_lock_file(out.join(LOCK_FILE), Duration::from_millis(60));
        let held = lock.acquire().expect("first acquire");
        assert!(out.join(LOCK_FILE).exists());

        let other = AllocationLock::with_lock_file(out.join(LOCK_FILE), Duration::from_millis(60));
        let err = other.acquire().err().expect("second acquire must time out");
        assert!(err.to_string().contains("still held"), "{}", err);

        drop(held);
        assert!(!out.join(LOCK_FILE).exists());
        drop(other.acquire().expect("re-acquire after release"));
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn holder_pid_is_read_from_payload() {
        assert_eq!(holder_pid("{\"pid\": 42, \"acquired_at\": \"x\"}\n"), Some(42));
        assert_eq!(holder_pid(""), None);
        assert_eq!(holder_pid("{\"pid\": \"abc\"}"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lock_left_by_exited_process_is_taken_over() {
        let out = temp_output("stale");
        // Above the kernel's pid_max, so never a live process.
        fs::write(out.join(LOCK_FILE), b"{\"pid\": 4000000000}\n").expect("stale lock");
        let lock = AllocationLock::with_lock_file(out.join(LOCK_FILE), Duration::from_secs(5));
        let started = Instant::now();
        let guard = lock.acquire().expect("stale lock is replaced");
        assert!(started.elapsed() < Duration::from_secs(5));
        let payload = fs::read_to_string(out.join(LOCK_FILE)).expect("lock");
        assert_eq!(holder_pid(&payload), Some(std::process::id()));
        drop(guard);
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn release_refuses_written_directories() {
        let out = temp_output("release");
        let alloc = DirAllocator::new(&out, DEFAULT_DIGITS, AllocationLock::in_process());
        let dir = alloc.allocate().expect("allocate");
        fs::write(dir.join("config.json"), b"{}").expect("write");
        assert!(alloc.release(&dir).is_err());
        fs::remove_file(dir.join("config.json")).expect("remove");
        alloc.release(&dir).expect("release empty");
        assert!(!dir.exists());
        let _ = fs::remove_dir_all(out);
    }
}
