//! Shadow-copy manager
//!
//! Every candidate binary is copied into `<shadow root>/<uuid>/` before it is
//! loaded, so the deployed file is never held open by the host and can be
//! replaced or rebuilt while plugins run. Once the owning sandbox is closed the
//! scratch directory is handed to the reaper, which retries deletion because
//! the loader may release its file handles some time after unload.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ReapError, StageError};

/// Bounded retry schedule for scratch-directory deletion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first attempt)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Cap on any single delay
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays; 1.0 gives a fixed schedule
    pub multiplier: f64,
    /// Reaping passes a directory may fail before it is dropped from the
    /// queue and left for the next start-up sweep
    pub max_passes: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            multiplier: 2.0,
            max_passes: 5,
        }
    }
}

impl RetryPolicy {
    /// Same delay between every attempt
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            ..Self::default()
        }
    }

    pub fn with_max_passes(mut self, max_passes: u32) -> Self {
        self.max_passes = max_passes;
        self
    }

    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay to wait before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    fn passes(&self) -> u32 {
        self.max_passes.max(1)
    }
}

/// Deletes a directory tree; swappable so tests can simulate held handles
pub trait DirRemover: Send + Sync {
    fn remove_dir_all(&self, dir: &Path) -> io::Result<()>;
}

/// Filesystem-backed remover; runs on the blocking pool
#[derive(Debug, Default, Clone, Copy)]
pub struct FsRemover;

impl DirRemover for FsRemover {
    fn remove_dir_all(&self, dir: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(dir)
    }
}

/// One staged binary and its scratch directory
#[derive(Debug, Clone, Serialize)]
pub struct ShadowCopyJob {
    pub id: Uuid,
    /// Deployed binary the copy was taken from
    pub source_path: PathBuf,
    /// The staged copy that gets loaded
    pub shadow_path: PathBuf,
    /// `<shadow root>/<id>`
    pub scratch_dir: PathBuf,
    /// Companion binaries copied next to the staged copy
    pub dependencies: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub pending_deletion: bool,
    /// Reaping passes that failed to delete `scratch_dir`
    pub failed_passes: u32,
}

/// Outcome of a reaping pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapReport {
    pub deleted: Vec<PathBuf>,
    /// Directories that survived every attempt and stay queued
    pub orphaned: Vec<PathBuf>,
    /// Directories dropped from the queue after too many failed passes
    pub abandoned: Vec<PathBuf>,
}

impl ReapReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.abandoned.is_empty()
    }

    /// Directories left on disk, queued or not
    pub fn left_behind(&self) -> usize {
        self.orphaned.len() + self.abandoned.len()
    }

    pub(crate) fn absorb(&mut self, other: ReapReport) {
        self.deleted.extend(other.deleted);
        self.orphaned.extend(other.orphaned);
        self.abandoned.extend(other.abandoned);
    }
}

/// Stages binaries into scratch directories and reaps them after unload
pub struct ShadowCopyManager {
    root: PathBuf,
    policy: RetryPolicy,
    remover: Arc<dyn DirRemover>,
    pending: Mutex<Vec<ShadowCopyJob>>,
}

impl ShadowCopyManager {
    /// Create a manager rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P, policy: RetryPolicy) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            policy,
            remover: Arc::new(FsRemover),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Replace the directory remover
    pub fn with_remover(mut self, remover: Arc<dyn DirRemover>) -> Self {
        self.remover = remover;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Copy `source` (and its `<stem>.deps/` companions) into a fresh scratch directory
    pub async fn stage(&self, source: &Path) -> Result<ShadowCopyJob, StageError> {
        let file_name = source
            .file_name()
            .ok_or_else(|| StageError::InvalidPath(source.to_path_buf()))?;

        match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(StageError::SourceMissing(source.to_path_buf())),
        }

        let id = Uuid::new_v4();
        let scratch_dir = self.root.join(id.to_string());
        tokio::fs::create_dir_all(&scratch_dir)
            .await
            .map_err(|source| StageError::ScratchDir {
                path: scratch_dir.clone(),
                source,
            })?;

        let shadow_path = scratch_dir.join(file_name);
        let staged = async {
            copy_file(source, &shadow_path).await?;
            copy_companions(source, &scratch_dir).await
        }
        .await;

        let dependencies = match staged {
            Ok(dependencies) => dependencies,
            Err(e) => {
                // Nothing has loaded from this directory yet, so it can go immediately
                if let Err(cleanup) = tokio::fs::remove_dir_all(&scratch_dir).await {
                    warn!("Failed to discard partial stage {:?}: {}", scratch_dir, cleanup);
                }
                return Err(e);
            }
        };

        debug!(
            source = %source.display(),
            shadow = %shadow_path.display(),
            dependencies = dependencies.len(),
            "staged plugin binary"
        );

        Ok(ShadowCopyJob {
            id,
            source_path: source.to_path_buf(),
            shadow_path,
            scratch_dir,
            dependencies,
            created_at: Utc::now(),
            pending_deletion: false,
            failed_passes: 0,
        })
    }

    /// Queue jobs whose sandboxes are closed for deletion
    pub fn schedule<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = ShadowCopyJob>,
    {
        let mut pending = self.pending.lock();
        for mut job in jobs {
            job.pending_deletion = true;
            pending.push(job);
        }
    }

    /// Scratch directories still waiting for deletion
    pub fn pending(&self) -> Vec<PathBuf> {
        self.pending
            .lock()
            .iter()
            .map(|job| job.scratch_dir.clone())
            .collect()
    }

    /// Delete one job's scratch directory, retrying per the policy
    pub async fn reap(&self, job: &ShadowCopyJob) -> Result<(), ReapError> {
        let dir = &job.scratch_dir;
        if !dir.starts_with(&self.root) || dir == &self.root {
            return Err(ReapError::OutsideRoot(dir.clone()));
        }

        let max_attempts = self.policy.attempts();
        let mut attempt = 1;
        loop {
            match self.remove(dir).await {
                Ok(()) => {
                    debug!(dir = %dir.display(), attempt, "scratch directory deleted");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) if attempt < max_attempts => {
                    let delay = self.policy.delay(attempt - 1);
                    debug!(
                        "Delete of {:?} failed (attempt {}/{}): {}, retrying in {}ms",
                        dir,
                        attempt,
                        max_attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(ReapError::Exhausted {
                        dir: dir.clone(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// One pass over the queue; failures stay queued for the next pass
    pub async fn reap_pending(&self) -> ReapReport {
        let jobs = std::mem::take(&mut *self.pending.lock());
        let mut report = ReapReport::default();
        let mut survivors = Vec::new();

        for mut job in jobs {
            match self.reap(&job).await {
                Ok(()) => report.deleted.push(job.scratch_dir.clone()),
                Err(e) => {
                    job.failed_passes += 1;
                    if job.failed_passes >= self.policy.passes() {
                        warn!(
                            "Giving up on shadow copy after {} passes, leaving it for the next start: {}",
                            job.failed_passes, e
                        );
                        report.abandoned.push(job.scratch_dir.clone());
                        continue;
                    }
                    debug!("Shadow copy still held, keeping it queued: {}", e);
                    report.orphaned.push(job.scratch_dir.clone());
                    survivors.push(job);
                }
            }
        }

        if !survivors.is_empty() {
            self.pending.lock().extend(survivors);
        }

        if !report.deleted.is_empty() || report.left_behind() > 0 {
            info!(
                deleted = report.deleted.len(),
                orphaned = report.orphaned.len(),
                abandoned = report.abandoned.len(),
                "shadow copy reaping finished"
            );
        }
        report
    }

    /// Delete scratch directories not owned by any open sandbox or queued job.
    ///
    /// Used on start-up to clear copies left behind by an earlier process.
    pub async fn sweep_orphans(&self, protected: &HashSet<PathBuf>) -> ReapReport {
        let mut report = ReapReport::default();
        let queued: HashSet<PathBuf> = self.pending().into_iter().collect();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
            Err(e) => {
                warn!("Failed to scan shadow root {:?}: {}", self.root, e);
                return report;
            }
        };

        let mut stale = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                    if is_dir && !protected.contains(&path) && !queued.contains(&path) {
                        stale.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read shadow root entry: {}", e);
                    break;
                }
            }
        }

        for dir in stale {
            match self.remove(&dir).await {
                Ok(()) => report.deleted.push(dir),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to sweep stale shadow copy {:?}: {}", dir, e);
                    report.orphaned.push(dir);
                }
            }
        }

        if !report.deleted.is_empty() {
            info!("Swept {} stale shadow copies", report.deleted.len());
        }
        report
    }

    /// Keep reaping until the queue drains or `passes` runs out
    pub async fn reap_until_clean(&self, passes: u32) -> ReapReport {
        let mut total = ReapReport::default();
        for _ in 0..passes.max(1) {
            let report = self.reap_pending().await;
            let done = report.orphaned.is_empty();
            total.deleted.extend(report.deleted);
            total.abandoned.extend(report.abandoned);
            total.orphaned = report.orphaned;
            if done {
                break;
            }
        }
        total
    }

    /// Run the remover on the blocking pool
    async fn remove(&self, dir: &Path) -> io::Result<()> {
        let remover = self.remover.clone();
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || remover.remove_dir_all(&dir))
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)))
    }
}

async fn copy_file(from: &Path, to: &Path) -> Result<(), StageError> {
    tokio::fs::copy(from, to)
        .await
        .map(|_| ())
        .map_err(|source| StageError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })
}

/// Copy the flat `<stem>.deps/` directory next to `source`, if there is one
async fn copy_companions(source: &Path, scratch_dir: &Path) -> Result<Vec<PathBuf>, StageError> {
    let Some(deps_dir) = companion_dir(source) else {
        return Ok(Vec::new());
    };

    let mut entries = match tokio::fs::read_dir(&deps_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StageError::Copy {
                from: deps_dir.clone(),
                to: scratch_dir.to_path_buf(),
                source,
            });
        }
    };

    let mut copied = Vec::new();
    loop {
        let entry = entries.next_entry().await.map_err(|source| StageError::Copy {
            from: deps_dir.clone(),
            to: scratch_dir.to_path_buf(),
            source,
        })?;
        let Some(entry) = entry else { break };

        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let target = scratch_dir.join(entry.file_name());
        copy_file(&path, &target).await?;
        copied.push(target);
    }
    copied.sort();
    Ok(copied)
}

/// `<dir>/<stem>.deps` for `<dir>/<stem>.<ext>`
pub fn companion_dir(source: &Path) -> Option<PathBuf> {
    let stem = source.file_stem()?.to_str()?;
    Some(source.with_file_name(format!("{stem}.deps")))
}
