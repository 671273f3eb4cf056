//! Advisory file leases for cross-process exclusion.
//!
//! A lease is a small JSON file created with `create_new`. All reads and
//! writes of a lease happen under an exclusive `fs2` lock on a sibling
//! `.lock` file, so breaking a stale lease and taking it over is atomic
//! with respect to other anvil processes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::anvil_config::LeaseSection;
use crate::errors::LeaseError;

/// On-disk lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner_token: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub renewed_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn is_stale(&self, now: DateTime<Utc>, grace_seconds: u64) -> bool {
        let limit = chrono::Duration::seconds((self.ttl_seconds + grace_seconds) as i64);
        now.signed_duration_since(self.renewed_at) > limit
    }
}

enum LeaseFile {
    Missing,
    Corrupt(String),
    Held(LeaseRecord),
}

fn io_err(path: &Path, source: std::io::Error) -> LeaseError {
    LeaseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_lease(path: &Path) -> Result<LeaseFile, LeaseError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(match serde_json::from_str::<LeaseRecord>(&content) {
            Ok(record) => LeaseFile::Held(record),
            Err(e) => LeaseFile::Corrupt(e.to_string()),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LeaseFile::Missing),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            Ok(LeaseFile::Corrupt(e.to_string()))
        }
        Err(e) => Err(io_err(path, e)),
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Hold the sibling lock for the duration of a lease mutation.
fn lock_sibling(path: &Path) -> Result<File, LeaseError> {
    let lock_path = lock_path_for(path);
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| io_err(&lock_path, e))?;
    FileExt::lock_exclusive(&file).map_err(|e| io_err(&lock_path, e))?;
    Ok(file)
}

fn write_new(path: &Path, record: &LeaseRecord) -> Result<(), LeaseError> {
    let payload = serde_json::to_vec_pretty(record)
        .map_err(|e| io_err(path, std::io::Error::other(e)))?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    file.write_all(&payload).map_err(|e| io_err(path, e))?;
    file.sync_all().map_err(|e| io_err(path, e))
}

/// Refresh `renewed_at` if `owner_token` still holds the lease.
fn renew_lease(path: &Path, owner_token: &str) -> Result<(), LeaseError> {
    let _lock = lock_sibling(path)?;
    match read_lease(path)? {
        LeaseFile::Held(mut record) if record.owner_token == owner_token => {
            record.renewed_at = Utc::now();
            overwrite(path, &record)
        }
        _ => Err(LeaseError::NotOwner {
            path: path.to_path_buf(),
            owner_token: owner_token.to_string(),
        }),
    }
}

fn overwrite(path: &Path, record: &LeaseRecord) -> Result<(), LeaseError> {
    let tmp = path.with_extension("lease.tmp");
    let payload = serde_json::to_vec_pretty(record)
        .map_err(|e| io_err(path, std::io::Error::other(e)))?;
    let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
    file.write_all(&payload).map_err(|e| io_err(&tmp, e))?;
    file.sync_all().map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

/// Result of a single non-blocking acquire attempt.
pub enum TryAcquire {
    Acquired(LeaseGuard),
    Held { owner: String },
}

#[derive(Debug, Clone)]
pub struct LeaseCoordinator {
    ttl_seconds: u64,
    grace_seconds: u64,
    acquire_timeout: Duration,
    poll_interval: Duration,
}

impl LeaseCoordinator {
    pub fn from_config(section: &LeaseSection) -> Self {
        Self {
            ttl_seconds: section.ttl_seconds,
            grace_seconds: section.grace_seconds,
            acquire_timeout: Duration::from_millis(section.acquire_timeout_ms),
            poll_interval: Duration::from_millis(section.poll_interval_ms.max(1)),
        }
    }

    /// How often a [`Heartbeat`] renews: a third of the ttl.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.ttl_seconds * 1000 / 3).max(Duration::from_millis(10))
    }

    /// One attempt. Stale or corrupt leases are broken and taken over.
    pub fn try_acquire(&self, path: &Path) -> Result<TryAcquire, LeaseError> {
        let _lock = lock_sibling(path)?;
        let now = Utc::now();

        match read_lease(path)? {
            LeaseFile::Missing => {}
            LeaseFile::Held(record) if !record.is_stale(now, self.grace_seconds) => {
                return Ok(TryAcquire::Held {
                    owner: record.owner_token,
                });
            }
            LeaseFile::Held(record) => {
                tracing::warn!(
                    path = %path.display(),
                    owner = %record.owner_token,
                    renewed_at = %record.renewed_at,
                    "breaking stale lease"
                );
                std::fs::remove_file(path).map_err(|e| io_err(path, e))?;
            }
            LeaseFile::Corrupt(reason) => {
                tracing::warn!(path = %path.display(), %reason, "breaking corrupt lease");
                std::fs::remove_file(path).map_err(|e| io_err(path, e))?;
            }
        }

        let owner_token = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple());
        let record = LeaseRecord {
            owner_token: owner_token.clone(),
            acquired_at: now,
            ttl_seconds: self.ttl_seconds,
            renewed_at: now,
        };
        write_new(path, &record)?;
        tracing::debug!(path = %path.display(), owner = %owner_token, "lease acquired");

        Ok(TryAcquire::Acquired(LeaseGuard {
            path: path.to_path_buf(),
            owner_token,
            released: false,
        }))
    }

    /// Poll until the lease is free or the acquire timeout elapses.
    pub async fn acquire(&self, path: &Path) -> Result<LeaseGuard, LeaseError> {
        let start = Instant::now();
        loop {
            match self.try_acquire(path)? {
                TryAcquire::Acquired(guard) => return Ok(guard),
                TryAcquire::Held { owner } => {
                    let waited = start.elapsed();
                    if waited >= self.acquire_timeout {
                        return Err(LeaseError::Timeout {
                            path: path.to_path_buf(),
                            owner,
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    tracing::debug!(path = %path.display(), %owner, "lease held, waiting");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

/// A held lease. Released on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    path: PathBuf,
    owner_token: String,
    released: bool,
}

impl LeaseGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    /// Refresh `renewed_at`. Fails if the lease was broken and taken over.
    pub fn renew(&self) -> Result<(), LeaseError> {
        renew_lease(&self.path, &self.owner_token)
    }

    /// Keep the lease fresh from a background task while a long call runs.
    /// Renewal stops when the returned [`Heartbeat`] is dropped or the lease
    /// is lost.
    pub fn heartbeat(&self, every: Duration) -> Heartbeat {
        let path = self.path.clone();
        let owner_token = self.owner_token.clone();
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (p, o) = (path.clone(), owner_token.clone());
                let renewed = tokio::task::spawn_blocking(move || renew_lease(&p, &o)).await;
                match renewed {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(path = %path.display(), error = %e, "lease heartbeat stopped");
                        flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "lease heartbeat task failed");
                        return;
                    }
                }
            }
        });

        Heartbeat { task, lost }
    }

    pub fn release(mut self) -> Result<(), LeaseError> {
        self.released = true;
        self.release_inner()
    }

    fn release_inner(&self) -> Result<(), LeaseError> {
        let _lock = lock_sibling(&self.path)?;
        match read_lease(&self.path)? {
            LeaseFile::Held(record) if record.owner_token == self.owner_token => {
                std::fs::remove_file(&self.path).map_err(|e| io_err(&self.path, e))?;
                tracing::debug!(path = %self.path.display(), "lease released");
            }
            _ => {}
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release_inner() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lease");
        }
    }
}

/// Background renewal of a [`LeaseGuard`]. Aborted on drop.
#[derive(Debug)]
pub struct Heartbeat {
    task: tokio::task::JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl Heartbeat {
    /// True once a renewal found the lease owned by someone else.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn coordinator(timeout_ms: u64) -> LeaseCoordinator {
        LeaseCoordinator::from_config(&LeaseSection {
            ttl_seconds: 60,
            grace_seconds: 5,
            acquire_timeout_ms: timeout_ms,
            poll_interval_ms: 10,
        })
    }

    fn write_record(path: &Path, owner: &str, age_secs: i64) {
        let at = Utc::now() - chrono::Duration::seconds(age_secs);
        let record = LeaseRecord {
            owner_token: owner.to_string(),
            acquired_at: at,
            ttl_seconds: 60,
            renewed_at: at,
        };
        std::fs::write(path, serde_json::to_string(&record).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workspace.lease");
        let leases = coordinator(50);

        let guard = leases.acquire(&path).await.unwrap();
        let err = leases.acquire(&path).await.unwrap_err();
        match err {
            LeaseError::Timeout { owner, .. } => assert_eq!(owner, guard.owner_token()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_waiter_gets_lease_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workspace.lease");
        let leases = coordinator(2000);

        let guard = leases.acquire(&path).await.unwrap();
        let waiter = {
            let leases = leases.clone();
            let path = path.clone();
            tokio::spawn(async move { leases.acquire(&path).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);

        let second = waiter.await.unwrap().unwrap();
        assert!(path.exists());
        second.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_only_one_concurrent_try_acquire_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lease");
        let leases = coordinator(0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let leases = leases.clone();
                let path = path.clone();
                std::thread::spawn(move || match leases.try_acquire(&path).unwrap() {
                    TryAcquire::Acquired(guard) => Some(guard),
                    TryAcquire::Held { .. } => None,
                })
            })
            .collect();
        let guards: Vec<LeaseGuard> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_lease_is_broken() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lease");
        write_record(&path, "crashed-process", 3600);

        let guard = coordinator(0).acquire(&path).await.unwrap();
        assert_ne!(guard.owner_token(), "crashed-process");
    }

    #[tokio::test]
    async fn test_live_lease_within_grace_is_respected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lease");
        // past ttl but inside grace
        write_record(&path, "slow-process", 62);

        let err = coordinator(20).acquire(&path).await.unwrap_err();
        assert!(matches!(err, LeaseError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_lease_is_broken() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lease");
        std::fs::write(&path, "{not json").unwrap();

        let guard = coordinator(0).acquire(&path).await.unwrap();
        let on_disk: LeaseRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.owner_token, guard.owner_token());
    }

    #[tokio::test]
    async fn test_renew_updates_timestamp_and_checks_owner() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lease");
        let guard = coordinator(0).acquire(&path).await.unwrap();

        let before: LeaseRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.renew().unwrap();
        let after: LeaseRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(after.renewed_at > before.renewed_at);
        assert_eq!(after.acquired_at, before.acquired_at);

        write_record(&path, "thief", 0);
        assert!(matches!(guard.renew(), Err(LeaseError::NotOwner { .. })));
        drop(guard);
        // someone else's lease survives our drop
        assert!(path.exists());
    }

    fn short_lived() -> LeaseCoordinator {
        LeaseCoordinator::from_config(&LeaseSection {
            ttl_seconds: 1,
            grace_seconds: 0,
            acquire_timeout_ms: 0,
            poll_interval_ms: 10,
        })
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_past_ttl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lease");
        let leases = short_lived();
        let guard = leases.acquire(&path).await.unwrap();
        let heartbeat = guard.heartbeat(leases.heartbeat_interval());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        match leases.try_acquire(&path).unwrap() {
            TryAcquire::Held { owner } => assert_eq!(owner, guard.owner_token()),
            TryAcquire::Acquired(_) => panic!("lease went stale under a heartbeat"),
        }
        assert!(!heartbeat.is_lost());
    }

    #[tokio::test]
    async fn test_lease_without_heartbeat_goes_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lease");
        let leases = short_lived();
        let _guard = leases.acquire(&path).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(matches!(
            leases.try_acquire(&path).unwrap(),
            TryAcquire::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_stops_when_lease_taken() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.lease");
        let leases = short_lived();
        let guard = leases.acquire(&path).await.unwrap();
        let heartbeat = guard.heartbeat(Duration::from_millis(20));

        write_record(&path, "thief", 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(heartbeat.is_lost());
        let on_disk: LeaseRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.owner_token, "thief");
    }
}
