//! Cross-process exclusive lock on the backlog's dedicated lock file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::warn;

use crate::error::BacklogError;

/// Held while the backlog is read and rewritten. Released on drop.
#[derive(Debug)]
pub struct BacklogLock {
    file: File,
    path: PathBuf,
}

impl BacklogLock {
    /// Block (on a blocking-pool thread) until the lock is ours.
    pub async fn acquire(path: &Path) -> Result<Self, BacklogError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(owned))
            .await
            .map_err(|e| BacklogError::Lock {
                path: path.display().to_string(),
                reason: format!("lock task failed: {e}"),
            })?
    }

    fn acquire_blocking(path: PathBuf) -> Result<Self, BacklogError> {
        let lock_error = |e: std::io::Error| BacklogError::Lock {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(lock_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(lock_error)?;
        file.lock().map_err(lock_error)?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BacklogLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), "Failed to release backlog lock: {}", e);
        }
    }
}

/// Milestones marked `[~]` whose subagent is not in the task store yet.
///
/// Kept in a file beside the lock so every process sees them. Every
/// operation takes the held `BacklogLock` as proof of exclusion. Entries
/// expire after `CLAIM_TTL_SECS` so a crashed dispatcher cannot pin a
/// marker forever.
#[derive(Debug, Clone)]
pub struct PendingClaims {
    path: PathBuf,
}

const CLAIM_TTL_SECS: i64 = 300;

impl PendingClaims {
    pub fn beside(lock_path: &Path) -> Self {
        Self {
            path: lock_path.with_extension("claims"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn claim(&self, _lock: &BacklogLock, number: &str) -> Result<(), BacklogError> {
        let now = Utc::now();
        let mut entries = self.load(now).await?;
        entries.retain(|(claimed, _)| claimed != number);
        entries.push((number.to_string(), now));
        self.save(&entries).await
    }

    pub async fn release(&self, _lock: &BacklogLock, number: &str) -> Result<(), BacklogError> {
        let mut entries = self.load(Utc::now()).await?;
        entries.retain(|(claimed, _)| claimed != number);
        self.save(&entries).await
    }

    /// Unexpired claimed milestone numbers.
    pub async fn numbers(&self, _lock: &BacklogLock) -> Result<Vec<String>, BacklogError> {
        Ok(self
            .load(Utc::now())
            .await?
            .into_iter()
            .map(|(number, _)| number)
            .collect())
    }

    async fn load(&self, now: DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>, BacklogError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let ttl = chrono::Duration::seconds(CLAIM_TTL_SECS);
        Ok(content
            .lines()
            .filter_map(|line| {
                let (number, at) = line.split_once('\t')?;
                let at = DateTime::parse_from_rfc3339(at).ok()?.with_timezone(&Utc);
                (now - at < ttl).then(|| (number.to_string(), at))
            })
            .collect())
    }

    async fn save(&self, entries: &[(String, DateTime<Utc>)]) -> Result<(), BacklogError> {
        if entries.is_empty() {
            return match fs::remove_file(&self.path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        let content: String = entries
            .iter()
            .map(|(number, at)| format!("{number}\t{}\n", at.to_rfc3339()))
            .collect();
        fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn second_holder_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(".backlog.lock");

        let first = BacklogLock::acquire(&path).await.unwrap();
        assert!(path.exists());

        let acquired = Arc::new(AtomicBool::new(false));
        let flag = acquired.clone();
        let contender_path = path.clone();
        let contender = tokio::spawn(async move {
            let lock = BacklogLock::acquire(&contender_path).await.unwrap();
            flag.store(true, Ordering::SeqCst);
            drop(lock);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        contender.await.unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unopenable_path_is_a_lock_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let err = BacklogLock::acquire(&blocker.join("lock")).await.unwrap_err();
        assert!(matches!(err, BacklogError::Lock { .. }));
    }

    #[tokio::test]
    async fn claims_persist_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".backlog.lock");
        let claims = PendingClaims::beside(&lock_path);
        assert_eq!(claims.path(), dir.path().join(".backlog.claims"));

        let lock = BacklogLock::acquire(&lock_path).await.unwrap();
        claims.claim(&lock, "2.1").await.unwrap();
        claims.claim(&lock, "2.2").await.unwrap();
        claims.claim(&lock, "2.1").await.unwrap();

        // Another process only shares the file.
        let other = PendingClaims::beside(&lock_path);
        let mut numbers = other.numbers(&lock).await.unwrap();
        numbers.sort();
        assert_eq!(numbers, vec!["2.1".to_string(), "2.2".to_string()]);

        other.release(&lock, "2.1").await.unwrap();
        claims.release(&lock, "2.2").await.unwrap();
        assert!(claims.numbers(&lock).await.unwrap().is_empty());
        assert!(!claims.path().exists());
    }

    #[tokio::test]
    async fn expired_claims_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".backlog.lock");
        let claims = PendingClaims::beside(&lock_path);
        let stale = (Utc::now() - chrono::Duration::seconds(CLAIM_TTL_SECS + 60)).to_rfc3339();
        std::fs::write(claims.path(), format!("3.1\t{stale}\nnot a claim\n")).unwrap();

        let lock = BacklogLock::acquire(&lock_path).await.unwrap();
        assert!(claims.numbers(&lock).await.unwrap().is_empty());
    }
}
