//! Periodic recovery snapshots of dirty documents.
//!
//! The UI tick decides when a round is due and hands owned snapshots to a
//! background task; the task never sees a `DocumentRecord`. Write failures come
//! back over a channel and are surfaced as status warnings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use textcore::Encoding;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::atomic_file::write_atomic;
use crate::document::{DocumentId, DocumentRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub document: DocumentId,
    pub path: Option<PathBuf>,
    pub encoding: Encoding,
    pub cursor_position: usize,
    pub content: String,
    pub saved_at: DateTime<Utc>,
}

impl RecoverySnapshot {
    pub fn capture(record: &DocumentRecord) -> Self {
        Self {
            document: record.id(),
            path: record.path().map(Path::to_path_buf),
            encoding: record.encoding,
            cursor_position: record.cursor_position(),
            content: record.content(),
            saved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutosaveFailure {
    pub document: DocumentId,
    pub error: String,
}

#[derive(Debug)]
enum AutosaveRequest {
    Write(Vec<RecoverySnapshot>),
    Discard(DocumentId),
    Stop,
}

pub fn snapshot_path(dir: &Path, document: DocumentId) -> PathBuf {
    dir.join(format!("{}.json", document.0))
}

pub async fn read_snapshot(path: &Path) -> anyhow::Result<RecoverySnapshot> {
    let json = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&json)?)
}

pub struct Autosaver {
    interval: Duration,
    last_round: Instant,
    requests: mpsc::Sender<AutosaveRequest>,
    failures: mpsc::UnboundedReceiver<AutosaveFailure>,
    task: JoinHandle<()>,
}

impl Autosaver {
    /// Must be called from within a tokio runtime.
    pub fn spawn(dir: PathBuf, interval: Duration) -> Self {
        let (requests, mut request_rx) = mpsc::channel::<AutosaveRequest>(4);
        let (failure_tx, failures) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                match request {
                    AutosaveRequest::Write(snapshots) => {
                        for snapshot in snapshots {
                            let target = snapshot_path(&dir, snapshot.document);
                            let result = match serde_json::to_vec(&snapshot) {
                                Ok(bytes) => write_atomic(&target, &bytes)
                                    .await
                                    .map_err(|e| e.to_string()),
                                Err(e) => Err(e.to_string()),
                            };
                            match result {
                                Ok(()) => log::debug!("Autosaved {}", snapshot.document),
                                Err(error) => {
                                    let failure = AutosaveFailure {
                                        document: snapshot.document,
                                        error,
                                    };
                                    if failure_tx.send(failure).is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    AutosaveRequest::Discard(document) => {
                        let target = snapshot_path(&dir, document);
                        if let Err(e) = tokio::fs::remove_file(&target).await {
                            if e.kind() != std::io::ErrorKind::NotFound {
                                log::warn!("Failed to drop snapshot {}: {}", target.display(), e);
                            }
                        }
                    }
                    AutosaveRequest::Stop => return,
                }
            }
        });

        Self {
            interval,
            last_round: Instant::now(),
            requests,
            failures,
            task,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_round) >= self.interval
    }

    /// Hands a round of snapshots to the writer. A full queue skips the round
    /// rather than waiting; the next tick tries again.
    pub fn submit(&mut self, snapshots: Vec<RecoverySnapshot>, now: Instant) -> bool {
        self.last_round = now;
        if snapshots.is_empty() {
            return true;
        }
        match self.requests.try_send(AutosaveRequest::Write(snapshots)) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Autosave round skipped: {}", e);
                false
            }
        }
    }

    /// Drops the snapshot of a document that was saved or closed.
    pub fn discard(&self, document: DocumentId) {
        if self.requests.try_send(AutosaveRequest::Discard(document)).is_err() {
            log::debug!("Snapshot of {} left for shutdown cleanup", document);
        }
    }

    pub fn drain_failures(&mut self) -> Vec<AutosaveFailure> {
        let mut out = Vec::new();
        while let Ok(failure) = self.failures.try_recv() {
            out.push(failure);
        }
        out
    }

    /// Finishes the queued rounds, then stops the writer. Nothing touches the
    /// recovery directory once this returns.
    pub async fn stop(mut self) {
        if self.requests.send(AutosaveRequest::Stop).await.is_err() {
            // The writer already exited.
            return;
        }
        if let Err(e) = (&mut self.task).await {
            log::warn!("Autosave writer ended abnormally: {}", e);
        }
    }
}

impl Drop for Autosaver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ViewDefaults;
    use tempfile::TempDir;

    fn snapshot(id: u64, content: &str) -> RecoverySnapshot {
        let mut record = DocumentRecord::untitled(DocumentId(id), Encoding::Utf8, ViewDefaults::default());
        record.insert(0, content);
        RecoverySnapshot::capture(&record)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_snapshots_are_written_and_discarded() {
        let dir = TempDir::new().unwrap();
        let recovery = dir.path().join("recovery").join("42");
        let mut saver = Autosaver::spawn(recovery.clone(), Duration::from_secs(60));

        assert!(saver.submit(vec![snapshot(1, "draft")], Instant::now()));
        let target = snapshot_path(&recovery, DocumentId(1));
        assert!(wait_for(|| target.exists()).await);

        let restored = read_snapshot(&target).await.unwrap();
        assert_eq!(restored.content, "draft");
        assert_eq!(restored.path, None);

        saver.discard(DocumentId(1));
        assert!(wait_for(|| !target.exists()).await);
        assert!(saver.drain_failures().is_empty());
    }

    #[tokio::test]
    async fn test_write_failures_are_reported() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let mut saver = Autosaver::spawn(blocker, Duration::from_secs(60));
        saver.submit(vec![snapshot(9, "x")], Instant::now());

        let mut failures = Vec::new();
        for _ in 0..200 {
            failures = saver.drain_failures();
            if !failures.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].document, DocumentId(9));
    }

    #[tokio::test]
    async fn test_stopped_writer_does_not_recreate_directory() {
        let dir = TempDir::new().unwrap();
        let recovery = dir.path().join("recovery").join("7");
        let mut saver = Autosaver::spawn(recovery.clone(), Duration::from_secs(60));
        let round: Vec<_> = (0..50).map(|i| snapshot(i, "pending")).collect();
        saver.submit(round, Instant::now());

        saver.stop().await;
        assert_eq!(std::fs::read_dir(&recovery).unwrap().count(), 50);
        std::fs::remove_dir_all(&recovery).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!recovery.exists());
    }

    #[tokio::test]
    async fn test_interval_gating() {
        let dir = TempDir::new().unwrap();
        let mut saver = Autosaver::spawn(dir.path().to_path_buf(), Duration::from_secs(60));
        let start = Instant::now();
        saver.submit(Vec::new(), start);
        assert!(!saver.is_due(start + Duration::from_secs(30)));
        assert!(saver.is_due(start + Duration::from_secs(60)));
    }
}
