//! Detection of edits and deletions made to an open file by something other
//! than this editor.
//!
//! Comparison is by modification time and size, then by content hash when the
//! baseline carries one, so a `touch` without a write is not reported. The
//! check-then-save window is an accepted race: whoever writes last wins.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::document::DocumentId;

/// What the editor last knew about a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime: SystemTime,
    pub len: u64,
    pub digest: Option<[u8; 32]>,
}

impl Fingerprint {
    pub fn new(mtime: SystemTime, len: u64, digest: Option<[u8; 32]>) -> Self {
        Self { mtime, len, digest }
    }

    /// Fingerprint for bytes just read from or written to `path`.
    pub fn from_written(metadata: &std::fs::Metadata, bytes: &[u8]) -> Self {
        Self {
            mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            len: metadata.len(),
            digest: Some(digest_bytes(bytes)),
        }
    }

    /// Reads `path` and fingerprints its current state.
    pub fn read(path: &Path) -> Result<Self, WatchError> {
        let metadata = std::fs::metadata(path).map_err(|e| WatchError::inaccessible(path, e))?;
        let bytes = std::fs::read(path).map_err(|e| WatchError::inaccessible(path, e))?;
        Ok(Self::from_written(&metadata, &bytes))
    }
}

pub fn digest_bytes(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Unchanged,
    ModifiedExternally,
    DeletedExternally,
}

/// Never surfaced to callers; an inaccessible file reads as deleted.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("{path} is not accessible: {source}")]
    Inaccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WatchError {
    fn inaccessible(path: &Path, source: io::Error) -> Self {
        WatchError::Inaccessible {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExternalChangeWatcher {
    path: Option<PathBuf>,
    baseline: Option<Fingerprint>,
}

impl ExternalChangeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed(path: PathBuf, baseline: Fingerprint) -> Self {
        Self {
            path: Some(path),
            baseline: Some(baseline),
        }
    }

    pub fn arm(&mut self, path: PathBuf, baseline: Fingerprint) {
        self.path = Some(path);
        self.baseline = Some(baseline);
    }

    pub fn baseline(&self) -> Option<&Fingerprint> {
        self.baseline.as_ref()
    }

    /// Unarmed watchers always report `Unchanged`.
    pub fn poll(&mut self) -> ChangeState {
        match self.check() {
            Ok(state) => state,
            Err(e) => {
                log::warn!("{}; treating it as deleted", e);
                ChangeState::DeletedExternally
            }
        }
    }

    fn check(&mut self) -> Result<ChangeState, WatchError> {
        let (Some(path), Some(baseline)) = (self.path.as_ref(), self.baseline.as_mut()) else {
            return Ok(ChangeState::Unchanged);
        };

        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(ChangeState::DeletedExternally)
            }
            Err(e) => return Err(WatchError::inaccessible(path, e)),
        };
        if !metadata.is_file() {
            return Ok(ChangeState::DeletedExternally);
        }

        let mtime = metadata.modified().unwrap_or(baseline.mtime);
        let len = metadata.len();
        if mtime == baseline.mtime && len == baseline.len {
            return Ok(ChangeState::Unchanged);
        }
        if len != baseline.len {
            return Ok(ChangeState::ModifiedExternally);
        }

        let Some(expected) = baseline.digest else {
            return Ok(ChangeState::ModifiedExternally);
        };
        let bytes = std::fs::read(path).map_err(|e| WatchError::inaccessible(path, e))?;
        if digest_bytes(&bytes) == expected {
            log::debug!("{} was touched without changes", path.display());
            baseline.mtime = mtime;
            Ok(ChangeState::Unchanged)
        } else {
            Ok(ChangeState::ModifiedExternally)
        }
    }
}

/// One file handed to the background poller.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub document: DocumentId,
    pub path: PathBuf,
    pub baseline: Fingerprint,
}

/// Poll outcome returned to the UI thread. `refreshed` carries the updated
/// baseline after a touch-only change.
#[derive(Debug, Clone)]
pub struct WatchReport {
    pub document: DocumentId,
    pub baseline: Fingerprint,
    pub refreshed: Option<Fingerprint>,
    pub state: ChangeState,
}

/// Runs watcher polls off the UI thread. Results are picked up with
/// [`BackgroundPoller::drain`] on the next tick; nothing here touches a
/// document directly.
pub struct BackgroundPoller {
    requests: mpsc::Sender<Vec<WatchTarget>>,
    reports: mpsc::UnboundedReceiver<WatchReport>,
    task: JoinHandle<()>,
}

impl BackgroundPoller {
    /// Must be called from within a tokio runtime.
    pub fn spawn() -> Self {
        let (requests, mut request_rx) = mpsc::channel::<Vec<WatchTarget>>(1);
        let (report_tx, reports) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Some(targets) = request_rx.recv().await {
                let polled = tokio::task::spawn_blocking(move || {
                    targets
                        .into_iter()
                        .map(|target| {
                            let mut watcher =
                                ExternalChangeWatcher::armed(target.path, target.baseline.clone());
                            let state = watcher.poll();
                            let refreshed = watcher
                                .baseline()
                                .filter(|b| **b != target.baseline)
                                .cloned();
                            WatchReport {
                                document: target.document,
                                baseline: target.baseline,
                                refreshed,
                                state,
                            }
                        })
                        .collect::<Vec<_>>()
                })
                .await;

                match polled {
                    Ok(reports) => {
                        for report in reports {
                            if report_tx.send(report).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => log::error!("External change poll task failed: {}", e),
                }
            }
        });

        Self {
            requests,
            reports,
            task,
        }
    }

    /// Queues a poll round. Returns `false` if the previous round is still
    /// pending, in which case this one is skipped.
    pub fn request(&self, targets: Vec<WatchTarget>) -> bool {
        if targets.is_empty() {
            return true;
        }
        self.requests.try_send(targets).is_ok()
    }

    pub fn drain(&mut self) -> Vec<WatchReport> {
        let mut out = Vec::new();
        while let Ok(report) = self.reports.try_recv() {
            out.push(report);
        }
        out
    }
}

impl Drop for BackgroundPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_and_fingerprint(path: &Path, bytes: &[u8]) -> Fingerprint {
        fs::write(path, bytes).unwrap();
        Fingerprint::read(path).unwrap()
    }

    fn set_mtime(path: &Path, mtime: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    #[test]
    fn test_unarmed_watcher_is_quiet() {
        assert_eq!(ExternalChangeWatcher::new().poll(), ChangeState::Unchanged);
    }

    #[test]
    fn test_detects_modification_and_deletion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        let baseline = write_and_fingerprint(&path, b"first");
        let mut watcher = ExternalChangeWatcher::armed(path.clone(), baseline);
        assert_eq!(watcher.poll(), ChangeState::Unchanged);

        fs::write(&path, b"second version").unwrap();
        assert_eq!(watcher.poll(), ChangeState::ModifiedExternally);

        fs::remove_file(&path).unwrap();
        assert_eq!(watcher.poll(), ChangeState::DeletedExternally);
    }

    #[test]
    fn test_same_size_rewrite_is_caught_by_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        let baseline = write_and_fingerprint(&path, b"aaaa");
        let mut watcher = ExternalChangeWatcher::armed(path.clone(), baseline.clone());

        fs::write(&path, b"bbbb").unwrap();
        set_mtime(&path, baseline.mtime + Duration::from_secs(5));
        assert_eq!(watcher.poll(), ChangeState::ModifiedExternally);
    }

    #[test]
    fn test_touch_without_write_is_not_a_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        let baseline = write_and_fingerprint(&path, b"same");
        let mut watcher = ExternalChangeWatcher::armed(path.clone(), baseline.clone());

        let touched = baseline.mtime + Duration::from_secs(60);
        set_mtime(&path, touched);
        assert_eq!(watcher.poll(), ChangeState::Unchanged);
        assert_eq!(watcher.baseline().map(|b| b.mtime), Some(touched));
    }

    #[test]
    fn test_directory_in_place_of_file_reads_as_deleted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        let baseline = write_and_fingerprint(&path, b"x");
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        let mut watcher = ExternalChangeWatcher::armed(path, baseline);
        assert_eq!(watcher.poll(), ChangeState::DeletedExternally);
    }

    #[tokio::test]
    async fn test_background_poller_reports_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bg.txt");
        let baseline = write_and_fingerprint(&path, b"one");
        fs::write(&path, b"changed!").unwrap();

        let mut poller = BackgroundPoller::spawn();
        assert!(poller.request(vec![WatchTarget {
            document: DocumentId(7),
            path,
            baseline,
        }]));

        let mut reports = Vec::new();
        for _ in 0..100 {
            reports = poller.drain();
            if !reports.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].document, DocumentId(7));
        assert_eq!(reports[0].state, ChangeState::ModifiedExternally);
    }
}
