//! Recently opened files, remembered cursor positions and the files that were
//! open at the last clean exit. Stored as `history.json` in the data dir.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::atomic_file::write_atomic;
use crate::session_manager::{is_restorable, SessionDocument};

pub const MAX_LAST_FILES: usize = 20;
const MAX_CURSOR_ENTRIES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CursorMemory {
    path: PathBuf,
    position: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecentHistory {
    #[serde(default)]
    recent_files: Vec<PathBuf>,
    /// Most recently updated first.
    #[serde(default)]
    cursor_positions: Vec<CursorMemory>,
    #[serde(default)]
    last_files: Vec<SessionDocument>,
    #[serde(skip)]
    location: Option<PathBuf>,
}

impl RecentHistory {
    /// Reads the history at `path`. A missing or unreadable file yields an
    /// empty history bound to the same location.
    pub async fn load(path: &Path) -> Self {
        let mut history = match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str::<Self>(&json).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable history {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to read history {}: {}", path.display(), e);
                }
                Self::default()
            }
        };
        history.location = Some(path.to_path_buf());
        history
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let Some(path) = self.location.as_ref() else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes()).await?;
        log::debug!("Saved history to {}", path.display());
        Ok(())
    }

    pub fn recent_files(&self) -> &[PathBuf] {
        &self.recent_files
    }

    /// Moves `path` to the front, dropping duplicates and anything past `limit`.
    pub fn add_recent(&mut self, path: &Path, limit: usize) {
        self.recent_files.retain(|p| p != path);
        self.recent_files.insert(0, path.to_path_buf());
        self.recent_files.truncate(limit.max(1));
    }

    pub fn cursor_position(&self, path: &Path) -> Option<usize> {
        self.cursor_positions
            .iter()
            .find(|m| m.path == path)
            .map(|m| m.position)
    }

    pub fn remember_cursor(&mut self, path: &Path, position: usize) {
        self.cursor_positions.retain(|m| m.path != path);
        self.cursor_positions.insert(
            0,
            CursorMemory {
                path: path.to_path_buf(),
                position,
            },
        );
        self.cursor_positions.truncate(MAX_CURSOR_ENTRIES);
    }

    pub fn set_last_files(&mut self, documents: Vec<SessionDocument>) {
        let mut seen = std::collections::HashSet::new();
        self.last_files = documents
            .into_iter()
            .filter(|d| seen.insert(d.path.clone()))
            .take(MAX_LAST_FILES)
            .collect();
    }

    pub fn last_files(&self) -> &[SessionDocument] {
        &self.last_files
    }

    /// Splits the last-files list into documents that can be reopened and
    /// paths that are gone.
    pub async fn restorable_last_files(&self) -> (Vec<SessionDocument>, Vec<PathBuf>) {
        let mut restorable = Vec::new();
        let mut missing = Vec::new();
        for document in &self.last_files {
            if is_restorable(&document.path).await {
                restorable.push(document.clone());
            } else {
                missing.push(document.path.clone());
            }
        }
        (restorable, missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use textcore::Encoding;

    fn session_doc(path: &Path) -> SessionDocument {
        SessionDocument {
            path: path.to_path_buf(),
            encoding: Encoding::Utf8,
            cursor_position: 0,
            window: 0,
        }
    }

    #[test]
    fn test_add_recent_dedups_and_truncates() {
        let mut history = RecentHistory::default();
        for name in ["a", "b", "c", "a"] {
            history.add_recent(Path::new(name), 3);
        }
        assert_eq!(
            history.recent_files(),
            &[PathBuf::from("a"), PathBuf::from("c"), PathBuf::from("b")]
        );

        history.add_recent(Path::new("d"), 2);
        assert_eq!(history.recent_files(), &[PathBuf::from("d"), PathBuf::from("a")]);
    }

    #[test]
    fn test_cursor_memory() {
        let mut history = RecentHistory::default();
        history.remember_cursor(Path::new("/a"), 10);
        history.remember_cursor(Path::new("/a"), 12);
        assert_eq!(history.cursor_position(Path::new("/a")), Some(12));
        assert_eq!(history.cursor_position(Path::new("/b")), None);
        assert_eq!(history.cursor_positions.len(), 1);
    }

    #[test]
    fn test_last_files_are_deduplicated_and_capped() {
        let mut history = RecentHistory::default();
        let mut docs: Vec<_> = (0..30)
            .map(|i| session_doc(&PathBuf::from(format!("/f{}", i))))
            .collect();
        docs.insert(1, session_doc(Path::new("/f0")));
        history.set_last_files(docs);
        assert_eq!(history.last_files().len(), MAX_LAST_FILES);
        assert_eq!(history.last_files()[1].path, PathBuf::from("/f1"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let kept = dir.path().join("kept.txt");
        std::fs::write(&kept, "x").unwrap();

        let mut history = RecentHistory::load(&path).await;
        history.add_recent(&kept, 10);
        history.remember_cursor(&kept, 1);
        history.set_last_files(vec![session_doc(&kept), session_doc(&dir.path().join("gone.txt"))]);
        history.save().await.unwrap();

        let loaded = RecentHistory::load(&path).await;
        assert_eq!(loaded.recent_files(), &[kept.clone()]);
        assert_eq!(loaded.cursor_position(&kept), Some(1));

        let (restorable, missing) = loaded.restorable_last_files().await;
        assert_eq!(restorable.len(), 1);
        assert_eq!(missing, vec![dir.path().join("gone.txt")]);
    }

    #[tokio::test]
    async fn test_corrupt_history_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "[broken").unwrap();
        let history = RecentHistory::load(&path).await;
        assert!(history.recent_files().is_empty());
    }
}
