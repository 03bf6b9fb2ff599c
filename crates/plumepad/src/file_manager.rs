use std::io;
use std::path::{Path, PathBuf};
use textcore::{Decoded, Encoding, EncodingError, EncodingResolver, SaveTransforms};
use thiserror::Error;
use tokio::fs;

use crate::config::Config;
use crate::document::DocumentRecord;
use crate::watcher::Fingerprint;

const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;
const MAX_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("{path}: {source}")]
    Encoding {
        path: PathBuf,
        #[source]
        source: EncodingError,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SaveError {
    /// The caller should offer another encoding or a UTF-8 fallback.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("{0} was modified by another program; confirm to overwrite")]
    ExternallyModified(PathBuf),
    #[error("file is read-only: {0}")]
    ReadOnly(PathBuf),
    #[error("document has no file name")]
    NoPath,
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct LoadedFile {
    pub decoded: Decoded,
    pub fingerprint: Fingerprint,
    pub readonly: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub path: PathBuf,
    pub encoding: Encoding,
    pub bytes_written: usize,
    /// Save-time transforms changed the buffer.
    pub transformed: bool,
}

/// Reads and writes document files, applying encoding detection on the way in
/// and validation plus save transforms on the way out.
#[derive(Debug, Clone)]
pub struct FileManager {
    resolver: EncodingResolver,
    transforms: SaveTransforms,
    backup_on_save: bool,
}

impl FileManager {
    pub fn new(resolver: EncodingResolver, transforms: SaveTransforms, backup_on_save: bool) -> Self {
        Self {
            resolver,
            transforms,
            backup_on_save,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            EncodingResolver::new(config.text.default_encoding),
            config.save_transforms(),
            config.files.backup_on_save,
        )
    }

    pub fn resolver(&self) -> &EncodingResolver {
        &self.resolver
    }

    pub async fn load(
        &self,
        path: &Path,
        encoding_override: Option<Encoding>,
    ) -> Result<LoadedFile, LoadError> {
        let metadata = fs::metadata(path).await.map_err(|e| map_read_error(path, e))?;
        if !metadata.is_file() {
            return Err(LoadError::NotAFile(path.to_path_buf()));
        }
        if metadata.len() > LARGE_FILE_THRESHOLD {
            log::warn!(
                "Large file detected ({} bytes): {}",
                metadata.len(),
                path.display()
            );
        }

        let bytes = fs::read(path).await.map_err(|e| map_read_error(path, e))?;
        let decoded = self
            .resolver
            .load(&bytes, encoding_override)
            .map_err(|source| LoadError::Encoding {
                path: path.to_path_buf(),
                source,
            })?;
        if !decoded.confident {
            log::info!(
                "Encoding of {} is a guess ({})",
                path.display(),
                decoded.encoding
            );
        }

        log::info!("Opened file: {}", path.display());
        Ok(LoadedFile {
            fingerprint: Fingerprint::from_written(&metadata, &bytes),
            readonly: metadata.permissions().readonly(),
            size: metadata.len(),
            decoded,
        })
    }

    /// Writes `record` to `target` as `encoding` and marks it saved.
    ///
    /// Nothing is written, and the buffer is left untouched, when the content
    /// is not representable in `encoding`.
    pub async fn save(
        &self,
        record: &mut DocumentRecord,
        target: &Path,
        encoding: Encoding,
    ) -> Result<SaveReceipt, SaveError> {
        let same_file = record.path() == Some(target);
        if same_file && record.is_readonly() {
            return Err(SaveError::ReadOnly(target.to_path_buf()));
        }
        if !same_file {
            if let Ok(metadata) = fs::metadata(target).await {
                if metadata.permissions().readonly() {
                    return Err(SaveError::ReadOnly(target.to_path_buf()));
                }
            }
        }

        let original = record.content();
        let text = if self.transforms.is_noop() {
            original.clone()
        } else {
            self.transforms.apply(&original)
        };
        let bytes = self.resolver.encode_for_save(&text, encoding)?;

        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| SaveError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }
        if self.backup_on_save {
            self.backup(target).await;
        }
        write_with_retry(target, &bytes).await?;

        let metadata = fs::metadata(target).await.map_err(|source| SaveError::Io {
            path: target.to_path_buf(),
            source,
        })?;
        let transformed = text != original;
        if transformed {
            record.replace_content(&text);
        }
        record.mark_saved(
            target.to_path_buf(),
            encoding,
            Fingerprint::from_written(&metadata, &bytes),
        );

        log::info!("Saved file: {} ({})", target.display(), encoding);
        Ok(SaveReceipt {
            path: target.to_path_buf(),
            encoding,
            bytes_written: bytes.len(),
            transformed,
        })
    }

    async fn backup(&self, target: &Path) {
        let Ok(metadata) = fs::metadata(target).await else {
            return;
        };
        if metadata.len() == 0 {
            return;
        }
        let backup_path = backup_path_for(target);
        match fs::copy(target, &backup_path).await {
            Ok(_) => log::info!("Created backup: {}", backup_path.display()),
            Err(e) => log::warn!("Failed to create backup: {}", e),
        }
    }
}

fn backup_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{}.bak", name))
}

async fn write_with_retry(path: &Path, bytes: &[u8]) -> Result<(), SaveError> {
    let mut attempts = 0;
    loop {
        match fs::write(path, bytes).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempts += 1;
                if attempts >= MAX_WRITE_ATTEMPTS || e.kind() == io::ErrorKind::PermissionDenied {
                    return Err(SaveError::Io {
                        path: path.to_path_buf(),
                        source: e,
                    });
                }
                log::warn!(
                    "Save attempt {} failed for {}, retrying...",
                    attempts,
                    path.display()
                );
                tokio::time::sleep(tokio::time::Duration::from_millis(100 * attempts as u64)).await;
            }
        }
    }
}

fn map_read_error(path: &Path, e: io::Error) -> LoadError {
    match e.kind() {
        io::ErrorKind::NotFound => LoadError::NotFound(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => LoadError::PermissionDenied(path.to_path_buf()),
        _ => LoadError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentId, ViewDefaults};
    use crate::watcher::{ChangeState, ExternalChangeWatcher};
    use tempfile::TempDir;

    fn manager(transforms: SaveTransforms) -> FileManager {
        FileManager::new(EncodingResolver::default(), transforms, false)
    }

    async fn open(fm: &FileManager, path: &Path) -> DocumentRecord {
        let loaded = fm.load(path, None).await.unwrap();
        DocumentRecord::from_disk(
            DocumentId(1),
            path.to_path_buf(),
            loaded.decoded,
            loaded.fingerprint,
            loaded.readonly,
            ViewDefaults::default(),
        )
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = manager(SaveTransforms::default())
            .load(&dir.path().join("nope.txt"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_open_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = manager(SaveTransforms::default())
            .load(dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::NotAFile(_)));
    }

    #[tokio::test]
    async fn test_save_unchanged_does_not_self_trigger_watcher() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("same.txt");
        std::fs::write(&path, "stable\n").unwrap();

        let fm = manager(SaveTransforms::default());
        let mut record = open(&fm, &path).await;
        fm.save(&mut record, &path, Encoding::Utf8).await.unwrap();

        let mut watcher =
            ExternalChangeWatcher::armed(path.clone(), record.last_known().unwrap().clone());
        assert_eq!(watcher.poll(), ChangeState::Unchanged);
        assert!(!record.is_dirty());
    }

    #[tokio::test]
    async fn test_unrepresentable_save_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("greek.txt");
        std::fs::write(&path, "alpha").unwrap();

        let fm = manager(SaveTransforms::default());
        let mut record = open(&fm, &path).await;
        record.replace_content("αβγ");

        let err = fm
            .save(&mut record, &path, Encoding::Iso8859_1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SaveError::Encoding(EncodingError::Unrepresentable { .. })
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "alpha");
        assert!(record.is_dirty());

        fm.save(&mut record, &path, Encoding::Utf8).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "αβγ");
    }

    #[tokio::test]
    async fn test_save_applies_transforms_to_buffer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.txt");

        let fm = manager(SaveTransforms {
            remove_trailing_spaces: true,
            append_empty_line: true,
        });
        let mut record = DocumentRecord::untitled(DocumentId(3), Encoding::Utf8, ViewDefaults::default());
        record.insert(0, "line   ");

        let receipt = fm.save(&mut record, &path, Encoding::Utf8).await.unwrap();
        assert!(receipt.transformed);
        assert_eq!(record.content(), "line\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
        assert!(!record.is_dirty());
        assert_eq!(record.path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_backup_on_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.txt");
        std::fs::write(&path, "old").unwrap();

        let fm = FileManager::new(EncodingResolver::default(), SaveTransforms::default(), true);
        let mut record = open(&fm, &path).await;
        record.replace_content("new");
        fm.save(&mut record, &path, Encoding::Utf8).await.unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt.bak")).unwrap(), "old");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_legacy_encoding_is_detected_and_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cyr.txt");
        let bytes = textcore::encoding::encode("Привет", Encoding::Koi8U).unwrap();
        std::fs::write(&path, &bytes).unwrap();

        let fm = manager(SaveTransforms::default());
        let loaded = fm.load(&path, Some(Encoding::Koi8U)).await.unwrap();
        assert_eq!(loaded.decoded.text, "Привет");
        assert_eq!(loaded.decoded.encoding, Encoding::Koi8U);
    }
}
