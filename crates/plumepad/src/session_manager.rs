//! Named sessions: which documents were open, in which encoding, and where the
//! cursor was. Each session is its own JSON file so concurrent writers from
//! different processes only ever race on a single entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use textcore::Encoding;
use thiserror::Error;
use tokio::fs;

use crate::atomic_file::write_atomic;
use crate::config::Config;

const SESSION_FORMAT_VERSION: u32 = 1;
/// Leaves room for ".json" and the atomic writer's temp-file decoration
/// within a 255-byte file name.
const MAX_STEM_BYTES: usize = 180;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session named '{0}' already exists")]
    NameCollision(String),
    #[error("{} document(s) could not be restored", .missing.len())]
    PartialRestore { missing: Vec<PathBuf> },
    #[error("no document of session '{name}' could be restored")]
    NoneRestorable { name: String, missing: Vec<PathBuf> },
    #[error("session storage failed at {path}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("nothing to save")]
    NothingToSave,
    #[error("session '{name}' is unreadable: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid session name: '{0}'")]
    InvalidName(String),
}

impl SessionError {
    fn io(path: &Path, source: io::Error) -> Self {
        SessionError::IoFailure {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What to do when `save` finds an entry with the same name. There is no
/// default; the caller has to have asked the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    Reject,
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    Window,
    AllWindows,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub path: PathBuf,
    pub encoding: Encoding,
    pub cursor_position: usize,
    /// Index of the originating window within an `AllWindows` capture.
    #[serde(default)]
    pub window: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub name: String,
    pub scope: SessionScope,
    pub documents: Vec<SessionDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    #[serde(default)]
    version: u32,
    name: String,
    scope: SessionScope,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    documents: Vec<SessionDocument>,
}

/// A restored session. `warning` carries `PartialRestore` when some
/// documents were dropped.
#[derive(Debug)]
pub struct LoadedSession {
    pub entry: SessionEntry,
    pub warning: Option<SessionError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub name: String,
    pub scope: SessionScope,
    pub documents: usize,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    session_dir: PathBuf,
}

impl SessionStore {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self::with_dir(Config::data_dir()?.join("sessions")))
    }

    pub fn with_dir(session_dir: PathBuf) -> Self {
        Self { session_dir }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn entry_path(&self, name: &str) -> Result<PathBuf, SessionError> {
        if name.trim().is_empty() {
            return Err(SessionError::InvalidName(name.to_string()));
        }
        Ok(self.session_dir.join(format!("{}.json", escape_name(name))))
    }

    pub async fn save(
        &self,
        entry: &SessionEntry,
        on_collision: OverwritePolicy,
    ) -> Result<(), SessionError> {
        if entry.documents.is_empty() {
            return Err(SessionError::NothingToSave);
        }
        let path = self.entry_path(&entry.name)?;

        let existing = match fs::read_to_string(&path).await {
            Ok(json) => Some(json),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(SessionError::io(&path, e)),
        };
        let created_at = match existing {
            Some(_) if on_collision == OverwritePolicy::Reject => {
                return Err(SessionError::NameCollision(entry.name.clone()));
            }
            Some(json) => match serde_json::from_str::<StoredSession>(&json) {
                Ok(previous) => Some(previous.created_at),
                Err(e) => {
                    log::warn!("Overwriting unreadable session '{}': {}", entry.name, e);
                    None
                }
            },
            None => None,
        };

        let now = Utc::now();
        let stored = StoredSession {
            version: SESSION_FORMAT_VERSION,
            name: entry.name.clone(),
            scope: entry.scope,
            created_at: created_at.unwrap_or(now),
            modified_at: now,
            documents: entry.documents.clone(),
        };
        let json = serde_json::to_string_pretty(&stored).map_err(|e| {
            SessionError::io(&path, io::Error::new(io::ErrorKind::InvalidData, e))
        })?;
        write_atomic(&path, json.as_bytes())
            .await
            .map_err(|e| SessionError::io(&path, e))?;

        log::info!(
            "Saved session '{}' ({} documents)",
            entry.name,
            entry.documents.len()
        );
        Ok(())
    }

    /// Loads `name`, keeping only documents that can still be opened.
    pub async fn load(&self, name: &str) -> Result<LoadedSession, SessionError> {
        let stored = self.read_stored(name).await?;

        let mut documents = Vec::with_capacity(stored.documents.len());
        let mut missing = Vec::new();
        for document in stored.documents {
            if is_restorable(&document.path).await {
                documents.push(document);
            } else {
                missing.push(document.path);
            }
        }

        if documents.is_empty() {
            log::warn!("Session '{}' has no restorable documents", name);
            return Err(SessionError::NoneRestorable {
                name: name.to_string(),
                missing,
            });
        }

        let warning = if missing.is_empty() {
            None
        } else {
            log::warn!(
                "Session '{}': {} document(s) missing, restoring the rest",
                name,
                missing.len()
            );
            Some(SessionError::PartialRestore { missing })
        };

        Ok(LoadedSession {
            entry: SessionEntry {
                name: stored.name,
                scope: stored.scope,
                documents,
            },
            warning,
        })
    }

    /// Names of all readable sessions, alphabetically.
    pub async fn list(&self) -> Vec<String> {
        self.summaries()
            .await
            .into_iter()
            .map(|summary| summary.name)
            .collect()
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        let mut dir_entries = match fs::read_dir(&self.session_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!(
                        "Session directory {} is unreadable: {}",
                        self.session_dir.display(),
                        e
                    );
                }
                return summaries;
            }
        };

        loop {
            let entry = match dir_entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Stopped listing sessions early: {}", e);
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let parsed = match fs::read_to_string(&path).await {
                Ok(json) => serde_json::from_str::<StoredSession>(&json).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match parsed {
                Ok(stored) => summaries.push(SessionSummary {
                    name: stored.name,
                    scope: stored.scope,
                    documents: stored.documents.len(),
                    modified_at: stored.modified_at,
                }),
                Err(e) => log::warn!("Skipping session file {}: {}", path.display(), e),
            }
        }

        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Removes each named session. Unknown names are ignored; returns how
    /// many entries were actually removed.
    pub async fn remove<'a, I>(&self, names: I) -> Result<usize, SessionError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut removed = 0;
        for name in names {
            let path = self.entry_path(name)?;
            match fs::remove_file(&path).await {
                Ok(()) => {
                    log::info!("Removed session '{}'", name);
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::debug!("Session '{}' already gone", name);
                }
                Err(e) => return Err(SessionError::io(&path, e)),
            }
        }
        Ok(removed)
    }

    pub async fn remove_all(&self) -> Result<usize, SessionError> {
        let names = self.list().await;
        self.remove(names.iter().map(String::as_str)).await
    }

    async fn read_stored(&self, name: &str) -> Result<StoredSession, SessionError> {
        let path = self.entry_path(name)?;
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(name.to_string()))
            }
            Err(e) => return Err(SessionError::io(&path, e)),
        };
        serde_json::from_str(&json).map_err(|source| {
            log::warn!("Session '{}' is corrupt: {}", name, source);
            SessionError::Corrupt {
                name: name.to_string(),
                source,
            }
        })
    }
}

pub(crate) async fn is_restorable(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => fs::File::open(path).await.is_ok(),
        _ => false,
    }
}

/// Maps a session name to a portable file stem. Long names are cut and
/// suffixed with a digest of the whole name.
fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(MAX_STEM_BYTES));
    let mut truncated = false;
    for byte in name.bytes() {
        let literal = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_')
            || (byte == b'.' && !out.is_empty());
        let width = if literal { 1 } else { 3 };
        if out.len() + width > MAX_STEM_BYTES {
            truncated = true;
            break;
        }
        if literal {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    if truncated {
        out.push('-');
        for byte in &Sha256::digest(name.as_bytes())[..8] {
            out.push_str(&format!("{:02x}", byte));
        }
    }
    out
}
