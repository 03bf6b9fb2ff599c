//! In-memory descriptor of one open tab: its file, encoding, buffer and view
//! state. A record is owned by exactly one window and never shared.

use ropey::Rope;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use textcore::{Decoded, Encoding};

use crate::watcher::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub u64);

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

/// Window-level defaults a new document starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewDefaults {
    pub highlighting: bool,
    pub wrap: bool,
    pub auto_indent: bool,
}

impl Default for ViewDefaults {
    fn default() -> Self {
        Self {
            highlighting: true,
            wrap: true,
            auto_indent: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentRecord {
    id: DocumentId,
    path: Option<PathBuf>,
    pub encoding: Encoding,
    content: Rope,
    saved_digest: [u8; 32],
    /// Byte length at the last save or load.
    saved_len: usize,
    dirty: bool,
    last_known: Option<Fingerprint>,
    readonly: bool,
    cursor_position: usize,
    pub scroll_offset: usize,
    pub highlighting_enabled: bool,
    pub wrap_enabled: bool,
    pub auto_indent_enabled: bool,
}

impl DocumentRecord {
    /// A fresh, pathless tab. Its empty content counts as "last loaded".
    pub fn untitled(id: DocumentId, encoding: Encoding, defaults: ViewDefaults) -> Self {
        let content = Rope::new();
        Self {
            id,
            path: None,
            encoding,
            saved_digest: digest_rope(&content),
            saved_len: 0,
            content,
            dirty: false,
            last_known: None,
            readonly: false,
            cursor_position: 0,
            scroll_offset: 0,
            highlighting_enabled: defaults.highlighting,
            wrap_enabled: defaults.wrap,
            auto_indent_enabled: defaults.auto_indent,
        }
    }

    pub fn from_disk(
        id: DocumentId,
        path: PathBuf,
        decoded: Decoded,
        fingerprint: Fingerprint,
        readonly: bool,
        defaults: ViewDefaults,
    ) -> Self {
        let mut record = Self::untitled(id, decoded.encoding, defaults);
        record.content = Rope::from_str(&decoded.text);
        record.snapshot_saved();
        record.path = Some(path);
        record.last_known = Some(fingerprint);
        record.readonly = readonly;
        record
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    pub fn last_known(&self) -> Option<&Fingerprint> {
        self.last_known.as_ref()
    }

    pub fn last_known_mtime(&self) -> Option<SystemTime> {
        self.last_known.as_ref().map(|f| f.mtime)
    }

    pub fn content(&self) -> String {
        self.content.to_string()
    }

    pub fn len_chars(&self) -> usize {
        self.content.len_chars()
    }

    pub fn cursor_position(&self) -> usize {
        self.cursor_position
    }

    pub fn set_cursor_position(&mut self, position: usize) {
        self.cursor_position = position.min(self.content.len_chars());
    }

    /// Inserts at a char index (clamped to the end of the buffer).
    pub fn insert(&mut self, char_idx: usize, text: &str) {
        let at = char_idx.min(self.content.len_chars());
        self.content.insert(at, text);
        self.cursor_position = at + text.chars().count();
        self.refresh_dirty();
    }

    /// Removes a char range (clamped to the buffer).
    pub fn remove(&mut self, range: Range<usize>) {
        let len = self.content.len_chars();
        let start = range.start.min(len);
        let end = range.end.clamp(start, len);
        if start == end {
            return;
        }
        self.content.remove(start..end);
        if self.cursor_position > start {
            self.cursor_position = start.max(self.cursor_position.saturating_sub(end - start));
        }
        self.refresh_dirty();
    }

    /// Swaps the whole buffer in one step.
    pub fn replace_content(&mut self, text: &str) {
        self.content = Rope::from_str(text);
        self.cursor_position = self.cursor_position.min(self.content.len_chars());
        self.refresh_dirty();
    }

    /// Records a successful write of the current buffer to `path`.
    pub fn mark_saved(&mut self, path: PathBuf, encoding: Encoding, fingerprint: Fingerprint) {
        self.path = Some(path);
        self.encoding = encoding;
        self.last_known = Some(fingerprint);
        self.readonly = false;
        self.snapshot_saved();
    }

    /// Replaces the buffer with freshly loaded disk content.
    pub fn reload(&mut self, decoded: Decoded, fingerprint: Fingerprint, readonly: bool) {
        self.content = Rope::from_str(&decoded.text);
        self.encoding = decoded.encoding;
        self.snapshot_saved();
        self.last_known = Some(fingerprint);
        self.readonly = readonly;
        self.cursor_position = self.cursor_position.min(self.content.len_chars());
    }

    /// Forces the dirty flag, used for recovered buffers whose on-disk
    /// counterpart is unknown or older.
    pub fn mark_unsaved(&mut self) {
        self.dirty = true;
    }

    fn snapshot_saved(&mut self) {
        self.saved_digest = digest_rope(&self.content);
        self.saved_len = self.content.len_bytes();
        self.dirty = false;
    }

    /// Hashes only when the buffer was edited and kept its saved length, so
    /// ordinary typing never rehashes the whole rope.
    fn refresh_dirty(&mut self) {
        self.dirty = if self.content.len_bytes() != self.saved_len {
            true
        } else {
            digest_rope(&self.content) != self.saved_digest
        };
    }
}

fn digest_rope(rope: &Rope) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for chunk in rope.chunks() {
        hasher.update(chunk.as_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DocumentRecord {
        DocumentRecord::untitled(DocumentId(1), Encoding::Utf8, ViewDefaults::default())
    }

    #[test]
    fn test_untitled_document_starts_clean() {
        let doc = record();
        assert!(!doc.is_dirty());
        assert!(doc.path().is_none());
        assert!(doc.last_known_mtime().is_none());
        assert!(doc.highlighting_enabled);
    }

    #[test]
    fn test_dirty_tracks_content_not_edit_count() {
        let mut doc = record();
        doc.insert(0, "abc");
        assert!(doc.is_dirty());
        assert_eq!(doc.cursor_position(), 3);

        doc.remove(0..3);
        assert!(!doc.is_dirty(), "undoing back to the loaded text is clean");
    }

    #[test]
    fn test_same_length_edit_is_dirty_until_reverted() {
        let mut doc = record();
        doc.replace_content("abc");
        let fingerprint = Fingerprint::new(SystemTime::UNIX_EPOCH, 3, None);
        doc.mark_saved(PathBuf::from("/tmp/abc.txt"), Encoding::Utf8, fingerprint);

        doc.replace_content("abd");
        assert!(doc.is_dirty());
        doc.remove(2..3);
        doc.insert(2, "c");
        assert!(!doc.is_dirty());
        doc.insert(3, "\n");
        assert!(doc.is_dirty());
    }

    #[test]
    fn test_remove_and_cursor_clamp() {
        let mut doc = record();
        doc.insert(0, "hello world");
        doc.set_cursor_position(100);
        assert_eq!(doc.cursor_position(), 11);

        doc.remove(5..100);
        assert_eq!(doc.content(), "hello");
        assert_eq!(doc.cursor_position(), 5);
    }

    #[test]
    fn test_mark_saved_resets_dirty() {
        let mut doc = record();
        doc.replace_content("text");
        assert!(doc.is_dirty());

        let fingerprint = Fingerprint::new(SystemTime::UNIX_EPOCH, 4, None);
        doc.mark_saved(PathBuf::from("/tmp/x.txt"), Encoding::Utf8, fingerprint);
        assert!(!doc.is_dirty());
        assert_eq!(doc.last_known_mtime(), Some(SystemTime::UNIX_EPOCH));
        assert_eq!(doc.path(), Some(Path::new("/tmp/x.txt")));
    }
}
