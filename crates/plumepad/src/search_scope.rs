//! Resolves which open documents a find/replace request covers and applies
//! replace-all across them one document at a time.
//!
//! Replace-all takes the document set by `&mut`, so no other edit can touch a
//! buffer while it runs. Each document is rewritten in one swap or not at all.

use std::sync::atomic::{AtomicBool, Ordering};
use textcore::SearchPattern;

use crate::document::{DocumentId, DocumentRecord};
use crate::watcher::{ChangeState, ExternalChangeWatcher};
use crate::window_registry::WindowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    CurrentDocument,
    AllTabsInWindow,
    AllTabsAllWindows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeRequest {
    pub scope: SearchScope,
    pub window: WindowId,
    pub document: DocumentId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocRef {
    pub window: WindowId,
    pub document: DocumentId,
}

/// The open documents, as seen by the coordinator.
pub trait DocumentSet {
    /// Windows in registration order.
    fn window_order(&self) -> Vec<WindowId>;
    /// Tabs of `window` in tab order.
    fn tabs(&self, window: WindowId) -> Vec<DocumentId>;
    fn document_mut(
        &mut self,
        target: DocRef,
    ) -> Option<(&mut DocumentRecord, &mut ExternalChangeWatcher)>;
}

pub fn resolve_scope<S: DocumentSet + ?Sized>(set: &S, request: &ScopeRequest) -> Vec<DocRef> {
    let in_window = |window: WindowId| {
        set.tabs(window)
            .into_iter()
            .map(move |document| DocRef { window, document })
    };
    match request.scope {
        SearchScope::CurrentDocument => in_window(request.window)
            .filter(|r| r.document == request.document)
            .collect(),
        SearchScope::AllTabsInWindow => in_window(request.window).collect(),
        SearchScope::AllTabsAllWindows => set
            .window_order()
            .into_iter()
            .flat_map(in_window)
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ReadOnly,
    ModifiedExternally,
    DeletedExternally,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceReport {
    pub updated: Vec<DocRef>,
    pub skipped: Vec<(DocRef, SkipReason)>,
    /// Documents with no match.
    pub untouched: Vec<DocRef>,
    pub replacements: usize,
    pub cancelled: bool,
}

/// Replaces every match in each target, in order. `cancel` is checked
/// between documents; `after_each` runs once per visited document.
pub fn replace_all<S, F>(
    set: &mut S,
    targets: &[DocRef],
    pattern: &SearchPattern,
    replacement: &str,
    cancel: &AtomicBool,
    mut after_each: F,
) -> ReplaceReport
where
    S: DocumentSet + ?Sized,
    F: FnMut(&DocRef),
{
    let mut report = ReplaceReport::default();
    for target in targets {
        if cancel.load(Ordering::Relaxed) {
            log::info!("Replace-all cancelled after {} document(s)", report.updated.len());
            report.cancelled = true;
            break;
        }

        match replace_in(set, *target, pattern, replacement) {
            Ok(0) => report.untouched.push(*target),
            Ok(count) => {
                report.replacements += count;
                report.updated.push(*target);
            }
            Err(reason) => {
                log::warn!("Replace-all skipped {}: {:?}", target.document, reason);
                report.skipped.push((*target, reason));
            }
        }
        after_each(target);
    }
    report
}

fn replace_in<S: DocumentSet + ?Sized>(
    set: &mut S,
    target: DocRef,
    pattern: &SearchPattern,
    replacement: &str,
) -> Result<usize, SkipReason> {
    let (record, watcher) = set.document_mut(target).ok_or(SkipReason::Closed)?;
    if record.is_readonly() {
        return Err(SkipReason::ReadOnly);
    }
    match watcher.poll() {
        ChangeState::Unchanged => {}
        ChangeState::ModifiedExternally => return Err(SkipReason::ModifiedExternally),
        ChangeState::DeletedExternally => return Err(SkipReason::DeletedExternally),
    }

    let replaced = pattern.replace_all(&record.content(), replacement);
    if replaced.count > 0 {
        record.replace_content(&replaced.text);
    }
    Ok(replaced.count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ViewDefaults;
    use crate::watcher::Fingerprint;
    use std::path::Path;
    use tempfile::TempDir;
    use textcore::{Decoded, Encoding};

    struct FakeSet {
        windows: Vec<(WindowId, Vec<(DocumentRecord, ExternalChangeWatcher)>)>,
    }

    impl DocumentSet for FakeSet {
        fn window_order(&self) -> Vec<WindowId> {
            self.windows.iter().map(|(id, _)| *id).collect()
        }

        fn tabs(&self, window: WindowId) -> Vec<DocumentId> {
            self.windows
                .iter()
                .filter(|(id, _)| *id == window)
                .flat_map(|(_, tabs)| tabs.iter().map(|(r, _)| r.id()))
                .collect()
        }

        fn document_mut(
            &mut self,
            target: DocRef,
        ) -> Option<(&mut DocumentRecord, &mut ExternalChangeWatcher)> {
            self.windows
                .iter_mut()
                .find(|(id, _)| *id == target.window)?
                .1
                .iter_mut()
                .find(|(r, _)| r.id() == target.document)
                .map(|(r, w)| (r, w))
        }
    }

    fn open(id: u64, path: &Path, text: &str) -> (DocumentRecord, ExternalChangeWatcher) {
        std::fs::write(path, text).unwrap();
        let fingerprint = Fingerprint::read(path).unwrap();
        let decoded = Decoded {
            text: text.to_string(),
            encoding: Encoding::Utf8,
            confident: true,
            lossy: false,
        };
        let record = DocumentRecord::from_disk(
            DocumentId(id),
            path.to_path_buf(),
            decoded,
            fingerprint.clone(),
            false,
            ViewDefaults::default(),
        );
        (record, ExternalChangeWatcher::armed(path.to_path_buf(), fingerprint))
    }

    fn three_docs(dir: &TempDir) -> FakeSet {
        FakeSet {
            windows: vec![
                (
                    WindowId(1),
                    vec![
                        open(1, &dir.path().join("1.txt"), "foo one"),
                        open(2, &dir.path().join("2.txt"), "foo two"),
                    ],
                ),
                (WindowId(2), vec![open(3, &dir.path().join("3.txt"), "foo foo three")]),
            ],
        }
    }

    #[test]
    fn test_resolve_scope() {
        let dir = TempDir::new().unwrap();
        let set = three_docs(&dir);
        let request = |scope| ScopeRequest {
            scope,
            window: WindowId(1),
            document: DocumentId(2),
        };

        let current = resolve_scope(&set, &request(SearchScope::CurrentDocument));
        assert_eq!(current.iter().map(|r| r.document.0).collect::<Vec<_>>(), vec![2]);

        let window = resolve_scope(&set, &request(SearchScope::AllTabsInWindow));
        assert_eq!(window.iter().map(|r| r.document.0).collect::<Vec<_>>(), vec![1, 2]);

        let all = resolve_scope(&set, &request(SearchScope::AllTabsAllWindows));
        assert_eq!(all.iter().map(|r| r.document.0).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(all[2].window, WindowId(2));
    }

    #[test]
    fn test_deleted_document_is_skipped_mid_run() {
        let dir = TempDir::new().unwrap();
        let mut set = three_docs(&dir);
        let targets = resolve_scope(
            &set,
            &ScopeRequest {
                scope: SearchScope::AllTabsAllWindows,
                window: WindowId(1),
                document: DocumentId(1),
            },
        );
        let pattern = SearchPattern::literal("foo").unwrap();
        let second = dir.path().join("2.txt");

        let report = replace_all(&mut set, &targets, &pattern, "bar", &AtomicBool::new(false), |done| {
            if done.document == DocumentId(1) {
                std::fs::remove_file(&second).unwrap();
            }
        });

        assert_eq!(report.updated.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0.document, DocumentId(2));
        assert_eq!(report.skipped[0].1, SkipReason::DeletedExternally);
        assert_eq!(report.replacements, 3);

        let contents: Vec<String> = set
            .windows
            .iter()
            .flat_map(|(_, tabs)| tabs.iter().map(|(r, _)| r.content()))
            .collect();
        assert_eq!(contents, vec!["bar one", "foo two", "bar bar three"]);
    }

    #[test]
    fn test_externally_rewritten_document_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut set = three_docs(&dir);
        std::fs::write(dir.path().join("3.txt"), "rewritten elsewhere, foo").unwrap();
        let targets = resolve_scope(
            &set,
            &ScopeRequest {
                scope: SearchScope::AllTabsInWindow,
                window: WindowId(2),
                document: DocumentId(3),
            },
        );
        let pattern = SearchPattern::literal("foo").unwrap();

        let report = replace_all(&mut set, &targets, &pattern, "bar", &AtomicBool::new(false), |_| {});

        assert_eq!(report.skipped, vec![(targets[0], SkipReason::ModifiedExternally)]);
        assert!(report.updated.is_empty());
        assert_eq!(report.replacements, 0);
        let record = &set.windows[1].1[0].0;
        assert_eq!(record.content(), "foo foo three");
        assert!(!record.is_dirty());
    }

    #[test]
    fn test_readonly_and_cancel() {
        let dir = TempDir::new().unwrap();
        let mut set = three_docs(&dir);
        set.windows[0].1[0].0.set_readonly(true);
        let targets = resolve_scope(
            &set,
            &ScopeRequest {
                scope: SearchScope::AllTabsAllWindows,
                window: WindowId(1),
                document: DocumentId(1),
            },
        );
        let pattern = SearchPattern::literal("foo").unwrap();
        let cancel = AtomicBool::new(false);

        let report = replace_all(&mut set, &targets, &pattern, "x", &cancel, |done| {
            if done.document == DocumentId(2) {
                cancel.store(true, Ordering::Relaxed);
            }
        });

        assert!(report.cancelled);
        assert_eq!(report.skipped, vec![(targets[0], SkipReason::ReadOnly)]);
        assert_eq!(report.updated, vec![targets[1]]);
        assert_eq!(set.windows[1].1[0].0.content(), "foo foo three");
    }

    #[test]
    fn test_no_match_leaves_document_clean() {
        let dir = TempDir::new().unwrap();
        let mut set = three_docs(&dir);
        let targets = vec![DocRef {
            window: WindowId(1),
            document: DocumentId(1),
        }];
        let pattern = SearchPattern::literal("absent").unwrap();
        let report = replace_all(&mut set, &targets, &pattern, "x", &AtomicBool::new(false), |_| {});
        assert_eq!(report.untouched, targets);
        assert!(!set.windows[0].1[0].0.is_dirty());
    }
}
