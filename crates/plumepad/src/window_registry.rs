//! Process-wide directory of live windows and the paths they have open.
//!
//! Used to route "open file" requests, to scope session captures and to keep
//! at most one attached child process per tab.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::document::DocumentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "win#{}", self.0)
    }
}

/// Best-effort virtual desktop identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesktopId {
    Known(u32),
    Unknown,
}

pub trait DesktopProbe: Send + Sync {
    fn current_desktop(&self) -> DesktopId;
}

/// Reads the desktop number from `PLUMEPAD_DESKTOP_ID`, as exported by the
/// session wrapper. Anything unparsable is `Unknown`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvDesktopProbe;

impl DesktopProbe for EnvDesktopProbe {
    fn current_desktop(&self) -> DesktopId {
        std::env::var("PLUMEPAD_DESKTOP_ID")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .map(DesktopId::Known)
            .unwrap_or(DesktopId::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenRoute {
    /// The path is already open there; focus that tab.
    FocusExisting { window: WindowId },
    /// Open as a new tab of an existing window on the same desktop.
    NewTab { window: WindowId },
    NewWindow,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown window {0}")]
    UnknownWindow(WindowId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessConflict {
    #[error("a process is already running in tab {document} of {window}")]
    AlreadyRunning {
        window: WindowId,
        document: DocumentId,
    },
}

#[derive(Debug)]
struct WindowEntry {
    desktop: DesktopId,
    open_paths: HashSet<PathBuf>,
}

#[derive(Debug, Default)]
pub struct WindowRegistry {
    // Ids are handed out monotonically, so key order is registration order.
    windows: BTreeMap<WindowId, WindowEntry>,
    processes: HashMap<DocumentId, WindowId>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, window: WindowId, desktop: DesktopId) {
        log::debug!("Registered {} on {:?}", window, desktop);
        self.windows.insert(
            window,
            WindowEntry {
                desktop,
                open_paths: HashSet::new(),
            },
        );
    }

    pub fn unregister(&mut self, window: WindowId) -> Result<(), RegistryError> {
        self.windows
            .remove(&window)
            .ok_or(RegistryError::UnknownWindow(window))?;
        self.processes.retain(|_, owner| *owner != window);
        log::debug!("Unregistered {}", window);
        Ok(())
    }

    pub fn contains(&self, window: WindowId) -> bool {
        self.windows.contains_key(&window)
    }

    pub fn is_open_in(&self, window: WindowId, path: &Path) -> bool {
        self.windows
            .get(&window)
            .is_some_and(|entry| entry.open_paths.contains(path))
    }

    pub fn track_open(&mut self, window: WindowId, path: &Path) -> Result<(), RegistryError> {
        let entry = self
            .windows
            .get_mut(&window)
            .ok_or(RegistryError::UnknownWindow(window))?;
        entry.open_paths.insert(path.to_path_buf());
        Ok(())
    }

    pub fn untrack_open(&mut self, window: WindowId, path: &Path) -> Result<(), RegistryError> {
        let entry = self
            .windows
            .get_mut(&window)
            .ok_or(RegistryError::UnknownWindow(window))?;
        entry.open_paths.remove(path);
        Ok(())
    }

    /// The earliest-registered window on the hinted desktop that has `path`
    /// open. An unknown desktop never matches.
    pub fn find_window_for(&self, path: &Path, hint: DesktopId) -> Option<WindowId> {
        if hint == DesktopId::Unknown {
            return None;
        }
        self.windows
            .iter()
            .find(|(_, entry)| entry.desktop == hint && entry.open_paths.contains(path))
            .map(|(window, _)| *window)
    }

    pub fn route_open(
        &self,
        path: &Path,
        hint: DesktopId,
        single_window_per_desktop: bool,
    ) -> OpenRoute {
        let route = if hint == DesktopId::Unknown {
            OpenRoute::NewWindow
        } else if let Some(window) = self.find_window_for(path, hint) {
            OpenRoute::FocusExisting { window }
        } else if single_window_per_desktop {
            self.windows
                .iter()
                .find(|(_, entry)| entry.desktop == hint)
                .map(|(window, _)| OpenRoute::NewTab { window: *window })
                .unwrap_or(OpenRoute::NewWindow)
        } else {
            OpenRoute::NewWindow
        };
        log::debug!("Routing {} on {:?}: {:?}", path.display(), hint, route);
        route
    }

    /// Claims the tab's process slot. A second claim is rejected, not queued.
    pub fn attach_process(
        &mut self,
        window: WindowId,
        document: DocumentId,
    ) -> Result<(), ProcessConflict> {
        if let Some(owner) = self.processes.get(&document) {
            return Err(ProcessConflict::AlreadyRunning {
                window: *owner,
                document,
            });
        }
        self.processes.insert(document, window);
        Ok(())
    }

    pub fn detach_process(&mut self, document: DocumentId) -> bool {
        self.processes.remove(&document).is_some()
    }

    pub fn has_process(&self, document: DocumentId) -> bool {
        self.processes.contains_key(&document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESK: DesktopId = DesktopId::Known(1);

    fn registry() -> WindowRegistry {
        let mut registry = WindowRegistry::new();
        registry.register(WindowId(1), DESK);
        registry.register(WindowId(2), DesktopId::Known(2));
        registry
    }

    #[test]
    fn test_already_open_path_focuses_existing_window() {
        let mut registry = registry();
        let path = Path::new("/work/notes.txt");
        registry.track_open(WindowId(1), path).unwrap();

        assert_eq!(
            registry.route_open(path, DESK, true),
            OpenRoute::FocusExisting {
                window: WindowId(1)
            }
        );
        assert_eq!(
            registry.route_open(path, DESK, false),
            OpenRoute::FocusExisting {
                window: WindowId(1)
            }
        );
    }

    #[test]
    fn test_single_window_per_desktop_opens_tab() {
        let registry = registry();
        let path = Path::new("/work/new.txt");
        assert_eq!(
            registry.route_open(path, DesktopId::Known(2), true),
            OpenRoute::NewTab {
                window: WindowId(2)
            }
        );
        assert_eq!(
            registry.route_open(path, DesktopId::Known(2), false),
            OpenRoute::NewWindow
        );
        assert_eq!(
            registry.route_open(path, DesktopId::Known(9), true),
            OpenRoute::NewWindow
        );
    }

    #[test]
    fn test_unknown_desktop_always_opens_new_window() {
        let mut registry = WindowRegistry::new();
        registry.register(WindowId(1), DesktopId::Unknown);
        let path = Path::new("/work/a.txt");
        registry.track_open(WindowId(1), path).unwrap();

        assert_eq!(registry.find_window_for(path, DesktopId::Unknown), None);
        assert_eq!(
            registry.route_open(path, DesktopId::Unknown, true),
            OpenRoute::NewWindow
        );
    }

    #[test]
    fn test_other_desktop_does_not_match() {
        let mut registry = registry();
        let path = Path::new("/work/a.txt");
        registry.track_open(WindowId(2), path).unwrap();
        assert_eq!(registry.find_window_for(path, DESK), None);
        assert_eq!(
            registry.route_open(path, DESK, true),
            OpenRoute::NewTab {
                window: WindowId(1)
            }
        );
    }

    #[test]
    fn test_remaining_copy_is_found_after_first_window_closes() {
        let mut registry = WindowRegistry::new();
        registry.register(WindowId(1), DESK);
        registry.register(WindowId(2), DESK);
        let path = Path::new("/shared.txt");
        registry.track_open(WindowId(1), path).unwrap();
        registry.track_open(WindowId(2), path).unwrap();
        assert_eq!(registry.find_window_for(path, DESK), Some(WindowId(1)));

        registry.unregister(WindowId(1)).unwrap();
        assert_eq!(registry.find_window_for(path, DESK), Some(WindowId(2)));

        registry.untrack_open(WindowId(2), path).unwrap();
        assert_eq!(registry.find_window_for(path, DESK), None);
    }

    #[test]
    fn test_copy_on_hinted_desktop_wins_over_earlier_copy_elsewhere() {
        let mut registry = WindowRegistry::new();
        registry.register(WindowId(1), DesktopId::Known(2));
        registry.register(WindowId(2), DESK);
        let path = Path::new("/work/x.txt");
        registry.track_open(WindowId(1), path).unwrap();
        registry.track_open(WindowId(2), path).unwrap();

        assert_eq!(
            registry.route_open(path, DESK, false),
            OpenRoute::FocusExisting {
                window: WindowId(2)
            }
        );
        assert_eq!(
            registry.route_open(path, DesktopId::Known(2), true),
            OpenRoute::FocusExisting {
                window: WindowId(1)
            }
        );
    }

    #[test]
    fn test_unknown_window_is_an_error() {
        let mut registry = WindowRegistry::new();
        assert_eq!(
            registry.track_open(WindowId(5), Path::new("/x")),
            Err(RegistryError::UnknownWindow(WindowId(5)))
        );
        assert!(registry.unregister(WindowId(5)).is_err());
    }

    #[test]
    fn test_one_process_per_tab() {
        let mut registry = registry();
        let doc = DocumentId(3);
        registry.attach_process(WindowId(1), doc).unwrap();
        assert_eq!(
            registry.attach_process(WindowId(1), doc),
            Err(ProcessConflict::AlreadyRunning {
                window: WindowId(1),
                document: doc
            })
        );
        assert!(registry.attach_process(WindowId(1), DocumentId(4)).is_ok());

        assert!(registry.detach_process(doc));
        assert!(registry.attach_process(WindowId(1), doc).is_ok());

        registry.unregister(WindowId(1)).unwrap();
        assert!(!registry.has_process(doc));
    }
}
