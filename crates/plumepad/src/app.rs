use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use textcore::{Encoding, MatchOptions, PatternError, SearchPattern};
use thiserror::Error;

use crate::autosave::{self, Autosaver, RecoverySnapshot};
use crate::config::Config;
use crate::crash_guard::{CrashGuard, CrashReport};
use crate::document::{DocumentId, DocumentRecord};
use crate::file_manager::{FileManager, LoadError, LoadedFile, SaveError, SaveReceipt};
use crate::history::RecentHistory;
use crate::script_runner::{ScriptError, ScriptExit, ScriptRunner};
use crate::search_scope::{self, DocRef, DocumentSet, ReplaceReport, ScopeRequest, SkipReason};
use crate::session_manager::{
    OverwritePolicy, SessionDocument, SessionEntry, SessionError, SessionScope, SessionStore,
};
use crate::status_manager::{MessageType, StatusManager, StatusMessage};
use crate::watcher::{BackgroundPoller, ChangeState, ExternalChangeWatcher, WatchTarget};
use crate::window_registry::{
    DesktopId, DesktopProbe, EnvDesktopProbe, OpenRoute, RegistryError, WindowId, WindowRegistry,
};

const WATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WorkbenchError {
    #[error("unknown window {0}")]
    UnknownWindow(WindowId),
    #[error("unknown document {0}")]
    UnknownDocument(DocumentId),
    #[error("{} document(s) have unsaved changes", .0.len())]
    UnsavedChanges(Vec<DocumentId>),
    #[error("{0} is read-only")]
    ReadOnly(DocumentId),
    #[error("{} is already open in this window", .0.display())]
    DuplicatePath(PathBuf),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One tab: the document plus what the watcher last said about it.
#[derive(Debug)]
pub struct Tab {
    pub record: DocumentRecord,
    pub watcher: ExternalChangeWatcher,
    pub external: ChangeState,
    deletion_flagged: bool,
}

impl Tab {
    fn new(record: DocumentRecord) -> Self {
        let watcher = match (record.path(), record.last_known()) {
            (Some(path), Some(fingerprint)) => {
                ExternalChangeWatcher::armed(path.to_path_buf(), fingerprint.clone())
            }
            _ => ExternalChangeWatcher::new(),
        };
        Self {
            record,
            watcher,
            external: ChangeState::Unchanged,
            deletion_flagged: false,
        }
    }

    fn is_placeholder(&self) -> bool {
        self.record.path().is_none() && !self.record.is_dirty() && self.record.len_chars() == 0
    }
}

#[derive(Debug)]
pub struct EditorWindow {
    id: WindowId,
    desktop: DesktopId,
    tabs: Vec<Tab>,
    current: usize,
}

impl EditorWindow {
    fn new(id: WindowId, desktop: DesktopId) -> Self {
        Self {
            id,
            desktop,
            tabs: Vec::new(),
            current: 0,
        }
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn desktop(&self) -> DesktopId {
        self.desktop
    }

    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn current_tab(&self) -> Option<&Tab> {
        self.tabs.get(self.current)
    }

    pub fn tab(&self, document: DocumentId) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.record.id() == document)
    }

    fn tab_mut(&mut self, document: DocumentId) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| t.record.id() == document)
    }

    pub fn find_by_path(&self, path: &Path) -> Option<DocumentId> {
        self.tabs
            .iter()
            .find(|t| t.record.path() == Some(path))
            .map(|t| t.record.id())
    }

    fn switch_to(&mut self, document: DocumentId) {
        if let Some(index) = self.tabs.iter().position(|t| t.record.id() == document) {
            self.current = index;
        }
    }

    pub fn unsaved_documents(&self) -> Vec<DocumentId> {
        self.tabs
            .iter()
            .filter(|t| t.record.is_dirty())
            .map(|t| t.record.id())
            .collect()
    }

    fn push_tab(&mut self, tab: Tab) {
        if self.tabs.len() == 1 && self.tabs[0].is_placeholder() {
            self.tabs.clear();
        }
        self.tabs.push(tab);
        self.current = self.tabs.len() - 1;
    }

    fn remove_tab(&mut self, document: DocumentId) -> Option<Tab> {
        let index = self.tabs.iter().position(|t| t.record.id() == document)?;
        let tab = self.tabs.remove(index);
        if self.current >= self.tabs.len() {
            self.current = self.tabs.len().saturating_sub(1);
        }
        Some(tab)
    }
}

impl DocumentSet for BTreeMap<WindowId, EditorWindow> {
    fn window_order(&self) -> Vec<WindowId> {
        self.keys().copied().collect()
    }

    fn tabs(&self, window: WindowId) -> Vec<DocumentId> {
        self.get(&window)
            .map(|w| w.tabs.iter().map(|t| t.record.id()).collect())
            .unwrap_or_default()
    }

    fn document_mut(
        &mut self,
        target: DocRef,
    ) -> Option<(&mut DocumentRecord, &mut ExternalChangeWatcher)> {
        let tab = self.get_mut(&target.window)?.tab_mut(target.document)?;
        Some((&mut tab.record, &mut tab.watcher))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened {
        window: WindowId,
        document: DocumentId,
    },
    /// Already open; its tab was focused instead.
    Focused {
        window: WindowId,
        document: DocumentId,
    },
}

impl OpenOutcome {
    pub fn window(&self) -> WindowId {
        match self {
            OpenOutcome::Opened { window, .. } | OpenOutcome::Focused { window, .. } => *window,
        }
    }

    pub fn document(&self) -> DocumentId {
        match self {
            OpenOutcome::Opened { document, .. } | OpenOutcome::Focused { document, .. } => {
                *document
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Edit {
    Insert { at: usize, text: String },
    Remove { range: Range<usize> },
}

#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    /// Save under a new name.
    pub path: Option<PathBuf>,
    /// Convert on save; the document's own encoding otherwise.
    pub encoding: Option<Encoding>,
    /// The user confirmed writing over an external modification.
    pub overwrite_external: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalChange {
    pub window: WindowId,
    pub document: DocumentId,
    pub state: ChangeState,
}

#[derive(Debug, Default)]
pub struct LaunchReport {
    pub crash: CrashReport,
    pub opened: Vec<OpenOutcome>,
    pub failed: Vec<(PathBuf, String)>,
    /// Files of the last run that were reopened or had vanished.
    pub restored: RestoreReport,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub opened: Vec<DocRef>,
    pub missing: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub external: Vec<ExternalChange>,
    pub script_exits: Vec<ScriptExit>,
    pub autosaved: usize,
}

/// Process-scoped owner of every window, tab and persistent store.
pub struct Workbench {
    config: Config,
    files: FileManager,
    registry: WindowRegistry,
    crash_guard: CrashGuard,
    crash_report: Option<CrashReport>,
    sessions: SessionStore,
    history: RecentHistory,
    scripts: ScriptRunner,
    status: StatusManager,
    poller: BackgroundPoller,
    last_watch: Instant,
    autosave: Option<Autosaver>,
    desktop: Box<dyn DesktopProbe>,
    windows: BTreeMap<WindowId, EditorWindow>,
    next_window: u64,
    next_document: u64,
}

impl Workbench {
    /// Builds a workbench from the user's config and data directory.
    pub async fn from_environment() -> anyhow::Result<Self> {
        let config = Config::load().await?;
        let data_dir = Config::data_dir()?;
        let crash_guard = CrashGuard::new(&data_dir);
        Ok(Self::with_parts(config, &data_dir, crash_guard, Box::new(EnvDesktopProbe)).await)
    }

    /// Must be called from within a tokio runtime.
    pub async fn with_parts(
        config: Config,
        data_dir: &Path,
        crash_guard: CrashGuard,
        desktop: Box<dyn DesktopProbe>,
    ) -> Self {
        let history = RecentHistory::load(&data_dir.join("history.json")).await;
        Self {
            files: FileManager::from_config(&config),
            registry: WindowRegistry::new(),
            crash_report: None,
            sessions: SessionStore::with_dir(data_dir.join("sessions")),
            history,
            scripts: ScriptRunner::from_config(&config),
            status: StatusManager::new(),
            poller: BackgroundPoller::spawn(),
            last_watch: Instant::now(),
            autosave: None,
            desktop,
            windows: BTreeMap::new(),
            next_window: 1,
            next_document: 1,
            crash_guard,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut StatusManager {
        &mut self.status
    }

    pub fn registry(&self) -> &WindowRegistry {
        &self.registry
    }

    pub fn history(&self) -> &RecentHistory {
        &self.history
    }

    pub fn crash_report(&self) -> Option<&CrashReport> {
        self.crash_report.as_ref()
    }

    pub fn windows(&self) -> impl Iterator<Item = &EditorWindow> {
        self.windows.values()
    }

    pub fn window(&self, window: WindowId) -> Option<&EditorWindow> {
        self.windows.get(&window)
    }

    pub fn document(&self, window: WindowId, document: DocumentId) -> Option<&DocumentRecord> {
        self.windows.get(&window)?.tab(document).map(|t| &t.record)
    }

    pub fn unsaved_documents(&self) -> Vec<DocumentId> {
        self.windows
            .values()
            .flat_map(|w| w.unsaved_documents())
            .collect()
    }

    /// Startup: crash inspection, optional last-files restore, then the
    /// requested paths. Always leaves at least one window open.
    pub async fn launch(&mut self, paths: &[PathBuf]) -> LaunchReport {
        let mut report = LaunchReport {
            crash: self.crash_guard.inspect(),
            ..LaunchReport::default()
        };
        if report.crash.prior_crash_detected() {
            let message = if report.crash.has_recovery() {
                format!(
                    "The previous session ended unexpectedly; {} unsaved buffer(s) can be recovered",
                    report.crash.recovery_files.len()
                )
            } else {
                "The previous session ended unexpectedly".to_string()
            };
            self.status
                .push(StatusMessage::permanent(message, MessageType::Warning));
            self.crash_guard.acknowledge(&report.crash);
        }
        self.crash_report = Some(report.crash.clone());

        if self.config.session.restore_last_files {
            let (last, gone) = self.history.restorable_last_files().await;
            let mut restored = self.restore_documents(last).await;
            for path in gone {
                if !restored.missing.contains(&path) {
                    restored.missing.push(path);
                }
            }
            if !restored.opened.is_empty() {
                log::info!("Restored {} file(s) from the last run", restored.opened.len());
            }
            if !restored.missing.is_empty() {
                self.status.warning(format!(
                    "{} file(s) from the last run could not be reopened",
                    restored.missing.len()
                ));
            }
            report.restored = restored;
        }

        for path in paths {
            match self.open_path(path, None).await {
                Ok(outcome) => report.opened.push(outcome),
                Err(e) => {
                    self.status.error(format!("{}: {}", path.display(), e));
                    report.failed.push((path.clone(), e.to_string()));
                }
            }
        }

        if self.windows.is_empty() {
            self.open_window();
        }
        report
    }

    /// Opens an empty window on the current desktop.
    pub fn open_window(&mut self) -> WindowId {
        let desktop = self.desktop.current_desktop();
        self.open_window_on(desktop)
    }

    fn open_window_on(&mut self, desktop: DesktopId) -> WindowId {
        let id = WindowId(self.next_window);
        self.next_window += 1;
        self.registry.register(id, desktop);
        if let Err(e) = self.crash_guard.window_opened() {
            self.status
                .warning(format!("Crash protection is unavailable: {}", e));
        }
        if self.config.text.auto_save && self.autosave.is_none() {
            self.autosave = Some(Autosaver::spawn(
                self.crash_guard.recovery_dir(),
                self.config.autosave_interval(),
            ));
        }

        let mut window = EditorWindow::new(id, desktop);
        let record = DocumentRecord::untitled(
            self.allocate_document(),
            self.files.resolver().default_encoding(),
            self.config.view_defaults(),
        );
        window.push_tab(Tab::new(record));
        self.windows.insert(id, window);
        log::debug!("Opened {} on {:?}", id, desktop);
        id
    }

    pub async fn close_window(
        &mut self,
        window: WindowId,
        force: bool,
    ) -> Result<(), WorkbenchError> {
        let target = self
            .windows
            .get(&window)
            .ok_or(WorkbenchError::UnknownWindow(window))?;
        let unsaved = target.unsaved_documents();
        if !force && !unsaved.is_empty() {
            return Err(WorkbenchError::UnsavedChanges(unsaved));
        }

        let last = self.windows.len() == 1;
        if last && self.config.session.restore_last_files {
            let documents = self.capture_documents(None);
            self.history.set_last_files(documents);
        }
        self.close_window_inner(window).await;
        if last {
            if let Err(e) = self.history.save().await {
                log::warn!("Failed to save history: {}", e);
            }
        }
        Ok(())
    }

    async fn close_window_inner(&mut self, window: WindowId) {
        let Some(closed) = self.windows.remove(&window) else {
            return;
        };
        for tab in &closed.tabs {
            self.forget_tab(tab);
        }
        self.scripts.terminate_window(&mut self.registry, window);
        if let Err(e) = self.registry.unregister(window) {
            log::warn!("{}", e);
        }
        if self.windows.is_empty() {
            // The recovery directory goes away with the last window.
            if let Some(autosave) = self.autosave.take() {
                autosave.stop().await;
            }
        }
        if let Err(e) = self.crash_guard.window_closed() {
            log::warn!("Failed to clear crash marker: {}", e);
        }
        log::debug!("Closed {}", window);
    }

    fn forget_tab(&mut self, tab: &Tab) {
        if let Some(path) = tab.record.path() {
            if self.config.session.remember_cursor_positions {
                self.history
                    .remember_cursor(path, tab.record.cursor_position());
            }
        }
        if let Some(autosave) = self.autosave.as_ref() {
            autosave.discard(tab.record.id());
        }
    }

    pub fn new_document(&mut self, window: WindowId) -> Result<DocumentId, WorkbenchError> {
        if !self.windows.contains_key(&window) {
            return Err(WorkbenchError::UnknownWindow(window));
        }
        let id = self.allocate_document();
        let record = DocumentRecord::untitled(
            id,
            self.files.resolver().default_encoding(),
            self.config.view_defaults(),
        );
        if let Some(target) = self.windows.get_mut(&window) {
            target.tabs.push(Tab::new(record));
            target.current = target.tabs.len() - 1;
        }
        Ok(id)
    }

    /// Opens `path` wherever the routing policy says: an existing tab, a new
    /// tab of a window on this desktop, or a new window.
    pub async fn open_path(
        &mut self,
        path: &Path,
        encoding: Option<Encoding>,
    ) -> Result<OpenOutcome, WorkbenchError> {
        let path = normalize(path).await;
        let hint = self.desktop.current_desktop();
        let route =
            self.registry
                .route_open(&path, hint, self.config.single_window_per_desktop());

        match route {
            OpenRoute::FocusExisting { window } => {
                if let Some(outcome) = self.focus_existing(window, &path) {
                    return Ok(outcome);
                }
                let loaded = self.files.load(&path, encoding).await?;
                self.insert_loaded(window, path, loaded)
            }
            OpenRoute::NewTab { window } => {
                let loaded = self.files.load(&path, encoding).await?;
                self.insert_loaded(window, path, loaded)
            }
            OpenRoute::NewWindow => {
                let loaded = self.files.load(&path, encoding).await?;
                let window = self.open_window_on(hint);
                self.insert_loaded(window, path, loaded)
            }
        }
    }

    fn focus_existing(&mut self, window: WindowId, path: &Path) -> Option<OpenOutcome> {
        let target = self.windows.get_mut(&window)?;
        let document = target.find_by_path(path)?;
        target.switch_to(document);
        log::debug!("{} is already open in {}", path.display(), window);
        Some(OpenOutcome::Focused { window, document })
    }

    fn insert_loaded(
        &mut self,
        window: WindowId,
        path: PathBuf,
        loaded: LoadedFile,
    ) -> Result<OpenOutcome, WorkbenchError> {
        if let Some(outcome) = self.focus_existing(window, &path) {
            return Ok(outcome);
        }
        if !self.windows.contains_key(&window) {
            return Err(WorkbenchError::UnknownWindow(window));
        }

        let document = self.allocate_document();
        let lossy = loaded.decoded.lossy;
        let mut record = DocumentRecord::from_disk(
            document,
            path.clone(),
            loaded.decoded,
            loaded.fingerprint,
            loaded.readonly,
            self.config.view_defaults(),
        );
        if loaded.size > self.config.max_highlight_bytes() {
            record.highlighting_enabled = false;
            self.status.info(format!(
                "Highlighting is off for {}: file is larger than {} MiB",
                path.display(),
                self.config.text.max_highlight_size_mb
            ));
        }
        if lossy {
            self.status.push(
                StatusMessage::new(
                    format!("{} contains bytes invalid in {}", path.display(), record.encoding),
                    MessageType::Warning,
                )
                .for_document(document),
            );
        }
        if self.config.session.remember_cursor_positions {
            if let Some(position) = self.history.cursor_position(&path) {
                record.set_cursor_position(position);
            }
        }

        self.registry.track_open(window, &path)?;
        self.history
            .add_recent(&path, self.config.text.recent_files_number);
        if let Some(target) = self.windows.get_mut(&window) {
            target.push_tab(Tab::new(record));
        }
        log::info!("Opened {} as {} in {}", path.display(), document, window);
        Ok(OpenOutcome::Opened { window, document })
    }

    pub fn edit(
        &mut self,
        window: WindowId,
        document: DocumentId,
        edit: Edit,
    ) -> Result<(), WorkbenchError> {
        let tab = tab_mut(&mut self.windows, window, document)?;
        if tab.record.is_readonly() {
            return Err(WorkbenchError::ReadOnly(document));
        }
        match edit {
            Edit::Insert { at, text } => tab.record.insert(at, &text),
            Edit::Remove { range } => tab.record.remove(range),
        }
        Ok(())
    }

    pub fn set_cursor(
        &mut self,
        window: WindowId,
        document: DocumentId,
        position: usize,
    ) -> Result<(), WorkbenchError> {
        tab_mut(&mut self.windows, window, document)?
            .record
            .set_cursor_position(position);
        Ok(())
    }

    /// Validates the encoding, applies save transforms, writes and re-arms the
    /// watcher.
    ///
    /// An external modification blocks the save until the caller confirms
    /// with `overwrite_external`. A deleted file is recreated, with a one-time
    /// warning.
    pub async fn save_document(
        &mut self,
        window: WindowId,
        document: DocumentId,
        request: SaveRequest,
    ) -> Result<SaveReceipt, WorkbenchError> {
        let requested = match request.path.as_deref() {
            Some(path) => Some(normalize(path).await),
            None => None,
        };
        let target_window = self
            .windows
            .get_mut(&window)
            .ok_or(WorkbenchError::UnknownWindow(window))?;
        if let Some(requested) = requested.as_deref() {
            if target_window
                .find_by_path(requested)
                .is_some_and(|other| other != document)
            {
                return Err(WorkbenchError::DuplicatePath(requested.to_path_buf()));
            }
        }
        let tab = target_window
            .tab_mut(document)
            .ok_or(WorkbenchError::UnknownDocument(document))?;

        let old_path = tab.record.path().map(Path::to_path_buf);
        let target = requested
            .or_else(|| old_path.clone())
            .ok_or(SaveError::NoPath)?;

        if old_path.as_deref() == Some(target.as_path()) {
            let state = tab.watcher.poll();
            match state {
                ChangeState::ModifiedExternally if !request.overwrite_external => {
                    tab.external = state;
                    return Err(SaveError::ExternallyModified(target).into());
                }
                ChangeState::DeletedExternally if !tab.deletion_flagged => {
                    tab.deletion_flagged = true;
                    self.status.push(
                        StatusMessage::new(
                            format!("{} was deleted; saving recreates it", target.display()),
                            MessageType::Warning,
                        )
                        .for_document(document),
                    );
                }
                _ => {}
            }
        }

        let encoding = match request.encoding.unwrap_or(tab.record.encoding) {
            Encoding::Auto => self.files.resolver().default_encoding(),
            encoding => encoding,
        };
        let receipt = self.files.save(&mut tab.record, &target, encoding).await?;

        if let Some(fingerprint) = tab.record.last_known() {
            tab.watcher.arm(target.clone(), fingerprint.clone());
        }
        tab.external = ChangeState::Unchanged;
        tab.deletion_flagged = false;

        if old_path.as_deref() != Some(target.as_path()) {
            if let Some(old) = old_path.as_deref() {
                self.registry.untrack_open(window, old)?;
            }
            self.registry.track_open(window, &target)?;
        }
        self.history
            .add_recent(&target, self.config.text.recent_files_number);
        if let Some(autosave) = self.autosave.as_ref() {
            autosave.discard(document);
        }
        self.status.success(format!("Saved {}", target.display()));
        Ok(receipt)
    }

    /// Re-reads the document from disk, optionally in another encoding.
    pub async fn reload_document(
        &mut self,
        window: WindowId,
        document: DocumentId,
        encoding: Option<Encoding>,
        discard_changes: bool,
    ) -> Result<(), WorkbenchError> {
        let tab = tab_mut(&mut self.windows, window, document)?;
        if tab.record.is_dirty() && !discard_changes {
            return Err(WorkbenchError::UnsavedChanges(vec![document]));
        }
        let path = tab
            .record
            .path()
            .map(Path::to_path_buf)
            .ok_or(SaveError::NoPath)?;

        let loaded = self.files.load(&path, encoding).await?;
        tab.record
            .reload(loaded.decoded, loaded.fingerprint.clone(), loaded.readonly);
        tab.watcher.arm(path.clone(), loaded.fingerprint);
        tab.external = ChangeState::Unchanged;
        tab.deletion_flagged = false;
        log::info!("Reloaded {}", path.display());
        Ok(())
    }

    pub fn close_document(
        &mut self,
        window: WindowId,
        document: DocumentId,
        force: bool,
    ) -> Result<(), WorkbenchError> {
        let tab = tab_mut(&mut self.windows, window, document)?;
        if tab.record.is_dirty() && !force {
            return Err(WorkbenchError::UnsavedChanges(vec![document]));
        }
        let Some(tab) = self
            .windows
            .get_mut(&window)
            .and_then(|w| w.remove_tab(document))
        else {
            return Err(WorkbenchError::UnknownDocument(document));
        };
        if let Some(path) = tab.record.path() {
            self.registry.untrack_open(window, path)?;
        }
        self.scripts.terminate(document);
        self.registry.detach_process(document);
        self.forget_tab(&tab);
        Ok(())
    }

    /// Polls every watcher on the calling thread.
    pub fn poll_external_changes(&mut self) -> Vec<ExternalChange> {
        let mut changes = Vec::new();
        for (window, target) in self.windows.iter_mut() {
            for tab in target.tabs.iter_mut() {
                let state = tab.watcher.poll();
                if let Some(change) = note_change(&mut self.status, *window, tab, state) {
                    changes.push(change);
                }
            }
        }
        changes
    }

    pub async fn save_session(
        &mut self,
        name: &str,
        scope: SessionScope,
        window: WindowId,
        on_collision: OverwritePolicy,
    ) -> Result<usize, WorkbenchError> {
        let only = match scope {
            SessionScope::Window => {
                if !self.windows.contains_key(&window) {
                    return Err(WorkbenchError::UnknownWindow(window));
                }
                Some(window)
            }
            SessionScope::AllWindows => None,
        };
        let entry = SessionEntry {
            name: name.to_string(),
            scope,
            documents: self.capture_documents(only),
        };
        self.sessions.save(&entry, on_collision).await?;
        self.status.success(format!("Session '{}' saved", name));
        Ok(entry.documents.len())
    }

    /// Restores `name` into new windows, one per captured window.
    pub async fn restore_session(&mut self, name: &str) -> Result<RestoreReport, WorkbenchError> {
        let loaded = self.sessions.load(name).await?;
        let mut report = self.restore_documents(loaded.entry.documents).await;
        if let Some(SessionError::PartialRestore { missing }) = loaded.warning {
            for path in missing {
                if !report.missing.contains(&path) {
                    report.missing.push(path);
                }
            }
        }
        if !report.missing.is_empty() {
            self.status.warning(format!(
                "Session '{}': {} file(s) could not be restored",
                name,
                report.missing.len()
            ));
        }
        Ok(report)
    }

    async fn restore_documents(&mut self, documents: Vec<SessionDocument>) -> RestoreReport {
        let mut report = RestoreReport::default();
        let hint = self.desktop.current_desktop();
        let mut targets: BTreeMap<usize, WindowId> = BTreeMap::new();

        for document in documents {
            let encoding = (document.encoding != Encoding::Auto).then_some(document.encoding);
            let path = normalize(&document.path).await;
            if let Some(window) = self.registry.find_window_for(&path, hint) {
                if let Some(outcome) = self.focus_existing(window, &path) {
                    if let Ok(tab) = tab_mut(&mut self.windows, window, outcome.document()) {
                        tab.record.set_cursor_position(document.cursor_position);
                    }
                    report.opened.push(DocRef {
                        window,
                        document: outcome.document(),
                    });
                    continue;
                }
            }
            let loaded = match self.files.load(&path, encoding).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    log::warn!("Skipping {} during restore: {}", path.display(), e);
                    report.missing.push(path);
                    continue;
                }
            };
            let window = match targets.get(&document.window) {
                Some(window) => *window,
                None => {
                    let window = self.open_window_on(hint);
                    targets.insert(document.window, window);
                    window
                }
            };
            match self.insert_loaded(window, path.clone(), loaded) {
                Ok(outcome) => {
                    if let Ok(tab) = tab_mut(&mut self.windows, window, outcome.document()) {
                        tab.record.set_cursor_position(document.cursor_position);
                    }
                    report.opened.push(DocRef {
                        window,
                        document: outcome.document(),
                    });
                }
                Err(e) => {
                    log::warn!("Skipping {} during restore: {}", path.display(), e);
                    report.missing.push(path);
                }
            }
        }
        report
    }

    pub async fn remove_sessions(&mut self, names: &[String]) -> Result<usize, WorkbenchError> {
        Ok(self.sessions.remove(names.iter().map(String::as_str)).await?)
    }

    pub async fn remove_all_sessions(&mut self) -> Result<usize, WorkbenchError> {
        Ok(self.sessions.remove_all().await?)
    }

    pub async fn list_sessions(&self) -> Vec<String> {
        self.sessions.list().await
    }

    pub fn replace_all(
        &mut self,
        request: ScopeRequest,
        needle: &str,
        options: MatchOptions,
        replacement: &str,
        cancel: &AtomicBool,
    ) -> Result<ReplaceReport, WorkbenchError> {
        let pattern = SearchPattern::new(needle, options)?;
        let targets = search_scope::resolve_scope(&self.windows, &request);
        let report = search_scope::replace_all(
            &mut self.windows,
            &targets,
            &pattern,
            replacement,
            cancel,
            |_| {},
        );

        for (target, reason) in &report.skipped {
            let state = match reason {
                SkipReason::ModifiedExternally => ChangeState::ModifiedExternally,
                SkipReason::DeletedExternally => ChangeState::DeletedExternally,
                _ => continue,
            };
            if let Ok(tab) = tab_mut(&mut self.windows, target.window, target.document) {
                note_change(&mut self.status, target.window, tab, state);
            }
        }
        if !report.skipped.is_empty() {
            self.status.warning(format!(
                "Replaced in {} document(s), skipped {}",
                report.updated.len(),
                report.skipped.len()
            ));
        }
        Ok(report)
    }

    /// Runs the saved document as a child process of its tab.
    pub fn run_script(
        &mut self,
        window: WindowId,
        document: DocumentId,
    ) -> Result<Option<u32>, WorkbenchError> {
        let tab = tab_mut(&mut self.windows, window, document)?;
        if tab.record.is_dirty() {
            return Err(WorkbenchError::UnsavedChanges(vec![document]));
        }
        let path = tab.record.path().map(Path::to_path_buf);
        Ok(self
            .scripts
            .spawn(&mut self.registry, window, document, path.as_deref())?)
    }

    pub fn terminate_script(&mut self, document: DocumentId) -> bool {
        self.scripts.terminate(document)
    }

    /// One UI event-loop step: picks up background results and schedules the
    /// next round of background work.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        self.status.update();

        report.script_exits = self.scripts.reap(&mut self.registry);
        for exit in &report.script_exits {
            let message = match exit.code {
                Some(code) => format!("Process of {} exited with code {}", exit.document, code),
                None => format!("Process of {} was terminated", exit.document),
            };
            let kind = if exit.success {
                MessageType::Info
            } else {
                MessageType::Warning
            };
            self.status
                .push(StatusMessage::new(message, kind).for_document(exit.document));
        }

        for watch in self.poller.drain() {
            let Some((window, tab)) = find_tab(&mut self.windows, watch.document) else {
                continue;
            };
            if tab.watcher.baseline() != Some(&watch.baseline) {
                // The document was saved or reloaded since the poll started.
                continue;
            }
            if let (Some(refreshed), Some(path)) = (watch.refreshed, tab.record.path()) {
                tab.watcher.arm(path.to_path_buf(), refreshed);
            }
            if let Some(change) = note_change(&mut self.status, window, tab, watch.state) {
                report.external.push(change);
            }
        }
        if now.saturating_duration_since(self.last_watch) >= WATCH_INTERVAL {
            self.last_watch = now;
            self.poller.request(self.watch_targets());
        }

        if let Some(autosave) = self.autosave.as_mut() {
            for failure in autosave.drain_failures() {
                self.status.push(
                    StatusMessage::new(
                        format!("Autosave of {} failed: {}", failure.document, failure.error),
                        MessageType::Warning,
                    )
                    .for_document(failure.document),
                );
            }
            if autosave.is_due(now) {
                let snapshots: Vec<RecoverySnapshot> = self
                    .windows
                    .values()
                    .flat_map(|w| w.tabs.iter())
                    .filter(|t| t.record.is_dirty())
                    .map(|t| RecoverySnapshot::capture(&t.record))
                    .collect();
                let count = snapshots.len();
                if autosave.submit(snapshots, now) {
                    report.autosaved = count;
                }
            }
        }
        report
    }

    fn watch_targets(&self) -> Vec<WatchTarget> {
        self.windows
            .values()
            .flat_map(|w| w.tabs.iter())
            .filter_map(|tab| {
                Some(WatchTarget {
                    document: tab.record.id(),
                    path: tab.record.path()?.to_path_buf(),
                    baseline: tab.watcher.baseline()?.clone(),
                })
            })
            .collect()
    }

    /// Reopens the autosave buffers of crashed instances as unsaved tabs in a
    /// new window, then deletes them.
    pub async fn recover_buffers(&mut self) -> Result<Vec<DocRef>, WorkbenchError> {
        let files = self
            .crash_report
            .as_ref()
            .map(|r| r.recovery_files.clone())
            .unwrap_or_default();
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let mut window = None;
        let mut recovered = Vec::new();
        for file in files {
            let snapshot = match autosave::read_snapshot(&file).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.status
                        .warning(format!("Unreadable recovery buffer {}: {}", file.display(), e));
                    continue;
                }
            };
            match self.recover_one(&mut window, snapshot).await {
                Ok(doc) => recovered.push(doc),
                Err(e) => self
                    .status
                    .warning(format!("Could not recover {}: {}", file.display(), e)),
            }
        }

        self.discard_recovery();
        self.status
            .success(format!("Recovered {} buffer(s)", recovered.len()));
        Ok(recovered)
    }

    /// Puts one snapshot into a tab. A clean tab already showing the file
    /// takes the snapshot; otherwise it lands in the recovery window, created
    /// on first use.
    async fn recover_one(
        &mut self,
        window: &mut Option<WindowId>,
        snapshot: RecoverySnapshot,
    ) -> Result<DocRef, WorkbenchError> {
        let hint = self.desktop.current_desktop();
        let mut path = match snapshot.path.as_deref() {
            Some(path) => Some(normalize(path).await),
            None => None,
        };

        if let Some(existing) = path.as_deref() {
            let open = self.windows.iter().find_map(|(id, w)| {
                w.find_by_path(existing).map(|document| (*id, document))
            });
            if let Some((id, document)) = open {
                let clean = self
                    .windows
                    .get(&id)
                    .and_then(|w| w.tab(document))
                    .map_or(false, |tab| !tab.record.is_dirty());
                if clean {
                    self.restore_snapshot(id, document, &snapshot)?;
                    if let Some(target) = self.windows.get_mut(&id) {
                        target.switch_to(document);
                    }
                    return Ok(DocRef { window: id, document });
                }
                self.status.warning(format!(
                    "{} has unsaved edits; its recovered copy opens as a new document",
                    existing.display()
                ));
                path = None;
            }
        }

        let target = match *window {
            Some(id) => id,
            None => {
                let id = self.open_window_on(hint);
                *window = Some(id);
                id
            }
        };
        let on_disk = match path {
            Some(path) => match self.files.load(&path, Some(snapshot.encoding)).await {
                Ok(loaded) => Some((path, loaded)),
                Err(_) => {
                    self.status.warning(format!(
                        "{} no longer exists; recovered as a new document",
                        path.display()
                    ));
                    None
                }
            },
            None => None,
        };
        let document = match on_disk {
            Some((path, loaded)) => self.insert_loaded(target, path, loaded)?.document(),
            None => self.new_document(target)?,
        };
        self.restore_snapshot(target, document, &snapshot)?;
        Ok(DocRef {
            window: target,
            document,
        })
    }

    fn restore_snapshot(
        &mut self,
        window: WindowId,
        document: DocumentId,
        snapshot: &RecoverySnapshot,
    ) -> Result<(), WorkbenchError> {
        let tab = tab_mut(&mut self.windows, window, document)?;
        tab.record.encoding = snapshot.encoding;
        tab.record.replace_content(&snapshot.content);
        tab.record.set_cursor_position(snapshot.cursor_position);
        tab.record.mark_unsaved();
        Ok(())
    }

    /// Drops the crashed instances' buffers without restoring them.
    pub fn discard_recovery(&mut self) -> usize {
        let removed = self.crash_guard.discard_orphaned_recovery();
        if let Some(report) = self.crash_report.as_mut() {
            report.recovery_files.clear();
        }
        removed
    }

    /// Closes every window. Only a completed shutdown clears the crash marker.
    pub async fn shutdown(&mut self, force: bool) -> Result<(), WorkbenchError> {
        if !force {
            let unsaved = self.unsaved_documents();
            if !unsaved.is_empty() {
                return Err(WorkbenchError::UnsavedChanges(unsaved));
            }
        }
        if self.config.session.restore_last_files {
            let documents = self.capture_documents(None);
            self.history.set_last_files(documents);
        }
        let ids: Vec<WindowId> = self.windows.keys().copied().collect();
        for id in ids {
            self.close_window_inner(id).await;
        }
        if let Err(e) = self.history.save().await {
            log::warn!("Failed to save history: {}", e);
        }
        if let Some(autosave) = self.autosave.take() {
            autosave.stop().await;
        }
        log::info!("Shutdown complete");
        Ok(())
    }

    fn capture_documents(&self, only: Option<WindowId>) -> Vec<SessionDocument> {
        self.windows
            .values()
            .filter(|w| only.map_or(true, |id| w.id == id))
            .enumerate()
            .flat_map(|(index, w)| {
                w.tabs.iter().filter_map(move |tab| {
                    Some(SessionDocument {
                        path: tab.record.path()?.to_path_buf(),
                        encoding: tab.record.encoding,
                        cursor_position: tab.record.cursor_position(),
                        window: index,
                    })
                })
            })
            .collect()
    }

    fn allocate_document(&mut self) -> DocumentId {
        let id = DocumentId(self.next_document);
        self.next_document += 1;
        id
    }
}

fn tab_mut(
    windows: &mut BTreeMap<WindowId, EditorWindow>,
    window: WindowId,
    document: DocumentId,
) -> Result<&mut Tab, WorkbenchError> {
    windows
        .get_mut(&window)
        .ok_or(WorkbenchError::UnknownWindow(window))?
        .tab_mut(document)
        .ok_or(WorkbenchError::UnknownDocument(document))
}

fn find_tab(
    windows: &mut BTreeMap<WindowId, EditorWindow>,
    document: DocumentId,
) -> Option<(WindowId, &mut Tab)> {
    windows
        .iter_mut()
        .find_map(|(id, w)| w.tab_mut(document).map(|tab| (*id, tab)))
}

/// Records a watcher result on the tab; advisories are raised once per
/// transition.
fn note_change(
    status: &mut StatusManager,
    window: WindowId,
    tab: &mut Tab,
    state: ChangeState,
) -> Option<ExternalChange> {
    if state == tab.external {
        return None;
    }
    tab.external = state;
    let path = tab
        .record
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let message = match state {
        ChangeState::Unchanged => return None,
        ChangeState::ModifiedExternally => format!("{} was changed by another program", path),
        ChangeState::DeletedExternally => format!("{} was deleted by another program", path),
    };
    status.push(StatusMessage::new(message, MessageType::Warning).for_document(tab.record.id()));
    Some(ExternalChange {
        window,
        document: tab.record.id(),
        state,
    })
}

async fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = tokio::fs::canonicalize(path).await {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|dir| dir.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
