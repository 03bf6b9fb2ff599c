// Plumepad session and document-state engine

pub mod app;
pub mod atomic_file;
pub mod autosave;
pub mod config;
pub mod crash_guard;
pub mod document;
pub mod file_manager;
pub mod history;
pub mod script_runner;
pub mod search_scope;
pub mod session_manager;
pub mod status_manager;
pub mod watcher;
pub mod window_registry;

pub use app::{Edit, OpenOutcome, SaveRequest, Workbench, WorkbenchError};
pub use config::Config;
pub use crash_guard::{CrashGuard, CrashReport};
pub use document::{DocumentId, DocumentRecord};
pub use session_manager::{OverwritePolicy, SessionScope, SessionStore};
pub use window_registry::{DesktopId, WindowId, WindowRegistry};
