//! Runs a saved document as a child process attached to its tab.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::config::Config;
use crate::document::DocumentId;
use crate::window_registry::{ProcessConflict, WindowId, WindowRegistry};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Conflict(#[from] ProcessConflict),
    #[error("running scripts is disabled")]
    Disabled,
    #[error("the document has to be saved before it can run")]
    NoPath,
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptExit {
    pub window: WindowId,
    pub document: DocumentId,
    pub code: Option<i32>,
    pub success: bool,
}

struct RunningScript {
    window: WindowId,
    child: Child,
}

pub struct ScriptRunner {
    enabled: bool,
    command: String,
    running: HashMap<DocumentId, RunningScript>,
}

impl ScriptRunner {
    pub fn new(enabled: bool, command: impl Into<String>) -> Self {
        Self {
            enabled,
            command: command.into(),
            running: HashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.text.execute_scripts, config.text.execute_command.clone())
    }

    pub fn is_running(&self, document: DocumentId) -> bool {
        self.running.contains_key(&document)
    }

    /// Starts `path` under the configured command prefix, or directly when no
    /// prefix is set. Must be called from within a tokio runtime.
    pub fn spawn(
        &mut self,
        registry: &mut WindowRegistry,
        window: WindowId,
        document: DocumentId,
        path: Option<&Path>,
    ) -> Result<Option<u32>, ScriptError> {
        if !self.enabled {
            return Err(ScriptError::Disabled);
        }
        let path = path.ok_or(ScriptError::NoPath)?;
        registry.attach_process(window, document)?;

        let mut words = self.command.split_whitespace();
        let mut command = match words.next() {
            Some(program) => {
                let mut command = Command::new(program);
                command.args(words).arg(path);
                command
            }
            None => Command::new(path),
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match command.spawn() {
            Ok(child) => {
                let pid = child.id();
                log::info!("Started {} for {} (pid {:?})", path.display(), document, pid);
                self.running.insert(document, RunningScript { window, child });
                Ok(pid)
            }
            Err(source) => {
                registry.detach_process(document);
                Err(ScriptError::Spawn {
                    command: if self.command.trim().is_empty() {
                        path.display().to_string()
                    } else {
                        self.command.clone()
                    },
                    source,
                })
            }
        }
    }

    /// Asks the tab's process to stop. It is reaped on a later tick.
    pub fn terminate(&mut self, document: DocumentId) -> bool {
        let Some(script) = self.running.get_mut(&document) else {
            return false;
        };
        match script.child.start_kill() {
            Ok(()) => {
                log::info!("Terminating process of {}", document);
                true
            }
            Err(e) => {
                log::warn!("Failed to terminate process of {}: {}", document, e);
                false
            }
        }
    }

    /// Collects finished processes and frees their tabs' slots.
    pub fn reap(&mut self, registry: &mut WindowRegistry) -> Vec<ScriptExit> {
        let mut exits = Vec::new();
        let mut finished = Vec::new();
        for (document, script) in self.running.iter_mut() {
            match script.child.try_wait() {
                Ok(Some(status)) => {
                    exits.push(ScriptExit {
                        window: script.window,
                        document: *document,
                        code: status.code(),
                        success: status.success(),
                    });
                    finished.push(*document);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Lost track of process for {}: {}", document, e);
                    exits.push(ScriptExit {
                        window: script.window,
                        document: *document,
                        code: None,
                        success: false,
                    });
                    finished.push(*document);
                }
            }
        }
        for document in finished {
            self.running.remove(&document);
            registry.detach_process(document);
        }
        exits
    }

    /// Kills every attached process, e.g. when their windows close.
    pub fn terminate_window(&mut self, registry: &mut WindowRegistry, window: WindowId) {
        let documents: Vec<DocumentId> = self
            .running
            .iter()
            .filter(|(_, script)| script.window == window)
            .map(|(document, _)| *document)
            .collect();
        for document in documents {
            if let Some(mut script) = self.running.remove(&document) {
                let _ = script.child.start_kill();
            }
            registry.detach_process(document);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window_registry::DesktopId;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry() -> WindowRegistry {
        let mut registry = WindowRegistry::new();
        registry.register(WindowId(1), DesktopId::Known(0));
        registry
    }

    async fn reap_until_done(runner: &mut ScriptRunner, registry: &mut WindowRegistry) -> Vec<ScriptExit> {
        for _ in 0..300 {
            let exits = runner.reap(registry);
            if !exits.is_empty() {
                return exits;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Vec::new()
    }

    #[tokio::test]
    async fn test_disabled_and_unsaved() {
        let mut registry = registry();
        let mut runner = ScriptRunner::new(false, "sh");
        assert!(matches!(
            runner.spawn(&mut registry, WindowId(1), DocumentId(1), Some(Path::new("/x.sh"))),
            Err(ScriptError::Disabled)
        ));

        let mut runner = ScriptRunner::new(true, "sh");
        assert!(matches!(
            runner.spawn(&mut registry, WindowId(1), DocumentId(1), None),
            Err(ScriptError::NoPath)
        ));
        assert!(!registry.has_process(DocumentId(1)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_run_is_rejected_until_terminated() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("wait.sh");
        std::fs::write(&script, "sleep 30\n").unwrap();

        let mut registry = registry();
        let mut runner = ScriptRunner::new(true, "sh");
        let doc = DocumentId(5);
        runner.spawn(&mut registry, WindowId(1), doc, Some(&script)).unwrap();
        assert!(runner.is_running(doc));

        let err = runner
            .spawn(&mut registry, WindowId(1), doc, Some(&script))
            .unwrap_err();
        assert!(matches!(err, ScriptError::Conflict(ProcessConflict::AlreadyRunning { .. })));

        assert!(runner.terminate(doc));
        let exits = reap_until_done(&mut runner, &mut registry).await;
        assert_eq!(exits.len(), 1);
        assert!(!exits[0].success);
        assert!(!registry.has_process(doc));
        assert!(runner.spawn(&mut registry, WindowId(1), doc, Some(&script)).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("exit.sh");
        std::fs::write(&script, "exit 3\n").unwrap();

        let mut registry = registry();
        let mut runner = ScriptRunner::new(true, "sh");
        runner.spawn(&mut registry, WindowId(1), DocumentId(2), Some(&script)).unwrap();

        let exits = reap_until_done(&mut runner, &mut registry).await;
        assert_eq!(exits[0].code, Some(3));
        assert!(!runner.is_running(DocumentId(2)));
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_slot() {
        let mut registry = registry();
        let mut runner = ScriptRunner::new(true, "plumepad-no-such-interpreter");
        let err = runner
            .spawn(&mut registry, WindowId(1), DocumentId(7), Some(Path::new("/tmp/x")))
            .unwrap_err();
        assert!(matches!(err, ScriptError::Spawn { .. }));
        assert!(!registry.has_process(DocumentId(7)));
    }
}
