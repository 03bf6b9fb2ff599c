//! Liveness markers for unclean-shutdown detection.
//!
//! Each process owns `<data>/instances/<pid>.marker` from its first window
//! until its last window closes. A marker whose owner no longer runs is
//! evidence of a crash; one whose owner is alive is simply another instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Asks the OS whether a pid exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 only performs the existence and permission checks.
        let result = unsafe { libc::kill(pid, 0) };
        result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        // No probe here; treat every owner as alive.
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Clean,
    Running,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkerRecord {
    pid: u32,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashedInstance {
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub marker: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashReport {
    pub crashed: Vec<CrashedInstance>,
    /// Autosave snapshots left behind by instances that are no longer running.
    pub recovery_files: Vec<PathBuf>,
}

impl CrashReport {
    pub fn prior_crash_detected(&self) -> bool {
        !self.crashed.is_empty()
    }

    pub fn has_recovery(&self) -> bool {
        !self.recovery_files.is_empty()
    }
}

pub struct CrashGuard {
    instances_dir: PathBuf,
    recovery_root: PathBuf,
    pid: u32,
    state: GuardState,
    open_windows: usize,
    probe: Box<dyn ProcessProbe>,
}

impl CrashGuard {
    pub fn new(data_dir: &Path) -> Self {
        Self::with_probe(data_dir, std::process::id(), Box::new(SystemProbe))
    }

    pub fn with_probe(data_dir: &Path, pid: u32, probe: Box<dyn ProcessProbe>) -> Self {
        Self {
            instances_dir: data_dir.join("instances"),
            recovery_root: data_dir.join("recovery"),
            pid,
            state: GuardState::Clean,
            open_windows: 0,
            probe,
        }
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn marker_path(&self) -> PathBuf {
        self.instances_dir.join(format!("{}.marker", self.pid))
    }

    /// Where this instance's autosave snapshots go.
    pub fn recovery_dir(&self) -> PathBuf {
        self.recovery_dir_for(self.pid)
    }

    pub fn recovery_dir_for(&self, pid: u32) -> PathBuf {
        self.recovery_root.join(pid.to_string())
    }

    /// Looks for markers and recovery buffers left by dead instances.
    ///
    /// A marker carrying our own pid before we armed means the pid was reused
    /// after a crash, so it counts as stale too.
    pub fn inspect(&self) -> CrashReport {
        let mut report = CrashReport::default();

        for (pid, path) in pid_entries(&self.instances_dir, "marker") {
            let ours = pid == self.pid && self.state == GuardState::Running;
            if ours {
                continue;
            }
            if pid != self.pid && self.probe.is_alive(pid) {
                log::debug!("Instance {} is still running", pid);
                continue;
            }
            let started_at = fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<MarkerRecord>(&bytes).ok())
                .map(|record| record.started_at);
            log::warn!("Previous instance {} did not shut down cleanly", pid);
            report.crashed.push(CrashedInstance {
                pid,
                started_at,
                marker: path,
            });
        }

        for (pid, dir) in pid_entries(&self.recovery_root, "") {
            if pid == self.pid || self.probe.is_alive(pid) {
                continue;
            }
            match fs::read_dir(&dir) {
                Ok(entries) => report.recovery_files.extend(
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json")),
                ),
                Err(e) => log::warn!("Recovery directory {} unreadable: {}", dir.display(), e),
            }
        }
        report.crashed.sort_by_key(|c| c.pid);
        report.recovery_files.sort();
        report
    }

    /// Removes the stale markers in `report` so the advisory shows only once.
    /// Recovery buffers stay until recovered or discarded.
    pub fn acknowledge(&self, report: &CrashReport) {
        for instance in &report.crashed {
            if instance.pid == self.pid && self.state == GuardState::Running {
                continue;
            }
            if let Err(e) = fs::remove_file(&instance.marker) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("Failed to remove stale marker {}: {}", instance.marker.display(), e);
                }
            }
        }
    }

    /// Deletes every recovery buffer left by dead instances.
    pub fn discard_orphaned_recovery(&self) -> usize {
        let mut removed = 0;
        for (pid, dir) in pid_entries(&self.recovery_root, "") {
            if pid == self.pid || self.probe.is_alive(pid) {
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Failed to discard {}: {}", dir.display(), e),
            }
        }
        removed
    }

    /// First window up writes the marker, durably, before returning.
    pub fn window_opened(&mut self) -> io::Result<()> {
        self.open_windows += 1;
        if self.state == GuardState::Running {
            return Ok(());
        }
        self.write_marker()?;
        self.state = GuardState::Running;
        log::debug!("Crash marker armed at {}", self.marker_path().display());
        Ok(())
    }

    /// Last window down removes the marker and this instance's recovery
    /// buffers.
    pub fn window_closed(&mut self) -> io::Result<()> {
        self.open_windows = self.open_windows.saturating_sub(1);
        if self.open_windows > 0 || self.state == GuardState::Clean {
            return Ok(());
        }
        match fs::remove_file(self.marker_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        match fs::remove_dir_all(self.recovery_dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to clear recovery buffers: {}", e),
        }
        self.state = GuardState::Clean;
        log::info!("Clean shutdown recorded");
        Ok(())
    }

    fn write_marker(&self) -> io::Result<()> {
        fs::create_dir_all(&self.instances_dir)?;
        let path = self.marker_path();
        let record = MarkerRecord {
            pid: self.pid,
            started_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record)?;

        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Left by a dead process that had our pid.
                fs::remove_file(&path)?;
                fs::OpenOptions::new().write(true).create_new(true).open(&path)?
            }
            Err(e) => return Err(e),
        };
        file.write_all(&bytes)?;
        file.sync_all()?;
        sync_dir(&self.instances_dir);
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Entries of `dir` named `<pid>` (directories, `extension` empty) or
/// `<pid>.<extension>`.
fn pid_entries(dir: &Path, extension: &str) -> Vec<(u32, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            let path = entry.path();
            let pid = if extension.is_empty() {
                if !path.is_dir() {
                    return None;
                }
                path.file_name()?.to_str()?.parse().ok()?
            } else {
                if path.extension().and_then(|s| s.to_str()) != Some(extension) {
                    return None;
                }
                path.file_stem()?.to_str()?.parse().ok()?
            };
            Some((pid, path))
        })
        .collect()
}
