use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use textcore::{Encoding, SaveTransforms};
use tokio::fs::try_exists;

use crate::document::ViewDefaults;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub text: TextConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub files: FileConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Open every file in its own window instead of a tab of an existing one.
    pub open_in_windows: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    pub wrap_by_default: bool,
    pub indent_by_default: bool,
    pub syntax_by_default: bool,
    pub max_highlight_size_mb: u64,
    pub append_empty_line: bool,
    pub remove_trailing_spaces: bool,
    pub default_encoding: Encoding,
    pub auto_save: bool,
    pub auto_save_interval_minutes: u64,
    pub execute_scripts: bool,
    pub execute_command: String,
    pub recent_files_number: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            wrap_by_default: true,
            indent_by_default: true,
            syntax_by_default: true,
            max_highlight_size_mb: 2,
            append_empty_line: true,
            remove_trailing_spaces: false,
            default_encoding: Encoding::Utf8,
            auto_save: false,
            auto_save_interval_minutes: 1,
            execute_scripts: false,
            execute_command: String::new(),
            recent_files_number: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub restore_last_files: bool,
    pub remember_cursor_positions: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            restore_last_files: false,
            remember_cursor_positions: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub backup_on_save: bool,
}

impl Config {
    pub async fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path).await,
            None => {
                log::warn!("No config location available, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub async fn load_from(config_path: &Path) -> Result<Self> {
        if try_exists(config_path).await? {
            match tokio::fs::read_to_string(config_path).await {
                Ok(content) => {
                    if content.trim().is_empty() {
                        log::warn!("Config file is empty, creating new one");
                        let default_config = Self::default();
                        let _ = default_config.save_to(config_path).await;
                        return Ok(default_config);
                    }

                    match serde_json::from_str::<Self>(&content) {
                        Ok(mut config) => {
                            config.validate();
                            log::info!("Loaded config from: {}", config_path.display());
                            return Ok(config);
                        }
                        Err(json_err) => {
                            log::error!("Failed to parse config file: {}", json_err);

                            let backup_path = config_path.with_extension("bak");
                            if let Err(e) = tokio::fs::copy(config_path, &backup_path).await {
                                log::warn!("Failed to backup broken config: {}", e);
                            } else {
                                log::info!(
                                    "Backed up broken config to: {}",
                                    backup_path.display()
                                );
                            }

                            let default_config = Self::default();
                            let _ = default_config.save_to(config_path).await;
                            return Ok(default_config);
                        }
                    }
                }
                Err(io_err) => {
                    log::error!("Failed to read config file: {}", io_err);
                    return Ok(Self::default());
                }
            }
        }

        log::info!("Config file does not exist, creating default");
        let default_config = Self::default();
        let _ = default_config.save_to(config_path).await;
        Ok(default_config)
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(config_path) = Self::config_path() {
            self.save_to(&config_path).await?;
        }
        Ok(())
    }

    pub async fn save_to(&self, config_path: &Path) -> Result<()> {
        let mut config_to_save = self.clone();
        config_to_save.validate();

        let content = serde_json::to_string_pretty(&config_to_save)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;
        crate::atomic_file::write_atomic(config_path, content.as_bytes())
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to write config file {}: {}",
                    config_path.display(),
                    e
                )
            })?;
        log::info!("Saved config to: {}", config_path.display());
        Ok(())
    }

    /// Clamps out-of-range values back into their allowed bounds.
    pub fn validate(&mut self) {
        let mut has_issues = false;

        if !(1..=10).contains(&self.text.max_highlight_size_mb) {
            log::warn!(
                "Invalid max highlight size: {} MiB, clamping",
                self.text.max_highlight_size_mb
            );
            self.text.max_highlight_size_mb = self.text.max_highlight_size_mb.clamp(1, 10);
            has_issues = true;
        }

        if !(1..=60).contains(&self.text.auto_save_interval_minutes) {
            log::warn!(
                "Invalid autosave interval: {} min, clamping",
                self.text.auto_save_interval_minutes
            );
            self.text.auto_save_interval_minutes = self.text.auto_save_interval_minutes.clamp(1, 60);
            has_issues = true;
        }

        if !(1..=20).contains(&self.text.recent_files_number) {
            log::warn!(
                "Invalid recent files number: {}, clamping",
                self.text.recent_files_number
            );
            self.text.recent_files_number = self.text.recent_files_number.clamp(1, 20);
            has_issues = true;
        }

        if self.text.default_encoding == Encoding::Auto {
            self.text.default_encoding = Encoding::Utf8;
        }

        if has_issues {
            log::info!("Configuration validation completed with corrections");
        }
    }

    pub fn single_window_per_desktop(&self) -> bool {
        !self.window.open_in_windows
    }

    pub fn view_defaults(&self) -> ViewDefaults {
        ViewDefaults {
            highlighting: self.text.syntax_by_default,
            wrap: self.text.wrap_by_default,
            auto_indent: self.text.indent_by_default,
        }
    }

    pub fn save_transforms(&self) -> SaveTransforms {
        SaveTransforms {
            remove_trailing_spaces: self.text.remove_trailing_spaces,
            append_empty_line: self.text.append_empty_line,
        }
    }

    pub fn max_highlight_bytes(&self) -> u64 {
        self.text.max_highlight_size_mb * 1024 * 1024
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.text.auto_save_interval_minutes * 60)
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("PLUMEPAD_CONFIG_PATH") {
            return Some(PathBuf::from(path));
        }

        if let Ok(dir) = std::env::var("PLUMEPAD_CONFIG_DIR") {
            return Some(PathBuf::from(dir).join("config.json"));
        }

        ProjectDirs::from("org", "plumepad", "plumepad")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Root for sessions, crash markers, recovery buffers and history.
    pub fn data_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("PLUMEPAD_DATA_DIR") {
            return Ok(PathBuf::from(dir));
        }
        let dirs = ProjectDirs::from("org", "plumepad", "plumepad")
            .ok_or_else(|| anyhow::anyhow!("Could not determine a data directory"))?;
        Ok(dirs.data_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};
    use tempfile::TempDir;

    fn env_test_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(!config.window.open_in_windows);
        assert!(config.single_window_per_desktop());
        assert!(config.text.wrap_by_default);
        assert!(config.text.append_empty_line);
        assert!(!config.text.remove_trailing_spaces);
        assert_eq!(config.text.default_encoding, Encoding::Utf8);
        assert_eq!(config.text.max_highlight_size_mb, 2);
        assert_eq!(config.text.recent_files_number, 10);
        assert_eq!(config.autosave_interval(), Duration::from_secs(60));
        assert!(config.session.remember_cursor_positions);
    }

    #[test]
    fn test_validate_clamps_out_of_range_values() {
        let mut config = Config::default();
        config.text.max_highlight_size_mb = 50;
        config.text.auto_save_interval_minutes = 0;
        config.text.recent_files_number = 100;
        config.text.default_encoding = Encoding::Auto;

        config.validate();

        assert_eq!(config.text.max_highlight_size_mb, 10);
        assert_eq!(config.text.auto_save_interval_minutes, 1);
        assert_eq!(config.text.recent_files_number, 20);
        assert_eq!(config.text.default_encoding, Encoding::Utf8);
    }

    #[test]
    fn test_partial_config_fills_in_defaults() {
        let json = r#"{ "window": { "open_in_windows": true }, "text": { "auto_save": true }, "future_section": 1 }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.window.open_in_windows);
        assert!(!config.single_window_per_desktop());
        assert!(config.text.auto_save);
        assert!(config.text.syntax_by_default);
        assert!(!config.session.restore_last_files);
    }

    #[tokio::test]
    async fn test_load_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).await.unwrap();
        assert!(config.text.append_empty_line);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_broken_config_is_backed_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = Config::load_from(&path).await.unwrap();
        assert_eq!(config.text.recent_files_number, 10);
        assert_eq!(
            std::fs::read_to_string(path.with_extension("bak")).unwrap(),
            "{ not json"
        );
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.text.default_encoding = Encoding::Koi8U;
        config.text.execute_command = "sh".to_string();
        config.save_to(&path).await.unwrap();

        let loaded = Config::load_from(&path).await.unwrap();
        assert_eq!(loaded.text.default_encoding, Encoding::Koi8U);
        assert_eq!(loaded.text.execute_command, "sh");
    }

    #[test]
    fn test_data_dir_env_override() {
        let _guard = env_test_lock().lock().unwrap();
        let previous = std::env::var("PLUMEPAD_DATA_DIR").ok();
        std::env::set_var("PLUMEPAD_DATA_DIR", "/tmp/plumepad-data");

        assert_eq!(
            Config::data_dir().unwrap(),
            PathBuf::from("/tmp/plumepad-data")
        );

        match previous {
            Some(value) => std::env::set_var("PLUMEPAD_DATA_DIR", value),
            None => std::env::remove_var("PLUMEPAD_DATA_DIR"),
        }
    }
}
