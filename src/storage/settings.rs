//! Settings storage
//!
//! Manages persistence of pipeline settings and the `APP_MODE` override.

use crate::storage::{default_log_path, get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Environment variable selecting the operating profile
pub const APP_MODE_ENV: &str = "APP_MODE";

pub const DEFAULT_MODEL_NAME: &str = "yolov5n";
pub const DEFAULT_MODE: &str = "student";

/// What a failed log write does to the request that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFailurePolicy {
    /// Fail the request
    #[default]
    Propagate,
    /// Report the failure and still return the detection result
    Warn,
}

/// Pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Performance log file
    pub log_path: PathBuf,
    /// Model identity written to the `model` column
    pub model_name: String,
    /// Operating profile; carried and logged, selects no behaviour here
    pub mode: String,
    /// Handling of log write failures
    pub log_failure_policy: LogFailurePolicy,
    /// Run host-only even when an accelerator is present
    pub force_cpu: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            mode: DEFAULT_MODE.to_string(),
            log_failure_policy: LogFailurePolicy::default(),
            force_cpu: false,
        }
    }
}

impl PipelineSettings {
    /// Validate settings values
    ///
    /// Normalises the mode and fills in blank values
    pub fn validate(&mut self) {
        self.mode = self.mode.trim().to_lowercase();
        if self.mode.is_empty() {
            self.mode = DEFAULT_MODE.to_string();
        }

        self.model_name = self.model_name.trim().to_string();
        if self.model_name.is_empty() {
            self.model_name = DEFAULT_MODEL_NAME.to_string();
        }

        if self.log_path.as_os_str().is_empty() {
            self.log_path = default_log_path();
        }
    }

    /// Apply environment overrides (`APP_MODE`)
    pub fn apply_env(&mut self) {
        self.apply_mode(std::env::var(APP_MODE_ENV).ok());
    }

    fn apply_mode(&mut self, mode: Option<String>) {
        if let Some(mode) = mode {
            self.mode = mode;
            self.validate();
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted.
/// Environment overrides are applied in both cases.
pub fn load_settings() -> PipelineSettings {
    let mut settings = match load_settings_internal() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            PipelineSettings::default()
        }
    };
    settings.apply_env();
    settings
}

/// Internal settings loading with error propagation
fn load_settings_internal() -> Result<PipelineSettings, StorageError> {
    let path = get_settings_path()?;

    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(PipelineSettings::default());
    }

    let json = fs::read_to_string(&path)?;
    let mut settings: PipelineSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from disk");
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &PipelineSettings) -> Result<(), StorageError> {
    let path = get_settings_path()?;

    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to disk");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.model_name, "yolov5n");
        assert_eq!(settings.mode, "student");
        assert_eq!(settings.log_failure_policy, LogFailurePolicy::Propagate);
        assert!(!settings.force_cpu);
        assert!(settings.log_path.ends_with("perf_log.csv"));
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = PipelineSettings::default();

        settings.mode = "  Classroom ".to_string();
        settings.validate();
        assert_eq!(settings.mode, "classroom");

        settings.mode = String::new();
        settings.model_name = "   ".to_string();
        settings.log_path = PathBuf::new();
        settings.validate();
        assert_eq!(settings.mode, "student");
        assert_eq!(settings.model_name, "yolov5n");
        assert_eq!(settings.log_path, default_log_path());
    }

    #[test]
    fn test_mode_override() {
        let mut settings = PipelineSettings::default();

        settings.apply_mode(None);
        assert_eq!(settings.mode, "student");

        settings.apply_mode(Some("DEMO".to_string()));
        assert_eq!(settings.mode, "demo");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{"model_name": "yolov5s", "log_failure_policy": "warn"}"#;
        let mut settings: PipelineSettings = serde_json::from_str(json).unwrap();
        settings.validate();

        assert_eq!(settings.model_name, "yolov5s");
        assert_eq!(settings.log_failure_policy, LogFailurePolicy::Warn);
        assert_eq!(settings.mode, "student");
    }

    #[test]
    fn test_settings_serialization() {
        let settings = PipelineSettings::default();

        let json = serde_json::to_string(&settings).unwrap();
        let deserialized: PipelineSettings = serde_json::from_str(&json).unwrap();

        assert_eq!(settings, deserialized);
    }
}
