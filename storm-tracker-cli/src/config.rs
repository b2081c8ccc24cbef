//! Configuration loading and parsing

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use storm_tracker::TrackerConfig;

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub tracker: TrackerConfig,
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputConfig {
    /// Scan series files (JSON), one independent tracking run each
    pub scan_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Directory receiving the track archives
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Summary format printed at the end of a run
    #[serde(default = "default_format")]
    pub format: OutputFormat,
    /// Also write every scan report as JSON lines
    #[serde(default)]
    pub write_events: bool,
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("tracks")
}

fn default_format() -> OutputFormat {
    OutputFormat::Txt
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            archive_dir: default_archive_dir(),
            format: default_format(),
            write_events: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Txt,
    Json,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    parse_config(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
}

/// Parse and validate configuration text
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    config
        .tracker
        .validate()
        .context("Invalid tracker configuration")?;
    Ok(config)
}
