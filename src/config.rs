//! CLI configuration: a YAML file, then environment overrides.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub browser: BrowserConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub fps: f64,
    /// `WxH`, passed to the encoder and used as the page viewport.
    pub size: Option<String>,
    pub preset: String,
    pub codec: String,
    pub ffmpeg: Option<PathBuf>,
    /// Logical recording length, in humantime syntax.
    pub duration: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: framecast_capture::DEFAULT_FPS,
            size: None,
            preset: "ultrafast".to_string(),
            codec: framecast_capture::format::DEFAULT_VIDEO_CODEC.to_string(),
            ffmpeg: None,
            duration: "5s".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub no_sandbox: bool,
}

pub struct LoadedConfig {
    pub config: Config,
    pub path: PathBuf,
}

/// `./config/framecast.yaml`, else `<config dir>/framecast/config.yaml`.
pub fn default_config_path() -> Result<PathBuf> {
    let local_config = PathBuf::from("config/framecast.yaml");
    if local_config.exists() {
        return Ok(local_config);
    }
    let mut path = dirs::config_dir().context("Failed to get config directory")?;
    path.push("framecast");
    path.push("config.yaml");
    Ok(path)
}

pub async fn load_config(config_path: Option<&Path>) -> Result<LoadedConfig> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    let mut config = if config_path.exists() {
        let content = fs::read_to_string(&config_path)
            .await
            .context("Failed to read config file")?;
        let config: Config =
            serde_yaml::from_str(&content).context("Failed to parse config file")?;
        info!(target: "framecast", path = %config_path.display(), "loaded configuration");
        config
    } else {
        warn!(
            target: "framecast",
            path = %config_path.display(),
            "config file not found, using defaults"
        );
        Config::default()
    };

    apply_env_overrides(&mut config)?;
    Ok(LoadedConfig {
        config,
        path: config_path,
    })
}

/// `FRAMECAST_FPS`, `FRAMECAST_SIZE`, `FFMPEG` and `FRAMECAST_CHROME` win over the file.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(raw) = non_empty_var("FRAMECAST_FPS") {
        config.capture.fps = raw
            .parse()
            .with_context(|| format!("FRAMECAST_FPS is not a number: {raw}"))?;
    }
    if let Some(size) = non_empty_var("FRAMECAST_SIZE") {
        config.capture.size = Some(size);
    }
    if let Some(ffmpeg) = non_empty_var("FFMPEG") {
        config.capture.ffmpeg = Some(PathBuf::from(ffmpeg));
    }
    if let Some(chrome) = non_empty_var("FRAMECAST_CHROME") {
        config.browser.executable = Some(PathBuf::from(chrome));
    }
    Ok(())
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Split `WxH` into a viewport.
pub fn parse_size(size: &str) -> Result<(u32, u32)> {
    let (width, height) = size
        .split_once(['x', 'X'])
        .with_context(|| format!("size must look like WIDTHxHEIGHT, got {size}"))?;
    let width = width
        .trim()
        .parse()
        .with_context(|| format!("invalid width in {size}"))?;
    let height = height
        .trim()
        .parse()
        .with_context(|| format!("invalid height in {size}"))?;
    Ok((width, height))
}
