//! Launch flags and process checks for deterministic stepped rendering.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CdpConfig;

/// Flags a headless shell must be started with before `HeadlessExperimental.beginFrame` can drive it.
pub const REQUIRED_ARGS: [&str; 9] = [
    "--deterministic-mode",
    "--enable-begin-frame-control",
    "--disable-new-content-rendering-timeout",
    "--run-all-compositor-stages-before-draw",
    "--disable-threaded-animation",
    "--disable-threaded-scrolling",
    "--disable-checker-imaging",
    "--disable-image-animation-resync",
    "--enable-surface-synchronization",
];

const HEADLESS_SHELL_NAME: &str = "chrome-headless-shell";

/// Quietens the browser: no updaters, extensions or background throttling of the page under capture.
const BASE_ARGS: [&str; 13] = [
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-breakpad",
    "--disable-component-update",
    "--disable-default-apps",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-hang-monitor",
    "--disable-sync",
    "--metrics-recording-only",
    "--no-first-run",
    "--no-default-browser-check",
    "--remote-allow-origins=*",
];

/// Description of the browser process backing a page, as it was spawned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserProcess {
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
}

impl BrowserProcess {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: Some(executable.into()),
            args,
        }
    }

    pub fn missing_required_args(&self) -> Vec<&'static str> {
        REQUIRED_ARGS
            .iter()
            .copied()
            .filter(|required| !self.args.iter().any(|arg| arg == required))
            .collect()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LaunchCheckError {
    #[error("Not chrome-headless-shell: {0}")]
    NotHeadlessShell(String),
    #[error("Missing one or more of required arguments: {}", REQUIRED_ARGS.join(", "))]
    MissingRequiredArgs(Vec<String>),
}

pub fn is_headless_shell(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem == HEADLESS_SHELL_NAME)
        .unwrap_or(false)
}

/// Check that a process was spawned from a headless shell with every required flag.
pub fn validate_process(process: Option<&BrowserProcess>) -> Result<(), LaunchCheckError> {
    let executable = process.and_then(|process| process.executable.as_deref());
    match executable {
        Some(path) if is_headless_shell(path) => {}
        Some(path) => {
            return Err(LaunchCheckError::NotHeadlessShell(
                path.display().to_string(),
            ))
        }
        None => return Err(LaunchCheckError::NotHeadlessShell("<unknown>".into())),
    }

    let missing = process
        .map(BrowserProcess::missing_required_args)
        .unwrap_or_else(|| REQUIRED_ARGS.to_vec());
    if missing.is_empty() {
        Ok(())
    } else {
        Err(LaunchCheckError::MissingRequiredArgs(
            missing.into_iter().map(str::to_string).collect(),
        ))
    }
}

/// Full argument list the transport passes to the browser, base flags first.
pub fn launch_args(cfg: &CdpConfig) -> Vec<String> {
    let mut args: Vec<String> = BASE_ARGS.iter().map(|arg| arg.to_string()).collect();
    if cfg.headless {
        args.push("--hide-scrollbars".into());
        args.push("--mute-audio".into());
    }
    for arg in &cfg.args {
        if !args.contains(arg) {
            args.push(arg.clone());
        }
    }
    args
}

/// Derive a launch configuration suitable for capture: user flags first, required flags appended,
/// headless forced on.
pub fn capture_config(mut cfg: CdpConfig) -> CdpConfig {
    cfg.headless = true;
    for required in REQUIRED_ARGS {
        if !cfg.args.iter().any(|arg| arg == required) {
            cfg.args.push(required.to_string());
        }
    }
    cfg
}
