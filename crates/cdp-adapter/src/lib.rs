//! Chromium DevTools Protocol plumbing for Framecast.
//!
//! The crate owns the websocket transport to a Chromium instance, the launch configuration required
//! for deterministic stepped rendering, and a page abstraction that higher layers drive without
//! knowing about sessions, call ids or event routing.

use std::{env, path::PathBuf};
use which::which;

pub mod ids {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Unique identifier for a page opened through the adapter.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct PageId(pub Uuid);

    /// Unique identifier for a capture session bound to a page.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct SessionId(pub Uuid);

    impl PageId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for PageId {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SessionId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for SessionId {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// JSON-RPC code Chromium answers with for methods it does not implement.
    pub const METHOD_NOT_FOUND: i64 = -32601;

    /// Generic server error; Chromium uses it for most domain-level failures.
    pub const SERVER_ERROR: i64 = -32000;

    /// High-level error categories surfaced by the adapter.
    #[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AdapterErrorKind {
        #[error("command timed out")]
        Timeout,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("target closed")]
        TargetClosed,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to higher layers.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub code: Option<i64>,
        pub retriable: bool,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                code: None,
                retriable: false,
                data: None,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn with_code(mut self, code: i64) -> Self {
            self.code = Some(code);
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }

        /// Error reply carried back from the browser.
        pub fn protocol(code: i64, message: &str) -> Self {
            Self::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("cdp error {code}: {message}"))
                .with_code(code)
                .retriable(code >= 500)
        }

        pub fn is_method_not_found(&self) -> bool {
            self.code == Some(METHOD_NOT_FOUND)
        }

        /// `Runtime.evaluate` against an execution context that was torn down in the meantime.
        pub fn is_missing_context(&self) -> bool {
            self.code == Some(SERVER_ERROR)
                && self.hint.as_deref().is_some_and(|hint| {
                    hint.contains("Cannot find context with specified id")
                        || hint.contains("Execution context was destroyed")
                })
        }
    }
}

pub mod config {
    use crate::detect_chrome_executable;
    use serde::{Deserialize, Serialize};
    use std::{
        env,
        path::{Path, PathBuf},
    };

    /// Configuration for launching and talking to Chromium.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct CdpConfig {
        pub executable: PathBuf,
        pub user_data_dir: PathBuf,
        pub headless: bool,
        pub no_sandbox: bool,
        pub args: Vec<String>,
        /// Upper bound for a single command round trip.
        pub command_timeout_ms: u64,
    }

    impl Default for CdpConfig {
        fn default() -> Self {
            Self {
                executable: default_chrome_path(),
                user_data_dir: default_profile_dir(),
                headless: true,
                no_sandbox: resolve_no_sandbox_default(),
                args: Vec::new(),
                command_timeout_ms: 30_000,
            }
        }
    }

    fn resolve_no_sandbox_default() -> bool {
        env::var("FRAMECAST_DISABLE_SANDBOX")
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    fn default_chrome_path() -> PathBuf {
        detect_chrome_executable().unwrap_or_default()
    }

    fn default_profile_dir() -> PathBuf {
        if let Ok(path) = env::var("FRAMECAST_CHROME_PROFILE") {
            return PathBuf::from(path);
        }

        let default = Path::new("./.framecast-profile");
        default.into()
    }
}

/// Locate a Chromium binary, preferring `chrome-headless-shell` which is the only build that
/// honours stepped rendering.
pub fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("FRAMECAST_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    let skip_defaults = env::var("FRAMECAST_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);

    if !skip_defaults {
        for candidate in os_specific_chrome_paths() {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome-headless-shell.exe", "chrome.exe", "chromium.exe"]
    }

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    {
        &[
            "chrome-headless-shell",
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        &["chrome-headless-shell", "chrome"]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for root in windows_search_roots() {
            paths.push(root.join("Google/Chrome/Application/chrome.exe"));
            paths.push(root.join("Chromium/Application/chrome.exe"));
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/opt/chrome-headless-shell/chrome-headless-shell"),
            PathBuf::from("/usr/bin/chrome-headless-shell"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        Vec::new()
    }
}

#[cfg(target_os = "windows")]
fn windows_search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                roots.push(PathBuf::from(trimmed));
            }
        }
    }
    roots
}


pub use config::CdpConfig;
pub use error::{AdapterError, AdapterErrorKind};
pub use ids::{PageId, SessionId};
pub use launch::{BrowserProcess, REQUIRED_ARGS};
pub use metrics::AdapterMetricsSnapshot;
pub use page::{ChromiumPage, PageSignal, PageTarget};
pub mod launch;
pub mod metrics;
pub mod page;
pub mod transport;
pub mod util;
pub use transport::{CdpTransport, ChromiumTransport, CommandTarget, TransportEvent};
