use std::path::PathBuf;

use anyhow::Result;
use cdp_adapter::detect_chrome_executable;
use cdp_adapter::launch::is_headless_shell;
use framecast::Config;
use framecast_capture::resolve_encoder;
use serde::Serialize;
use tracing::debug;

use crate::cli::context::CliContext;
use crate::cli::env::OutputFormat;

#[derive(Debug, Serialize)]
struct CheckReport {
    browser: Option<PathBuf>,
    headless_shell: bool,
    encoder: Option<PathBuf>,
    encoder_error: Option<String>,
    macos_unsupported: bool,
}

impl CheckReport {
    fn gather(config: &Config) -> Self {
        let browser = config
            .browser
            .executable
            .clone()
            .or_else(detect_chrome_executable);
        let headless_shell = browser.as_deref().map(is_headless_shell).unwrap_or(false);
        let (encoder, encoder_error) = match resolve_encoder(config.capture.ffmpeg.as_deref()) {
            Ok(path) => (Some(path), None),
            Err(err) => (None, Some(err.to_string())),
        };
        Self {
            browser,
            headless_shell,
            encoder,
            encoder_error,
            macos_unsupported: cfg!(target_os = "macos"),
        }
    }

    fn ready(&self) -> bool {
        self.headless_shell && self.encoder.is_some() && !self.macos_unsupported
    }
}

pub async fn cmd_check(ctx: &CliContext, output: OutputFormat) -> Result<()> {
    let report = CheckReport::gather(ctx.config());
    debug!(target: "framecast", ?report, "environment check");

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Human => {
            match &report.browser {
                Some(path) if report.headless_shell => {
                    println!("browser: {} (headless shell)", path.display())
                }
                Some(path) => println!(
                    "browser: {} (not chrome-headless-shell, stepped rendering unavailable)",
                    path.display()
                ),
                None => println!("browser: not found (set FRAMECAST_CHROME)"),
            }
            match (&report.encoder, &report.encoder_error) {
                (Some(path), _) => println!("encoder: {}", path.display()),
                (None, Some(err)) => println!("encoder: {err}"),
                (None, None) => println!("encoder: not found"),
            }
            if report.macos_unsupported {
                println!("platform: MacOS is not supported by HeadlessExperimental.BeginFrame");
            }
            println!("ready: {}", if report.ready() { "yes" } else { "no" });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_paths_are_reported() {
        let mut config = Config::default();
        config.browser.executable =
            Some(PathBuf::from("/opt/chrome-headless-shell/chrome-headless-shell"));
        config.capture.ffmpeg = Some(PathBuf::from("/opt/ffmpeg/ffmpeg"));

        let report = CheckReport::gather(&config);
        assert!(report.headless_shell);
        assert_eq!(report.encoder, Some(PathBuf::from("/opt/ffmpeg/ffmpeg")));
        assert_eq!(report.ready(), !cfg!(target_os = "macos"));
    }

    #[test]
    fn regular_chrome_is_not_ready() {
        let mut config = Config::default();
        config.browser.executable = Some(PathBuf::from("/usr/bin/google-chrome"));
        config.capture.ffmpeg = Some(PathBuf::from("/opt/ffmpeg/ffmpeg"));

        let report = CheckReport::gather(&config);
        assert!(!report.headless_shell);
        assert!(!report.ready());
    }
}
