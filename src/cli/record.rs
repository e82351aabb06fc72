use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cdp_adapter::launch::capture_config;
use cdp_adapter::{CdpConfig, CdpTransport, ChromiumPage, ChromiumTransport};
use clap::Args;
use framecast::config::{parse_size, Config};
use framecast_capture::{
    capture, mp4, CaptureEvent, CaptureOptions, CaptureSession, Preset, StartOptions,
};
use serde_json::json;
use tracing::{info, warn};

use crate::cli::context::CliContext;
use crate::cli::env::OutputFormat;

#[derive(Args, Clone, Debug)]
pub struct RecordArgs {
    /// Page to record
    #[arg(short, long)]
    pub url: String,

    /// Output video file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Logical recording length (e.g. 1500ms, 5s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// Frames per second
    #[arg(long)]
    pub fps: Option<f64>,

    /// Frame size as WIDTHxHEIGHT
    #[arg(long)]
    pub size: Option<String>,

    /// chrome-headless-shell executable
    #[arg(long, value_name = "PATH")]
    pub chrome: Option<PathBuf>,

    /// ffmpeg executable
    #[arg(long, value_name = "PATH")]
    pub ffmpeg: Option<PathBuf>,

    /// x264 preset
    #[arg(long)]
    pub preset: Option<String>,

    /// Video codec
    #[arg(long)]
    pub codec: Option<String>,

    /// Capture frames without encoding them
    #[arg(long)]
    pub drop_frames: bool,
}

/// Flags merged over the loaded configuration.
#[derive(Clone, Debug, PartialEq)]
struct RecordPlan {
    url: String,
    output: PathBuf,
    duration: Duration,
    fps: f64,
    size: Option<String>,
    viewport: Option<(u32, u32)>,
    chrome: Option<PathBuf>,
    chrome_args: Vec<String>,
    no_sandbox: bool,
    ffmpeg: Option<PathBuf>,
    preset: Preset,
    codec: String,
    drop_frames: bool,
}

impl RecordPlan {
    fn resolve(args: RecordArgs, config: &Config) -> Result<Self> {
        let capture = &config.capture;
        let duration = match args.duration {
            Some(duration) => duration,
            None => humantime::parse_duration(&capture.duration)
                .with_context(|| format!("invalid capture.duration: {}", capture.duration))?,
        };
        let size = args.size.or_else(|| capture.size.clone());
        let viewport = size.as_deref().map(parse_size).transpose()?;
        let preset_name = args.preset.unwrap_or_else(|| capture.preset.clone());
        let preset = preset_name
            .parse::<Preset>()
            .map_err(anyhow::Error::msg)?;

        Ok(Self {
            url: args.url,
            output: args.output,
            duration,
            fps: args.fps.unwrap_or(capture.fps),
            size,
            viewport,
            chrome: args.chrome.or_else(|| config.browser.executable.clone()),
            chrome_args: config.browser.args.clone(),
            no_sandbox: config.browser.no_sandbox,
            ffmpeg: args.ffmpeg.or_else(|| capture.ffmpeg.clone()),
            preset,
            codec: args.codec.unwrap_or_else(|| capture.codec.clone()),
            drop_frames: args.drop_frames,
        })
    }

    fn cdp_config(&self) -> CdpConfig {
        let mut cfg = CdpConfig::default();
        if let Some(chrome) = &self.chrome {
            cfg.executable = chrome.clone();
        }
        cfg.no_sandbox |= self.no_sandbox;
        cfg.args.extend(self.chrome_args.iter().cloned());
        capture_config(cfg)
    }

    fn capture_options(&self) -> CaptureOptions {
        let mut options = CaptureOptions::default()
            .with_fps(self.fps)
            .with_format(mp4(self.preset, &self.codec));
        if let Some(size) = &self.size {
            options = options.with_size(size.clone());
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            options = options.with_encoder_path(ffmpeg.clone());
        }
        options
    }
}

struct RecordSummary {
    captured: u64,
    recorded: u64,
    timestamp: f64,
}

pub async fn cmd_record(args: RecordArgs, ctx: &CliContext, output: OutputFormat) -> Result<()> {
    let plan = RecordPlan::resolve(args, ctx.config())?;
    info!(
        target: "framecast",
        url = %plan.url,
        output = %plan.output.display(),
        fps = plan.fps,
        duration = ?plan.duration,
        "recording"
    );

    let transport = Arc::new(ChromiumTransport::new(plan.cdp_config()));
    let outcome = record(&plan, transport.clone()).await;
    transport.close().await;
    let summary = outcome?;

    match output {
        OutputFormat::Human => println!(
            "Recorded {} of {} captured frames ({:.0} ms) to {}",
            summary.recorded,
            summary.captured,
            summary.timestamp,
            plan.output.display()
        ),
        OutputFormat::Json => println!(
            "{}",
            json!({
                "output": plan.output,
                "captured_frames": summary.captured,
                "recorded_frames": summary.recorded,
                "capture_timestamp": summary.timestamp,
            })
        ),
    }
    Ok(())
}

async fn record(plan: &RecordPlan, transport: Arc<ChromiumTransport>) -> Result<RecordSummary> {
    let page = ChromiumPage::open(transport as Arc<dyn CdpTransport>)
        .await
        .context("Failed to open a browser page")?;
    if let Some((width, height)) = plan.viewport {
        page.set_viewport(width, height)
            .await
            .context("Failed to set viewport")?;
    }

    let session = capture(page.clone(), plan.capture_options())
        .await
        .context("Failed to attach capture session")?;
    session.on(|event| {
        if let CaptureEvent::FrameCaptureFailed { reason } = event {
            warn!(target: "framecast", %reason, "frame capture failed");
        }
    });

    let recorded = run_capture(plan, &session, &page).await;
    if session.is_capturing() {
        if let Err(err) = session.stop().await {
            warn!(target: "framecast", %err, "stop after failed recording reported an error");
        }
    }
    if session.page().is_some() {
        if let Err(err) = session.detach().await {
            warn!(target: "framecast", %err, "detach failed");
        }
    }
    if let Err(err) = page.close().await {
        warn!(target: "framecast", %err, "failed to close page");
    }
    page.shutdown().await;
    recorded?;

    Ok(RecordSummary {
        captured: session.captured_frames(),
        recorded: session.recorded_frames(),
        timestamp: session.capture_timestamp(),
    })
}

async fn run_capture(
    plan: &RecordPlan,
    session: &CaptureSession,
    page: &ChromiumPage,
) -> Result<()> {
    session
        .start(
            plan.output.clone(),
            StartOptions::default().drop_captured_frames(plan.drop_frames),
        )
        .await
        .context("Failed to start capture")?;
    page.navigate(&plan.url)
        .await
        .with_context(|| format!("Failed to navigate to {}", plan.url))?;
    session
        .wait_for_timeout(plan.duration.as_secs_f64() * 1000.0)
        .await
        .context("Capture ended early")?;
    session.stop().await.context("Failed to finish capture")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(url: &str) -> RecordArgs {
        RecordArgs {
            url: url.to_string(),
            output: PathBuf::from("out/page.mp4"),
            duration: None,
            fps: None,
            size: None,
            chrome: None,
            ffmpeg: None,
            preset: None,
            codec: None,
            drop_frames: false,
        }
    }

    #[test]
    fn config_fills_missing_flags() {
        let mut config = Config::default();
        config.capture.fps = 24.0;
        config.capture.size = Some("800x600".into());
        config.capture.duration = "1500ms".into();
        config.browser.args = vec!["--hide-scrollbars".into()];

        let plan = RecordPlan::resolve(args("https://example.com"), &config).unwrap();
        assert_eq!(plan.fps, 24.0);
        assert_eq!(plan.viewport, Some((800, 600)));
        assert_eq!(plan.duration, Duration::from_millis(1500));
        assert_eq!(plan.preset, Preset::Ultrafast);
        assert_eq!(plan.codec, "libx264");

        let cdp = plan.cdp_config();
        assert!(cdp.headless);
        assert_eq!(cdp.args[0], "--hide-scrollbars");
        assert!(cdp.args.iter().any(|arg| arg == "--enable-begin-frame-control"));
    }

    #[test]
    fn flags_override_config() {
        let mut flags = args("https://example.com");
        flags.fps = Some(30.0);
        flags.size = Some("1280x720".into());
        flags.duration = Some(Duration::from_secs(2));
        flags.preset = Some("veryslow".into());
        flags.ffmpeg = Some(PathBuf::from("/opt/ffmpeg"));

        let mut config = Config::default();
        config.capture.ffmpeg = Some(PathBuf::from("/usr/bin/ffmpeg"));
        let plan = RecordPlan::resolve(flags, &config).unwrap();
        assert_eq!(plan.fps, 30.0);
        assert_eq!(plan.viewport, Some((1280, 720)));
        assert_eq!(plan.duration, Duration::from_secs(2));
        assert_eq!(plan.preset, Preset::Veryslow);

        let options = plan.capture_options();
        assert_eq!(options.encoder_path, Some(PathBuf::from("/opt/ffmpeg")));
        assert_eq!(options.size.as_deref(), Some("1280x720"));
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let mut flags = args("https://example.com");
        flags.preset = Some("warp".into());
        let err = RecordPlan::resolve(flags, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("warp"));
    }
}
