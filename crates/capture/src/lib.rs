//! Frame-accurate recording of a headless page.
//!
//! A [`CaptureSession`] attaches to a page, virtualizes the page's clocks and timers, and steps the
//! renderer one frame per logical tick with `HeadlessExperimental.beginFrame`. Each screenshot is
//! streamed into an ffmpeg process. Recording speed is bounded by the round trip of each step, never
//! by wall-clock time, so the output is the same on a fast or a slow machine.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cdp_adapter::{ChromiumPage, ChromiumTransport, CdpConfig, CdpTransport};
//! use framecast_capture::{capture, CaptureOptions, StartOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = cdp_adapter::launch::capture_config(CdpConfig::default());
//! let transport: Arc<dyn CdpTransport> = Arc::new(ChromiumTransport::new(cfg));
//! let page = ChromiumPage::open(transport).await?;
//! let session = capture(page.clone(), CaptureOptions::default()).await?;
//! session.start(std::path::PathBuf::from("out/capture.mp4"), StartOptions::default()).await?;
//! page.navigate("https://example.com").await?;
//! session.wait_for_timeout(1000.0).await?;
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod driver;
pub mod encoder;
pub mod errors;
pub mod events;
pub mod format;
pub mod metrics;
pub mod options;
pub mod session;
pub mod virtual_time;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use cdp_adapter::PageTarget;

pub use clock::{frame_interval, FrameClock};
pub use driver::{BeginFrameDriver, BeginFrameStrategy, CaptureStrategy, DriverState, FrameSink};
pub use encoder::{resolve_encoder, CaptureTarget, EncoderPipe, EncoderSettings};
pub use errors::{CaptureError, CaptureResult};
pub use events::{CaptureEvent, ListenerId};
pub use format::{mp4, EncoderCommand, OutputFormat, Preset};
pub use metrics::CaptureMetricsSnapshot;
pub use options::{CaptureOptions, StartOptions, DEFAULT_FPS};
pub use session::CaptureSession;

/// Create a session for `page`, attached unless `options.attach_on_create` is false.
pub async fn capture(
    page: Arc<dyn PageTarget>,
    options: CaptureOptions,
) -> CaptureResult<CaptureSession> {
    let attach = options.attach_on_create;
    let session = CaptureSession::new(options)?;
    if attach {
        session.attach(page).await?;
    }
    Ok(session)
}
