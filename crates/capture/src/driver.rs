//! Stepped rendering loop.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use cdp_adapter::PageTarget;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::clock::FrameClock;
use crate::errors::{CaptureError, CaptureResult};
use crate::metrics;
use crate::virtual_time;

/// Produces one frame per call.
#[async_trait]
pub trait CaptureStrategy: Send + Sync {
    /// Prepare the page before the first frame.
    async fn enable(&self, page: &dyn PageTarget) -> CaptureResult<()>;

    async fn disable(&self, page: &dyn PageTarget) -> CaptureResult<()>;

    /// Render the frame presented at `timestamp`. `None` means the renderer had nothing new.
    async fn capture_frame(
        &self,
        page: &dyn PageTarget,
        timestamp: f64,
        interval: f64,
    ) -> CaptureResult<Option<Vec<u8>>>;
}

/// `HeadlessExperimental.beginFrame` with a PNG screenshot per frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct BeginFrameStrategy;

impl BeginFrameStrategy {
    async fn toggle(&self, page: &dyn PageTarget, method: &str) -> CaptureResult<()> {
        match page.send(method, json!({})).await {
            Ok(_) => Ok(()),
            // Newer headless shells dropped the domain toggle; beginFrame still works.
            Err(err) if err.is_method_not_found() => {
                debug!(target: "framecast-capture", method, "not supported, continuing");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl CaptureStrategy for BeginFrameStrategy {
    async fn enable(&self, page: &dyn PageTarget) -> CaptureResult<()> {
        self.toggle(page, "HeadlessExperimental.enable").await
    }

    async fn disable(&self, page: &dyn PageTarget) -> CaptureResult<()> {
        self.toggle(page, "HeadlessExperimental.disable").await
    }

    async fn capture_frame(
        &self,
        page: &dyn PageTarget,
        timestamp: f64,
        interval: f64,
    ) -> CaptureResult<Option<Vec<u8>>> {
        let mut params = json!({
            "frameTimeTicks": timestamp,
            "noDisplayUpdates": false,
            "screenshot": { "format": "png" },
        });
        if interval.is_finite() {
            params["interval"] = json!(interval);
        }
        let response = page
            .send("HeadlessExperimental.beginFrame", params)
            .await?;
        match response.get("screenshotData").and_then(Value::as_str) {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|err| CaptureError::protocol(format!("invalid screenshot data: {err}"))),
            None => Ok(None),
        }
    }
}

/// Receives the outcome of each step.
pub trait FrameSink: Send + Sync {
    /// Checked before every step.
    fn should_continue(&self) -> bool;

    fn on_frame_captured(&self, timestamp: f64, data: Vec<u8>);

    fn on_frame_capture_failed(&self, reason: CaptureError);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Stepping,
    Stopped,
    Failed,
}

/// One run of the stepping loop, from `start()` to `stop()` or the first failure.
pub struct BeginFrameDriver {
    state: Arc<Mutex<DriverState>>,
    handle: JoinHandle<DriverState>,
}

impl BeginFrameDriver {
    pub fn spawn(
        page: Arc<dyn PageTarget>,
        strategy: Arc<dyn CaptureStrategy>,
        clock: Arc<FrameClock>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let state = Arc::new(Mutex::new(DriverState::Idle));
        let handle = tokio::spawn(run(page, strategy, clock, sink, state.clone()));
        Self { state, handle }
    }

    pub fn state(&self) -> DriverState {
        *self.state.lock()
    }

    /// Wait for the step in flight, if any, and the loop to exit.
    pub async fn join(self) -> DriverState {
        match self.handle.await {
            Ok(state) => state,
            Err(err) => {
                warn!(target: "framecast-capture", ?err, "frame driver task aborted");
                DriverState::Failed
            }
        }
    }
}

async fn run(
    page: Arc<dyn PageTarget>,
    strategy: Arc<dyn CaptureStrategy>,
    clock: Arc<FrameClock>,
    sink: Arc<dyn FrameSink>,
    state: Arc<Mutex<DriverState>>,
) -> DriverState {
    let finish = |next: DriverState| {
        *state.lock() = next;
        next
    };

    loop {
        if !sink.should_continue() {
            return finish(DriverState::Stopped);
        }
        *state.lock() = DriverState::Stepping;

        let timestamp = clock.now();
        if let Err(err) = virtual_time::tick(page.as_ref(), timestamp).await {
            sink.on_frame_capture_failed(err.into());
            return finish(DriverState::Failed);
        }

        let started = Instant::now();
        match strategy
            .capture_frame(page.as_ref(), timestamp, clock.interval())
            .await
        {
            Ok(Some(data)) => {
                metrics::record_frame_captured(started.elapsed());
                trace!(target: "framecast-capture", timestamp, bytes = data.len(), "frame captured");
                sink.on_frame_captured(timestamp, data);
                clock.advance();
            }
            Ok(None) => {
                metrics::record_no_damage();
                trace!(target: "framecast-capture", timestamp, "no damage, retrying");
                tokio::task::yield_now().await;
            }
            Err(err) => {
                sink.on_frame_capture_failed(err);
                return finish(DriverState::Failed);
            }
        }
    }
}
