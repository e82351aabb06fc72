//! Capture lifecycle: attach, start, stop, detach, and absorbing asynchronous failures.
//!
//! Every transition runs under one async lock. Failures from the frame driver, the encoder and the
//! page land in a single sticky slot; a background task then force-stops (and, when the page is
//! gone, detaches) under the same lock. The next `stop()` hands the failure to the caller.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use cdp_adapter::launch::validate_process;
use cdp_adapter::{PageId, PageTarget, SessionId};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::FrameClock;
use crate::driver::{BeginFrameDriver, BeginFrameStrategy, CaptureStrategy, FrameSink};
use crate::encoder::{resolve_encoder, CaptureTarget, EncoderPipe, EncoderSettings, FailureHook};
use crate::errors::{CaptureError, CaptureResult};
use crate::events::{CaptureEvent, Listener, ListenerId, Listeners};
use crate::format::OutputFormat;
use crate::metrics;
use crate::options::{CaptureOptions, StartOptions};
use crate::virtual_time;

struct Attachment {
    page: Arc<dyn PageTarget>,
    script_id: Option<String>,
    watcher: JoinHandle<()>,
}

struct ActiveCapture {
    encoder: EncoderPipe,
    driver: Option<BeginFrameDriver>,
}

/// Where a parked failure came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Frame,
    Encoder,
    /// The attached page went away; cleanup also detaches it.
    Page(PageId),
}

struct Parked {
    error: CaptureError,
    origin: Origin,
}

struct SessionConfig {
    fps: f64,
    size: Option<String>,
    format: Option<OutputFormat>,
    custom: Option<OutputFormat>,
    encoder_path: Option<PathBuf>,
}

struct Inner {
    id: SessionId,
    me: Weak<Inner>,
    config: SessionConfig,
    strategy: Arc<dyn CaptureStrategy>,
    clock: Arc<FrameClock>,
    lifecycle: AsyncMutex<()>,
    attachment: Mutex<Option<Attachment>>,
    active: Mutex<Option<ActiveCapture>>,
    capturing: AtomicBool,
    /// Bumped by every `start()`; background cleanup only stops the run it was raised for.
    run: AtomicU64,
    drop_captured_frames: AtomicBool,
    captured_frames: AtomicU64,
    recorded_frames: AtomicU64,
    sticky: Mutex<Option<Parked>>,
    listeners: Listeners,
}

/// Records one page at a time into an encoder.
pub struct CaptureSession {
    inner: Arc<Inner>,
}

impl CaptureSession {
    pub fn new(options: CaptureOptions) -> CaptureResult<Self> {
        Self::with_strategy(options, Arc::new(BeginFrameStrategy))
    }

    pub fn with_strategy(
        options: CaptureOptions,
        strategy: Arc<dyn CaptureStrategy>,
    ) -> CaptureResult<Self> {
        let fps = options.resolved_fps()?;
        let config = SessionConfig {
            fps,
            size: options.size,
            format: options.format,
            custom: options.custom_encoder_config,
            encoder_path: options.encoder_path,
        };
        let inner = Arc::new_cyclic(|me| Inner {
            id: SessionId::new(),
            me: me.clone(),
            config,
            strategy,
            clock: Arc::new(FrameClock::new(fps)),
            lifecycle: AsyncMutex::new(()),
            attachment: Mutex::new(None),
            active: Mutex::new(None),
            capturing: AtomicBool::new(false),
            run: AtomicU64::new(0),
            drop_captured_frames: AtomicBool::new(false),
            captured_frames: AtomicU64::new(0),
            recorded_frames: AtomicU64::new(0),
            sticky: Mutex::new(None),
            listeners: Listeners::default(),
        });
        Ok(Self { inner })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn page(&self) -> Option<Arc<dyn PageTarget>> {
        self.inner.page()
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.capturing.load(Ordering::SeqCst)
    }

    /// Logical milliseconds captured so far.
    pub fn capture_timestamp(&self) -> f64 {
        self.inner.clock.now()
    }

    pub fn captured_frames(&self) -> u64 {
        self.inner.captured_frames.load(Ordering::SeqCst)
    }

    pub fn recorded_frames(&self) -> u64 {
        self.inner.recorded_frames.load(Ordering::SeqCst)
    }

    pub fn drop_captured_frames(&self) -> bool {
        self.inner.drop_captured_frames.load(Ordering::SeqCst)
    }

    /// Takes effect from the next captured frame.
    pub fn set_drop_captured_frames(&self, drop: bool) {
        self.inner.drop_captured_frames.store(drop, Ordering::SeqCst);
    }

    pub fn fps(&self) -> f64 {
        self.inner.config.fps
    }

    pub fn frame_interval(&self) -> f64 {
        self.inner.clock.interval()
    }

    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CaptureEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Arc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub async fn attach(&self, page: Arc<dyn PageTarget>) -> CaptureResult<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.attach_locked(page).await
    }

    pub async fn detach(&self) -> CaptureResult<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.detach_locked().await
    }

    pub async fn start(&self, target: impl Into<CaptureTarget>, options: StartOptions) -> CaptureResult<()> {
        let options = options.resolve()?;
        let first_frame = {
            let _guard = self.inner.lifecycle.lock().await;
            self.inner
                .start_locked(target.into(), options.drop_captured_frames, options.wait_for_first_frame)
                .await?
        };

        match first_frame {
            Some(waiter) => self.inner.await_first_frame(waiter).await,
            None => Ok(()),
        }
    }

    pub async fn stop(&self) -> CaptureResult<()> {
        let pending = self.inner.sticky.lock().take().map(|parked| parked.error);
        if let Some(err) = pending {
            let _guard = self.inner.lifecycle.lock().await;
            if self.inner.capturing.load(Ordering::SeqCst) {
                if let Err(stop_err) = self.inner.stop_locked().await {
                    debug!(target: "framecast-capture", ?stop_err, "stop after failure reported an error");
                }
            }
            return Err(err);
        }

        let _guard = self.inner.lifecycle.lock().await;
        if !self.inner.capturing.load(Ordering::SeqCst) {
            return Err(CaptureError::precondition("Capture is not in progress"));
        }
        self.inner.stop_locked().await
    }

    /// Resolve once `ms` more logical milliseconds have been captured.
    pub async fn wait_for_timeout(&self, ms: f64) -> CaptureResult<()> {
        if !ms.is_finite() || ms < 0.0 {
            return Err(CaptureError::configuration(format!(
                "Timeout must be a finite, non-negative number of milliseconds, got {ms}"
            )));
        }
        if !self.is_capturing() {
            return Err(CaptureError::precondition(
                "Can not wait for timeout while not capturing",
            ));
        }
        let target = self.inner.clock.now() + ms;
        if self.inner.clock.now() >= target {
            return Ok(());
        }

        let interval = self.inner.clock.interval();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.on(move |event| match event {
            CaptureEvent::FrameCaptured { timestamp, .. } => {
                let _ = tx.send(Wake::Frame(*timestamp + interval));
            }
            CaptureEvent::FrameCaptureFailed { reason } => {
                let _ = tx.send(Wake::Failed(reason.clone()));
            }
            CaptureEvent::CaptureStopped => {
                let _ = tx.send(Wake::Stopped);
            }
            _ => {}
        });

        let outcome = if !self.is_capturing() {
            Err(self.inner.stopped_error())
        } else {
            loop {
                match rx.recv().await {
                    Some(Wake::Frame(reached)) => {
                        if reached.max(self.inner.clock.now()) >= target {
                            break Ok(());
                        }
                    }
                    Some(Wake::Failed(reason)) => break Err(reason),
                    Some(Wake::Stopped) | None => break Err(self.inner.stopped_error()),
                }
            }
        };
        self.off(id);
        outcome
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.inner.capturing.swap(false, Ordering::SeqCst) {
            warn!(target: "framecast-capture", session = ?self.inner.id, "session dropped while capturing");
        }
        if let Some(attachment) = self.inner.attachment.lock().take() {
            attachment.watcher.abort();
        }
    }
}

enum Wake {
    Frame(f64),
    Failed(CaptureError),
    Stopped,
}

struct FirstFrame {
    listener: ListenerId,
    outcome: mpsc::UnboundedReceiver<CaptureResult<()>>,
}

impl Inner {
    fn page(&self) -> Option<Arc<dyn PageTarget>> {
        self.attachment
            .lock()
            .as_ref()
            .map(|attachment| attachment.page.clone())
    }

    fn emit(&self, event: CaptureEvent) {
        debug!(target: "framecast-capture", event = event.name(), "emit");
        self.listeners.emit(&event);
    }

    fn stopped_error(&self) -> CaptureError {
        self.sticky
            .lock()
            .as_ref()
            .map(|parked| parked.error.clone())
            .unwrap_or_else(|| {
                CaptureError::lifecycle("Capture was stopped before the timeout elapsed")
            })
    }

    async fn attach_locked(&self, page: Arc<dyn PageTarget>) -> CaptureResult<()> {
        if self.attachment.lock().is_some() {
            return Err(CaptureError::precondition("Already attached to a page"));
        }

        if cfg!(target_os = "macos") {
            return Err(CaptureError::configuration(
                "MacOS is not supported by HeadlessExperimental.BeginFrame",
            ));
        }

        let process = page.process().await;
        validate_process(process.as_ref())?;

        let watcher = self.spawn_watcher(page.clone());
        let script_id = match virtual_time::install(page.as_ref()).await {
            Ok(id) => id,
            Err(err) => {
                watcher.abort();
                return Err(err.into());
            }
        };

        info!(target: "framecast-capture", session = ?self.id, page = ?page.id(), "attached");
        *self.attachment.lock() = Some(Attachment {
            page,
            script_id: Some(script_id),
            watcher,
        });
        Ok(())
    }

    async fn detach_locked(&self) -> CaptureResult<()> {
        if self.attachment.lock().is_none() {
            return Err(CaptureError::precondition("Already detached from a page"));
        }
        if self.capturing.load(Ordering::SeqCst) {
            return Err(CaptureError::precondition(
                "Can not detach while capture is in progress",
            ));
        }
        let Some(attachment) = self.attachment.lock().take() else {
            return Ok(());
        };
        attachment.watcher.abort();

        if let Some(script_id) = attachment.script_id {
            if !attachment.page.is_closed() {
                if let Err(err) = virtual_time::uninstall(attachment.page.as_ref(), &script_id).await {
                    warn!(target: "framecast-capture", ?err, "failed to remove virtual time script");
                }
            }
        }
        info!(target: "framecast-capture", session = ?self.id, page = ?attachment.page.id(), "detached");
        Ok(())
    }

    fn spawn_watcher(&self, page: Arc<dyn PageTarget>) -> JoinHandle<()> {
        let mut signals = page.signals();
        let page_id = page.id();
        let me = self.me.clone();
        tokio::spawn(async move {
            let signal = loop {
                match signals.recv().await {
                    Ok(signal) => break signal,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            };
            if let Some(inner) = me.upgrade() {
                inner.fail(CaptureError::page_lost(signal), Origin::Page(page_id));
            }
        })
    }

    /// Park `reason` for the next `stop()` and clean up in the background.
    ///
    /// The first failure wins, except that losing the page replaces a frame step failure: the step
    /// usually fails only because the page is already gone.
    fn fail(&self, reason: CaptureError, origin: Origin) {
        metrics::record_failure(reason.kind());
        warn!(target: "framecast-capture", session = ?self.id, error = %reason, ?origin, "capture failure");
        {
            let mut sticky = self.sticky.lock();
            let park = match sticky.as_ref() {
                None => {
                    metrics::record_sticky_error();
                    true
                }
                Some(parked) => {
                    parked.origin == Origin::Frame && matches!(origin, Origin::Page(_))
                }
            };
            if park {
                *sticky = Some(Parked {
                    error: reason,
                    origin,
                });
            }
        }

        let Some(inner) = self.me.upgrade() else {
            return;
        };
        let run = self.run.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let _guard = inner.lifecycle.lock().await;
            if inner.capturing.load(Ordering::SeqCst) && inner.run.load(Ordering::SeqCst) == run {
                if let Err(err) = inner.stop_locked().await {
                    debug!(target: "framecast-capture", ?err, "internal stop failed");
                }
            }
            let Origin::Page(page_id) = origin else {
                return;
            };
            let still_ours = inner
                .attachment
                .lock()
                .as_ref()
                .map(|attachment| attachment.page.id() == page_id)
                .unwrap_or(false);
            if still_ours {
                if let Err(err) = inner.detach_locked().await {
                    debug!(target: "framecast-capture", ?err, "internal detach failed");
                }
            }
        });
    }

    fn encoder_hook(&self) -> FailureHook {
        let me = self.me.clone();
        Arc::new(move |err| {
            if let Some(inner) = me.upgrade() {
                inner.fail(err, Origin::Encoder);
            }
        })
    }

    async fn start_locked(
        &self,
        target: CaptureTarget,
        drop_captured_frames: bool,
        wait_for_first_frame: bool,
    ) -> CaptureResult<Option<FirstFrame>> {
        let page = self
            .page()
            .ok_or_else(|| CaptureError::precondition("Not attached to a page"))?;
        if self.capturing.load(Ordering::SeqCst) {
            return Err(CaptureError::precondition("Capture is in progress"));
        }
        if page.is_closed() {
            return Err(CaptureError::precondition(
                "Can not start capturing a closed page",
            ));
        }
        if self.sticky.lock().is_some() {
            return Err(CaptureError::precondition(
                "A previous capture failed; call stop() to retrieve the error",
            ));
        }

        if let CaptureTarget::Path(path) = &target {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    CaptureError::configuration(format!(
                        "failed to create {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }

        let settings = EncoderSettings {
            executable: resolve_encoder(self.config.encoder_path.as_deref())?,
            fps: self.config.fps,
            size: self.config.size.clone(),
            format: self.config.format.clone(),
            custom: self.config.custom.clone(),
        };

        self.captured_frames.store(0, Ordering::SeqCst);
        self.recorded_frames.store(0, Ordering::SeqCst);
        self.clock.reset();
        self.drop_captured_frames
            .store(drop_captured_frames, Ordering::SeqCst);

        let encoder = EncoderPipe::start(&settings, target, self.encoder_hook()).await?;
        self.strategy.enable(page.as_ref()).await?;
        virtual_time::activate(page.as_ref(), self.clock.now()).await?;

        *self.active.lock() = Some(ActiveCapture {
            encoder,
            driver: None,
        });
        self.run.fetch_add(1, Ordering::SeqCst);
        self.capturing.store(true, Ordering::SeqCst);
        info!(
            target: "framecast-capture",
            session = ?self.id,
            fps = self.config.fps,
            drop_captured_frames,
            "capture started"
        );
        self.emit(CaptureEvent::CaptureStarted);

        let first_frame = wait_for_first_frame.then(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let me = self.me.clone();
            let id = self.listeners.add(Arc::new(move |event: &CaptureEvent| {
                let outcome = match event {
                    CaptureEvent::FrameCaptured { .. } => Ok(()),
                    CaptureEvent::FrameCaptureFailed { reason } => Err(reason.clone()),
                    CaptureEvent::CaptureStopped => Err(me
                        .upgrade()
                        .map(|inner| inner.stopped_error())
                        .unwrap_or_else(|| CaptureError::lifecycle("Capture was stopped"))),
                    _ => return,
                };
                let _ = tx.send(outcome);
            }) as Listener);
            FirstFrame {
                listener: id,
                outcome: rx,
            }
        });

        let me: Arc<Inner> = self
            .me
            .upgrade()
            .ok_or_else(|| CaptureError::lifecycle("Session was dropped"))?;
        let driver = BeginFrameDriver::spawn(
            page,
            self.strategy.clone(),
            self.clock.clone(),
            me as Arc<dyn FrameSink>,
        );
        if let Some(active) = self.active.lock().as_mut() {
            active.driver = Some(driver);
        }

        Ok(first_frame)
    }

    async fn await_first_frame(&self, mut waiter: FirstFrame) -> CaptureResult<()> {
        let outcome = waiter
            .outcome
            .recv()
            .await
            .unwrap_or_else(|| Err(CaptureError::lifecycle("Capture was stopped")));
        self.listeners.remove(waiter.listener);
        outcome
    }

    async fn stop_locked(&self) -> CaptureResult<()> {
        self.capturing.store(false, Ordering::SeqCst);

        let driver = self
            .active
            .lock()
            .as_mut()
            .and_then(|active| active.driver.take());
        if let Some(driver) = driver {
            let state = driver.join().await;
            debug!(target: "framecast-capture", ?state, "frame driver finished");
        }

        let mut first_error = None;
        let active = self.active.lock().take();
        if let Some(mut active) = active {
            if let Err(err) = active.encoder.close().await {
                first_error.get_or_insert(err);
            }
        }

        if let Some(page) = self.page() {
            if !page.is_closed() {
                if let Err(err) = virtual_time::deactivate(page.as_ref(), self.clock.interval()).await {
                    first_error.get_or_insert(err.into());
                }
                if let Err(err) = self.strategy.disable(page.as_ref()).await {
                    first_error.get_or_insert(err);
                }
            }
        }

        info!(
            target: "framecast-capture",
            session = ?self.id,
            captured = self.captured_frames.load(Ordering::SeqCst),
            recorded = self.recorded_frames.load(Ordering::SeqCst),
            timestamp = self.clock.now(),
            "capture stopped"
        );
        self.emit(CaptureEvent::CaptureStopped);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl FrameSink for Inner {
    fn should_continue(&self) -> bool {
        self.capturing.load(Ordering::SeqCst) && self.sticky.lock().is_none()
    }

    fn on_frame_captured(&self, timestamp: f64, data: Vec<u8>) {
        let data: Arc<[u8]> = Arc::from(data);
        let index = self.captured_frames.fetch_add(1, Ordering::SeqCst);
        self.emit(CaptureEvent::FrameCaptured {
            index,
            timestamp,
            data: data.clone(),
        });

        if self.drop_captured_frames.load(Ordering::SeqCst) {
            return;
        }
        let written = match self.active.lock().as_ref() {
            Some(active) => {
                active.encoder.write(data.to_vec());
                true
            }
            None => false,
        };
        if !written {
            return;
        }
        let index = self.recorded_frames.fetch_add(1, Ordering::SeqCst);
        metrics::record_frame_recorded();
        self.emit(CaptureEvent::FrameRecorded {
            index,
            timestamp,
            data,
        });
    }

    fn on_frame_capture_failed(&self, reason: CaptureError) {
        let lost = self
            .page()
            .and_then(|page| page.close_reason().map(|signal| (signal, page.id())));
        let (reason, origin) = match lost {
            Some((signal, page_id)) => (CaptureError::page_lost(signal), Origin::Page(page_id)),
            None => (reason, Origin::Frame),
        };
        self.emit(CaptureEvent::FrameCaptureFailed {
            reason: reason.clone(),
        });
        self.fail(reason, origin);
    }
}
