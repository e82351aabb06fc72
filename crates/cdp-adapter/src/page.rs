//! Page handle bound to a flattened CDP session.
//!
//! A [`ChromiumPage`] owns the event stream of its transport: it tracks the default execution
//! context of every frame and turns target teardown into [`PageSignal`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, AdapterErrorKind};
use crate::ids::PageId;
use crate::launch::BrowserProcess;
use crate::metrics;
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

/// Asynchronous notifications about the page going away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSignal {
    /// The target was destroyed (tab closed, browser exited).
    Closed,
    /// The protocol session to the target is gone while the target may still exist.
    Disconnected,
}

impl PageSignal {
    fn label(self) -> &'static str {
        match self {
            PageSignal::Closed => "closed",
            PageSignal::Disconnected => "disconnected",
        }
    }
}

/// What the capture engine needs from a page.
#[async_trait]
pub trait PageTarget: Send + Sync {
    fn id(&self) -> PageId;

    fn is_closed(&self) -> bool;

    /// Which signal took the page away, once one has.
    fn close_reason(&self) -> Option<PageSignal>;

    /// Browser process the page lives in, if known.
    async fn process(&self) -> Option<BrowserProcess>;

    fn signals(&self) -> broadcast::Receiver<PageSignal>;

    /// Send a command on the page's own session.
    async fn send(&self, method: &str, params: Value) -> Result<Value, AdapterError>;

    /// Default execution contexts of every live frame.
    fn execution_contexts(&self) -> Vec<i64>;
}

pub struct ChromiumPage {
    id: PageId,
    transport: Arc<dyn CdpTransport>,
    target_id: String,
    session_id: String,
    state: Arc<PageState>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

struct PageState {
    contexts: DashMap<i64, String>,
    closed: AtomicBool,
    reason: OnceLock<PageSignal>,
    signals: broadcast::Sender<PageSignal>,
}

impl PageState {
    fn raise(&self, signal: PageSignal) {
        // The reason is visible before the page reads as closed.
        if self.reason.set(signal).is_err() {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.contexts.clear();
        metrics::record_page_signal(signal.label());
        let _ = self.signals.send(signal);
    }
}

impl ChromiumPage {
    /// Create a blank target, attach a flattened session to it and start tracking its events.
    pub async fn open(transport: Arc<dyn CdpTransport>) -> Result<Arc<Self>, AdapterError> {
        transport.start().await?;

        let created = transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": "about:blank" }),
            )
            .await?;
        let target_id = string_field(&created, "targetId")?;

        let attached = transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = string_field(&attached, "sessionId")?;

        let (signals, _) = broadcast::channel(16);
        let page = Arc::new(Self {
            id: PageId::new(),
            transport,
            target_id,
            session_id,
            state: Arc::new(PageState {
                contexts: DashMap::new(),
                closed: AtomicBool::new(false),
                reason: OnceLock::new(),
                signals,
            }),
            shutdown: CancellationToken::new(),
            pump: Mutex::new(None),
        });

        // The pump must run before Runtime.enable so the initial contexts are seen.
        let handle = tokio::spawn(Self::event_pump(
            Arc::clone(&page.transport),
            page.target_id.clone(),
            page.session_id.clone(),
            Arc::clone(&page.state),
            page.shutdown.clone(),
        ));
        *page.pump.lock().await = Some(handle);

        page.send("Page.enable", json!({})).await?;
        page.send("Runtime.enable", json!({})).await?;

        info!(
            target: "cdp-page",
            page = ?page.id,
            target_id = %page.target_id,
            "page attached"
        );
        Ok(page)
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn navigate(&self, url: &str) -> Result<(), AdapterError> {
        let parsed = url::Url::parse(url).map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("invalid url '{url}': {err}"))
        })?;
        let response = self
            .send("Page.navigate", json!({ "url": parsed.as_str() }))
            .await?;
        if let Some(error_text) = response.get("errorText").and_then(Value::as_str) {
            return Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("navigation failed: {error_text}")));
        }
        Ok(())
    }

    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<(), AdapterError> {
        self.send(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn close(&self) -> Result<(), AdapterError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.transport
            .send_command(
                CommandTarget::Browser,
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
            )
            .await
            .map(|_| ())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.pump.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn event_pump(
        transport: Arc<dyn CdpTransport>,
        target_id: String,
        session_id: String,
        state: Arc<PageState>,
        shutdown: CancellationToken,
    ) {
        debug!(target: "cdp-page", %target_id, "event pump entered");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = transport.next_event() => {
                    match event {
                        Some(event) => {
                            Self::handle_event(&transport, &target_id, &session_id, &state, event).await;
                        }
                        None => {
                            warn!(target: "cdp-page", %target_id, "transport stream ended");
                            state.raise(PageSignal::Disconnected);
                            break;
                        }
                    }
                }
            }
        }
        debug!(target: "cdp-page", %target_id, "event pump exiting");
    }

    async fn handle_event(
        transport: &Arc<dyn CdpTransport>,
        target_id: &str,
        session_id: &str,
        state: &PageState,
        event: TransportEvent,
    ) {
        let ours = event.session_id.as_deref() == Some(session_id);
        match event.method.as_str() {
            "Runtime.executionContextCreated" if ours => {
                metrics::record_event(&event.method);
                let context = &event.params["context"];
                let is_default = context["auxData"]["isDefault"].as_bool().unwrap_or(true);
                if let (true, Some(id)) = (is_default, context["id"].as_i64()) {
                    let frame = context["auxData"]["frameId"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    state.contexts.insert(id, frame);
                }
            }
            "Runtime.executionContextDestroyed" if ours => {
                metrics::record_event(&event.method);
                if let Some(id) = event.params["executionContextId"].as_i64() {
                    state.contexts.remove(&id);
                }
            }
            "Runtime.executionContextsCleared" if ours => {
                metrics::record_event(&event.method);
                state.contexts.clear();
            }
            "Inspector.detached" if ours => {
                metrics::record_event(&event.method);
                state.raise(PageSignal::Disconnected);
            }
            "Target.targetDestroyed" => {
                if event.params["targetId"].as_str() == Some(target_id) {
                    metrics::record_event(&event.method);
                    state.raise(PageSignal::Closed);
                }
            }
            "Target.targetCrashed" => {
                if event.params["targetId"].as_str() == Some(target_id) {
                    metrics::record_event(&event.method);
                    state.raise(PageSignal::Closed);
                }
            }
            "Target.detachedFromTarget" => {
                if event.params["sessionId"].as_str() != Some(session_id) {
                    return;
                }
                metrics::record_event(&event.method);
                // Closing a tab detaches the session before the target is destroyed.
                let still_there = transport
                    .send_command(
                        CommandTarget::Browser,
                        "Target.getTargetInfo",
                        json!({ "targetId": target_id }),
                    )
                    .await
                    .is_ok();
                if still_there {
                    state.raise(PageSignal::Disconnected);
                } else {
                    state.raise(PageSignal::Closed);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl PageTarget for ChromiumPage {
    fn id(&self) -> PageId {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn close_reason(&self) -> Option<PageSignal> {
        self.state.reason.get().copied()
    }

    async fn process(&self) -> Option<BrowserProcess> {
        self.transport.process().await
    }

    fn signals(&self) -> broadcast::Receiver<PageSignal> {
        self.state.signals.subscribe()
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        if self.is_closed() {
            return Err(AdapterError::new(AdapterErrorKind::TargetClosed)
                .with_hint(format!("{method}: page is closed")));
        }
        self.transport
            .send_command(CommandTarget::Session(self.session_id.clone()), method, params)
            .await
    }

    fn execution_contexts(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.state.contexts.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn string_field(value: &Value, field: &str) -> Result<String, AdapterError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("response missing {field}"))
        })
}
