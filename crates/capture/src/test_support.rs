use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use cdp_adapter::{
    AdapterError, AdapterErrorKind, BrowserProcess, PageId, PageSignal, PageTarget, REQUIRED_ARGS,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

pub enum FrameReply {
    Image(Vec<u8>),
    NoDamage,
    Fail(AdapterError),
}

/// In-memory page that records commands and scripts begin-frame replies.
pub struct MockPage {
    id: PageId,
    closed: AtomicBool,
    reason: Mutex<Option<PageSignal>>,
    signals: broadcast::Sender<PageSignal>,
    contexts: Mutex<Vec<i64>>,
    process: Mutex<Option<BrowserProcess>>,
    commands: Mutex<Vec<(String, Value)>>,
    frames: Mutex<VecDeque<FrameReply>>,
    failures: Mutex<HashMap<String, AdapterError>>,
    frame_delay: Mutex<Duration>,
    scripts: AtomicUsize,
}

pub fn headless_shell_process() -> BrowserProcess {
    BrowserProcess::new(
        "/opt/chrome-headless-shell/chrome-headless-shell",
        REQUIRED_ARGS.iter().map(|arg| arg.to_string()).collect(),
    )
}

impl MockPage {
    pub fn new() -> Arc<Self> {
        let (signals, _) = broadcast::channel(8);
        Arc::new(Self {
            id: PageId::new(),
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
            signals,
            contexts: Mutex::new(vec![1]),
            process: Mutex::new(Some(headless_shell_process())),
            commands: Mutex::new(Vec::new()),
            frames: Mutex::new(VecDeque::new()),
            failures: Mutex::new(HashMap::new()),
            frame_delay: Mutex::new(Duration::from_millis(1)),
            scripts: AtomicUsize::new(0),
        })
    }

    pub fn set_contexts(&self, contexts: Vec<i64>) {
        *self.contexts.lock() = contexts;
    }

    pub fn set_process(&self, process: Option<BrowserProcess>) {
        *self.process.lock() = process;
    }

    pub fn set_frame_delay(&self, delay: Duration) {
        *self.frame_delay.lock() = delay;
    }

    pub fn push_frame(&self, reply: FrameReply) {
        self.frames.lock().push_back(reply);
    }

    pub fn fail(&self, method: &str, err: AdapterError) {
        self.failures.lock().insert(method.to_string(), err);
    }

    pub fn commands(&self) -> Vec<(String, Value)> {
        self.commands.lock().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    pub fn close(&self) {
        self.lose(PageSignal::Closed);
    }

    /// Closed without telling any watcher.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        self.lose(PageSignal::Disconnected);
    }

    fn lose(&self, signal: PageSignal) {
        *self.reason.lock() = Some(signal);
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.signals.send(signal);
    }
}

#[async_trait]
impl PageTarget for MockPage {
    fn id(&self) -> PageId {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close_reason(&self) -> Option<PageSignal> {
        *self.reason.lock()
    }

    async fn process(&self) -> Option<BrowserProcess> {
        self.process.lock().clone()
    }

    fn signals(&self) -> broadcast::Receiver<PageSignal> {
        self.signals.subscribe()
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        if self.is_closed() {
            return Err(AdapterError::new(AdapterErrorKind::TargetClosed).with_hint("page is closed"));
        }
        self.commands.lock().push((method.to_string(), params));
        if let Some(err) = self.failures.lock().get(method) {
            return Err(err.clone());
        }
        match method {
            "HeadlessExperimental.beginFrame" => {
                let delay = *self.frame_delay.lock();
                tokio::time::sleep(delay).await;
                let reply = self
                    .frames
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| FrameReply::Image(b"png".to_vec()));
                match reply {
                    FrameReply::Image(bytes) => Ok(json!({
                        "hasDamage": true,
                        "screenshotData": base64::engine::general_purpose::STANDARD.encode(bytes),
                    })),
                    FrameReply::NoDamage => Ok(json!({ "hasDamage": false })),
                    FrameReply::Fail(err) => Err(err),
                }
            }
            "Page.addScriptToEvaluateOnNewDocument" => {
                let n = self.scripts.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "identifier": format!("script-{n}") }))
            }
            "Runtime.evaluate" => Ok(json!({ "result": { "type": "undefined" } })),
            _ => Ok(json!({})),
        }
    }

    fn execution_contexts(&self) -> Vec<i64> {
        self.contexts.lock().clone()
    }
}
