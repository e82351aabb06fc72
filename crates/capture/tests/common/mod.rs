#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
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

/// A page that answers begin-frame requests from a script of replies.
pub struct ScriptedPage {
    id: PageId,
    closed: AtomicBool,
    reason: Mutex<Option<PageSignal>>,
    signals: broadcast::Sender<PageSignal>,
    commands: Mutex<Vec<(String, Value)>>,
    frames: Mutex<VecDeque<FrameReply>>,
    frame_delay: Mutex<Duration>,
    scripts: AtomicUsize,
}

impl ScriptedPage {
    pub fn new() -> Arc<Self> {
        let (signals, _) = broadcast::channel(8);
        Arc::new(Self {
            id: PageId::new(),
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
            signals,
            commands: Mutex::new(Vec::new()),
            frames: Mutex::new(VecDeque::new()),
            frame_delay: Mutex::new(Duration::from_millis(1)),
            scripts: AtomicUsize::new(0),
        })
    }

    pub fn set_frame_delay(&self, delay: Duration) {
        *self.frame_delay.lock() = delay;
    }

    pub fn push_frame(&self, reply: FrameReply) {
        self.frames.lock().push_back(reply);
    }

    pub fn count(&self, method: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    pub fn expressions(&self) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter(|(name, _)| name == "Runtime.evaluate")
            .filter_map(|(_, params)| params["expression"].as_str().map(str::to_string))
            .collect()
    }

    pub fn close(&self) {
        self.lose(PageSignal::Closed);
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
impl PageTarget for ScriptedPage {
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
        Some(BrowserProcess::new(
            "/opt/chrome-headless-shell/chrome-headless-shell",
            REQUIRED_ARGS.iter().map(|arg| arg.to_string()).collect(),
        ))
    }

    fn signals(&self) -> broadcast::Receiver<PageSignal> {
        self.signals.subscribe()
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        if self.is_closed() {
            return Err(AdapterError::new(AdapterErrorKind::TargetClosed));
        }
        self.commands.lock().push((method.to_string(), params));
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
        vec![1]
    }
}

/// Writes an executable shell script standing in for ffmpeg.
///
/// The default body copies stdin into the last argument, which is the output path. Outputs whose
/// file is named `fail.mp4` make it read one frame, complain on stderr and exit with code 3.
#[cfg(unix)]
pub fn fake_ffmpeg(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("ffmpeg");
    let body = r#"#!/bin/sh
for last; do :; done
case "$last" in
  */fail.mp4)
    head -c 3 > /dev/null
    echo "boom" >&2
    exit 3
    ;;
esac
cat > "$last"
"#;
    std::fs::write(&path, body).expect("write fake ffmpeg");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake ffmpeg");
    path
}

pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
