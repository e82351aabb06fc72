//! Websocket transport to a chrome-headless-shell launched by this process.
//!
//! One connection task owns the chromiumoxide [`Connection`]. It submits commands, settles replies
//! by call id and forwards every event, tagged with the flattened session it belongs to. A lost
//! connection is reported, never relaunched: pages and their sessions die with the browser that
//! created them.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::launch::{launch_args, BrowserProcess};
use crate::metrics::{self, CommandOutcome};
use crate::util::extract_ws_url;

#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    /// Flattened session the event was raised on; `None` for browser-level events.
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;
    /// Next protocol event; `None` once the connection is gone for good.
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;
    /// Spawned browser process, when the transport launched it.
    async fn process(&self) -> Option<BrowserProcess> {
        None
    }
}

enum Link {
    Idle,
    Up(Arc<Browser>),
    Closed,
}

/// Launches Chromium on first [`CdpTransport::start`] and talks to it over its DevTools socket.
pub struct ChromiumTransport {
    cfg: CdpConfig,
    link: Mutex<Link>,
}

impl ChromiumTransport {
    pub fn new(cfg: CdpConfig) -> Self {
        Self {
            cfg,
            link: Mutex::new(Link::Idle),
        }
    }

    pub fn config(&self) -> &CdpConfig {
        &self.cfg
    }

    async fn browser(&self) -> Result<Arc<Browser>, AdapterError> {
        match &*self.link.lock().await {
            Link::Up(browser) if browser.is_open() => Ok(browser.clone()),
            Link::Up(_) | Link::Closed => Err(connection_lost()),
            Link::Idle => Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint("transport has not been started")),
        }
    }

    /// Ask the browser to exit. Later commands fail with a connection error.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.link.lock().await, Link::Closed);
        let Link::Up(browser) = previous else {
            return;
        };
        if browser.is_open() {
            if let Err(err) = browser
                .call(CommandTarget::Browser, "Browser.close", json!({}))
                .await
            {
                debug!(target: "cdp-transport", ?err, "Browser.close failed");
            }
        }
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        let browser = {
            let mut link = self.link.lock().await;
            match &*link {
                Link::Up(browser) if browser.is_open() => return Ok(()),
                Link::Up(_) | Link::Closed => return Err(connection_lost()),
                Link::Idle => {}
            }
            let browser = Arc::new(Browser::launch(&self.cfg).await?);
            *link = Link::Up(browser.clone());
            browser
        };

        browser
            .call(
                CommandTarget::Browser,
                "Target.setDiscoverTargets",
                json!({ "discover": true }),
            )
            .await
            .map(|_| ())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        match self.browser().await {
            Ok(browser) => browser.next_event().await,
            Err(err) => {
                debug!(target: "cdp-transport", %err, "no event stream");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        self.browser().await?.call(target, method, params).await
    }

    async fn process(&self) -> Option<BrowserProcess> {
        match &*self.link.lock().await {
            Link::Up(browser) => Some(browser.process.clone()),
            Link::Idle | Link::Closed => None,
        }
    }
}

struct Call {
    target: CommandTarget,
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, AdapterError>>,
}

/// A launched browser and the task driving its connection.
struct Browser {
    calls: mpsc::UnboundedSender<Call>,
    events: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    open: Arc<AtomicBool>,
    task: JoinHandle<()>,
    child: std::sync::Mutex<Option<Child>>,
    process: BrowserProcess,
    command_timeout: Duration,
}

impl Browser {
    async fn launch(cfg: &CdpConfig) -> Result<Self, AdapterError> {
        let (config, process) = browser_config(cfg)?;
        let mut child = config.launch().map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("failed to launch chromium: {err}"))
        })?;
        let ws_url = extract_ws_url(&mut child).await?;
        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

        let (calls, call_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(
            ConnectionTask {
                conn,
                in_flight: InFlight::default(),
                events: event_tx,
            }
            .run(call_rx, open.clone()),
        );
        info!(
            target: "cdp-transport",
            url = %ws_url,
            executable = ?process.executable,
            "chromium connection established"
        );

        Ok(Self {
            calls,
            events: Mutex::new(events),
            open,
            task,
            child: std::sync::Mutex::new(Some(child)),
            process,
            command_timeout: Duration::from_millis(cfg.command_timeout_ms),
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn call(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let (reply, response) = oneshot::channel();
        self.calls
            .send(Call {
                target,
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| connection_lost())?;

        match tokio::time::timeout(self.command_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(connection_lost()),
            Err(_) => {
                metrics::record_command(method, CommandOutcome::TimedOut, self.command_timeout);
                Err(AdapterError::new(AdapterErrorKind::Timeout)
                    .with_hint(format!("{method} timed out"))
                    .retriable(true))
            }
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.task.abort();
        let child = self.child.get_mut().ok().and_then(Option::take);
        let Some(mut child) = child else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = child.kill().await {
                        warn!(target: "cdp-transport", ?err, "failed to kill chromium");
                    }
                });
            }
            Err(_) => debug!(target: "cdp-transport", "no runtime left to kill chromium"),
        }
    }
}

struct Pending {
    method: String,
    sent: Instant,
    reply: oneshot::Sender<Result<Value, AdapterError>>,
}

/// Commands submitted on the socket and not answered yet.
#[derive(Default)]
struct InFlight {
    calls: HashMap<CallId, Pending>,
}

impl InFlight {
    fn insert(&mut self, id: CallId, method: String, reply: oneshot::Sender<Result<Value, AdapterError>>) {
        self.calls.insert(
            id,
            Pending {
                method,
                sent: Instant::now(),
                reply,
            },
        );
    }

    fn settle(&mut self, response: Response) {
        let Some(pending) = self.calls.remove(&response.id) else {
            trace!(target: "cdp-transport", id = ?response.id, "reply for unknown call");
            return;
        };
        let result = reply_payload(response);
        let outcome = match &result {
            Ok(_) => CommandOutcome::Ok,
            Err(_) => CommandOutcome::Rejected,
        };
        metrics::record_command(&pending.method, outcome, pending.sent.elapsed());
        let _ = pending.reply.send(result);
    }

    /// Fail everything still waiting with `reason`.
    fn abandon(&mut self, reason: &AdapterError) {
        for (_, pending) in self.calls.drain() {
            metrics::record_command(
                &pending.method,
                CommandOutcome::ConnectionLost,
                pending.sent.elapsed(),
            );
            let _ = pending.reply.send(Err(reason.clone()));
        }
    }

    fn len(&self) -> usize {
        self.calls.len()
    }
}

struct ConnectionTask {
    conn: Connection<CdpEventMessage>,
    in_flight: InFlight,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ConnectionTask {
    async fn run(mut self, mut calls: mpsc::UnboundedReceiver<Call>, open: Arc<AtomicBool>) {
        let reason = loop {
            tokio::select! {
                call = calls.recv() => match call {
                    Some(call) => self.submit(call),
                    None => break connection_lost(),
                },
                message = self.conn.next() => match message {
                    Some(Ok(Message::Response(response))) => self.in_flight.settle(response),
                    Some(Ok(Message::Event(event))) => self.forward(event),
                    Some(Err(err)) => break connection_error(err),
                    None => break connection_lost(),
                },
            }
        };

        open.store(false, Ordering::SeqCst);
        warn!(
            target: "cdp-transport",
            error = %reason,
            pending = self.in_flight.len(),
            "chromium connection ended"
        );
        self.in_flight.abandon(&reason);
    }

    fn submit(&mut self, call: Call) {
        let session = match call.target {
            CommandTarget::Browser => None,
            CommandTarget::Session(id) => Some(CdpSessionId::from(id)),
        };
        let method_id: MethodId = call.method.clone().into();
        match self.conn.submit_command(method_id, session, call.params) {
            Ok(id) => self.in_flight.insert(id, call.method, call.reply),
            Err(err) => {
                metrics::record_command(&call.method, CommandOutcome::ConnectionLost, Duration::ZERO);
                let _ = call.reply.send(Err(
                    AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string())
                ));
            }
        }
    }

    fn forward(&mut self, event: CdpEventMessage) {
        let raw: CdpJsonEventMessage = match event.try_into() {
            Ok(raw) => raw,
            Err(err) => {
                debug!(target: "cdp-transport", ?err, "undecodable event dropped");
                return;
            }
        };
        // Receivers go away with the page; events for nobody are fine to drop.
        let _ = self.events.send(TransportEvent {
            method: raw.method.into_owned(),
            params: raw.params,
            session_id: raw.session_id,
        });
    }
}

fn browser_config(cfg: &CdpConfig) -> Result<(BrowserConfig, BrowserProcess), AdapterError> {
    if cfg.executable.as_os_str().is_empty() || !cfg.executable.exists() {
        return Err(AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!(
                "chrome executable not found at {}",
                cfg.executable.display()
            ))
            .with_data(json!({
                "expected": cfg.executable,
                "hint": "Set FRAMECAST_CHROME to the full path of chrome-headless-shell."
            })));
    }

    let profile_dir = if cfg.user_data_dir.is_absolute() {
        cfg.user_data_dir.clone()
    } else {
        std::env::current_dir()
            .map_err(|err| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint(format!("failed to resolve user-data-dir: {err}"))
            })?
            .join(&cfg.user_data_dir)
    };
    fs::create_dir_all(&profile_dir).map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("failed to create user-data-dir: {err}"))
    })?;

    let args = launch_args(cfg);
    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_millis(cfg.command_timeout_ms))
        .launch_timeout(Duration::from_secs(20))
        .args(args.clone())
        .chrome_executable(cfg.executable.clone())
        .user_data_dir(profile_dir);
    if !cfg.headless {
        builder = builder.with_head();
    }
    if cfg.no_sandbox {
        builder = builder.no_sandbox();
    }

    let config = builder.build().map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal).with_hint(format!("browser config error: {err}"))
    })?;
    Ok((config, BrowserProcess::new(cfg.executable.clone(), args)))
}

fn reply_payload(response: Response) -> Result<Value, AdapterError> {
    match (response.result, response.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(AdapterError::protocol(error.code, &error.message)),
        (None, None) => Err(AdapterError::new(AdapterErrorKind::Internal).with_hint("empty cdp response")),
    }
}

fn connection_error(err: CdpError) -> AdapterError {
    match err {
        CdpError::Timeout => AdapterError::new(AdapterErrorKind::Timeout)
            .with_hint("cdp connection timed out")
            .retriable(true),
        other => AdapterError::new(AdapterErrorKind::CdpIo).with_hint(other.to_string()),
    }
}

fn connection_lost() -> AdapterError {
    AdapterError::new(AdapterErrorKind::CdpIo).with_hint("cdp connection closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(value: Value) -> Response {
        serde_json::from_value(value).expect("response")
    }

    #[test]
    fn error_replies_keep_protocol_code() {
        let err = reply_payload(response(json!({
            "id": 7,
            "error": { "code": -32601, "message": "'HeadlessExperimental.enable' wasn't found" }
        })))
        .unwrap_err();
        assert!(err.is_method_not_found());
        assert_eq!(err.kind, AdapterErrorKind::CdpIo);
    }

    #[tokio::test]
    async fn settle_routes_reply_to_its_caller() {
        let mut in_flight = InFlight::default();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        in_flight.insert(CallId::new(1), "HeadlessExperimental.beginFrame".into(), first_tx);
        in_flight.insert(CallId::new(2), "Runtime.evaluate".into(), second_tx);

        let before = metrics::snapshot();
        in_flight.settle(response(json!({
            "id": 2,
            "error": { "code": -32000, "message": "Cannot find context with specified id" }
        })));
        in_flight.settle(response(json!({ "id": 1, "result": { "hasDamage": false } })));
        in_flight.settle(response(json!({ "id": 99, "result": {} })));

        assert_eq!(first_rx.await.unwrap().unwrap(), json!({ "hasDamage": false }));
        assert!(second_rx.await.unwrap().unwrap_err().is_missing_context());
        assert_eq!(in_flight.len(), 0);
        assert!(metrics::snapshot().begin_frames > before.begin_frames);
    }

    #[tokio::test]
    async fn abandon_fails_every_waiter() {
        let mut in_flight = InFlight::default();
        let (tx, rx) = oneshot::channel();
        in_flight.insert(CallId::new(3), "Page.navigate".into(), tx);
        in_flight.abandon(&connection_lost());
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::CdpIo);
        assert_eq!(in_flight.len(), 0);
    }

    #[tokio::test]
    async fn commands_need_a_started_transport() {
        let transport = ChromiumTransport::new(CdpConfig::default());
        let err = transport
            .send_command(CommandTarget::Browser, "Browser.getVersion", json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not been started"));
        assert!(transport.process().await.is_none());
        assert!(transport.next_event().await.is_none());
    }

    #[tokio::test]
    async fn missing_executable_fails_start_and_leaves_transport_idle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CdpConfig {
            executable: dir.path().join("chrome-headless-shell"),
            user_data_dir: dir.path().join("profile"),
            ..CdpConfig::default()
        };
        let transport = ChromiumTransport::new(cfg);
        let err = transport.start().await.unwrap_err();
        assert!(err.to_string().contains("chrome executable not found"));
        assert!(matches!(&*transport.link.lock().await, Link::Idle));
    }

    #[tokio::test]
    async fn closed_transport_cannot_restart() {
        let transport = ChromiumTransport::new(CdpConfig::default());
        transport.close().await;
        let err = transport.start().await.unwrap_err();
        assert!(err.to_string().contains("cdp connection closed"));
    }
}
