//! ffmpeg subprocess fed with still images over stdin.

use std::collections::VecDeque;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{CaptureError, CaptureResult};
use crate::format::{EncoderCommand, OutputFormat};

const STDERR_TAIL: usize = 8;

/// Where the encoded output goes.
pub enum CaptureTarget {
    Path(PathBuf),
    Sink(Box<dyn AsyncWrite + Send + Unpin>),
}

impl CaptureTarget {
    pub fn sink<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        CaptureTarget::Sink(Box::new(writer))
    }
}

impl From<PathBuf> for CaptureTarget {
    fn from(path: PathBuf) -> Self {
        CaptureTarget::Path(path)
    }
}

impl From<&Path> for CaptureTarget {
    fn from(path: &Path) -> Self {
        CaptureTarget::Path(path.to_path_buf())
    }
}

impl fmt::Debug for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureTarget::Path(path) => f.debug_tuple("Path").field(path).finish(),
            CaptureTarget::Sink(_) => f.write_str("Sink(..)"),
        }
    }
}

/// Locate the encoder: explicit path, `FFMPEG`, `PATH`, then next to the running binary.
pub fn resolve_encoder(explicit: Option<&Path>) -> CaptureResult<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(raw) = env::var("FFMPEG") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    if let Ok(path) = which::which("ffmpeg") {
        return Ok(path);
    }

    if let Some(bundled) = bundled_encoder() {
        return Ok(bundled);
    }

    Err(CaptureError::configuration(
        "ffmpeg not available: specify FFMPEG environment variable, set encoder_path, or make it available via PATH",
    ))
}

fn bundled_encoder() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    let dir = exe.parent()?;
    let name = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };
    let candidate = dir.join(name);
    candidate.is_file().then_some(candidate)
}

/// Everything needed to launch one encoder run.
#[derive(Clone, Debug)]
pub struct EncoderSettings {
    pub executable: PathBuf,
    pub fps: f64,
    pub size: Option<String>,
    pub format: Option<OutputFormat>,
    pub custom: Option<OutputFormat>,
}

impl EncoderSettings {
    pub fn command(&self, output: impl Into<String>) -> EncoderCommand {
        let mut command = EncoderCommand::new(self.fps, self.size.clone(), output);
        if let Some(format) = &self.format {
            format.apply(&mut command);
        }
        if let Some(custom) = &self.custom {
            custom.apply(&mut command);
        }
        command
    }
}

/// Called at most once, from a background task, when the encoder fails on its own.
pub type FailureHook = Arc<dyn Fn(CaptureError) + Send + Sync>;

type Terminal = Option<Result<(), CaptureError>>;

pub struct EncoderPipe {
    frames: Option<mpsc::UnboundedSender<Vec<u8>>>,
    terminal: watch::Receiver<Terminal>,
    closing: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EncoderPipe {
    /// Spawn the encoder. Returns once the process is running and its stdin is being drained.
    pub async fn start(
        settings: &EncoderSettings,
        target: CaptureTarget,
        on_failure: FailureHook,
    ) -> CaptureResult<Self> {
        let (output, sink) = match target {
            CaptureTarget::Path(path) => (path.to_string_lossy().into_owned(), None),
            CaptureTarget::Sink(sink) => ("pipe:1".to_string(), Some(sink)),
        };
        let args = settings.command(output).to_args();
        debug!(
            target: "framecast-encoder",
            executable = %settings.executable.display(),
            args = ?args,
            "spawning encoder"
        );

        let mut child = Command::new(&settings.executable)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(if sink.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                CaptureError::encoder(format!(
                    "failed to spawn encoder {}: {err}",
                    settings.executable.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::encoder("encoder stdin unavailable"))?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let write_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let stderr_tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(feed_stdin(stdin, frames_rx, write_error.clone())));

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, stderr_tail.clone())));

        let stdout_task = match (sink, child.stdout.take()) {
            (Some(mut sink), Some(mut stdout)) => Some(tokio::spawn(async move {
                let copied = tokio::io::copy(&mut stdout, &mut sink).await;
                if let Err(err) = copied {
                    warn!(target: "framecast-encoder", ?err, "failed to forward encoder output");
                }
                if let Err(err) = sink.shutdown().await {
                    debug!(target: "framecast-encoder", ?err, "output sink shutdown failed");
                }
            })),
            _ => None,
        };

        let (terminal_tx, terminal_rx) = watch::channel(None);
        let closing = Arc::new(AtomicBool::new(false));
        let reported = Arc::new(AtomicBool::new(false));
        tasks.push(tokio::spawn(supervise(
            child,
            stderr_task,
            stdout_task,
            write_error,
            stderr_tail,
            terminal_tx,
            closing.clone(),
            reported.clone(),
            on_failure,
        )));

        info!(target: "framecast-encoder", fps = settings.fps, "encoder started");
        Ok(Self {
            frames: Some(frames_tx),
            terminal: terminal_rx,
            closing,
            reported,
            tasks,
        })
    }

    /// Queue one image. Failures show up through the failure hook or `close`.
    pub fn write(&self, bytes: Vec<u8>) {
        if let Some(frames) = &self.frames {
            if frames.send(bytes).is_err() {
                debug!(target: "framecast-encoder", "frame dropped, encoder input closed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.terminal.borrow().is_none()
    }

    /// End the input and wait for the process to exit.
    ///
    /// A failure already delivered to the failure hook is not returned again.
    pub async fn close(&mut self) -> CaptureResult<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.frames.take();
        let mut terminal = self.terminal.clone();
        let outcome = loop {
            if let Some(outcome) = terminal.borrow_and_update().clone() {
                break outcome;
            }
            if terminal.changed().await.is_err() {
                break terminal
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| Err(CaptureError::encoder("encoder supervisor vanished")));
            }
        };
        self.tasks.clear();
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.reported.swap(true, Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

impl Drop for EncoderPipe {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn feed_stdin(
    mut stdin: ChildStdin,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    write_error: Arc<Mutex<Option<String>>>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = stdin.write_all(&frame).await {
            warn!(target: "framecast-encoder", ?err, "encoder input write failed");
            *write_error.lock() = Some(err.to_string());
            return;
        }
    }
    if let Err(err) = stdin.shutdown().await {
        debug!(target: "framecast-encoder", ?err, "encoder stdin shutdown failed");
    }
}

async fn drain_stderr(
    stderr: tokio::process::ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "framecast-encoder", "{line}");
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut child: Child,
    stderr_task: Option<JoinHandle<()>>,
    stdout_task: Option<JoinHandle<()>>,
    write_error: Arc<Mutex<Option<String>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    terminal: watch::Sender<Terminal>,
    closing: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
    on_failure: FailureHook,
) {
    let status = child.wait().await;
    if let Some(task) = stderr_task {
        let _ = task.await;
    }
    if let Some(task) = stdout_task {
        let _ = task.await;
    }

    let tail = stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join(" | ");
    let outcome = match status {
        Ok(status) if status.success() => match write_error.lock().take() {
            Some(err) => Err(CaptureError::encoder(format!(
                "encoder input failed: {err}"
            ))),
            None => Ok(()),
        },
        Ok(status) => Err(CaptureError::encoder(match status.code() {
            Some(code) if tail.is_empty() => format!("ffmpeg exited with code {code}"),
            Some(code) => format!("ffmpeg exited with code {code}: {tail}"),
            None => format!("ffmpeg was killed by signal: {tail}"),
        })),
        Err(err) => Err(CaptureError::encoder(format!(
            "failed to wait for encoder: {err}"
        ))),
    };

    match &outcome {
        Ok(()) => debug!(target: "framecast-encoder", "encoder exited cleanly"),
        Err(err) => warn!(target: "framecast-encoder", %err, "encoder failed"),
    }
    let _ = terminal.send(Some(outcome.clone()));

    // Once `close` has begun it reports the failure itself.
    if let Err(err) = outcome {
        if !closing.load(Ordering::SeqCst) && !reported.swap(true, Ordering::SeqCst) {
            on_failure(err);
        }
    }
}
