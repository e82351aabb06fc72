//! Protocol counters.
//!
//! Everything is exported through prometheus; a few totals are mirrored in atomics so tests and
//! the CLI can read them without a registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{core::Collector, histogram_opts, opts, HistogramVec, IntCounterVec, Registry};
use tracing::error;

/// How a command round trip ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok,
    /// The browser answered with an error object.
    Rejected,
    TimedOut,
    /// The connection went away before the reply.
    ConnectionLost,
}

impl CommandOutcome {
    fn label(self) -> &'static str {
        match self {
            CommandOutcome::Ok => "ok",
            CommandOutcome::Rejected => "rejected",
            CommandOutcome::TimedOut => "timed_out",
            CommandOutcome::ConnectionLost => "connection_lost",
        }
    }
}

const BEGIN_FRAME: &str = "HeadlessExperimental.beginFrame";

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterMetricsSnapshot {
    pub commands: u64,
    pub failed_commands: u64,
    pub begin_frames: u64,
    pub begin_frame_micros: u64,
    pub events: u64,
    pub page_signals: u64,
}

static COMMANDS: AtomicU64 = AtomicU64::new(0);
static FAILED_COMMANDS: AtomicU64 = AtomicU64::new(0);
static BEGIN_FRAMES: AtomicU64 = AtomicU64::new(0);
static BEGIN_FRAME_MICROS: AtomicU64 = AtomicU64::new(0);
static EVENTS: AtomicU64 = AtomicU64::new(0);
static PAGE_SIGNALS: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!("framecast_cdp_commands_total", "CDP commands by method and outcome"),
        &["method", "outcome"]
    )
    .unwrap();
    // Buckets straddle one frame at 60, 30 and 15 fps.
    static ref COMMAND_SECONDS: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "framecast_cdp_command_seconds",
            "CDP command round trip",
            vec![0.002, 0.004, 0.008, 0.016, 0.033, 0.066, 0.133, 0.5, 2.0]
        ),
        &["method"]
    )
    .unwrap();
    static ref EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!("framecast_cdp_events_total", "CDP events handled, by domain"),
        &["domain"]
    )
    .unwrap();
    static ref PAGE_SIGNALS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!("framecast_cdp_page_signals_total", "Pages lost, by signal"),
        &["signal"]
    )
    .unwrap();
}

pub fn register_metrics(registry: &Registry) {
    let collectors: [Box<dyn Collector>; 4] = [
        Box::new(COMMANDS_TOTAL.clone()),
        Box::new(COMMAND_SECONDS.clone()),
        Box::new(EVENTS_TOTAL.clone()),
        Box::new(PAGE_SIGNALS_TOTAL.clone()),
    ];
    for collector in collectors {
        match registry.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(err) => error!(target: "cdp-transport", ?err, "failed to register cdp metric"),
        }
    }
}

/// Count one settled command. Latency is only observed for answered commands.
pub fn record_command(method: &str, outcome: CommandOutcome, elapsed: Duration) {
    COMMANDS.fetch_add(1, Ordering::Relaxed);
    COMMANDS_TOTAL
        .with_label_values(&[method, outcome.label()])
        .inc();

    if outcome != CommandOutcome::Ok {
        FAILED_COMMANDS.fetch_add(1, Ordering::Relaxed);
    }
    if matches!(outcome, CommandOutcome::Ok | CommandOutcome::Rejected) {
        COMMAND_SECONDS
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    }
    if method == BEGIN_FRAME && outcome == CommandOutcome::Ok {
        BEGIN_FRAMES.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        BEGIN_FRAME_MICROS.fetch_add(micros, Ordering::Relaxed);
    }
}

pub fn record_event(method: &str) {
    let domain = method.split_once('.').map_or(method, |(domain, _)| domain);
    EVENTS.fetch_add(1, Ordering::Relaxed);
    EVENTS_TOTAL.with_label_values(&[domain]).inc();
}

pub fn record_page_signal(signal: &str) {
    PAGE_SIGNALS.fetch_add(1, Ordering::Relaxed);
    PAGE_SIGNALS_TOTAL.with_label_values(&[signal]).inc();
}

pub fn snapshot() -> AdapterMetricsSnapshot {
    AdapterMetricsSnapshot {
        commands: COMMANDS.load(Ordering::Relaxed),
        failed_commands: FAILED_COMMANDS.load(Ordering::Relaxed),
        begin_frames: BEGIN_FRAMES.load(Ordering::Relaxed),
        begin_frame_micros: BEGIN_FRAME_MICROS.load(Ordering::Relaxed),
        events: EVENTS.load(Ordering::Relaxed),
        page_signals: PAGE_SIGNALS.load(Ordering::Relaxed),
    }
}
