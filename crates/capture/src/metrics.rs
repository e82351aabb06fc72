use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{core::Collector, histogram_opts, Histogram, IntCounter, IntCounterVec, Registry};
use tracing::error;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureMetricsSnapshot {
    pub frames_captured: u64,
    pub frames_recorded: u64,
    pub frames_without_damage: u64,
    pub capture_failures: u64,
    pub sticky_errors: u64,
}

static FRAMES_CAPTURED: AtomicU64 = AtomicU64::new(0);
static FRAMES_RECORDED: AtomicU64 = AtomicU64::new(0);
static FRAMES_WITHOUT_DAMAGE: AtomicU64 = AtomicU64::new(0);
static CAPTURE_FAILURES: AtomicU64 = AtomicU64::new(0);
static STICKY_ERRORS: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref FRAMES_CAPTURED_TOTAL: IntCounter = IntCounter::new(
        "framecast_frames_captured_total",
        "Frames harvested from stepped rendering"
    )
    .unwrap();
    static ref FRAMES_RECORDED_TOTAL: IntCounter = IntCounter::new(
        "framecast_frames_recorded_total",
        "Frames handed to the encoder"
    )
    .unwrap();
    static ref FRAMES_WITHOUT_DAMAGE_TOTAL: IntCounter = IntCounter::new(
        "framecast_frames_without_damage_total",
        "Begin-frame replies without a screenshot"
    )
    .unwrap();
    static ref CAPTURE_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("framecast_capture_failures_total", "Asynchronous capture failures"),
        &["kind"]
    )
    .unwrap();
    static ref STICKY_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "framecast_sticky_errors_total",
        "Failures parked for the next stop()"
    )
    .unwrap();
    static ref BEGIN_FRAME_DURATION: Histogram = Histogram::with_opts(histogram_opts!(
        "framecast_begin_frame_duration_seconds",
        "Round trip of one stepped render",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]
    ))
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(target: "framecast-capture", ?err, "failed to register capture metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, FRAMES_CAPTURED_TOTAL.clone());
    register(registry, FRAMES_RECORDED_TOTAL.clone());
    register(registry, FRAMES_WITHOUT_DAMAGE_TOTAL.clone());
    register(registry, CAPTURE_FAILURES_TOTAL.clone());
    register(registry, STICKY_ERRORS_TOTAL.clone());
    register(registry, BEGIN_FRAME_DURATION.clone());
}

pub fn record_frame_captured(duration: Duration) {
    FRAMES_CAPTURED.fetch_add(1, Ordering::Relaxed);
    FRAMES_CAPTURED_TOTAL.inc();
    BEGIN_FRAME_DURATION.observe(duration.as_secs_f64());
}

pub fn record_frame_recorded() {
    FRAMES_RECORDED.fetch_add(1, Ordering::Relaxed);
    FRAMES_RECORDED_TOTAL.inc();
}

pub fn record_no_damage() {
    FRAMES_WITHOUT_DAMAGE.fetch_add(1, Ordering::Relaxed);
    FRAMES_WITHOUT_DAMAGE_TOTAL.inc();
}

pub fn record_failure(kind: &str) {
    CAPTURE_FAILURES.fetch_add(1, Ordering::Relaxed);
    CAPTURE_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_sticky_error() {
    STICKY_ERRORS.fetch_add(1, Ordering::Relaxed);
    STICKY_ERRORS_TOTAL.inc();
}

pub fn snapshot() -> CaptureMetricsSnapshot {
    CaptureMetricsSnapshot {
        frames_captured: FRAMES_CAPTURED.load(Ordering::Relaxed),
        frames_recorded: FRAMES_RECORDED.load(Ordering::Relaxed),
        frames_without_damage: FRAMES_WITHOUT_DAMAGE.load(Ordering::Relaxed),
        capture_failures: CAPTURE_FAILURES.load(Ordering::Relaxed),
        sticky_errors: STICKY_ERRORS.load(Ordering::Relaxed),
    }
}
