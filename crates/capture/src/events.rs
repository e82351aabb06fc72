use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::CaptureError;

/// Notifications emitted by a capture session, in the order they happen.
#[derive(Clone, Debug)]
pub enum CaptureEvent {
    CaptureStarted,
    FrameCaptured {
        index: u64,
        timestamp: f64,
        data: Arc<[u8]>,
    },
    FrameRecorded {
        index: u64,
        timestamp: f64,
        data: Arc<[u8]>,
    },
    FrameCaptureFailed {
        reason: CaptureError,
    },
    CaptureStopped,
}

impl CaptureEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CaptureEvent::CaptureStarted => "captureStarted",
            CaptureEvent::FrameCaptured { .. } => "frameCaptured",
            CaptureEvent::FrameRecorded { .. } => "frameRecorded",
            CaptureEvent::FrameCaptureFailed { .. } => "frameCaptureFailed",
            CaptureEvent::CaptureStopped => "captureStopped",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&CaptureEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Listener)>>,
}

impl Listeners {
    pub fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Call every listener registered at this point, in registration order.
    pub fn emit(&self, event: &CaptureEvent) {
        let snapshot: Vec<Listener> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }
}
