//! Topology change notifications

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// A new slot map was published
    SlotmapUpdated,
    /// The first slot map was published; the client can route commands
    Ready,
}

pub type EventCallback = Arc<dyn Fn(ClusterEvent) + Send + Sync>;

/// Delivers events to the registered callback
#[derive(Default)]
pub(crate) struct EventSink {
    callback: Mutex<Option<EventCallback>>,
    ready: AtomicBool,
}

impl EventSink {
    pub(crate) fn set(&self, callback: EventCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Report a published slot map; the first one also reports `Ready`
    pub(crate) fn slotmap_published(&self) {
        let Some(callback) = self.callback.lock().clone() else {
            // readiness is recorded even without a listener
            self.ready.store(true, Ordering::Release);
            return;
        };
        callback(ClusterEvent::SlotmapUpdated);
        if !self.ready.swap(true, Ordering::AcqRel) {
            callback(ClusterEvent::Ready);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("callback", &self.callback.lock().is_some())
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish()
    }
}
