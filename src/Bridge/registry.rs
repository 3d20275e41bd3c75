// Process-wide bookkeeping shared by all trampolines.

use super::{inbox, publisher, queue, subscription, timer, transport};
use crate::Core::{BridgeError, CallbackKey};
use crossbeam_utils::CachePadded;
use lazy_static::lazy_static;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};

lazy_static! {
    static ref STRAY_CALLBACKS: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(0));
}

pub(crate) fn stray_callbacks() -> u64 {
    STRAY_CALLBACKS.load(Ordering::Relaxed)
}

/// Record a trampoline invocation whose key had no registration.
pub(crate) fn note_stray(store: &'static str, key: CallbackKey, err: &BridgeError) {
    STRAY_CALLBACKS.fetch_add(1, Ordering::Relaxed);
    warn!(store, key, error = %err, "callback fired for unknown registration, ignoring");
}

pub(crate) fn pending_callbacks() -> usize {
    queue::EVENTS.len()
        + queue::ENQUEUE_CALLBACKS.len()
        + queue::QUEUE_MONITORS.len()
        + publisher::SEND_COMPLETIONS.len()
        + timer::TIMERS.len()
        + inbox::INBOXES.len()
        + subscription::SUBSCRIPTIONS.len()
        + transport::TRANSPORT_CALLBACKS.len()
        + transport::TOPIC_CALLBACKS.len()
}

/// Release every registration still waiting on the engine. Throttled sends
/// also hand their message and publisher back.
pub(crate) fn dispose_all() -> usize {
    queue::EVENTS.dispose_all()
        + queue::ENQUEUE_CALLBACKS.dispose_all()
        + queue::QUEUE_MONITORS.dispose_all()
        + publisher::release_pending_sends()
        + timer::TIMERS.dispose_all()
        + inbox::INBOXES.dispose_all()
        + subscription::SUBSCRIPTIONS.dispose_all()
        + transport::TRANSPORT_CALLBACKS.dispose_all()
        + transport::TOPIC_CALLBACKS.dispose_all()
}

/// Run user code inside a trampoline. A panic must not unwind into the
/// engine's stack frames.
pub(crate) fn guard<F: FnOnce()>(trampoline: &'static str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(trampoline, "user callback panicked");
    }
}
