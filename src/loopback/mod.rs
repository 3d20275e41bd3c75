//! In-process engine implementing [`NativeApi`] in Rust.
//!
//! Handy for tests and demos: everything the bridge needs from a native
//! engine is here, minus the network. Sends are routed to subscriptions on
//! the same transport and topic. Throttled sends complete when
//! [`run_throttle`] runs or when any queue is dispatched. Destroy
//! notifications, subscription creation and deliveries all go through the
//! owning queue, so nothing happens until somebody dispatches it.

mod engine;
mod entities;
mod message;

pub use engine::Counters;

use crate::ffi::{NativeApi, NativeHandle, RawStatus};
use libc::c_int;
use entities::*;
use message::*;

static API: NativeApi = NativeApi {
    transport_create,
    transport_destroy,
    transport_get_name,
    transport_get_outbound_throttle,
    transport_set_outbound_throttle,
    transport_set_transport_callback,
    transport_set_transport_topic_callback,

    queue_create,
    queue_destroy,
    queue_destroy_wait,
    queue_destroy_timed_wait,
    queue_can_destroy,
    queue_enqueue_event,
    queue_dispatch_event,
    queue_timed_dispatch,
    queue_dispatch,
    queue_stop_dispatch,
    queue_get_event_count,
    queue_set_enqueue_callback,
    queue_remove_enqueue_callback,
    queue_set_monitor_callbacks,
    queue_set_high_watermark,
    queue_get_high_watermark,
    queue_set_low_watermark,
    queue_get_low_watermark,

    msg_create,
    msg_destroy,
    msg_clear,
    msg_get_num_fields,
    msg_add_i32,
    msg_add_i64,
    msg_add_f64,
    msg_add_bool,
    msg_add_string,
    msg_add_vector_i32,
    msg_get_i32,
    msg_get_i64,
    msg_get_f64,
    msg_get_bool,
    msg_get_string,
    msg_get_vector_i32,
    msg_get_field_at,

    field_get_fid,
    field_get_type,
    field_get_name,
    field_get_i64,
    field_get_f64,

    publisher_create,
    publisher_destroy,
    publisher_send,
    publisher_send_with_throttle,
    publisher_send_from_inbox,
    publisher_send_reply_to_inbox,
    publisher_send_from_inbox_with_throttle,

    timer_create,
    timer_destroy,
    timer_reset,
    timer_set_interval,
    timer_get_interval,

    inbox_create,
    inbox_destroy,

    subscription_create,
    subscription_destroy,
    subscription_get_state,
    subscription_get_topic,
};

/// Function table of the loopback engine.
pub fn api() -> &'static NativeApi {
    &API
}

/// Snapshot of the engine's activity counters.
pub fn counters() -> Counters {
    engine::lock().snapshot()
}

/// Forget every object and zero the counters.
///
/// Handles issued before stay invalid afterwards; ids are never reused.
pub fn reset() {
    engine::lock().clear();
}

/// Complete all queued throttled sends on the calling thread. Returns how
/// many completed.
pub fn run_throttle() -> usize {
    engine::run_throttle()
}

/// Invoke the most recent send completion a second time, the way a faulty
/// engine would. Returns false if nothing has completed yet.
pub fn replay_last_completion() -> bool {
    engine::replay_last_completion()
}

/// Deliver `status` to a subscription's error callback on the calling thread.
pub fn inject_subscription_error(subscription: NativeHandle, status: RawStatus) -> bool {
    entities::inject_subscription_error(subscription, status)
}

/// Deliver a connection event (one of the `TRANSPORT_*` codes) to a
/// transport's status callback on the calling thread. Returns false if the
/// transport has no callback set.
pub fn inject_transport_event(transport: NativeHandle, event: c_int, cause: i16) -> bool {
    entities::inject_transport_event(transport, event, cause)
}
