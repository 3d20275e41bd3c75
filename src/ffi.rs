// Raw C ABI of the native messaging engine.
//
// Everything here mirrors the engine's fixed-layout signatures: handle in,
// status code out, results written through out-pointers. Callbacks are plain
// `extern "C"` functions that receive the opaque closure passed at
// registration, unchanged.

use libc::{c_char, c_double, c_int, c_void};
use std::fmt;
use std::ptr;

/// Status code returned by every native entry point. Zero is success.
pub type RawStatus = c_int;

/// Boolean as the engine ABI carries it (one byte, zero is false).
pub type RawBool = u8;

// Status codes the bridge itself switches on
pub const STATUS_OK: RawStatus = 0;
pub const STATUS_NULL_ARG: RawStatus = 5;
pub const STATUS_NOT_FOUND: RawStatus = 6;
pub const STATUS_TIMEOUT: RawStatus = 9;
pub const STATUS_WRONG_FIELD_TYPE: RawStatus = 19;
pub const STATUS_QUEUE_OPEN_OBJECTS: RawStatus = 5002;

// Field type tags reported by `field_get_type`
pub const FIELD_TYPE_I32: c_int = 1;
pub const FIELD_TYPE_I64: c_int = 2;
pub const FIELD_TYPE_F64: c_int = 3;
pub const FIELD_TYPE_BOOL: c_int = 4;
pub const FIELD_TYPE_STRING: c_int = 5;
pub const FIELD_TYPE_VECTOR_I32: c_int = 6;

// Subscription states reported by `subscription_get_state`
pub const SUBSCRIPTION_STATE_CREATING: c_int = 1;
pub const SUBSCRIPTION_STATE_ACTIVATED: c_int = 2;
pub const SUBSCRIPTION_STATE_DESTROYING: c_int = 3;

// Transport advisories passed to a `TransportCallback`
pub const TRANSPORT_CONNECT: c_int = 0;
pub const TRANSPORT_CONNECT_FAILED: c_int = 1;
pub const TRANSPORT_RECONNECT: c_int = 2;
pub const TRANSPORT_DISCONNECT: c_int = 3;
pub const TRANSPORT_ACCEPT: c_int = 4;
pub const TRANSPORT_ACCEPT_RECONNECT: c_int = 5;
pub const TRANSPORT_PUBLISHER_DISCONNECT: c_int = 6;
pub const TRANSPORT_QUALITY: c_int = 7;
pub const TRANSPORT_NAMING_SERVICE_CONNECT: c_int = 8;
pub const TRANSPORT_NAMING_SERVICE_DISCONNECT: c_int = 9;
pub const TRANSPORT_WRITE_QUEUE_HIGH_WATER_MARK: c_int = 10;
pub const TRANSPORT_WRITE_QUEUE_LOW_WATER_MARK: c_int = 11;

// Topic advisories passed to a `TransportTopicCallback`
pub const TRANSPORT_TOPIC_SUBSCRIBED: c_int = 0;
pub const TRANSPORT_TOPIC_UNSUBSCRIBED: c_int = 1;

/// Opaque, pointer-sized identifier of an engine-owned resource.
///
/// `repr(transparent)` keeps it ABI-identical to `void*` so it can be passed
/// straight through function pointers.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(*mut c_void);

// The handle is an identifier; the engine synchronizes access to what it names.
unsafe impl Send for NativeHandle {}
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(ptr::null_mut());

    pub fn from_raw(raw: *mut c_void) -> Self {
        NativeHandle(raw)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }
}

impl Default for NativeHandle {
    fn default() -> Self {
        NativeHandle::NULL
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeHandle({:p})", self.0)
    }
}

/// Encode a registration key as the opaque closure argument.
///
/// Keys start at 1, so a valid closure is never null.
pub fn closure_from_key(key: u64) -> *mut c_void {
    key as usize as *mut c_void
}

/// Decode the opaque closure argument handed back to a trampoline.
pub fn key_from_closure(closure: *mut c_void) -> u64 {
    closure as usize as u64
}

// -----------------------------------------------------------------------------
// Callback signatures
// -----------------------------------------------------------------------------

pub type QueueEventCallback = extern "C" fn(queue: NativeHandle, closure: *mut c_void);

/// Runs on the enqueuing thread each time an event lands on the queue.
pub type QueueEnqueueCallback = extern "C" fn(queue: NativeHandle, closure: *mut c_void);

/// `size` is the number of events on the queue when the mark was crossed.
pub type QueueWatermarkCallback = extern "C" fn(queue: NativeHandle, size: usize, closure: *mut c_void);

/// Watermark callbacks handed to `queue_set_monitor_callbacks`. Unset entries
/// are null.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct QueueMonitorCallbacks {
    pub on_high_watermark_exceeded: Option<QueueWatermarkCallback>,
    pub on_low_watermark: Option<QueueWatermarkCallback>,
}

/// `platform_info` is middleware specific and may be null.
pub type TransportCallback = extern "C" fn(
    transport: NativeHandle,
    event: c_int,
    cause: i16,
    platform_info: *const c_void,
    closure: *mut c_void,
);

pub type TransportTopicCallback = extern "C" fn(
    transport: NativeHandle,
    event: c_int,
    topic: *const c_char,
    platform_info: *const c_void,
    closure: *mut c_void,
);

/// Used for both timer ticks and the timer destroy notification.
pub type TimerCallback = extern "C" fn(timer: NativeHandle, closure: *mut c_void);

pub type SendCompleteCallback = extern "C" fn(
    publisher: NativeHandle,
    msg: NativeHandle,
    status: RawStatus,
    closure: *mut c_void,
);

pub type InboxMsgCallback = extern "C" fn(msg: NativeHandle, closure: *mut c_void);
pub type InboxErrorCallback = extern "C" fn(status: RawStatus, closure: *mut c_void);
pub type InboxDestroyCallback = extern "C" fn(inbox: NativeHandle, closure: *mut c_void);

pub type SubscriptionCreateCallback = extern "C" fn(subscription: NativeHandle, closure: *mut c_void);
pub type SubscriptionErrorCallback =
    extern "C" fn(subscription: NativeHandle, status: RawStatus, closure: *mut c_void);
pub type SubscriptionMsgCallback = extern "C" fn(
    subscription: NativeHandle,
    msg: NativeHandle,
    closure: *mut c_void,
    item_closure: *mut c_void,
);
pub type SubscriptionDestroyCallback = extern "C" fn(subscription: NativeHandle, closure: *mut c_void);

/// Callback table handed to `subscription_create`. Unset entries are null.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SubscriptionCallbacks {
    pub on_create: Option<SubscriptionCreateCallback>,
    pub on_error: Option<SubscriptionErrorCallback>,
    pub on_msg: Option<SubscriptionMsgCallback>,
    pub on_destroy: Option<SubscriptionDestroyCallback>,
}

// -----------------------------------------------------------------------------
// Entry points
// -----------------------------------------------------------------------------

/// Function table of the native engine.
///
/// A deployment fills this from the loaded engine library; the loopback engine
/// in [`crate::loopback`] provides an in-process implementation. Strings passed
/// in are NUL-terminated and only borrowed for the duration of the call. Strings
/// and arrays handed out stay valid until the owning object is mutated or
/// destroyed.
#[repr(C)]
pub struct NativeApi {
    // transport
    pub transport_create: unsafe extern "C" fn(result: *mut NativeHandle, name: *const c_char) -> RawStatus,
    pub transport_destroy: unsafe extern "C" fn(transport: NativeHandle) -> RawStatus,
    pub transport_get_name: unsafe extern "C" fn(transport: NativeHandle, result: *mut *const c_char) -> RawStatus,
    pub transport_get_outbound_throttle:
        unsafe extern "C" fn(transport: NativeHandle, result: *mut c_double) -> RawStatus,
    pub transport_set_outbound_throttle:
        unsafe extern "C" fn(transport: NativeHandle, rate: c_double) -> RawStatus,
    /// A null callback removes the current one.
    pub transport_set_transport_callback: unsafe extern "C" fn(
        transport: NativeHandle,
        callback: Option<TransportCallback>,
        closure: *mut c_void,
    ) -> RawStatus,
    pub transport_set_transport_topic_callback: unsafe extern "C" fn(
        transport: NativeHandle,
        callback: Option<TransportTopicCallback>,
        closure: *mut c_void,
    ) -> RawStatus,

    // queue
    pub queue_create: unsafe extern "C" fn(result: *mut NativeHandle) -> RawStatus,
    pub queue_destroy: unsafe extern "C" fn(queue: NativeHandle) -> RawStatus,
    pub queue_destroy_wait: unsafe extern "C" fn(queue: NativeHandle) -> RawStatus,
    pub queue_destroy_timed_wait: unsafe extern "C" fn(queue: NativeHandle, timeout_ms: u64) -> RawStatus,
    pub queue_can_destroy: unsafe extern "C" fn(queue: NativeHandle) -> RawStatus,
    pub queue_enqueue_event:
        unsafe extern "C" fn(queue: NativeHandle, callback: QueueEventCallback, closure: *mut c_void) -> RawStatus,
    pub queue_dispatch_event: unsafe extern "C" fn(queue: NativeHandle) -> RawStatus,
    pub queue_timed_dispatch: unsafe extern "C" fn(queue: NativeHandle, timeout_ms: u64) -> RawStatus,
    /// Blocks, dispatching, until `queue_stop_dispatch` is called.
    pub queue_dispatch: unsafe extern "C" fn(queue: NativeHandle) -> RawStatus,
    pub queue_stop_dispatch: unsafe extern "C" fn(queue: NativeHandle) -> RawStatus,
    pub queue_get_event_count: unsafe extern "C" fn(queue: NativeHandle, result: *mut usize) -> RawStatus,
    pub queue_set_enqueue_callback:
        unsafe extern "C" fn(queue: NativeHandle, callback: QueueEnqueueCallback, closure: *mut c_void) -> RawStatus,
    pub queue_remove_enqueue_callback: unsafe extern "C" fn(queue: NativeHandle) -> RawStatus,
    pub queue_set_monitor_callbacks: unsafe extern "C" fn(
        queue: NativeHandle,
        callbacks: *const QueueMonitorCallbacks,
        closure: *mut c_void,
    ) -> RawStatus,
    pub queue_set_high_watermark: unsafe extern "C" fn(queue: NativeHandle, watermark: usize) -> RawStatus,
    pub queue_get_high_watermark: unsafe extern "C" fn(queue: NativeHandle, result: *mut usize) -> RawStatus,
    pub queue_set_low_watermark: unsafe extern "C" fn(queue: NativeHandle, watermark: usize) -> RawStatus,
    pub queue_get_low_watermark: unsafe extern "C" fn(queue: NativeHandle, result: *mut usize) -> RawStatus,

    // message
    pub msg_create: unsafe extern "C" fn(result: *mut NativeHandle) -> RawStatus,
    pub msg_destroy: unsafe extern "C" fn(msg: NativeHandle) -> RawStatus,
    pub msg_clear: unsafe extern "C" fn(msg: NativeHandle) -> RawStatus,
    pub msg_get_num_fields: unsafe extern "C" fn(msg: NativeHandle, result: *mut usize) -> RawStatus,
    pub msg_add_i32: unsafe extern "C" fn(msg: NativeHandle, name: *const c_char, fid: u16, value: i32) -> RawStatus,
    pub msg_add_i64: unsafe extern "C" fn(msg: NativeHandle, name: *const c_char, fid: u16, value: i64) -> RawStatus,
    pub msg_add_f64:
        unsafe extern "C" fn(msg: NativeHandle, name: *const c_char, fid: u16, value: c_double) -> RawStatus,
    pub msg_add_bool:
        unsafe extern "C" fn(msg: NativeHandle, name: *const c_char, fid: u16, value: RawBool) -> RawStatus,
    pub msg_add_string:
        unsafe extern "C" fn(msg: NativeHandle, name: *const c_char, fid: u16, value: *const c_char) -> RawStatus,
    pub msg_add_vector_i32: unsafe extern "C" fn(
        msg: NativeHandle,
        name: *const c_char,
        fid: u16,
        values: *const i32,
        len: usize,
    ) -> RawStatus,
    pub msg_get_i32:
        unsafe extern "C" fn(msg: NativeHandle, name: *const c_char, fid: u16, result: *mut i32) -> RawStatus,
    pub msg_get_i64:
        unsafe extern "C" fn(msg: NativeHandle, name: *const c_char, fid: u16, result: *mut i64) -> RawStatus,
    pub msg_get_f64:
        unsafe extern "C" fn(msg: NativeHandle, name: *const c_char, fid: u16, result: *mut c_double) -> RawStatus,
    pub msg_get_bool:
        unsafe extern "C" fn(msg: NativeHandle, name: *const c_char, fid: u16, result: *mut RawBool) -> RawStatus,
    pub msg_get_string: unsafe extern "C" fn(
        msg: NativeHandle,
        name: *const c_char,
        fid: u16,
        result: *mut *const c_char,
    ) -> RawStatus,
    pub msg_get_vector_i32: unsafe extern "C" fn(
        msg: NativeHandle,
        name: *const c_char,
        fid: u16,
        result: *mut *const i32,
        len: *mut usize,
    ) -> RawStatus,
    pub msg_get_field_at: unsafe extern "C" fn(msg: NativeHandle, index: usize, result: *mut NativeHandle) -> RawStatus,

    // message field (views owned by their message)
    pub field_get_fid: unsafe extern "C" fn(field: NativeHandle, result: *mut u16) -> RawStatus,
    pub field_get_type: unsafe extern "C" fn(field: NativeHandle, result: *mut c_int) -> RawStatus,
    pub field_get_name: unsafe extern "C" fn(field: NativeHandle, result: *mut *const c_char) -> RawStatus,
    pub field_get_i64: unsafe extern "C" fn(field: NativeHandle, result: *mut i64) -> RawStatus,
    pub field_get_f64: unsafe extern "C" fn(field: NativeHandle, result: *mut c_double) -> RawStatus,

    // publisher
    pub publisher_create: unsafe extern "C" fn(
        result: *mut NativeHandle,
        transport: NativeHandle,
        topic: *const c_char,
        source: *const c_char,
        root: *const c_char,
    ) -> RawStatus,
    pub publisher_destroy: unsafe extern "C" fn(publisher: NativeHandle) -> RawStatus,
    pub publisher_send: unsafe extern "C" fn(publisher: NativeHandle, msg: NativeHandle) -> RawStatus,
    pub publisher_send_with_throttle: unsafe extern "C" fn(
        publisher: NativeHandle,
        msg: NativeHandle,
        callback: SendCompleteCallback,
        closure: *mut c_void,
    ) -> RawStatus,
    pub publisher_send_from_inbox:
        unsafe extern "C" fn(publisher: NativeHandle, inbox: NativeHandle, msg: NativeHandle) -> RawStatus,
    pub publisher_send_reply_to_inbox:
        unsafe extern "C" fn(publisher: NativeHandle, request: NativeHandle, reply: NativeHandle) -> RawStatus,
    pub publisher_send_from_inbox_with_throttle: unsafe extern "C" fn(
        publisher: NativeHandle,
        inbox: NativeHandle,
        msg: NativeHandle,
        callback: SendCompleteCallback,
        closure: *mut c_void,
    ) -> RawStatus,

    // timer
    pub timer_create: unsafe extern "C" fn(
        result: *mut NativeHandle,
        queue: NativeHandle,
        tick: TimerCallback,
        destroy: TimerCallback,
        interval: c_double,
        closure: *mut c_void,
    ) -> RawStatus,
    pub timer_destroy: unsafe extern "C" fn(timer: NativeHandle) -> RawStatus,
    pub timer_reset: unsafe extern "C" fn(timer: NativeHandle) -> RawStatus,
    pub timer_set_interval: unsafe extern "C" fn(timer: NativeHandle, interval: c_double) -> RawStatus,
    pub timer_get_interval: unsafe extern "C" fn(timer: NativeHandle, result: *mut c_double) -> RawStatus,

    // inbox
    pub inbox_create: unsafe extern "C" fn(
        result: *mut NativeHandle,
        transport: NativeHandle,
        queue: NativeHandle,
        on_msg: InboxMsgCallback,
        on_error: InboxErrorCallback,
        on_destroy: InboxDestroyCallback,
        closure: *mut c_void,
    ) -> RawStatus,
    pub inbox_destroy: unsafe extern "C" fn(inbox: NativeHandle) -> RawStatus,

    // subscription
    pub subscription_create: unsafe extern "C" fn(
        result: *mut NativeHandle,
        transport: NativeHandle,
        queue: NativeHandle,
        callbacks: *const SubscriptionCallbacks,
        topic: *const c_char,
        closure: *mut c_void,
    ) -> RawStatus,
    pub subscription_destroy: unsafe extern "C" fn(subscription: NativeHandle) -> RawStatus,
    pub subscription_get_state: unsafe extern "C" fn(subscription: NativeHandle, result: *mut c_int) -> RawStatus,
    pub subscription_get_topic:
        unsafe extern "C" fn(subscription: NativeHandle, result: *mut *const c_char) -> RawStatus,
}

/// Destructor entry point shared by every handle kind.
pub type Destructor = unsafe extern "C" fn(handle: NativeHandle) -> RawStatus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_round_trips_key() {
        for key in [1u64, 2, 77, u32::MAX as u64] {
            let closure = closure_from_key(key);
            assert!(!closure.is_null());
            assert_eq!(key_from_closure(closure), key);
        }
    }

    #[test]
    fn handle_is_pointer_sized() {
        assert_eq!(std::mem::size_of::<NativeHandle>(), std::mem::size_of::<*mut c_void>());
        assert!(NativeHandle::default().is_null());
    }
}
