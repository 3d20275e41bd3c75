// Transport, queue, publisher, timer, inbox and subscription entry points
// of the loopback engine.

use super::engine::{
    self, closure_ptr, handle_of, id_of, interval_duration, lock, Event, InboxObj, Object, PendingSend, PublisherObj,
    QueueObj, SubscriptionObj, TimerObj, TransportObj, STATUS_INVALID_ARG,
};
use crate::ffi::{
    self, InboxDestroyCallback, InboxErrorCallback, InboxMsgCallback, NativeHandle, QueueEnqueueCallback,
    QueueEventCallback, QueueMonitorCallbacks, RawStatus, SendCompleteCallback, SubscriptionCallbacks, TimerCallback,
    TransportCallback, TransportTopicCallback, STATUS_NULL_ARG, STATUS_OK,
};
use libc::{c_char, c_double, c_int, c_void};
use std::ffi::CStr;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_THROTTLE: f64 = 500.0;

// -- transport ---------------------------------------------------------------

pub(crate) unsafe extern "C" fn transport_create(result: *mut NativeHandle, name: *const c_char) -> RawStatus {
    if result.is_null() || name.is_null() {
        return STATUS_NULL_ARG;
    }
    let name = CStr::from_ptr(name).to_owned();
    let id = lock().insert(Object::Transport(TransportObj {
        name,
        throttle: DEFAULT_THROTTLE,
        callback: None,
        topic_callback: None,
    }));
    *result = handle_of(id);
    STATUS_OK
}

pub(crate) unsafe extern "C" fn transport_destroy(transport: NativeHandle) -> RawStatus {
    let mut engine = lock();
    let id = id_of(transport);
    match engine.objects.get(&id) {
        Some(Object::Transport(_)) => {
            engine.remove_object(id);
            STATUS_OK
        }
        _ => engine.note_double_destroy("transport", id),
    }
}

pub(crate) unsafe extern "C" fn transport_get_name(transport: NativeHandle, result: *mut *const c_char) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    match lock().objects.get(&id_of(transport)) {
        Some(Object::Transport(t)) => {
            *result = t.name.as_ptr();
            STATUS_OK
        }
        _ => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn transport_get_outbound_throttle(
    transport: NativeHandle,
    result: *mut c_double,
) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    match lock().objects.get(&id_of(transport)) {
        Some(Object::Transport(t)) => {
            *result = t.throttle;
            STATUS_OK
        }
        _ => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn transport_set_outbound_throttle(transport: NativeHandle, rate: c_double) -> RawStatus {
    match lock().objects.get_mut(&id_of(transport)) {
        Some(Object::Transport(t)) => {
            t.throttle = rate;
            STATUS_OK
        }
        _ => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn transport_set_transport_callback(
    transport: NativeHandle,
    callback: Option<TransportCallback>,
    closure: *mut c_void,
) -> RawStatus {
    match lock().objects.get_mut(&id_of(transport)) {
        Some(Object::Transport(t)) => {
            t.callback = callback.map(|cb| (cb, closure as usize));
            STATUS_OK
        }
        _ => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn transport_set_transport_topic_callback(
    transport: NativeHandle,
    callback: Option<TransportTopicCallback>,
    closure: *mut c_void,
) -> RawStatus {
    match lock().objects.get_mut(&id_of(transport)) {
        Some(Object::Transport(t)) => {
            t.topic_callback = callback.map(|cb| (cb, closure as usize));
            STATUS_OK
        }
        _ => STATUS_INVALID_ARG,
    }
}

/// Report a connection event to the transport's callback on the calling
/// thread, as the network layer would.
pub(crate) fn inject_transport_event(transport: NativeHandle, event: c_int, cause: i16) -> bool {
    let registered = match lock().objects.get(&id_of(transport)) {
        Some(Object::Transport(t)) => t.callback,
        _ => return false,
    };
    match registered {
        Some((callback, closure)) => {
            callback(transport, event, cause, std::ptr::null(), closure_ptr(closure));
            true
        }
        None => false,
    }
}

// -- queue -------------------------------------------------------------------

pub(crate) unsafe extern "C" fn queue_create(result: *mut NativeHandle) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    let id = lock().insert(Object::Queue(QueueObj::default()));
    *result = handle_of(id);
    STATUS_OK
}

pub(crate) unsafe extern "C" fn queue_destroy(queue: NativeHandle) -> RawStatus {
    engine::try_destroy_queue(id_of(queue))
}

pub(crate) unsafe extern "C" fn queue_destroy_wait(queue: NativeHandle) -> RawStatus {
    engine::drain_and_destroy(id_of(queue))
}

pub(crate) unsafe extern "C" fn queue_destroy_timed_wait(queue: NativeHandle, timeout_ms: u64) -> RawStatus {
    engine::drain_and_destroy_timed(id_of(queue), Duration::from_millis(timeout_ms))
}

pub(crate) unsafe extern "C" fn queue_can_destroy(queue: NativeHandle) -> RawStatus {
    match lock().queue_mut(id_of(queue)) {
        Some(q) if q.open == 0 && q.events.is_empty() => STATUS_OK,
        Some(_) => ffi::STATUS_QUEUE_OPEN_OBJECTS,
        None => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn queue_enqueue_event(
    queue: NativeHandle,
    callback: QueueEventCallback,
    closure: *mut c_void,
) -> RawStatus {
    let event = Event::User {
        callback,
        closure: closure as usize,
    };
    if lock().push_event(id_of(queue), event) {
        STATUS_OK
    } else {
        STATUS_INVALID_ARG
    }
}

pub(crate) unsafe extern "C" fn queue_dispatch_event(queue: NativeHandle) -> RawStatus {
    match engine::dispatch_one(id_of(queue)) {
        Ok(_) => STATUS_OK,
        Err(status) => status,
    }
}

pub(crate) unsafe extern "C" fn queue_timed_dispatch(queue: NativeHandle, timeout_ms: u64) -> RawStatus {
    engine::timed_dispatch(id_of(queue), Duration::from_millis(timeout_ms))
}

pub(crate) unsafe extern "C" fn queue_dispatch(queue: NativeHandle) -> RawStatus {
    engine::dispatch_until_stopped(id_of(queue))
}

pub(crate) unsafe extern "C" fn queue_stop_dispatch(queue: NativeHandle) -> RawStatus {
    engine::stop_dispatch(id_of(queue))
}

pub(crate) unsafe extern "C" fn queue_get_event_count(queue: NativeHandle, result: *mut usize) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    match lock().queue_mut(id_of(queue)) {
        Some(q) => {
            *result = q.events.len();
            STATUS_OK
        }
        None => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn queue_set_enqueue_callback(
    queue: NativeHandle,
    callback: QueueEnqueueCallback,
    closure: *mut c_void,
) -> RawStatus {
    match lock().queue_mut(id_of(queue)) {
        Some(q) => {
            q.enqueue = Some((callback, closure as usize));
            STATUS_OK
        }
        None => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn queue_remove_enqueue_callback(queue: NativeHandle) -> RawStatus {
    match lock().queue_mut(id_of(queue)) {
        Some(q) => {
            q.enqueue = None;
            STATUS_OK
        }
        None => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn queue_set_monitor_callbacks(
    queue: NativeHandle,
    callbacks: *const QueueMonitorCallbacks,
    closure: *mut c_void,
) -> RawStatus {
    if callbacks.is_null() {
        return STATUS_NULL_ARG;
    }
    let callbacks = *callbacks;
    match lock().queue_mut(id_of(queue)) {
        Some(q) => {
            q.monitor = Some((callbacks, closure as usize));
            STATUS_OK
        }
        None => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn queue_set_high_watermark(queue: NativeHandle, watermark: usize) -> RawStatus {
    match lock().queue_mut(id_of(queue)) {
        Some(q) if watermark != 0 && watermark < q.low_watermark => STATUS_INVALID_ARG,
        Some(q) => {
            q.high_watermark = watermark;
            STATUS_OK
        }
        None => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn queue_get_high_watermark(queue: NativeHandle, result: *mut usize) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    match lock().queue_mut(id_of(queue)) {
        Some(q) => {
            *result = q.high_watermark;
            STATUS_OK
        }
        None => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn queue_set_low_watermark(queue: NativeHandle, watermark: usize) -> RawStatus {
    // The low mark is at least one event
    let watermark = watermark.max(1);
    match lock().queue_mut(id_of(queue)) {
        Some(q) if q.high_watermark != 0 && q.high_watermark < watermark => STATUS_INVALID_ARG,
        Some(q) => {
            q.low_watermark = watermark;
            STATUS_OK
        }
        None => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn queue_get_low_watermark(queue: NativeHandle, result: *mut usize) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    match lock().queue_mut(id_of(queue)) {
        Some(q) => {
            *result = q.low_watermark;
            STATUS_OK
        }
        None => STATUS_INVALID_ARG,
    }
}

// -- publisher ---------------------------------------------------------------

pub(crate) unsafe extern "C" fn publisher_create(
    result: *mut NativeHandle,
    transport: NativeHandle,
    topic: *const c_char,
    _source: *const c_char,
    _root: *const c_char,
) -> RawStatus {
    if result.is_null() || topic.is_null() {
        return STATUS_NULL_ARG;
    }
    let topic = CStr::from_ptr(topic).to_string_lossy().into_owned();
    let mut engine = lock();
    let transport = id_of(transport);
    if !matches!(engine.objects.get(&transport), Some(Object::Transport(_))) {
        return STATUS_INVALID_ARG;
    }
    let id = engine.insert(Object::Publisher(PublisherObj { transport, topic }));
    *result = handle_of(id);
    STATUS_OK
}

pub(crate) unsafe extern "C" fn publisher_destroy(publisher: NativeHandle) -> RawStatus {
    let mut engine = lock();
    let id = id_of(publisher);
    match engine.objects.get(&id) {
        Some(Object::Publisher(_)) => {
            engine.remove_object(id);
            STATUS_OK
        }
        _ => engine.note_double_destroy("publisher", id),
    }
}

pub(crate) unsafe extern "C" fn publisher_send(publisher: NativeHandle, msg: NativeHandle) -> RawStatus {
    match lock().route(id_of(publisher), id_of(msg), None) {
        Ok(_) => STATUS_OK,
        Err(status) => status,
    }
}

pub(crate) unsafe extern "C" fn publisher_send_with_throttle(
    publisher: NativeHandle,
    msg: NativeHandle,
    callback: SendCompleteCallback,
    closure: *mut c_void,
) -> RawStatus {
    let mut engine = lock();
    let (publisher, msg) = (id_of(publisher), id_of(msg));
    if !matches!(engine.objects.get(&publisher), Some(Object::Publisher(_))) || engine.message(msg).is_none() {
        return STATUS_INVALID_ARG;
    }
    engine.throttle.push_back(PendingSend {
        publisher,
        msg,
        reply_inbox: None,
        callback,
        closure: closure as usize,
    });
    STATUS_OK
}

pub(crate) unsafe extern "C" fn publisher_send_from_inbox(
    publisher: NativeHandle,
    inbox: NativeHandle,
    msg: NativeHandle,
) -> RawStatus {
    lock().send_from_inbox(id_of(publisher), id_of(inbox), id_of(msg))
}

pub(crate) unsafe extern "C" fn publisher_send_from_inbox_with_throttle(
    publisher: NativeHandle,
    inbox: NativeHandle,
    msg: NativeHandle,
    callback: SendCompleteCallback,
    closure: *mut c_void,
) -> RawStatus {
    let mut engine = lock();
    let (publisher, inbox, msg) = (id_of(publisher), id_of(inbox), id_of(msg));
    if !matches!(engine.objects.get(&publisher), Some(Object::Publisher(_)))
        || !matches!(engine.objects.get(&inbox), Some(Object::Inbox(i)) if !i.destroying)
        || engine.message(msg).is_none()
    {
        return STATUS_INVALID_ARG;
    }
    engine.throttle.push_back(PendingSend {
        publisher,
        msg,
        reply_inbox: Some(inbox),
        callback,
        closure: closure as usize,
    });
    STATUS_OK
}

pub(crate) unsafe extern "C" fn publisher_send_reply_to_inbox(
    publisher: NativeHandle,
    request: NativeHandle,
    reply: NativeHandle,
) -> RawStatus {
    let mut engine = lock();
    if !matches!(engine.objects.get(&id_of(publisher)), Some(Object::Publisher(_))) {
        return STATUS_INVALID_ARG;
    }
    let inbox = match engine.message(id_of(request)) {
        Some(msg) => match msg.reply_inbox {
            Some(inbox) => inbox,
            None => return STATUS_INVALID_ARG,
        },
        None => return STATUS_INVALID_ARG,
    };
    let (queue, on_msg, closure) = match engine.objects.get(&inbox) {
        Some(Object::Inbox(i)) if !i.destroying => (i.queue, i.on_msg, i.closure),
        _ => return ffi::STATUS_NOT_FOUND,
    };
    let copy = match engine.message(id_of(reply)) {
        Some(msg) => msg.copy(),
        None => return STATUS_INVALID_ARG,
    };
    let copy = engine.insert(Object::Message(copy));
    engine.push_event(
        queue,
        Event::InboxReply {
            callback: on_msg,
            inbox,
            msg: copy,
            closure,
        },
    );
    STATUS_OK
}

// -- timer -------------------------------------------------------------------

pub(crate) unsafe extern "C" fn timer_create(
    result: *mut NativeHandle,
    queue: NativeHandle,
    tick: TimerCallback,
    destroy: TimerCallback,
    interval: c_double,
    closure: *mut c_void,
) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    if !(interval.is_finite() && interval > 0.0) {
        return STATUS_INVALID_ARG;
    }
    let mut engine = lock();
    let queue = id_of(queue);
    match engine.queue_mut(queue) {
        Some(q) => q.open += 1,
        None => return STATUS_INVALID_ARG,
    }
    let id = engine.insert(Object::Timer(TimerObj {
        queue,
        tick,
        destroy,
        interval,
        next_due: Instant::now() + interval_duration(interval),
        closure: closure as usize,
        destroying: false,
    }));
    *result = handle_of(id);
    STATUS_OK
}

pub(crate) unsafe extern "C" fn timer_destroy(timer: NativeHandle) -> RawStatus {
    let mut engine = lock();
    let id = id_of(timer);
    let (queue, callback, closure) = match engine.objects.get_mut(&id) {
        Some(Object::Timer(t)) if !t.destroying => {
            t.destroying = true;
            (t.queue, t.destroy, t.closure)
        }
        _ => return engine.note_double_destroy("timer", id),
    };
    engine.push_event(queue, Event::TimerDestroyed { callback, timer: id, closure });
    debug!(timer = id, "timer destroy queued");
    STATUS_OK
}

fn with_timer<F>(timer: NativeHandle, f: F) -> RawStatus
where
    F: FnOnce(&mut TimerObj) -> RawStatus,
{
    match lock().objects.get_mut(&id_of(timer)) {
        Some(Object::Timer(t)) if !t.destroying => f(t),
        _ => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn timer_reset(timer: NativeHandle) -> RawStatus {
    with_timer(timer, |t| {
        t.next_due = Instant::now() + interval_duration(t.interval);
        STATUS_OK
    })
}

pub(crate) unsafe extern "C" fn timer_set_interval(timer: NativeHandle, interval: c_double) -> RawStatus {
    if !(interval.is_finite() && interval > 0.0) {
        return STATUS_INVALID_ARG;
    }
    with_timer(timer, |t| {
        t.interval = interval;
        t.next_due = Instant::now() + interval_duration(interval);
        STATUS_OK
    })
}

pub(crate) unsafe extern "C" fn timer_get_interval(timer: NativeHandle, result: *mut c_double) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    with_timer(timer, |t| {
        *result = t.interval;
        STATUS_OK
    })
}

// -- inbox -------------------------------------------------------------------

pub(crate) unsafe extern "C" fn inbox_create(
    result: *mut NativeHandle,
    transport: NativeHandle,
    queue: NativeHandle,
    on_msg: InboxMsgCallback,
    on_error: InboxErrorCallback,
    on_destroy: InboxDestroyCallback,
    closure: *mut c_void,
) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    let mut engine = lock();
    let (transport, queue) = (id_of(transport), id_of(queue));
    if !matches!(engine.objects.get(&transport), Some(Object::Transport(_))) {
        return STATUS_INVALID_ARG;
    }
    match engine.queue_mut(queue) {
        Some(q) => q.open += 1,
        None => return STATUS_INVALID_ARG,
    }
    let id = engine.insert(Object::Inbox(InboxObj {
        transport,
        queue,
        on_msg,
        on_error,
        on_destroy,
        closure: closure as usize,
        destroying: false,
    }));
    *result = handle_of(id);
    STATUS_OK
}

pub(crate) unsafe extern "C" fn inbox_destroy(inbox: NativeHandle) -> RawStatus {
    let mut engine = lock();
    let id = id_of(inbox);
    let (queue, callback, closure) = match engine.objects.get_mut(&id) {
        Some(Object::Inbox(i)) if !i.destroying => {
            i.destroying = true;
            (i.queue, i.on_destroy, i.closure)
        }
        _ => return engine.note_double_destroy("inbox", id),
    };
    engine.push_event(queue, Event::InboxDestroyed { callback, inbox: id, closure });
    STATUS_OK
}

// -- subscription ------------------------------------------------------------

pub(crate) unsafe extern "C" fn subscription_create(
    result: *mut NativeHandle,
    transport: NativeHandle,
    queue: NativeHandle,
    callbacks: *const SubscriptionCallbacks,
    topic: *const c_char,
    closure: *mut c_void,
) -> RawStatus {
    if result.is_null() || callbacks.is_null() || topic.is_null() {
        return STATUS_NULL_ARG;
    }
    let callbacks = *callbacks;
    let topic = CStr::from_ptr(topic).to_owned();
    let topic_name = topic.clone();
    let mut engine = lock();
    let (transport, queue) = (id_of(transport), id_of(queue));
    if !matches!(engine.objects.get(&transport), Some(Object::Transport(_))) {
        return STATUS_INVALID_ARG;
    }
    match engine.queue_mut(queue) {
        Some(q) => q.open += 1,
        None => return STATUS_INVALID_ARG,
    }
    let closure = closure as usize;
    let id = engine.insert(Object::Subscription(SubscriptionObj {
        transport,
        queue,
        callbacks,
        topic,
        state: ffi::SUBSCRIPTION_STATE_CREATING,
        closure,
    }));
    engine.notify_topic(transport, ffi::TRANSPORT_TOPIC_SUBSCRIBED, &topic_name);
    match callbacks.on_create {
        Some(callback) => {
            engine.push_event(queue, Event::SubscriptionCreated { callback, subscription: id, closure });
        }
        None => {
            if let Some(Object::Subscription(s)) = engine.objects.get_mut(&id) {
                s.state = ffi::SUBSCRIPTION_STATE_ACTIVATED;
            }
        }
    }
    *result = handle_of(id);
    STATUS_OK
}

pub(crate) unsafe extern "C" fn subscription_destroy(subscription: NativeHandle) -> RawStatus {
    let mut engine = lock();
    let id = id_of(subscription);
    let (transport, topic, queue, callback, closure) = match engine.objects.get_mut(&id) {
        Some(Object::Subscription(s)) if s.state != ffi::SUBSCRIPTION_STATE_DESTROYING => {
            s.state = ffi::SUBSCRIPTION_STATE_DESTROYING;
            (s.transport, s.topic.clone(), s.queue, s.callbacks.on_destroy, s.closure)
        }
        _ => return engine.note_double_destroy("subscription", id),
    };
    engine.notify_topic(transport, ffi::TRANSPORT_TOPIC_UNSUBSCRIBED, &topic);
    engine.push_event(
        queue,
        Event::SubscriptionDestroyed {
            callback,
            subscription: id,
            closure,
        },
    );
    STATUS_OK
}

pub(crate) unsafe extern "C" fn subscription_get_state(subscription: NativeHandle, result: *mut c_int) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    match lock().objects.get(&id_of(subscription)) {
        Some(Object::Subscription(s)) => {
            *result = s.state;
            STATUS_OK
        }
        _ => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn subscription_get_topic(
    subscription: NativeHandle,
    result: *mut *const c_char,
) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    match lock().objects.get(&id_of(subscription)) {
        Some(Object::Subscription(s)) => {
            *result = s.topic.as_ptr();
            STATUS_OK
        }
        _ => STATUS_INVALID_ARG,
    }
}

/// Deliver an error to a live subscription's queue, as a transport would on
/// e.g. a lost entitlement.
pub(crate) fn inject_subscription_error(subscription: NativeHandle, status: RawStatus) -> bool {
    let (callback, closure) = {
        let engine = lock();
        match engine.objects.get(&id_of(subscription)) {
            Some(Object::Subscription(s)) if s.state != ffi::SUBSCRIPTION_STATE_DESTROYING => {
                match s.callbacks.on_error {
                    Some(callback) => (callback, s.closure),
                    None => return false,
                }
            }
            _ => return false,
        }
    };
    callback(subscription, status, closure_ptr(closure));
    true
}
