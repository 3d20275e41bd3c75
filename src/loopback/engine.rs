// Shared state of the loopback engine.
//
// One global table maps ids to objects; a handle is its id cast to a
// pointer. Callbacks are never invoked with the engine lock held, so user
// code may call straight back into the engine.

use super::message::MessageObj;
use crate::ffi::{
    self, InboxDestroyCallback, InboxErrorCallback, InboxMsgCallback, NativeHandle, QueueEnqueueCallback,
    QueueEventCallback, QueueMonitorCallbacks, QueueWatermarkCallback, RawStatus, SendCompleteCallback,
    SubscriptionCallbacks, SubscriptionCreateCallback, SubscriptionDestroyCallback, SubscriptionMsgCallback,
    TimerCallback, TransportCallback, TransportTopicCallback,
};
use crossbeam_utils::Backoff;
use lazy_static::lazy_static;
use libc::{c_int, c_void};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::ffi::{CStr, CString};
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub(crate) const STATUS_INVALID_ARG: RawStatus = 4;
pub(crate) const STATUS_NO_SUBSCRIBERS: RawStatus = 5006;

/// Closure argument as stored by the engine.
pub(crate) type RawClosure = usize;

pub(crate) fn id_of(handle: NativeHandle) -> u64 {
    handle.addr() as u64
}

pub(crate) fn handle_of(id: u64) -> NativeHandle {
    NativeHandle::from_raw(id as usize as *mut c_void)
}

pub(crate) fn closure_ptr(closure: RawClosure) -> *mut c_void {
    closure as *mut c_void
}

pub(crate) struct TransportObj {
    pub name: CString,
    pub throttle: f64,
    pub callback: Option<(TransportCallback, RawClosure)>,
    pub topic_callback: Option<(TransportTopicCallback, RawClosure)>,
}

pub(crate) struct QueueObj {
    pub events: VecDeque<Event>,
    /// Timers, inboxes and subscriptions not yet fully destroyed.
    pub open: usize,
    pub stop_requested: bool,
    /// Zero disables the high-watermark check.
    pub high_watermark: usize,
    pub low_watermark: usize,
    above_high: bool,
    pub enqueue: Option<(QueueEnqueueCallback, RawClosure)>,
    pub monitor: Option<(QueueMonitorCallbacks, RawClosure)>,
}

impl Default for QueueObj {
    fn default() -> Self {
        Self {
            events: VecDeque::new(),
            open: 0,
            stop_requested: false,
            high_watermark: 0,
            low_watermark: 1,
            above_high: false,
            enqueue: None,
            monitor: None,
        }
    }
}

impl QueueObj {
    /// Called once per dispatched event with the queue size before the pop.
    ///
    /// Above the high mark every dispatch reports; once it has been exceeded,
    /// the first dispatch that leaves the queue at or below the low mark
    /// reports once.
    fn watermark_crossing(&mut self, size: usize) -> Option<(QueueWatermarkCallback, usize, RawClosure)> {
        let (callbacks, closure) = self.monitor?;
        if self.high_watermark > 0 && size > self.high_watermark {
            self.above_high = true;
            return callbacks.on_high_watermark_exceeded.map(|cb| (cb, size, closure));
        }
        let remaining = self.events.len();
        if self.above_high && remaining <= self.low_watermark {
            self.above_high = false;
            return callbacks.on_low_watermark.map(|cb| (cb, remaining, closure));
        }
        None
    }
}

pub(crate) struct PublisherObj {
    pub transport: u64,
    pub topic: String,
}

pub(crate) struct TimerObj {
    pub queue: u64,
    pub tick: TimerCallback,
    pub destroy: TimerCallback,
    pub interval: f64,
    pub next_due: Instant,
    pub closure: RawClosure,
    pub destroying: bool,
}

pub(crate) struct InboxObj {
    pub transport: u64,
    pub queue: u64,
    pub on_msg: InboxMsgCallback,
    pub on_error: InboxErrorCallback,
    pub on_destroy: InboxDestroyCallback,
    pub closure: RawClosure,
    pub destroying: bool,
}

pub(crate) struct SubscriptionObj {
    pub transport: u64,
    pub queue: u64,
    pub callbacks: SubscriptionCallbacks,
    pub topic: CString,
    pub state: c_int,
    pub closure: RawClosure,
}

pub(crate) enum Object {
    Transport(TransportObj),
    Queue(QueueObj),
    Message(MessageObj),
    Field { msg: u64, index: usize },
    Publisher(PublisherObj),
    Timer(TimerObj),
    Inbox(InboxObj),
    Subscription(SubscriptionObj),
}

#[derive(Clone, Copy)]
pub(crate) enum Event {
    User { callback: QueueEventCallback, closure: RawClosure },
    TimerDestroyed { callback: TimerCallback, timer: u64, closure: RawClosure },
    InboxReply { callback: InboxMsgCallback, inbox: u64, msg: u64, closure: RawClosure },
    InboxError { callback: InboxErrorCallback, inbox: u64, status: RawStatus, closure: RawClosure },
    InboxDestroyed { callback: InboxDestroyCallback, inbox: u64, closure: RawClosure },
    SubscriptionCreated { callback: SubscriptionCreateCallback, subscription: u64, closure: RawClosure },
    SubscriptionMsg { callback: SubscriptionMsgCallback, subscription: u64, msg: u64, closure: RawClosure },
    SubscriptionDestroyed { callback: Option<SubscriptionDestroyCallback>, subscription: u64, closure: RawClosure },
}

#[derive(Clone, Copy)]
pub(crate) struct PendingSend {
    pub publisher: u64,
    pub msg: u64,
    /// Set for sends whose replies go to an inbox.
    pub reply_inbox: Option<u64>,
    pub callback: SendCompleteCallback,
    pub closure: RawClosure,
}

/// Callback owed to user code, run once the engine lock is released.
pub(crate) enum Notification {
    Enqueued {
        callback: QueueEnqueueCallback,
        queue: u64,
        closure: RawClosure,
    },
    Topic {
        callback: TransportTopicCallback,
        transport: u64,
        event: c_int,
        topic: CString,
        closure: RawClosure,
    },
}

impl Notification {
    fn run(self) {
        match self {
            Notification::Enqueued { callback, queue, closure } => callback(handle_of(queue), closure_ptr(closure)),
            Notification::Topic {
                callback,
                transport,
                event,
                topic,
                closure,
            } => callback(handle_of(transport), event, topic.as_ptr(), ptr::null(), closure_ptr(closure)),
        }
    }
}

/// Activity counters, for tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub created: u64,
    pub destroyed: u64,
    pub messages_destroyed: u64,
    /// Destroy calls for handles that were unknown or already being destroyed.
    pub double_destroys: u64,
    pub completions: u64,
    pub live_objects: usize,
    /// Field views handed out and not yet released with their message.
    pub field_views: usize,
}

pub(crate) struct Engine {
    next_id: u64,
    pub objects: HashMap<u64, Object>,
    pub throttle: VecDeque<PendingSend>,
    pub last_completion: Option<PendingSend>,
    pub counters: Counters,
    notifications: Vec<Notification>,
}

lazy_static! {
    pub(crate) static ref ENGINE: Mutex<Engine> = Mutex::new(Engine::new());
}

/// Engine lock. Notifications queued while it was held run on the same
/// thread right after it is released.
pub(crate) struct EngineGuard {
    guard: MutexGuard<'static, Engine>,
}

impl Deref for EngineGuard {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.guard
    }
}

impl DerefMut for EngineGuard {
    fn deref_mut(&mut self) -> &mut Engine {
        &mut self.guard
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        if self.guard.notifications.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.guard.notifications);
        MutexGuard::unlocked(&mut self.guard, || {
            for notification in pending {
                notification.run();
            }
        });
    }
}

pub(crate) fn lock() -> EngineGuard {
    EngineGuard { guard: ENGINE.lock() }
}

impl Engine {
    fn new() -> Self {
        Self {
            next_id: 1,
            objects: HashMap::new(),
            throttle: VecDeque::new(),
            last_completion: None,
            counters: Counters::default(),
            notifications: Vec::new(),
        }
    }

    pub fn insert(&mut self, object: Object) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if !matches!(object, Object::Field { .. }) {
            self.counters.created += 1;
        }
        self.objects.insert(id, object);
        id
    }

    /// Remove a message together with the field views handed out for it.
    pub fn remove_message(&mut self, id: u64) -> bool {
        match self.objects.remove(&id) {
            Some(Object::Message(msg)) => {
                for field in msg.field_views.into_values() {
                    self.objects.remove(&field);
                }
                self.counters.destroyed += 1;
                self.counters.messages_destroyed += 1;
                true
            }
            Some(other) => {
                self.objects.insert(id, other);
                false
            }
            None => false,
        }
    }

    pub fn remove_object(&mut self, id: u64) -> Option<Object> {
        let removed = self.objects.remove(&id);
        if removed.is_some() {
            self.counters.destroyed += 1;
        }
        removed
    }

    pub fn note_double_destroy(&mut self, kind: &'static str, id: u64) -> RawStatus {
        self.counters.double_destroys += 1;
        warn!(kind, id, "destroy of unknown or dying handle");
        STATUS_INVALID_ARG
    }

    pub fn queue_mut(&mut self, id: u64) -> Option<&mut QueueObj> {
        match self.objects.get_mut(&id) {
            Some(Object::Queue(queue)) => Some(queue),
            _ => None,
        }
    }

    pub fn message(&self, id: u64) -> Option<&MessageObj> {
        match self.objects.get(&id) {
            Some(Object::Message(msg)) => Some(msg),
            _ => None,
        }
    }

    pub fn message_mut(&mut self, id: u64) -> Option<&mut MessageObj> {
        match self.objects.get_mut(&id) {
            Some(Object::Message(msg)) => Some(msg),
            _ => None,
        }
    }

    pub fn push_event(&mut self, queue: u64, event: Event) -> bool {
        let enqueue = match self.queue_mut(queue) {
            Some(q) => {
                q.events.push_back(event);
                q.enqueue
            }
            None => return false,
        };
        if let Some((callback, closure)) = enqueue {
            self.notifications.push(Notification::Enqueued { callback, queue, closure });
        }
        true
    }

    /// Tell the transport's topic callback, if any, about `topic`.
    pub fn notify_topic(&mut self, transport: u64, event: c_int, topic: &CStr) {
        if let Some(Object::Transport(t)) = self.objects.get(&transport) {
            if let Some((callback, closure)) = t.topic_callback {
                self.notifications.push(Notification::Topic {
                    callback,
                    transport,
                    event,
                    topic: topic.to_owned(),
                    closure,
                });
            }
        }
    }

    pub fn close_on_queue(&mut self, queue: u64) {
        if let Some(q) = self.queue_mut(queue) {
            q.open = q.open.saturating_sub(1);
        }
    }

    /// Copy `msg` to every live subscription on the publisher's topic.
    /// Returns how many subscriptions it reached.
    pub fn route(&mut self, publisher: u64, msg: u64, reply_inbox: Option<u64>) -> Result<usize, RawStatus> {
        let (transport, topic) = match self.objects.get(&publisher) {
            Some(Object::Publisher(p)) => (p.transport, p.topic.clone()),
            _ => return Err(STATUS_INVALID_ARG),
        };
        let source = match self.message(msg) {
            Some(m) => m.copy(),
            None => return Err(STATUS_INVALID_ARG),
        };

        let targets: Vec<(u64, u64, SubscriptionMsgCallback, RawClosure)> = self
            .objects
            .iter()
            .filter_map(|(id, object)| match object {
                Object::Subscription(s)
                    if s.transport == transport
                        && s.state != ffi::SUBSCRIPTION_STATE_DESTROYING
                        && s.topic.as_bytes() == topic.as_bytes() =>
                {
                    s.callbacks.on_msg.map(|cb| (*id, s.queue, cb, s.closure))
                }
                _ => None,
            })
            .collect();

        for (subscription, queue, callback, closure) in &targets {
            let mut copy = source.copy();
            copy.reply_inbox = reply_inbox;
            let copy_id = self.insert(Object::Message(copy));
            self.push_event(
                *queue,
                Event::SubscriptionMsg {
                    callback: *callback,
                    subscription: *subscription,
                    msg: copy_id,
                    closure: *closure,
                },
            );
        }
        trace!(publisher, topic = %topic, delivered = targets.len(), "message routed");
        Ok(targets.len())
    }

    /// Send `msg` with `inbox` as its reply address. An inbox whose request
    /// reaches nobody gets a NO_SUBSCRIBERS error on its queue.
    pub fn send_from_inbox(&mut self, publisher: u64, inbox: u64, msg: u64) -> RawStatus {
        let (transport, queue, on_error, closure) = match self.objects.get(&inbox) {
            Some(Object::Inbox(i)) if !i.destroying => (i.transport, i.queue, i.on_error, i.closure),
            _ => return STATUS_INVALID_ARG,
        };
        // Replies can only come back over the transport the inbox listens on
        if !matches!(self.objects.get(&publisher), Some(Object::Publisher(p)) if p.transport == transport) {
            return STATUS_INVALID_ARG;
        }
        match self.route(publisher, msg, Some(inbox)) {
            Ok(0) => {
                self.push_event(
                    queue,
                    Event::InboxError {
                        callback: on_error,
                        inbox,
                        status: STATUS_NO_SUBSCRIBERS,
                        closure,
                    },
                );
                ffi::STATUS_OK
            }
            Ok(_) => ffi::STATUS_OK,
            Err(status) => status,
        }
    }

    pub fn snapshot(&self) -> Counters {
        let mut counters = self.counters;
        let fields = self
            .objects
            .values()
            .filter(|o| matches!(o, Object::Field { .. }))
            .count();
        counters.field_views = fields;
        counters.live_objects = self.objects.len() - fields;
        counters
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.throttle.clear();
        self.last_completion = None;
        self.counters = Counters::default();
        self.notifications.clear();
    }
}

/// Complete every queued throttled send on the calling thread.
pub(crate) fn run_throttle() -> usize {
    let pending: Vec<PendingSend> = lock().throttle.drain(..).collect();
    for send in &pending {
        let status = {
            let mut engine = lock();
            engine.counters.completions += 1;
            engine.last_completion = Some(*send);
            match send.reply_inbox {
                Some(inbox) => engine.send_from_inbox(send.publisher, inbox, send.msg),
                None => match engine.route(send.publisher, send.msg, None) {
                    Ok(_) => ffi::STATUS_OK,
                    Err(status) => status,
                },
            }
        };
        (send.callback)(handle_of(send.publisher), handle_of(send.msg), status, closure_ptr(send.closure));
    }
    pending.len()
}

pub(crate) fn replay_last_completion() -> bool {
    let last = lock().last_completion;
    match last {
        Some(send) => {
            debug!(publisher = send.publisher, msg = send.msg, "replaying throttled send completion");
            (send.callback)(handle_of(send.publisher), handle_of(send.msg), ffi::STATUS_OK, closure_ptr(send.closure));
            true
        }
        None => false,
    }
}

/// Fire due timers, then deliver at most one queued event.
/// Returns whether anything ran.
pub(crate) fn dispatch_one(queue: u64) -> Result<bool, RawStatus> {
    let throttled = run_throttle() > 0;
    let ticked = fire_due_timers(queue)? > 0;

    let (event, crossing) = {
        let mut engine = lock();
        match engine.queue_mut(queue) {
            Some(q) => {
                let size = q.events.len();
                match q.events.pop_front() {
                    Some(event) => (Some(event), q.watermark_crossing(size)),
                    None => (None, None),
                }
            }
            None => return Err(STATUS_INVALID_ARG),
        }
    };
    if let Some((callback, size, closure)) = crossing {
        callback(handle_of(queue), size, closure_ptr(closure));
    }
    let delivered = match event {
        Some(event) => {
            deliver(queue, event);
            true
        }
        None => false,
    };
    Ok(throttled || ticked || delivered)
}

fn fire_due_timers(queue: u64) -> Result<usize, RawStatus> {
    let due: Vec<(u64, TimerCallback, RawClosure)> = {
        let mut engine = lock();
        if engine.queue_mut(queue).is_none() {
            return Err(STATUS_INVALID_ARG);
        }
        let now = Instant::now();
        engine
            .objects
            .iter_mut()
            .filter_map(|(id, object)| match object {
                Object::Timer(t) if t.queue == queue && !t.destroying && t.next_due <= now => {
                    t.next_due = now + interval_duration(t.interval);
                    Some((*id, t.tick, t.closure))
                }
                _ => None,
            })
            .collect()
    };
    for (timer, tick, closure) in &due {
        tick(handle_of(*timer), closure_ptr(*closure));
    }
    Ok(due.len())
}

pub(crate) fn interval_duration(interval: f64) -> Duration {
    if interval.is_finite() && interval > 0.0 {
        Duration::from_secs_f64(interval)
    } else {
        Duration::ZERO
    }
}

fn deliver(queue: u64, event: Event) {
    match event {
        Event::User { callback, closure } => callback(handle_of(queue), closure_ptr(closure)),
        Event::TimerDestroyed { callback, timer, closure } => {
            {
                let mut engine = lock();
                engine.remove_object(timer);
                engine.close_on_queue(queue);
            }
            callback(handle_of(timer), closure_ptr(closure));
        }
        Event::InboxReply { callback, inbox, msg, closure } => {
            let live = matches!(lock().objects.get(&inbox), Some(Object::Inbox(i)) if !i.destroying);
            if live {
                callback(handle_of(msg), closure_ptr(closure));
            }
            lock().remove_message(msg);
        }
        Event::InboxError { callback, inbox, status, closure } => {
            let live = matches!(lock().objects.get(&inbox), Some(Object::Inbox(i)) if !i.destroying);
            if live {
                callback(status, closure_ptr(closure));
            }
        }
        Event::InboxDestroyed { callback, inbox, closure } => {
            {
                let mut engine = lock();
                engine.remove_object(inbox);
                engine.close_on_queue(queue);
            }
            callback(handle_of(inbox), closure_ptr(closure));
        }
        Event::SubscriptionCreated { callback, subscription, closure } => {
            let activated = {
                let mut engine = lock();
                match engine.objects.get_mut(&subscription) {
                    Some(Object::Subscription(s)) if s.state == ffi::SUBSCRIPTION_STATE_CREATING => {
                        s.state = ffi::SUBSCRIPTION_STATE_ACTIVATED;
                        true
                    }
                    _ => false,
                }
            };
            if activated {
                callback(handle_of(subscription), closure_ptr(closure));
            }
        }
        Event::SubscriptionMsg { callback, subscription, msg, closure } => {
            let live = matches!(
                lock().objects.get(&subscription),
                Some(Object::Subscription(s)) if s.state != ffi::SUBSCRIPTION_STATE_DESTROYING
            );
            if live {
                callback(handle_of(subscription), handle_of(msg), closure_ptr(closure), ptr::null_mut());
            }
            lock().remove_message(msg);
        }
        Event::SubscriptionDestroyed { callback, subscription, closure } => {
            {
                let mut engine = lock();
                engine.remove_object(subscription);
                engine.close_on_queue(queue);
            }
            if let Some(callback) = callback {
                callback(handle_of(subscription), closure_ptr(closure));
            }
        }
    }
}

/// Outcome of trying to release a queue.
pub(crate) fn try_destroy_queue(queue: u64) -> RawStatus {
    let mut engine = lock();
    match engine.queue_mut(queue) {
        Some(q) if q.open == 0 && q.events.is_empty() => {
            engine.remove_object(queue);
            debug!(queue, "queue destroyed");
            ffi::STATUS_OK
        }
        Some(_) => ffi::STATUS_QUEUE_OPEN_OBJECTS,
        None => engine.note_double_destroy("queue", queue),
    }
}

/// Dispatch slice between two destroy attempts while waiting.
const DRAIN_SLICE: Duration = Duration::from_millis(10);

/// Keep dispatching and retrying the destroy until no object is left open
/// on the queue.
pub(crate) fn drain_and_destroy(queue: u64) -> RawStatus {
    drain_until(queue, None)
}

/// As [`drain_and_destroy`], giving up with TIMEOUT once `timeout` elapses.
pub(crate) fn drain_and_destroy_timed(queue: u64, timeout: Duration) -> RawStatus {
    drain_until(queue, Some(Instant::now() + timeout))
}

fn drain_until(queue: u64, deadline: Option<Instant>) -> RawStatus {
    loop {
        match try_destroy_queue(queue) {
            ffi::STATUS_QUEUE_OPEN_OBJECTS => {}
            status => return status,
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return ffi::STATUS_TIMEOUT;
                }
                (deadline - now).min(DRAIN_SLICE)
            }
            None => DRAIN_SLICE,
        };
        match timed_dispatch(queue, slice) {
            ffi::STATUS_OK => {}
            status => return status,
        }
    }
}

/// Dispatch until [`stop_dispatch`] is called for the queue or the queue
/// is destroyed.
pub(crate) fn dispatch_until_stopped(queue: u64) -> RawStatus {
    match lock().queue_mut(queue) {
        Some(q) => q.stop_requested = false,
        None => return STATUS_INVALID_ARG,
    }
    debug!(queue, "dispatcher started");
    let backoff = Backoff::new();
    loop {
        let stop = match lock().queue_mut(queue) {
            Some(q) => q.stop_requested,
            None => true,
        };
        if stop {
            debug!(queue, "dispatcher stopped");
            return ffi::STATUS_OK;
        }
        match dispatch_one(queue) {
            Ok(true) => backoff.reset(),
            Ok(false) if backoff.is_completed() => std::thread::sleep(Duration::from_millis(1)),
            Ok(false) => backoff.snooze(),
            // Destroyed under the dispatcher
            Err(_) => return ffi::STATUS_OK,
        }
    }
}

pub(crate) fn stop_dispatch(queue: u64) -> RawStatus {
    match lock().queue_mut(queue) {
        Some(q) => {
            q.stop_requested = true;
            ffi::STATUS_OK
        }
        None => STATUS_INVALID_ARG,
    }
}

/// Dispatch until nothing has run for `timeout`.
pub(crate) fn timed_dispatch(queue: u64, timeout: Duration) -> RawStatus {
    let mut idle_since = Instant::now();
    loop {
        match dispatch_one(queue) {
            Ok(true) => idle_since = Instant::now(),
            Ok(false) => {
                let idle = idle_since.elapsed();
                if idle >= timeout {
                    return ffi::STATUS_OK;
                }
                std::thread::sleep((timeout - idle).min(Duration::from_millis(1)));
            }
            Err(status) => return status,
        }
    }
}
