use super::registry::{guard, note_stray};
use super::Bridge;
use crate::ffi::{
    self, closure_from_key, key_from_closure, NativeHandle, QueueEnqueueCallback, QueueEventCallback,
    QueueMonitorCallbacks, QueueWatermarkCallback,
};
use crate::Core::{check, BridgeError, CallbackKey, CallbackStore, Closure, NativeWrapper, PeerHandle, Result, Status};
use lazy_static::lazy_static;
use libc::c_void;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// One-shot callback run on the queue's dispatch thread.
pub type QueueEvent = Box<dyn FnOnce(&Queue, &Closure) + Send>;

/// Run on the enqueuing thread each time an event lands on the queue.
pub type EnqueueCallback = Arc<dyn Fn(&Queue, &Closure) + Send + Sync>;

/// Receiver of queue size warnings, run on the dispatch thread.
pub trait QueueMonitor: Send + Sync {
    /// `size` events were waiting, more than the high watermark.
    fn on_high_watermark_exceeded(&self, queue: &Queue, size: usize, closure: &Closure);

    /// After the high watermark was exceeded, the backlog went down to `size`.
    fn on_low_watermark(&self, _queue: &Queue, _size: usize, _closure: &Closure) {}
}

impl<F> QueueMonitor for F
where
    F: Fn(&Queue, usize, &Closure) + Send + Sync,
{
    fn on_high_watermark_exceeded(&self, queue: &Queue, size: usize, closure: &Closure) {
        self(queue, size, closure)
    }
}

pub(crate) struct QueueEventEntry {
    callback: QueueEvent,
    queue: Weak<QueueShared>,
    bridge: Bridge,
}

#[derive(Clone)]
pub(crate) struct EnqueueEntry {
    callback: EnqueueCallback,
    queue: Weak<QueueShared>,
    bridge: Bridge,
}

#[derive(Clone)]
pub(crate) struct MonitorEntry {
    handler: Arc<dyn QueueMonitor>,
    queue: Weak<QueueShared>,
    bridge: Bridge,
}

lazy_static! {
    pub(crate) static ref EVENTS: CallbackStore<QueueEventEntry, QueueEventCallback> =
        CallbackStore::new("queue_events");
    pub(crate) static ref ENQUEUE_CALLBACKS: CallbackStore<EnqueueEntry, QueueEnqueueCallback> =
        CallbackStore::new("queue_enqueue");
    pub(crate) static ref QUEUE_MONITORS: CallbackStore<MonitorEntry, QueueWatermarkCallback> =
        CallbackStore::new("queue_monitors");
}

pub(crate) struct QueueShared {
    bridge: Bridge,
    peer: PeerHandle,
    /// Set while a thread is inside [`Queue::dispatch`].
    dispatching: AtomicBool,
    enqueue_key: Mutex<Option<CallbackKey>>,
    monitor_key: Mutex<Option<CallbackKey>>,
}

impl QueueShared {
    fn new(bridge: &Bridge, peer: PeerHandle) -> Self {
        Self {
            bridge: bridge.clone(),
            peer,
            dispatching: AtomicBool::new(false),
            enqueue_key: Mutex::new(None),
            monitor_key: Mutex::new(None),
        }
    }

    /// Drop the enqueue callback and monitor registered through this wrapper.
    fn release_registrations(&self) {
        if let Some(key) = self.enqueue_key.lock().take() {
            let _ = ENQUEUE_CALLBACKS.remove(key);
        }
        if let Some(key) = self.monitor_key.lock().take() {
            let _ = QUEUE_MONITORS.remove(key);
        }
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        self.release_registrations();
    }
}

/// Event queue of the engine. Callbacks of every object created on it are
/// delivered by whichever thread dispatches the queue.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<QueueShared>,
}

impl Queue {
    pub fn create(bridge: &Bridge) -> Result<Queue> {
        let api = bridge.api();
        let peer = PeerHandle::new("queue", api.queue_destroy);
        peer.create(|out| unsafe { (api.queue_create)(out) })?;
        Ok(Queue {
            shared: Arc::new(QueueShared::new(bridge, peer)),
        })
    }

    /// Non-owning wrapper around a queue handle the engine handed out.
    pub(crate) fn view(bridge: &Bridge, handle: NativeHandle) -> Queue {
        Queue {
            shared: Arc::new(QueueShared::new(bridge, PeerHandle::view("queue", handle))),
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.shared.bridge
    }

    pub fn native_handle(&self) -> Result<NativeHandle> {
        self.shared.peer.ensure_created()
    }

    /// Run `callback` once on the queue's dispatch thread.
    pub fn enqueue_event<F>(&self, closure: Closure, callback: F) -> Result<()>
    where
        F: FnOnce(&Queue, &Closure) + Send + 'static,
    {
        let handle = self.native_handle()?;
        let entry = QueueEventEntry {
            callback: Box::new(callback),
            queue: Arc::downgrade(&self.shared),
            bridge: self.shared.bridge.clone(),
        };
        let key = EVENTS.register(entry, closure, on_queue_event);
        let code = unsafe {
            (self.api().queue_enqueue_event)(handle, on_queue_event, closure_from_key(key))
        };
        if let Err(e) = check(code) {
            // The engine never saw the event
            let _ = EVENTS.remove(key);
            return Err(e);
        }
        Ok(())
    }

    /// Dispatch a single pending event, if any.
    pub fn dispatch_event(&self) -> Result<()> {
        let handle = self.native_handle()?;
        check(unsafe { (self.api().queue_dispatch_event)(handle) })
    }

    /// Dispatch events until the queue stays empty for `timeout`.
    pub fn timed_dispatch(&self, timeout: Duration) -> Result<()> {
        let handle = self.native_handle()?;
        check(unsafe { (self.api().queue_timed_dispatch)(handle, timeout.as_millis() as u64) })
    }

    /// Dispatch on the calling thread until [`stop_dispatch`](Self::stop_dispatch)
    /// is called or the queue is destroyed.
    pub fn dispatch(&self) -> Result<()> {
        let handle = self.native_handle()?;
        if self.shared.dispatching.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::InvalidArgument("queue is already being dispatched"));
        }
        let result = check(unsafe { (self.api().queue_dispatch)(handle) });
        self.shared.dispatching.store(false, Ordering::Release);
        result
    }

    /// Make a running [`dispatch`](Self::dispatch) return.
    pub fn stop_dispatch(&self) -> Result<()> {
        let handle = self.native_handle()?;
        check(unsafe { (self.api().queue_stop_dispatch)(handle) })
    }

    pub fn is_dispatching(&self) -> bool {
        self.shared.dispatching.load(Ordering::Acquire)
    }

    /// Number of events waiting on the queue.
    pub fn event_count(&self) -> Result<usize> {
        let handle = self.native_handle()?;
        let mut count = 0usize;
        check(unsafe { (self.api().queue_get_event_count)(handle, &mut count) })?;
        Ok(count)
    }

    /// Call `callback` on the enqueuing thread whenever an event is queued.
    /// Replaces the previous enqueue callback.
    pub fn set_enqueue_callback<F>(&self, closure: Closure, callback: F) -> Result<()>
    where
        F: Fn(&Queue, &Closure) + Send + Sync + 'static,
    {
        let handle = self.native_handle()?;
        let entry = EnqueueEntry {
            callback: Arc::new(callback),
            queue: Arc::downgrade(&self.shared),
            bridge: self.shared.bridge.clone(),
        };
        let key = ENQUEUE_CALLBACKS.register(entry, closure, on_queue_enqueue);
        let code = unsafe {
            (self.api().queue_set_enqueue_callback)(handle, on_queue_enqueue, closure_from_key(key))
        };
        if let Err(e) = check(code) {
            let _ = ENQUEUE_CALLBACKS.remove(key);
            return Err(e);
        }
        if let Some(previous) = self.shared.enqueue_key.lock().replace(key) {
            let _ = ENQUEUE_CALLBACKS.remove(previous);
        }
        Ok(())
    }

    pub fn remove_enqueue_callback(&self) -> Result<()> {
        let handle = self.native_handle()?;
        check(unsafe { (self.api().queue_remove_enqueue_callback)(handle) })?;
        if let Some(key) = self.shared.enqueue_key.lock().take() {
            let _ = ENQUEUE_CALLBACKS.remove(key);
        }
        Ok(())
    }

    /// Report backlog crossings of the high and low watermarks to `handler`.
    /// Replaces the previous monitor.
    pub fn set_queue_monitor<H>(&self, handler: H, closure: Closure) -> Result<()>
    where
        H: QueueMonitor + 'static,
    {
        let handle = self.native_handle()?;
        let entry = MonitorEntry {
            handler: Arc::new(handler),
            queue: Arc::downgrade(&self.shared),
            bridge: self.shared.bridge.clone(),
        };
        let key = QUEUE_MONITORS.register(entry, closure, on_high_watermark);
        let callbacks = QueueMonitorCallbacks {
            on_high_watermark_exceeded: Some(on_high_watermark),
            on_low_watermark: Some(on_low_watermark),
        };
        let code = unsafe { (self.api().queue_set_monitor_callbacks)(handle, &callbacks, closure_from_key(key)) };
        if let Err(e) = check(code) {
            let _ = QUEUE_MONITORS.remove(key);
            return Err(e);
        }
        if let Some(previous) = self.shared.monitor_key.lock().replace(key) {
            let _ = QUEUE_MONITORS.remove(previous);
        }
        trace!(key, "queue monitor registered");
        Ok(())
    }

    /// Zero turns the high-watermark warning off. Must not be below the low
    /// watermark.
    pub fn set_high_watermark(&self, watermark: usize) -> Result<()> {
        let handle = self.native_handle()?;
        check(unsafe { (self.api().queue_set_high_watermark)(handle, watermark) })
    }

    pub fn high_watermark(&self) -> Result<usize> {
        let handle = self.native_handle()?;
        let mut watermark = 0usize;
        check(unsafe { (self.api().queue_get_high_watermark)(handle, &mut watermark) })?;
        Ok(watermark)
    }

    /// Values below one are raised to one.
    pub fn set_low_watermark(&self, watermark: usize) -> Result<()> {
        let handle = self.native_handle()?;
        check(unsafe { (self.api().queue_set_low_watermark)(handle, watermark) })
    }

    pub fn low_watermark(&self) -> Result<usize> {
        let handle = self.native_handle()?;
        let mut watermark = 0usize;
        check(unsafe { (self.api().queue_get_low_watermark)(handle, &mut watermark) })?;
        Ok(watermark)
    }

    /// Whether every object created on the queue has been destroyed.
    pub fn can_destroy(&self) -> Result<bool> {
        let handle = self.native_handle()?;
        match unsafe { (self.api().queue_can_destroy)(handle) } {
            ffi::STATUS_OK => Ok(true),
            ffi::STATUS_QUEUE_OPEN_OBJECTS => Ok(false),
            other => Err(BridgeError::Native(Status::from_code(other))),
        }
    }

    /// Destroy now. Fails with `QUEUE_OPEN_OBJECTS` while objects created on
    /// the queue are still alive; the queue then stays usable.
    pub fn destroy(&self) -> Result<()> {
        self.shared.peer.ensure_created()?;
        let api = self.api();
        self.shared
            .peer
            .destroy_with(|handle| unsafe { (api.queue_destroy)(handle) })?;
        self.shared.release_registrations();
        Ok(())
    }

    /// Block until the engine guarantees no further callbacks, then destroy.
    pub fn destroy_wait(&self) -> Result<()> {
        self.shared.peer.ensure_created()?;
        self.take_over_dispatch()?;
        let api = self.api();
        debug!(handle = ?self.shared.peer.handle(), "waiting for queue to drain before destroy");
        self.shared
            .peer
            .destroy_with(|handle| unsafe { (api.queue_destroy_wait)(handle) })?;
        self.shared.release_registrations();
        Ok(())
    }

    /// As [`destroy_wait`](Self::destroy_wait) but gives up after `timeout`,
    /// leaving the queue alive.
    pub fn destroy_timed_wait(&self, timeout: Duration) -> Result<()> {
        self.shared.peer.ensure_created()?;
        self.take_over_dispatch()?;
        let api = self.api();
        let millis = timeout.as_millis() as u64;
        match self
            .shared
            .peer
            .destroy_with(|handle| unsafe { (api.queue_destroy_timed_wait)(handle, millis) })
        {
            Ok(_) => {
                self.shared.release_registrations();
                Ok(())
            }
            Err(BridgeError::Native(Status::Timeout)) => Err(BridgeError::Timeout(timeout)),
            Err(e) => Err(e),
        }
    }

    /// The waiting destroy dispatches the queue itself; a running
    /// [`dispatch`](Self::dispatch) loop is asked to return first.
    fn take_over_dispatch(&self) -> Result<()> {
        if self.is_dispatching() {
            debug!("stopping dispatcher before destroy");
            self.stop_dispatch()?;
        }
        Ok(())
    }

    fn api(&self) -> &'static ffi::NativeApi {
        self.shared.bridge.api()
    }
}

impl NativeWrapper for Queue {
    fn peer(&self) -> &PeerHandle {
        &self.shared.peer
    }
}

extern "C" fn on_queue_event(queue: NativeHandle, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match EVENTS.resolve_and_remove(key) {
        Ok((entry, user_closure)) => guard("queue_event", move || {
            let target = match entry.queue.upgrade() {
                Some(shared) => Queue { shared },
                None => Queue::view(&entry.bridge, queue),
            };
            (entry.callback)(&target, &user_closure);
        }),
        Err(e) => note_stray(EVENTS.name(), key, &e),
    }
}

fn monitor_target(entry: &MonitorEntry, queue: NativeHandle) -> Queue {
    match entry.queue.upgrade() {
        Some(shared) => Queue { shared },
        None => Queue::view(&entry.bridge, queue),
    }
}

extern "C" fn on_queue_enqueue(queue: NativeHandle, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match ENQUEUE_CALLBACKS.get(key) {
        Ok((entry, user_closure)) => guard("queue_enqueue", move || {
            let target = match entry.queue.upgrade() {
                Some(shared) => Queue { shared },
                None => Queue::view(&entry.bridge, queue),
            };
            (entry.callback)(&target, &user_closure);
        }),
        Err(e) => note_stray(ENQUEUE_CALLBACKS.name(), key, &e),
    }
}

extern "C" fn on_high_watermark(queue: NativeHandle, size: usize, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match QUEUE_MONITORS.get(key) {
        Ok((entry, user_closure)) => guard("queue_high_watermark", move || {
            let target = monitor_target(&entry, queue);
            entry.handler.on_high_watermark_exceeded(&target, size, &user_closure);
        }),
        Err(e) => note_stray(QUEUE_MONITORS.name(), key, &e),
    }
}

extern "C" fn on_low_watermark(queue: NativeHandle, size: usize, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match QUEUE_MONITORS.get(key) {
        Ok((entry, user_closure)) => guard("queue_low_watermark", move || {
            let target = monitor_target(&entry, queue);
            entry.handler.on_low_watermark(&target, size, &user_closure);
        }),
        Err(e) => note_stray(QUEUE_MONITORS.name(), key, &e),
    }
}
