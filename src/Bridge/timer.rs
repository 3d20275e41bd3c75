use super::queue::Queue;
use super::registry::{guard, note_stray};
use super::Bridge;
use crate::ffi::{self, closure_from_key, key_from_closure, NativeApi, NativeHandle};
use crate::Core::{check, BridgeError, CallbackKey, CallbackStore, Closure, Disposal, NativeWrapper, PeerHandle, Result};
use lazy_static::lazy_static;
use libc::c_void;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Receiver of timer events, run on the dispatch thread of the timer's queue.
pub trait TimerHandler: Send + Sync {
    fn on_timer(&self, timer: &Timer, closure: &Closure);

    /// The engine has released the timer; no tick follows.
    fn on_destroy(&self, _timer: &Timer, _closure: &Closure) {}
}

impl<F> TimerHandler for F
where
    F: Fn(&Timer, &Closure) + Send + Sync,
{
    fn on_timer(&self, timer: &Timer, closure: &Closure) {
        self(timer, closure)
    }
}

#[derive(Clone)]
pub(crate) struct TimerEntry {
    handler: Arc<dyn TimerHandler>,
    timer: Weak<TimerShared>,
    bridge: Bridge,
}

lazy_static! {
    pub(crate) static ref TIMERS: CallbackStore<TimerEntry, ffi::TimerCallback> = CallbackStore::new("timers");
}

pub(crate) struct TimerShared {
    bridge: Bridge,
    peer: PeerHandle,
    key: CallbackKey,
    _queue: Option<Queue>,
}

/// Repeating timer. Ticks are delivered through the queue it was created on.
///
/// The registration outlives [`destroy`](Timer::destroy) until the engine
/// confirms the timer is gone through the destroy notification.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    /// `interval` is in seconds.
    pub fn create<H>(queue: &Queue, handler: H, interval: f64, closure: Closure) -> Result<Timer>
    where
        H: TimerHandler + 'static,
    {
        let bridge = queue.bridge().clone();
        validate_interval(&bridge, interval)?;
        let queue_handle = queue.native_handle()?;
        let api = bridge.api();

        let mut registered = None;
        let shared = Arc::new_cyclic(|weak: &Weak<TimerShared>| {
            let entry = TimerEntry {
                handler: Arc::new(handler),
                timer: weak.clone(),
                bridge: bridge.clone(),
            };
            let key = TIMERS.register(entry, closure, on_timer_tick);
            registered = Some(key);
            TimerShared {
                bridge: bridge.clone(),
                peer: PeerHandle::new("timer", api.timer_destroy),
                key,
                _queue: Some(queue.clone()),
            }
        });
        let key = registered.ok_or(BridgeError::NotInitialized)?;

        let created = shared.peer.create(|out| unsafe {
            (api.timer_create)(out, queue_handle, on_timer_tick, on_timer_destroy, interval, closure_from_key(key))
        });
        if let Err(e) = created {
            // No destroy notification will ever come for a timer the engine refused
            let _ = TIMERS.remove(key);
            return Err(e);
        }
        trace!(key, interval, "timer registered");
        Ok(Timer { shared })
    }

    fn view(bridge: &Bridge, handle: NativeHandle) -> Timer {
        Timer {
            shared: Arc::new(TimerShared {
                bridge: bridge.clone(),
                peer: PeerHandle::view("timer", handle),
                key: 0,
                _queue: None,
            }),
        }
    }

    pub fn native_handle(&self) -> Result<NativeHandle> {
        self.shared.peer.ensure_created()
    }

    /// Restart the current interval from now.
    pub fn reset(&self) -> Result<()> {
        let handle = self.native_handle()?;
        check(unsafe { (self.api().timer_reset)(handle) })
    }

    pub fn interval(&self) -> Result<f64> {
        let handle = self.native_handle()?;
        let mut interval = 0f64;
        check(unsafe { (self.api().timer_get_interval)(handle, &mut interval) })?;
        Ok(interval)
    }

    pub fn set_interval(&self, interval: f64) -> Result<()> {
        validate_interval(&self.shared.bridge, interval)?;
        let handle = self.native_handle()?;
        check(unsafe { (self.api().timer_set_interval)(handle, interval) })
    }

    /// Whether the engine still holds the tick registration.
    pub fn is_registered(&self) -> bool {
        self.shared.key != 0 && TIMERS.contains(self.shared.key)
    }

    pub fn destroy(&self) -> Result<Disposal> {
        self.shared.peer.dispose()
    }

    fn api(&self) -> &'static NativeApi {
        self.shared.bridge.api()
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_timer(self, f)
    }
}

impl NativeWrapper for Timer {
    fn peer(&self) -> &PeerHandle {
        &self.shared.peer
    }
}

fn validate_interval(bridge: &Bridge, interval: f64) -> Result<()> {
    if bridge.check_arguments() && !(interval.is_finite() && interval > 0.0) {
        return Err(BridgeError::InvalidArgument("timer interval must be a positive number of seconds"));
    }
    Ok(())
}

fn target(entry: &TimerEntry, handle: NativeHandle) -> Timer {
    match entry.timer.upgrade() {
        Some(shared) => Timer { shared },
        None => Timer::view(&entry.bridge, handle),
    }
}

extern "C" fn on_timer_tick(timer: NativeHandle, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match TIMERS.get(key) {
        Ok((entry, user_closure)) => guard("timer_tick", || {
            entry.handler.on_timer(&target(&entry, timer), &user_closure);
        }),
        Err(e) => note_stray(TIMERS.name(), key, &e),
    }
}

extern "C" fn on_timer_destroy(timer: NativeHandle, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match TIMERS.resolve_and_remove(key) {
        Ok((entry, user_closure)) => {
            trace!(key, "timer registration released");
            guard("timer_destroy", || {
                entry.handler.on_destroy(&target(&entry, timer), &user_closure);
            })
        }
        Err(e) => note_stray(TIMERS.name(), key, &e),
    }
}
