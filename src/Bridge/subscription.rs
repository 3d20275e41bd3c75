use super::marshal::{c_string, copy_c_str};
use super::message::Message;
use super::queue::Queue;
use super::registry::{guard, note_stray};
use super::transport::Transport;
use super::Bridge;
use crate::ffi::{
    self, closure_from_key, key_from_closure, NativeApi, NativeHandle, RawStatus, SubscriptionCallbacks,
};
use crate::Core::{
    check, BridgeError, CallbackKey, CallbackStore, Closure, Disposal, NativeWrapper, PeerHandle, Result, Status,
};
use lazy_static::lazy_static;
use libc::{c_char, c_int, c_void};
use parking_lot::Mutex;
use std::ptr;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Receiver of subscription events, run on the subscription's queue.
pub trait SubscriptionHandler: Send + Sync {
    fn on_create(&self, _subscription: &Subscription, _closure: &Closure) {}

    fn on_error(&self, _subscription: &Subscription, _status: Status, _closure: &Closure) {}

    /// `msg` is lent by the engine; it is rebound to the next message as
    /// soon as this returns.
    fn on_msg(&self, subscription: &Subscription, msg: &Message, closure: &Closure);

    fn on_destroy(&self, _subscription: &Subscription, _closure: &Closure) {}
}

impl<H: SubscriptionHandler + ?Sized> SubscriptionHandler for Arc<H> {
    fn on_create(&self, subscription: &Subscription, closure: &Closure) {
        (**self).on_create(subscription, closure)
    }

    fn on_error(&self, subscription: &Subscription, status: Status, closure: &Closure) {
        (**self).on_error(subscription, status, closure)
    }

    fn on_msg(&self, subscription: &Subscription, msg: &Message, closure: &Closure) {
        (**self).on_msg(subscription, msg, closure)
    }

    fn on_destroy(&self, subscription: &Subscription, closure: &Closure) {
        (**self).on_destroy(subscription, closure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Creating,
    Activated,
    Destroying,
    Unknown(c_int),
}

impl SubscriptionState {
    fn from_raw(raw: c_int) -> Self {
        match raw {
            ffi::SUBSCRIPTION_STATE_CREATING => SubscriptionState::Creating,
            ffi::SUBSCRIPTION_STATE_ACTIVATED => SubscriptionState::Activated,
            ffi::SUBSCRIPTION_STATE_DESTROYING => SubscriptionState::Destroying,
            other => SubscriptionState::Unknown(other),
        }
    }
}

#[derive(Clone)]
pub(crate) struct SubscriptionEntry {
    handler: Arc<dyn SubscriptionHandler>,
    subscription: Weak<SubscriptionShared>,
    bridge: Bridge,
}

lazy_static! {
    pub(crate) static ref SUBSCRIPTIONS: CallbackStore<SubscriptionEntry, SubscriptionCallbacks> =
        CallbackStore::new("subscriptions");
}

static CALLBACKS: SubscriptionCallbacks = SubscriptionCallbacks {
    on_create: Some(on_subscription_create),
    on_error: Some(on_subscription_error),
    on_msg: Some(on_subscription_msg),
    on_destroy: Some(on_subscription_destroy),
};

pub(crate) struct SubscriptionShared {
    bridge: Bridge,
    peer: PeerHandle,
    key: CallbackKey,
    topic: String,
    msg_view: Mutex<Option<Message>>,
    _transport: Option<Transport>,
    _queue: Option<Queue>,
}

/// Basic subscription to one topic.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub fn create<H>(transport: &Transport, queue: &Queue, handler: H, topic: &str, closure: Closure) -> Result<Subscription>
    where
        H: SubscriptionHandler + 'static,
    {
        let bridge = transport.bridge().clone();
        if bridge.check_arguments() && topic.is_empty() {
            return Err(BridgeError::InvalidArgument("topic must not be empty"));
        }
        let c_topic = c_string(topic, "topic")?;
        let transport_handle = transport.native_handle()?;
        let queue_handle = queue.native_handle()?;
        let api = bridge.api();

        let mut registered = None;
        let shared = Arc::new_cyclic(|weak: &Weak<SubscriptionShared>| {
            let entry = SubscriptionEntry {
                handler: Arc::new(handler),
                subscription: weak.clone(),
                bridge: bridge.clone(),
            };
            let key = SUBSCRIPTIONS.register(entry, closure, CALLBACKS);
            registered = Some(key);
            SubscriptionShared {
                bridge: bridge.clone(),
                peer: PeerHandle::new("subscription", api.subscription_destroy),
                key,
                topic: topic.to_string(),
                msg_view: Mutex::new(None),
                _transport: Some(transport.clone()),
                _queue: Some(queue.clone()),
            }
        });
        let key = registered.ok_or(BridgeError::NotInitialized)?;

        let created = shared.peer.create(|out| unsafe {
            (api.subscription_create)(
                out,
                transport_handle,
                queue_handle,
                &CALLBACKS,
                c_topic.as_ptr(),
                closure_from_key(key),
            )
        });
        if let Err(e) = created {
            let _ = SUBSCRIPTIONS.remove(key);
            return Err(e);
        }
        trace!(key, topic, "subscription registered");
        Ok(Subscription { shared })
    }

    fn detached(bridge: &Bridge, handle: NativeHandle) -> Subscription {
        Subscription {
            shared: Arc::new(SubscriptionShared {
                bridge: bridge.clone(),
                peer: PeerHandle::view("subscription", handle),
                key: 0,
                topic: String::new(),
                msg_view: Mutex::new(None),
                _transport: None,
                _queue: None,
            }),
        }
    }

    pub fn native_handle(&self) -> Result<NativeHandle> {
        self.shared.peer.ensure_created()
    }

    pub fn state(&self) -> Result<SubscriptionState> {
        let handle = self.native_handle()?;
        let mut raw: c_int = 0;
        check(unsafe { (self.api().subscription_get_state)(handle, &mut raw) })?;
        Ok(SubscriptionState::from_raw(raw))
    }

    /// Topic as the engine reports it.
    pub fn topic(&self) -> Result<String> {
        let handle = self.native_handle()?;
        let mut raw: *const c_char = ptr::null();
        check(unsafe { (self.api().subscription_get_topic)(handle, &mut raw) })?;
        Ok(unsafe { copy_c_str(raw) })
    }

    /// Topic requested at creation.
    pub fn requested_topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn is_registered(&self) -> bool {
        self.shared.key != 0 && SUBSCRIPTIONS.contains(self.shared.key)
    }

    pub fn destroy(&self) -> Result<Disposal> {
        NativeWrapper::dispose(self)
    }

    fn api(&self) -> &'static NativeApi {
        self.shared.bridge.api()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_subscription(self, f)
    }
}

impl NativeWrapper for Subscription {
    fn peer(&self) -> &PeerHandle {
        &self.shared.peer
    }

    fn on_dispose(&self) {
        self.shared.msg_view.lock().take();
    }
}

fn target(entry: &SubscriptionEntry, handle: NativeHandle) -> Subscription {
    match entry.subscription.upgrade() {
        Some(shared) => Subscription { shared },
        None => Subscription::detached(&entry.bridge, handle),
    }
}

extern "C" fn on_subscription_create(subscription: NativeHandle, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match SUBSCRIPTIONS.get(key) {
        Ok((entry, user_closure)) => guard("subscription_create", || {
            entry.handler.on_create(&target(&entry, subscription), &user_closure);
        }),
        Err(e) => note_stray(SUBSCRIPTIONS.name(), key, &e),
    }
}

extern "C" fn on_subscription_error(subscription: NativeHandle, status: RawStatus, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match SUBSCRIPTIONS.get(key) {
        Ok((entry, user_closure)) => guard("subscription_error", || {
            let target = target(&entry, subscription);
            entry.handler.on_error(&target, Status::from_code(status), &user_closure);
        }),
        Err(e) => note_stray(SUBSCRIPTIONS.name(), key, &e),
    }
}

extern "C" fn on_subscription_msg(
    subscription: NativeHandle,
    msg: NativeHandle,
    closure: *mut c_void,
    _item_closure: *mut c_void,
) {
    let key = key_from_closure(closure);
    let (entry, user_closure) = match SUBSCRIPTIONS.get(key) {
        Ok(resolved) => resolved,
        Err(e) => {
            note_stray(SUBSCRIPTIONS.name(), key, &e);
            return;
        }
    };
    let target = target(&entry, subscription);
    let view = target.shared.msg_view.lock().take();
    let view = match view {
        Some(view) => {
            unsafe { view.set_native_handle(msg) };
            view
        }
        None => Message::view(&entry.bridge, msg),
    };
    guard("subscription_msg", || entry.handler.on_msg(&target, &view, &user_closure));
    target.shared.msg_view.lock().get_or_insert(view);
}

extern "C" fn on_subscription_destroy(subscription: NativeHandle, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match SUBSCRIPTIONS.resolve_and_remove(key) {
        Ok((entry, user_closure)) => {
            trace!(key, "subscription registration released");
            guard("subscription_destroy", || {
                entry.handler.on_destroy(&target(&entry, subscription), &user_closure);
            })
        }
        Err(e) => note_stray(SUBSCRIPTIONS.name(), key, &e),
    }
}
