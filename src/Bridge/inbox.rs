use super::message::Message;
use super::queue::Queue;
use super::registry::{guard, note_stray};
use super::transport::Transport;
use super::Bridge;
use crate::ffi::{closure_from_key, key_from_closure, InboxMsgCallback, NativeHandle, RawStatus};
use crate::Core::{BridgeError, CallbackKey, CallbackStore, Closure, Disposal, NativeWrapper, PeerHandle, Result, Status};
use lazy_static::lazy_static;
use libc::c_void;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Receiver of replies addressed to an inbox.
pub trait InboxHandler: Send + Sync {
    /// `reply` is lent by the engine for the duration of the call.
    fn on_msg(&self, inbox: &Inbox, reply: &Message, closure: &Closure);

    fn on_error(&self, _inbox: &Inbox, _status: Status, _closure: &Closure) {}

    fn on_destroy(&self, _inbox: &Inbox, _closure: &Closure) {}
}

impl<H: InboxHandler + ?Sized> InboxHandler for Arc<H> {
    fn on_msg(&self, inbox: &Inbox, reply: &Message, closure: &Closure) {
        (**self).on_msg(inbox, reply, closure)
    }

    fn on_error(&self, inbox: &Inbox, status: Status, closure: &Closure) {
        (**self).on_error(inbox, status, closure)
    }

    fn on_destroy(&self, inbox: &Inbox, closure: &Closure) {
        (**self).on_destroy(inbox, closure)
    }
}

#[derive(Clone)]
pub(crate) struct InboxEntry {
    handler: Arc<dyn InboxHandler>,
    inbox: Weak<InboxShared>,
    bridge: Bridge,
    /// Native inbox, filled in once the engine has created it.
    handle: NativeHandle,
}

lazy_static! {
    pub(crate) static ref INBOXES: CallbackStore<InboxEntry, InboxMsgCallback> = CallbackStore::new("inboxes");
}

pub(crate) struct InboxShared {
    bridge: Bridge,
    peer: PeerHandle,
    key: CallbackKey,
    // Reused for every reply instead of allocating a wrapper per message
    reply_view: Mutex<Option<Message>>,
    _transport: Option<Transport>,
    _queue: Option<Queue>,
}

/// Reply address for request/reply. Replies arrive on the inbox's queue.
#[derive(Clone)]
pub struct Inbox {
    shared: Arc<InboxShared>,
}

impl Inbox {
    pub fn create<H>(transport: &Transport, queue: &Queue, handler: H, closure: Closure) -> Result<Inbox>
    where
        H: InboxHandler + 'static,
    {
        let bridge = transport.bridge().clone();
        let transport_handle = transport.native_handle()?;
        let queue_handle = queue.native_handle()?;
        let api = bridge.api();

        let mut registered = None;
        let shared = Arc::new_cyclic(|weak: &Weak<InboxShared>| {
            let entry = InboxEntry {
                handler: Arc::new(handler),
                inbox: weak.clone(),
                bridge: bridge.clone(),
                handle: NativeHandle::NULL,
            };
            let key = INBOXES.register(entry, closure, on_inbox_msg);
            registered = Some(key);
            InboxShared {
                bridge: bridge.clone(),
                peer: PeerHandle::new("inbox", api.inbox_destroy),
                key,
                reply_view: Mutex::new(None),
                _transport: Some(transport.clone()),
                _queue: Some(queue.clone()),
            }
        });
        let key = registered.ok_or(BridgeError::NotInitialized)?;

        let created = shared.peer.create(|out| unsafe {
            (api.inbox_create)(
                out,
                transport_handle,
                queue_handle,
                on_inbox_msg,
                on_inbox_error,
                on_inbox_destroy,
                closure_from_key(key),
            )
        });
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                let _ = INBOXES.remove(key);
                return Err(e);
            }
        };
        INBOXES.update(key, |entry| entry.handle = handle);
        trace!(key, "inbox registered");
        Ok(Inbox { shared })
    }

    fn detached(bridge: &Bridge, handle: NativeHandle) -> Inbox {
        Inbox {
            shared: Arc::new(InboxShared {
                bridge: bridge.clone(),
                peer: PeerHandle::view("inbox", handle),
                key: 0,
                reply_view: Mutex::new(None),
                _transport: None,
                _queue: None,
            }),
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.shared.bridge
    }

    pub fn native_handle(&self) -> Result<NativeHandle> {
        self.shared.peer.ensure_created()
    }

    pub fn is_registered(&self) -> bool {
        self.shared.key != 0 && INBOXES.contains(self.shared.key)
    }

    /// Destroy the native inbox. The handler's `on_destroy` follows once the
    /// engine has dispatched the notification.
    pub fn destroy(&self) -> Result<Disposal> {
        NativeWrapper::dispose(self)
    }
}

impl NativeWrapper for Inbox {
    fn peer(&self) -> &PeerHandle {
        &self.shared.peer
    }

    fn on_dispose(&self) {
        self.shared.reply_view.lock().take();
    }
}

/// The live wrapper, or a detached one over the native inbox once every
/// wrapper has been dropped.
fn target(entry: &InboxEntry) -> Inbox {
    match entry.inbox.upgrade() {
        Some(shared) => Inbox { shared },
        None => Inbox::detached(&entry.bridge, entry.handle),
    }
}

extern "C" fn on_inbox_msg(msg: NativeHandle, closure: *mut c_void) {
    let key = key_from_closure(closure);
    let (entry, user_closure) = match INBOXES.get(key) {
        Ok(resolved) => resolved,
        Err(e) => {
            note_stray(INBOXES.name(), key, &e);
            return;
        }
    };
    let inbox = target(&entry);
    // Taken out so no lock is held while user code runs
    let view = inbox.shared.reply_view.lock().take();
    let view = match view {
        Some(view) => {
            unsafe { view.set_native_handle(msg) };
            view
        }
        None => Message::view(inbox.bridge(), msg),
    };
    guard("inbox_msg", || entry.handler.on_msg(&inbox, &view, &user_closure));
    inbox.shared.reply_view.lock().get_or_insert(view);
}

extern "C" fn on_inbox_error(status: RawStatus, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match INBOXES.get(key) {
        Ok((entry, user_closure)) => guard("inbox_error", || {
            let inbox = target(&entry);
            entry.handler.on_error(&inbox, Status::from_code(status), &user_closure);
        }),
        Err(e) => note_stray(INBOXES.name(), key, &e),
    }
}

extern "C" fn on_inbox_destroy(_inbox: NativeHandle, closure: *mut c_void) {
    let key = key_from_closure(closure);
    match INBOXES.resolve_and_remove(key) {
        Ok((entry, user_closure)) => {
            trace!(key, "inbox registration released");
            guard("inbox_destroy", || {
                entry.handler.on_destroy(&target(&entry), &user_closure);
            })
        }
        Err(e) => note_stray(INBOXES.name(), key, &e),
    }
}
