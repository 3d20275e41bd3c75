use super::inbox::Inbox;
use super::marshal::{c_string, opt_c_string, opt_ptr};
use super::message::Message;
use super::registry::{guard, note_stray};
use super::transport::Transport;
use super::Bridge;
use crate::ffi::{closure_from_key, key_from_closure, NativeApi, NativeHandle, RawStatus, SendCompleteCallback};
use crate::Core::{
    check, BridgeError, CallbackKey, CallbackStore, Closure, Disposal, NativeWrapper, PeerHandle, Result, Status,
};
use crossbeam_utils::Backoff;
use lazy_static::lazy_static;
use libc::c_void;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Completion of a throttled send. Receives the message back in the owned
/// state, together with the engine's send status.
pub type SendComplete = Box<dyn FnOnce(&Publisher, &Message, Status, &Closure) + Send>;

pub(crate) struct SendCompletionEntry {
    callback: SendComplete,
    publisher: Arc<PublisherShared>,
    message: Arc<PeerHandle>,
}

lazy_static! {
    pub(crate) static ref SEND_COMPLETIONS: CallbackStore<SendCompletionEntry, SendCompleteCallback> =
        CallbackStore::new("send_completions");
}

#[derive(Default)]
struct SendState {
    pending: usize,
    destroy_requested: bool,
}

pub(crate) struct PublisherShared {
    bridge: Bridge,
    peer: PeerHandle,
    topic: String,
    state: Mutex<SendState>,
    // The engine requires the transport to outlive its publishers
    _transport: Transport,
}

impl PublisherShared {
    fn complete_one(&self) {
        let destroy_now = {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
            state.pending == 0 && state.destroy_requested
        };
        if destroy_now {
            debug!(topic = %self.topic, "last throttled send completed, destroying publisher");
            if let Err(e) = self.peer.dispose() {
                warn!(topic = %self.topic, error = %e, "deferred publisher destroy failed");
            }
        }
    }
}

/// Publishes messages on one topic of a transport.
///
/// Throttled sends are asynchronous: until their completion fires, both the
/// message and the publisher stay alive, and a `destroy` is postponed.
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<PublisherShared>,
}

impl Publisher {
    pub fn create(transport: &Transport, topic: &str, source: Option<&str>, root: Option<&str>) -> Result<Publisher> {
        let bridge = transport.bridge().clone();
        if bridge.check_arguments() && topic.is_empty() {
            return Err(BridgeError::InvalidArgument("topic must not be empty"));
        }
        let transport_handle = transport.native_handle()?;
        let c_topic = c_string(topic, "topic")?;
        let c_source = opt_c_string(source, "source")?;
        let c_root = opt_c_string(root, "root")?;

        let api = bridge.api();
        let peer = PeerHandle::new("publisher", api.publisher_destroy);
        peer.create(|out| unsafe {
            (api.publisher_create)(out, transport_handle, c_topic.as_ptr(), opt_ptr(&c_source), opt_ptr(&c_root))
        })?;

        Ok(Publisher {
            shared: Arc::new(PublisherShared {
                bridge,
                peer,
                topic: topic.to_string(),
                state: Mutex::new(SendState::default()),
                _transport: transport.clone(),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn native_handle(&self) -> Result<NativeHandle> {
        self.shared.peer.ensure_created()
    }

    /// Throttled sends whose completion has not fired yet.
    pub fn pending_sends(&self) -> usize {
        self.shared.state.lock().pending
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        let handle = self.live_handle()?;
        let msg = message.native_handle()?;
        check(unsafe { (self.api().publisher_send)(handle, msg) })
    }

    /// Queue `message` on the transport's throttle.
    ///
    /// The engine owns the message until `callback` runs; disposing it in the
    /// meantime is postponed until completion.
    pub fn send_with_throttle<F>(&self, message: &Message, closure: Closure, callback: F) -> Result<()>
    where
        F: FnOnce(&Publisher, &Message, Status, &Closure) + Send + 'static,
    {
        let api = self.api();
        self.send_throttled(message, closure, Box::new(callback), |publisher, msg, key| unsafe {
            (api.publisher_send_with_throttle)(publisher, msg, on_send_complete, closure_from_key(key))
        })
    }

    /// Throttled [`send_from_inbox`](Self::send_from_inbox). Message
    /// ownership works as for [`send_with_throttle`](Self::send_with_throttle).
    pub fn send_from_inbox_with_throttle<F>(
        &self,
        inbox: &Inbox,
        message: &Message,
        closure: Closure,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&Publisher, &Message, Status, &Closure) + Send + 'static,
    {
        let inbox_handle = inbox.native_handle()?;
        let api = self.api();
        self.send_throttled(message, closure, Box::new(callback), |publisher, msg, key| unsafe {
            (api.publisher_send_from_inbox_with_throttle)(
                publisher,
                inbox_handle,
                msg,
                on_send_complete,
                closure_from_key(key),
            )
        })
    }

    fn send_throttled<S>(&self, message: &Message, closure: Closure, callback: SendComplete, submit: S) -> Result<()>
    where
        S: FnOnce(NativeHandle, NativeHandle, CallbackKey) -> RawStatus,
    {
        let handle = self.live_handle()?;
        let msg = message.native_handle()?;

        {
            let mut state = self.shared.state.lock();
            if state.destroy_requested {
                return Err(BridgeError::NotInitialized);
            }
            state.pending += 1;
        }

        let msg_peer = message.shared_peer().clone();
        if let Err(e) = msg_peer.hand_to_engine() {
            self.shared.complete_one();
            return Err(e);
        }

        let entry = SendCompletionEntry {
            callback,
            publisher: self.shared.clone(),
            message: msg_peer.clone(),
        };
        let key = SEND_COMPLETIONS.register(entry, closure, on_send_complete);

        if let Err(e) = check(submit(handle, msg, key)) {
            // Nothing was queued: undo the registration and the hand-over
            let _ = SEND_COMPLETIONS.remove(key);
            msg_peer.reclaim_from_engine()?;
            self.shared.complete_one();
            return Err(e);
        }
        trace!(topic = %self.shared.topic, key, "throttled send queued");
        Ok(())
    }

    /// Send `message` with `inbox` as the reply address.
    pub fn send_from_inbox(&self, inbox: &Inbox, message: &Message) -> Result<()> {
        let handle = self.live_handle()?;
        let inbox_handle = inbox.native_handle()?;
        let msg = message.native_handle()?;
        check(unsafe { (self.api().publisher_send_from_inbox)(handle, inbox_handle, msg) })
    }

    /// Answer a request that was sent from an inbox.
    pub fn send_reply_to_inbox(&self, request: &Message, reply: &Message) -> Result<()> {
        let handle = self.live_handle()?;
        let request = request.native_handle()?;
        let reply = reply.native_handle()?;
        check(unsafe { (self.api().publisher_send_reply_to_inbox)(handle, request, reply) })
    }

    /// Destroy the publisher, or postpone it until the last throttled send
    /// completes. Further sends are rejected either way.
    pub fn destroy(&self) -> Result<Disposal> {
        {
            let mut state = self.shared.state.lock();
            state.destroy_requested = true;
            if state.pending > 0 {
                debug!(topic = %self.shared.topic, pending = state.pending, "publisher destroy deferred");
                return Ok(Disposal::Deferred);
            }
        }
        self.shared.peer.dispose()
    }

    /// [`destroy`](Self::destroy), then wait up to the configured default
    /// timeout for a deferred destroy to go through.
    pub fn destroy_wait(&self) -> Result<()> {
        self.destroy_timed_wait(self.shared.bridge.config().default_destroy_timeout())
    }

    pub fn destroy_timed_wait(&self, timeout: Duration) -> Result<()> {
        self.destroy()?;
        let deadline = Instant::now() + timeout;
        let poll = self.shared.bridge.config().destroy_poll_interval();
        let backoff = Backoff::new();
        while !self.shared.peer.is_released() {
            if Instant::now() >= deadline {
                return Err(BridgeError::Timeout(timeout));
            }
            if backoff.is_completed() {
                std::thread::sleep(poll);
            } else {
                backoff.snooze();
            }
        }
        Ok(())
    }

    fn live_handle(&self) -> Result<NativeHandle> {
        if self.shared.state.lock().destroy_requested {
            return Err(BridgeError::NotInitialized);
        }
        self.shared.peer.ensure_created()
    }

    fn api(&self) -> &'static NativeApi {
        self.shared.bridge.api()
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_publisher(self, f)
    }
}

impl NativeWrapper for Publisher {
    fn peer(&self) -> &PeerHandle {
        &self.shared.peer
    }

    fn dispose(&self) -> Result<Disposal> {
        self.destroy()
    }
}

/// Give back every throttled send the engine never completed: each message
/// returns to its owner, or is destroyed if its owner already disposed it,
/// and each publisher stops waiting for it. Returns how many were released.
pub(crate) fn release_pending_sends() -> usize {
    let drained = SEND_COMPLETIONS.drain();
    let released = drained.len();
    for (key, registration) in drained {
        warn!(store = SEND_COMPLETIONS.name(), key, "releasing throttled send never completed by the engine");
        let SendCompletionEntry { publisher, message, .. } = registration.callback;
        if let Err(e) = message.reclaim_from_engine() {
            warn!(key, error = %e, "destroying message of abandoned send failed");
        }
        drop(message);
        publisher.complete_one();
    }
    released
}

extern "C" fn on_send_complete(publisher: NativeHandle, msg: NativeHandle, status: RawStatus, closure: *mut c_void) {
    let key = key_from_closure(closure);
    let (entry, user_closure) = match SEND_COMPLETIONS.resolve_and_remove(key) {
        Ok(resolved) => resolved,
        Err(e) => {
            note_stray(SEND_COMPLETIONS.name(), key, &e);
            return;
        }
    };
    trace!(publisher = ?publisher, msg = ?msg, status, key, "throttled send completed");

    let SendCompletionEntry {
        callback,
        publisher: shared,
        message,
    } = entry;

    // Back to owned before user code sees it
    if let Err(e) = message.reclaim_from_engine() {
        warn!(key, error = %e, "destroying message after throttled send failed");
    }

    let target = Publisher { shared: shared.clone() };
    let message = Message::from_peer(&shared.bridge, message);
    let status = Status::from_code(status);
    guard("send_complete", || callback(&target, &message, status, &user_closure));
    drop(message);
    drop(target);

    shared.complete_one();
}
