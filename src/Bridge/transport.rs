use super::marshal::{c_string, copy_c_str};
use super::registry::{guard, note_stray};
use super::Bridge;
use crate::ffi::{self, closure_from_key, key_from_closure, NativeApi, NativeHandle, TransportCallback, TransportTopicCallback};
use crate::Core::{check, BridgeError, CallbackKey, CallbackStore, Disposal, NativeWrapper, PeerHandle, Result};
use lazy_static::lazy_static;
use libc::{c_char, c_int, c_void};
use parking_lot::Mutex;
use std::ptr;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Connection state change reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connect,
    ConnectFailed,
    Reconnect,
    Disconnect,
    Accept,
    AcceptReconnect,
    PublisherDisconnect,
    Quality,
    NamingServiceConnect,
    NamingServiceDisconnect,
    WriteQueueHighWaterMark,
    WriteQueueLowWaterMark,
    Unknown(c_int),
}

impl TransportEvent {
    pub fn from_raw(raw: c_int) -> TransportEvent {
        match raw {
            ffi::TRANSPORT_CONNECT => TransportEvent::Connect,
            ffi::TRANSPORT_CONNECT_FAILED => TransportEvent::ConnectFailed,
            ffi::TRANSPORT_RECONNECT => TransportEvent::Reconnect,
            ffi::TRANSPORT_DISCONNECT => TransportEvent::Disconnect,
            ffi::TRANSPORT_ACCEPT => TransportEvent::Accept,
            ffi::TRANSPORT_ACCEPT_RECONNECT => TransportEvent::AcceptReconnect,
            ffi::TRANSPORT_PUBLISHER_DISCONNECT => TransportEvent::PublisherDisconnect,
            ffi::TRANSPORT_QUALITY => TransportEvent::Quality,
            ffi::TRANSPORT_NAMING_SERVICE_CONNECT => TransportEvent::NamingServiceConnect,
            ffi::TRANSPORT_NAMING_SERVICE_DISCONNECT => TransportEvent::NamingServiceDisconnect,
            ffi::TRANSPORT_WRITE_QUEUE_HIGH_WATER_MARK => TransportEvent::WriteQueueHighWaterMark,
            ffi::TRANSPORT_WRITE_QUEUE_LOW_WATER_MARK => TransportEvent::WriteQueueLowWaterMark,
            other => TransportEvent::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportTopicEvent {
    Subscribed,
    Unsubscribed,
    Unknown(c_int),
}

impl TransportTopicEvent {
    pub fn from_raw(raw: c_int) -> TransportTopicEvent {
        match raw {
            ffi::TRANSPORT_TOPIC_SUBSCRIBED => TransportTopicEvent::Subscribed,
            ffi::TRANSPORT_TOPIC_UNSUBSCRIBED => TransportTopicEvent::Unsubscribed,
            other => TransportTopicEvent::Unknown(other),
        }
    }
}

/// Receiver of connection events. Runs on whatever thread the engine
/// reports them from.
pub trait TransportHandler: Send + Sync {
    fn on_transport_event(&self, transport: &Transport, event: TransportEvent, cause: i16);
}

impl<F> TransportHandler for F
where
    F: Fn(&Transport, TransportEvent, i16) + Send + Sync,
{
    fn on_transport_event(&self, transport: &Transport, event: TransportEvent, cause: i16) {
        self(transport, event, cause)
    }
}

/// Receiver of topic subscribe/unsubscribe notices.
pub trait TransportTopicHandler: Send + Sync {
    fn on_topic_event(&self, transport: &Transport, event: TransportTopicEvent, topic: &str);
}

impl<F> TransportTopicHandler for F
where
    F: Fn(&Transport, TransportTopicEvent, &str) + Send + Sync,
{
    fn on_topic_event(&self, transport: &Transport, event: TransportTopicEvent, topic: &str) {
        self(transport, event, topic)
    }
}

#[derive(Clone)]
pub(crate) struct TransportEntry {
    handler: Arc<dyn TransportHandler>,
    transport: Weak<TransportShared>,
    bridge: Bridge,
}

#[derive(Clone)]
pub(crate) struct TopicEntry {
    handler: Arc<dyn TransportTopicHandler>,
    transport: Weak<TransportShared>,
    bridge: Bridge,
}

lazy_static! {
    pub(crate) static ref TRANSPORT_CALLBACKS: CallbackStore<TransportEntry, TransportCallback> =
        CallbackStore::new("transport_callbacks");
    pub(crate) static ref TOPIC_CALLBACKS: CallbackStore<TopicEntry, TransportTopicCallback> =
        CallbackStore::new("transport_topic_callbacks");
}

pub(crate) struct TransportShared {
    bridge: Bridge,
    peer: PeerHandle,
    callback_key: Mutex<Option<CallbackKey>>,
    topic_key: Mutex<Option<CallbackKey>>,
}

impl TransportShared {
    fn new(bridge: &Bridge, peer: PeerHandle) -> Self {
        Self {
            bridge: bridge.clone(),
            peer,
            callback_key: Mutex::new(None),
            topic_key: Mutex::new(None),
        }
    }

    fn release_registrations(&self) {
        if let Some(key) = self.callback_key.lock().take() {
            let _ = TRANSPORT_CALLBACKS.remove(key);
        }
        if let Some(key) = self.topic_key.lock().take() {
            let _ = TOPIC_CALLBACKS.remove(key);
        }
    }
}

impl Drop for TransportShared {
    fn drop(&mut self) {
        self.release_registrations();
    }
}

/// Connection to the messaging middleware. Publishers, inboxes and
/// subscriptions are created on a transport and keep it alive.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<TransportShared>,
}

impl Transport {
    pub fn create(bridge: &Bridge, name: &str) -> Result<Transport> {
        if bridge.check_arguments() && name.is_empty() {
            return Err(BridgeError::InvalidArgument("transport name must not be empty"));
        }
        let c_name = c_string(name, "transport name")?;
        let api = bridge.api();
        let peer = PeerHandle::new("transport", api.transport_destroy);
        peer.create(|out| unsafe { (api.transport_create)(out, c_name.as_ptr()) })?;
        Ok(Transport {
            shared: Arc::new(TransportShared::new(bridge, peer)),
        })
    }

    fn view(bridge: &Bridge, handle: NativeHandle) -> Transport {
        Transport {
            shared: Arc::new(TransportShared::new(bridge, PeerHandle::view("transport", handle))),
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.shared.bridge
    }

    pub fn native_handle(&self) -> Result<NativeHandle> {
        self.shared.peer.ensure_created()
    }

    pub fn name(&self) -> Result<String> {
        let handle = self.native_handle()?;
        let mut raw: *const c_char = ptr::null();
        check(unsafe { (self.api().transport_get_name)(handle, &mut raw) })?;
        Ok(unsafe { copy_c_str(raw) })
    }

    /// Messages per second the throttle lets through.
    pub fn outbound_throttle(&self) -> Result<f64> {
        let handle = self.native_handle()?;
        let mut rate = 0f64;
        check(unsafe { (self.api().transport_get_outbound_throttle)(handle, &mut rate) })?;
        Ok(rate)
    }

    pub fn set_outbound_throttle(&self, rate: f64) -> Result<()> {
        if self.shared.bridge.check_arguments() && !(rate.is_finite() && rate >= 0.0) {
            return Err(BridgeError::InvalidArgument("throttle rate must be finite and non-negative"));
        }
        let handle = self.native_handle()?;
        check(unsafe { (self.api().transport_set_outbound_throttle)(handle, rate) })
    }

    /// Report connection events to `handler`, replacing any earlier one.
    pub fn set_transport_callback<H>(&self, handler: H) -> Result<()>
    where
        H: TransportHandler + 'static,
    {
        let handle = self.native_handle()?;
        let entry = TransportEntry {
            handler: Arc::new(handler),
            transport: Arc::downgrade(&self.shared),
            bridge: self.shared.bridge.clone(),
        };
        let key = TRANSPORT_CALLBACKS.register(entry, None, on_transport_event);
        let code = unsafe {
            (self.api().transport_set_transport_callback)(handle, Some(on_transport_event), closure_from_key(key))
        };
        if let Err(e) = check(code) {
            let _ = TRANSPORT_CALLBACKS.remove(key);
            return Err(e);
        }
        if let Some(previous) = self.shared.callback_key.lock().replace(key) {
            let _ = TRANSPORT_CALLBACKS.remove(previous);
        }
        trace!(key, "transport callback registered");
        Ok(())
    }

    pub fn clear_transport_callback(&self) -> Result<()> {
        let handle = self.native_handle()?;
        check(unsafe { (self.api().transport_set_transport_callback)(handle, None, ptr::null_mut()) })?;
        if let Some(key) = self.shared.callback_key.lock().take() {
            let _ = TRANSPORT_CALLBACKS.remove(key);
        }
        Ok(())
    }

    /// Report topics being subscribed and unsubscribed on this transport.
    pub fn set_transport_topic_callback<H>(&self, handler: H) -> Result<()>
    where
        H: TransportTopicHandler + 'static,
    {
        let handle = self.native_handle()?;
        let entry = TopicEntry {
            handler: Arc::new(handler),
            transport: Arc::downgrade(&self.shared),
            bridge: self.shared.bridge.clone(),
        };
        let key = TOPIC_CALLBACKS.register(entry, None, on_transport_topic_event);
        let code = unsafe {
            (self.api().transport_set_transport_topic_callback)(
                handle,
                Some(on_transport_topic_event),
                closure_from_key(key),
            )
        };
        if let Err(e) = check(code) {
            let _ = TOPIC_CALLBACKS.remove(key);
            return Err(e);
        }
        if let Some(previous) = self.shared.topic_key.lock().replace(key) {
            let _ = TOPIC_CALLBACKS.remove(previous);
        }
        Ok(())
    }

    pub fn clear_transport_topic_callback(&self) -> Result<()> {
        let handle = self.native_handle()?;
        check(unsafe { (self.api().transport_set_transport_topic_callback)(handle, None, ptr::null_mut()) })?;
        if let Some(key) = self.shared.topic_key.lock().take() {
            let _ = TOPIC_CALLBACKS.remove(key);
        }
        Ok(())
    }

    pub fn destroy(&self) -> Result<Disposal> {
        let disposal = self.shared.peer.dispose()?;
        self.shared.release_registrations();
        Ok(disposal)
    }

    fn api(&self) -> &'static NativeApi {
        self.shared.bridge.api()
    }
}

impl NativeWrapper for Transport {
    fn peer(&self) -> &PeerHandle {
        &self.shared.peer
    }
}

fn upgrade_or_view(shared: &Weak<TransportShared>, bridge: &Bridge, handle: NativeHandle) -> Transport {
    match shared.upgrade() {
        Some(shared) => Transport { shared },
        None => Transport::view(bridge, handle),
    }
}

extern "C" fn on_transport_event(
    transport: NativeHandle,
    event: c_int,
    cause: i16,
    _platform_info: *const c_void,
    closure: *mut c_void,
) {
    let key = key_from_closure(closure);
    match TRANSPORT_CALLBACKS.get(key) {
        Ok((entry, _)) => guard("transport_event", move || {
            let target = upgrade_or_view(&entry.transport, &entry.bridge, transport);
            entry.handler.on_transport_event(&target, TransportEvent::from_raw(event), cause);
        }),
        Err(e) => note_stray(TRANSPORT_CALLBACKS.name(), key, &e),
    }
}

extern "C" fn on_transport_topic_event(
    transport: NativeHandle,
    event: c_int,
    topic: *const c_char,
    _platform_info: *const c_void,
    closure: *mut c_void,
) {
    let key = key_from_closure(closure);
    match TOPIC_CALLBACKS.get(key) {
        Ok((entry, _)) => {
            let topic = unsafe { copy_c_str(topic) };
            guard("transport_topic_event", move || {
                let target = upgrade_or_view(&entry.transport, &entry.bridge, transport);
                entry.handler.on_topic_event(&target, TransportTopicEvent::from_raw(event), &topic);
            })
        }
        Err(e) => note_stray(TOPIC_CALLBACKS.name(), key, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_codes_map_to_variants() {
        assert_eq!(TransportEvent::from_raw(ffi::TRANSPORT_DISCONNECT), TransportEvent::Disconnect);
        assert_eq!(TransportEvent::from_raw(ffi::TRANSPORT_QUALITY), TransportEvent::Quality);
        assert_eq!(TransportEvent::from_raw(77), TransportEvent::Unknown(77));
        assert_eq!(TransportTopicEvent::from_raw(1), TransportTopicEvent::Unsubscribed);
        assert_eq!(TransportTopicEvent::from_raw(9), TransportTopicEvent::Unknown(9));
    }
}
