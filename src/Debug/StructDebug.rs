use std::fmt;
use crate::Bridge::{Message, Publisher, Subscription, Timer};
use crate::Core::{CallbackStore, NativeWrapper, PeerHandle};

/// Debug function for PeerHandle
///
/// Shows the handle address and lifetime state without touching the native side.
pub fn debug_peer_handle(peer: &PeerHandle, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PeerHandle")
        .field("kind", &peer.kind())
        .field("handle", &format_args!("0x{:x}", peer.handle().addr()))
        .field("ownership", &peer.ownership())
        .field("released", &peer.is_released())
        .finish()
}

/// Debug function for Message
///
/// Field contents are not printed; that would mean a native call per field.
pub fn debug_message(message: &Message, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let peer = message.peer();
    f.debug_struct("Message")
        .field("handle", &format_args!("0x{:x}", peer.handle().addr()))
        .field("ownership", &peer.ownership())
        .finish_non_exhaustive()
}

pub fn debug_publisher(publisher: &Publisher, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Publisher")
        .field("topic", &publisher.topic())
        .field("handle", &format_args!("0x{:x}", publisher.peer().handle().addr()))
        .field("pending_sends", &publisher.pending_sends())
        .finish()
}

pub fn debug_timer(timer: &Timer, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Timer")
        .field("handle", &format_args!("0x{:x}", timer.peer().handle().addr()))
        .field("registered", &timer.is_registered())
        .finish()
}

pub fn debug_subscription(subscription: &Subscription, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
        .field("topic", &subscription.requested_topic())
        .field("handle", &format_args!("0x{:x}", subscription.peer().handle().addr()))
        .field("registered", &subscription.is_registered())
        .finish()
}

/// Debug function for CallbackStore
///
/// Entries are opaque; only the counts are shown.
pub fn debug_callback_store<C, T>(store: &CallbackStore<C, T>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CallbackStore")
        .field("name", &store.name())
        .field("pending", &store.len())
        .field("misses", &store.misses())
        .finish()
}
