// Module naming follows project convention (Core = handle and callback plumbing,
// Bridge = typed wrappers over the engine's entities)
pub mod ffi;

#[allow(non_snake_case)]
pub mod Core {
    pub mod status;
    pub mod error;
    pub mod lifetime;
    pub mod NativePeer;
    pub mod Callbacks;

    pub use status::Status;
    pub use error::{check, check_found, BridgeError, CallbackKey, Result};
    pub use lifetime::{Disposal, Lifetime, Ownership};
    pub use NativePeer::{NativeWrapper, PeerHandle};
    pub use Callbacks::{CallbackStore, Closure, Registration};
}

#[allow(non_snake_case)]
pub mod Bridge {
    mod registry;
    mod marshal;
    pub mod builder;
    pub mod context;
    pub mod queue;
    pub mod transport;
    pub mod message;
    pub mod publisher;
    pub mod timer;
    pub mod inbox;
    pub mod subscription;

    pub use builder::{BridgeBuilder, BridgeConfig};
    pub use context::Bridge;
    pub use queue::{EnqueueCallback, Queue, QueueEvent, QueueMonitor};
    pub use transport::{Transport, TransportEvent, TransportHandler, TransportTopicEvent, TransportTopicHandler};
    pub use message::{FieldType, Message, MessageField};
    pub use publisher::{Publisher, SendComplete};
    pub use timer::{Timer, TimerHandler};
    pub use inbox::{Inbox, InboxHandler};
    pub use subscription::{Subscription, SubscriptionHandler, SubscriptionState};
}

pub mod loopback;

#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}
