// Handle wrapper: binds one Rust object to one native resource and
// guarantees the native destructor runs at most once.

use super::error::{check, BridgeError, Result};
use super::lifetime::{Disposal, Lifetime, Ownership};
use crate::ffi::{Destructor, NativeHandle, RawStatus, STATUS_OK};
use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, trace, warn};

struct PeerState {
    handle: NativeHandle,
    lifetime: Lifetime,
}

/// Owner (or view) of a single native handle.
///
/// Disposal is split in two phases. [`PeerHandle::release_native`] touches
/// nothing but the native handle and is the only phase reachable from `Drop`.
/// Releasing managed dependents (callback stores, cached views) is the job of
/// the owning wrapper's explicit `dispose`.
pub struct PeerHandle {
    kind: &'static str,
    destructor: Option<Destructor>,
    state: Mutex<PeerState>,
}

impl PeerHandle {
    /// Unbound peer; [`create`](Self::create) binds it.
    pub fn new(kind: &'static str, destructor: Destructor) -> Self {
        Self::with_state(kind, Some(destructor), NativeHandle::NULL, Ownership::Owned)
    }

    /// Wrap a handle obtained elsewhere.
    pub fn from_native(
        kind: &'static str,
        destructor: Destructor,
        handle: NativeHandle,
        ownership: Ownership,
    ) -> Self {
        Self::with_state(kind, Some(destructor), handle, ownership)
    }

    /// Non-owning view. It can never destroy what it points at.
    pub fn view(kind: &'static str, handle: NativeHandle) -> Self {
        Self::with_state(kind, None, handle, Ownership::NotOwned)
    }

    fn with_state(
        kind: &'static str,
        destructor: Option<Destructor>,
        handle: NativeHandle,
        ownership: Ownership,
    ) -> Self {
        Self {
            kind,
            destructor,
            state: Mutex::new(PeerState {
                handle,
                lifetime: Lifetime::new(ownership),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Run the native allocator and bind its result.
    ///
    /// The allocator receives the out-pointer and returns a native status.
    pub fn create<F>(&self, allocate: F) -> Result<NativeHandle>
    where
        F: FnOnce(*mut NativeHandle) -> RawStatus,
    {
        let mut state = self.state.lock();
        if !state.handle.is_null() && !state.lifetime.is_released() {
            return Err(BridgeError::AlreadyCreated);
        }

        let mut handle = NativeHandle::NULL;
        check(allocate(&mut handle))?;
        if handle.is_null() {
            return Err(BridgeError::Native(crate::Core::Status::NullArg));
        }

        state.handle = handle;
        state.lifetime = Lifetime::new(if self.destructor.is_some() {
            Ownership::Owned
        } else {
            Ownership::NotOwned
        });
        debug!(kind = self.kind, handle = ?handle, "native peer created");
        Ok(handle)
    }

    /// Handle of a live peer, or `NotInitialized`.
    pub fn ensure_created(&self) -> Result<NativeHandle> {
        let state = self.state.lock();
        if state.handle.is_null() || state.lifetime.is_released() {
            return Err(BridgeError::NotInitialized);
        }
        Ok(state.handle)
    }

    /// Raw handle without any liveness check; null when unbound.
    pub fn handle(&self) -> NativeHandle {
        self.state.lock().handle
    }

    pub fn ownership(&self) -> Ownership {
        self.state.lock().lifetime.ownership()
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().lifetime.is_released()
    }

    /// Rebind to another native object without destroying the current one.
    ///
    /// Meant for views that walk a stream of engine-owned objects.
    pub fn set_native_handle(&self, handle: NativeHandle) {
        let mut state = self.state.lock();
        state.handle = handle;
        state.lifetime.rebind();
        trace!(kind = self.kind, handle = ?handle, "native handle rebound");
    }

    /// `true` makes this wrapper responsible for releasing its peer.
    pub fn set_self_managed(&self, self_managed: bool) -> Result<()> {
        if self_managed && self.destructor.is_none() {
            return Err(BridgeError::InvalidArgument("a view cannot own its peer"));
        }
        self.state.lock().lifetime.set_self_managed(self_managed)
    }

    /// Give the peer to the engine for the duration of an async operation.
    pub fn hand_to_engine(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.handle.is_null() {
            return Err(BridgeError::NotInitialized);
        }
        state.lifetime.hand_to_engine()
    }

    /// Take the peer back from the engine. A disposal parked while the engine
    /// held it is carried out here.
    pub fn reclaim_from_engine(&self) -> Result<()> {
        let handle = {
            let mut state = self.state.lock();
            if !state.lifetime.reclaim_from_engine() {
                return Ok(());
            }
            std::mem::replace(&mut state.handle, NativeHandle::NULL)
        };
        debug!(kind = self.kind, handle = ?handle, "running deferred destroy");
        self.run_destructor(handle)
    }

    /// Idempotent disposal through the registered destructor.
    pub fn dispose(&self) -> Result<Disposal> {
        match self.destructor {
            Some(destructor) => self.destroy_with(|handle| unsafe { destructor(handle) }),
            None => self.destroy_with(|_| STATUS_OK),
        }
    }

    /// Disposal through a caller-supplied native call (for example a
    /// destroy-and-wait variant).
    ///
    /// If the native call fails the peer stays bound so the caller can retry.
    pub fn destroy_with<F>(&self, destroy: F) -> Result<Disposal>
    where
        F: FnOnce(NativeHandle) -> RawStatus,
    {
        let (disposal, handle) = {
            let mut state = self.state.lock();
            let disposal = state.lifetime.request_dispose();
            (disposal, state.handle)
        };

        match disposal {
            Disposal::Destroy if !handle.is_null() => {}
            Disposal::Destroy => return Ok(Disposal::Noop),
            Disposal::Deferred => {
                debug!(kind = self.kind, handle = ?handle, "disposal deferred while engine owns peer");
                return Ok(disposal);
            }
            Disposal::Detached | Disposal::Noop => return Ok(disposal),
        }

        let code = destroy(handle);
        if code != STATUS_OK {
            let mut state = self.state.lock();
            state.lifetime.rebind();
            warn!(kind = self.kind, handle = ?handle, status = code, "native destroy failed");
            check(code)?;
        }

        self.state.lock().handle = NativeHandle::NULL;
        debug!(kind = self.kind, handle = ?handle, "native peer destroyed");
        Ok(Disposal::Destroy)
    }

    /// Release phase reachable from `Drop`: only the native handle is touched.
    pub fn release_native(&self) {
        let (disposal, handle) = {
            let mut state = self.state.lock();
            if state.lifetime.ownership() == Ownership::EngineOwned && !state.lifetime.is_released() {
                warn!(kind = self.kind, handle = ?state.handle, "dropping peer still owned by the engine");
                return;
            }
            let disposal = state.lifetime.request_dispose();
            let handle = std::mem::replace(&mut state.handle, NativeHandle::NULL);
            (disposal, handle)
        };
        if disposal == Disposal::Destroy && !handle.is_null() {
            if let Err(e) = self.run_destructor(handle) {
                warn!(kind = self.kind, handle = ?handle, error = %e, "native destroy failed during drop");
            }
        }
    }

    fn run_destructor(&self, handle: NativeHandle) -> Result<()> {
        match self.destructor {
            Some(destructor) if !handle.is_null() => {
                check(unsafe { destructor(handle) })?;
                debug!(kind = self.kind, handle = ?handle, "native peer destroyed");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.release_native();
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_peer_handle(self, f)
    }
}

/// Common disposal surface of every wrapper.
///
/// `dispose` runs the managed phase ([`on_dispose`](Self::on_dispose)) and
/// then the native phase. `Drop` only ever reaches the native phase through
/// [`PeerHandle`]'s own `Drop`.
pub trait NativeWrapper {
    fn peer(&self) -> &PeerHandle;

    /// Release managed dependents. Only reachable from explicit disposal.
    fn on_dispose(&self) {}

    fn dispose(&self) -> Result<Disposal> {
        self.on_dispose();
        self.peer().dispose()
    }

    fn is_created(&self) -> bool {
        self.peer().ensure_created().is_ok()
    }
}
