// Ownership state of a native peer.
//
//   Owned --hand_to_engine--> EngineOwned --reclaim_from_engine--> Owned
//
// Only an `Owned` peer is ever destroyed by its wrapper. A disposal request
// that arrives while the engine holds the peer is parked and carried out by
// the completion path.

use super::error::{BridgeError, Result};

/// Who is responsible for releasing a native resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The wrapper releases the resource on disposal.
    Owned,
    /// The engine holds the resource until an async completion fires.
    EngineOwned,
    /// A view; the engine or another wrapper releases the resource.
    NotOwned,
}

/// What a disposal request resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// Caller must run the native destructor now.
    Destroy,
    /// Engine currently owns the peer; destruction happens at completion.
    Deferred,
    /// Non-owning view detached without touching the engine.
    Detached,
    /// Already released earlier.
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    ownership: Ownership,
    dispose_requested: bool,
    released: bool,
}

impl Lifetime {
    pub fn new(ownership: Ownership) -> Self {
        Self {
            ownership,
            dispose_requested: false,
            released: false,
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn is_dispose_requested(&self) -> bool {
        self.dispose_requested
    }

    /// Toggle between owning and non-owning without going through the engine.
    pub fn set_self_managed(&mut self, self_managed: bool) -> Result<()> {
        if self.ownership == Ownership::EngineOwned {
            return Err(BridgeError::InvalidArgument("peer is owned by the engine"));
        }
        self.ownership = if self_managed { Ownership::Owned } else { Ownership::NotOwned };
        Ok(())
    }

    /// `Owned -> EngineOwned`. Returns false for views, which have nothing
    /// to hand over.
    pub fn hand_to_engine(&mut self) -> Result<bool> {
        if self.released {
            return Err(BridgeError::NotInitialized);
        }
        match self.ownership {
            Ownership::Owned => {
                self.ownership = Ownership::EngineOwned;
                Ok(true)
            }
            Ownership::EngineOwned => Err(BridgeError::InvalidArgument("peer already handed to the engine")),
            Ownership::NotOwned => Ok(false),
        }
    }

    /// `EngineOwned -> Owned`. Returns true when a disposal was parked in the
    /// meantime and must now be carried out.
    pub fn reclaim_from_engine(&mut self) -> bool {
        if self.ownership != Ownership::EngineOwned {
            return false;
        }
        self.ownership = Ownership::Owned;
        if self.dispose_requested && !self.released {
            self.released = true;
            return true;
        }
        false
    }

    pub fn request_dispose(&mut self) -> Disposal {
        if self.released {
            return Disposal::Noop;
        }
        match self.ownership {
            Ownership::Owned => {
                self.released = true;
                Disposal::Destroy
            }
            Ownership::EngineOwned => {
                self.dispose_requested = true;
                Disposal::Deferred
            }
            Ownership::NotOwned => {
                self.released = true;
                Disposal::Detached
            }
        }
    }

    /// Forget a previous release so the peer can be bound again.
    pub(crate) fn rebind(&mut self) {
        self.released = false;
        self.dispose_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_destroys_once() {
        let mut life = Lifetime::new(Ownership::Owned);
        assert_eq!(life.request_dispose(), Disposal::Destroy);
        assert_eq!(life.request_dispose(), Disposal::Noop);
        assert!(life.is_released());
    }

    #[test]
    fn engine_owned_defers_until_reclaimed() {
        let mut life = Lifetime::new(Ownership::Owned);
        assert_eq!(life.hand_to_engine(), Ok(true));
        assert_eq!(life.request_dispose(), Disposal::Deferred);
        assert_eq!(life.request_dispose(), Disposal::Deferred);
        assert!(!life.is_released());

        // Completion hands it back and carries out the parked disposal
        assert!(life.reclaim_from_engine());
        assert_eq!(life.ownership(), Ownership::Owned);
        assert_eq!(life.request_dispose(), Disposal::Noop);
    }

    #[test]
    fn reclaim_without_request_leaves_peer_destroyable() {
        let mut life = Lifetime::new(Ownership::Owned);
        life.hand_to_engine().unwrap();
        assert!(!life.reclaim_from_engine());
        assert_eq!(life.request_dispose(), Disposal::Destroy);
    }

    #[test]
    fn double_hand_over_is_rejected() {
        let mut life = Lifetime::new(Ownership::Owned);
        life.hand_to_engine().unwrap();
        assert!(life.hand_to_engine().is_err());
        assert!(life.set_self_managed(false).is_err());
    }

    #[test]
    fn views_are_detached_not_destroyed() {
        let mut life = Lifetime::new(Ownership::NotOwned);
        assert_eq!(life.hand_to_engine(), Ok(false));
        assert_eq!(life.request_dispose(), Disposal::Detached);
        assert_eq!(life.request_dispose(), Disposal::Noop);
    }

    #[test]
    fn reclaim_is_ignored_unless_engine_owned() {
        let mut life = Lifetime::new(Ownership::Owned);
        assert!(!life.reclaim_from_engine());
        assert_eq!(life.ownership(), Ownership::Owned);
    }
}
