use super::builder::BridgeConfig;
use super::registry;
use crate::ffi::NativeApi;
use std::sync::Arc;
use tracing::{debug, warn};

struct BridgeInner {
    api: &'static NativeApi,
    config: BridgeConfig,
}

/// Entry point of the binding layer: the engine's function table plus the
/// configuration every wrapper created from it shares.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub(crate) fn new(api: &'static NativeApi, config: BridgeConfig) -> Self {
        debug!(bridge = config.name(), "bridge opened");
        Self {
            inner: Arc::new(BridgeInner { api, config }),
        }
    }

    pub fn api(&self) -> &'static NativeApi {
        self.inner.api
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub(crate) fn check_arguments(&self) -> bool {
        self.inner.config.check_arguments()
    }

    /// Callbacks the engine delivered for a key that was not (or no longer)
    /// registered. Non-zero means the engine completed something twice.
    pub fn stray_callbacks(&self) -> u64 {
        registry::stray_callbacks()
    }

    /// Registrations still waiting for the engine, across all wrapper kinds.
    pub fn pending_callbacks(&self) -> usize {
        registry::pending_callbacks()
    }

    /// Release every registration the engine never completed.
    ///
    /// Only call this after the engine has stopped dispatching; a trampoline
    /// firing afterwards finds no entry and is counted as stray.
    pub fn shutdown(&self) -> usize {
        let released = registry::dispose_all();
        if released > 0 {
            warn!(bridge = self.inner.config.name(), released, "released uncompleted callbacks at shutdown");
        }
        released
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.inner.config.name())
            .field("api", &format_args!("{:p}", self.inner.api))
            .finish()
    }
}
