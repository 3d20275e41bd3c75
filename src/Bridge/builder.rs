use super::Bridge;
use crate::ffi::NativeApi;
use std::time::Duration;

/// Settings shared by every wrapper created through one [`Bridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    name: String,
    check_arguments: bool,
    destroy_poll_interval: Duration,
    default_destroy_timeout: Duration,
}

impl BridgeConfig {
    /// Label attached to log events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether arguments are validated before crossing the native boundary.
    pub fn check_arguments(&self) -> bool {
        self.check_arguments
    }

    pub fn destroy_poll_interval(&self) -> Duration {
        self.destroy_poll_interval
    }

    pub fn default_destroy_timeout(&self) -> Duration {
        self.default_destroy_timeout
    }
}

pub struct BridgeBuilder {
    config: BridgeConfig,
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self {
            config: BridgeConfig {
                name: "mama-bridge".to_string(),
                check_arguments: true,
                destroy_poll_interval: Duration::from_millis(1),
                default_destroy_timeout: Duration::from_secs(5),
            },
        }
    }
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    pub fn with_check_arguments(mut self, check: bool) -> Self {
        self.config.check_arguments = check;
        self
    }

    pub fn with_destroy_poll_interval(mut self, interval: Duration) -> Self {
        self.config.destroy_poll_interval = interval;
        self
    }

    pub fn with_default_destroy_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_destroy_timeout = timeout;
        self
    }

    pub fn build(self, api: &'static NativeApi) -> Bridge {
        Bridge::new(api, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let builder = BridgeBuilder::new();
        assert!(builder.config.check_arguments());
        assert_eq!(builder.config.name(), "mama-bridge");
        assert_eq!(builder.config.default_destroy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn overrides() {
        let builder = BridgeBuilder::new()
            .with_name("feed-a")
            .with_check_arguments(false)
            .with_destroy_poll_interval(Duration::from_micros(50))
            .with_default_destroy_timeout(Duration::from_millis(200));
        let config = builder.config;
        assert_eq!(config.name(), "feed-a");
        assert!(!config.check_arguments());
        assert_eq!(config.destroy_poll_interval(), Duration::from_micros(50));
        assert_eq!(config.default_destroy_timeout(), Duration::from_millis(200));
    }
}
