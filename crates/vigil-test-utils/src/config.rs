//! Configuration builders for tests.

use vigil_config::HelperConfig;

/// Fluent builder for [`HelperConfig`] in tests.
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .max_payload_bytes(64)
///     .read_timeout_secs(1)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: HelperConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HelperConfig::default(),
        }
    }

    pub fn max_payload_bytes(mut self, n: usize) -> Self {
        self.config.listener.max_payload_bytes = n;
        self
    }

    pub fn read_timeout_secs(mut self, secs: u64) -> Self {
        self.config.listener.read_timeout_secs = secs;
        self
    }

    pub fn build(self) -> HelperConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
