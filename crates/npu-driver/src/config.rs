//! Driver configuration

use npu_chip::tee::TRUSTED_APP_UUID;
use npu_models::PageTableStrategy;
use std::time::Duration;
use tracing::debug;

/// Device-wide driver configuration
///
/// Built with [`DriverConfig::default`] and refined with the `with_*`
/// methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Upper bound on one execution, from StartNetwork to completion
    pub run_timeout: Duration,

    /// How page tables are counted when sizing a network
    pub page_table_strategy: PageTableStrategy,

    /// Size of the non-secure region carrying command parameters
    pub shared_region_size: usize,

    /// Size of the secure region handed to the trusted side at open
    pub secure_region_size: usize,

    /// Trusted application to open a session with
    pub trusted_app: [u8; 16],

    /// Networks one session may hold
    pub max_networks: usize,

    /// I/O buffers one session may hold
    pub max_buffers: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(20),
            page_table_strategy: PageTableStrategy::Conservative,
            shared_region_size: 256 * 1024,
            secure_region_size: 64 * 1024,
            trusted_app: TRUSTED_APP_UUID,
            max_networks: 64,
            max_buffers: 1024,
        }
    }
}

impl DriverConfig {
    /// Set the run timeout
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        debug!("Run timeout: {:?}", timeout);
        self.run_timeout = timeout;
        self
    }

    /// Set the page-table strategy
    pub fn with_page_table_strategy(mut self, strategy: PageTableStrategy) -> Self {
        self.page_table_strategy = strategy;
        self
    }

    /// Set the sizes of the non-secure and secure channel regions
    pub fn with_channel_regions(mut self, shared: usize, secure: usize) -> Self {
        self.shared_region_size = shared;
        self.secure_region_size = secure;
        self
    }

    /// Set the trusted application id
    pub fn with_trusted_app(mut self, uuid: [u8; 16]) -> Self {
        self.trusted_app = uuid;
        self
    }

    /// Set the per-session network and buffer limits
    pub fn with_session_limits(mut self, networks: usize, buffers: usize) -> Self {
        self.max_networks = networks;
        self.max_buffers = buffers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = DriverConfig::default();
        assert_eq!(c.run_timeout, Duration::from_secs(20));
        assert_eq!(c.page_table_strategy, PageTableStrategy::Conservative);
        assert_eq!(c.trusted_app, TRUSTED_APP_UUID);
    }

    #[test]
    fn test_builder_methods() {
        let c = DriverConfig::default()
            .with_run_timeout(Duration::from_millis(50))
            .with_page_table_strategy(PageTableStrategy::Precise)
            .with_session_limits(1, 2);
        assert_eq!(c.run_timeout, Duration::from_millis(50));
        assert_eq!(c.page_table_strategy, PageTableStrategy::Precise);
        assert_eq!((c.max_networks, c.max_buffers), (1, 2));
    }
}
