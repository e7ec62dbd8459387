use std::time::Duration;

/// Default period between heartbeat broadcasts.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Period between heartbeat broadcasts; the first fires immediately.
    pub heartbeat_interval: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Send behavior of [`CoreDelivery`](crate::delivery::CoreDelivery).
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryOptions {
    /// Request an acknowledgment for every batch and wait for it.
    pub wait_for_ack: bool,
    /// Upper bound on an ack wait. `None` waits until the reply or the
    /// connection goes away.
    pub ack_timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DeliveryOptions, FabricConfig};

    #[test]
    fn defaults_match_core_constants() {
        assert_eq!(
            FabricConfig::default().heartbeat_interval,
            Duration::from_secs(3)
        );
        let opts = DeliveryOptions::default();
        assert!(!opts.wait_for_ack);
        assert!(opts.ack_timeout.is_none());
    }
}
