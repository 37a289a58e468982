use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Protocol version sent in the handshake
    pub rpc_version: u32,
    /// IO worker polling interval
    pub tick_interval: Duration,
    /// Reconnect backoff floor
    pub reconnect_min: Duration,
    /// Reconnect backoff ceiling
    pub reconnect_max: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            rpc_version: 1,
            tick_interval: Duration::from_millis(2500),
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

impl RpcConfig {
    /// Config for testing (fast ticks, short backoff).
    pub fn for_testing() -> Self {
        Self {
            rpc_version: 1,
            tick_interval: Duration::from_millis(5),
            reconnect_min: Duration::from_millis(1),
            reconnect_max: Duration::from_millis(20),
        }
    }
}
