use std::time::Duration;

use bon::Builder;

use crate::state_machine::MachineConfig;

/// Configuration shared by every participant created from one registry.
#[derive(Debug, Clone, Builder)]
pub struct MsrpConfig {
    /// Soft limit on deferred signals per machine before the queue-full fallback kicks in.
    #[builder(default = 50)]
    pub signal_queue_limit: usize,

    /// How long an incoming message may stall before it completes as aborted.
    #[builder(default = Duration::from_secs(32))]
    pub reassembly_timeout: Duration,

    /// Largest payload carried by one outbound chunk. Unbounded when not set.
    pub max_chunk_size: Option<usize>,

    /// How long an outbound chunk waits for its transaction response.
    #[builder(default = Duration::from_secs(30))]
    pub response_timeout: Duration,

    /// Size of each piece read from an outbound message body.
    #[builder(default = 2048)]
    pub read_size: usize,

    /// Bound on how long a network thread waits for the inbound machine to admit a piece.
    /// Waits until admitted when not set.
    pub chunk_wait: Option<Duration>,

    /// Bound on how long control signals (open, close, send, abort, responses) may wait.
    #[builder(default = Duration::from_secs(5))]
    pub control_wait: Duration,

    /// Messages up to this size are kept in memory by the default store policy.
    #[builder(default = 1024 * 1024)]
    pub memory_store_limit: usize,
}

impl MsrpConfig {
    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig::builder()
            .queue_limit(self.signal_queue_limit)
            .build()
    }
}

impl Default for MsrpConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MsrpConfig::default();
        assert_eq!(config.signal_queue_limit, 50);
        assert_eq!(config.reassembly_timeout, Duration::from_secs(32));
        assert!(config.max_chunk_size.is_none());
        assert_eq!(config.machine_config().queue_limit, 50);
    }

    #[test]
    fn test_overrides() {
        let config = MsrpConfig::builder()
            .max_chunk_size(10)
            .signal_queue_limit(3)
            .build();
        assert_eq!(config.max_chunk_size, Some(10));
        assert_eq!(config.machine_config().queue_limit, 3);
    }
}
