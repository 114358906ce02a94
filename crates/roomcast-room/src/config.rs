//! Node-level relay configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by every room on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Capacity of each client's outbound event ring. A reconnect can only
    /// replay what still fits here; raise this if clients with slow
    /// reconnects get dropped as unrecoverable.
    pub event_buf_size: usize,

    /// Capacity of a room's inbound message channel.
    pub room_msg_ch_size: usize,

    /// How long a control-plane call waits for the room actor before
    /// giving up with a deadline error.
    pub control_timeout: Duration,

    /// Idle deadline applied when a room is created with deadline 0.
    pub default_client_deadline: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            event_buf_size: 128,
            room_msg_ch_size: 10,
            control_timeout: Duration::from_secs(5),
            default_client_deadline: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let conf = RelayConfig::default();
        assert_eq!(conf.event_buf_size, 128);
        assert_eq!(conf.room_msg_ch_size, 10);
        assert_eq!(conf.control_timeout, Duration::from_secs(5));
        assert_eq!(conf.default_client_deadline, Duration::from_secs(30));
    }
}
