//! Timing profile for discovery, heartbeats, and failure detection.

use std::time::Duration;

/// Durations driving the cluster protocol.
///
/// The same value paces hello broadcasts during discovery and heartbeat
/// pings in steady state. The discovery window is how long a starting node
/// listens before deciding the election. The failure timeout is the silence
/// window after which a peer (or the master) is declared dead; it should be
/// several hello intervals so a single dropped datagram never evicts anyone.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub hello_interval: Duration,
    pub discovery_window: Duration,
    pub failure_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            hello_interval: Duration::from_secs(4),
            discovery_window: Duration::from_secs(8),
            failure_timeout: Duration::from_secs(20),
        }
    }
}

impl Timing {
    /// Scaled-down profile with the default ratios, for tests and local demos.
    pub fn fast(unit: Duration) -> Self {
        Self {
            hello_interval: unit,
            discovery_window: unit * 2,
            failure_timeout: unit * 5,
        }
    }
}
