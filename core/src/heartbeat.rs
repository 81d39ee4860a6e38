use crate::config::DISCONNECT_AFTER_MISSES;
use crate::StatusEvent;

/// Tracks whether the host still answers our heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HeartbeatMonitor {
    misses: u16,
    connected: bool,
}

impl HeartbeatMonitor {
    pub const fn new() -> Self {
        Self {
            misses: 0,
            connected: true,
        }
    }

    /// Records the outcome of one heartbeat window.
    ///
    /// Every window without an ack, from the threshold on, yields a `Disconnect`.
    pub fn record(&mut self, acked: bool) -> Option<StatusEvent> {
        if acked {
            self.misses = 0;
            self.connected = true;
            return None;
        }

        self.misses = self.misses.saturating_add(1);
        if self.misses >= DISCONNECT_AFTER_MISSES {
            self.connected = false;
            Some(StatusEvent::Disconnect)
        } else {
            None
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}
