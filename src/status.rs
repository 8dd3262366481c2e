//! Collaborator-facing status reporting.
//!
//! The bridge reports connection-state transitions and sent frames; how
//! they are rendered or persisted is the host's concern. The sink is
//! injected at construction, never reached through shared globals.

use std::fmt::Write as _;

use log::{debug, info};

/// Connection state of the shared serial link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Faulted,
}

/// Connection state of one network endpoint session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Failed,
    Closed,
}

/// Where the bridge reports to.
///
/// Callbacks run from the bridge's event context; implementations must
/// return promptly and must not call back into the bridge.
pub trait StatusSink: Send + Sync {
    fn serial_state(&self, state: LinkState);
    fn endpoint_state(&self, id: u8, state: SessionState);
    /// Bus bytes most recently sent toward the given device.
    fn frame_sent(&self, id: u8, bytes: &[u8]);
}

/// Default sink: renders every report through the `log` facade.
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn serial_state(&self, state: LinkState) {
        info!("serial link: {state:?}");
    }

    fn endpoint_state(&self, id: u8, state: SessionState) {
        info!("endpoint {id}: {state:?}");
    }

    fn frame_sent(&self, id: u8, bytes: &[u8]) {
        debug!("endpoint {id} sent {}", hex_str(bytes));
    }
}

/// Space-separated hex, for humans reading the log.
pub fn hex_str(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        if !s.is_empty() {
            s.push(' ');
        }
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_rendering() {
        assert_eq!(hex_str(&[]), "");
        assert_eq!(hex_str(&[0x88, 0x30, 0x01, 0xFF]), "88 30 01 ff");
    }
}
