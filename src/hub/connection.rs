use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

use axum::extract::ws::{CloseFrame, close_code};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::marketdata::Pair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairFilter {
    All,
    Only(HashSet<Pair>),
}

impl PairFilter {
    pub fn from_pairs(pairs: Vec<Pair>) -> Self {
        if pairs.is_empty() {
            PairFilter::All
        } else {
            PairFilter::Only(pairs.into_iter().collect())
        }
    }

    pub fn matches(&self, pair: &Pair) -> bool {
        match self {
            PairFilter::All => true,
            PairFilter::Only(pairs) => pairs.contains(pair),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Shutdown,
    SlowConsumer,
    KeepaliveTimeout,
    PeerClosed,
    ReadFailed,
    WriteFailed,
}

impl CloseReason {
    /// Close frame to send, if the server is the side ending the session.
    pub fn close_frame(self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            CloseReason::Shutdown => (close_code::NORMAL, "server shutting down"),
            CloseReason::SlowConsumer => (close_code::AGAIN, "slow consumer"),
            CloseReason::KeepaliveTimeout => (close_code::AWAY, "keepalive timeout"),
            CloseReason::PeerClosed | CloseReason::ReadFailed | CloseReason::WriteFailed => {
                return None;
            }
        };
        Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CloseReason::Shutdown => "shutdown",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::KeepaliveTimeout => "keepalive_timeout",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ReadFailed => "read_failed",
            CloseReason::WriteFailed => "write_failed",
        };
        f.write_str(label)
    }
}

/// Liveness and close signalling shared between the hub and a connection's
/// pump. The first recorded close reason wins.
#[derive(Debug)]
pub struct ConnectionControl {
    id: ConnectionId,
    reason: Mutex<Option<CloseReason>>,
    last_pong: Mutex<Instant>,
    closing: CancellationToken,
    terminated: CancellationToken,
}

impl ConnectionControl {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            reason: Mutex::new(None),
            last_pong: Mutex::new(Instant::now()),
            closing: CancellationToken::new(),
            terminated: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Asks the pump to send a close frame and stop.
    pub fn request_close(&self, reason: CloseReason) {
        self.reason.lock().get_or_insert(reason);
        self.closing.cancel();
    }

    /// Drops the socket without any further writes.
    pub fn force_close(&self) {
        self.reason.lock().get_or_insert(CloseReason::Shutdown);
        self.closing.cancel();
        self.terminated.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.reason.lock()
    }

    pub async fn closing(&self) {
        self.closing.cancelled().await
    }

    pub async fn terminated(&self) {
        self.terminated.cancelled().await
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_subscription_means_everything() {
        let atom = Pair::new("uatom", "uosmo");
        assert!(PairFilter::from_pairs(vec![]).matches(&atom));

        let only_ion = PairFilter::from_pairs(vec![Pair::new("uion", "uosmo")]);
        assert!(!only_ion.matches(&atom));
        assert!(only_ion.matches(&Pair::new("uion", "uosmo")));
    }

    #[test]
    fn first_close_reason_is_kept() {
        let control = ConnectionControl::new(ConnectionId::new());
        assert_eq!(control.close_reason(), None);

        control.request_close(CloseReason::SlowConsumer);
        control.request_close(CloseReason::Shutdown);
        control.force_close();

        assert_eq!(control.close_reason(), Some(CloseReason::SlowConsumer));
    }

    #[test]
    fn only_server_initiated_closes_send_a_frame() {
        assert_eq!(
            CloseReason::Shutdown.close_frame().unwrap().code,
            close_code::NORMAL
        );
        assert_eq!(
            CloseReason::SlowConsumer.close_frame().unwrap().code,
            close_code::AGAIN
        );
        assert!(CloseReason::PeerClosed.close_frame().is_none());
    }
}
