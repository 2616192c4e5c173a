// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::md5::Md5SigOption;
use crate::messages::Message;
use crate::peering::PeeringEvent;
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identifier of a connection. Events posted by a
/// connection carry it so the peering can tell its live connection apart
/// from connections it has already let go of.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "cnx-{}", self.0)
    }
}

/// An established connection to a BGP peer.
pub trait BgpConnection: Send + 'static {
    fn id(&self) -> ConnectionId;

    fn peer(&self) -> SocketAddr;

    fn send(&self, msg: Message) -> Result<(), Error>;

    /// Close the connection. A `PeeringEvent::Closed` for this connection is
    /// posted once the connection has gone away. Closing twice is a no-op.
    fn close(&self);
}

/// Parameters of one outbound connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub peer: SocketAddr,

    /// Local address to bind to. Port zero selects an ephemeral port.
    pub bind: SocketAddr,

    pub timeout: Duration,

    /// Applied to the socket before the handshake.
    pub md5: Option<Md5SigOption>,
}

/// Handle to an outbound connection attempt that has not reported back yet.
#[derive(Debug, Clone, Default)]
pub struct PendingConnect {
    cancelled: Arc<AtomicBool>,
}

impl PendingConnect {
    pub fn new() -> Self {
        Self::default()
    }

    /// After cancellation the connector reports nothing for this attempt and
    /// drops a connection that completes late.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Opens outbound connections on behalf of a peering.
pub trait Connector: Send {
    type Connection: BgpConnection;

    /// Start an attempt. The outcome is reported asynchronously on
    /// `event_tx` as `Connected` or `ConnectFailed` tagged with `attempt`.
    ///
    /// An `Err` means the attempt never started. Errors that are fatal to
    /// the session (see `Error::is_session_fatal`) are among them.
    fn connect_tcp(
        &self,
        attempt: u64,
        req: ConnectRequest,
        event_tx: Sender<PeeringEvent<Self::Connection>>,
    ) -> Result<PendingConnect, Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let pending = PendingConnect::new();
        let remote = pending.clone();
        assert!(!remote.is_cancelled());
        pending.cancel();
        assert!(remote.is_cancelled());
    }
}
