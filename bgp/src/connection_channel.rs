// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// This file contains code for testing purposes only. Note that it's only
/// included in `lib.rs` with a `#[cfg(test)]` guard. The purpose of the
/// code in this file is to implement Connector and BgpConnection over
/// in-memory channels so the peering controller in `peering.rs` can be
/// driven step by step without touching the network.
use crate::{
    connection::{
        BgpConnection, ConnectRequest, ConnectionId, Connector, PendingConnect,
    },
    error::Error,
    log::connection_log,
    messages::Message,
    peering::PeeringEvent,
};
use bgp_common::lock;
use slog::Logger;
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc, Mutex,
    },
};

type EventTx = Sender<PeeringEvent<BgpConnectionChannel>>;

#[derive(Default)]
struct ConnectorState {
    requests: Vec<(u64, ConnectRequest)>,
    attempts: BTreeMap<u64, (PendingConnect, ConnectRequest, EventTx)>,
    fail_next: Option<Error>,
}

/// A connector whose attempts are completed or failed by the test. It
/// records every request it is handed.
#[derive(Clone)]
pub struct ConnectorChannel {
    state: Arc<Mutex<ConnectorState>>,
    log: Logger,
}

impl ConnectorChannel {
    pub fn new(log: Logger) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectorState::default())),
            log,
        }
    }

    pub fn requests(&self) -> Vec<(u64, ConnectRequest)> {
        lock!(self.state).requests.clone()
    }

    pub fn last_attempt(&self) -> Option<u64> {
        lock!(self.state).requests.last().map(|(a, _)| *a)
    }

    pub fn is_cancelled(&self, attempt: u64) -> bool {
        lock!(self.state)
            .attempts
            .get(&attempt)
            .map(|(pending, _, _)| pending.is_cancelled())
            .unwrap_or(false)
    }

    /// Make the next `connect_tcp` call fail synchronously with `err`.
    pub fn fail_next(&self, err: Error) {
        lock!(self.state).fail_next = Some(err);
    }

    /// Complete `attempt` with a new connection. The cancel flag is not
    /// consulted, so a late completion can be simulated.
    pub fn complete(&self, attempt: u64) -> ChannelPeer {
        let (req, event_tx) = {
            let state = lock!(self.state);
            let (_, req, tx) = state
                .attempts
                .get(&attempt)
                .expect("completing unknown attempt");
            (req.clone(), tx.clone())
        };
        let conn = BgpConnectionChannel {
            id: ConnectionId::next(),
            peer: req.peer,
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            event_tx: event_tx.clone(),
            log: self.log.clone(),
        };
        let remote = ChannelPeer {
            id: conn.id,
            sent: conn.sent.clone(),
            closed: conn.closed.clone(),
            event_tx: event_tx.clone(),
        };
        event_tx
            .send(PeeringEvent::Connected { attempt, conn })
            .expect("send connected");
        remote
    }

    pub fn fail(&self, attempt: u64, reason: &str) {
        let state = lock!(self.state);
        let (_, _, tx) = state
            .attempts
            .get(&attempt)
            .expect("failing unknown attempt");
        tx.send(PeeringEvent::ConnectFailed {
            attempt,
            reason: reason.into(),
        })
        .expect("send connect failed");
    }
}

impl Connector for ConnectorChannel {
    type Connection = BgpConnectionChannel;

    fn connect_tcp(
        &self,
        attempt: u64,
        req: ConnectRequest,
        event_tx: EventTx,
    ) -> Result<PendingConnect, Error> {
        let mut state = lock!(self.state);
        state.requests.push((attempt, req.clone()));
        if let Some(e) = state.fail_next.take() {
            return Err(e);
        }
        let pending = PendingConnect::new();
        state
            .attempts
            .insert(attempt, (pending.clone(), req, event_tx));
        Ok(pending)
    }
}

/// The peering's side of a channel connection.
pub struct BgpConnectionChannel {
    id: ConnectionId,
    peer: SocketAddr,
    sent: Arc<Mutex<Vec<Message>>>,
    closed: Arc<AtomicBool>,
    event_tx: EventTx,
    log: Logger,
}

impl BgpConnection for BgpConnectionChannel {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::NotConnected);
        }
        connection_log!(self, debug, "send {}", msg.title());
        lock!(self.sent).push(msg);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        connection_log!(self, debug, "close");
        let event = PeeringEvent::Closed {
            conn: self.id,
            disconnect: false,
        };
        if let Err(e) = self.event_tx.send(event) {
            connection_log!(self, debug, "send close event: {e}");
        }
    }
}

/// The remote end of a channel connection, held by the test.
pub struct ChannelPeer {
    pub id: ConnectionId,
    sent: Arc<Mutex<Vec<Message>>>,
    closed: Arc<AtomicBool>,
    event_tx: EventTx,
}

impl ChannelPeer {
    /// Messages the peering has sent on this connection so far.
    pub fn sent(&self) -> Vec<Message> {
        lock!(self.sent).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Deliver `msg` to the peering as if it arrived from the peer.
    pub fn deliver(&self, msg: impl Into<Message>) {
        self.event_tx
            .send(PeeringEvent::Message {
                conn: self.id,
                msg: msg.into(),
            })
            .expect("deliver message");
    }

    /// Drop the connection from the peer's side.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.event_tx
            .send(PeeringEvent::Closed {
                conn: self.id,
                disconnect: true,
            })
            .expect("send disconnect");
    }
}
