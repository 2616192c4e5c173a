// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle controller for a single BGP peer.
//!
//! A [`Peering`] owns the state machine, the connector and the handler for
//! one peer and is the only writer of the session state. Everything that
//! happens to the session (admin requests, connect results, messages, closes
//! and timer expiry) is delivered as a [`PeeringEvent`] on the peering's own
//! channel and handled on the peering's thread.

use crate::clock::Clock;
use crate::config::{PeerConfig, RouterConfig};
use crate::connection::{
    BgpConnection, ConnectRequest, ConnectionId, Connector, PendingConnect,
};
use crate::error::{Error, ExpectationMismatch};
use crate::fsm::{Accepted, Fsm, FsmStateKind};
use crate::handler::ProtocolHandler;
use crate::log::peering_log;
use crate::md5::Md5SigOption;
use crate::messages::{
    AfiSafi, ErrorCode, Message, NotificationMessage, OpenMessage,
    CEASE_ADMIN_SHUTDOWN, CEASE_CONNECTION_COLLISION, OPEN_BAD_PEER_AS,
};
use crate::{BGP_PORT, CONNECT_TIMEOUT};
use slog::Logger;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Hold time advertised when none is configured.
pub const DEFAULT_HOLD_TIME: u16 = 90;

/// Static description of one configured peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    /// Operator facing name, used in logs.
    pub name: String,
    pub local_asn: u32,
    pub local_address: IpAddr,
    pub peer_address: IpAddr,
    /// ASN the peer is expected to announce in its OPEN.
    pub peer_asn: u32,
    pub afi_safi: BTreeSet<AfiSafi>,
    pub md5_secret: Option<String>,
    pub hold_time: u16,
    /// BGP identifier advertised in the local OPEN.
    pub local_id: u32,
}

impl PeerSession {
    pub fn new(
        name: impl Into<String>,
        local_asn: u32,
        local_address: IpAddr,
        peer_address: IpAddr,
        peer_asn: u32,
    ) -> Result<Self, Error> {
        if peer_address.is_ipv6() {
            return Err(Error::Ipv6Unsupported(peer_address));
        }
        Ok(Self {
            name: name.into(),
            local_asn,
            local_address,
            peer_address,
            peer_asn,
            afi_safi: BTreeSet::from([AfiSafi::IPV4_UNICAST]),
            md5_secret: None,
            hold_time: DEFAULT_HOLD_TIME,
            local_id: 0,
        })
    }

    pub fn from_config(
        router: &RouterConfig,
        peer: &PeerConfig,
    ) -> Result<Self, Error> {
        let mut session = Self::new(
            peer.name.clone(),
            router.asn,
            router.local_address,
            peer.host,
            peer.asn,
        )?;
        session.afi_safi = peer.afi_safi.iter().copied().collect();
        session.md5_secret = peer.md5_auth_key.clone();
        session.hold_time = peer.hold_time;
        session.local_id = router.id;
        Ok(session)
    }
}

/// Requests made to a peering from outside its thread.
#[derive(Debug)]
pub enum AdminEvent {
    AutomaticStart {
        idle_hold: bool,
    },
    ManualStart {
        idle_hold: bool,
        reply: Sender<Result<ManualStartOutcome, Error>>,
    },
    ManualStop {
        reply: Sender<StopSignal>,
    },
    Status {
        reply: Sender<PeerStatus>,
    },
    /// Stop the session and leave the event loop.
    Shutdown,
}

pub enum PeeringEvent<Cnx: BgpConnection> {
    Admin(AdminEvent),

    /// The outbound attempt `attempt` completed.
    Connected { attempt: u64, conn: Cnx },

    /// The outbound attempt `attempt` failed or timed out.
    ConnectFailed { attempt: u64, reason: String },

    Message { conn: ConnectionId, msg: Message },

    /// The connection went away. `disconnect` is set when the close was not
    /// requested locally.
    Closed { conn: ConnectionId, disconnect: bool },

    /// The idle hold timer armed as `generation` ran out.
    IdleHoldTimerExpires { generation: u64 },
}

impl<Cnx: BgpConnection> PeeringEvent<Cnx> {
    pub fn title(&self) -> &'static str {
        match self {
            PeeringEvent::Admin(_) => "admin",
            PeeringEvent::Connected { .. } => "connected",
            PeeringEvent::ConnectFailed { .. } => "connect failed",
            PeeringEvent::Message { .. } => "message",
            PeeringEvent::Closed { .. } => "closed",
            PeeringEvent::IdleHoldTimerExpires { .. } => {
                "idle hold timer expires"
            },
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ManualStartOutcome {
    Started,
    /// The state machine did not allow a start.
    Refused,
    AlreadyEstablished,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub state: FsmStateKind,
    pub started: bool,
    pub peer_id: Option<u32>,
    pub connected: bool,
}

/// Resolves once a stopped peering owns no connection and no pending
/// connect attempt.
#[derive(Debug)]
pub struct StopSignal {
    rx: Option<Receiver<()>>,
}

impl StopSignal {
    fn resolved() -> Self {
        Self { rx: None }
    }

    fn pending() -> (Sender<()>, Self) {
        let (tx, rx) = channel();
        (tx, Self { rx: Some(rx) })
    }

    /// Non-blocking check.
    pub fn is_resolved(&mut self) -> bool {
        let Some(rx) = &self.rx else {
            return true;
        };
        match rx.try_recv() {
            Ok(()) | Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                self.rx = None;
                true
            }
            Err(std::sync::mpsc::TryRecvError::Empty) => false,
        }
    }

    /// Block for up to `timeout`. Returns true if the stop completed. A
    /// peering that has gone away counts as stopped.
    pub fn wait(self, timeout: Duration) -> bool {
        match self.rx {
            None => true,
            Some(rx) => !matches!(
                rx.recv_timeout(timeout),
                Err(RecvTimeoutError::Timeout)
            ),
        }
    }
}

/// What a single call to [`Peering::step`] did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// An event with this title was handled.
    Event(&'static str),
    Timeout,
    Shutdown,
}

/// Ownership of the transport. A live connection can only enter through a
/// completed connect attempt and only leave through the close path or a
/// session failure.
enum Link<Cnx> {
    Down,
    /// Waiting on the idle hold timer armed as `generation` before the next
    /// attempt.
    Holding { generation: u64 },
    Connecting {
        attempt: u64,
        pending: PendingConnect,
    },
    Up(Cnx),
    /// Close requested, waiting for the connection to report it is gone.
    Closing(Cnx),
}

impl<Cnx> Link<Cnx> {
    fn is_down(&self) -> bool {
        matches!(self, Link::Down)
    }
}

pub struct Peering<F: Fsm, C: Connector, H: ProtocolHandler> {
    pub session: PeerSession,

    fsm: F,
    connector: C,
    handler: H,

    link: Link<C::Connection>,
    started: bool,
    peer_id: Option<u32>,

    /// Number of the most recent outbound attempt.
    attempt: u64,
    pending_stops: Vec<Sender<()>>,

    clock: Clock,
    event_tx: Sender<PeeringEvent<C::Connection>>,
    event_rx: Receiver<PeeringEvent<C::Connection>>,
    log: Logger,
}

impl<F: Fsm, C: Connector, H: ProtocolHandler> Peering<F, C, H> {
    /// `resolution` is the tick of the idle hold timer.
    pub fn new(
        session: PeerSession,
        fsm: F,
        connector: C,
        handler: H,
        resolution: Duration,
        log: Logger,
    ) -> Self {
        let (event_tx, event_rx) = channel();
        let clock = Clock::new(resolution, event_tx.clone(), log.clone());
        Self {
            session,
            fsm,
            connector,
            handler,
            link: Link::Down,
            started: false,
            peer_id: None,
            attempt: 0,
            pending_stops: Vec::new(),
            clock,
            event_tx,
            event_rx,
            log,
        }
    }

    /// A handle other threads can use to drive this peering.
    pub fn handle(&self) -> PeerHandle<C::Connection> {
        PeerHandle {
            tx: self.event_tx.clone(),
        }
    }

    /// Sender for the peering's event channel.
    pub fn event_sender(&self) -> Sender<PeeringEvent<C::Connection>> {
        self.event_tx.clone()
    }

    pub fn fsm(&self) -> &F {
        &self.fsm
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            state: self.fsm.state(),
            started: self.started,
            peer_id: self.peer_id,
            connected: matches!(self.link, Link::Up(_)),
        }
    }

    /// Start the session if it is idle and nothing is owned. A start the
    /// state machine refuses is not an error.
    pub fn automatic_start(&mut self, idle_hold: bool) -> Result<(), Error> {
        if self.fsm.state() != FsmStateKind::Idle || !self.link.is_down() {
            peering_log!(self, debug, "automatic start ignored");
            return Ok(());
        }
        match self.fsm.automatic_start(idle_hold) {
            Ok(accepted) => {
                self.started = true;
                peering_log!(self, info, "automatic start";
                    "idle_hold" => idle_hold
                );
                self.dispatch(accepted)
            }
            Err(rejected) => {
                peering_log!(self, debug, "automatic start: {rejected}");
                Ok(())
            }
        }
    }

    pub fn manual_start(
        &mut self,
        idle_hold: bool,
    ) -> Result<ManualStartOutcome, Error> {
        match self.fsm.state() {
            FsmStateKind::Established => {
                return Ok(ManualStartOutcome::AlreadyEstablished)
            }
            FsmStateKind::Idle
                if matches!(self.link, Link::Down | Link::Holding { .. }) => {}
            _ => return Ok(ManualStartOutcome::Refused),
        }
        match self.fsm.manual_start(idle_hold) {
            Ok(accepted) => {
                if let Link::Holding { .. } = self.link {
                    self.clock.timers.idle_hold_timer.disable();
                    self.link = Link::Down;
                }
                self.started = true;
                peering_log!(self, info, "manual start";
                    "idle_hold" => idle_hold
                );
                self.dispatch(accepted)?;
                Ok(ManualStartOutcome::Started)
            }
            Err(rejected) => {
                peering_log!(self, debug, "manual start: {rejected}");
                Ok(ManualStartOutcome::Refused)
            }
        }
    }

    /// Stop the session. The returned signal resolves once the live
    /// connection, if any, has reported that it is closed.
    pub fn manual_stop(&mut self) -> StopSignal {
        self.started = false;
        self.clock.timers.idle_hold_timer.disable();
        if let Err(rejected) = self.fsm.manual_stop() {
            peering_log!(self, warn, "manual stop: {rejected}");
        }
        peering_log!(self, info, "manual stop");

        self.link = match std::mem::replace(&mut self.link, Link::Down) {
            Link::Connecting { attempt, pending } => {
                peering_log!(self, debug, "cancelling attempt {attempt}");
                pending.cancel();
                Link::Down
            }
            Link::Up(conn) => {
                let cease = NotificationMessage::new(
                    ErrorCode::Cease,
                    CEASE_ADMIN_SHUTDOWN,
                );
                if let Err(e) = conn.send(cease.into()) {
                    peering_log!(self, debug, "send cease: {e}");
                }
                conn.close();
                Link::Closing(conn)
            }
            Link::Closing(conn) => Link::Closing(conn),
            Link::Down | Link::Holding { .. } => Link::Down,
        };

        if self.link.is_down() {
            self.resolve_stops();
            return StopSignal::resolved();
        }
        let (tx, signal) = StopSignal::pending();
        self.pending_stops.push(tx);
        signal
    }

    /// Dispatch an outbound connection attempt. Returns `Ok(false)` without
    /// doing anything when the session is established or a connection or
    /// attempt is already owned.
    ///
    /// Errors are fatal to the session, which is stopped before they are
    /// returned. Transient failures are reported through the connection
    /// failure path instead.
    pub fn connect(&mut self) -> Result<bool, Error> {
        if self.fsm.state() == FsmStateKind::Established {
            peering_log!(self, debug, "connect refused: session established");
            return Ok(false);
        }
        if matches!(
            self.link,
            Link::Connecting { .. } | Link::Up(_) | Link::Closing(_)
        ) {
            peering_log!(self, debug, "connect refused: connection owned");
            return Ok(false);
        }

        let req = match self.connect_request() {
            Ok(req) => req,
            Err(e) => {
                self.fail_session(&e);
                return Err(e);
            }
        };

        self.clock.timers.idle_hold_timer.disable();
        self.attempt += 1;
        let attempt = self.attempt;
        peering_log!(self, info, "connecting to {}", req.peer;
            "attempt" => attempt,
            "md5" => req.md5.is_some()
        );

        match self
            .connector
            .connect_tcp(attempt, req, self.event_tx.clone())
        {
            Ok(pending) => {
                self.link = Link::Connecting { attempt, pending };
                Ok(true)
            }
            Err(e) if e.is_session_fatal() => {
                self.fail_session(&e);
                Err(e)
            }
            Err(e) => {
                self.link = Link::Connecting {
                    attempt,
                    pending: PendingConnect::new(),
                };
                self.client_connection_failed(&e.to_string());
                Ok(true)
            }
        }
    }

    fn connect_request(&self) -> Result<ConnectRequest, Error> {
        let md5 = self
            .session
            .md5_secret
            .as_deref()
            .map(|key| {
                Md5SigOption::for_peer(self.session.peer_address, BGP_PORT, key)
            })
            .transpose()?;
        Ok(ConnectRequest {
            peer: SocketAddr::new(self.session.peer_address, BGP_PORT),
            bind: SocketAddr::new(self.session.local_address, 0),
            timeout: CONNECT_TIMEOUT,
            md5,
        })
    }

    /// The current outbound attempt failed.
    pub fn client_connection_failed(&mut self, reason: &str) {
        if let Link::Connecting { .. } = self.link {
            self.link = Link::Down;
        }
        peering_log!(self, warn, "connection failed: {reason}";
            "attempt" => self.attempt
        );
        self.handler
            .on_connection_failed(self.session.peer_address, reason);
        if let Err(rejected) = self.fsm.connection_failed(reason) {
            peering_log!(self, warn, "connection failed: {rejected}");
        }
        if self.started
            && self.fsm.allow_automatic_start()
            && self.fsm.state() == FsmStateKind::Idle
        {
            self.restart();
        }
    }

    /// A connection went away. Only the owned connection resets the
    /// session; closes of connections already let go of are ignored.
    pub fn connection_closed(
        &mut self,
        conn: Option<ConnectionId>,
        disconnect: bool,
    ) {
        let owned = match (&self.link, conn) {
            (Link::Up(c) | Link::Closing(c), Some(id)) => c.id() == id,
            _ => false,
        };
        if owned {
            self.link = Link::Down;
            self.fsm.set_idle();
            peering_log!(self, info, "connection closed";
                "disconnect" => disconnect
            );
            self.resolve_stops();
        } else {
            peering_log!(self, debug, "close of unowned connection";
                "conn" => conn.map(|c| c.0)
            );
        }

        if self.started && self.fsm.allow_automatic_start() {
            self.restart();
        }
    }

    /// Record the identifier learned from the peer's OPEN. A different
    /// identifier than the one already recorded tears the session down.
    pub fn set_peer_id(&mut self, learned: u32) {
        match self.peer_id {
            None => {
                peering_log!(self, info, "peer identifier {learned:#x}");
                self.peer_id = Some(learned);
            }
            Some(id) if id == learned => {}
            Some(id) => {
                peering_log!(self, warn,
                    "peer identifier changed from {id:#x} to {learned:#x}"
                );
                self.peer_id = None;
                self.teardown(Some(NotificationMessage::new(
                    ErrorCode::Cease,
                    CEASE_CONNECTION_COLLISION,
                )));
            }
        }
    }

    /// Handle at most one event, waiting up to `timeout` for it.
    pub fn step(&mut self, timeout: Duration) -> StepOutcome {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => self.handle_event(event),
            Err(RecvTimeoutError::Timeout) => StepOutcome::Timeout,
            // Unreachable while the peering holds its own sender
            Err(RecvTimeoutError::Disconnected) => StepOutcome::Shutdown,
        }
    }

    /// Handle events until shut down.
    pub fn run(&mut self) {
        peering_log!(self, info, "peering running");
        while self.step(crate::IO_TIMEOUT) != StepOutcome::Shutdown {}
        peering_log!(self, info, "peering shut down");
    }

    fn handle_event(
        &mut self,
        event: PeeringEvent<C::Connection>,
    ) -> StepOutcome {
        let title = event.title();
        peering_log!(self, debug, "event {title}"; "event" => title);
        match event {
            PeeringEvent::Admin(admin) => {
                if !self.handle_admin(admin) {
                    return StepOutcome::Shutdown;
                }
            }
            PeeringEvent::Connected { attempt, conn } => {
                self.build_protocol(attempt, conn)
            }
            PeeringEvent::ConnectFailed { attempt, reason } => {
                if self.is_current_attempt(attempt) {
                    self.client_connection_failed(&reason);
                } else {
                    peering_log!(self, debug,
                        "stale failure of attempt {attempt}: {reason}"
                    );
                }
            }
            PeeringEvent::Message { conn, msg } => {
                self.handle_message(conn, msg)
            }
            PeeringEvent::Closed { conn, disconnect } => {
                self.connection_closed(Some(conn), disconnect)
            }
            PeeringEvent::IdleHoldTimerExpires { generation } => {
                self.idle_hold_timer_expires(generation)
            }
        }
        StepOutcome::Event(title)
    }

    /// Returns false on shutdown.
    fn handle_admin(&mut self, event: AdminEvent) -> bool {
        match event {
            AdminEvent::AutomaticStart { idle_hold } => {
                if let Err(e) = self.automatic_start(idle_hold) {
                    peering_log!(self, debug, "automatic start: {e}");
                }
            }
            AdminEvent::ManualStart { idle_hold, reply } => {
                let result = self.manual_start(idle_hold);
                if reply.send(result).is_err() {
                    peering_log!(self, debug, "manual start caller gone");
                }
            }
            AdminEvent::ManualStop { reply } => {
                let signal = self.manual_stop();
                if reply.send(signal).is_err() {
                    peering_log!(self, debug, "manual stop caller gone");
                }
            }
            AdminEvent::Status { reply } => {
                if reply.send(self.status()).is_err() {
                    peering_log!(self, debug, "status caller gone");
                }
            }
            AdminEvent::Shutdown => {
                self.manual_stop();
                return false;
            }
        }
        true
    }

    /// Successful connect callback: take ownership of `conn` and open the
    /// session.
    fn build_protocol(&mut self, attempt: u64, conn: C::Connection) {
        if !self.is_current_attempt(attempt)
            || self.fsm.state() == FsmStateKind::Established
        {
            peering_log!(self, debug, "discarding connection of attempt {attempt}";
                "conn" => conn.id().0
            );
            conn.close();
            return;
        }
        if let Err(rejected) = self.fsm.connection_made() {
            peering_log!(self, warn, "connection made: {rejected}");
            conn.close();
            self.link = Link::Down;
            if self.started && self.fsm.allow_automatic_start() {
                self.restart();
            }
            return;
        }

        let open = OpenMessage::new(
            self.session.local_asn,
            self.session.hold_time,
            self.session.local_id,
            self.session.afi_safi.iter().copied(),
        );
        let sent = conn.send(open.into());
        peering_log!(self, info, "connected";
            "conn" => conn.id().0,
            "attempt" => attempt
        );
        self.link = Link::Up(conn);
        if let Err(e) = sent {
            peering_log!(self, warn, "send open: {e}");
            self.teardown(None);
        }
    }

    fn handle_message(&mut self, id: ConnectionId, msg: Message) {
        if !matches!(&self.link, Link::Up(c) if c.id() == id) {
            peering_log!(self, debug, "{} from unowned connection", msg.title();
                "conn" => id.0
            );
            return;
        }
        match msg {
            Message::Open(open) => self.on_open(open),
            Message::KeepAlive => {
                let before = self.fsm.state();
                match self.fsm.keepalive_received() {
                    Ok(accepted) if accepted.state != before => {
                        peering_log!(self, info, "session {}", accepted.state);
                    }
                    Ok(_) => {}
                    Err(rejected) => {
                        peering_log!(self, warn, "keepalive: {rejected}");
                        self.teardown(Some(NotificationMessage::new(
                            ErrorCode::Fsm,
                            0,
                        )));
                    }
                }
            }
            Message::Notification(n) => {
                peering_log!(self, warn, "notification from peer";
                    "error_code" => n.error_code,
                    "error_subcode" => n.error_subcode
                );
                self.teardown(None);
            }
            Message::Update(_) => {
                peering_log!(self, debug, "ignoring update");
            }
        }
    }

    fn on_open(&mut self, open: OpenMessage) {
        let asn = open.effective_asn();
        if asn != self.session.peer_asn {
            let e = Error::UnexpectedAsn(ExpectationMismatch {
                expected: self.session.peer_asn,
                got: asn,
            });
            peering_log!(self, warn, "open: {e}");
            self.teardown(Some(NotificationMessage::new(
                ErrorCode::Open,
                OPEN_BAD_PEER_AS,
            )));
            return;
        }

        self.set_peer_id(open.id);
        if !matches!(self.link, Link::Up(_)) {
            return;
        }

        if let Err(rejected) = self.fsm.open_received() {
            peering_log!(self, warn, "open: {rejected}");
            self.teardown(Some(NotificationMessage::new(ErrorCode::Fsm, 0)));
            return;
        }
        if let Err(e) = self.send(Message::KeepAlive) {
            peering_log!(self, warn, "send keepalive: {e}");
            self.teardown(None);
            return;
        }
        peering_log!(self, info, "open received";
            "hold_time" => open.hold_time
        );
    }

    fn idle_hold_timer_expires(&mut self, generation: u64) {
        let current = matches!(
            self.link,
            Link::Holding { generation: g } if g == generation
        );
        if !current || !self.started {
            peering_log!(self, debug, "stale idle hold expiry";
                "generation" => generation
            );
            return;
        }
        self.link = Link::Down;
        if let Err(e) = self.automatic_start(false) {
            peering_log!(self, debug, "restart after idle hold: {e}");
        }
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        match &self.link {
            Link::Up(conn) => conn.send(msg),
            _ => Err(Error::NotConnected),
        }
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        matches!(self.link, Link::Connecting { attempt: a, .. } if a == attempt)
    }

    fn dispatch(&mut self, accepted: Accepted) -> Result<(), Error> {
        match accepted.idle_hold {
            Some(hold) => {
                peering_log!(self, info, "holding idle for {hold:?}");
                let generation = self.clock.timers.idle_hold_timer.arm(hold);
                self.link = Link::Holding { generation };
                Ok(())
            }
            None => self.connect().map(|_| ()),
        }
    }

    fn restart(&mut self) {
        if let Err(e) = self.automatic_start(true) {
            peering_log!(self, debug, "automatic restart: {e}");
        }
    }

    /// Close the session from our side. The close completes when the
    /// connection reports back.
    fn teardown(&mut self, notification: Option<NotificationMessage>) {
        self.link = match std::mem::replace(&mut self.link, Link::Down) {
            Link::Up(conn) => {
                if let Some(n) = notification {
                    if let Err(e) = conn.send(n.into()) {
                        peering_log!(self, debug, "send notification: {e}");
                    }
                }
                conn.close();
                Link::Closing(conn)
            }
            Link::Closing(conn) => Link::Closing(conn),
            Link::Connecting { pending, .. } => {
                pending.cancel();
                Link::Down
            }
            Link::Holding { .. } => {
                self.clock.timers.idle_hold_timer.disable();
                Link::Down
            }
            Link::Down => Link::Down,
        };
        self.fsm.set_idle();
        if self.link.is_down() {
            self.resolve_stops();
        }
    }

    /// The session cannot continue. Drop everything and stay stopped.
    fn fail_session(&mut self, err: &Error) {
        peering_log!(self, error, "session failed: {err}");
        self.handler.on_session_failed(self.session.peer_address, err);
        self.started = false;
        self.clock.timers.idle_hold_timer.disable();
        match std::mem::replace(&mut self.link, Link::Down) {
            Link::Up(conn) | Link::Closing(conn) => conn.close(),
            Link::Connecting { pending, .. } => pending.cancel(),
            Link::Down | Link::Holding { .. } => {}
        }
        self.fsm.set_idle();
        self.resolve_stops();
    }

    fn resolve_stops(&mut self) {
        for tx in self.pending_stops.drain(..) {
            // The waiter may have given up
            let _ = tx.send(());
        }
    }
}

/// Cloneable, thread-safe handle to a running peering.
pub struct PeerHandle<Cnx: BgpConnection> {
    tx: Sender<PeeringEvent<Cnx>>,
}

impl<Cnx: BgpConnection> Clone for PeerHandle<Cnx> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Cnx: BgpConnection> PeerHandle<Cnx> {
    fn send(&self, event: AdminEvent) -> Result<(), Error> {
        self.tx
            .send(PeeringEvent::Admin(event))
            .map_err(|e| Error::EventSend(format!("admin: {e}")))
    }

    pub fn automatic_start(&self, idle_hold: bool) -> Result<(), Error> {
        self.send(AdminEvent::AutomaticStart { idle_hold })
    }

    pub fn manual_start(
        &self,
        idle_hold: bool,
    ) -> Result<ManualStartOutcome, Error> {
        let (reply, rx) = channel();
        self.send(AdminEvent::ManualStart { idle_hold, reply })?;
        rx.recv().map_err(|e| {
            Error::InternalCommunication(format!("manual start reply: {e}"))
        })?
    }

    pub fn manual_stop(&self) -> Result<StopSignal, Error> {
        let (reply, rx) = channel();
        self.send(AdminEvent::ManualStop { reply })?;
        rx.recv().map_err(|e| {
            Error::InternalCommunication(format!("manual stop reply: {e}"))
        })
    }

    pub fn status(&self) -> Result<PeerStatus, Error> {
        let (reply, rx) = channel();
        self.send(AdminEvent::Status { reply })?;
        rx.recv().map_err(|e| {
            Error::InternalCommunication(format!("status reply: {e}"))
        })
    }

    pub fn shutdown(&self) -> Result<(), Error> {
        self.send(AdminEvent::Shutdown)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::{Afi, Safi};
    use bgp_common::ip;
    use pretty_assertions::assert_eq;

    #[test]
    fn session_rejects_ipv6_peer() {
        let result =
            PeerSession::new("v6", 64512, ip!("::"), ip!("fd00::2"), 64513);
        assert!(matches!(result, Err(Error::Ipv6Unsupported(_))));
    }

    #[test]
    fn session_from_config() {
        let router = RouterConfig {
            asn: 64512,
            id: 0x0a000001,
            local_address: ip!("10.0.0.1"),
        };
        let peer: PeerConfig = serde_json::from_str(
            r#"{
                "name": "r2",
                "host": "10.0.0.2",
                "asn": 64513,
                "md5_auth_key": "abc123",
                "hold_time": 30,
                "afi_safi": [
                    { "afi": "ipv4", "safi": "unicast" },
                    { "afi": "ipv4", "safi": "multicast" },
                    { "afi": "ipv4", "safi": "unicast" }
                ]
            }"#,
        )
        .expect("parse peer");

        let s = PeerSession::from_config(&router, &peer).expect("session");
        assert_eq!(s.local_asn, 64512);
        assert_eq!(s.local_id, 0x0a000001);
        assert_eq!(s.peer_address, "10.0.0.2".parse::<IpAddr>().expect("ip address"));
        assert_eq!(s.md5_secret.as_deref(), Some("abc123"));
        assert_eq!(s.hold_time, 30);
        assert_eq!(
            s.afi_safi,
            BTreeSet::from([
                AfiSafi::IPV4_UNICAST,
                AfiSafi {
                    afi: Afi::Ipv4,
                    safi: Safi::Multicast
                },
            ])
        );
    }

    #[test]
    fn stop_signal_resolution() {
        let mut done = StopSignal::resolved();
        assert!(done.is_resolved());

        let (tx, mut signal) = StopSignal::pending();
        assert!(!signal.is_resolved());
        tx.send(()).expect("resolve");
        assert!(signal.is_resolved());

        let (tx, signal) = StopSignal::pending();
        drop(tx);
        assert!(signal.wait(Duration::from_millis(10)));

        let (_tx, signal) = StopSignal::pending();
        assert!(!signal.wait(Duration::from_millis(10)));
    }
}
