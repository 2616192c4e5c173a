// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{
    BgpConnection, ConnectRequest, ConnectionId, Connector, PendingConnect,
};
use crate::error::Error;
use crate::log::{connection_log, connection_log_lite};
use crate::messages::{Header, Message};
use crate::peering::PeeringEvent;
use bgp_common::lock;
use slog::Logger;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::os::fd::AsRawFd;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::{Duration, Instant};

/// Opens outbound BGP connections over the host TCP stack.
pub struct TcpConnector {
    log: Logger,
}

impl TcpConnector {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }

    /// Create and bind the socket and install the MD5 option. Failures here
    /// are reported synchronously.
    fn prepare(req: &ConnectRequest) -> Result<Socket, Error> {
        let socket = Socket::new(
            Domain::for_address(req.peer),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.bind(&SockAddr::from(req.bind))?;
        if let Some(md5) = &req.md5 {
            md5.apply(&socket)?;
        }
        Ok(socket)
    }
}

impl Connector for TcpConnector {
    type Connection = BgpConnectionTcp;

    fn connect_tcp(
        &self,
        attempt: u64,
        req: ConnectRequest,
        event_tx: Sender<PeeringEvent<BgpConnectionTcp>>,
    ) -> Result<PendingConnect, Error> {
        let socket = Self::prepare(&req)?;
        let pending = PendingConnect::new();
        let cancelled = pending.clone();
        let log = self.log.clone();

        spawn(move || {
            let peer = req.peer;
            let result = connect(&socket, peer, req.timeout, &cancelled);
            if cancelled.is_cancelled() {
                // Dropping the socket aborts a handshake still in flight.
                connection_log_lite!(log, debug,
                    "attempt {attempt} to {peer} cancelled, dropping result";
                    "attempt" => attempt
                );
                return;
            }
            let event = match result {
                Ok(()) => {
                    let stream: TcpStream = socket.into();
                    match BgpConnectionTcp::spawn(stream, peer, log.clone()) {
                        Ok((conn, recv)) => {
                            // The peering must own the connection before any
                            // message from it can arrive.
                            if event_tx
                                .send(PeeringEvent::Connected { attempt, conn })
                                .is_ok()
                            {
                                recv.run(event_tx);
                            }
                            return;
                        }
                        Err(e) => PeeringEvent::ConnectFailed {
                            attempt,
                            reason: e.to_string(),
                        },
                    }
                }
                Err(e) => {
                    connection_log_lite!(log, debug,
                        "connect to {peer} failed: {e}";
                        "attempt" => attempt
                    );
                    PeeringEvent::ConnectFailed {
                        attempt,
                        reason: failure_reason(&e),
                    }
                }
            };
            if let Err(e) = event_tx.send(event) {
                connection_log_lite!(log, warn,
                    "attempt {attempt}: peering gone: {e}";
                    "attempt" => attempt
                );
            }
        });

        Ok(pending)
    }
}

/// Connect `socket` to `peer`, giving up after `timeout` or as soon as the
/// attempt is cancelled. A cancelled attempt returns `Ok(())` with the socket
/// left unconnected; callers check the cancel flag first.
fn connect(
    socket: &Socket,
    peer: SocketAddr,
    timeout: Duration,
    cancelled: &PendingConnect,
) -> std::io::Result<()> {
    socket.set_nonblocking(true)?;
    match socket.connect(&SockAddr::from(peer)) {
        Ok(()) => {}
        Err(e) if in_progress(&e) => {
            let deadline = Instant::now() + timeout;
            loop {
                if cancelled.is_cancelled() {
                    return Ok(());
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(ErrorKind::TimedOut.into());
                }
                let wait = (deadline - now).min(crate::IO_TIMEOUT);
                if wait_writable(socket, wait)? {
                    break;
                }
            }
            if let Some(e) = socket.take_error()? {
                return Err(e);
            }
        }
        Err(e) => return Err(e),
    }
    socket.set_nonblocking(false)
}

fn in_progress(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
        || e.kind() == ErrorKind::WouldBlock
}

/// Wait up to `timeout` for `socket` to become writable, which is how a
/// non-blocking connect reports completion.
fn wait_writable(
    socket: &Socket,
    timeout: Duration,
) -> std::io::Result<bool> {
    let mut fd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLOUT,
        revents: 0,
    };
    let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `fd` is a single valid pollfd for the duration of the call.
    let n = unsafe { libc::poll(&mut fd, 1, ms) };
    if n < 0 {
        let e = std::io::Error::last_os_error();
        if e.kind() == ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(e);
    }
    Ok(n > 0)
}

/// Normalize the reason reported for a failed connect.
fn failure_reason(e: &std::io::Error) -> String {
    match e.kind() {
        ErrorKind::ConnectionRefused => "connection refused".into(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            "connection timed out".into()
        }
        _ => e.to_string(),
    }
}

pub struct BgpConnectionTcp {
    id: ConnectionId,
    peer: SocketAddr,
    conn: Arc<Mutex<TcpStream>>,
    closed: Arc<AtomicBool>,
    log: Logger,
}

impl BgpConnection for BgpConnectionTcp {
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
        connection_log!(self, trace, "sending {}", msg.title();
            "message" => format!("{msg:?}")
        );
        let buf = msg.to_frame()?;
        lock!(self.conn).write_all(&buf)?;
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        connection_log!(self, debug, "closing connection");
        if let Err(e) = lock!(self.conn).shutdown(Shutdown::Both) {
            connection_log!(self, debug, "shutdown: {e}");
        }
    }
}

impl Drop for BgpConnectionTcp {
    fn drop(&mut self) {
        self.close();
    }
}

impl BgpConnectionTcp {
    /// Wrap a connected stream. The returned receiver is started once the
    /// connection has been handed over.
    fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        log: Logger,
    ) -> Result<(Self, RecvLoop), Error> {
        stream.set_write_timeout(Some(crate::SEND_TIMEOUT))?;
        let reader = stream.try_clone()?;
        reader.set_read_timeout(Some(crate::IO_TIMEOUT))?;
        let id = ConnectionId::next();
        let closed = Arc::new(AtomicBool::new(false));
        let recv = RecvLoop {
            id,
            peer,
            stream: reader,
            closed: closed.clone(),
            log: log.clone(),
        };
        let conn = Self {
            id,
            peer,
            conn: Arc::new(Mutex::new(stream)),
            closed,
            log,
        };
        Ok((conn, recv))
    }
}

/// Reads framed messages off a connection and posts them to the peering.
struct RecvLoop {
    id: ConnectionId,
    peer: SocketAddr,
    stream: TcpStream,
    closed: Arc<AtomicBool>,
    log: Logger,
}

impl RecvLoop {
    fn run<Cnx: BgpConnection>(mut self, event_tx: Sender<PeeringEvent<Cnx>>) {
        connection_log!(self, debug, "spawning recv loop");
        loop {
            match self.recv_msg() {
                Ok(Some(msg)) => {
                    connection_log!(self, trace, "recv {}", msg.title());
                    let event = PeeringEvent::Message { conn: self.id, msg };
                    if let Err(e) = event_tx.send(event) {
                        connection_log!(self, warn, "error sending event: {e}");
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if !self.closed.load(Ordering::Relaxed) {
                        connection_log!(self, warn, "recv: {e}");
                    }
                    break;
                }
            }
        }

        // A close we did not ask for is a disconnect by the peer.
        let disconnect = !self.closed.swap(true, Ordering::Relaxed);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            connection_log!(self, trace, "shutdown: {e}");
        }
        let event = PeeringEvent::Closed {
            conn: self.id,
            disconnect,
        };
        if let Err(e) = event_tx.send(event) {
            connection_log!(self, debug, "error sending close event: {e}");
        }
    }

    /// Returns `None` when the connection has been closed.
    fn recv_msg(&mut self) -> Result<Option<Message>, Error> {
        let mut buf = [0u8; Header::WIRE_SIZE];
        if !self.read_full(&mut buf)? {
            return Ok(None);
        }
        let header = Header::from_wire(&buf)?;
        let mut body = vec![0u8; header.body_len()];
        if !self.read_full(&mut body)? {
            return Ok(None);
        }
        Ok(Some(Message::from_wire(&header, &body)?))
    }

    /// Fill `buf` completely. Returns false on end of stream or local close.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<bool, Error> {
        let mut i = 0;
        while i < buf.len() {
            if self.closed.load(Ordering::Relaxed) {
                return Ok(false);
            }
            match self.stream.read(&mut buf[i..]) {
                Ok(0) => return Ok(false),
                Ok(n) => i += n,
                // The read timeout lets us check the close flag
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::md5::Md5SigOption;
    use crate::messages::OpenMessage;
    use crate::messages::AfiSafi;
    use bgp_common::log::discard_logger;
    use bgp_common::sockaddr;
    use std::net::{IpAddr, TcpListener};
    use std::sync::mpsc::{channel, Receiver};

    const WAIT: Duration = Duration::from_secs(5);

    fn request(peer: SocketAddr) -> ConnectRequest {
        ConnectRequest {
            peer,
            bind: sockaddr!("127.0.0.1:0"),
            timeout: WAIT,
            md5: None,
        }
    }

    fn connected(
        rx: &Receiver<PeeringEvent<BgpConnectionTcp>>,
    ) -> BgpConnectionTcp {
        match rx.recv_timeout(WAIT).expect("connect event") {
            PeeringEvent::Connected { attempt, conn } => {
                assert_eq!(attempt, 7);
                conn
            }
            other => panic!("expected connected, got {}", other.title()),
        }
    }

    #[test]
    fn connect_exchange_and_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
        let addr = listener.local_addr().expect("listen addr");
        let (tx, rx) = channel();

        TcpConnector::new(discard_logger())
            .connect_tcp(7, request(addr), tx)
            .expect("dispatch");
        let conn = connected(&rx);
        let (mut remote, _) = listener.accept().expect("accept");
        assert_eq!(conn.peer(), addr);

        remote
            .write_all(&Message::KeepAlive.to_frame().expect("frame"))
            .expect("write keepalive");
        match rx.recv_timeout(WAIT).expect("message event") {
            PeeringEvent::Message { conn: id, msg } => {
                assert_eq!(id, conn.id());
                assert_eq!(msg, Message::KeepAlive);
            }
            other => panic!("expected message, got {}", other.title()),
        }

        let open = OpenMessage::new(64512, 90, 1, [AfiSafi::IPV4_UNICAST]);
        conn.send(open.clone().into()).expect("send open");
        let mut hdr = [0u8; Header::WIRE_SIZE];
        remote.read_exact(&mut hdr).expect("read header");
        let hdr = Header::from_wire(&hdr).expect("parse header");
        let mut body = vec![0u8; hdr.body_len()];
        remote.read_exact(&mut body).expect("read body");
        assert_eq!(
            Message::from_wire(&hdr, &body).expect("parse open"),
            Message::Open(open)
        );

        drop(remote);
        match rx.recv_timeout(WAIT).expect("close event") {
            PeeringEvent::Closed { conn: id, disconnect } => {
                assert_eq!(id, conn.id());
                assert!(disconnect);
            }
            other => panic!("expected closed, got {}", other.title()),
        }
    }

    #[test]
    fn local_close() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
        let addr = listener.local_addr().expect("listen addr");
        let (tx, rx) = channel();

        TcpConnector::new(discard_logger())
            .connect_tcp(7, request(addr), tx)
            .expect("dispatch");
        let conn = connected(&rx);
        let _remote = listener.accept().expect("accept");

        conn.close();
        assert!(matches!(
            conn.send(Message::KeepAlive),
            Err(Error::NotConnected)
        ));
        match rx.recv_timeout(WAIT).expect("close event") {
            PeeringEvent::Closed { disconnect, .. } => assert!(!disconnect),
            other => panic!("expected closed, got {}", other.title()),
        }
    }

    #[test]
    fn refused_connection_reports_failure() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
            listener.local_addr().expect("listen addr")
        };
        let (tx, rx) = channel::<PeeringEvent<BgpConnectionTcp>>();

        TcpConnector::new(discard_logger())
            .connect_tcp(3, request(addr), tx)
            .expect("dispatch");
        match rx.recv_timeout(WAIT).expect("failure event") {
            PeeringEvent::ConnectFailed { attempt, reason } => {
                assert_eq!(attempt, 3);
                assert_eq!(reason, "connection refused");
            }
            other => panic!("expected failure, got {}", other.title()),
        }
    }

    #[test]
    fn bind_failure_is_synchronous() {
        let (tx, _rx) = channel::<PeeringEvent<BgpConnectionTcp>>();
        let mut req = request(sockaddr!("127.0.0.1:179"));
        // Documentation range address, not assigned locally
        req.bind = sockaddr!("192.0.2.1:0");
        let result = TcpConnector::new(discard_logger()).connect_tcp(1, req, tx);
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn send_to_stalled_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
        let addr = listener.local_addr().expect("listen addr");
        let (tx, rx) = channel();

        TcpConnector::new(discard_logger())
            .connect_tcp(7, request(addr), tx)
            .expect("dispatch");
        let conn = connected(&rx);
        // Accepted but never read from.
        let _remote = listener.accept().expect("accept");

        let update = Message::Update(vec![0u8; 4000]);
        let start = Instant::now();
        let mut result = Ok(());
        for _ in 0..100_000 {
            result = conn.send(update.clone());
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cancelled_attempt_never_reaches_peer() {
        // A listener with a full accept queue drops new SYNs, which keeps
        // the attempt in its handshake until it is cancelled.
        let listener = Socket::new(Domain::IPV4, Type::STREAM, None)
            .expect("socket");
        let any: SocketAddr = sockaddr!("127.0.0.1:0");
        listener.bind(&SockAddr::from(any)).expect("bind");
        listener.listen(0).expect("listen");
        let listener: TcpListener = listener.into();
        let addr = listener.local_addr().expect("listen addr");

        let mut fillers = Vec::new();
        while let Ok(s) =
            TcpStream::connect_timeout(&addr, Duration::from_millis(200))
        {
            fillers.push(s);
            assert!(fillers.len() < 16, "accept queue never filled");
        }

        // A fixed local port identifies the attempt on the listener side.
        let bind = TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .expect("spare port");
        let mut req = request(addr);
        req.bind = bind;
        req.timeout = Duration::from_secs(10);
        let (tx, rx) = channel::<PeeringEvent<BgpConnectionTcp>>();
        let pending = TcpConnector::new(discard_logger())
            .connect_tcp(1, req, tx)
            .expect("dispatch");

        std::thread::sleep(Duration::from_millis(300));
        pending.cancel();
        std::thread::sleep(crate::IO_TIMEOUT * 5);

        // Drain the queue long enough to see SYN retransmits.
        listener.set_nonblocking(true).expect("nonblocking");
        let deadline = Instant::now() + Duration::from_secs(4);
        let mut accepted = Vec::new();
        while Instant::now() < deadline {
            match listener.accept() {
                Ok((_, from)) => accepted.push(from),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("accept: {e}"),
            }
        }
        assert!(!accepted.contains(&bind), "cancelled attempt connected");
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn md5_keyed_connect() {
        let key = "abc123";
        let local = IpAddr::from([127, 0, 0, 1]);
        let listener =
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
                .expect("socket");
        let any: SocketAddr = sockaddr!("127.0.0.1:0");
        listener.bind(&SockAddr::from(any)).expect("bind");
        Md5SigOption::for_peer(local, 0, key)
            .expect("listener option")
            .apply(&listener)
            .expect("listener md5");
        listener.listen(8).expect("listen");
        let listener: TcpListener = listener.into();
        let addr = listener.local_addr().expect("listen addr");

        let mut req = request(addr);
        req.md5 = Some(
            Md5SigOption::for_peer(local, addr.port(), key).expect("option"),
        );
        let (tx, rx) = channel();
        TcpConnector::new(discard_logger())
            .connect_tcp(7, req, tx)
            .expect("dispatch");
        let conn = connected(&rx);
        let _remote = listener.accept().expect("accept");
        assert_eq!(conn.peer(), addr);

        // The keyed listener drops unsigned segments.
        let mut req = request(addr);
        req.timeout = Duration::from_secs(1);
        let (tx, rx) = channel::<PeeringEvent<BgpConnectionTcp>>();
        TcpConnector::new(discard_logger())
            .connect_tcp(8, req, tx)
            .expect("dispatch");
        match rx.recv_timeout(WAIT).expect("failure event") {
            PeeringEvent::ConnectFailed { attempt, reason } => {
                assert_eq!(attempt, 8);
                assert_eq!(reason, "connection timed out");
            }
            other => panic!("expected failure, got {}", other.title()),
        }
    }
}
