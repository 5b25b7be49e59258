//! Context: owner of every connection, the listener, and the progress
//! engine.
//!
//! The context is strictly single-threaded. The only way anything makes
//! progress is [`Context::progress`]; completions and notifications are
//! queued there and drained by the caller through
//! [`Context::poll_event`], in delivery order. `U` is the caller's
//! completion token type, carried opaquely by every posted operation and
//! returned with its completion.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use nix::sys::socket::{AddressFamily, SockFlag, SockType, SockaddrStorage};

use crate::connection::{ConnId, ConnState, Connection, IoRegion, SendKind};
use crate::error::{Error, Result, Status};

/// Context configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-message size; inbound control frames above this length are
    /// a protocol violation.
    pub iomsg_size: usize,
    /// Deadline for connection establishment (connect and handshake).
    /// `None` disables the reaper.
    pub connect_timeout: Option<Duration>,
    /// Rendezvous threshold hint. `None` leaves the choice to the
    /// transport. The stream binding has a single delivery protocol, so
    /// the value is recorded and queryable but does not change framing.
    pub rndv_thresh: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iomsg_size: 256,
            connect_timeout: Some(Duration::from_secs(20)),
            rndv_thresh: None,
        }
    }
}

/// Memory pinning statistics.
///
/// For the stream binding: `regions`/`bytes` count the currently posted
/// operation regions, and `evictions` counts frames that fell off the
/// zero-copy path into a staged copy because no receive was posted yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinStats {
    pub regions: u64,
    pub bytes: u64,
    pub evictions: u64,
}

/// Notification drained from [`Context::poll_event`].
#[derive(Debug)]
pub enum Event<U> {
    /// A server-side connection completed its handshake.
    Accepted { conn: ConnId },
    /// Result of a [`Context::connect`] attempt.
    ConnectResult { conn: ConnId, status: Status },
    /// A control message arrived. Return the buffer with
    /// [`Context::recycle_buf`] after dispatch.
    Control { conn: ConnId, data: Vec<u8> },
    /// Transport failure on an established connection. Outstanding
    /// operations have already completed with the same status.
    ConnError { conn: ConnId, status: Status },
    /// Teardown finished; the connection no longer exists.
    Closed { conn: ConnId },
    /// A posted operation finished.
    OpComplete { token: U, status: Status },
}

/// State shared between the context and its connections during a
/// progress pass: the event queue, pin accounting and the staging-buffer
/// free list.
pub(crate) struct Shared<U> {
    events: VecDeque<Event<U>>,
    staging: Vec<Vec<u8>>,
    defunct: Vec<ConnId>,
    pin_regions: u64,
    pin_bytes: u64,
    evictions: u64,
}

impl<U> Shared<U> {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            staging: Vec::new(),
            defunct: Vec::new(),
            pin_regions: 0,
            pin_bytes: 0,
            evictions: 0,
        }
    }

    #[inline]
    pub(crate) fn push(&mut self, event: Event<U>) {
        self.events.push_back(event);
    }

    #[inline]
    pub(crate) fn complete(&mut self, token: U, status: Status) {
        self.events.push_back(Event::OpComplete { token, status });
    }

    pub(crate) fn take_buf(&mut self, len: usize) -> Vec<u8> {
        let mut buf = self.staging.pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    pub(crate) fn put_buf(&mut self, buf: Vec<u8>) {
        self.staging.push(buf);
    }

    #[inline]
    pub(crate) fn region_add(&mut self, len: usize) {
        self.pin_regions += 1;
        self.pin_bytes += len as u64;
    }

    #[inline]
    pub(crate) fn region_sub(&mut self, len: usize) {
        debug_assert!(self.pin_regions > 0);
        self.pin_regions -= 1;
        self.pin_bytes -= len as u64;
    }

    #[inline]
    pub(crate) fn evict(&mut self) {
        self.evictions += 1;
    }

    #[inline]
    pub(crate) fn defunct(&mut self, id: ConnId) {
        self.defunct.push(id);
    }
}

/// Single-threaded tag-matched messaging context.
pub struct Context<U> {
    cfg: Config,
    listener: Option<TcpListener>,
    conns: HashMap<u32, Connection<U>>,
    next_conn_id: u32,
    /// Connections whose teardown completes on the next progress pass.
    disconnecting: Vec<ConnId>,
    sh: Shared<U>,
}

impl<U> Context<U> {
    /// Create a context.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            listener: None,
            conns: HashMap::new(),
            next_conn_id: 1,
            disconnecting: Vec::new(),
            sh: Shared::new(),
        }
    }

    /// Rendezvous threshold hint recorded at creation.
    pub fn rndv_thresh(&self) -> Option<usize> {
        self.cfg.rndv_thresh
    }

    /// Bind a non-blocking listener. Accepted connections surface as
    /// [`Event::Accepted`] once their handshake completes.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Some(l) => Ok(l.local_addr()?),
            None => Err(Error::NotListening),
        }
    }

    /// Start a non-blocking connect. The result surfaces as
    /// [`Event::ConnectResult`]; on failure the connection object stays
    /// around (with its status latched) until [`Context::disconnect`].
    pub fn connect(&mut self, addr: SocketAddr) -> Result<ConnId> {
        use nix::errno::Errno;

        let family = if addr.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };
        let fd = nix::sys::socket::socket(
            family,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK,
            None,
        )?;
        let target = SockaddrStorage::from(addr);
        let state = match nix::sys::socket::connect(fd.as_raw_fd(), &target) {
            Ok(()) => Ok(ConnState::Handshake),
            Err(Errno::EINPROGRESS) => Ok(ConnState::Connecting),
            Err(e) => Err(e),
        };
        let stream = TcpStream::from(fd);
        let id = self.alloc_conn_id();
        let deadline = self.establish_deadline();
        let conn = Connection::new(
            id,
            stream,
            false,
            state.unwrap_or(ConnState::Connecting),
            Some(target),
            deadline,
            self.cfg.iomsg_size,
        );
        self.conns.insert(id.0, conn);
        if state.is_err() {
            // Immediate refusal still reports through ConnectResult, the
            // same path a delayed failure takes.
            let conn = self.conns.get_mut(&id.0).unwrap();
            conn.fail(Status::ConnectionReset, &mut self.sh);
        }
        Ok(id)
    }

    /// Begin teardown of a connection. Idempotent. Every outstanding
    /// operation completes with [`Status::Canceled`] (or the previously
    /// latched failure status); [`Event::Closed`] is emitted from the
    /// next progress pass, after those completions.
    pub fn disconnect(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(&id.0) {
            if conn.begin_disconnect(&mut self.sh) {
                self.disconnecting.push(id);
            }
        }
    }

    /// Queue one control-message send.
    ///
    /// Returns `false` if the connection cannot accept posts; the token
    /// still completes, with the connection's latched status.
    pub fn send_io_message(&mut self, id: ConnId, region: IoRegion, sn: u32, token: U) -> bool {
        self.post(id, SendKind::Control, region, sn, token)
    }

    /// Queue one data send tagged with `sn`.
    pub fn send_data(&mut self, id: ConnId, region: IoRegion, sn: u32, token: U) -> bool {
        self.post(id, SendKind::Data, region, sn, token)
    }

    fn post(&mut self, id: ConnId, kind: SendKind, region: IoRegion, sn: u32, token: U) -> bool {
        match self.conns.get_mut(&id.0) {
            Some(conn) => conn.post_send(kind, region, sn, token, &mut self.sh),
            None => {
                self.sh.complete(token, Status::NotConnected);
                false
            }
        }
    }

    /// Post one receive for a data frame tagged with `sn`.
    pub fn recv_data(&mut self, id: ConnId, region: IoRegion, sn: u32, token: U) -> bool {
        match self.conns.get_mut(&id.0) {
            Some(conn) => conn.post_recv(region, sn, token, &mut self.sh),
            None => {
                self.sh.complete(token, Status::NotConnected);
                false
            }
        }
    }

    /// Drive everything: accepts, connect polling, handshakes, send
    /// flushing, receive parsing, establishment timeouts and teardown.
    /// Returns the number of events now waiting in the queue.
    pub fn progress(&mut self) -> usize {
        let now = Instant::now();

        // Finish teardown requested before this pass: cancellation
        // completions were already queued, so Closed orders after them.
        for id in std::mem::take(&mut self.disconnecting) {
            self.conns.remove(&id.0);
            self.sh.push(Event::Closed { conn: id });
        }

        self.pump_accepts();

        for conn in self.conns.values_mut() {
            conn.pump(now, &mut self.sh);
        }

        // Server-side connections that died during establishment were
        // never surfaced; reap them silently.
        for id in std::mem::take(&mut self.sh.defunct) {
            self.conns.remove(&id.0);
        }

        self.sh.events.len()
    }

    fn pump_accepts(&mut self) {
        if self.listener.is_none() {
            return;
        }
        loop {
            let accepted = self.listener.as_ref().unwrap().accept();
            match accepted {
                Ok((stream, _addr)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let id = self.alloc_conn_id();
                    let deadline = self.establish_deadline();
                    let conn = Connection::new(
                        id,
                        stream,
                        true,
                        ConnState::Handshake,
                        None,
                        deadline,
                        self.cfg.iomsg_size,
                    );
                    self.conns.insert(id.0, conn);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Drain the next queued event.
    pub fn poll_event(&mut self) -> Option<Event<U>> {
        self.sh.events.pop_front()
    }

    /// Return a control-message buffer for reuse.
    pub fn recycle_buf(&mut self, buf: Vec<u8>) {
        self.sh.put_buf(buf);
    }

    /// Look up a connection.
    pub fn conn(&self, id: ConnId) -> Option<&Connection<U>> {
        self.conns.get(&id.0)
    }

    /// Number of live connection objects, in any state.
    pub fn num_connections(&self) -> usize {
        self.conns.len()
    }

    /// Ids of all live connections.
    pub fn connection_ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.conns.values().map(|c| c.id()).collect();
        ids.sort();
        ids
    }

    /// Current pinning statistics.
    pub fn pin_stats(&self) -> PinStats {
        PinStats {
            regions: self.sh.pin_regions,
            bytes: self.sh.pin_bytes,
            evictions: self.sh.evictions,
        }
    }

    fn alloc_conn_id(&mut self) -> ConnId {
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        id
    }

    fn establish_deadline(&self) -> Option<Instant> {
        self.cfg
            .connect_timeout
            .and_then(|t| Instant::now().checked_add(t))
    }
}
