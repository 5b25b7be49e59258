//! Per-peer connection state.
//!
//! A connection owns one non-blocking stream plus the queues that give it
//! tag-matched messaging semantics: a pending-send FIFO, a posted-receive
//! list matched FIFO-per-tag, and an unexpected-frame queue holding data
//! that arrived before its receive was posted. All progress happens from
//! [`Context::progress`](crate::Context::progress); completions are
//! queued as events, never called back through the API.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Instant;

use nix::sys::socket::SockaddrStorage;

use crate::context::{Event, Shared};
use crate::error::Status;
use crate::wire::{
    self, decode_frame_hdr, decode_hello, encode_frame_hdr, encode_hello, is_iomsg_tag,
    FRAME_HDR_SIZE, HELLO_SIZE,
};

/// Stable handle for a connection owned by a [`Context`](crate::Context).
///
/// Ids are allocated from a monotonically increasing counter and never
/// reused within one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u32);

impl ConnId {
    /// Raw id value (the one carried in wire tags).
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Memory region posted to the transport.
///
/// The region is a raw view: whoever posts it keeps the backing
/// allocation alive and unmoved until the operation carrying it
/// completes (or is canceled), and does not touch the bytes in between.
#[derive(Debug, Clone, Copy)]
pub struct IoRegion {
    ptr: *mut u8,
    len: usize,
}

impl IoRegion {
    /// Create a region over `ptr..ptr + len`.
    ///
    /// # Safety
    /// The memory must stay valid, unmoved and otherwise untouched until
    /// the posted operation completes.
    #[inline]
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Region length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// Caller must hold the only access to the region.
    #[inline]
    pub(crate) unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    /// # Safety
    /// Caller must hold the only access to the region.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// Which tag namespace a send belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendKind {
    Control,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Stream connect still in flight (outgoing side).
    Connecting,
    /// Stream is up, hello exchange incomplete.
    Handshake,
    Established,
    /// Error latched; waiting for an explicit disconnect.
    Failed,
    /// Teardown accepted; the next progress pass emits `Closed`.
    Disconnecting,
}

pub(crate) struct PendingSend<U> {
    header: [u8; FRAME_HDR_SIZE],
    header_sent: usize,
    body: IoRegion,
    body_sent: usize,
    token: U,
}

pub(crate) struct PostedRecv<U> {
    tag: u64,
    region: IoRegion,
    token: U,
}

/// A data frame that arrived before its receive was posted, staged into
/// an owned copy (eager-unexpected semantics).
struct StagedFrame {
    tag: u64,
    data: Vec<u8>,
}

enum InboundFrame<U> {
    /// Reading straight into a matched posted receive.
    Posted {
        recv: PostedRecv<U>,
        got: usize,
        len: usize,
    },
    /// Reading into a staging buffer: a control message, or unexpected
    /// data.
    Staged {
        tag: u64,
        data: Vec<u8>,
        got: usize,
        control: bool,
    },
}

enum IoStep {
    Progress(usize),
    Blocked,
    Failed(Status),
}

enum Pump {
    Continue,
    Blocked,
    Failed(Status),
}

fn read_step(stream: &mut TcpStream, buf: &mut [u8]) -> IoStep {
    match stream.read(buf) {
        Ok(0) => IoStep::Failed(Status::ConnectionReset),
        Ok(n) => IoStep::Progress(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoStep::Blocked,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => IoStep::Blocked,
        Err(_) => IoStep::Failed(Status::ConnectionReset),
    }
}

fn write_step(stream: &mut TcpStream, buf: &[u8]) -> IoStep {
    match stream.write(buf) {
        Ok(0) => IoStep::Failed(Status::ConnectionReset),
        Ok(n) => IoStep::Progress(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoStep::Blocked,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => IoStep::Blocked,
        Err(_) => IoStep::Failed(Status::ConnectionReset),
    }
}

enum FlushResult {
    Done,
    Blocked,
    Failed(Status),
}

fn flush_send<U>(stream: &mut TcpStream, front: &mut PendingSend<U>) -> FlushResult {
    while front.header_sent < FRAME_HDR_SIZE {
        match write_step(stream, &front.header[front.header_sent..]) {
            IoStep::Progress(n) => front.header_sent += n,
            IoStep::Blocked => return FlushResult::Blocked,
            IoStep::Failed(st) => return FlushResult::Failed(st),
        }
    }
    while front.body_sent < front.body.len() {
        // Safety: the poster keeps the region alive until this operation
        // completes.
        let body = unsafe { front.body.as_slice() };
        match write_step(stream, &body[front.body_sent..]) {
            IoStep::Progress(n) => front.body_sent += n,
            IoStep::Blocked => return FlushResult::Blocked,
            IoStep::Failed(st) => return FlushResult::Failed(st),
        }
    }
    FlushResult::Done
}

/// One peer connection.
pub struct Connection<U> {
    id: ConnId,
    /// Peer-allocated id placed into outgoing tags; 0 until established.
    remote_id: u32,
    stream: TcpStream,
    pub(crate) state: ConnState,
    status: Status,
    server_side: bool,
    /// Establishment deadline; `None` disables the reaper.
    deadline: Option<Instant>,
    /// Target address, kept while the non-blocking connect is in flight.
    connect_addr: Option<SockaddrStorage>,
    iomsg_size: usize,
    peer_name: String,
    log_prefix: String,

    hello_out: [u8; HELLO_SIZE],
    hello_sent: usize,
    hello_in: [u8; HELLO_SIZE],
    hello_got: usize,

    sends: VecDeque<PendingSend<U>>,
    recvs: VecDeque<PostedRecv<U>>,
    unexpected: VecDeque<StagedFrame>,

    hdr_buf: [u8; FRAME_HDR_SIZE],
    hdr_got: usize,
    cur: Option<InboundFrame<U>>,
}

impl<U> Connection<U> {
    pub(crate) fn new(
        id: ConnId,
        stream: TcpStream,
        server_side: bool,
        state: ConnState,
        connect_addr: Option<SockaddrStorage>,
        deadline: Option<Instant>,
        iomsg_size: usize,
    ) -> Self {
        let mut hello_out = [0u8; HELLO_SIZE];
        encode_hello(&mut hello_out, id.0);
        let peer_name = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<connecting>".to_string());
        let log_prefix = format!("[conn {} {}]", id, peer_name);
        Self {
            id,
            remote_id: 0,
            stream,
            state,
            status: Status::Ok,
            server_side,
            deadline,
            connect_addr,
            iomsg_size,
            peer_name,
            log_prefix,
            hello_out,
            hello_sent: 0,
            hello_in: [0u8; HELLO_SIZE],
            hello_got: 0,
            sends: VecDeque::new(),
            recvs: VecDeque::new(),
            unexpected: VecDeque::new(),
            hdr_buf: [0u8; FRAME_HDR_SIZE],
            hdr_got: 0,
            cur: None,
        }
    }

    /// Connection id.
    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Latched connection status: `Ok` while healthy, the first failure
    /// code afterwards.
    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Whether the handshake has completed.
    #[inline]
    pub fn is_established(&self) -> bool {
        self.state == ConnState::Established
    }

    /// Whether a disconnect is in progress. Once true, never false
    /// again; every subsequent post fails synchronously.
    #[inline]
    pub fn is_disconnecting(&self) -> bool {
        self.state == ConnState::Disconnecting
    }

    /// Peer address string.
    #[inline]
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Prefix identifying this connection in log lines.
    #[inline]
    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    // ---- posting -------------------------------------------------------

    /// Queue one outgoing frame. On a connection that is not established
    /// and healthy, the token completes immediately with the latched
    /// status and `false` is returned.
    pub(crate) fn post_send(
        &mut self,
        kind: SendKind,
        region: IoRegion,
        sn: u32,
        token: U,
        sh: &mut Shared<U>,
    ) -> bool {
        if self.state != ConnState::Established {
            let st = if self.status.is_ok() {
                Status::NotConnected
            } else {
                self.status
            };
            sh.complete(token, st);
            return false;
        }
        let tag = match kind {
            SendKind::Control => wire::make_iomsg_tag(self.remote_id, sn),
            SendKind::Data => wire::make_data_tag(self.remote_id, sn),
        };
        let mut header = [0u8; FRAME_HDR_SIZE];
        encode_frame_hdr(&mut header, tag, region.len() as u64);
        sh.region_add(region.len());
        self.sends.push_back(PendingSend {
            header,
            header_sent: 0,
            body: region,
            body_sent: 0,
            token,
        });
        true
    }

    /// Post one receive for a data frame tagged with this connection's
    /// own id and `sn`. If a matching frame already sits in the
    /// unexpected queue it is consumed immediately.
    pub(crate) fn post_recv(
        &mut self,
        region: IoRegion,
        sn: u32,
        token: U,
        sh: &mut Shared<U>,
    ) -> bool {
        if self.state != ConnState::Established {
            let st = if self.status.is_ok() {
                Status::NotConnected
            } else {
                self.status
            };
            sh.complete(token, st);
            return false;
        }
        let tag = wire::make_data_tag(self.id.0, sn);
        if let Some(pos) = self.unexpected.iter().position(|f| f.tag == tag) {
            let frame = self.unexpected.remove(pos).unwrap();
            if frame.data.len() > region.len() {
                sh.complete(token, Status::ProtocolError);
                sh.put_buf(frame.data);
                self.fail(Status::ProtocolError, sh);
                return false;
            }
            // Safety: the poster hands us exclusive access until the
            // operation completes, which is right now.
            unsafe {
                region.as_mut_slice()[..frame.data.len()].copy_from_slice(&frame.data);
            }
            sh.put_buf(frame.data);
            sh.complete(token, Status::Ok);
            return true;
        }
        sh.region_add(region.len());
        self.recvs.push_back(PostedRecv { tag, region, token });
        true
    }

    // ---- progress ------------------------------------------------------

    pub(crate) fn pump(&mut self, now: Instant, sh: &mut Shared<U>) {
        match self.state {
            ConnState::Connecting => self.pump_connect(now, sh),
            ConnState::Handshake => self.pump_handshake(now, sh),
            ConnState::Established => {
                self.pump_send(sh);
                if self.state == ConnState::Established {
                    self.pump_recv(sh);
                }
            }
            ConnState::Failed | ConnState::Disconnecting => {}
        }
    }

    fn pump_connect(&mut self, now: Instant, sh: &mut Shared<U>) {
        use nix::errno::Errno;
        use std::os::fd::AsRawFd;

        let addr = match &self.connect_addr {
            Some(a) => a.clone(),
            None => return,
        };
        match nix::sys::socket::connect(self.stream.as_raw_fd(), &addr) {
            Ok(()) => {
                self.connect_addr = None;
                self.state = ConnState::Handshake;
            }
            Err(Errno::EISCONN) => {
                self.connect_addr = None;
                self.state = ConnState::Handshake;
            }
            Err(Errno::EINPROGRESS) | Err(Errno::EALREADY) | Err(Errno::EAGAIN)
            | Err(Errno::EINTR) => {
                if self.deadline_elapsed(now) {
                    self.fail(Status::TimedOut, sh);
                }
            }
            Err(_) => self.fail(Status::ConnectionReset, sh),
        }
    }

    fn pump_handshake(&mut self, now: Instant, sh: &mut Shared<U>) {
        while self.hello_sent < HELLO_SIZE {
            match write_step(&mut self.stream, &self.hello_out[self.hello_sent..]) {
                IoStep::Progress(n) => self.hello_sent += n,
                IoStep::Blocked => break,
                IoStep::Failed(st) => {
                    self.fail(st, sh);
                    return;
                }
            }
        }
        while self.hello_got < HELLO_SIZE {
            match read_step(&mut self.stream, &mut self.hello_in[self.hello_got..]) {
                IoStep::Progress(n) => self.hello_got += n,
                IoStep::Blocked => break,
                IoStep::Failed(st) => {
                    self.fail(st, sh);
                    return;
                }
            }
        }
        if self.hello_sent == HELLO_SIZE && self.hello_got == HELLO_SIZE {
            match decode_hello(&self.hello_in) {
                Some(remote_id) => self.establish(remote_id, sh),
                None => self.fail(Status::ProtocolError, sh),
            }
        } else if self.deadline_elapsed(now) {
            self.fail(Status::TimedOut, sh);
        }
    }

    fn deadline_elapsed(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if now >= d)
    }

    fn establish(&mut self, remote_id: u32, sh: &mut Shared<U>) {
        self.remote_id = remote_id;
        self.state = ConnState::Established;
        self.deadline = None;
        if let Ok(addr) = self.stream.peer_addr() {
            self.peer_name = addr.to_string();
            self.log_prefix = format!("[conn {} {}]", self.id, self.peer_name);
        }
        tracing::debug!("{} established, remote id {}", self.log_prefix, remote_id);
        if self.server_side {
            sh.push(Event::Accepted { conn: self.id });
        } else {
            sh.push(Event::ConnectResult {
                conn: self.id,
                status: Status::Ok,
            });
        }
    }

    fn pump_send(&mut self, sh: &mut Shared<U>) {
        loop {
            let front = match self.sends.front_mut() {
                Some(f) => f,
                None => return,
            };
            match flush_send(&mut self.stream, front) {
                FlushResult::Done => {
                    let done = self.sends.pop_front().unwrap();
                    sh.region_sub(done.body.len());
                    sh.complete(done.token, Status::Ok);
                }
                FlushResult::Blocked => return,
                FlushResult::Failed(st) => {
                    self.fail(st, sh);
                    return;
                }
            }
        }
    }

    fn pump_recv(&mut self, sh: &mut Shared<U>) {
        loop {
            if self.state != ConnState::Established {
                return;
            }
            if self.cur.is_some() {
                match self.read_cur(sh) {
                    Pump::Continue => continue,
                    Pump::Blocked => return,
                    Pump::Failed(st) => {
                        self.fail(st, sh);
                        return;
                    }
                }
            }
            let got = self.hdr_got;
            match read_step(&mut self.stream, &mut self.hdr_buf[got..]) {
                IoStep::Progress(n) => {
                    self.hdr_got += n;
                    if self.hdr_got == FRAME_HDR_SIZE {
                        self.hdr_got = 0;
                        if let Err(st) = self.begin_frame(sh) {
                            self.fail(st, sh);
                            return;
                        }
                    }
                }
                IoStep::Blocked => return,
                IoStep::Failed(st) => {
                    self.fail(st, sh);
                    return;
                }
            }
        }
    }

    /// Classify a freshly decoded frame header and set up the payload
    /// read: control frames and unmatched data stage into owned buffers,
    /// matched data reads straight into its posted region.
    fn begin_frame(&mut self, sh: &mut Shared<U>) -> Result<(), Status> {
        let (tag, len) = decode_frame_hdr(&self.hdr_buf);
        let len = len as usize;
        if is_iomsg_tag(tag) {
            if len > self.iomsg_size {
                return Err(Status::ProtocolError);
            }
            let data = sh.take_buf(len);
            self.cur = Some(InboundFrame::Staged {
                tag,
                data,
                got: 0,
                control: true,
            });
            return Ok(());
        }
        match self.recvs.iter().position(|r| r.tag == tag) {
            Some(pos) => {
                let recv = self.recvs.remove(pos).unwrap();
                sh.region_sub(recv.region.len());
                if len > recv.region.len() {
                    sh.complete(recv.token, Status::ProtocolError);
                    return Err(Status::ProtocolError);
                }
                self.cur = Some(InboundFrame::Posted { recv, got: 0, len });
            }
            None => {
                let data = sh.take_buf(len);
                sh.evict();
                self.cur = Some(InboundFrame::Staged {
                    tag,
                    data,
                    got: 0,
                    control: false,
                });
            }
        }
        Ok(())
    }

    fn read_cur(&mut self, sh: &mut Shared<U>) -> Pump {
        enum Done {
            Not,
            Finished,
        }
        let done;
        match self.cur.as_mut().unwrap() {
            InboundFrame::Posted { recv, got, len } => {
                if *got < *len {
                    // Safety: the poster keeps the region alive and
                    // untouched until this operation completes.
                    let buf = unsafe { recv.region.as_mut_slice() };
                    match read_step(&mut self.stream, &mut buf[*got..*len]) {
                        IoStep::Progress(n) => *got += n,
                        IoStep::Blocked => return Pump::Blocked,
                        IoStep::Failed(st) => return Pump::Failed(st),
                    }
                }
                done = if *got == *len { Done::Finished } else { Done::Not };
            }
            InboundFrame::Staged { data, got, .. } => {
                if *got < data.len() {
                    let at = *got;
                    match read_step(&mut self.stream, &mut data[at..]) {
                        IoStep::Progress(n) => *got += n,
                        IoStep::Blocked => return Pump::Blocked,
                        IoStep::Failed(st) => return Pump::Failed(st),
                    }
                }
                done = if *got == data.len() {
                    Done::Finished
                } else {
                    Done::Not
                };
            }
        }
        if let Done::Finished = done {
            match self.cur.take().unwrap() {
                InboundFrame::Posted { recv, .. } => {
                    sh.complete(recv.token, Status::Ok);
                }
                InboundFrame::Staged {
                    tag,
                    data,
                    control,
                    ..
                } => {
                    if control {
                        sh.push(Event::Control {
                            conn: self.id,
                            data,
                        });
                    } else if let Some(pos) = self.recvs.iter().position(|r| r.tag == tag) {
                        // The receive was posted while this frame was
                        // still streaming in; deliver it now so the
                        // frame cannot strand in the unexpected queue.
                        let recv = self.recvs.remove(pos).unwrap();
                        sh.region_sub(recv.region.len());
                        if data.len() > recv.region.len() {
                            sh.complete(recv.token, Status::ProtocolError);
                            sh.put_buf(data);
                            return Pump::Failed(Status::ProtocolError);
                        }
                        // Safety: the poster hands us exclusive access
                        // until the operation completes.
                        unsafe {
                            recv.region.as_mut_slice()[..data.len()].copy_from_slice(&data);
                        }
                        sh.put_buf(data);
                        sh.complete(recv.token, Status::Ok);
                    } else {
                        self.unexpected.push_back(StagedFrame { tag, data });
                    }
                }
            }
        }
        Pump::Continue
    }

    // ---- teardown ------------------------------------------------------

    /// Latch a failure: record the first status, complete every
    /// outstanding operation with it, notify the owner.
    pub(crate) fn fail(&mut self, status: Status, sh: &mut Shared<U>) {
        if matches!(self.state, ConnState::Failed | ConnState::Disconnecting) {
            return;
        }
        let was = std::mem::replace(&mut self.state, ConnState::Failed);
        self.status = status;
        self.cancel_outstanding(status, sh);
        let _ = self.stream.shutdown(Shutdown::Both);
        match was {
            ConnState::Established => sh.push(Event::ConnError {
                conn: self.id,
                status,
            }),
            ConnState::Connecting | ConnState::Handshake => {
                if self.server_side {
                    // Never surfaced to the owner; reap silently.
                    sh.defunct(self.id);
                } else {
                    sh.push(Event::ConnectResult {
                        conn: self.id,
                        status,
                    });
                }
            }
            ConnState::Failed | ConnState::Disconnecting => unreachable!(),
        }
    }

    /// Begin teardown. Returns `false` when a disconnect is already in
    /// progress.
    pub(crate) fn begin_disconnect(&mut self, sh: &mut Shared<U>) -> bool {
        if self.state == ConnState::Disconnecting {
            return false;
        }
        if self.status.is_ok() {
            self.status = Status::Canceled;
        }
        self.cancel_outstanding(Status::Canceled, sh);
        self.state = ConnState::Disconnecting;
        let _ = self.stream.shutdown(Shutdown::Both);
        true
    }

    fn cancel_outstanding(&mut self, status: Status, sh: &mut Shared<U>) {
        while let Some(s) = self.sends.pop_front() {
            sh.region_sub(s.body.len());
            sh.complete(s.token, status);
        }
        while let Some(r) = self.recvs.pop_front() {
            sh.region_sub(r.region.len());
            sh.complete(r.token, status);
        }
        if let Some(cur) = self.cur.take() {
            match cur {
                InboundFrame::Posted { recv, .. } => sh.complete(recv.token, status),
                InboundFrame::Staged { data, .. } => sh.put_buf(data),
            }
        }
        while let Some(f) = self.unexpected.pop_front() {
            sh.put_buf(f.data);
        }
    }
}
