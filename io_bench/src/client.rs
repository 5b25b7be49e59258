//! Client engine: connect/retry lifecycle, round-robin scheduling over
//! the active ring, admission control, completion accounting, timeout
//! supervision and throughput reporting.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Instant;

use tagio::{ConnId, Context, Event, Status};

use crate::common::{
    self, IoCtx, IoPools, Token, XferAction, XferHandle, BUSY_PROGRESS_COUNT, MBYTE,
};
use crate::opts::{Opts, TIME_INF};
use crate::proto::{self, IoOp, IO_OP_COUNT};
use crate::random::Random;
use crate::ring::ActiveRing;
use crate::status::{RunStatus, StatusLatch};

/// Client-side state per configured target.
#[derive(Debug, Default)]
struct ServerInfo {
    conn: Option<ConnId>,
    /// Connect retry counter; survives counter resets.
    retry_count: u64,
    /// Timestamp of the last connect attempt.
    prev_connect_time: Option<Instant>,
    num_sent: [u64; IO_OP_COUNT],
    num_completed: [u64; IO_OP_COUNT],
    bytes_sent: [u64; IO_OP_COUNT],
    bytes_completed: [u64; IO_OP_COUNT],
    /// Lifetime completions, never reset by reports.
    total_completed: u64,
}

impl ServerInfo {
    /// Clear connection state and interval counters; retry state stays.
    fn reset(&mut self) {
        self.conn = None;
        self.num_sent = [0; IO_OP_COUNT];
        self.num_completed = [0; IO_OP_COUNT];
        self.bytes_sent = [0; IO_OP_COUNT];
        self.bytes_completed = [0; IO_OP_COUNT];
    }

    fn uncompleted(&self, op: IoOp) -> u64 {
        let i = op.index();
        debug_assert!(self.num_completed[i] <= self.num_sent[i]);
        self.num_sent[i] - self.num_completed[i]
    }

    fn uncompleted_total(&self) -> u64 {
        self.uncompleted(IoOp::Read) + self.uncompleted(IoOp::Write)
    }
}

struct OpPerf {
    min: u64,
    max: u64,
    min_index: Option<usize>,
    total: u64,
    total_bytes: u64,
}

pub struct Client {
    opts: Opts,
    ctx: IoCtx,
    pools: IoPools,
    latch: StatusLatch,
    rng: Random,
    server_info: Vec<ServerInfo>,
    /// Targets with a connection attempt in flight.
    connecting: HashSet<usize>,
    ring: ActiveRing,
    /// Established connections only; drives connected-server counts.
    lookup: HashMap<ConnId, usize>,
    /// Every client-created connection, including ones still
    /// connecting; resolves events back to a target index.
    owner: HashMap<ConnId, usize>,
    num_sent: u64,
    num_completed: u64,
    start_time: Instant,
}

impl Client {
    pub fn new(mut opts: Opts, latch: StatusLatch) -> Self {
        let mut rng = Random::new(opts.random_seed);
        tracing::info!("random seed: {}", opts.random_seed);

        // Randomize the target order so parallel clients stagger their
        // connection storms naturally.
        rng.shuffle(&mut opts.servers);
        tracing::debug!("list of servers: {}", opts.servers.join(" "));

        let num_servers = opts.servers.len();
        let ctx = Context::new(opts.transport_config());
        let pools = IoPools::new(&opts);
        Self {
            opts,
            ctx,
            pools,
            latch,
            rng,
            server_info: (0..num_servers).map(|_| ServerInfo::default()).collect(),
            connecting: HashSet::new(),
            ring: ActiveRing::new(num_servers),
            lookup: HashMap::new(),
            owner: HashMap::new(),
            num_sent: 0,
            num_completed: 0,
            start_time: Instant::now(),
        }
    }

    /// Total operations committed, across all targets.
    pub fn total_sent(&self) -> u64 {
        self.num_sent
    }

    /// Total operations completed, across all targets.
    pub fn total_completed(&self) -> u64 {
        self.num_completed
    }

    /// Lifetime per-target completion counts, in shuffled target order.
    pub fn per_server_completed(&self) -> Vec<u64> {
        self.server_info.iter().map(|s| s.total_completed).collect()
    }

    // ---- event pump ----------------------------------------------------

    fn progress(&mut self) {
        self.ctx.progress();
        while let Some(event) = self.ctx.poll_event() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: Event<Token>) {
        match event {
            Event::ConnectResult { conn, status } => {
                let index = *self.owner.get(&conn).expect("connect result for unknown conn");
                self.connecting.remove(&index);
                if status.is_ok() {
                    self.connect_succeed(index);
                } else {
                    self.connect_failed(index, status);
                }
            }
            Event::ConnError { conn, status } => {
                if let Some(&index) = self.owner.get(&conn) {
                    self.disconnect_server(index, &status.to_string());
                }
            }
            Event::Closed { conn } => self.handle_closed(conn),
            Event::Control { conn, data } => self.dispatch_io_message(conn, data),
            Event::OpComplete { token, status } => match token {
                Token::MsgSent(msg) => self.pools.io_msg.put(msg),
                Token::Xfer(handle) => {
                    if let Some(action) = handle.complete() {
                        self.finish_xfer(action, status);
                    }
                }
            },
            // The client never listens.
            Event::Accepted { .. } => unreachable!(),
        }
    }

    /// Teardown finished: operations that never completed are
    /// subtracted from the global sent counter, the lookup entry goes
    /// away, and the per-target state resets for the next attempt.
    fn handle_closed(&mut self, conn: ConnId) {
        let index = self.owner.remove(&conn).expect("close of unknown conn");
        assert!(!self.ring.contains(index));

        let info = &mut self.server_info[index];
        let uncompleted = info.uncompleted_total();
        debug_assert!(self.num_sent - self.num_completed >= uncompleted);
        self.num_sent -= uncompleted;

        self.lookup.remove(&conn);
        info.reset();
    }

    fn dispatch_io_message(&mut self, conn: ConnId, data: Vec<u8>) {
        let msg = match proto::decode_header(&data) {
            Some(msg) => msg,
            None => panic!("invalid opcode in io message"),
        };
        tracing::debug!(
            "got io message {} sn {} data size {} conn {}",
            msg.op.name(),
            msg.sn,
            msg.data_size,
            conn
        );

        if msg.op.is_completion() {
            assert_eq!(msg.op, IoOp::WriteComp);
            match self.lookup.get(&conn) {
                Some(&index) => {
                    self.handle_operation_completion(index, IoOp::Write, msg.data_size)
                }
                // The per-target state was already reset and its sends
                // subtracted; touching counters here would double-count.
                None => tracing::info!("got WRITE completion on failed connection"),
            }
        }
        self.ctx.recycle_buf(data);
    }

    fn finish_xfer(&mut self, action: XferAction, status: Status) {
        match action {
            XferAction::ClientRead {
                server_index,
                sn,
                iov,
                resp,
            } => {
                self.handle_operation_completion(server_index, IoOp::Read, iov.data_size());
                if self.opts.validate && status.is_ok() {
                    proto::validate_msg_sn(resp.as_slice(), sn);
                    if let Some(pos) = iov.validate(sn) {
                        panic!("iov data corruption at {} position", pos);
                    }
                }
                self.pools.release_iov(iov);
                self.pools.io_msg.put(resp);
            }
            XferAction::ClientWriteSent { iov } => {
                // Accounting happens when the WRITE completion arrives.
                self.pools.release_iov(iov);
            }
            XferAction::ServerReadSent { .. } | XferAction::ServerWriteRecv { .. } => {
                unreachable!()
            }
        }
    }

    // ---- admission control ---------------------------------------------

    fn check_counters(&self, index: usize, op: IoOp) {
        let info = &self.server_info[index];
        let i = op.index();
        debug_assert!(
            info.num_completed[i] <= info.num_sent[i],
            "op={} num_completed={} num_sent={}",
            op.name(),
            info.num_completed[i],
            info.num_sent[i]
        );
        debug_assert!(self.num_completed <= self.num_sent);
    }

    fn commit_operation(&mut self, index: usize, op: IoOp, data_size: u64) {
        let conn_window_size = self.opts.conn_window_size;
        {
            let info = &mut self.server_info[index];
            debug_assert!(
                info.uncompleted_total() < conn_window_size,
                "num_uncompleted={} conn_window_size={}",
                info.uncompleted_total(),
                conn_window_size
            );

            let i = op.index();
            info.num_sent[i] += 1;
            debug_assert!(info.bytes_completed[i] <= info.bytes_sent[i]);
            info.bytes_sent[i] += data_size;
        }
        self.num_sent += 1;

        if self.server_info[index].uncompleted_total() == conn_window_size {
            self.ring.remove(index);
        }
        self.check_counters(index, op);
    }

    fn handle_operation_completion(&mut self, index: usize, op: IoOp, data_size: u64) {
        debug_assert!(index < self.server_info.len());
        let conn_window_size = self.opts.conn_window_size;
        debug_assert!(self.server_info[index].uncompleted_total() <= conn_window_size);
        self.check_counters(index, op);

        // The window is about to reopen; readmit before counting.
        let disconnecting = self.conn_is_disconnecting(index);
        if self.server_info[index].uncompleted_total() == conn_window_size && !disconnecting {
            self.ring.add(index, &mut self.rng);
        }

        let info = &mut self.server_info[index];
        let i = op.index();
        info.bytes_completed[i] += data_size;
        info.num_completed[i] += 1;
        info.total_completed += 1;
        self.num_completed += 1;

        let info = &self.server_info[index];
        if info.uncompleted(op) == 0 {
            debug_assert_eq!(info.bytes_completed[i], info.bytes_sent[i]);
        } else {
            debug_assert!(info.bytes_completed[i] <= info.bytes_sent[i]);
        }
    }

    fn conn_is_disconnecting(&self, index: usize) -> bool {
        match self.server_info[index].conn {
            Some(conn) => self
                .ctx
                .conn(conn)
                .map(|c| c.is_disconnecting())
                .unwrap_or(true),
            None => true,
        }
    }

    // ---- issue paths ---------------------------------------------------

    fn get_data_size(&mut self) -> u64 {
        self.rng
            .rand_range(self.opts.min_data_size, self.opts.max_data_size)
    }

    fn get_op(&mut self) -> IoOp {
        if self.opts.operations.len() == 1 {
            self.opts.operations[0]
        } else {
            let i = self.rng.urand(self.opts.operations.len());
            self.opts.operations[i]
        }
    }

    fn do_io_read(&mut self, index: usize, sn: u32) -> u64 {
        let conn = self.server_info[index].conn.expect("read on unconnected server");
        let data_size = self.get_data_size();
        let validate = self.opts.validate;

        if !common::send_io_message(
            &mut self.ctx,
            &mut self.pools,
            conn,
            IoOp::Read,
            sn,
            data_size,
            validate,
        ) {
            return 0;
        }

        // Receive buffers only; contents are validated on completion.
        let iov = self.pools.acquire_iov(data_size, sn, false);
        let resp = self.pools.io_msg.get();

        self.commit_operation(index, IoOp::Read, data_size);

        // All chunks plus the completion message, which arrives as data
        // tagged with the same sn.
        let handle = XferHandle::new(iov.size() as u32 + 1);
        common::recv_data_iov(&mut self.ctx, conn, &iov, sn, &handle);
        // Safety: the response buffer lives inside the handle's action
        // until the final completion; boxed storage does not move.
        let resp_region = unsafe { resp.region() };
        self.ctx
            .recv_data(conn, resp_region, sn, Token::Xfer(handle.clone()));
        handle.set_action(XferAction::ClientRead {
            server_index: index,
            sn,
            iov,
            resp,
        });

        data_size
    }

    fn do_io_write(&mut self, index: usize, sn: u32) -> u64 {
        let conn = self.server_info[index].conn.expect("write on unconnected server");
        let data_size = self.get_data_size();
        let validate = self.opts.validate;

        if !common::send_io_message(
            &mut self.ctx,
            &mut self.pools,
            conn,
            IoOp::Write,
            sn,
            data_size,
            validate,
        ) {
            return 0;
        }

        let iov = self.pools.acquire_iov(data_size, sn, validate);

        self.commit_operation(index, IoOp::Write, data_size);

        tracing::debug!("sending data size {} sn {}", data_size, sn);
        let handle = XferHandle::new(iov.size() as u32);
        common::send_data_iov(&mut self.ctx, conn, &iov, sn, &handle);
        handle.set_action(XferAction::ClientWriteSent { iov });

        data_size
    }

    // ---- connection lifecycle ------------------------------------------

    fn resolve(&self, index: usize) -> SocketAddr {
        let server = &self.opts.servers[index];
        let (host, port) = match server.rsplit_once(':') {
            Some((host, port_str)) => match port_str.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (server.clone(), self.opts.port),
            },
            None => (server.clone(), self.opts.port),
        };
        match (host.as_str(), port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().expect("empty address resolution"),
            Err(_) => panic!("invalid address {}", server),
        }
    }

    fn server_name(&self, index: usize) -> String {
        format!("server [{}] {}", index, self.opts.servers[index])
    }

    fn connect(&mut self, index: usize) {
        let addr = self.resolve(index);
        if !self.connecting.insert(index) {
            panic!("{} is already connecting", self.server_name(index));
        }
        let conn = self
            .ctx
            .connect(addr)
            .unwrap_or_else(|e| panic!("failed to create connection: {}", e));
        self.server_info[index].conn = Some(conn);
        self.owner.insert(conn, index);
    }

    fn connect_all(&mut self, force: bool) {
        if self.lookup.len() == self.server_info.len() {
            // All servers are connected.
            return;
        }
        if !force && !self.lookup.is_empty() {
            // Retry scanning is gated to control iterations while some
            // servers are alive.
            return;
        }

        let now = Instant::now();
        for index in 0..self.server_info.len() {
            if self.server_info[index].conn.is_some() {
                // Already connecting or connected.
                continue;
            }
            debug_assert!(self.server_info[index].retry_count < self.opts.retries);

            if let Some(prev) = self.server_info[index].prev_connect_time {
                if now < prev + self.opts.retry_interval {
                    continue;
                }
            }

            self.connect(index);
            self.server_info[index].prev_connect_time = Some(now);
        }
    }

    fn connect_succeed(&mut self, index: usize) {
        let attempts = self.server_info[index].retry_count + 1;
        {
            let info = &mut self.server_info[index];
            info.retry_count = 0;
            info.prev_connect_time = None;
        }
        let conn = self.server_info[index].conn.unwrap();
        self.lookup.insert(conn, index);
        self.ring.add(index, &mut self.rng);
        tracing::info!(
            "Connected to {} after {} attempts",
            self.server_name(index),
            attempts
        );
    }

    fn connect_failed(&mut self, index: usize, status: Status) {
        self.server_info[index].retry_count += 1;
        let retry_count = self.server_info[index].retry_count;

        if retry_count >= self.opts.retries {
            // One server out of budget ends the whole run.
            self.latch.set(RunStatus::ConnRetriesExceeded);
        }

        if self.opts.retries == u64::MAX {
            tracing::info!(
                "Connect to {} failed (retry {})",
                self.server_name(index),
                retry_count
            );
        } else {
            tracing::info!(
                "Connect to {} failed (retry {}/{})",
                self.server_name(index),
                retry_count,
                self.opts.retries
            );
        }

        self.disconnect_server(index, &status.to_string());
    }

    fn dump_server_info(&self, index: usize) -> String {
        let info = &self.server_info[index];
        let prefix = info
            .conn
            .and_then(|c| self.ctx.conn(c))
            .map(|c| c.log_prefix().to_string())
            .unwrap_or_else(|| self.server_name(index));
        let disconnecting = if self.conn_is_disconnecting(index) {
            " (disconnecting)"
        } else {
            ""
        };
        format!(
            "{} read {}/{} write {}/{}{}",
            prefix,
            info.num_completed[IoOp::Read.index()],
            info.num_sent[IoOp::Read.index()],
            info.num_completed[IoOp::Write.index()],
            info.num_sent[IoOp::Write.index()],
            disconnecting
        )
    }

    fn disconnect_server(&mut self, index: usize, reason: &str) {
        let conn = self.server_info[index]
            .conn
            .expect("disconnect of unconnected server");
        let disconnecting = self
            .ctx
            .conn(conn)
            .map(|c| c.is_disconnecting())
            .unwrap_or(true);

        if disconnecting {
            tracing::info!(
                "not disconnecting {} due to \"{}\" because disconnection is already in progress",
                self.dump_server_info(index),
                reason
            );
        } else {
            tracing::info!(
                "disconnecting {} due to \"{}\"",
                self.dump_server_info(index),
                reason
            );
            if self.ring.contains(index) {
                self.ring.remove(index);
            }
            // Teardown completes the connection's outstanding
            // operations before Closed fires.
            self.ctx.disconnect(conn);
        }

        assert!(!self.ring.contains(index));
    }

    fn disconnect_uncompleted_servers(&mut self, reason: &str) {
        let mut indexes: Vec<usize> = self
            .lookup
            .values()
            .copied()
            .filter(|&i| self.server_info[i].uncompleted_total() > 0)
            .collect();
        while let Some(index) = indexes.pop() {
            self.disconnect_server(index, reason);
        }
    }

    fn dump_timeout_waiting_for_replies_info(&self) {
        tracing::info!(
            "timeout waiting for {} replies on the following connections:",
            self.num_sent - self.num_completed
        );
        let mut total = 0;
        for &index in self.lookup.values() {
            if self.server_info[index].uncompleted_total() == 0 {
                continue;
            }
            tracing::info!("{}", self.dump_server_info(index));
            total += 1;
        }
        tracing::info!("total: {}", total);
    }

    // ---- waiting and supervision ---------------------------------------

    fn wait_for_responses(&mut self, max_outstanding: u64) {
        let mut timer_started = false;
        let mut timer_finished = false;
        let mut start_time = Instant::now();
        let mut count = 0usize;

        while (self.num_sent - self.num_completed) > max_outstanding && self.latch.is_ok() {
            if count < BUSY_PROGRESS_COUNT || timer_finished {
                count += 1;
                self.progress();
                continue;
            }

            count = 0;
            let curr_time = Instant::now();

            if !timer_started {
                start_time = curr_time;
                timer_started = true;
                continue;
            }

            if curr_time.duration_since(start_time) > self.opts.client_timeout {
                self.dump_timeout_waiting_for_replies_info();
                if !self.opts.debug_timeout {
                    // With debug mode on, leave the connections alive so
                    // they can be inspected.
                    self.disconnect_uncompleted_servers("timeout for replies");
                }
                timer_finished = true;
            }
            self.check_time_limit();
        }
    }

    fn check_time_limit(&mut self) {
        if self.latch.is_ok()
            && self.opts.client_runtime_limit != TIME_INF
            && self.start_time.elapsed() >= self.opts.client_runtime_limit
        {
            self.latch.set(RunStatus::RuntimeExceeded);
        }
    }

    // ---- scheduling ----------------------------------------------------

    fn pick_server_index(&mut self) -> usize {
        let index = self.ring.pick();
        debug_assert!(self.server_info[index].uncompleted_total() < self.opts.conn_window_size);
        debug_assert!(self.server_info[index]
            .conn
            .and_then(|c| self.ctx.conn(c))
            .map(|c| c.status().is_ok())
            .unwrap_or(false));
        index
    }

    #[inline]
    fn is_control_iter(iter: u64) -> bool {
        iter % 10 == 0
    }

    // ---- reporting -----------------------------------------------------

    fn report_performance(&mut self, num_iters: u64, elapsed: f64) {
        if num_iters == 0 {
            return;
        }

        let latency_usec = elapsed / num_iters as f64 * 1e6;
        // One slot per request op plus an overall row.
        let mut perf: Vec<OpPerf> = (0..=IO_OP_COUNT)
            .map(|_| OpPerf {
                min: u64::MAX,
                max: 0,
                min_index: None,
                total: 0,
                total_bytes: 0,
            })
            .collect();

        for index in 0..self.server_info.len() {
            let mut total_completed = 0u64;
            let mut total_bytes_completed = 0u64;
            for op in 0..=IO_OP_COUNT {
                let (num_completed, bytes_completed) = if op != IO_OP_COUNT {
                    let info = &self.server_info[index];
                    debug_assert_eq!(info.bytes_sent[op], info.bytes_completed[op]);
                    let completed = info.num_completed[op];

                    // Tie-break the minimum towards flakier targets.
                    let beats_min = match perf[op].min_index {
                        None => true,
                        Some(min_index) => {
                            completed < perf[op].min
                                || (completed == perf[op].min
                                    && self.server_info[index].retry_count
                                        > self.server_info[min_index].retry_count)
                        }
                    };
                    if beats_min {
                        perf[op].min_index = Some(index);
                    }

                    let bytes = self.server_info[index].bytes_completed[op];
                    total_completed += completed;
                    total_bytes_completed += bytes;

                    let info = &mut self.server_info[index];
                    info.num_sent[op] = 0;
                    info.num_completed[op] = 0;
                    info.bytes_sent[op] = 0;
                    info.bytes_completed[op] = 0;
                    (completed, bytes)
                } else {
                    (total_completed, total_bytes_completed)
                };

                perf[op].min = perf[op].min.min(num_completed);
                perf[op].max = perf[op].max.max(num_completed);
                perf[op].total += num_completed;
                perf[op].total_bytes += bytes_completed;
            }
        }

        let mut line = format!(
            "total min:{} max:{} total:{}",
            perf[IO_OP_COUNT].min, perf[IO_OP_COUNT].max, perf[IO_OP_COUNT].total
        );
        for op in [IoOp::Read, IoOp::Write] {
            let p = &perf[op.index()];
            let throughput_mbs = p.total_bytes as f64 / elapsed / MBYTE;
            let min_name = p
                .min_index
                .map(|i| self.opts.servers[i].clone())
                .unwrap_or_default();
            line.push_str(&format!(
                " | {} {:.2} MBs min:{}({}) max:{} total:{}",
                op.name(),
                throughput_mbs,
                p.min,
                min_name,
                p.max,
                p.total
            ));
        }
        line.push_str(&format!(
            " | active:{}/{}",
            self.lookup.len(),
            self.ctx.num_connections()
        ));
        if self.opts.window_size == 1 {
            line.push_str(&format!(" latency:{:.3}usec", latency_usec));
        }
        line.push_str(&format!(" buffers:{}", self.pools.iovs.allocated()));
        tracing::info!("{}", line);
    }

    // ---- run loop ------------------------------------------------------

    fn destroy_servers(&mut self) {
        for index in 0..self.server_info.len() {
            if self.server_info[index].conn.is_none() {
                continue;
            }
            self.disconnect_server(index, "end of the client run");
        }

        if !self.lookup.is_empty() {
            tracing::info!(
                "waiting for {} disconnects to complete",
                self.lookup.len()
            );
            while !self.lookup.is_empty() {
                self.progress();
            }
        }
        while self.ctx.num_connections() > 0 {
            self.progress();
        }
    }

    pub fn run(&mut self) -> RunStatus {
        let mut sn = self.rng.rand_u32();
        let mut prev_time = Instant::now();
        let mut total_iter: u64 = 0;
        let mut total_prev_iter: u64 = 0;

        while total_iter < self.opts.iter_count && self.latch.is_ok() {
            self.connect_all(Self::is_control_iter(total_iter));
            if !self.latch.is_ok() {
                break;
            }

            if self.lookup.is_empty() {
                if self.connecting.is_empty() {
                    tracing::info!(
                        "All remote servers are down, reconnecting in {:.1} seconds",
                        self.opts.retry_interval.as_secs_f64()
                    );
                    std::thread::sleep(self.opts.retry_interval);
                    self.check_time_limit();
                } else {
                    self.progress();
                }
                continue;
            }

            tracing::debug!(" <<<< iteration {} >>>>", total_iter);
            let conns_window_size = self.opts.conn_window_size * self.lookup.len() as u64;
            let max_outstanding = self.opts.window_size.min(conns_window_size) - 1;

            self.progress();
            self.wait_for_responses(max_outstanding);
            if !self.latch.is_ok() {
                break;
            }

            if self.ring.is_empty() {
                // Connections may have dropped out while waiting for
                // responses; pick again next iteration.
                continue;
            }

            let index = self.pick_server_index();
            match self.get_op() {
                IoOp::Read => self.do_io_read(index, sn),
                IoOp::Write => self.do_io_write(index, sn),
                _ => unreachable!(),
            };

            total_iter += 1;
            sn = sn.wrapping_add(1);

            if Self::is_control_iter(total_iter)
                && (total_iter - total_prev_iter) >= self.lookup.len() as u64
            {
                let curr_time = Instant::now();
                if curr_time.duration_since(prev_time) >= self.opts.print_interval {
                    self.wait_for_responses(0);
                    if !self.latch.is_ok() {
                        break;
                    }

                    self.report_performance(
                        total_iter - total_prev_iter,
                        curr_time.duration_since(prev_time).as_secs_f64(),
                    );
                    total_prev_iter = total_iter;
                    prev_time = curr_time;

                    self.check_time_limit();
                }
            }
        }

        self.wait_for_responses(0);
        if self.latch.is_ok() {
            let now = Instant::now();
            self.report_performance(
                total_iter - total_prev_iter,
                now.duration_since(prev_time).as_secs_f64(),
            );
        }

        self.destroy_servers();

        self.latch.get()
    }
}
