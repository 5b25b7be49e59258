//! Server engine: accepts connections and mirrors client transactions.
//!
//! A READ request is answered with the payload chunks plus a READ
//! completion sent as data (so the client matches it by sequence
//! number); a WRITE request posts receives for the incoming chunks and
//! answers with a WRITE completion control message once they all
//! arrived.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tagio::{ConnId, Context, Event, Status};

use crate::common::{
    self, IoCtx, IoPools, Token, XferAction, XferHandle, BUSY_PROGRESS_COUNT, MBYTE,
};
use crate::opts::Opts;
use crate::proto::{self, IoHeader, IoOp, IO_OP_COUNT};
use crate::status::{RunStatus, StatusLatch};

/// Per-connection interval counters, reset after every report.
#[derive(Default, Clone)]
struct ConnStats {
    completions: [u64; IO_OP_COUNT],
    bytes: [u64; IO_OP_COUNT],
}

impl ConnStats {
    fn reset(&mut self) {
        *self = ConnStats::default();
    }
}

pub struct Server {
    opts: Opts,
    ctx: IoCtx,
    pools: IoPools,
    latch: StatusLatch,
    stats: HashMap<ConnId, ConnStats>,
}

impl Server {
    pub fn new(opts: Opts, latch: StatusLatch) -> Self {
        let ctx = Context::new(opts.transport_config());
        let pools = IoPools::new(&opts);
        Self {
            opts,
            ctx,
            pools,
            latch,
            stats: HashMap::new(),
        }
    }

    /// Bind the listener, backing off `retry_interval` per failed
    /// attempt, bounded by the retry budget.
    pub fn listen(&mut self) -> bool {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.opts.port));
        let mut retry: u64 = 1;
        while self.latch.is_ok() {
            match self.ctx.listen(addr) {
                Ok(()) => return true,
                Err(e) => {
                    if retry > self.opts.retries {
                        return false;
                    }
                    if self.opts.retries == u64::MAX {
                        tracing::info!(
                            "restarting listener on {} in {:.1} seconds (retry {}): {}",
                            addr,
                            self.opts.retry_interval.as_secs_f64(),
                            retry,
                            e
                        );
                    } else {
                        tracing::info!(
                            "restarting listener on {} in {:.1} seconds (retry {}/{}): {}",
                            addr,
                            self.opts.retry_interval.as_secs_f64(),
                            retry,
                            self.opts.retries,
                            e
                        );
                    }
                    std::thread::sleep(self.opts.retry_interval);
                    retry += 1;
                }
            }
        }
        false
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.local_addr().ok()
    }

    /// Listen and serve until the status latch trips.
    pub fn run(&mut self) {
        if !self.listen() {
            return;
        }
        self.serve();
    }

    /// Main loop: busy-progress bursts and periodic state reports.
    pub fn serve(&mut self) {
        let mut prev_time = Instant::now();
        while self.latch.get() == RunStatus::Ok {
            for _ in 0..BUSY_PROGRESS_COUNT {
                self.progress();
            }

            let elapsed = prev_time.elapsed();
            if elapsed >= self.opts.print_interval {
                self.report_state(elapsed.as_secs_f64());
                prev_time = Instant::now();
            }
        }
        self.shutdown();
    }

    fn progress(&mut self) {
        self.ctx.progress();
        while let Some(event) = self.ctx.poll_event() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: Event<Token>) {
        match event {
            Event::Accepted { conn } => {
                if self.stats.insert(conn, ConnStats::default()).is_some() {
                    panic!("connection duplicate in statistics map");
                }
            }
            Event::ConnError { conn, status } => {
                let prefix = self
                    .ctx
                    .conn(conn)
                    .map(|c| c.log_prefix().to_string())
                    .unwrap_or_else(|| format!("[conn {}]", conn));
                tracing::info!("disconnecting connection {} with status {}", prefix, status);
                self.ctx.disconnect(conn);
            }
            Event::Closed { conn } => {
                // Shutdown also tears down connections that never made
                // it into the statistics map.
                self.stats.remove(&conn);
            }
            Event::Control { conn, data } => {
                self.dispatch_io_message(conn, data);
            }
            Event::OpComplete { token, status } => match token {
                Token::MsgSent(msg) => self.pools.io_msg.put(msg),
                Token::Xfer(handle) => {
                    if let Some(action) = handle.complete() {
                        self.finish_xfer(action, status);
                    }
                }
            },
            // The server never connects out.
            Event::ConnectResult { .. } => unreachable!(),
        }
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

        if self.opts.validate {
            assert_eq!(data.len(), self.opts.iomsg_size);
            proto::validate_msg(&data);
        }

        match msg.op {
            IoOp::Read => self.handle_io_read_request(conn, &msg),
            IoOp::Write => self.handle_io_write_request(conn, &msg),
            _ => panic!("invalid opcode: {}", msg.op as u8),
        }
        self.ctx.recycle_buf(data);
    }

    fn handle_io_read_request(&mut self, conn: ConnId, msg: &IoHeader) {
        tracing::debug!("sending IO read data");
        assert!(self.opts.max_data_size >= msg.data_size);

        let validate = self.opts.validate;
        let iov = self.pools.acquire_iov(msg.data_size, msg.sn, validate);
        let stats = self.stats.get_mut(&conn).expect("unknown connection");
        stats.bytes[IoOp::Read.index()] += msg.data_size;

        let handle = XferHandle::new(iov.size() as u32);
        common::send_data_iov(&mut self.ctx, conn, &iov, msg.sn, &handle);
        handle.set_action(XferAction::ServerReadSent { conn, iov });

        // The response travels as data so the client matches it by sn.
        tracing::debug!("sending IO read response");
        common::send_io_message(
            &mut self.ctx,
            &mut self.pools,
            conn,
            IoOp::ReadComp,
            msg.sn,
            0,
            validate,
        );
    }

    fn handle_io_write_request(&mut self, conn: ConnId, msg: &IoHeader) {
        tracing::debug!("receiving IO write data");
        assert!(msg.data_size != 0);

        let iov = self.pools.acquire_iov(msg.data_size, msg.sn, false);
        let stats = self.stats.get_mut(&conn).expect("unknown connection");
        stats.bytes[IoOp::Write.index()] += msg.data_size;

        let handle = XferHandle::new(iov.size() as u32);
        common::recv_data_iov(&mut self.ctx, conn, &iov, msg.sn, &handle);
        handle.set_action(XferAction::ServerWriteRecv {
            conn,
            sn: msg.sn,
            iov,
        });
    }

    fn finish_xfer(&mut self, action: XferAction, status: Status) {
        match action {
            XferAction::ServerReadSent { conn, iov } => {
                // The connection may already be gone; counters follow it.
                if let Some(stats) = self.stats.get_mut(&conn) {
                    stats.completions[IoOp::Read.index()] += 1;
                }
                self.pools.release_iov(iov);
            }
            XferAction::ServerWriteRecv { conn, sn, iov } => {
                if status.is_ok() {
                    let conn_ok = self
                        .ctx
                        .conn(conn)
                        .map(|c| c.status().is_ok())
                        .unwrap_or(false);
                    if conn_ok {
                        common::send_io_message(
                            &mut self.ctx,
                            &mut self.pools,
                            conn,
                            IoOp::WriteComp,
                            sn,
                            iov.data_size(),
                            self.opts.validate,
                        );
                    }
                    if self.opts.validate {
                        if let Some(pos) = iov.validate(sn) {
                            panic!("iov data corruption at {} position", pos);
                        }
                    }
                }
                if let Some(stats) = self.stats.get_mut(&conn) {
                    stats.completions[IoOp::Write.index()] += 1;
                }
                self.pools.release_iov(iov);
            }
            XferAction::ClientRead { .. } | XferAction::ClientWriteSent { .. } => unreachable!(),
        }
    }

    fn report_state(&mut self, interval: f64) {
        let mut line = String::new();

        if !self.stats.is_empty() {
            let mut total = ConnStats::default();
            let mut min: [(u64, Option<ConnId>); IO_OP_COUNT] = [(u64::MAX, None); 2];
            let mut max: [u64; IO_OP_COUNT] = [0; 2];
            for (&conn, stats) in &self.stats {
                for op in 0..IO_OP_COUNT {
                    total.completions[op] += stats.completions[op];
                    total.bytes[op] += stats.bytes[op];
                    if stats.completions[op] <= min[op].0 {
                        min[op] = (stats.completions[op], Some(conn));
                    }
                    max[op] = max[op].max(stats.completions[op]);
                }
            }
            for (op, name) in [(IoOp::Read, "read"), (IoOp::Write, "write")] {
                let i = op.index();
                let peer = min[i]
                    .1
                    .and_then(|id| self.ctx.conn(id))
                    .map(|c| c.peer_name().to_string())
                    .unwrap_or_default();
                line.push_str(&format!(
                    "{} {:.2} MBs min:{}({}) max:{} total:{} | ",
                    name,
                    total.bytes[i] as f64 / (interval * MBYTE),
                    min[i].0,
                    peer,
                    max[i],
                    total.completions[i],
                ));
            }
        }

        let pin = self.ctx.pin_stats();
        tracing::info!(
            "{}active: {}/{} buffers:{} | pin bytes:{} regions:{} evict:{}",
            line,
            self.stats.len(),
            self.ctx.num_connections(),
            self.pools.iovs.allocated(),
            pin.bytes,
            pin.regions,
            pin.evictions,
        );

        for stats in self.stats.values_mut() {
            stats.reset();
        }
    }

    /// Disconnect everything and drain the context.
    fn shutdown(&mut self) {
        for conn in self.ctx.connection_ids() {
            self.ctx.disconnect(conn);
        }
        while self.ctx.num_connections() > 0 {
            self.progress();
        }
    }
}
