//! State shared by the client and server engines: the pool set, the
//! completion-token model, and the transfer issue helpers.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tagio::{ConnId, Context};

use crate::buffer::{chunk_count, Buffer, BufferIov};
use crate::opts::Opts;
use crate::pool::Pool;
use crate::proto::{IoMessage, IoOp};

/// Polls of the progress engine before a wait loop consults the clock.
pub const BUSY_PROGRESS_COUNT: usize = 1000;

/// Bytes per megabyte in throughput reports.
pub const MBYTE: f64 = (1 << 20) as f64;

/// The transport context instantiated with this crate's token type.
pub type IoCtx = Context<Token>;

/// Completion token carried by every posted transport operation.
pub enum Token {
    /// A control-message send; the buffer returns to its pool.
    MsgSent(IoMessage),
    /// One of several transfers sharing a counted handle.
    Xfer(Rc<XferHandle>),
}

/// Terminal action of a multi-transfer transaction, run by the engine
/// when the shared counter reaches zero.
pub enum XferAction {
    /// Client READ: data chunks plus the completion message arrived.
    ClientRead {
        server_index: usize,
        sn: u32,
        iov: BufferIov,
        resp: IoMessage,
    },
    /// Client WRITE: all data chunks were handed to the transport.
    ClientWriteSent { iov: BufferIov },
    /// Server READ: data chunks and the completion message went out.
    ServerReadSent { conn: ConnId, iov: BufferIov },
    /// Server WRITE: all data chunks arrived.
    ServerWriteRecv {
        conn: ConnId,
        sn: u32,
        iov: BufferIov,
    },
}

/// One-shot completion handle shared by several transport operations.
///
/// Each completion decrements the counter; the final decrement
/// surrenders the action. The action is installed after the operations
/// are posted, which is safe because completions are only delivered
/// when the engine drains its event queue.
pub struct XferHandle {
    remaining: Cell<u32>,
    action: RefCell<Option<XferAction>>,
}

impl XferHandle {
    pub fn new(count: u32) -> Rc<Self> {
        assert!(count > 0);
        Rc::new(Self {
            remaining: Cell::new(count),
            action: RefCell::new(None),
        })
    }

    pub fn set_action(&self, action: XferAction) {
        let prev = self.action.borrow_mut().replace(action);
        assert!(prev.is_none());
    }

    /// Record one completion; returns the action on the final one.
    pub fn complete(&self) -> Option<XferAction> {
        let remaining = self.remaining.get();
        debug_assert!(remaining > 0);
        self.remaining.set(remaining - 1);
        if remaining == 1 {
            self.action.borrow_mut().take()
        } else {
            None
        }
    }
}

/// The pool set both engines carry.
pub struct IoPools {
    pub io_msg: Pool<IoMessage>,
    pub iovs: Pool<BufferIov>,
    pub chunks: Pool<Buffer>,
}

impl IoPools {
    pub fn new(opts: &Opts) -> Self {
        Self {
            io_msg: Pool::new(opts.iomsg_size, "io messages"),
            iovs: Pool::new(
                chunk_count(opts.max_data_size, opts.chunk_size),
                "data iovs",
            ),
            chunks: Pool::with_offcache(
                opts.chunk_size,
                "data chunks",
                opts.num_offcache_buffers,
            ),
        }
    }

    /// Take an IOV backing `data_size` bytes, optionally filled from
    /// seed `sn`.
    pub fn acquire_iov(&mut self, data_size: u64, sn: u32, fill: bool) -> BufferIov {
        let mut iov = self.iovs.get();
        iov.init(data_size, &mut self.chunks, sn, fill);
        iov
    }

    /// Return an IOV's chunks and then the IOV itself.
    pub fn release_iov(&mut self, mut iov: BufferIov) {
        iov.release(&mut self.chunks);
        self.iovs.put(iov);
    }
}

/// Send one control message. READ completions are sent as *data* so the
/// receiver can match them by sequence number alongside the payload
/// chunks; everything else uses the control tag.
///
/// Returns `false` when the connection rejected the post; the message
/// buffer still comes back through its completion token.
pub fn send_io_message(
    ctx: &mut IoCtx,
    pools: &mut IoPools,
    conn: ConnId,
    op: IoOp,
    sn: u32,
    data_size: u64,
    validate: bool,
) -> bool {
    let mut msg = pools.io_msg.get();
    msg.init(op, sn, data_size, validate);
    tracing::debug!(
        "sending IO {}, sn {} size {}",
        op.name(),
        sn,
        crate::proto::IO_HDR_SIZE
    );
    // Safety: the message lives inside the token until the completion
    // returns it to the pool; boxed storage does not move with it.
    let region = unsafe { msg.region() };
    if op == IoOp::ReadComp {
        ctx.send_data(conn, region, sn, Token::MsgSent(msg))
    } else {
        ctx.send_io_message(conn, region, sn, Token::MsgSent(msg))
    }
}

/// Post one data send per IOV chunk, all tagged `sn`, sharing `handle`.
pub fn send_data_iov(
    ctx: &mut IoCtx,
    conn: ConnId,
    iov: &BufferIov,
    sn: u32,
    handle: &Rc<XferHandle>,
) {
    for chunk in iov.iter() {
        // Safety: the IOV is owned by the handle's action until the
        // final completion; chunk storage does not move with it.
        let region = unsafe { chunk.region() };
        ctx.send_data(conn, region, sn, Token::Xfer(handle.clone()));
    }
}

/// Post one data receive per IOV chunk, all tagged `sn`, sharing
/// `handle`.
pub fn recv_data_iov(
    ctx: &mut IoCtx,
    conn: ConnId,
    iov: &BufferIov,
    sn: u32,
    handle: &Rc<XferHandle>,
) {
    for chunk in iov.iter() {
        // Safety: as in send_data_iov.
        let region = unsafe { chunk.region() };
        ctx.recv_data(conn, region, sn, Token::Xfer(handle.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xfer_handle_counts_down() {
        let handle = XferHandle::new(3);
        handle.set_action(XferAction::ClientWriteSent {
            iov: crate::pool::PoolItem::alloc(1),
        });
        assert!(handle.complete().is_none());
        assert!(handle.complete().is_none());
        let action = handle.complete();
        assert!(matches!(action, Some(XferAction::ClientWriteSent { .. })));
    }

    #[test]
    #[should_panic]
    fn test_xfer_handle_single_action() {
        let handle = XferHandle::new(1);
        handle.set_action(XferAction::ClientWriteSent {
            iov: crate::pool::PoolItem::alloc(1),
        });
        handle.set_action(XferAction::ClientWriteSent {
            iov: crate::pool::PoolItem::alloc(1),
        });
    }
}
