//! io_bench - point-to-point I/O benchmark over tag-matched messaging.
//!
//! Two symmetric roles stress a [`tagio`] transport with synthetic
//! READ/WRITE transactions: the client streams requests across many
//! connections under a global and a per-connection admission window, the
//! server mirrors each request with data transfers and a completion
//! message. Payloads are chunked through pooled, aligned buffers and can
//! be filled/verified from a deterministic RNG seeded by each
//! transaction's sequence number, so both sides reproduce identical
//! bytes without any shared table.

pub mod buffer;
pub mod client;
pub mod common;
pub mod opts;
pub mod pool;
pub mod proto;
pub mod random;
pub mod ring;
pub mod server;
pub mod status;
