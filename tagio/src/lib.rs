//! tagio - Tag-matched messaging over non-blocking stream sockets.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Context<U>                            │
//! │  ┌──────────┐  ┌───────────────┐  ┌───────────────────────┐  │
//! │  │ Listener │  │  Event queue  │  │ Connection registry   │  │
//! │  │ (accept) │  │ (completions, │  │ HashMap<id, Conn>     │  │
//! │  └──────────┘  │ notifications)│  └───────────────────────┘  │
//! │                └───────────────┘                             │
//! │  progress() pumps every connection; poll_event() drains      │
//! └──────────────────────────────────────────────────────────────┘
//!                  │               │               │
//!                  ▼               ▼               ▼
//!            ┌──────────┐    ┌──────────┐    ┌──────────┐
//!            │Connection│    │Connection│    │Connection│
//!            │ send q / │    │ send q / │    │ send q / │
//!            │ recv q / │    │ recv q / │    │ recv q / │
//!            │ unexp. q │    │ unexp. q │    │ unexp. q │
//!            └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! - **Tags**: 64-bit, bit 63 = control flag, bits 32..62 = remote
//!   connection id, bits 0..31 = sequence number. Many concurrent
//!   transactions multiplex over one stream and are matched by tag.
//! - **Posted receives** match inbound data frames FIFO-per-tag and are
//!   filled in place (zero-copy); frames with no posted receive stage
//!   into an owned copy and match later (eager-unexpected semantics).
//! - **Single-threaded**: the only suspension point is
//!   [`Context::progress`]; completion tokens come back through
//!   [`Context::poll_event`] in delivery order. Nothing here is `Send`.

pub mod connection;
pub mod context;
pub mod error;
pub mod wire;

pub use connection::{ConnId, Connection, IoRegion};
pub use context::{Config, Context, Event, PinStats};
pub use error::{Error, Result, Status};
