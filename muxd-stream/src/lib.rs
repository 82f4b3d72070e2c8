//! # muxd-stream: Stream Multiplexing over a Reliable-UDP Transport
//!
//! This crate carries many independent bidirectional streams over one
//! reliable connection provided by `muxd-arq`. Each stream behaves like a
//! small TCP: SYN / SYN-ACK / PSH / FIN / RST, preceded by a role-specific
//! hello exchange and guarded by an idle-time keepalive with a bounded
//! failure budget.
//!
//! ## Layout
//!
//! ```text
//! muxd-stream/
//! ├── reactor   - event-loop contract and the virtual ready set
//! ├── framer    - wire frames and the pluggable dialect trait
//! ├── stream    - per-stream virtual sockets
//! ├── handler   - the per-connection state machine
//! ├── listener  - the virtual listening socket
//! └── error     - error taxonomy
//! ```
//!
//! ## Concurrency model
//!
//! Single-threaded cooperative: one event loop owns the handler and every
//! stream hanging off it. Nothing here locks; the only shared structure is
//! the per-loop [`reactor::VirtualReadySet`], reached through
//! `Rc<RefCell<_>>` from the same thread. Running many connections in
//! parallel means sharding handlers across independent loops.

#![forbid(unsafe_code)]

pub mod error;
pub mod framer;
pub mod handler;
pub mod listener;
pub mod reactor;
pub mod stream;

pub use error::{Result, StreamError};
pub use framer::{BinaryFramer, Frame, Framer};
pub use handler::{Phase, Role, StreamedHandler};
pub use listener::{ListenerSlot, StreamedListener};
pub use reactor::{shared_ready_set, FdToken, LoopCtx, SharedReadySet, TimerId, TimerKey};
pub use stream::{StreamRead, StreamState, StreamedFd};
