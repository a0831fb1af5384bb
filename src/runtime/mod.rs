//! Reactor runtime.
//!
//! Readiness-based networking on mio (epoll on Linux, kqueue on macOS):
//! - `EventLoop`: one thread, one poll, one task queue
//! - `Session`: per-socket state machine and write queue
//! - `Pipeline`: ordered handler chain bound to a session
//! - `BufferPool` / `AdaptiveRecvSizing`: read buffer reuse and sizing
//! - `ReplayingDecoder`: resumable protocol parsing over partial input

pub mod buffer;
pub mod event_loop;
pub mod pipeline;
pub mod promise;
pub mod recv_size;
pub mod replay;
pub mod session;

pub use buffer::{BufferKind, BufferPool};
pub use event_loop::{EventLoop, EventLoopGroup, LoopConfig, LoopState};
pub use pipeline::{message_bytes, Handler, HandlerContext, Message, Pipeline};
pub use promise::{promise, Completion, Promise};
pub use recv_size::{size_table, size_table_index, AdaptiveRecvSizing, RecvSizeHandle};
pub use replay::{Decode, DecodeError, ReplayCursor, ReplayingDecoder};
pub use session::{ChannelKind, Datagram, Session, SessionStatus};
