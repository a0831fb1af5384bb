//! grow-a-reactor: a readiness-based network reactor.
//!
//! A small group of event loops, each a single thread owning a `mio::Poll`,
//! drives non-blocking sessions. Every session carries a pipeline of
//! handlers that see inbound events head to tail and outbound writes tail
//! to head. Protocol parsers plug in as replaying decoders that resume from
//! their last checkpoint as bytes trickle in.
//!
//! ```no_run
//! use grow_a_reactor::protocols::ping;
//! use grow_a_reactor::{EventLoopGroup, LoopConfig, ServerBootstrap};
//!
//! # fn main() -> grow_a_reactor::Result<()> {
//! let group = EventLoopGroup::new(2, &LoopConfig::default())?;
//! group.start_all()?;
//! let addr = ServerBootstrap::new()
//!     .child_initializer(|session| ping::init_pipeline(session, 1024))
//!     .bind(&group, "127.0.0.1:7000".parse().unwrap())?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod protocols;
pub mod runtime;
pub mod server;

pub use error::{Error, Result};
pub use runtime::{
    BufferPool, ChannelKind, Completion, Datagram, EventLoop, EventLoopGroup, Handler,
    HandlerContext, LoopConfig, Message, Pipeline, Session, SessionStatus,
};
pub use server::{PipelineInitializer, ServerBootstrap};
