//! Ping protocol implementation.
//!
//! A minimal line protocol for health checks and latency measurement:
//!
//! ```text
//! Request:  PING\r\n
//! Response: PONG\r\n
//!
//! Request:  PING hello\r\n
//! Response: PONG hello\r\n
//!
//! Request:  QUIT\r\n
//! Response: OK\r\n   (then the server closes the connection)
//! ```
//!
//! Anything else is answered with `ERROR unknown command`.

pub mod handler;
pub mod parser;

pub use handler::PingHandler;

use crate::error::Result;
use crate::protocols::line::LineDecoder;
use crate::runtime::session::Session;
use std::sync::Arc;

/// Install a line decoder followed by the ping handler.
pub fn init_pipeline(session: &Arc<Session>, max_line_length: usize) -> Result<()> {
    session
        .pipeline()
        .add_last(LineDecoder::new(max_line_length).into_handler())?
        .add_last(PingHandler)?;
    Ok(())
}
