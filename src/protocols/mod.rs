//! Protocol implementations built on the pipeline.
//!
//! - `line`: `\n`-delimited line decoder
//! - `ping`: ping/pong health-check protocol served by the demo binary

pub mod line;
pub mod ping;
