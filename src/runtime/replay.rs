//! Replaying decoder.
//!
//! Protocol parsers written against [`ReplayCursor`] read optimistically:
//! every read that runs past the end of the buffered input fails with
//! [`DecodeError::NeedMore`], and the driver rewinds to the last checkpoint
//! and waits for the next chunk. A checkpoint covers the read position, the
//! parser state and the units pushed so far, so a replay never re-reads
//! confirmed data and never emits a unit twice.
//!
//! The driver sets an implicit checkpoint before every `decode` call, which
//! means a parser only needs explicit checkpoints inside a call that
//! consumes more than one field.
//!
//! A malformed run is skipped rather than fatal: units confirmed before it
//! are kept, the bytes the failing call consumed are dropped, and decoding
//! resumes from the initial state with the input after them.

use crate::error::Error;
use crate::runtime::pipeline::{message_bytes, Handler, HandlerContext, Message};
use bytes::{Buf, BytesMut};
use std::fmt::Debug;
use thiserror::Error;
use tracing::debug;

/// Outcome of a failed decode step.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The input ended mid-field. Flow control, not a failure.
    #[error("need more input")]
    NeedMore,
    #[error("malformed input: {0}")]
    Malformed(String),
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::NeedMore => Error::Decode("truncated input".to_string()),
            DecodeError::Malformed(msg) => Error::Decode(msg),
        }
    }
}

/// A protocol-specific decoding routine.
pub trait Decode: Send + 'static {
    type State: Copy + Eq + Debug + Send + 'static;

    /// Name of the pipeline stage wrapping this decoder.
    fn name(&self) -> &str;

    /// Consume input at the cursor, pushing complete units with
    /// [`ReplayCursor::push`].
    fn decode(&mut self, input: &mut ReplayCursor<'_, Self::State>) -> Result<(), DecodeError>;

    /// Called once more over leftover input when the session closes.
    fn decode_last(
        &mut self,
        input: &mut ReplayCursor<'_, Self::State>,
    ) -> Result<(), DecodeError> {
        self.decode(input)
    }
}

/// Read view over the cumulative buffer.
pub struct ReplayCursor<'a, S> {
    buf: &'a [u8],
    pos: usize,
    state: S,
    checkpoint_pos: usize,
    checkpoint_state: S,
    units: Vec<Message>,
    checkpoint_units: usize,
}

impl<'a, S: Copy> ReplayCursor<'a, S> {
    fn new(buf: &'a [u8], state: S) -> Self {
        Self {
            buf,
            pos: 0,
            state,
            checkpoint_pos: 0,
            checkpoint_state: state,
            units: Vec::new(),
            checkpoint_units: 0,
        }
    }

    fn mark(&mut self) {
        self.checkpoint_pos = self.pos;
        self.checkpoint_state = self.state;
        self.checkpoint_units = self.units.len();
    }

    fn rewind(&mut self) {
        self.pos = self.checkpoint_pos;
        self.state = self.checkpoint_state;
        self.units.truncate(self.checkpoint_units);
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// Emit a decoded unit. Units pushed after the last checkpoint are
    /// withdrawn if the attempt replays.
    pub fn push(&mut self, unit: Message) {
        self.units.push(unit);
    }

    /// Confirm everything read so far and move to `state`.
    pub fn checkpoint(&mut self, state: S) {
        self.state = state;
        self.mark();
    }

    /// The signal that aborts this attempt; return it from `decode`.
    pub fn replay(&self) -> DecodeError {
        DecodeError::NeedMore
    }

    /// Offset of the read position within the buffered input.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The unread input.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn peek_u8(&self) -> Result<u8, DecodeError> {
        self.buf.get(self.pos).copied().ok_or(DecodeError::NeedMore)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    /// Big-endian.
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Big-endian.
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::NeedMore);
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.read_bytes(n).map(|_| ())
    }

    /// Offset of the next `delim` from the read position.
    pub fn find(&self, delim: u8) -> Option<usize> {
        self.rest().iter().position(|&b| b == delim)
    }

    /// Read up to `delim`, consuming but not returning it.
    pub fn read_until(&mut self, delim: u8) -> Result<&'a [u8], DecodeError> {
        let len = self.find(delim).ok_or(DecodeError::NeedMore)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len + 1;
        Ok(bytes)
    }
}

/// Drives a [`Decode`] implementation over a growing input buffer.
///
/// Also a pipeline stage: byte messages are decoded and the units forwarded;
/// other messages pass through untouched.
pub struct ReplayingDecoder<D: Decode> {
    inner: D,
    cumulation: BytesMut,
    state: D::State,
    initial: D::State,
}

impl<D: Decode> ReplayingDecoder<D> {
    pub fn new(inner: D, initial: D::State) -> Self {
        Self {
            inner,
            cumulation: BytesMut::new(),
            state: initial,
            initial,
        }
    }

    /// State as of the last checkpoint.
    pub fn state(&self) -> D::State {
        self.state
    }

    /// Bytes held back since the last checkpoint.
    pub fn buffered(&self) -> usize {
        self.cumulation.len()
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Append `chunk` and decode as many units as it completes.
    ///
    /// On a malformed run the units decoded before it are still appended to
    /// `out`; input after the run stays buffered for [`resume`](Self::resume).
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Message>) -> Result<(), DecodeError> {
        self.cumulation.extend_from_slice(chunk);
        self.decode_buffered(out, false)
    }

    /// Decode input left buffered by a malformed run.
    pub fn resume(&mut self, out: &mut Vec<Message>) -> Result<(), DecodeError> {
        self.decode_buffered(out, false)
    }

    /// Flush leftover input through `decode_last`. Whatever still cannot
    /// complete is dropped.
    pub fn finish(&mut self, out: &mut Vec<Message>) -> Result<(), DecodeError> {
        if self.cumulation.is_empty() {
            return Ok(());
        }
        let result = self.decode_buffered(out, true);
        if !self.cumulation.is_empty() {
            debug!(
                decoder = self.inner.name(),
                bytes = self.cumulation.len(),
                "Discarding partial input at end of stream"
            );
        }
        self.reset();
        result
    }

    fn reset(&mut self) {
        self.cumulation.clear();
        self.state = self.initial;
    }

    fn decode_buffered(&mut self, out: &mut Vec<Message>, last: bool) -> Result<(), DecodeError> {
        let mut cursor = ReplayCursor::new(&self.cumulation[..], self.state);
        // A state change can complete a unit without consuming input, so an
        // empty buffer is tried once more after one.
        let mut state_changed = false;
        let mut call_start = 0;

        let result = loop {
            if cursor.remaining() == 0 && !state_changed {
                break Ok(());
            }
            cursor.mark();
            call_start = cursor.pos;
            let before_state = cursor.state;

            let step = if last {
                self.inner.decode_last(&mut cursor)
            } else {
                self.inner.decode(&mut cursor)
            };

            match step {
                Ok(()) => {
                    state_changed = cursor.state != before_state;
                    if cursor.pos == call_start && !state_changed {
                        if cursor.remaining() == 0 {
                            break Ok(());
                        }
                        break Err(DecodeError::Malformed(format!(
                            "{} did not consume input or change state",
                            self.inner.name()
                        )));
                    }
                }
                Err(DecodeError::NeedMore) => {
                    cursor.rewind();
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        let ReplayCursor {
            pos,
            state,
            mut units,
            checkpoint_units,
            ..
        } = cursor;
        match result {
            Ok(()) => {
                out.append(&mut units);
                self.cumulation.advance(pos);
                self.state = state;
                Ok(())
            }
            Err(e) => {
                units.truncate(checkpoint_units);
                out.append(&mut units);
                if pos > call_start {
                    // Skip what the failing call read and start over after it.
                    self.cumulation.advance(pos);
                    self.state = self.initial;
                } else {
                    self.reset();
                }
                Err(e)
            }
        }
    }
}

impl<D: Decode> Handler for ReplayingDecoder<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn on_message_received(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: Message,
    ) -> crate::error::Result<()> {
        let bytes = match message_bytes(msg) {
            Ok(bytes) => bytes,
            Err(other) => {
                ctx.fire_message_received(other);
                return Ok(());
            }
        };
        let mut out = Vec::new();
        let mut result = self.feed(&bytes, &mut out);
        loop {
            for unit in out.drain(..) {
                ctx.fire_message_received(unit);
            }
            let Err(err) = result else {
                return Ok(());
            };
            // Reported in line with the units around it.
            ctx.fire_exception_caught(err.into());
            // Every failure consumes input or empties the buffer.
            if self.cumulation.is_empty() {
                return Ok(());
            }
            result = self.resume(&mut out);
        }
    }

    fn on_close(&mut self, ctx: &mut HandlerContext<'_>) -> crate::error::Result<()> {
        let mut out = Vec::new();
        let result = self.finish(&mut out);
        for unit in out {
            ctx.fire_message_received(unit);
        }
        if let Err(err) = result {
            ctx.fire_exception_caught(err.into());
        }
        ctx.fire_close();
        Ok(())
    }
}
