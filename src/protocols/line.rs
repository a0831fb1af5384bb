//! Line-oriented decoding.
//!
//! Splits a byte stream on `\n`, dropping one trailing `\r`, and emits each
//! line as a `String`. Lines longer than the configured maximum and lines
//! that are not UTF-8 are malformed. An over-long line that has no
//! terminator yet is discarded up to its `\n` as the rest arrives.

use crate::runtime::replay::{Decode, DecodeError, ReplayCursor, ReplayingDecoder};

pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// Decoder for `\n`-terminated lines.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    max_length: usize,
    discarding: bool,
}

impl LineDecoder {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Wrap in a replaying driver, ready to add to a pipeline.
    pub fn into_handler(self) -> ReplayingDecoder<Self> {
        ReplayingDecoder::new(self, ())
    }

    fn emit(&self, mut line: &[u8], input: &mut ReplayCursor<'_, ()>) -> Result<(), DecodeError> {
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        if line.len() > self.max_length {
            return Err(DecodeError::Malformed(format!(
                "line of {} bytes exceeds {}",
                line.len(),
                self.max_length
            )));
        }
        let text = std::str::from_utf8(line)
            .map_err(|_| DecodeError::Malformed("line is not valid UTF-8".to_string()))?;
        input.push(Box::new(text.to_string()));
        Ok(())
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decode for LineDecoder {
    type State = ();

    fn name(&self) -> &str {
        "line"
    }

    fn decode(&mut self, input: &mut ReplayCursor<'_, ()>) -> Result<(), DecodeError> {
        if self.discarding {
            match input.find(b'\n') {
                Some(len) => {
                    input.skip(len + 1)?;
                    self.discarding = false;
                }
                None => input.skip(input.remaining())?,
            }
            return Ok(());
        }
        match input.find(b'\n') {
            Some(_) => {
                let line = input.read_until(b'\n')?;
                self.emit(line, input)?;
                input.checkpoint(());
                Ok(())
            }
            // One spare byte for a trailing '\r'.
            None if input.remaining() > self.max_length + 1 => {
                let len = input.remaining();
                input.skip(len)?;
                self.discarding = true;
                Err(DecodeError::Malformed(format!(
                    "no line terminator within {} bytes",
                    self.max_length
                )))
            }
            None => Err(input.replay()),
        }
    }

    /// An unterminated tail becomes the final line.
    fn decode_last(&mut self, input: &mut ReplayCursor<'_, ()>) -> Result<(), DecodeError> {
        if input.find(b'\n').is_some() {
            return self.decode(input);
        }
        let tail = input.read_bytes(input.remaining())?;
        self.emit(tail, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::runtime::pipeline::{Handler, HandlerContext, Message};
    use crate::runtime::session::{ChannelKind, Session};
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn lines(out: Vec<Message>) -> Vec<String> {
        out.into_iter()
            .map(|m| *m.downcast::<String>().unwrap())
            .collect()
    }

    #[test]
    fn test_lf_and_crlf() {
        let mut decoder = LineDecoder::default().into_handler();
        let mut out = Vec::new();
        decoder.feed(b"one\r\ntwo\n\nthree\r", &mut out).unwrap();
        assert_eq!(lines(out), ["one", "two", ""]);
        assert_eq!(decoder.buffered(), 6);
    }

    #[test]
    fn test_cr_split_from_lf() {
        let mut decoder = LineDecoder::default().into_handler();
        let mut out = Vec::new();
        decoder.feed(b"abc\r", &mut out).unwrap();
        assert!(out.is_empty());
        decoder.feed(b"\n", &mut out).unwrap();
        assert_eq!(lines(out), ["abc"]);
    }

    #[test]
    fn test_max_length() {
        let mut decoder = LineDecoder::new(4).into_handler();
        let mut out = Vec::new();
        decoder.feed(b"four\r\n", &mut out).unwrap();
        assert_eq!(lines(std::mem::take(&mut out)), ["four"]);

        assert!(matches!(
            decoder.feed(b"fives\n", &mut out),
            Err(DecodeError::Malformed(_))
        ));
        // An unterminated run is rejected as soon as it cannot fit.
        assert!(decoder.feed(b"12345", &mut out).is_ok());
        assert!(decoder.feed(b"6", &mut out).is_err());
        assert_eq!(decoder.buffered(), 0);

        // The rest of the rejected line is dropped up to its terminator.
        decoder.feed(b"789\nok\n", &mut out).unwrap();
        assert_eq!(lines(out), ["ok"]);
    }

    #[test]
    fn test_line_after_malformed_line_survives() {
        let mut decoder = LineDecoder::new(4).into_handler();
        let mut out = Vec::new();
        assert!(decoder.feed(b"fives\nok\n", &mut out).is_err());
        assert!(out.is_empty());
        decoder.resume(&mut out).unwrap();
        assert_eq!(lines(out), ["ok"]);
    }

    #[test]
    fn test_discarded_tail_is_not_flushed() {
        let mut decoder = LineDecoder::new(4).into_handler();
        let mut out = Vec::new();
        assert!(decoder.feed(b"123456", &mut out).is_err());
        decoder.feed(b"78", &mut out).unwrap();
        decoder.finish(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut decoder = LineDecoder::default().into_handler();
        let mut out = Vec::new();
        assert!(decoder.feed(&[0xff, 0xfe, b'\n'], &mut out).is_err());
        decoder.feed(b"ok\n", &mut out).unwrap();
        assert_eq!(lines(out), ["ok"]);
    }

    #[test]
    fn test_tail_flushed_at_end() {
        let mut decoder = LineDecoder::default().into_handler();
        let mut out = Vec::new();
        decoder.feed(b"a\nlast", &mut out).unwrap();
        decoder.finish(&mut out).unwrap();
        assert_eq!(lines(out), ["a", "last"]);
    }

    /// Collects decoded lines at the tail of a pipeline.
    struct Lines(Arc<Mutex<Vec<String>>>);

    impl Handler for Lines {
        fn name(&self) -> &str {
            "lines"
        }

        fn on_message_received(&mut self, _ctx: &mut HandlerContext<'_>, msg: Message) -> Result<()> {
            let line = msg
                .downcast::<String>()
                .map_err(|_| Error::invalid("expected a line"))?;
            self.0.lock().unwrap().push(*line);
            Ok(())
        }
    }

    #[test]
    fn test_ping_split_across_three_reads() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let session = Session::detached(ChannelKind::Stream);
        session
            .pipeline()
            .add_last(LineDecoder::default().into_handler())
            .unwrap()
            .add_last(Lines(Arc::clone(&seen)))
            .unwrap();

        session.fire_message_received(Box::new(Bytes::from_static(b"PI")));
        assert!(seen.lock().unwrap().is_empty());
        session.fire_message_received(Box::new(Bytes::from_static(b"NG\r")));
        assert!(seen.lock().unwrap().is_empty());
        session.fire_message_received(Box::new(Bytes::from_static(b"\n")));
        assert_eq!(*seen.lock().unwrap(), ["PING"]);
    }
}
