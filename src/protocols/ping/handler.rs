//! Ping protocol pipeline stage.

use super::parser::{
    parse, response_error, response_error_msg, response_ok, response_pong, response_pong_msg,
    Command,
};
use crate::error::{Error, Result};
use crate::runtime::pipeline::{Handler, HandlerContext, Message};
use tracing::debug;

/// Answers decoded lines. Expects a line decoder ahead of it.
///
/// Deliberately simple: no state, one response per line. `QUIT` answers
/// `OK` and closes once the answer is flushed.
#[derive(Debug, Default)]
pub struct PingHandler;

impl Handler for PingHandler {
    fn name(&self) -> &str {
        "ping"
    }

    fn on_open(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        debug!(session = ctx.session().id(), peer = ?ctx.session().peer_addr(), "Ping session open");
        ctx.fire_open();
        Ok(())
    }

    fn on_message_received(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<()> {
        let line = match msg.downcast::<String>() {
            Ok(line) => line,
            Err(other) => {
                ctx.fire_message_received(other);
                return Ok(());
            }
        };

        let response = match parse(&line) {
            Some(Command::Ping) => response_pong(),
            Some(Command::PingMsg(msg)) => response_pong_msg(&msg),
            Some(Command::Quit) => {
                ctx.write(Box::new(response_ok()));
                ctx.close();
                return Ok(());
            }
            None => response_error(),
        };
        ctx.write(Box::new(response));
        Ok(())
    }

    fn on_exception_caught(&mut self, ctx: &mut HandlerContext<'_>, err: Error) -> Result<()> {
        match err {
            Error::Decode(reason) => {
                ctx.write(Box::new(response_error_msg(&reason)));
            }
            err if err.is_disconnect() => {
                debug!(session = ctx.session().id(), error = %err, "Peer went away");
            }
            err => ctx.fire_exception_caught(err),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::line::LineDecoder;
    use crate::runtime::session::{ChannelKind, Session};
    use bytes::Bytes;
    use std::sync::Arc;

    fn ping_session() -> Arc<Session> {
        let session = Session::detached(ChannelKind::Stream);
        session
            .pipeline()
            .add_last(LineDecoder::new(16).into_handler())
            .unwrap()
            .add_last(PingHandler)
            .unwrap();
        session
    }

    fn feed(session: &Arc<Session>, data: &'static [u8]) {
        session.fire_message_received(Box::new(Bytes::from_static(data)));
    }

    #[test]
    fn test_ping_pong() {
        let session = ping_session();
        feed(&session, b"PING\r\nPING hello\r\nWHAT\r\n");
        assert_eq!(
            session.queued_payloads(),
            vec![
                Bytes::from_static(b"PONG\r\n"),
                Bytes::from_static(b"PONG hello\r\n"),
                Bytes::from_static(b"ERROR unknown command\r\n"),
            ]
        );
    }

    #[test]
    fn test_decode_failure_is_answered() {
        let session = ping_session();
        feed(&session, b"PING this line is far too long\r\n");
        let queued = session.queued_payloads();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].starts_with(b"ERROR "));
        assert!(!session.is_closed());

        feed(&session, b"PING\n");
        assert_eq!(session.queued_payloads().len(), 2);
    }

    #[test]
    fn test_line_pipelined_after_bad_line_is_answered() {
        let session = ping_session();
        feed(&session, b"PING this line is far too long\r\nPING\r\n");
        let queued = session.queued_payloads();
        assert_eq!(queued.len(), 2);
        assert!(queued[0].starts_with(b"ERROR "));
        assert_eq!(queued[1], Bytes::from_static(b"PONG\r\n"));
    }

    #[test]
    fn test_quit_closes() {
        let session = ping_session();
        feed(&session, b"QUIT\r\n");
        assert!(session.is_closed());
    }
}
