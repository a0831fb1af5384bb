//! Ping protocol parser.

use bytes::{BufMut, Bytes, BytesMut};

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(String),
    /// Quit command.
    Quit,
}

/// Parse one line, terminator already stripped. Commands are
/// case-insensitive; `None` means an unknown command.
pub fn parse(line: &str) -> Option<Command> {
    let bytes = line.as_bytes();
    if bytes.eq_ignore_ascii_case(b"PING") {
        Some(Command::Ping)
    } else if bytes.eq_ignore_ascii_case(b"QUIT") {
        Some(Command::Quit)
    } else if bytes.len() > 5 && bytes[..5].eq_ignore_ascii_case(b"PING ") {
        Some(Command::PingMsg(line[5..].to_string()))
    } else {
        None
    }
}

pub fn response_pong() -> Bytes {
    Bytes::from_static(b"PONG\r\n")
}

pub fn response_pong_msg(msg: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(5 + msg.len() + 2);
    out.put_slice(b"PONG ");
    out.put_slice(msg.as_bytes());
    out.put_slice(b"\r\n");
    out.freeze()
}

pub fn response_ok() -> Bytes {
    Bytes::from_static(b"OK\r\n")
}

pub fn response_error() -> Bytes {
    Bytes::from_static(b"ERROR unknown command\r\n")
}

pub fn response_error_msg(reason: &str) -> Bytes {
    Bytes::from(format!("ERROR {reason}\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        assert_eq!(parse("PING"), Some(Command::Ping));
        assert_eq!(parse("ping"), Some(Command::Ping));
    }

    #[test]
    fn test_parse_ping_msg() {
        assert_eq!(
            parse("PING hello world"),
            Some(Command::PingMsg("hello world".to_string()))
        );
        assert_eq!(parse("Ping x"), Some(Command::PingMsg("x".to_string())));
    }

    #[test]
    fn test_parse_quit() {
        assert_eq!(parse("QUIT"), Some(Command::Quit));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse("FOO"), None);
        assert_eq!(parse("PING "), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn test_responses() {
        assert_eq!(&response_pong_msg("hi")[..], b"PONG hi\r\n");
        assert_eq!(&response_error_msg("too long")[..], b"ERROR too long\r\n");
    }
}
