//! Server bootstrap.
//!
//! Every loop in a group binds its own listener with SO_REUSEPORT so the
//! kernel spreads incoming connections across loops. Accepted streams
//! become sessions on the accepting loop after a pipeline initializer has
//! populated their pipeline.

use crate::error::{Error, Result};
use crate::runtime::event_loop::{EventLoop, EventLoopGroup};
use crate::runtime::session::Session;
use mio::net::TcpListener;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Populates the pipeline of a freshly accepted or bound session.
pub type PipelineInitializer = Arc<dyn Fn(&Arc<Session>) -> Result<()> + Send + Sync>;

const DEFAULT_BACKLOG: i32 = 1024;

/// A listening socket owned by one loop.
pub(crate) struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    initializer: PipelineInitializer,
}

impl Acceptor {
    pub(crate) fn new(
        listener: std::net::TcpListener,
        initializer: PipelineInitializer,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: TcpListener::from_std(listener),
            local_addr,
            initializer,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn source(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    /// Accept until the backlog is empty, returning initialized sessions.
    pub(crate) fn accept_ready(&self) -> Vec<Arc<Session>> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let session = Session::accepted(stream);
                    if let Err(e) = (self.initializer)(&session) {
                        warn!(peer = %peer_addr, error = %e, "Pipeline initializer failed");
                        session.close();
                        continue;
                    }
                    debug!(session = session.id(), peer = %peer_addr, "Accepted connection");
                    accepted.push(session);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(addr = %self.local_addr, error = %e, "Accept error");
                    break;
                }
            }
        }
        accepted
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
pub fn create_listener_with_reuseport(
    addr: SocketAddr,
    backlog: i32,
) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Binds listeners across a loop group.
pub struct ServerBootstrap {
    initializer: Option<PipelineInitializer>,
    backlog: i32,
}

impl Default for ServerBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBootstrap {
    pub fn new() -> Self {
        Self {
            initializer: None,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Set the initializer run for every accepted session.
    pub fn child_initializer<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Session>) -> Result<()> + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(f));
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    fn initializer(&self) -> Result<PipelineInitializer> {
        self.initializer
            .clone()
            .ok_or_else(|| Error::invalid("no child initializer configured"))
    }

    /// Listen on `addr` from every loop in `group`. Returns the bound
    /// address, which resolves port 0 to the port actually chosen.
    pub fn bind(&self, group: &EventLoopGroup, addr: SocketAddr) -> Result<SocketAddr> {
        let initializer = self.initializer()?;
        let mut bound: Option<SocketAddr> = None;

        for event_loop in group.loops() {
            let target = bound.unwrap_or(addr);
            let listener = create_listener_with_reuseport(target, self.backlog)?;
            let acceptor = Acceptor::new(listener, Arc::clone(&initializer))?;
            let local = event_loop.listen(acceptor).wait()?;
            if bound.is_none() {
                bound = Some(local);
            }
        }

        let bound = bound.ok_or_else(|| Error::invalid("loop group is empty"))?;
        info!(addr = %bound, loops = group.len(), "Server bound");
        Ok(bound)
    }

    /// Bind a datagram session on `event_loop`, initialized like an
    /// accepted stream.
    pub fn bind_datagram(&self, event_loop: &EventLoop, addr: SocketAddr) -> Result<Arc<Session>> {
        let initializer = self.initializer()?;
        let session = Session::bind_datagram(addr)?;
        initializer(&session)?;
        event_loop.register(&session).wait()?;
        info!(addr = ?session.local_addr(), loop_id = event_loop.id(), "Datagram session bound");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ping;
    use crate::runtime::event_loop::LoopConfig;
    use crate::runtime::pipeline::{Handler, HandlerContext, Message};
    use crate::runtime::session::Datagram;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpStream, UdpSocket};
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn ping_server(loops: usize) -> (EventLoopGroup, SocketAddr) {
        let group = EventLoopGroup::new(loops, &LoopConfig::default()).unwrap();
        group.start_all().unwrap();
        let addr = ServerBootstrap::new()
            .child_initializer(|session| ping::init_pipeline(session, 64))
            .bind(&group, "127.0.0.1:0".parse().unwrap())
            .unwrap();
        (group, addr)
    }

    fn client(addr: SocketAddr) -> (TcpStream, BufReader<TcpStream>) {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    fn read_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }

    #[test]
    fn test_requires_initializer() {
        let group = EventLoopGroup::new(1, &LoopConfig::default()).unwrap();
        assert!(matches!(
            ServerBootstrap::new().bind(&group, "127.0.0.1:0".parse().unwrap()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_ping_over_loopback() {
        let (group, addr) = ping_server(2);
        assert_ne!(addr.port(), 0);

        let (mut stream, mut reader) = client(addr);
        stream.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "PONG\r\n");

        for chunk in [&b"PI"[..], b"NG\r", b"\n"] {
            stream.write_all(chunk).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(read_line(&mut reader), "PONG\r\n");

        stream.write_all(b"PING hi there\r\nNOPE\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "PONG hi there\r\n");
        assert_eq!(read_line(&mut reader), "ERROR unknown command\r\n");

        stream.write_all(b"QUIT\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "OK\r\n");
        let mut rest = Vec::new();
        assert_eq!(reader.read_to_end(&mut rest).unwrap(), 0);

        group.stop_all();
    }

    #[test]
    fn test_many_clients_across_loops() {
        let (group, addr) = ping_server(2);
        let clients: Vec<_> = (0..8)
            .map(|i| {
                thread::spawn(move || {
                    let (mut stream, mut reader) = client(addr);
                    let msg = format!("PING client-{i}\r\n");
                    stream.write_all(msg.as_bytes()).unwrap();
                    read_line(&mut reader)
                })
            })
            .collect();
        for (i, handle) in clients.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), format!("PONG client-{i}\r\n"));
        }
        group.stop_all();
    }

    #[test]
    fn test_failed_initializer_drops_connection() {
        let group = EventLoopGroup::new(1, &LoopConfig::default()).unwrap();
        group.start_all().unwrap();
        let addr = ServerBootstrap::new()
            .child_initializer(|_| Err(Error::invalid("refused")))
            .bind(&group, "127.0.0.1:0".parse().unwrap())
            .unwrap();

        let (_stream, mut reader) = client(addr);
        let mut rest = Vec::new();
        assert_eq!(reader.read_to_end(&mut rest).unwrap(), 0);
    }

    /// Echoes datagrams back to their sender.
    struct Echo;

    impl Handler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn on_message_received(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<()> {
            let datagram = msg
                .downcast::<Datagram>()
                .map_err(|_| Error::invalid("expected a datagram"))?;
            ctx.write(datagram);
            Ok(())
        }
    }

    #[test]
    fn test_datagram_echo() {
        let event_loop = EventLoop::new(0, &LoopConfig::default()).unwrap();
        event_loop.start().unwrap();
        let session = ServerBootstrap::new()
            .child_initializer(|session| session.pipeline().add_last(Echo).map(|_| ()))
            .bind_datagram(&event_loop, "127.0.0.1:0".parse().unwrap())
            .unwrap();
        let server = session.local_addr().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(WAIT)).unwrap();
        peer.send_to(b"echo me", server).unwrap();
        let mut buf = [0u8; 32];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"echo me");
        assert_eq!(from, server);
    }
}
