//! Session state machine for one network endpoint.
//!
//! A session wraps an accepted, connected, or bound socket together with its
//! pipeline, its write queue, and its receive-size predictor. Lifecycle:
//!
//! ```text
//! Initial ──register──▶ Registering ──registered──▶ Open
//!    │                        │                       │
//!    │ close                  └────── close / EOF / I/O error ──▶ PendingClose
//!    ▼                                                                │
//!  Closed ◀──────────────────── unregistered (socket closed) ◀───────┘
//! ```
//!
//! Read, write, and lifecycle callbacks run on the owning event loop's
//! thread. `write`, `send`, and `close` may be called from any thread; the
//! registration lock makes "enqueue, then ask for write readiness" atomic
//! with respect to unregistration.

use crate::error::{Error, Result};
use crate::runtime::buffer::{BufferKind, BufferPool};
use crate::runtime::event_loop::{LoopShared, Task};
use crate::runtime::pipeline::{message_bytes, Inbound, Message, Pipeline};
use crate::runtime::promise::{promise, Completion, Promise};
use crate::runtime::recv_size::{AdaptiveRecvSizing, RecvSizeHandle};
use bytes::{Buf, Bytes, BytesMut};
use mio::net::{TcpStream, UdpSocket};
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Sessions whose pipeline is running on this thread.
    static PROPAGATING: RefCell<Vec<u64>> = RefCell::new(Vec::new());
}

/// Marks a session as propagating on this thread until dropped.
struct Propagation(u64);

impl Drop for Propagation {
    fn drop(&mut self) {
        PROPAGATING.with(|ids| ids.borrow_mut().retain(|&id| id != self.0));
    }
}

/// What a session's transport carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Connected byte stream (TCP). Accepts byte payloads.
    Stream,
    /// Unconnected datagram socket (UDP). Accepts [`Datagram`]s.
    Datagram,
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Initial = 0,
    Registering = 1,
    Open = 2,
    PendingClose = 3,
    Closed = 4,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionStatus::Initial,
            1 => SessionStatus::Registering,
            2 => SessionStatus::Open,
            3 => SessionStatus::PendingClose,
            _ => SessionStatus::Closed,
        }
    }
}

/// One datagram and the peer it came from or goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub peer: SocketAddr,
    pub payload: Bytes,
}

pub(crate) enum Transport {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

impl Transport {
    fn raw_fd(&self) -> RawFd {
        match self {
            Transport::Stream(s) => s.as_raw_fd(),
            Transport::Datagram(s) => s.as_raw_fd(),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Stream(s) => s.local_addr().ok(),
            Transport::Datagram(s) => s.local_addr().ok(),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Stream(s) => s.peer_addr().ok(),
            Transport::Datagram(_) => None,
        }
    }
}

/// A queued outbound unit. Dequeued only once fully flushed.
struct PendingWrite {
    data: Bytes,
    peer: Option<SocketAddr>,
    promise: Promise<()>,
}

/// State guarded by the registration lock.
struct Registration {
    /// Owning loop; weak so a session never keeps a loop alive.
    dispatcher: Option<Weak<LoopShared>>,
    token: Option<Token>,
    write_interest: bool,
    queue: VecDeque<PendingWrite>,
}

/// Socket state; touched from the loop thread only.
struct IoState {
    transport: Option<Transport>,
    recv: Option<RecvSizeHandle>,
    /// Reused for every read; only the bytes read are copied out.
    read_buf: Option<BytesMut>,
}

enum ReadStep {
    Data(Message),
    WouldBlock,
    Eof,
}

enum CloseStep {
    AlreadyClosing,
    ClosedNow,
    PendingClose,
}

/// A network endpoint driven by an event loop.
pub struct Session {
    id: u64,
    kind: ChannelKind,
    fd: Option<RawFd>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    status: AtomicU8,
    registered: AtomicBool,
    connecting: AtomicBool,
    unregister_requested: AtomicBool,
    close_fired: AtomicBool,
    registration: Mutex<Registration>,
    io: Mutex<IoState>,
    /// Sends issued from inside this session's own propagation.
    deferred: Mutex<VecDeque<(Message, Promise<()>)>>,
    pipeline: Pipeline,
}

impl Session {
    fn with_transport(
        kind: ChannelKind,
        transport: Option<Transport>,
        peer_addr: Option<SocketAddr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            fd: transport.as_ref().map(Transport::raw_fd),
            local_addr: transport.as_ref().and_then(Transport::local_addr),
            peer_addr: peer_addr.or_else(|| transport.as_ref().and_then(Transport::peer_addr)),
            status: AtomicU8::new(SessionStatus::Initial as u8),
            registered: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            unregister_requested: AtomicBool::new(false),
            close_fired: AtomicBool::new(false),
            registration: Mutex::new(Registration {
                dispatcher: None,
                token: None,
                write_interest: false,
                queue: VecDeque::new(),
            }),
            io: Mutex::new(IoState {
                transport,
                recv: None,
                read_buf: None,
            }),
            deferred: Mutex::new(VecDeque::new()),
            pipeline: Pipeline::new(),
        })
    }

    /// Wrap an already connected std stream.
    pub fn from_std_stream(stream: std::net::TcpStream) -> Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        Ok(Self::accepted(TcpStream::from_std(stream)))
    }

    pub(crate) fn accepted(stream: TcpStream) -> Arc<Self> {
        Self::with_transport(ChannelKind::Stream, Some(Transport::Stream(stream)), None)
    }

    /// Start a non-blocking connect. The session completes the connection
    /// once registered; writes queued meanwhile flush afterwards.
    pub fn connect(addr: SocketAddr) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)?;
        let _ = stream.set_nodelay(true);
        let session = Self::with_transport(
            ChannelKind::Stream,
            Some(Transport::Stream(stream)),
            Some(addr),
        );
        session.connecting.store(true, Ordering::Release);
        Ok(session)
    }

    /// Bind a datagram session.
    pub fn bind_datagram(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self::with_transport(
            ChannelKind::Datagram,
            Some(Transport::Datagram(socket)),
            None,
        ))
    }

    /// A session with no socket; its pipeline and queue work, nothing flushes.
    #[cfg(test)]
    pub(crate) fn detached(kind: ChannelKind) -> Arc<Self> {
        Self::with_transport(kind, None, None)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.status() == SessionStatus::Open
    }

    pub fn is_pending_close(&self) -> bool {
        self.status() == SessionStatus::PendingClose
    }

    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    fn is_closing(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::PendingClose | SessionStatus::Closed
        )
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Number of writes waiting to be flushed.
    pub fn queued_writes(&self) -> usize {
        self.lock_registration().queue.len()
    }

    fn lock_registration(&self) -> MutexGuard<'_, Registration> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_io(&self) -> MutexGuard<'_, IoState> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_deferred(&self) -> MutexGuard<'_, VecDeque<(Message, Promise<()>)>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn dispatcher(&self) -> Option<Arc<LoopShared>> {
        self.lock_registration()
            .dispatcher
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub(crate) fn token(&self) -> Option<Token> {
        self.lock_registration().token
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    /// Queue a payload for the transport, bypassing the pipeline.
    ///
    /// Stream sessions take byte payloads, datagram sessions take
    /// [`Datagram`]s; anything else is rejected. Once the session is closing
    /// the write is dropped and its completion fails with `SessionClosed`.
    pub fn write(&self, msg: Message) -> Result<Completion<()>> {
        let (data, peer) = self.coerce(msg)?;
        let (p, c) = promise();
        self.push_write(data, peer, p);
        Ok(c)
    }

    /// Send a message through the pipeline, tail to head.
    ///
    /// Runs on the owning loop when registered; otherwise runs inline. A
    /// send issued by one of this session's own handlers while unregistered
    /// runs once the current event has finished propagating. If the loop
    /// stops before the task runs the completion is abandoned.
    pub fn send(self: &Arc<Self>, msg: Message) -> Completion<()> {
        let (p, c) = promise();
        match self.dispatcher() {
            Some(shared) => {
                let session = Arc::clone(self);
                let task = Task::Run(Box::new(move || {
                    session.propagate(|| session.pipeline.fire_write(&session, msg, p));
                }));
                if let Err(e) = shared.submit(task) {
                    debug!(session = self.id, error = %e, "Dropping send, loop not running");
                }
            }
            None if self.is_propagating() => {
                trace!(session = self.id, "Deferring send issued during propagation");
                self.lock_deferred().push_back((msg, p));
            }
            None => self.propagate(|| self.pipeline.fire_write(self, msg, p)),
        }
        c
    }

    fn is_propagating(&self) -> bool {
        PROPAGATING.with(|ids| ids.borrow().contains(&self.id))
    }

    /// Run `f` as this thread's propagation for the session, then fire the
    /// sends deferred while it ran. Nested calls just run `f`.
    fn propagate(self: &Arc<Self>, f: impl FnOnce()) {
        if self.is_propagating() {
            f();
            return;
        }
        PROPAGATING.with(|ids| ids.borrow_mut().push(self.id));
        let _propagation = Propagation(self.id);

        f();
        loop {
            let next = self.lock_deferred().pop_front();
            let Some((msg, promise)) = next else {
                break;
            };
            self.pipeline.fire_write(self, msg, promise);
        }
    }

    /// Head of the outbound pipeline.
    pub(crate) fn enqueue(&self, msg: Message, promise: Promise<()>) {
        match self.coerce(msg) {
            Ok((data, peer)) => self.push_write(data, peer, promise),
            Err(e) => {
                debug!(session = self.id, error = %e, "Rejected outbound message");
                promise.fail(e);
            }
        }
    }

    fn coerce(&self, msg: Message) -> Result<(Bytes, Option<SocketAddr>)> {
        match self.kind {
            ChannelKind::Stream => message_bytes(msg)
                .map(|data| (data, None))
                .map_err(|_| Error::invalid("stream sessions accept byte payloads only")),
            ChannelKind::Datagram => msg
                .downcast::<Datagram>()
                .map(|d| (d.payload, Some(d.peer)))
                .map_err(|_| Error::invalid("datagram sessions accept Datagram messages only")),
        }
    }

    fn push_write(&self, data: Bytes, peer: Option<SocketAddr>, promise: Promise<()>) {
        let mut reg = self.lock_registration();
        if self.is_closing() {
            trace!(session = self.id, "Write after close dropped");
            promise.fail(Error::SessionClosed);
            return;
        }
        reg.queue.push_back(PendingWrite {
            data,
            peer,
            promise,
        });
        if self.is_registered() {
            self.request_write_interest(&mut reg);
        }
    }

    fn request_write_interest(&self, reg: &mut Registration) {
        if !reg.write_interest && self.set_interest(reg, Interest::READABLE | Interest::WRITABLE) {
            reg.write_interest = true;
        }
    }

    fn clear_write_interest(&self, reg: &mut Registration) {
        if reg.write_interest && self.set_interest(reg, Interest::READABLE) {
            reg.write_interest = false;
        }
    }

    fn set_interest(&self, reg: &Registration, interest: Interest) -> bool {
        let (Some(fd), Some(token)) = (self.fd, reg.token) else {
            return false;
        };
        let Some(shared) = reg.dispatcher.as_ref().and_then(Weak::upgrade) else {
            return false;
        };
        match shared
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)
        {
            Ok(()) => true,
            Err(e) => {
                debug!(session = self.id, error = %e, "Failed to update interest");
                false
            }
        }
    }

    // ---------------------------------------------------------------------
    // Close
    // ---------------------------------------------------------------------

    /// Begin closing. Idempotent: returns true only for the call that
    /// started the close.
    ///
    /// A registered session drains its write queue first; the socket is
    /// closed when the owning loop unregisters it. A session that was never
    /// registered closes immediately.
    pub fn close(&self) -> bool {
        let mut reg = self.lock_registration();
        match self.begin_close() {
            CloseStep::AlreadyClosing => false,
            CloseStep::ClosedNow => {
                let pending: Vec<_> = reg.queue.drain(..).collect();
                drop(reg);
                self.release_transport();
                for w in pending {
                    w.promise.fail(Error::SessionClosed);
                }
                debug!(session = self.id, "Session closed before registration");
                true
            }
            CloseStep::PendingClose => {
                debug!(session = self.id, "Session pending close");
                if self.is_registered() {
                    self.request_write_interest(&mut reg);
                }
                true
            }
        }
    }

    fn begin_close(&self) -> CloseStep {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let next = match SessionStatus::from_u8(current) {
                SessionStatus::PendingClose | SessionStatus::Closed => {
                    return CloseStep::AlreadyClosing
                }
                SessionStatus::Initial => SessionStatus::Closed,
                SessionStatus::Registering | SessionStatus::Open => SessionStatus::PendingClose,
            };
            match self.status.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if next == SessionStatus::Closed => return CloseStep::ClosedNow,
                Ok(_) => return CloseStep::PendingClose,
                Err(actual) => current = actual,
            }
        }
    }

    /// Move an active session to `PendingClose` without touching interest.
    fn mark_pending_close(&self) {
        let mut current = self.status.load(Ordering::Acquire);
        while matches!(
            SessionStatus::from_u8(current),
            SessionStatus::Registering | SessionStatus::Open
        ) {
            match self.status.compare_exchange(
                current,
                SessionStatus::PendingClose as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(session = self.id, "Session pending close");
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release_transport(&self) {
        let transport = {
            let mut io = self.lock_io();
            io.read_buf = None;
            io.transport.take()
        };
        if let Some(Transport::Stream(stream)) = &transport {
            let _ = stream.shutdown(Shutdown::Both);
        }
        drop(transport);
    }

    /// Ask the owning loop to unregister this session. At most one request
    /// is outstanding.
    fn request_unregister(self: &Arc<Self>) {
        if self.unregister_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.dispatcher() {
            Some(shared) => {
                let task = Task::Unregister(Arc::clone(self), Promise::detached());
                if let Err(e) = shared.submit(task) {
                    debug!(session = self.id, error = %e, "Unregister request dropped");
                }
            }
            None => self.unregister_requested.store(false, Ordering::Release),
        }
    }

    // ---------------------------------------------------------------------
    // Loop-thread callbacks
    // ---------------------------------------------------------------------

    /// Claim the session for registration.
    pub(crate) fn begin_registration(&self) -> Result<()> {
        if self.fd.is_none() {
            return Err(Error::invalid("session has no transport"));
        }
        match self.status.compare_exchange(
            SessionStatus::Initial as u8,
            SessionStatus::Registering as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(actual) => match SessionStatus::from_u8(actual) {
                SessionStatus::Open if !self.is_registered() => Ok(()),
                SessionStatus::PendingClose | SessionStatus::Closed => Err(Error::SessionClosed),
                _ => Err(Error::invalid("session is already registered")),
            },
        }
    }

    /// Undo `begin_registration` after a failed or dropped registration.
    pub(crate) fn abort_registration(&self) {
        if self
            .status
            .compare_exchange(
                SessionStatus::Registering as u8,
                SessionStatus::Initial as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
            && self.is_pending_close()
            && !self.is_registered()
        {
            // Closed while registering and never made it onto a loop.
            let pending: Vec<_> = {
                let mut reg = self.lock_registration();
                self.status
                    .store(SessionStatus::Closed as u8, Ordering::Release);
                reg.queue.drain(..).collect()
            };
            self.release_transport();
            for w in pending {
                w.promise.fail(Error::SessionClosed);
            }
        }
    }

    pub(crate) fn register_with(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let fd = self
            .fd
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session has no transport"))?;
        registry.register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    pub(crate) fn deregister_from(&self, registry: &Registry) -> io::Result<()> {
        match self.fd {
            Some(fd) => registry.deregister(&mut SourceFd(&fd)),
            None => Ok(()),
        }
    }

    pub(crate) fn on_registered(
        self: &Arc<Self>,
        shared: &Arc<LoopShared>,
        token: Token,
        sizing: &AdaptiveRecvSizing,
    ) {
        {
            let mut io = self.lock_io();
            if io.recv.is_none() {
                io.recv = Some(sizing.new_handle());
            }
        }
        {
            let mut reg = self.lock_registration();
            reg.dispatcher = Some(Arc::downgrade(shared));
            reg.token = Some(token);
            reg.write_interest = false;
            self.registered.store(true, Ordering::Release);
            self.unregister_requested.store(false, Ordering::Release);
        }
        debug!(session = self.id, loop_id = shared.id(), token = token.0, "Session registered");

        self.fire_inbound(Inbound::Registered);

        let opened = self
            .status
            .compare_exchange(
                SessionStatus::Registering as u8,
                SessionStatus::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if opened {
            self.fire_inbound(Inbound::Open);
        }

        let mut reg = self.lock_registration();
        let connecting = self.connecting.load(Ordering::Acquire);
        if self.is_pending_close() || connecting || !reg.queue.is_empty() {
            self.request_write_interest(&mut reg);
        }
    }

    pub(crate) fn on_unregistered(self: &Arc<Self>) {
        {
            let mut reg = self.lock_registration();
            reg.dispatcher = None;
            reg.token = None;
            reg.write_interest = false;
            self.registered.store(false, Ordering::Release);
        }
        debug!(session = self.id, "Session unregistered");

        self.fire_inbound(Inbound::Unregistered);

        if !self.is_pending_close() {
            return;
        }

        self.release_transport();
        let pending: Vec<_> = {
            let mut reg = self.lock_registration();
            self.status
                .store(SessionStatus::Closed as u8, Ordering::Release);
            reg.queue.drain(..).collect()
        };
        for w in pending {
            w.promise.fail(Error::SessionClosed);
        }
        debug!(session = self.id, "Session closed");

        if !self.close_fired.swap(true, Ordering::AcqRel) {
            self.fire_inbound(Inbound::Close);
        }
    }

    /// Drain the socket, delivering each chunk to the pipeline.
    pub(crate) fn on_selected_for_read(self: &Arc<Self>, pool: &BufferPool) {
        loop {
            if self.is_closed() {
                return;
            }
            match self.read_once(pool) {
                Ok(ReadStep::Data(msg)) => self.fire_inbound(Inbound::Received(msg)),
                Ok(ReadStep::WouldBlock) => return,
                Ok(ReadStep::Eof) => {
                    debug!(session = self.id, "End of stream");
                    self.mark_pending_close();
                    self.request_unregister();
                    return;
                }
                Err(e) => {
                    self.on_exception_caught(e);
                    return;
                }
            }
        }
    }

    fn read_once(&self, pool: &BufferPool) -> Result<ReadStep> {
        let mut io = self.lock_io();
        let IoState {
            transport,
            recv,
            read_buf,
        } = &mut *io;
        let Some(transport) = transport.as_mut() else {
            return Ok(ReadStep::WouldBlock);
        };
        let recv = recv.get_or_insert_with(|| AdaptiveRecvSizing::default().new_handle());

        // Swapped through the pool only when the predicted size moves.
        let want = recv.guess();
        if read_buf.as_ref().map_or(true, |buf| buf.len() != want) {
            if let Some(old) = read_buf.take() {
                pool.release(old, BufferKind::Direct);
            }
            let mut fresh = recv.allocate(pool)?;
            fresh.resize(want, 0);
            *read_buf = Some(fresh);
        }
        let Some(buf) = read_buf.as_mut() else {
            return Ok(ReadStep::WouldBlock);
        };

        loop {
            let result = match &mut *transport {
                Transport::Stream(s) => s.read(&mut buf[..]).map(|n| (n, None)),
                Transport::Datagram(s) => s.recv_from(&mut buf[..]).map(|(n, peer)| (n, Some(peer))),
            };
            match result {
                Ok((0, None)) => {
                    if let Some(done) = read_buf.take() {
                        pool.release(done, BufferKind::Direct);
                    }
                    return Ok(ReadStep::Eof);
                }
                Ok((n, peer)) => {
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    recv.record(n);
                    trace!(session = self.id, bytes = n, next_guess = recv.guess(), "Read");
                    let msg: Message = match peer {
                        Some(peer) => Box::new(Datagram { peer, payload }),
                        None => Box::new(payload),
                    };
                    return Ok(ReadStep::Data(msg));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStep::WouldBlock);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if let Some(done) = read_buf.take() {
                        pool.release(done, BufferKind::Direct);
                    }
                    return Err(Error::Io(e));
                }
            }
        }
    }

    /// Flush from the head of the queue until it drains or the socket
    /// pushes back.
    pub(crate) fn on_selected_for_write(self: &Arc<Self>) {
        if self.connecting.load(Ordering::Acquire) {
            match self.finish_connect() {
                Ok(true) => {
                    self.connecting.store(false, Ordering::Release);
                    debug!(session = self.id, "Connected");
                }
                Ok(false) => return,
                Err(e) => {
                    self.connecting.store(false, Ordering::Release);
                    self.on_exception_caught(Error::Io(e));
                    return;
                }
            }
        }

        loop {
            if !self.flush() {
                return;
            }
            let mut reg = self.lock_registration();
            if !reg.queue.is_empty() {
                // Queued by another thread after the drain. Interest may
                // already be armed, so no new edge would report it.
                continue;
            }
            if self.is_pending_close() {
                drop(reg);
                self.request_unregister();
            } else {
                self.clear_write_interest(&mut reg);
            }
            return;
        }
    }

    /// Write from the head of the queue. True once the queue is empty;
    /// false when the socket pushed back or failed.
    fn flush(self: &Arc<Self>) -> bool {
        loop {
            let head = {
                let reg = self.lock_registration();
                reg.queue.front().map(|w| (w.data.clone(), w.peer))
            };
            let Some((data, peer)) = head else {
                return true;
            };

            if data.is_empty() {
                self.complete_head(0);
                continue;
            }

            match self.write_once(&data, peer) {
                Ok(0) => {
                    self.on_exception_caught(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                    return false;
                }
                Ok(n) => {
                    trace!(session = self.id, bytes = n, "Wrote");
                    self.complete_head(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.on_exception_caught(Error::Io(e));
                    return false;
                }
            }
        }
    }

    fn write_once(&self, data: &[u8], peer: Option<SocketAddr>) -> io::Result<usize> {
        let mut io = self.lock_io();
        match (io.transport.as_mut(), peer) {
            (Some(Transport::Stream(s)), _) => s.write(data),
            (Some(Transport::Datagram(s)), Some(peer)) => s.send_to(data, peer),
            (Some(Transport::Datagram(_)), None) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram without a peer",
            )),
            (None, _) => Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed")),
        }
    }

    /// Account `written` bytes against the head write, dequeuing it once
    /// nothing is left. A datagram is always consumed whole.
    fn complete_head(&self, written: usize) {
        let mut reg = self.lock_registration();
        let Some(head) = reg.queue.front_mut() else {
            return;
        };
        if head.peer.is_none() && written < head.data.len() {
            head.data.advance(written);
            return;
        }
        if let Some(done) = reg.queue.pop_front() {
            drop(reg);
            done.promise.succeed(());
        }
    }

    fn finish_connect(&self) -> io::Result<bool> {
        let io = self.lock_io();
        match io.transport.as_ref() {
            Some(Transport::Stream(s)) => {
                if let Some(e) = s.take_error()? {
                    return Err(e);
                }
                match s.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(e) => Err(e),
                }
            }
            _ => Ok(true),
        }
    }

    /// Surface a transport failure through the pipeline, then close.
    pub(crate) fn on_exception_caught(self: &Arc<Self>, err: Error) {
        debug!(session = self.id, error = %err, "Session I/O failure");
        self.fire_inbound(Inbound::Exception(err));
        self.mark_pending_close();
        self.request_unregister();
    }

    /// Close whatever is left when the owning loop shuts down.
    pub(crate) fn force_close(self: &Arc<Self>) {
        self.mark_pending_close();
        self.on_unregistered();
    }

    pub(crate) fn fire_inbound(self: &Arc<Self>, event: Inbound) {
        self.propagate(|| self.pipeline.fire_inbound(self, event));
    }

    /// Inject an inbound message as if it had been read from the socket.
    pub(crate) fn fire_message_received(self: &Arc<Self>, msg: Message) {
        self.fire_inbound(Inbound::Received(msg));
    }

    #[cfg(test)]
    pub(crate) fn fire_open(self: &Arc<Self>) {
        self.fire_inbound(Inbound::Open);
    }

    #[cfg(test)]
    pub(crate) fn queued_payloads(&self) -> Vec<Bytes> {
        self.lock_registration()
            .queue
            .iter()
            .map(|w| w.data.clone())
            .collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("registered", &self.is_registered())
            .field("peer", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::pipeline::{Handler, HandlerContext};
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
    use std::thread;
    use std::time::{Duration, Instant};

    fn peer() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9))
    }

    #[test]
    fn test_stream_rejects_non_byte_payloads() {
        let session = Session::detached(ChannelKind::Stream);
        assert!(matches!(
            session.write(Box::new(17u32)),
            Err(Error::InvalidArgument(_))
        ));
        let datagram = Datagram {
            peer: peer(),
            payload: Bytes::from_static(b"x"),
        };
        assert!(session.write(Box::new(datagram)).is_err());
        assert!(session.write(Box::new(Bytes::from_static(b"ok"))).is_ok());
        assert_eq!(session.queued_writes(), 1);
    }

    #[test]
    fn test_datagram_requires_datagram_messages() {
        let session = Session::detached(ChannelKind::Datagram);
        assert!(session.write(Box::new(Bytes::from_static(b"raw"))).is_err());
        let datagram = Datagram {
            peer: peer(),
            payload: Bytes::from_static(b"x"),
        };
        assert!(session.write(Box::new(datagram)).is_ok());
    }

    #[test]
    fn test_queue_preserves_submission_order() {
        let session = Session::detached(ChannelKind::Stream);
        for w in ["w1", "w2", "w3"] {
            session.write(Box::new(w)).unwrap();
        }
        assert_eq!(
            session.queued_payloads(),
            vec![
                Bytes::from_static(b"w1"),
                Bytes::from_static(b"w2"),
                Bytes::from_static(b"w3"),
            ]
        );
    }

    #[test]
    fn test_close_before_registration_is_immediate_and_idempotent() {
        let session = Session::detached(ChannelKind::Stream);
        let pending = session.write(Box::new("queued")).unwrap();

        assert!(session.close());
        assert!(session.is_closed());
        assert!(!session.close());

        assert!(matches!(pending.wait(), Err(Error::SessionClosed)));
        let late = session.write(Box::new("late")).unwrap();
        assert!(matches!(late.wait(), Err(Error::SessionClosed)));
        assert_eq!(session.queued_writes(), 0);
    }

    #[test]
    fn test_detached_session_cannot_register() {
        let session = Session::detached(ChannelKind::Stream);
        assert!(session.begin_registration().is_err());
        assert_eq!(session.status(), SessionStatus::Initial);
    }

    #[test]
    fn test_send_runs_inline_when_unregistered() {
        let session = Session::detached(ChannelKind::Stream);
        let _ = session.send(Box::new(String::from("hello")));
        assert_eq!(session.queued_payloads(), vec![Bytes::from_static(b"hello")]);

        let mut rejected = session.send(Box::new(1u8));
        assert!(matches!(
            rejected.try_take(),
            Some(Err(Error::InvalidArgument(_)))
        ));
    }

    /// Echoes each message back through `Session::send`.
    struct SendBack;

    impl Handler for SendBack {
        fn name(&self) -> &str {
            "send-back"
        }

        fn on_message_received(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<()> {
            let _ = ctx.session().send(msg);
            Ok(())
        }
    }

    #[test]
    fn test_send_from_own_handler_runs_after_the_event() {
        let session = Session::detached(ChannelKind::Stream);
        session.pipeline().add_last(SendBack).unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker = Arc::clone(&session);
        thread::spawn(move || {
            worker.fire_message_received(Box::new(Bytes::from_static(b"hi")));
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("send from inside the pipeline blocked");

        assert_eq!(session.queued_payloads(), vec![Bytes::from_static(b"hi")]);
    }

    fn connected() -> (std::net::TcpStream, Arc<Session>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, Session::from_std_stream(server).unwrap())
    }

    /// First read outcome other than `WouldBlock`.
    fn next_read(session: &Session, pool: &BufferPool) -> ReadStep {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match session.read_once(pool).unwrap() {
                ReadStep::WouldBlock => {
                    assert!(Instant::now() < deadline, "nothing to read");
                    thread::sleep(Duration::from_millis(1));
                }
                step => return step,
            }
        }
    }

    fn read_payload(session: &Session, pool: &BufferPool) -> Bytes {
        match next_read(session, pool) {
            ReadStep::Data(msg) => *msg.downcast::<Bytes>().unwrap(),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn test_read_buffer_is_kept_and_returned_at_end_of_stream() {
        let (mut client, session) = connected();
        let pool = BufferPool::new(4);

        client.write_all(b"hello").unwrap();
        assert_eq!(read_payload(&session, &pool), Bytes::from_static(b"hello"));
        client.write_all(b"again").unwrap();
        assert_eq!(read_payload(&session, &pool), Bytes::from_static(b"again"));
        // Both reads went through the one buffer the session holds.
        assert_eq!(pool.pooled(BufferKind::Direct), 0);

        drop(client);
        assert!(matches!(next_read(&session, &pool), ReadStep::Eof));
        assert_eq!(pool.pooled(BufferKind::Direct), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Session::detached(ChannelKind::Stream);
        let b = Session::detached(ChannelKind::Stream);
        assert_ne!(a.id(), b.id());
    }
}
