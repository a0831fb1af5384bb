//! mio event loop.
//!
//! Readiness-based model: one dedicated thread per loop owns a `mio::Poll`
//! and drains a task queue. Sessions and listeners registered with a loop are
//! driven only from that thread; every other thread talks to the loop by
//! submitting a [`Task`] and waking the poll.
//!
//! Uses epoll on Linux, kqueue on macOS.

use crate::error::{panic_message, Error, Result};
use crate::runtime::buffer::BufferPool;
use crate::runtime::promise::{promise, Completion, Promise};
use crate::runtime::recv_size::AdaptiveRecvSizing;
use crate::runtime::session::Session;
use crate::server::Acceptor;
use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Per-loop tuning.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Readiness events collected per poll.
    pub events_capacity: usize,
    /// Upper bound on one task-drain pass before polling again.
    /// `None` drains until the queue is empty.
    pub task_budget: Option<Duration>,
    /// Receive-size bounds for every session on the loop.
    pub recv_sizing: AdaptiveRecvSizing,
    /// Buffers retained per kind by the loop's pool.
    pub pool_max_pooled: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            events_capacity: 1024,
            task_budget: Some(Duration::from_millis(8)),
            recv_sizing: AdaptiveRecvSizing::default(),
            pool_max_pooled: 256,
        }
    }
}

/// Lifecycle of a loop. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    NotStarted = 0,
    Running = 1,
    Stopped = 2,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::NotStarted,
            1 => LoopState::Running,
            _ => LoopState::Stopped,
        }
    }
}

/// Work executed on the loop thread.
pub(crate) enum Task {
    Register(Arc<Session>, Promise<()>),
    Unregister(Arc<Session>, Promise<()>),
    Listen(Acceptor, Promise<SocketAddr>),
    Run(Box<dyn FnOnce() + Send>),
}

impl Task {
    fn reject(self, err: Error) {
        match self {
            Task::Register(_, p) | Task::Unregister(_, p) => p.fail(err),
            Task::Listen(_, p) => p.fail(err),
            Task::Run(_) => {}
        }
    }
}

/// The half of a loop visible to other threads and to its sessions.
pub(crate) struct LoopShared {
    id: usize,
    registry: Registry,
    waker: Waker,
    tasks: Sender<Task>,
    state: AtomicU8,
    thread: OnceLock<ThreadId>,
}

impl LoopShared {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn in_loop_thread(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    /// Queue a task and wake the poll. A task that cannot be queued has its
    /// promise failed with `NotRunning`.
    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        if self.state() != LoopState::Running {
            task.reject(Error::NotRunning);
            return Err(Error::NotRunning);
        }
        if let Err(e) = self.tasks.send(task) {
            e.into_inner().reject(Error::NotRunning);
            return Err(Error::NotRunning);
        }
        if let Err(e) = self.waker.wake() {
            debug!(loop_id = self.id, error = %e, "Wake failed");
        }
        Ok(())
    }
}

enum Entry {
    Session(Arc<Session>),
    Listener(Acceptor),
}

/// State owned by the loop thread.
struct Worker {
    shared: Arc<LoopShared>,
    poll: Poll,
    events: Events,
    tasks: Receiver<Task>,
    entries: Slab<Entry>,
    pool: Arc<BufferPool>,
    sizing: AdaptiveRecvSizing,
    task_budget: Option<Duration>,
}

impl Worker {
    fn run(mut self, ready: Sender<()>) {
        let _ = self.shared.thread.set(thread::current().id());
        let _ = ready.send(());
        debug!(loop_id = self.shared.id, "Worker started");

        while self.shared.state() == LoopState::Running {
            if let Err(e) = self.turn() {
                error!(loop_id = self.shared.id, error = %e, "Poll failed");
                self.shared
                    .state
                    .store(LoopState::Stopped as u8, Ordering::Release);
                break;
            }
        }

        self.shutdown();
    }

    /// One poll, its readiness callbacks, then one task-drain pass.
    fn turn(&mut self) -> io::Result<()> {
        let timeout = if self.tasks.is_empty() {
            None
        } else {
            Some(Duration::ZERO)
        };
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token(),
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable() || event.is_write_closed(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            if token != WAKER_TOKEN {
                self.dispatch(token, readable, writable);
            }
        }

        self.run_tasks();
        Ok(())
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let accepted = match self.entries.get(token.0) {
            Some(Entry::Listener(acceptor)) if readable => acceptor.accept_ready(),
            Some(Entry::Session(session)) => {
                let session = Arc::clone(session);
                if readable {
                    session.on_selected_for_read(&self.pool);
                }
                if writable && session.is_registered() {
                    session.on_selected_for_write();
                }
                return;
            }
            _ => return,
        };

        for session in accepted {
            if let Err(e) = self.register_session(Arc::clone(&session)) {
                debug!(loop_id = self.shared.id, session = session.id(), error = %e, "Failed to register accepted session");
                session.close();
            }
        }
    }

    fn run_tasks(&mut self) {
        let deadline = self.task_budget.map(|budget| Instant::now() + budget);
        while self.shared.state() == LoopState::Running {
            let Ok(task) = self.tasks.try_recv() else {
                break;
            };
            self.run_task(task);
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
        }
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::Register(session, p) => p.complete(self.register_session(session)),
            Task::Unregister(session, p) => p.complete(self.unregister_session(&session)),
            Task::Listen(acceptor, p) => self.listen(acceptor, p),
            Task::Run(f) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                    error!(
                        loop_id = self.shared.id,
                        panic = %panic_message(payload),
                        "Task panicked"
                    );
                }
            }
        }
    }

    fn register_session(&mut self, session: Arc<Session>) -> Result<()> {
        session.begin_registration()?;

        let entry = self.entries.vacant_entry();
        let token = Token(entry.key());
        if let Err(e) = session.register_with(self.poll.registry(), token) {
            session.abort_registration();
            return Err(e.into());
        }
        entry.insert(Entry::Session(Arc::clone(&session)));

        session.on_registered(&self.shared, token, &self.sizing);
        Ok(())
    }

    fn unregister_session(&mut self, session: &Arc<Session>) -> Result<()> {
        let Some(token) = session.token() else {
            return Ok(());
        };
        match self.entries.get(token.0) {
            Some(Entry::Session(s)) if Arc::ptr_eq(s, session) => {
                self.entries.remove(token.0);
            }
            _ => return Err(Error::invalid("session is not registered with this loop")),
        }
        if let Err(e) = session.deregister_from(self.poll.registry()) {
            debug!(loop_id = self.shared.id, session = session.id(), error = %e, "Deregister failed");
        }
        session.on_unregistered();
        Ok(())
    }

    fn listen(&mut self, mut acceptor: Acceptor, p: Promise<SocketAddr>) {
        let entry = self.entries.vacant_entry();
        let token = Token(entry.key());
        match self
            .poll
            .registry()
            .register(acceptor.source(), token, Interest::READABLE)
        {
            Ok(()) => {
                let addr = acceptor.local_addr();
                entry.insert(Entry::Listener(acceptor));
                info!(loop_id = self.shared.id, addr = %addr, "Listening");
                p.succeed(addr);
            }
            Err(e) => p.fail(e.into()),
        }
    }

    fn shutdown(mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            task.reject(Error::NotRunning);
        }

        let entries: Vec<Entry> = self.entries.drain().collect();
        for entry in entries {
            match entry {
                Entry::Session(session) => {
                    if let Err(e) = session.deregister_from(self.poll.registry()) {
                        debug!(loop_id = self.shared.id, session = session.id(), error = %e, "Deregister failed");
                    }
                    session.force_close();
                }
                Entry::Listener(mut acceptor) => {
                    let _ = self.poll.registry().deregister(acceptor.source());
                }
            }
        }

        info!(loop_id = self.shared.id, "Event loop stopped");
    }
}

/// A single-threaded reactor.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    pool: Arc<BufferPool>,
    worker: Mutex<Option<Worker>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Create a loop with its own buffer pool.
    pub fn new(id: usize, config: &LoopConfig) -> Result<Self> {
        let pool = Arc::new(BufferPool::new(config.pool_max_pooled));
        Self::with_pool(id, config, pool)
    }

    /// Create a loop that draws read buffers from `pool`, which may be
    /// shared with other loops.
    pub fn with_pool(id: usize, config: &LoopConfig, pool: Arc<BufferPool>) -> Result<Self> {
        if config.events_capacity == 0 {
            return Err(Error::invalid("events_capacity must be positive"));
        }

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (tx, rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(LoopShared {
            id,
            registry,
            waker,
            tasks: tx,
            state: AtomicU8::new(LoopState::NotStarted as u8),
            thread: OnceLock::new(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            poll,
            events: Events::with_capacity(config.events_capacity),
            tasks: rx,
            entries: Slab::new(),
            pool: Arc::clone(&pool),
            sizing: config.recv_sizing,
            task_budget: config.task_budget,
        };

        Ok(Self {
            shared,
            pool,
            worker: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// True when called from this loop's worker thread.
    pub fn in_loop_thread(&self) -> bool {
        self.shared.in_loop_thread()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the worker thread and wait until it is running.
    pub fn start(&self) -> Result<()> {
        if self
            .shared
            .state
            .compare_exchange(
                LoopState::NotStarted as u8,
                LoopState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        let Some(worker) = self.lock_worker().take() else {
            return Err(Error::AlreadyStarted);
        };

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let spawned = thread::Builder::new()
            .name(format!("reactor-{}", self.shared.id))
            .spawn(move || worker.run(ready_tx));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared
                    .state
                    .store(LoopState::Stopped as u8, Ordering::Release);
                return Err(e.into());
            }
        };

        let started = ready_rx.recv().is_ok();
        *self.lock_handle() = Some(handle);
        if !started {
            self.shared
                .state
                .store(LoopState::Stopped as u8, Ordering::Release);
            return Err(Error::NotRunning);
        }

        info!(loop_id = self.shared.id, "Event loop started");
        Ok(())
    }

    /// Stop the loop and wait for the worker to exit.
    ///
    /// Pending registrations fail with `NotRunning`, registered sessions are
    /// closed, and listeners are dropped. When called from the loop thread
    /// itself the worker exits after the current task returns.
    pub fn stop(&self) {
        let previous = LoopState::from_u8(
            self.shared
                .state
                .swap(LoopState::Stopped as u8, Ordering::AcqRel),
        );
        match previous {
            LoopState::NotStarted => {
                self.lock_worker().take();
                return;
            }
            LoopState::Stopped => {}
            LoopState::Running => {
                if let Err(e) = self.shared.waker.wake() {
                    debug!(loop_id = self.shared.id, error = %e, "Wake failed");
                }
            }
        }

        if self.in_loop_thread() {
            return;
        }

        let handle = self.lock_handle().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(loop_id = self.shared.id, "Worker thread panicked");
            }
        }
    }

    /// Run `f` on the loop thread after every previously scheduled task.
    pub fn schedule<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(Task::Run(Box::new(f)))
    }

    /// Register a session. Completes once the session is open on this loop.
    pub fn register(&self, session: &Arc<Session>) -> Completion<()> {
        let (p, c) = promise();
        let _ = self
            .shared
            .submit(Task::Register(Arc::clone(session), p));
        c
    }

    /// Unregister a session. A pending-close session is closed as a result.
    pub fn unregister(&self, session: &Arc<Session>) -> Completion<()> {
        let (p, c) = promise();
        let _ = self
            .shared
            .submit(Task::Unregister(Arc::clone(session), p));
        c
    }

    pub(crate) fn listen(&self, acceptor: Acceptor) -> Completion<SocketAddr> {
        let (p, c) = promise();
        let _ = self.shared.submit(Task::Listen(acceptor, p));
        c
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// A fixed set of loops handed out round-robin.
#[derive(Debug)]
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    pub fn new(count: usize, config: &LoopConfig) -> Result<Self> {
        if count == 0 {
            return Err(Error::invalid("a loop group needs at least one loop"));
        }
        let loops = (0..count)
            .map(|id| EventLoop::new(id, config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    pub fn start_all(&self) -> Result<()> {
        for event_loop in &self.loops {
            event_loop.start()?;
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for event_loop in &self.loops {
            event_loop.stop();
        }
    }

    /// The next loop in round-robin order.
    pub fn next(&self) -> &EventLoop {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[i]
    }

    pub fn loops(&self) -> &[EventLoop] {
        &self.loops
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Open a client session to `addr`, let `init` populate its pipeline,
    /// and register it on the next loop.
    pub fn connect<F>(&self, addr: SocketAddr, init: F) -> Result<(Arc<Session>, Completion<()>)>
    where
        F: FnOnce(&Arc<Session>) -> Result<()>,
    {
        let session = Session::connect(addr)?;
        init(&session)?;
        let registered = self.next().register(&session);
        Ok((session, registered))
    }
}
