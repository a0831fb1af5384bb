//! Per-session handler pipeline.
//!
//! A pipeline is an ordered list of named handler stages. Inbound events
//! (`registered`, `open`, `message-received`, `exception`, `close`,
//! `unregistered`) travel head to tail; outbound writes travel tail to head
//! and end in the session's write queue.
//!
//! ```text
//!  socket ──read──▶ [head] A ─▶ B ─▶ C [tail] ──▶ dropped / logged
//!  socket ◀─queue── [head] A ◀─ B ◀─ C [tail] ◀── Session::send
//! ```
//!
//! Every [`Handler`] method has a default that forwards the event, so a
//! handler implements only the capabilities it cares about. Propagation
//! works on a snapshot of the stage list: adding or removing a handler while
//! an event is in flight affects the next event, not the current one.
//!
//! A handler that returns an error (or panics) turns the event into an
//! exception event that starts at that same handler.

use crate::error::{panic_message, Error, Result};
use crate::runtime::promise::{promise, Completion, Promise};
use crate::runtime::session::Session;
use bytes::{Bytes, BytesMut};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{trace, warn};

/// A value travelling through a pipeline.
///
/// Transports produce and consume byte payloads (`Bytes`) or
/// [`Datagram`](crate::runtime::session::Datagram)s; handlers in between may
/// turn them into any `Send` type.
pub type Message = Box<dyn Any + Send>;

/// Extract a byte payload from a message, handing the message back when it
/// holds something else.
pub fn message_bytes(msg: Message) -> std::result::Result<Bytes, Message> {
    let msg = match msg.downcast::<Bytes>() {
        Ok(b) => return Ok(*b),
        Err(m) => m,
    };
    let msg = match msg.downcast::<BytesMut>() {
        Ok(b) => return Ok(b.freeze()),
        Err(m) => m,
    };
    let msg = match msg.downcast::<Vec<u8>>() {
        Ok(v) => return Ok(Bytes::from(*v)),
        Err(m) => m,
    };
    let msg = match msg.downcast::<String>() {
        Ok(s) => return Ok(Bytes::from(*s)),
        Err(m) => m,
    };
    let msg = match msg.downcast::<&'static [u8]>() {
        Ok(s) => return Ok(Bytes::from_static(*s)),
        Err(m) => m,
    };
    match msg.downcast::<&'static str>() {
        Ok(s) => Ok(Bytes::from_static(s.as_bytes())),
        Err(m) => Err(m),
    }
}

/// Event capabilities of a pipeline stage.
///
/// All methods default to forwarding the event unchanged.
pub trait Handler: Send + 'static {
    /// Unique name of this stage within its pipeline.
    fn name(&self) -> &str;

    fn on_registered(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        ctx.fire_registered();
        Ok(())
    }

    fn on_open(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        ctx.fire_open();
        Ok(())
    }

    fn on_message_received(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<()> {
        ctx.fire_message_received(msg);
        Ok(())
    }

    /// Outbound write. `promise` resolves once the bytes this message turns
    /// into have been flushed to the transport.
    fn on_message_sent(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: Message,
        promise: Promise<()>,
    ) -> Result<()> {
        ctx.write_with(msg, promise);
        Ok(())
    }

    fn on_exception_caught(&mut self, ctx: &mut HandlerContext<'_>, err: Error) -> Result<()> {
        ctx.fire_exception_caught(err);
        Ok(())
    }

    fn on_close(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        ctx.fire_close();
        Ok(())
    }

    fn on_unregistered(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        ctx.fire_unregistered();
        Ok(())
    }
}

/// Inbound events.
pub(crate) enum Inbound {
    Registered,
    Open,
    Received(Message),
    Exception(Error),
    Close,
    Unregistered,
}

impl Inbound {
    fn label(&self) -> &'static str {
        match self {
            Inbound::Registered => "registered",
            Inbound::Open => "open",
            Inbound::Received(_) => "message-received",
            Inbound::Exception(_) => "exception",
            Inbound::Close => "close",
            Inbound::Unregistered => "unregistered",
        }
    }
}

/// What a handler asked for while it ran.
///
/// The context only records; the pipeline acts on the records after the
/// handler returns, so no stage lock is held while another stage runs.
pub struct HandlerContext<'a> {
    session: &'a Arc<Session>,
    name: &'a str,
    forwarded: Vec<Inbound>,
    writes: Vec<(Message, Promise<()>)>,
    close_requested: bool,
}

impl<'a> HandlerContext<'a> {
    fn new(session: &'a Arc<Session>, name: &'a str) -> Self {
        Self {
            session,
            name,
            forwarded: Vec::new(),
            writes: Vec::new(),
            close_requested: false,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.session
    }

    pub fn pipeline(&self) -> &Pipeline {
        self.session.pipeline()
    }

    /// Name of the stage this context belongs to.
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn fire_registered(&mut self) {
        self.forwarded.push(Inbound::Registered);
    }

    pub fn fire_open(&mut self) {
        self.forwarded.push(Inbound::Open);
    }

    pub fn fire_message_received(&mut self, msg: Message) {
        self.forwarded.push(Inbound::Received(msg));
    }

    pub fn fire_exception_caught(&mut self, err: Error) {
        self.forwarded.push(Inbound::Exception(err));
    }

    pub fn fire_close(&mut self) {
        self.forwarded.push(Inbound::Close);
    }

    pub fn fire_unregistered(&mut self) {
        self.forwarded.push(Inbound::Unregistered);
    }

    /// Write toward the head, starting at the stage before this one.
    pub fn write(&mut self, msg: Message) -> Completion<()> {
        let (p, c) = promise();
        self.writes.push((msg, p));
        c
    }

    pub fn write_with(&mut self, msg: Message, promise: Promise<()>) {
        self.writes.push((msg, promise));
    }

    /// Close the session once this handler's writes have been queued.
    pub fn close(&mut self) {
        self.close_requested = true;
    }
}

struct Stage {
    name: String,
    handler: Mutex<Box<dyn Handler>>,
}

impl Stage {
    fn lock(&self) -> MutexGuard<'_, Box<dyn Handler>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Stages = Arc<Vec<Arc<Stage>>>;

/// Ordered handler chain owned by one session.
pub struct Pipeline {
    stages: Mutex<Stages>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            stages: Mutex::new(Arc::new(Vec::new())),
        }
    }

    fn snapshot(&self) -> Stages {
        Arc::clone(&self.stages.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Copy-on-write mutation of the stage list.
    fn mutate<F>(&self, f: F) -> Result<&Self>
    where
        F: FnOnce(&mut Vec<Arc<Stage>>) -> Result<()>,
    {
        let mut guard = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<Arc<Stage>> = guard.as_ref().clone();
        f(&mut next)?;
        *guard = Arc::new(next);
        Ok(self)
    }

    fn make_stage(stages: &[Arc<Stage>], handler: Box<dyn Handler>) -> Result<Arc<Stage>> {
        let name = handler.name().to_string();
        if stages.iter().any(|s| s.name == name) {
            return Err(Error::invalid(format!("duplicate handler name: {name}")));
        }
        Ok(Arc::new(Stage {
            name,
            handler: Mutex::new(handler),
        }))
    }

    fn position(stages: &[Arc<Stage>], name: &str) -> Result<usize> {
        stages
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::invalid(format!("no handler named {name}")))
    }

    pub fn add_first(&self, handler: impl Handler) -> Result<&Self> {
        self.mutate(|stages| {
            let stage = Self::make_stage(stages, Box::new(handler))?;
            stages.insert(0, stage);
            Ok(())
        })
    }

    pub fn add_last(&self, handler: impl Handler) -> Result<&Self> {
        self.mutate(|stages| {
            let stage = Self::make_stage(stages, Box::new(handler))?;
            stages.push(stage);
            Ok(())
        })
    }

    pub fn add_before(&self, base: &str, handler: impl Handler) -> Result<&Self> {
        self.mutate(|stages| {
            let idx = Self::position(stages, base)?;
            let stage = Self::make_stage(stages, Box::new(handler))?;
            stages.insert(idx, stage);
            Ok(())
        })
    }

    pub fn add_after(&self, base: &str, handler: impl Handler) -> Result<&Self> {
        self.mutate(|stages| {
            let idx = Self::position(stages, base)?;
            let stage = Self::make_stage(stages, Box::new(handler))?;
            stages.insert(idx + 1, stage);
            Ok(())
        })
    }

    pub fn remove(&self, name: &str) -> Result<&Self> {
        self.mutate(|stages| {
            let idx = Self::position(stages, name)?;
            stages.remove(idx);
            Ok(())
        })
    }

    /// Stage names, head first.
    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire an inbound event at the head.
    pub(crate) fn fire_inbound(&self, session: &Arc<Session>, event: Inbound) {
        let stages = self.snapshot();
        run_inbound(session, &stages, 0, event);
    }

    /// Fire an outbound write at the tail.
    pub(crate) fn fire_write(&self, session: &Arc<Session>, msg: Message, promise: Promise<()>) {
        let stages = self.snapshot();
        let tail = stages.len();
        run_outbound(session, &stages, tail, msg, promise);
    }
}

fn dispatch(handler: &mut dyn Handler, ctx: &mut HandlerContext<'_>, event: Inbound) -> Result<()> {
    match event {
        Inbound::Registered => handler.on_registered(ctx),
        Inbound::Open => handler.on_open(ctx),
        Inbound::Received(msg) => handler.on_message_received(ctx, msg),
        Inbound::Exception(err) => handler.on_exception_caught(ctx, err),
        Inbound::Close => handler.on_close(ctx),
        Inbound::Unregistered => handler.on_unregistered(ctx),
    }
}

/// Run `f` against one stage, turning a panic into an error.
fn invoke<F>(stage: &Stage, f: F) -> Result<()>
where
    F: FnOnce(&mut dyn Handler) -> Result<()>,
{
    let mut guard = stage.lock();
    panic::catch_unwind(AssertUnwindSafe(|| f(guard.as_mut())))
        .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload))))
}

/// Depth-first inbound propagation starting at stage `start`.
fn run_inbound(session: &Arc<Session>, stages: &[Arc<Stage>], start: usize, event: Inbound) {
    let mut stack = vec![(start, event)];

    while let Some((idx, event)) = stack.pop() {
        let Some(stage) = stages.get(idx) else {
            reached_tail(session, event);
            continue;
        };

        let was_exception = matches!(event, Inbound::Exception(_));
        let mut ctx = HandlerContext::new(session, &stage.name);
        trace!(session = session.id(), handler = %stage.name, event = event.label(), "inbound");
        let result = invoke(stage, |h| dispatch(h, &mut ctx, event));

        let HandlerContext {
            forwarded,
            writes,
            close_requested,
            ..
        } = ctx;

        for (msg, promise) in writes {
            run_outbound(session, stages, idx, msg, promise);
        }
        if close_requested {
            session.close();
        }

        if let Err(err) = result {
            // An exception handler that fails passes its error on instead of
            // looping on itself.
            let at = if was_exception { idx + 1 } else { idx };
            stack.push((at, Inbound::Exception(err)));
        }
        for event in forwarded.into_iter().rev() {
            stack.push((idx + 1, event));
        }
    }
}

/// Outbound propagation through the stages before `end`, then into the
/// session's write queue.
fn run_outbound(
    session: &Arc<Session>,
    stages: &[Arc<Stage>],
    end: usize,
    msg: Message,
    promise: Promise<()>,
) {
    let Some(idx) = end.checked_sub(1) else {
        session.enqueue(msg, promise);
        return;
    };
    let stage = &stages[idx];

    let mut ctx = HandlerContext::new(session, &stage.name);
    trace!(session = session.id(), handler = %stage.name, event = "write", "outbound");
    let result = invoke(stage, |h| h.on_message_sent(&mut ctx, msg, promise));

    let HandlerContext {
        forwarded,
        writes,
        close_requested,
        ..
    } = ctx;

    // Depth is bounded by the number of stages.
    for (msg, promise) in writes {
        run_outbound(session, stages, idx, msg, promise);
    }
    for event in forwarded {
        run_inbound(session, stages, idx + 1, event);
    }
    if close_requested {
        session.close();
    }
    if let Err(err) = result {
        run_inbound(session, stages, idx, Inbound::Exception(err));
    }
}

fn reached_tail(session: &Arc<Session>, event: Inbound) {
    match event {
        Inbound::Received(_) => {
            trace!(session = session.id(), "message reached the pipeline tail unhandled");
        }
        Inbound::Exception(err) => {
            warn!(session = session.id(), error = %err, "unhandled exception reached the pipeline tail");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::session::ChannelKind;

    type Log = Arc<Mutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// Records every event it sees, then forwards it.
    struct Recorder {
        name: &'static str,
        log: Log,
    }

    impl Handler for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn on_open(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:open", self.name));
            ctx.fire_open();
            Ok(())
        }

        fn on_message_received(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:read", self.name));
            ctx.fire_message_received(msg);
            Ok(())
        }

        fn on_message_sent(
            &mut self,
            ctx: &mut HandlerContext<'_>,
            msg: Message,
            promise: Promise<()>,
        ) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:write", self.name));
            ctx.write_with(msg, promise);
            Ok(())
        }

        fn on_exception_caught(&mut self, ctx: &mut HandlerContext<'_>, err: Error) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:exception:{}", self.name, err));
            ctx.fire_exception_caught(err);
            Ok(())
        }
    }

    fn recorder(name: &'static str, log: &Log) -> Recorder {
        Recorder {
            name,
            log: Arc::clone(log),
        }
    }

    /// Implements nothing; every event passes straight through.
    struct Passive;

    impl Handler for Passive {
        fn name(&self) -> &str {
            "passive"
        }
    }

    /// Fails on every read.
    struct Failing;

    impl Handler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_message_received(&mut self, _ctx: &mut HandlerContext<'_>, _msg: Message) -> Result<()> {
            Err(Error::Decode("bad frame".into()))
        }
    }

    /// Upper-cases string reads and answers them.
    struct Shout;

    impl Handler for Shout {
        fn name(&self) -> &str {
            "shout"
        }

        fn on_message_received(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<()> {
            match msg.downcast::<String>() {
                Ok(s) => {
                    ctx.write(Box::new(s.to_uppercase()));
                }
                Err(other) => ctx.fire_message_received(other),
            }
            Ok(())
        }
    }

    #[test]
    fn test_inbound_head_to_tail_outbound_tail_to_head() {
        let session = Session::detached(ChannelKind::Stream);
        let log = log();
        session
            .pipeline()
            .add_last(recorder("a", &log))
            .unwrap()
            .add_last(recorder("b", &log))
            .unwrap()
            .add_last(recorder("c", &log))
            .unwrap();

        session.fire_message_received(Box::new(Bytes::from_static(b"x")));
        session.pipeline().fire_write(
            &session,
            Box::new(Bytes::from_static(b"y")),
            Promise::detached(),
        );

        assert_eq!(
            entries(&log),
            vec!["a:read", "b:read", "c:read", "c:write", "b:write", "a:write"]
        );
        assert_eq!(session.queued_writes(), 1);
    }

    #[test]
    fn test_unimplemented_capabilities_are_skipped() {
        let session = Session::detached(ChannelKind::Stream);
        let log = log();
        session
            .pipeline()
            .add_last(Passive)
            .unwrap()
            .add_last(recorder("tail", &log))
            .unwrap();

        session.fire_open();
        session.fire_message_received(Box::new(Bytes::new()));
        assert_eq!(entries(&log), vec!["tail:open", "tail:read"]);
    }

    #[test]
    fn test_handler_error_becomes_exception_at_same_stage() {
        let session = Session::detached(ChannelKind::Stream);
        let log = log();
        session
            .pipeline()
            .add_last(recorder("a", &log))
            .unwrap()
            .add_last(Failing)
            .unwrap()
            .add_last(recorder("c", &log))
            .unwrap();

        session.fire_message_received(Box::new(Bytes::new()));

        // `a` saw the read, `failing` swallowed it, `c` only sees the
        // exception that started at `failing`.
        assert_eq!(
            entries(&log),
            vec!["a:read", "c:exception:decode failed: bad frame"]
        );
    }

    #[test]
    fn test_write_from_inbound_handler_skips_later_stages() {
        let session = Session::detached(ChannelKind::Stream);
        let log = log();
        session
            .pipeline()
            .add_last(recorder("a", &log))
            .unwrap()
            .add_last(Shout)
            .unwrap()
            .add_last(recorder("c", &log))
            .unwrap();

        session.fire_message_received(Box::new(String::from("hi")));

        assert_eq!(entries(&log), vec!["a:read", "a:write"]);
        assert_eq!(session.queued_payloads(), vec![Bytes::from_static(b"HI")]);
    }

    #[test]
    fn test_relative_insertion_and_removal() {
        let pipeline = Pipeline::new();
        let log = log();
        pipeline.add_last(recorder("b", &log)).unwrap();
        pipeline.add_first(recorder("a", &log)).unwrap();
        pipeline.add_after("b", recorder("d", &log)).unwrap();
        pipeline.add_before("d", recorder("c", &log)).unwrap();
        assert_eq!(pipeline.names(), vec!["a", "b", "c", "d"]);

        assert!(pipeline.add_last(recorder("a", &log)).is_err());
        assert!(pipeline.add_before("missing", recorder("e", &log)).is_err());

        pipeline.remove("b").unwrap();
        assert_eq!(pipeline.names(), vec!["a", "c", "d"]);
        assert!(pipeline.remove("b").is_err());
        assert_eq!(pipeline.len(), 3);
    }

    /// Appends a recorder the first time it sees a read.
    struct Installer {
        log: Log,
        installed: bool,
    }

    impl Handler for Installer {
        fn name(&self) -> &str {
            "installer"
        }

        fn on_message_received(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) -> Result<()> {
            if !self.installed {
                self.installed = true;
                ctx.pipeline().add_last(recorder("late", &self.log))?;
            }
            ctx.fire_message_received(msg);
            Ok(())
        }
    }

    #[test]
    fn test_mutation_applies_to_next_event_only() {
        let session = Session::detached(ChannelKind::Stream);
        let log = log();
        session
            .pipeline()
            .add_last(Installer {
                log: Arc::clone(&log),
                installed: false,
            })
            .unwrap();

        session.fire_message_received(Box::new(Bytes::new()));
        assert!(entries(&log).is_empty());

        session.fire_message_received(Box::new(Bytes::new()));
        assert_eq!(entries(&log), vec!["late:read"]);
    }

    struct Panicky;

    impl Handler for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn on_open(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
            panic!("boom");
        }
    }

    #[test]
    fn test_panic_is_reported_as_exception() {
        let session = Session::detached(ChannelKind::Stream);
        let log = log();
        session
            .pipeline()
            .add_last(Panicky)
            .unwrap()
            .add_last(recorder("after", &log))
            .unwrap();

        session.fire_open();
        assert_eq!(entries(&log), vec!["after:exception:panicked: boom"]);
    }

    #[test]
    fn test_message_bytes_accepts_byte_like_payloads() {
        assert_eq!(
            message_bytes(Box::new(vec![1u8, 2])).unwrap(),
            Bytes::from_static(&[1, 2])
        );
        assert_eq!(
            message_bytes(Box::new("ab")).unwrap(),
            Bytes::from_static(b"ab")
        );
        assert!(message_bytes(Box::new(42u32)).is_err());
    }
}
