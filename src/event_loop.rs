use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{NetConfig, RunMode};
use crate::envelope::Envelope;
use crate::message::{Message, MessageCodec};
use crate::transport::frame::{FrameWriter, LENGTH_PREFIX_LEN};
use crate::transport::rudp::endpoint::UdpEndpoint;


/// The single-threaded reactor that drives all networking.
///
/// Sockets, timers and peers must be created with the reactor entered, i.e. inside
///  [EventLoop::enter] or inside a callback that runs on the loop. They must not be touched from
///  other threads; use a [crate::dispatcher::DispatchHandle] for that.
pub struct EventLoop {
    ctx: Rc<LoopContext>,
    local: LocalSet,
    runtime: Runtime,
}

impl EventLoop {
    pub fn new(config: NetConfig, codec: Rc<dyn MessageCodec>) -> anyhow::Result<EventLoop> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Self::with_runtime(config, codec, runtime)
    }

    /// Uses a caller-provided runtime, which must be a current-thread runtime with I/O and time
    ///  enabled. This is mainly useful for tests that run on a paused clock.
    pub fn with_runtime(config: NetConfig, codec: Rc<dyn MessageCodec>, runtime: Runtime) -> anyhow::Result<EventLoop> {
        config.validate()?;

        let epoch = {
            let _guard = runtime.enter();
            Instant::now()
        };

        let frame_writer = RefCell::new(FrameWriter::new(config.recv_buf_len));
        let recv_scratch = RefCell::new(BytesMut::with_capacity(config.recv_buf_len));

        let ctx = Rc::new(LoopContext {
            config,
            codec,
            epoch,
            run_mode: Cell::new(RunMode::Default),
            stop_requested: Cell::new(false),
            active_handles: Cell::new(0),
            state_changed: Notify::new(),
            auto_id: Cell::new(0),
            udp_registry: Default::default(),
            frame_writer,
            recv_scratch,
        });

        Ok(EventLoop {
            ctx,
            local: LocalSet::new(),
            runtime,
        })
    }

    pub fn context(&self) -> Rc<LoopContext> {
        self.ctx.clone()
    }

    /// Runs setup code with the reactor entered, so it can bind sockets and start timers.
    pub fn enter<R>(&self, f: impl FnOnce(&Rc<LoopContext>) -> R) -> R {
        let _runtime_guard = self.runtime.enter();
        let _local_guard = self.local.enter();
        f(&self.ctx)
    }

    pub fn run(&self, mode: RunMode) -> anyhow::Result<()> {
        self.ctx.run_mode.set(mode);
        self.ctx.stop_requested.set(false);

        match mode {
            RunMode::Default => {
                let ctx = self.ctx.clone();
                self.local.block_on(&self.runtime, async move {
                    while !ctx.stop_requested.get() && ctx.active_handles.get() > 0 {
                        ctx.state_changed.notified().await;
                    }
                });
                debug!("event loop finished, {} active handles", self.ctx.active_handles.get());
            }
            RunMode::NoWait => {
                self.local.block_on(&self.runtime, tokio::task::yield_now());
            }
        }
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // give tasks of already closed handles a chance to finish before their resources go away
        self.local.block_on(&self.runtime, tokio::task::yield_now());
        self.ctx.udp_registry.borrow_mut().clear();
    }
}

impl Debug for EventLoop {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventLoop{{active_handles:{}}}", self.ctx.active_handles.get())
    }
}


/// Loop-wide state shared by everything that runs on the loop.
pub struct LoopContext {
    config: NetConfig,
    codec: Rc<dyn MessageCodec>,
    epoch: Instant,
    run_mode: Cell<RunMode>,
    stop_requested: Cell<bool>,
    active_handles: Cell<usize>,
    state_changed: Notify,
    auto_id: Cell<i32>,
    /// Shared UDP sockets: listeners are keyed by their port, dialers by a negative auto id
    udp_registry: RefCell<FxHashMap<i32, Weak<UdpEndpoint>>>,
    frame_writer: RefCell<FrameWriter>,
    recv_scratch: RefCell<BytesMut>,
}

impl LoopContext {
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn codec(&self) -> &Rc<dyn MessageCodec> {
        &self.codec
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode.get()
    }

    /// Requests [EventLoop::run] to return as soon as control gets back to the loop.
    pub fn stop(&self) {
        self.stop_requested.set(true);
        self.state_changed.notify_one();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.get()
    }

    /// Monotonic milliseconds since the loop was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn active_handles(&self) -> usize {
        self.active_handles.get()
    }

    /// Returns the next local dialer id. These ids are negative so they can never collide with
    ///  listener ports in the UDP registry.
    pub fn next_auto_id(&self) -> i32 {
        let mut id = self.auto_id.get().wrapping_sub(1);
        if id >= 0 {
            id = -1;
        }
        self.auto_id.set(id);
        id
    }

    pub(crate) fn register_udp(&self, id: i32, endpoint: &Rc<UdpEndpoint>) {
        trace!("registering UDP socket {}", id);
        self.udp_registry.borrow_mut()
            .insert(id, Rc::downgrade(endpoint));
    }

    pub(crate) fn lookup_udp(&self, id: i32) -> Option<Rc<UdpEndpoint>> {
        self.udp_registry.borrow()
            .get(&id)
            .and_then(|w| w.upgrade())
    }

    /// Removes a registry entry, but only if it no longer refers to a live socket.
    pub(crate) fn unregister_udp(&self, id: i32) {
        let mut registry = self.udp_registry.borrow_mut();
        if registry.get(&id).is_some_and(|w| w.strong_count() == 0) {
            trace!("unregistering UDP socket {}", id);
            registry.remove(&id);
        }
    }

    /// Serializes an envelope with the given correlation id followed by the message into a
    ///  complete stream frame, using the loop's shared encode buffer. Frames the receiving side
    ///  would reject as too long are refused here already.
    pub fn encode(&self, correlation_id: i32, msg: &dyn Message) -> anyhow::Result<Bytes> {
        let mut writer = self.frame_writer.try_borrow_mut()
            .map_err(|_| anyhow!("encoding is not reentrant"))?;

        let frame = writer.write_frame(|buf| {
            Envelope::new(correlation_id).write(buf);
            msg.serialize(buf);
        })?;
        let payload_len = frame.len() - LENGTH_PREFIX_LEN;
        if payload_len > self.config.max_frame_len {
            bail!("frame of {} bytes exceeds maximum of {}", payload_len, self.config.max_frame_len);
        }
        Ok(frame)
    }

    /// Decodes a frame's payload into its envelope and message.
    pub fn decode(&self, payload: &[u8]) -> anyhow::Result<(Envelope, Box<dyn Message>)> {
        let mut buf = payload;
        let envelope = Envelope::try_read(&mut buf)?;
        let msg = self.codec.deserialize(buf)?;
        Ok((envelope, msg))
    }

    /// Lends the loop's shared receive buffer. It is empty when handed out and cleared afterwards.
    pub(crate) fn with_recv_scratch<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        let mut scratch = self.recv_scratch.borrow_mut();
        scratch.clear();
        let result = f(&mut scratch);
        scratch.clear();
        result
    }

    fn handle_count_changed(&self) {
        self.state_changed.notify_one();
    }
}

impl Debug for LoopContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoopContext{{run_mode:{:?}, active_handles:{}}}", self.run_mode.get(), self.active_handles.get())
    }
}


/// Keeps [EventLoop::run] in [RunMode::Default] from returning for as long as it exists.
pub struct ActiveHandle {
    ctx: Weak<LoopContext>,
}

impl ActiveHandle {
    pub fn new(ctx: &Rc<LoopContext>) -> ActiveHandle {
        ctx.active_handles.set(ctx.active_handles.get() + 1);
        ActiveHandle {
            ctx: Rc::downgrade(ctx),
        }
    }
}

impl Drop for ActiveHandle {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.active_handles.set(ctx.active_handles.get().saturating_sub(1));
            ctx.handle_count_changed();
        }
    }
}

impl Debug for ActiveHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActiveHandle")
    }
}


#[cfg(test)]
mod test {
    use std::time::Duration;
    use super::*;
    use crate::message::MockMessageCodec;
    use crate::test_util::message::{TestCodec, TestMessage};
    use crate::test_util::test_event_loop;

    #[test]
    fn test_run_returns_without_handles() {
        let ev = test_event_loop();
        ev.run(RunMode::Default).unwrap();
    }

    #[test]
    fn test_run_until_handle_dropped() {
        let ev = test_event_loop();
        ev.enter(|ctx| {
            let handle = ActiveHandle::new(ctx);
            tokio::task::spawn_local(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(handle);
            });
        });
        assert_eq!(ev.context().active_handles(), 1);
        ev.run(RunMode::Default).unwrap();
        assert_eq!(ev.context().active_handles(), 0);
    }

    #[test]
    fn test_stop() {
        let ev = test_event_loop();
        let _handle = ev.enter(|ctx| {
            let ctx2 = ctx.clone();
            tokio::task::spawn_local(async move {
                ctx2.stop();
            });
            ActiveHandle::new(ctx)
        });
        ev.run(RunMode::Default).unwrap();
        assert!(ev.context().is_stop_requested());
    }

    #[test]
    fn test_run_no_wait_returns() {
        let ev = test_event_loop();
        let _handle = ev.enter(|ctx| ActiveHandle::new(ctx));
        ev.run(RunMode::NoWait).unwrap();
    }

    #[test]
    fn test_auto_id() {
        let ev = test_event_loop();
        let ctx = ev.context();
        assert_eq!(ctx.next_auto_id(), -1);
        assert_eq!(ctx.next_auto_id(), -2);
        assert_eq!(ctx.next_auto_id(), -3);
    }

    #[test]
    fn test_encode_decode() {
        let ev = test_event_loop();
        let ctx = ev.context();

        let frame = ctx.encode(-7, &TestMessage::new("hello")).unwrap();
        assert_eq!(&frame[..4], &(4u32 + 5).to_le_bytes());
        assert_eq!(&frame[4..8], &(-7i32).to_le_bytes());

        let (envelope, msg) = ctx.decode(&frame[4..]).unwrap();
        assert_eq!(envelope.correlation_id, -7);
        assert_eq!(msg.downcast_ref::<TestMessage>(), Some(&TestMessage::new("hello")));
    }

    #[test]
    fn test_encode_rejects_oversize_frame() {
        let mut config = NetConfig::new();
        config.max_frame_len = 16;
        let ev = EventLoop::new(config, Rc::new(TestCodec)).unwrap();
        let ctx = ev.context();

        assert!(ctx.encode(0, &TestMessage::new("twelve bytes")).is_ok());
        assert!(ctx.encode(0, &TestMessage::new("thirteen byte")).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_envelope() {
        let ev = EventLoop::new(NetConfig::new(), Rc::new(TestCodec)).unwrap();
        assert!(ev.context().decode(&[1, 2]).is_err());
    }

    #[test]
    fn test_decode_hands_payload_after_envelope_to_codec() {
        let mut codec = MockMessageCodec::new();
        codec.expect_deserialize()
            .withf(|buf| buf.to_vec() == b"payload".to_vec())
            .times(1)
            .returning(|_| Ok(Box::new(TestMessage::new("decoded")) as Box<dyn Message>));
        let ev = EventLoop::new(NetConfig::new(), Rc::new(codec)).unwrap();

        let mut payload = (-3i32).to_le_bytes().to_vec();
        payload.extend_from_slice(b"payload");
        let (envelope, msg) = ev.context().decode(&payload).unwrap();
        assert_eq!(envelope.correlation_id, -3);
        assert_eq!(msg.downcast_ref::<TestMessage>(), Some(&TestMessage::new("decoded")));
    }

    #[test]
    fn test_decode_propagates_codec_error() {
        let mut codec = MockMessageCodec::new();
        codec.expect_deserialize()
            .times(1)
            .returning(|_| Err(anyhow!("unknown message type")));
        let ev = EventLoop::new(NetConfig::new(), Rc::new(codec)).unwrap();

        let mut payload = 0i32.to_le_bytes().to_vec();
        payload.push(99);
        assert!(ev.context().decode(&payload).is_err());
    }

    #[test]
    fn test_new_validates_config() {
        let mut config = NetConfig::new();
        config.dial_nonce_resend_ticks = 0;
        assert!(EventLoop::new(config, Rc::new(TestCodec)).is_err());
    }
}
