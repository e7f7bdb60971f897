use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::disposable::Disposable;
use crate::envelope::EnvelopeKind;
use crate::event_loop::LoopContext;
use crate::message::Message;
use crate::timer::Timer;
use crate::transport::{PackageHandler, Transport};


/// Called with the response to a request, or with `None` if the request timed out or the peer was
///  disposed. An error is fatal to the connection.
pub type ResponseCallback = Box<dyn FnOnce(Option<Box<dyn Message>>) -> anyhow::Result<()>>;
type PushCallback = Box<dyn FnMut(&Peer, Box<dyn Message>) -> anyhow::Result<()>>;
type RequestCallback = Box<dyn FnMut(&Peer, i32, Box<dyn Message>) -> anyhow::Result<()>>;

/// A connection to a remote party with push / request / response semantics, on top of either
///  transport.
///
/// Every message travels with a correlation id: 0 for a push, `-id` for a request and `id` for the
///  response to that request. A periodic timer drives the transport and expires requests that
///  were not answered in time.
///
/// A [Peer] is a cheap handle, clones refer to the same connection. The connection is closed when
///  it is disposed or when the last handle is dropped.
#[derive(Clone)]
pub struct Peer {
    inner: Rc<PeerInner>,
}

struct PeerInner {
    ctx: Rc<LoopContext>,
    myself: Weak<PeerInner>,
    transport: RefCell<Option<Rc<dyn Transport>>>,
    peer_addr: SocketAddr,
    ip: String,
    is_kcp: bool,
    timer: Timer,
    state: RefCell<PeerState>,
    on_disconnect: RefCell<Option<Box<dyn FnOnce()>>>,
    on_receive_push: RefCell<Option<PushCallback>>,
    on_receive_request: RefCell<Option<RequestCallback>>,
}

struct PeerState {
    pending: FxHashMap<i32, PendingRequest>,
    serial: i32,
    /// 0 means no idle timeout
    idle_deadline_ms: u64,
}

struct PendingRequest {
    callback: ResponseCallback,
    /// 0 means no timeout
    deadline_ms: u64,
}

impl Peer {
    /// Takes ownership of a connected transport.
    pub fn new(ctx: &Rc<LoopContext>, transport: Rc<dyn Transport>) -> anyhow::Result<Peer> {
        if transport.disposed() {
            bail!("transport to {:?} is already closed", transport.peer_addr());
        }

        let peer_addr = transport.peer_addr();
        let is_kcp = transport.is_kcp();
        let inner = Rc::new_cyclic(|myself: &Weak<PeerInner>| PeerInner {
            ctx: ctx.clone(),
            myself: myself.clone(),
            transport: RefCell::new(Some(transport.clone())),
            peer_addr,
            ip: peer_addr.ip().to_string(),
            is_kcp,
            timer: Timer::new(ctx),
            state: RefCell::new(PeerState {
                pending: Default::default(),
                serial: 0,
                idle_deadline_ms: 0,
            }),
            on_disconnect: RefCell::new(None),
            on_receive_push: RefCell::new(None),
            on_receive_request: RefCell::new(None),
        });

        let handler: Weak<dyn PackageHandler> = inner.myself.clone() as Weak<dyn PackageHandler>;
        transport.bind_handler(handler);

        let tick_ms = ctx.config().peer_tick_interval.as_millis() as u64;
        let myself = inner.myself.clone();
        inner.timer.start(tick_ms, tick_ms, move || {
            if let Some(inner) = myself.upgrade() {
                inner.tick();
            }
        })?;

        debug!("new peer {:?} over {}", peer_addr, if is_kcp { "reliable UDP" } else { "TCP" });
        Ok(Peer { inner })
    }

    pub fn send_push(&self, msg: &dyn Message) -> anyhow::Result<()> {
        self.inner.send(0, msg)
    }

    /// Sends a request and registers `on_response` for its answer. `timeout_ms == 0` means the
    ///  request never times out. The callback is only registered if sending succeeded, so it is
    ///  never called for a request that returned an error.
    ///
    /// Returns the request's correlation id.
    pub fn send_request(&self, msg: &dyn Message, timeout_ms: u64, on_response: impl FnOnce(Option<Box<dyn Message>>) -> anyhow::Result<()> + 'static) -> anyhow::Result<i32> {
        let serial = {
            let state = self.inner.state.borrow();
            if state.serial == i32::MAX { 1 } else { state.serial + 1 }
        };

        // a request that was never sent does not use up its serial
        self.inner.send(-serial, msg)?;
        self.inner.state.borrow_mut().serial = serial;

        let deadline_ms = if timeout_ms == 0 { 0 } else { self.inner.ctx.now_ms() + timeout_ms };
        trace!("request {} to {:?}, deadline {}", serial, self.inner.peer_addr, deadline_ms);
        self.inner.state.borrow_mut()
            .pending.insert(serial, PendingRequest {
                callback: Box::new(on_response),
                deadline_ms,
            });
        Ok(serial)
    }

    pub fn send_response(&self, correlation_id: i32, msg: &dyn Message) -> anyhow::Result<()> {
        if correlation_id <= 0 {
            bail!("invalid correlation id for a response: {}", correlation_id);
        }
        self.inner.send(correlation_id, msg)
    }

    /// Transmits buffered data right away. Only reliable UDP buffers anything.
    pub fn flush(&self) -> anyhow::Result<()> {
        let transport = self.inner.transport()?;
        if let Err(e) = transport.flush() {
            warn!("flushing to {:?} failed: {}", self.inner.peer_addr, e);
            self.inner.dispose(true);
            return Err(e);
        }
        Ok(())
    }

    /// Called once when the connection is closed by the remote side, fails, or is disposed
    ///  gracefully.
    pub fn set_on_disconnect(&self, on_disconnect: impl FnOnce() + 'static) {
        *self.inner.on_disconnect.borrow_mut() = Some(Box::new(on_disconnect));
    }

    pub fn set_on_receive_push(&self, on_push: impl FnMut(&Peer, Box<dyn Message>) -> anyhow::Result<()> + 'static) {
        *self.inner.on_receive_push.borrow_mut() = Some(Box::new(on_push));
    }

    /// The handler gets the correlation id to answer with [Peer::send_response].
    pub fn set_on_receive_request(&self, on_request: impl FnMut(&Peer, i32, Box<dyn Message>) -> anyhow::Result<()> + 'static) {
        *self.inner.on_receive_request.borrow_mut() = Some(Box::new(on_request));
    }

    /// Sets an idle deadline `ms` from now, after which the peer disposes itself. Applications
    ///  typically call this whenever they receive something. 0 disables the deadline.
    pub fn reset_timeout_ms(&self, ms: u64) {
        self.inner.state.borrow_mut().idle_deadline_ms = if ms == 0 { 0 } else { self.inner.ctx.now_ms() + ms };
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn ip(&self) -> &str {
        &self.inner.ip
    }

    pub fn is_kcp(&self) -> bool {
        self.inner.is_kcp
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.state.borrow().pending.len()
    }

    pub fn ptr_eq(&self, other: &Peer) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Disposable for Peer {
    fn disposed(&self) -> bool {
        self.inner.disposed()
    }

    /// A graceful dispose calls all pending response callbacks with `None` and then the disconnect
    ///  callback.
    fn dispose(&self, graceful: bool) {
        self.inner.dispose(graceful)
    }
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer{{{:?}, kcp:{}, disposed:{}}}", self.inner.peer_addr, self.inner.is_kcp, self.inner.disposed())
    }
}

impl PeerInner {
    fn transport(&self) -> anyhow::Result<Rc<dyn Transport>> {
        self.transport.borrow()
            .clone()
            .ok_or_else(|| anyhow!("peer {:?} is disposed", self.peer_addr))
    }

    fn handle(&self) -> Option<Peer> {
        self.myself.upgrade()
            .map(|inner| Peer { inner })
    }

    fn disposed(&self) -> bool {
        self.transport.borrow().is_none()
    }

    fn send(&self, correlation_id: i32, msg: &dyn Message) -> anyhow::Result<()> {
        let transport = self.transport()?;
        let frame = self.ctx.encode(correlation_id, msg)?;
        trace!("sending {} bytes with correlation id {} to {:?}", frame.len(), correlation_id, self.peer_addr);

        if let Err(e) = transport.send_frame(frame) {
            warn!("sending to {:?} failed, closing: {}", self.peer_addr, e);
            self.dispose(true);
            return Err(e);
        }
        Ok(())
    }

    fn tick(&self) {
        if self.disposed() {
            return;
        }
        let now_ms = self.ctx.now_ms();

        let idle_deadline_ms = self.state.borrow().idle_deadline_ms;
        if idle_deadline_ms != 0 && idle_deadline_ms < now_ms {
            debug!("peer {:?} timed out", self.peer_addr);
            self.dispose(true);
            return;
        }

        let Ok(transport) = self.transport() else { return; };
        if let Err(e) = transport.update(now_ms) {
            warn!("connection to {:?} failed: {}", self.peer_addr, e);
            self.dispose(true);
            return;
        }
        if self.disposed() {
            return;
        }

        self.expire_requests(now_ms);
    }

    fn expire_requests(&self, now_ms: u64) {
        let expired = {
            let mut state = self.state.borrow_mut();
            let mut ids: Vec<i32> = state.pending.iter()
                .filter(|(_, p)| p.deadline_ms != 0 && p.deadline_ms < now_ms)
                .map(|(&id, _)| id)
                .collect();
            ids.sort_unstable();
            ids.into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|p| (id, p.callback)))
                .collect::<Vec<_>>()
        };

        for (id, callback) in expired {
            debug!("request {} to {:?} timed out", id, self.peer_addr);
            if let Err(e) = callback(None) {
                warn!("response callback failed, closing connection to {:?}: {}", self.peer_addr, e);
                self.dispose(true);
                return;
            }
            if self.disposed() {
                return;
            }
        }
    }

    fn receive_push(&self, msg: Box<dyn Message>) -> anyhow::Result<()> {
        let Some(peer) = self.handle() else { return Ok(()); };
        let Some(mut on_push) = self.on_receive_push.borrow_mut().take() else {
            trace!("no push handler, dropping {:?}", msg);
            return Ok(());
        };

        let result = on_push(&peer, msg);

        if !self.disposed() {
            let mut slot = self.on_receive_push.borrow_mut();
            if slot.is_none() {
                *slot = Some(on_push);
            }
        }
        result
    }

    fn receive_request(&self, correlation_id: i32, msg: Box<dyn Message>) -> anyhow::Result<()> {
        let Some(peer) = self.handle() else { return Ok(()); };
        let Some(mut on_request) = self.on_receive_request.borrow_mut().take() else {
            trace!("no request handler, dropping request {}", correlation_id);
            return Ok(());
        };

        let result = on_request(&peer, correlation_id, msg);

        if !self.disposed() {
            let mut slot = self.on_receive_request.borrow_mut();
            if slot.is_none() {
                *slot = Some(on_request);
            }
        }
        result
    }

    fn receive_response(&self, correlation_id: i32, msg: Box<dyn Message>) -> anyhow::Result<()> {
        let pending = self.state.borrow_mut()
            .pending.remove(&correlation_id);
        match pending {
            Some(pending) => (pending.callback)(Some(msg)),
            None => {
                // answered too late, or never asked
                trace!("dropping response {} without pending request", correlation_id);
                Ok(())
            }
        }
    }

    fn dispose(&self, graceful: bool) {
        let Some(transport) = self.transport.borrow_mut().take() else { return; };
        debug!("disposing peer {:?}", self.peer_addr);

        let _myself = self.myself.upgrade();
        self.timer.stop();

        if graceful && !transport.disposed() {
            let _ = transport.flush();
        }
        transport.dispose(false);
        drop(transport);

        let mut pending: Vec<(i32, PendingRequest)> = self.state.borrow_mut()
            .pending.drain()
            .collect();
        pending.sort_unstable_by_key(|(id, _)| *id);
        let on_disconnect = self.on_disconnect.borrow_mut().take();
        self.on_receive_push.borrow_mut().take();
        self.on_receive_request.borrow_mut().take();

        if graceful {
            for (id, p) in pending {
                if let Err(e) = (p.callback)(None) {
                    debug!("response callback for request {} failed during dispose: {}", id, e);
                }
            }
            if let Some(on_disconnect) = on_disconnect {
                on_disconnect();
            }
        }
    }
}

impl PackageHandler for PeerInner {
    fn handle_package(&self, payload: Bytes) -> anyhow::Result<()> {
        // the reliable UDP handshake ack travels as a regular frame
        if payload.len() == 1 && payload[0] == 0 {
            trace!("handshake ack from {:?}", self.peer_addr);
            return Ok(());
        }

        let (envelope, msg) = self.ctx.decode(&payload)?;
        match envelope.kind() {
            EnvelopeKind::Push => self.receive_push(msg),
            EnvelopeKind::Request(id) => self.receive_request(id, msg),
            EnvelopeKind::Response(id) => self.receive_response(id, msg),
        }
    }

    fn on_transport_closed(&self) {
        debug!("connection to {:?} closed", self.peer_addr);
        self.dispose(true);
    }
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        self.dispose(false);
    }
}


#[cfg(test)]
mod test {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use anyhow::anyhow;
    use rstest::rstest;
    use super::*;
    use crate::config::NetConfig;
    use crate::event_loop::EventLoop;
    use crate::test_util::loopback::LoopbackTransport;
    use crate::test_util::message::{TestCodec, TestMessage};
    use crate::test_util::{run_until, test_event_loop, test_event_loop_paused};
    use crate::transport::frame::frame_payload;

    fn peer_pair(ev: &EventLoop) -> (Peer, Peer, Rc<LoopbackTransport>, Rc<LoopbackTransport>) {
        let (a, b) = LoopbackTransport::pair();
        let (pa, pb) = ev.enter(|ctx| (
            Peer::new(ctx, a.clone()).unwrap(),
            Peer::new(ctx, b.clone()).unwrap(),
        ));
        (pa, pb, a, b)
    }

    fn text(msg: &dyn Message) -> String {
        msg.downcast_ref::<TestMessage>().unwrap().text.clone()
    }

    fn record_pushes(peer: &Peer) -> Rc<RefCell<Vec<String>>> {
        let pushes = Rc::new(RefCell::new(Vec::new()));
        let pushes2 = pushes.clone();
        peer.set_on_receive_push(move |_, msg| {
            pushes2.borrow_mut().push(text(msg.as_ref()));
            Ok(())
        });
        pushes
    }

    fn count_disconnects(peer: &Peer) -> Rc<Cell<usize>> {
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        peer.set_on_disconnect(move || count2.set(count2.get() + 1));
        count
    }

    #[test]
    fn test_push() {
        let ev = test_event_loop();
        let (a, b, _, _) = peer_pair(&ev);
        let pushes = record_pushes(&b);

        a.send_push(&TestMessage::new("one")).unwrap();
        a.send_push(&TestMessage::new("two")).unwrap();

        let p = pushes.clone();
        assert!(run_until(&ev, 1000, move || p.borrow().len() == 2));
        assert_eq!(*pushes.borrow(), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_request_response() {
        let ev = test_event_loop();
        let (a, b, _, _) = peer_pair(&ev);

        b.set_on_receive_request(|peer, id, msg| {
            peer.send_response(id, &TestMessage::new(&format!("re: {}", text(msg.as_ref()))))
        });

        let responses = Rc::new(RefCell::new(Vec::new()));
        for (i, t) in ["x", "y"].into_iter().enumerate() {
            let responses = responses.clone();
            let id = a.send_request(&TestMessage::new(t), 1000, move |msg| {
                responses.borrow_mut().push(msg.map(|m| text(m.as_ref())));
                Ok(())
            }).unwrap();
            assert_eq!(id, i as i32 + 1);
        }
        assert_eq!(a.pending_requests(), 2);

        let r = responses.clone();
        assert!(run_until(&ev, 1000, move || r.borrow().len() == 2));
        assert_eq!(*responses.borrow(), vec![Some("re: x".to_string()), Some("re: y".to_string())]);
        assert_eq!(a.pending_requests(), 0);
    }

    #[test]
    fn test_request_timeout_fires_once() {
        let ev = test_event_loop_paused();
        let (a, _b, _, _) = peer_pair(&ev);

        let calls = Rc::new(RefCell::new(Vec::new()));
        let calls2 = calls.clone();
        a.send_request(&TestMessage::new("anyone?"), 50, move |msg| {
            calls2.borrow_mut().push(msg.is_none());
            Ok(())
        }).unwrap();
        a.send_request(&TestMessage::new("no deadline"), 0, |_| Err(anyhow!("must not be called"))).unwrap();

        let c = calls.clone();
        assert!(run_until(&ev, 1000, move || !c.borrow().is_empty()));
        // keep ticking to make sure there is no second call
        assert!(!run_until(&ev, 200, || false));

        assert_eq!(*calls.borrow(), vec![true]);
        assert_eq!(a.pending_requests(), 1);
        assert!(!a.disposed());
    }

    #[test]
    fn test_graceful_dispose() {
        let ev = test_event_loop();
        let (a, _b, transport, _) = peer_pair(&ev);
        let disconnects = count_disconnects(&a);

        let calls = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            a.send_request(&TestMessage::new("q"), 1000, move |msg| {
                assert!(msg.is_none());
                calls.set(calls.get() + 1);
                Ok(())
            }).unwrap();
        }

        a.dispose(true);
        assert!(a.disposed());
        assert!(transport.disposed());
        assert_eq!(calls.get(), 3);
        assert_eq!(disconnects.get(), 1);
        assert_eq!(a.pending_requests(), 0);

        a.dispose(true);
        assert_eq!(calls.get(), 3);
        assert_eq!(disconnects.get(), 1);
        assert!(a.send_push(&TestMessage::new("x")).is_err());
    }

    #[test]
    fn test_dispose_without_callbacks() {
        let ev = test_event_loop();
        let (a, _b, _, _) = peer_pair(&ev);
        let disconnects = count_disconnects(&a);
        a.send_request(&TestMessage::new("q"), 1000, |_| Err(anyhow!("must not be called"))).unwrap();

        a.dispose(false);
        assert!(a.disposed());
        assert_eq!(disconnects.get(), 0);
    }

    #[test]
    fn test_remote_close_disconnects() {
        let ev = test_event_loop();
        let (a, b, _, _) = peer_pair(&ev);
        let disconnects = count_disconnects(&a);

        b.dispose(true);

        let a2 = a.clone();
        assert!(run_until(&ev, 1000, move || a2.disposed()));
        assert_eq!(disconnects.get(), 1);
    }

    #[test]
    fn test_send_failure_disposes() {
        let ev = test_event_loop();
        let (a, _b, transport, _) = peer_pair(&ev);
        let disconnects = count_disconnects(&a);
        transport.fail_sends();

        let result = a.send_request(&TestMessage::new("q"), 1000, |_| Err(anyhow!("must not be called")));
        assert!(result.is_err());
        assert!(a.disposed());
        assert_eq!(disconnects.get(), 1);
        assert_eq!(a.pending_requests(), 0);
    }

    #[rstest]
    #[case::unknown_response(5)]
    #[case::push_without_handler(0)]
    #[case::request_without_handler(-3)]
    fn test_unhandled_frames_are_dropped(#[case] correlation_id: i32) {
        let ev = test_event_loop();
        let (a, _b, transport, _) = peer_pair(&ev);

        transport.inject(ev.context().encode(correlation_id, &TestMessage::new("stray")).unwrap());
        assert!(!run_until(&ev, 50, || false));
        assert!(!a.disposed());
    }

    #[test]
    fn test_handshake_ack_frame_is_ignored() {
        let ev = test_event_loop();
        let (a, _b, transport, _) = peer_pair(&ev);
        let pushes = record_pushes(&a);

        transport.inject(frame_payload(&[0]).unwrap());
        transport.inject(ev.context().encode(0, &TestMessage::new("after ack")).unwrap());

        let p = pushes.clone();
        assert!(run_until(&ev, 1000, move || !p.borrow().is_empty()));
        assert_eq!(*pushes.borrow(), vec!["after ack".to_string()]);
        assert!(!a.disposed());
    }

    #[test]
    fn test_garbage_frame_disposes() {
        let ev = test_event_loop();
        let (a, _b, transport, _) = peer_pair(&ev);
        let disconnects = count_disconnects(&a);

        transport.inject(frame_payload(&[1, 2]).unwrap());

        let a2 = a.clone();
        assert!(run_until(&ev, 1000, move || a2.disposed()));
        assert_eq!(disconnects.get(), 1);
    }

    #[test]
    fn test_handler_error_disposes() {
        let ev = test_event_loop();
        let (a, b, _, _) = peer_pair(&ev);
        b.set_on_receive_push(|_, _| Err(anyhow!("unexpected message")));

        a.send_push(&TestMessage::new("boom")).unwrap();

        let b2 = b.clone();
        assert!(run_until(&ev, 1000, move || b2.disposed()));
    }

    #[test]
    fn test_idle_timeout() {
        let ev = test_event_loop_paused();
        let (a, _b, _, _) = peer_pair(&ev);
        let disconnects = count_disconnects(&a);

        a.reset_timeout_ms(100);
        assert!(!run_until(&ev, 50, || false));
        assert!(!a.disposed());

        a.reset_timeout_ms(100);
        let a2 = a.clone();
        assert!(run_until(&ev, 1000, move || a2.disposed()));
        assert_eq!(disconnects.get(), 1);
    }

    #[test]
    fn test_serial_wraps_to_one() {
        let ev = test_event_loop();
        let (a, _b, _, _) = peer_pair(&ev);
        a.inner.state.borrow_mut().serial = i32::MAX - 1;

        assert_eq!(a.send_request(&TestMessage::new("q"), 0, |_| Ok(())).unwrap(), i32::MAX);
        assert_eq!(a.send_request(&TestMessage::new("q"), 0, |_| Ok(())).unwrap(), 1);
    }

    #[test]
    fn test_failed_request_keeps_serial() {
        let mut config = NetConfig::new();
        config.max_frame_len = 16;
        let ev = EventLoop::new(config, Rc::new(TestCodec)).unwrap();
        let (a, _b, transport, _) = peer_pair(&ev);

        assert_eq!(a.send_request(&TestMessage::new("q"), 0, |_| Ok(())).unwrap(), 1);
        let too_long = TestMessage::new("more than sixteen bytes");
        assert!(a.send_request(&too_long, 0, |_| Err(anyhow!("must not be called"))).is_err());
        assert!(a.send_request(&too_long, 0, |_| Err(anyhow!("must not be called"))).is_err());

        assert!(!a.disposed());
        assert_eq!(a.pending_requests(), 1);
        assert_eq!(transport.sent_frames(), 1);
        assert_eq!(a.send_request(&TestMessage::new("q"), 0, |_| Ok(())).unwrap(), 2);
    }

    #[test]
    fn test_response_needs_positive_id() {
        let ev = test_event_loop();
        let (a, _b, _, _) = peer_pair(&ev);
        assert!(a.send_response(0, &TestMessage::new("x")).is_err());
        assert!(a.send_response(-1, &TestMessage::new("x")).is_err());
        assert!(!a.disposed());
    }

    #[test]
    fn test_addresses() {
        let ev = test_event_loop();
        let (a, b, ta, tb) = peer_pair(&ev);
        assert_eq!(a.peer_addr(), tb.local_addr());
        assert_eq!(b.ip(), ta.local_addr().ip().to_string());
        assert!(!a.is_kcp());
    }
}
