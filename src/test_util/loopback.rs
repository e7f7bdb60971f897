use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use anyhow::bail;
use bytes::Bytes;

use crate::disposable::Disposable;
use crate::transport::frame::FrameDecoder;
use crate::transport::{PackageHandler, Transport};


/// Records everything a transport delivers.
#[derive(Default)]
pub struct RecordingHandler {
    packages: RefCell<Vec<Vec<u8>>>,
    closed: Cell<usize>,
}

impl RecordingHandler {
    pub fn bind(transport: &dyn Transport) -> Rc<RecordingHandler> {
        let handler = Rc::new(RecordingHandler::default());
        let weak: Weak<dyn PackageHandler> = Rc::downgrade(&handler) as Weak<dyn PackageHandler>;
        transport.bind_handler(weak);
        handler
    }

    pub fn packages(&self) -> Vec<Vec<u8>> {
        self.packages.borrow().clone()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.get()
    }
}

impl PackageHandler for RecordingHandler {
    fn handle_package(&self, payload: Bytes) -> anyhow::Result<()> {
        self.packages.borrow_mut().push(payload.to_vec());
        Ok(())
    }

    fn on_transport_closed(&self) {
        self.closed.set(self.closed.get() + 1);
    }
}


/// An in-memory transport connected to its counterpart. Sent frames are queued at the other end
///  and delivered on its next [Transport::update], like a reliable UDP session does.
///
/// Disposing one end makes the other end see a closed connection on its next update.
pub struct LoopbackTransport {
    addr: SocketAddr,
    other: RefCell<Weak<LoopbackTransport>>,
    other_addr: SocketAddr,
    inbox: RefCell<VecDeque<Bytes>>,
    decoder: RefCell<FrameDecoder>,
    handler: RefCell<Option<Weak<dyn PackageHandler>>>,
    kcp: bool,
    fail_sends: Cell<bool>,
    sent_frames: Cell<usize>,
    flushes: Cell<usize>,
    disposed: Cell<bool>,
}

impl LoopbackTransport {
    pub fn pair() -> (Rc<LoopbackTransport>, Rc<LoopbackTransport>) {
        Self::pair_with_mode(false)
    }

    pub fn pair_with_mode(kcp: bool) -> (Rc<LoopbackTransport>, Rc<LoopbackTransport>) {
        let a_addr = SocketAddr::from(([127, 0, 0, 1], 10001));
        let b_addr = SocketAddr::from(([127, 0, 0, 2], 10002));
        let a = Rc::new(Self::new(a_addr, b_addr, kcp));
        let b = Rc::new(Self::new(b_addr, a_addr, kcp));
        *a.other.borrow_mut() = Rc::downgrade(&b);
        *b.other.borrow_mut() = Rc::downgrade(&a);
        (a, b)
    }

    fn new(addr: SocketAddr, other_addr: SocketAddr, kcp: bool) -> LoopbackTransport {
        LoopbackTransport {
            addr,
            other: RefCell::new(Weak::new()),
            other_addr,
            inbox: Default::default(),
            decoder: RefCell::new(FrameDecoder::new(16*1024*1024)),
            handler: RefCell::new(None),
            kcp,
            fail_sends: Cell::new(false),
            sent_frames: Cell::new(0),
            flushes: Cell::new(0),
            disposed: Cell::new(false),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Makes every subsequent send fail
    pub fn fail_sends(&self) {
        self.fail_sends.set(true);
    }

    pub fn sent_frames(&self) -> usize {
        self.sent_frames.get()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.get()
    }

    /// Queues a raw frame as if the other side had sent it
    pub fn inject(&self, frame: Bytes) {
        self.inbox.borrow_mut().push_back(frame);
    }

    fn other_is_gone(&self) -> bool {
        match self.other.borrow().upgrade() {
            Some(other) => other.disposed.get(),
            None => true,
        }
    }
}

impl Transport for LoopbackTransport {
    fn peer_addr(&self) -> SocketAddr {
        self.other_addr
    }

    fn send_frame(&self, frame: Bytes) -> anyhow::Result<()> {
        if self.disposed.get() || self.fail_sends.get() {
            bail!("loopback connection is closed");
        }
        self.sent_frames.set(self.sent_frames.get() + 1);
        if let Some(other) = self.other.borrow().upgrade() {
            other.inbox.borrow_mut().push_back(frame);
        }
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.flushes.set(self.flushes.get() + 1);
        Ok(())
    }

    fn update(&self, _now_ms: u64) -> anyhow::Result<()> {
        if self.disposed.get() {
            return Ok(());
        }

        let mut frames = Vec::new();
        let unpacked = {
            let inbox: Vec<Bytes> = self.inbox.borrow_mut().drain(..).collect();
            let mut decoder = self.decoder.borrow_mut();
            let result = inbox.iter()
                .try_for_each(|data| decoder.unpack(data, &mut frames));
            result
        };

        if !frames.is_empty() {
            if let Some(handler) = self.handler.borrow().as_ref().and_then(|h| h.upgrade()) {
                for frame in frames {
                    handler.handle_package(frame)?;
                    if self.disposed.get() {
                        return Ok(());
                    }
                }
            }
        }
        unpacked?;

        if self.other_is_gone() {
            self.dispose(true);
        }
        Ok(())
    }

    fn is_kcp(&self) -> bool {
        self.kcp
    }

    fn bind_handler(&self, handler: Weak<dyn PackageHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }
}

impl Disposable for LoopbackTransport {
    fn disposed(&self) -> bool {
        self.disposed.get()
    }

    fn dispose(&self, graceful: bool) {
        if self.disposed.replace(true) {
            return;
        }
        let handler = self.handler.borrow_mut().take();
        if graceful {
            if let Some(handler) = handler.and_then(|h| h.upgrade()) {
                handler.on_transport_closed();
            }
        }
    }
}

impl Debug for LoopbackTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoopbackTransport{{{:?} -> {:?}}}", self.addr, self.other_addr)
    }
}
