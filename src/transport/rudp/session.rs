use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::io;
use std::io::Write;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use anyhow::bail;
use bytes::Bytes;
use kcp::Kcp;
use tracing::{debug, trace};

use crate::config::{KcpConfig, RunMode};
use crate::disposable::Disposable;
use crate::event_loop::LoopContext;
use crate::transport::frame::FrameDecoder;
use crate::transport::rudp::endpoint::UdpEndpoint;
use crate::transport::{PackageHandler, Transport};


/// Sends the ARQ's datagrams through the shared socket, to wherever the remote side was last
///  seen.
struct UdpOutput {
    endpoint: Rc<UdpEndpoint>,
    remote: Rc<Cell<SocketAddr>>,
}

impl Write for UdpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.endpoint.send_to(buf, self.remote.get());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn new_control_block(conv: u32, output: UdpOutput, config: &KcpConfig) -> anyhow::Result<Kcp<UdpOutput>> {
    let mut kcp = if config.stream_mode {
        Kcp::new_stream(conv, output)
    }
    else {
        Kcp::new(conv, output)
    };
    kcp.set_mtu(config.mtu)?;
    kcp.set_wndsize(config.send_window, config.recv_window);
    kcp.set_nodelay(config.nodelay, config.interval.as_millis() as i32, config.fast_resend as i32, config.no_congestion_window);
    kcp.set_rx_minrto(config.min_rto.as_millis() as u32);
    kcp.set_maximum_resend_times(config.dead_link);
    // the control block refuses to flush before its first update
    kcp.update(0)?;
    Ok(kcp)
}

/// Signed distance between two wrapping ARQ timestamps
fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// One reliable UDP session: a KCP control block bound to a conv on a shared [UdpEndpoint].
///
/// The control block runs on a clock that starts when the session is created. Inbound packets are
///  only buffered when they arrive; decoding and delivering frames happens in [Transport::update].
pub struct KcpTransport {
    ctx: Rc<LoopContext>,
    endpoint: Rc<UdpEndpoint>,
    conv: u32,
    myself: Weak<KcpTransport>,
    remote: Rc<Cell<SocketAddr>>,
    created_ms: u64,
    state: RefCell<KcpState>,
    handler: RefCell<Option<Weak<dyn PackageHandler>>>,
    disposed: Cell<bool>,
}

struct KcpState {
    kcp: Kcp<UdpOutput>,
    decoder: FrameDecoder,
    next_update_ms: u32,
}

impl KcpTransport {
    pub(crate) fn new(ctx: &Rc<LoopContext>, endpoint: Rc<UdpEndpoint>, conv: u32, remote: SocketAddr) -> anyhow::Result<Rc<KcpTransport>> {
        let remote = Rc::new(Cell::new(remote));
        let output = UdpOutput {
            endpoint: endpoint.clone(),
            remote: remote.clone(),
        };
        let kcp = new_control_block(conv, output, &ctx.config().kcp)?;

        Ok(Rc::new_cyclic(|myself| KcpTransport {
            ctx: ctx.clone(),
            endpoint,
            conv,
            myself: myself.clone(),
            remote,
            created_ms: ctx.now_ms(),
            state: RefCell::new(KcpState {
                kcp,
                decoder: FrameDecoder::new(ctx.config().max_frame_len),
                next_update_ms: 0,
            }),
            handler: RefCell::new(None),
            disposed: Cell::new(false),
        }))
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn endpoint(&self) -> &Rc<UdpEndpoint> {
        &self.endpoint
    }

    /// Follows the remote side if its address changes, e.g. because of NAT rebinding
    pub(crate) fn set_remote(&self, remote: SocketAddr) {
        let old = self.remote.replace(remote);
        if old != remote {
            debug!("session {} moved from {:?} to {:?}", self.conv, old, remote);
        }
    }

    pub(crate) fn input(&self, data: &[u8]) -> anyhow::Result<()> {
        self.state.borrow_mut()
            .kcp.input(data)?;
        Ok(())
    }

    /// Milliseconds on the session's own clock
    fn current(&self, now_ms: u64) -> u32 {
        now_ms.saturating_sub(self.created_ms) as u32
    }

    fn dispatch(&self, frames: Vec<Bytes>) -> anyhow::Result<()> {
        if frames.is_empty() {
            return Ok(());
        }
        let Some(handler) = self.handler.borrow().as_ref().and_then(|h| h.upgrade()) else {
            trace!("no handler bound, dropping {} frames", frames.len());
            return Ok(());
        };
        for frame in frames {
            handler.handle_package(frame)?;
            if self.disposed.get() {
                break;
            }
        }
        Ok(())
    }
}

impl Transport for KcpTransport {
    fn peer_addr(&self) -> SocketAddr {
        self.remote.get()
    }

    fn send_frame(&self, frame: Bytes) -> anyhow::Result<()> {
        if self.disposed.get() {
            bail!("session {} is closed", self.conv);
        }
        self.state.borrow_mut()
            .kcp.send(&frame)?;
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        if self.disposed.get() {
            bail!("session {} is closed", self.conv);
        }
        self.state.borrow_mut()
            .kcp.flush()?;
        Ok(())
    }

    fn update(&self, now_ms: u64) -> anyhow::Result<()> {
        if self.disposed.get() {
            return Ok(());
        }
        let current = self.current(now_ms);

        let mut frames = Vec::new();
        let unpacked = {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;

            // outside of the default run mode ticks are irregular, so the ARQ runs on every one
            if self.ctx.run_mode() != RunMode::Default || time_diff(current, state.next_update_ms) >= 0 {
                state.kcp.update(current)?;
                state.next_update_ms = state.kcp.check(current);
            }

            if state.kcp.is_dead_link() {
                bail!("reliable UDP link to {:?} is dead", self.remote.get());
            }

            let result = self.ctx.with_recv_scratch(|scratch| -> anyhow::Result<()> {
                // an error here only means there is no complete message yet
                while let Ok(size) = state.kcp.peeksize() {
                    let start = scratch.len();
                    scratch.resize(start + size, 0);
                    let received = state.kcp.recv(&mut scratch[start..])?;
                    scratch.truncate(start + received);
                }
                if scratch.is_empty() {
                    return Ok(());
                }
                trace!("session {} received {} bytes", self.conv, scratch.len());
                state.decoder.unpack(scratch, &mut frames)
            });
            result
        };

        // frames before a bad length prefix are delivered before the session fails
        self.dispatch(frames)?;
        unpacked
    }

    fn is_kcp(&self) -> bool {
        true
    }

    fn bind_handler(&self, handler: Weak<dyn PackageHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }
}

impl Disposable for KcpTransport {
    fn disposed(&self) -> bool {
        self.disposed.get()
    }

    fn dispose(&self, graceful: bool) {
        if self.disposed.replace(true) {
            return;
        }
        debug!("closing reliable UDP session {} with {:?}", self.conv, self.remote.get());

        let _myself = self.myself.upgrade();
        self.endpoint.remove_session(self.conv);

        let handler = self.handler.borrow_mut().take();
        if graceful {
            if let Some(handler) = handler.and_then(|h| h.upgrade()) {
                handler.on_transport_closed();
            }
        }
    }
}

impl Drop for KcpTransport {
    fn drop(&mut self) {
        self.endpoint.remove_session(self.conv);
    }
}

impl Debug for KcpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KcpTransport{{conv:{}, remote:{:?}, disposed:{}}}", self.conv, self.remote.get(), self.disposed.get())
    }
}
