use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::disposable::Disposable;
use crate::event_loop::{ActiveHandle, LoopContext};
use crate::listener::TransportMode;
use crate::peer::Peer;
use crate::timer::Timer;
use crate::transport::rudp::endpoint::{SessionSink, UdpEndpoint};
use crate::transport::rudp::session::KcpTransport;
use crate::transport::stream::StreamTransport;
use crate::transport::Transport;


/// Connects to a server, racing TCP and reliable UDP and optionally several addresses. The first
///  connection that is established wins and all other attempts are cancelled.
///
/// The outcome is reported through the accept callback: `Some(peer)` for the winner, `None` if the
///  timeout expired or every attempt failed. A cancelled dial reports nothing.
pub struct Dialer {
    inner: Rc<DialerInner>,
}

struct DialerInner {
    ctx: Rc<LoopContext>,
    myself: Weak<DialerInner>,
    mode: TransportMode,
    timer: Timer,
    state: RefCell<DialState>,
    on_accept: RefCell<Option<Box<dyn FnMut(Option<Peer>)>>>,
    disposed: Cell<bool>,
}

#[derive(Default)]
struct DialState {
    /// identifies the current dial, completions of earlier dials are discarded
    generation: u64,
    tcp: FxHashMap<u32, JoinHandle<()>>,
    next_tcp_id: u32,
    kcp: Vec<Rc<UdpEndpoint>>,
    active: Option<ActiveHandle>,
}

impl Dialer {
    pub fn new(ctx: &Rc<LoopContext>, mode: TransportMode) -> Dialer {
        Dialer {
            inner: Rc::new_cyclic(|myself| DialerInner {
                ctx: ctx.clone(),
                myself: myself.clone(),
                mode,
                timer: Timer::new(ctx),
                state: Default::default(),
                on_accept: RefCell::new(None),
                disposed: Cell::new(false),
            }),
        }
    }

    pub fn set_on_accept(&self, on_accept: impl FnMut(Option<Peer>) + 'static) {
        *self.inner.on_accept.borrow_mut() = Some(Box::new(on_accept));
    }

    /// `timeout_ms == 0` means no timeout.
    pub fn dial(&self, ip: &str, port: u16, timeout_ms: u64) -> anyhow::Result<()> {
        self.dial_addrs(&[(ip, port)], timeout_ms)
    }

    /// Races all `ips` on the same port.
    pub fn dial_ips(&self, ips: &[&str], port: u16, timeout_ms: u64) -> anyhow::Result<()> {
        let addrs: Vec<(&str, u16)> = ips.iter()
            .map(|ip| (*ip, port))
            .collect();
        self.dial_addrs(&addrs, timeout_ms)
    }

    /// Races all addresses. Entries that are not valid ip addresses are skipped; it is an error if
    ///  none is left. A dial that is still in flight is cancelled first.
    pub fn dial_addrs(&self, addrs: &[(&str, u16)], timeout_ms: u64) -> anyhow::Result<()> {
        if self.inner.disposed.get() {
            bail!("dialer is disposed");
        }
        self.inner.cancel_attempts();

        let targets: Vec<SocketAddr> = addrs.iter()
            .filter_map(|(ip, port)| match ip.parse::<IpAddr>() {
                Ok(ip) => Some(SocketAddr::new(ip, *port)),
                Err(_) => {
                    warn!("skipping invalid address {}", ip);
                    None
                }
            })
            .collect();
        if targets.is_empty() {
            bail!("no valid address to dial");
        }

        let generation = {
            let mut state = self.inner.state.borrow_mut();
            state.generation += 1;
            state.active = Some(ActiveHandle::new(&self.inner.ctx));
            state.generation
        };

        for target in targets {
            debug!("dialing {:?} ({:?})", target, self.inner.mode);
            if self.inner.mode.uses_tcp() {
                self.inner.start_tcp(generation, target);
            }
            if self.inner.mode.uses_kcp() {
                self.inner.start_kcp(generation, target);
            }
        }

        if !self.busy() {
            self.inner.cancel_attempts();
            bail!("no connection attempt could be started");
        }

        if timeout_ms > 0 {
            let myself = self.inner.myself.clone();
            self.inner.timer.start(timeout_ms, 0, move || {
                if let Some(inner) = myself.upgrade() {
                    inner.on_timeout(generation);
                }
            })?;
        }
        Ok(())
    }

    /// Cancels the dial in flight, if any, without reporting anything.
    pub fn cancel(&self) {
        self.inner.cancel_attempts();
    }

    pub fn busy(&self) -> bool {
        self.inner.is_busy()
    }
}

impl Disposable for Dialer {
    fn disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    fn dispose(&self, _graceful: bool) {
        if self.inner.disposed.replace(true) {
            return;
        }
        self.inner.cancel_attempts();
        self.inner.on_accept.borrow_mut().take();
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.dispose(false);
    }
}

impl Debug for Dialer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dialer{{mode:{:?}, busy:{}}}", self.inner.mode, self.busy())
    }
}

impl DialerInner {
    fn start_tcp(&self, generation: u64, target: SocketAddr) {
        let id = {
            let mut state = self.state.borrow_mut();
            state.next_tcp_id = state.next_tcp_id.wrapping_add(1);
            state.next_tcp_id
        };

        let myself = self.myself.clone();
        let task = tokio::task::spawn_local(async move {
            let result = TcpStream::connect(target).await;
            if let Some(inner) = myself.upgrade() {
                inner.on_tcp_connected(generation, id, target, result);
            }
        });
        self.state.borrow_mut().tcp.insert(id, task);
    }

    fn start_kcp(&self, generation: u64, target: SocketAddr) {
        let myself = self.myself.clone();
        let sink: SessionSink = Rc::new(move |session: Rc<KcpTransport>| {
            match myself.upgrade() {
                Some(inner) => inner.on_connected(generation, session),
                None => session.dispose(false),
            }
        });

        match UdpEndpoint::connect(&self.ctx, target, sink) {
            Ok(endpoint) => self.state.borrow_mut().kcp.push(endpoint),
            Err(e) => warn!("cannot dial {:?} over reliable UDP: {}", target, e),
        }
    }

    fn on_tcp_connected(&self, generation: u64, id: u32, target: SocketAddr, result: io::Result<TcpStream>) {
        {
            let mut state = self.state.borrow_mut();
            if state.generation != generation || state.tcp.remove(&id).is_none() {
                trace!("discarding late TCP connect result for {:?}", target);
                return;
            }
        }

        match result.map_err(anyhow::Error::from).and_then(|stream| StreamTransport::new(&self.ctx, stream)) {
            Ok(transport) => self.on_connected(generation, transport),
            Err(e) => {
                debug!("TCP connect to {:?} failed: {}", target, e);
                if !self.is_busy() {
                    self.cancel_attempts();
                    self.report(None);
                }
            }
        }
    }

    fn on_connected<T: Transport + 'static>(&self, generation: u64, transport: Rc<T>) {
        if self.disposed.get() || self.state.borrow().generation != generation {
            trace!("discarding late connection to {:?}", transport.peer_addr());
            transport.dispose(false);
            return;
        }

        debug!("connected to {:?} over {}", transport.peer_addr(), if transport.is_kcp() { "reliable UDP" } else { "TCP" });
        self.cancel_attempts();

        match Peer::new(&self.ctx, transport) {
            Ok(peer) => self.report(Some(peer)),
            Err(e) => {
                warn!("failed to set up connection: {}", e);
                self.report(None);
            }
        }
    }

    fn on_timeout(&self, generation: u64) {
        if self.state.borrow().generation != generation || !self.is_busy() {
            return;
        }
        debug!("dial timed out");
        self.cancel_attempts();
        self.report(None);
    }

    fn is_busy(&self) -> bool {
        let state = self.state.borrow();
        !state.tcp.is_empty() || !state.kcp.is_empty()
    }

    /// Stops all attempts of the current dial. Anything that completes later is discarded.
    fn cancel_attempts(&self) {
        let (tcp, kcp, active) = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            let tcp: Vec<JoinHandle<()>> = state.tcp.drain().map(|(_, t)| t).collect();
            let kcp = std::mem::take(&mut state.kcp);
            (tcp, kcp, state.active.take())
        };
        self.timer.stop();

        for task in tcp {
            task.abort();
        }
        for endpoint in kcp {
            endpoint.release_owner();
        }
        drop(active);
    }

    fn report(&self, peer: Option<Peer>) {
        let Some(mut on_accept) = self.on_accept.borrow_mut().take() else {
            debug!("no accept handler, dropping dial result");
            return;
        };
        on_accept(peer);

        if !self.disposed.get() {
            let mut slot = self.on_accept.borrow_mut();
            if slot.is_none() {
                *slot = Some(on_accept);
            }
        }
    }
}
