use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::{Rc, Weak};

use anyhow::{bail, Context};
use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::disposable::Disposable;
use crate::event_loop::LoopContext;
use crate::timer::Timer;
use crate::transport::rudp::handshake::{encode_nonce, encode_reply, parse_reply, HandshakeTable, ACK_PACKET, NONCE_LEN};
use crate::transport::rudp::session::KcpTransport;
use crate::transport::Transport;
use crate::util::random::RngRandom;


/// Length of a KCP segment header, which starts with the conv. Shorter datagrams are not ARQ
///  traffic.
const HEADER_LEN: usize = 24;

/// Receives the sessions an endpoint establishes: new inbound sessions on the listener side, the
///  single connected session on the dialer side.
pub type SessionSink = Rc<dyn Fn(Rc<KcpTransport>)>;

enum Role {
    Listener {
        handshakes: HandshakeTable,
    },
    Dialer {
        nonce: u32,
        remote: SocketAddr,
        ticks: u32,
        connected: bool,
    },
}

/// One UDP socket, shared by all reliable UDP sessions multiplexed on it.
///
/// Sessions hold strong references to their endpoint, the endpoint only holds weak references to
///  its sessions. The loop's registry also refers to endpoints weakly, so an endpoint goes away
///  with its last session (or its owner, if there are no sessions).
pub struct UdpEndpoint {
    ctx: Rc<LoopContext>,
    socket: Rc<UdpSocket>,
    local_addr: SocketAddr,
    registry_id: i32,
    myself: Weak<UdpEndpoint>,
    state: RefCell<EndpointState>,
    recv_task: RefCell<Option<JoinHandle<()>>>,
    timer: Timer,
}

struct EndpointState {
    role: Role,
    sessions: FxHashMap<u32, Weak<KcpTransport>>,
    owner: Option<SessionSink>,
    disposed: bool,
}

/// What to do with a datagram, decided while the state is borrowed and done afterwards
enum Action {
    Ignore,
    Reply([u8; 8]),
    Accept(u32, SessionSink),
    Connected(u32, SessionSink),
    Input(Rc<KcpTransport>),
}

impl UdpEndpoint {
    /// Binds a listening socket, or takes over the socket that is still registered for this port
    ///  because sessions of a previous listener are alive. It is an error if that socket has a
    ///  listener already.
    pub fn bind_listener(ctx: &Rc<LoopContext>, addr: SocketAddr, owner: SessionSink) -> anyhow::Result<Rc<UdpEndpoint>> {
        if addr.port() != 0 {
            if let Some(existing) = ctx.lookup_udp(addr.port() as i32) {
                let mut state = existing.state.borrow_mut();
                if state.owner.is_some() {
                    bail!("UDP port {} already has a listener", addr.port());
                }
                debug!("reusing UDP socket on port {}", addr.port());
                state.owner = Some(owner);
                drop(state);
                return Ok(existing);
            }
        }

        let socket = bind_udp(addr, true)?;
        let local_addr = socket.local_addr()?;
        let ttl_ms = ctx.config().handshake_ttl.as_millis() as u64;
        let role = Role::Listener {
            handshakes: HandshakeTable::new::<RngRandom>(ttl_ms),
        };

        let endpoint = Self::new(ctx, socket, local_addr, local_addr.port() as i32, role, owner);
        debug!("reliable UDP listener bound to {:?}", local_addr);
        Ok(endpoint)
    }

    /// Binds an ephemeral socket and starts the handshake with `remote`. `owner` is called once the
    ///  listener replied.
    pub fn connect(ctx: &Rc<LoopContext>, remote: SocketAddr, owner: SessionSink) -> anyhow::Result<Rc<UdpEndpoint>> {
        let bind_addr = if remote.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        }
        else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = bind_udp(bind_addr, false)?;
        let local_addr = socket.local_addr()?;

        let registry_id = ctx.next_auto_id();
        let role = Role::Dialer {
            nonce: registry_id as u32,
            remote,
            ticks: 0,
            connected: false,
        };

        let endpoint = Self::new(ctx, socket, local_addr, registry_id, role, owner);
        debug!("reliable UDP dialer {} on {:?} connecting to {:?}", registry_id, local_addr, remote);
        endpoint.send_nonce();
        Ok(endpoint)
    }

    fn new(ctx: &Rc<LoopContext>, socket: UdpSocket, local_addr: SocketAddr, registry_id: i32, role: Role, owner: SessionSink) -> Rc<UdpEndpoint> {
        let endpoint = Rc::new_cyclic(|myself| UdpEndpoint {
            ctx: ctx.clone(),
            socket: Rc::new(socket),
            local_addr,
            registry_id,
            myself: myself.clone(),
            state: RefCell::new(EndpointState {
                role,
                sessions: Default::default(),
                owner: Some(owner),
                disposed: false,
            }),
            recv_task: RefCell::new(None),
            timer: Timer::new(ctx),
        });

        ctx.register_udp(registry_id, &endpoint);

        let recv_task = tokio::task::spawn_local(Self::recv_loop(endpoint.myself.clone(), endpoint.socket.clone(), ctx.config().recv_buf_len));
        *endpoint.recv_task.borrow_mut() = Some(recv_task);

        let tick_ms = ctx.config().handshake_tick_interval.as_millis() as u64;
        let myself = endpoint.myself.clone();
        // NB: a fresh timer can only fail to start if it was disposed
        let _ = endpoint.timer.start(tick_ms, tick_ms, move || {
            if let Some(endpoint) = myself.upgrade() {
                endpoint.on_tick();
            }
        });
        endpoint.timer.unref();

        endpoint
    }

    async fn recv_loop(myself: Weak<UdpEndpoint>, socket: Rc<UdpSocket>, recv_buf_len: usize) {
        let mut buf = vec![0u8; recv_buf_len];
        loop {
            let result = socket.recv_from(&mut buf).await;

            let Some(endpoint) = myself.upgrade() else { return; };
            match result {
                Ok((n, from)) => endpoint.on_datagram(&buf[..n], from),
                Err(e) => {
                    // e.g. ICMP port unreachable surfacing on some platforms
                    trace!("error receiving on {:?}: {}", endpoint.local_addr, e);
                    continue;
                }
            }
        }
    }

    fn on_datagram(&self, data: &[u8], from: SocketAddr) {
        let now_ms = self.ctx.now_ms();

        let action = {
            let mut state = self.state.borrow_mut();
            let state = &mut *state;
            if state.disposed {
                return;
            }

            match &mut state.role {
                Role::Listener { handshakes } => {
                    if data.len() == NONCE_LEN {
                        if state.owner.is_none() {
                            Action::Ignore
                        }
                        else {
                            let sessions = &state.sessions;
                            let conv = handshakes.get_or_allocate(from, now_ms, |c| sessions.get(&c).is_some_and(|s| s.strong_count() > 0));
                            let mut nonce = [0u8; NONCE_LEN];
                            nonce.copy_from_slice(data);
                            Action::Reply(encode_reply(&nonce, conv))
                        }
                    }
                    else if data.len() < HEADER_LEN {
                        Action::Ignore
                    }
                    else {
                        let conv = (&data[..4]).get_u32_le();
                        match state.sessions.get(&conv).and_then(|s| s.upgrade()) {
                            Some(session) => Action::Input(session),
                            None => match &state.owner {
                                Some(owner) if handshakes.take_matching(from, conv, now_ms) => Action::Accept(conv, owner.clone()),
                                _ => Action::Ignore,
                            }
                        }
                    }
                }
                Role::Dialer { nonce, connected, .. } => {
                    if let Some((reply_nonce, conv)) = parse_reply(data) {
                        match &state.owner {
                            Some(owner) if !*connected && reply_nonce == *nonce => {
                                *connected = true;
                                Action::Connected(conv, owner.clone())
                            }
                            _ => Action::Ignore,
                        }
                    }
                    else if data.len() < HEADER_LEN {
                        Action::Ignore
                    }
                    else {
                        let conv = (&data[..4]).get_u32_le();
                        match state.sessions.get(&conv).and_then(|s| s.upgrade()) {
                            Some(session) => Action::Input(session),
                            None => Action::Ignore,
                        }
                    }
                }
            }
        };

        match action {
            Action::Ignore => {
                trace!("ignoring {} byte datagram from {:?}", data.len(), from);
            }
            Action::Reply(reply) => {
                trace!("handshake reply to {:?}", from);
                self.send_to(&reply, from);
            }
            Action::Accept(conv, owner) => {
                let Some(session) = self.create_session(conv, from) else { return; };
                debug!("accepted reliable UDP session {} from {:?}", conv, from);
                owner(session.clone());
                Self::input(&session, data, from);
            }
            Action::Connected(conv, owner) => {
                let Some(session) = self.create_session(conv, from) else { return; };
                debug!("reliable UDP session {} connected to {:?}", conv, from);
                self.timer.stop();
                let acked = session.send_frame(Bytes::from_static(&ACK_PACKET))
                    .and_then(|_| session.flush());
                if let Err(e) = acked {
                    warn!("failed to send handshake ack to {:?}: {}", from, e);
                    session.dispose(false);
                    return;
                }
                owner(session);
            }
            Action::Input(session) => {
                Self::input(&session, data, from);
            }
        }
    }

    fn input(session: &Rc<KcpTransport>, data: &[u8], from: SocketAddr) {
        if session.disposed() {
            return;
        }
        session.set_remote(from);
        if let Err(e) = session.input(data) {
            warn!("invalid packet from {:?}, closing session {}: {}", from, session.conv(), e);
            session.dispose(true);
        }
    }

    fn create_session(&self, conv: u32, remote: SocketAddr) -> Option<Rc<KcpTransport>> {
        let myself = self.myself.upgrade()?;
        match KcpTransport::new(&self.ctx, myself, conv, remote) {
            Ok(session) => {
                self.state.borrow_mut()
                    .sessions.insert(conv, Rc::downgrade(&session));
                Some(session)
            }
            Err(e) => {
                warn!("failed to create reliable UDP session {}: {}", conv, e);
                None
            }
        }
    }

    fn on_tick(&self) {
        let now_ms = self.ctx.now_ms();
        let resend_ticks = self.ctx.config().dial_nonce_resend_ticks;

        let resend = {
            let mut state = self.state.borrow_mut();
            match &mut state.role {
                Role::Listener { handshakes } => {
                    handshakes.purge_expired(now_ms);
                    false
                }
                Role::Dialer { ticks, connected, .. } => {
                    *ticks += 1;
                    !*connected && *ticks % resend_ticks == 0
                }
            }
        };

        if resend {
            self.send_nonce();
        }
    }

    fn send_nonce(&self) {
        let target = match &self.state.borrow().role {
            Role::Dialer { nonce, remote, connected: false, .. } => Some((*nonce, *remote)),
            _ => None,
        };
        if let Some((nonce, remote)) = target {
            trace!("sending handshake nonce to {:?}", remote);
            self.send_to(&encode_nonce(nonce), remote);
        }
    }

    /// Fire and forget: a datagram that cannot be sent right away counts as lost.
    pub(crate) fn send_to(&self, data: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.try_send_to(data, to) {
            trace!("dropping {} byte datagram to {:?}: {}", data.len(), to, e);
        }
    }

    pub(crate) fn remove_session(&self, conv: u32) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.sessions.remove(&conv);
        }
    }

    /// Stops handing out sessions: no new handshakes are accepted, and a dialer stops sending its
    ///  nonce. Existing sessions are not affected.
    pub fn release_owner(&self) {
        self.state.borrow_mut().owner = None;
        if matches!(self.state.borrow().role, Role::Dialer { .. }) {
            self.timer.stop();
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry_id(&self) -> i32 {
        self.registry_id
    }

    pub fn session_count(&self) -> usize {
        self.state.borrow().sessions.values()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    pub fn pending_handshakes(&self) -> usize {
        match &self.state.borrow().role {
            Role::Listener { handshakes } => handshakes.len(),
            Role::Dialer { .. } => 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state.borrow().role, Role::Dialer { connected: true, .. })
    }
}

fn bind_udp(addr: SocketAddr, reuse_address: bool) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if reuse_address {
        socket.set_reuse_address(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())
        .with_context(|| format!("binding UDP socket to {:?}", addr))?;
    Ok(UdpSocket::from_std(socket.into())?)
}

impl Disposable for UdpEndpoint {
    fn disposed(&self) -> bool {
        self.state.borrow().disposed
    }

    /// Closes the socket and all sessions on it.
    fn dispose(&self, graceful: bool) {
        let sessions: Vec<Rc<KcpTransport>> = {
            let mut state = self.state.borrow_mut();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.owner = None;
            state.sessions.drain()
                .filter_map(|(_, s)| s.upgrade())
                .collect()
        };
        self.timer.stop();
        if let Some(task) = self.recv_task.borrow_mut().take() {
            task.abort();
        }
        for session in sessions {
            session.dispose(graceful);
        }
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.get_mut().take() {
            task.abort();
        }
        self.ctx.unregister_udp(self.registry_id);
        trace!("UDP socket {:?} closed", self.local_addr);
    }
}

impl Debug for UdpEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpEndpoint{{id:{}, local:{:?}}}", self.registry_id, self.local_addr)
    }
}


#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::test_util::{run_future, run_until, test_event_loop, test_event_loop_paused};
    use crate::test_util::loopback::RecordingHandler;
    use crate::transport::frame::frame_payload;

    fn collecting_sink() -> (SessionSink, Rc<RefCell<Vec<Rc<KcpTransport>>>>) {
        let sessions = Rc::new(RefCell::new(Vec::new()));
        let sessions2 = sessions.clone();
        let sink: SessionSink = Rc::new(move |s: Rc<KcpTransport>| sessions2.borrow_mut().push(s));
        (sink, sessions)
    }

    fn listener(ev: &EventLoop) -> (Rc<UdpEndpoint>, Rc<RefCell<Vec<Rc<KcpTransport>>>>) {
        let (sink, sessions) = collecting_sink();
        let endpoint = ev.enter(|ctx| UdpEndpoint::bind_listener(ctx, "127.0.0.1:0".parse().unwrap(), sink)).unwrap();
        (endpoint, sessions)
    }

    /// sends `request` from a raw socket and returns the reply, if any
    fn raw_exchange(ev: &EventLoop, to: SocketAddr, requests: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let replies = Rc::new(RefCell::new(Vec::new()));
        let replies2 = replies.clone();
        run_future(ev, async move {
            let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            for request in requests {
                raw.send_to(&request, to).await.unwrap();
                let mut buf = [0u8; 64];
                if let Ok(Ok((n, _))) = tokio::time::timeout(Duration::from_millis(100), raw.recv_from(&mut buf)).await {
                    replies2.borrow_mut().push(buf[..n].to_vec());
                }
            }
        });
        let result = replies.borrow().clone();
        result
    }

    #[test]
    fn test_listener_replies_with_echoed_nonce() {
        let ev = test_event_loop();
        let (endpoint, _) = listener(&ev);

        let replies = raw_exchange(&ev, endpoint.local_addr(), vec![vec![9, 8, 7, 6], vec![9, 8, 7, 6]]);

        assert_eq!(replies.len(), 2);
        assert_eq!(&replies[0][..4], &[9, 8, 7, 6]);
        assert_eq!(replies[0].len(), 8);
        // a resent nonce gets the same conv
        assert_eq!(replies[0], replies[1]);
        assert_eq!(endpoint.pending_handshakes(), 1);
    }

    #[test]
    fn test_listener_ignores_garbage() {
        let ev = test_event_loop();
        let (endpoint, sessions) = listener(&ev);

        let replies = raw_exchange(&ev, endpoint.local_addr(), vec![vec![1, 2, 3], vec![0; 23], vec![1; 30]]);

        assert!(replies.is_empty());
        assert!(sessions.borrow().is_empty());
        assert_eq!(endpoint.pending_handshakes(), 0);
    }

    #[test]
    fn test_packet_after_handshake_expiry_is_dropped() {
        let ev = test_event_loop_paused();
        let (endpoint, sessions) = listener(&ev);
        let to = endpoint.local_addr();
        let ttl = ev.context().config().handshake_ttl;

        run_future(&ev, async move {
            let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            raw.send_to(&[1, 2, 3, 4], to).await.unwrap();
            let mut buf = [0u8; 64];
            let (n, _) = raw.recv_from(&mut buf).await.unwrap();
            let (_, conv) = parse_reply(&buf[..n]).unwrap();

            tokio::time::sleep(ttl + Duration::from_millis(100)).await;

            let mut packet = conv.to_le_bytes().to_vec();
            packet.resize(HEADER_LEN, 0);
            raw.send_to(&packet, to).await.unwrap();

            // datagrams are handled in order, so once this is answered the late packet was seen
            let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            other.send_to(&[5, 6, 7, 8], to).await.unwrap();
            other.recv_from(&mut buf).await.unwrap();
        });

        assert!(sessions.borrow().is_empty());
        assert_eq!(endpoint.session_count(), 0);
    }

    #[test]
    fn test_dialer_connects_and_exchanges_frames() {
        let ev = test_event_loop();
        let (listener_endpoint, accepted) = listener(&ev);
        let (sink, connected) = collecting_sink();
        let dialer_endpoint = ev.enter(|ctx| UdpEndpoint::connect(ctx, listener_endpoint.local_addr(), sink)).unwrap();

        let c = connected.clone();
        assert!(run_until(&ev, 2000, move || !c.borrow().is_empty()));
        assert!(dialer_endpoint.is_connected());

        // the ack travels through the ARQ, the listener learns about the session from it
        let client = connected.borrow()[0].clone();
        let ctx = ev.context();
        let c = client.clone();
        let a = accepted.clone();
        assert!(run_until(&ev, 2000, move || {
            c.update(ctx.now_ms()).unwrap();
            !a.borrow().is_empty()
        }));

        let server = accepted.borrow()[0].clone();
        let server_handler = RecordingHandler::bind(server.as_ref());
        assert_eq!(server.conv(), client.conv());
        assert_eq!(listener_endpoint.pending_handshakes(), 0);
        assert_eq!(listener_endpoint.session_count(), 1);

        client.send_frame(frame_payload(b"hello").unwrap()).unwrap();
        client.flush().unwrap();

        let ctx = ev.context();
        let h = server_handler.clone();
        assert!(run_until(&ev, 2000, move || {
            server.update(ctx.now_ms()).unwrap();
            h.packages().iter().any(|p| p == b"hello")
        }));
        // the handshake ack frame is delivered like any other frame
        assert_eq!(server_handler.packages(), vec![vec![0], b"hello".to_vec()]);
    }

    #[test]
    fn test_second_listener_on_port_fails() {
        let ev = test_event_loop();
        let (endpoint, _) = listener(&ev);
        let (sink, _) = collecting_sink();

        let second = ev.enter(|ctx| UdpEndpoint::bind_listener(ctx, endpoint.local_addr(), sink));
        assert!(second.is_err());
    }

    #[test]
    fn test_released_listener_socket_is_reused() {
        let ev = test_event_loop();
        let (endpoint, _) = listener(&ev);
        endpoint.release_owner();

        let (sink, _) = collecting_sink();
        let second = ev.enter(|ctx| UdpEndpoint::bind_listener(ctx, endpoint.local_addr(), sink)).unwrap();
        assert!(Rc::ptr_eq(&endpoint, &second));
    }

    #[test]
    fn test_registry_cleared_on_drop() {
        let ev = test_event_loop();
        let (endpoint, _) = listener(&ev);
        let port = endpoint.local_addr().port() as i32;
        assert!(ev.context().lookup_udp(port).is_some());

        drop(endpoint);
        assert!(ev.context().lookup_udp(port).is_none());
    }
}
