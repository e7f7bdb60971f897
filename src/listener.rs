use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::disposable::Disposable;
use crate::event_loop::{ActiveHandle, LoopContext};
use crate::peer::Peer;
use crate::transport::rudp::endpoint::{SessionSink, UdpEndpoint};
use crate::transport::rudp::session::KcpTransport;
use crate::transport::stream::StreamTransport;
use crate::transport::Transport;


/// Which transports a [Listener] or [crate::dialer::Dialer] uses.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportMode {
    Tcp,
    Kcp,
    Both,
}

impl TransportMode {
    pub fn uses_tcp(&self) -> bool {
        matches!(self, TransportMode::Tcp | TransportMode::Both)
    }

    pub fn uses_kcp(&self) -> bool {
        matches!(self, TransportMode::Kcp | TransportMode::Both)
    }
}

const TCP_BACKLOG: i32 = 128;

/// Accepts connections on TCP and / or reliable UDP on the same port, and hands every accepted
///  connection to the application as a [Peer].
pub struct Listener {
    inner: Rc<ListenerInner>,
}

struct ListenerInner {
    ctx: Rc<LoopContext>,
    local_port: Cell<u16>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
    udp: RefCell<Option<Rc<UdpEndpoint>>>,
    on_accept: RefCell<Option<Box<dyn FnMut(Peer)>>>,
    active: RefCell<Option<ActiveHandle>>,
    disposed: Cell<bool>,
}

impl Listener {
    /// Starts listening. With port 0, TCP picks a free port and reliable UDP listens on the same
    ///  port number.
    pub fn new(ctx: &Rc<LoopContext>, ip: &str, port: u16, mode: TransportMode) -> anyhow::Result<Listener> {
        let ip: IpAddr = ip.parse()
            .with_context(|| format!("invalid listen address {}", ip))?;

        let tcp_listener = if mode.uses_tcp() {
            Some(bind_tcp(SocketAddr::new(ip, port))?)
        }
        else {
            None
        };
        let local_port = match &tcp_listener {
            Some(l) => l.local_addr()?.port(),
            None => port,
        };

        let listener = Listener {
            inner: Rc::new(ListenerInner {
                ctx: ctx.clone(),
                local_port: Cell::new(local_port),
                accept_task: RefCell::new(None),
                udp: RefCell::new(None),
                on_accept: RefCell::new(None),
                active: RefCell::new(Some(ActiveHandle::new(ctx))),
                disposed: Cell::new(false),
            }),
        };

        if mode.uses_kcp() {
            let myself = Rc::downgrade(&listener.inner);
            let sink: SessionSink = Rc::new(move |session: Rc<KcpTransport>| {
                if let Some(inner) = myself.upgrade() {
                    inner.accept(session);
                }
            });
            let udp = UdpEndpoint::bind_listener(ctx, SocketAddr::new(ip, local_port), sink)?;
            listener.inner.local_port.set(udp.local_addr().port());
            *listener.inner.udp.borrow_mut() = Some(udp);
        }
        if let Some(tcp_listener) = tcp_listener {
            let task = tokio::task::spawn_local(Self::accept_loop(Rc::downgrade(&listener.inner), tcp_listener));
            *listener.inner.accept_task.borrow_mut() = Some(task);
        }

        info!("listening on {}:{} ({:?})", ip, listener.local_port(), mode);
        Ok(listener)
    }

    async fn accept_loop(myself: Weak<ListenerInner>, tcp_listener: TcpListener) {
        loop {
            let result = tcp_listener.accept().await;

            let Some(inner) = myself.upgrade() else { return; };
            match result {
                Ok((stream, addr)) => {
                    debug!("accepted TCP connection from {:?}", addr);
                    match StreamTransport::new(&inner.ctx, stream) {
                        Ok(transport) => inner.accept(transport),
                        Err(e) => warn!("failed to set up TCP connection from {:?}: {}", addr, e),
                    }
                }
                Err(e) => {
                    // e.g. too many open files: keep listening
                    warn!("error accepting TCP connection: {}", e);
                }
            }
        }
    }

    /// Called with every accepted connection. A peer the application does not keep is closed.
    pub fn set_on_accept(&self, on_accept: impl FnMut(Peer) + 'static) {
        *self.inner.on_accept.borrow_mut() = Some(Box::new(on_accept));
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port.get()
    }
}

impl Disposable for Listener {
    fn disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Stops accepting. Connections that were accepted already are not affected.
    fn dispose(&self, _graceful: bool) {
        self.inner.dispose();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl Debug for Listener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listener{{port:{}, disposed:{}}}", self.inner.local_port.get(), self.inner.disposed.get())
    }
}

impl ListenerInner {
    fn accept<T: Transport + 'static>(&self, transport: Rc<T>) {
        if self.disposed.get() {
            transport.dispose(false);
            return;
        }

        let peer = match Peer::new(&self.ctx, transport) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("failed to set up accepted connection: {}", e);
                return;
            }
        };

        let Some(mut on_accept) = self.on_accept.borrow_mut().take() else {
            debug!("no accept handler, closing connection from {:?}", peer.peer_addr());
            peer.dispose(false);
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

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        debug!("closing listener on port {}", self.local_port.get());

        if let Some(task) = self.accept_task.borrow_mut().take() {
            task.abort();
        }
        if let Some(udp) = self.udp.borrow_mut().take() {
            udp.release_owner();
        }
        self.on_accept.borrow_mut().take();
        self.active.borrow_mut().take();
    }
}

fn bind_tcp(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())
        .with_context(|| format!("binding TCP listener to {:?}", addr))?;
    socket.listen(TCP_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}


#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::test_util::message::TestMessage;
    use crate::test_util::{run_future, run_until, test_event_loop};

    fn accepting(ev: &EventLoop, mode: TransportMode) -> (Listener, Rc<RefCell<Vec<Peer>>>) {
        let listener = ev.enter(|ctx| Listener::new(ctx, "127.0.0.1", 0, mode)).unwrap();
        let peers = Rc::new(RefCell::new(Vec::new()));
        let peers2 = peers.clone();
        listener.set_on_accept(move |peer| peers2.borrow_mut().push(peer));
        (listener, peers)
    }

    #[test]
    fn test_accept_tcp() {
        let ev = test_event_loop();
        let (listener, peers) = accepting(&ev, TransportMode::Both);
        let port = listener.local_port();
        assert_ne!(port, 0);

        let frame = ev.context().encode(0, &TestMessage::new("hi")).unwrap();
        run_future(&ev, async move {
            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            client.write_all(&frame).await.unwrap();
            client.flush().await.unwrap();
            // leak the connection into a task so it stays open
            tokio::task::spawn_local(async move {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                drop(client);
            });
        });

        let p = peers.clone();
        assert!(run_until(&ev, 1000, move || !p.borrow().is_empty()));

        let peer = peers.borrow()[0].clone();
        assert!(!peer.is_kcp());
        assert_eq!(peer.ip(), "127.0.0.1");

        let pushes = Rc::new(RefCell::new(Vec::new()));
        let pushes2 = pushes.clone();
        peer.set_on_receive_push(move |_, msg| {
            pushes2.borrow_mut().push(msg.downcast_ref::<TestMessage>().unwrap().text.clone());
            Ok(())
        });
        let p = pushes.clone();
        assert!(run_until(&ev, 1000, move || !p.borrow().is_empty()));
        assert_eq!(*pushes.borrow(), vec!["hi".to_string()]);
    }

    #[test]
    fn test_kcp_uses_tcp_port() {
        let ev = test_event_loop();
        let (listener, _) = accepting(&ev, TransportMode::Both);
        let endpoint = ev.context().lookup_udp(listener.local_port() as i32).unwrap();
        assert_eq!(endpoint.local_addr().port(), listener.local_port());
    }

    #[test]
    fn test_second_kcp_listener_fails() {
        let ev = test_event_loop();
        let (listener, _) = accepting(&ev, TransportMode::Kcp);
        let port = listener.local_port();

        assert!(ev.enter(|ctx| Listener::new(ctx, "127.0.0.1", port, TransportMode::Kcp)).is_err());

        listener.dispose(true);
        assert!(listener.disposed());
        assert!(ev.enter(|ctx| Listener::new(ctx, "127.0.0.1", port, TransportMode::Kcp)).is_ok());
    }

    #[test]
    fn test_invalid_ip() {
        let ev = test_event_loop();
        assert!(ev.enter(|ctx| Listener::new(ctx, "not an ip", 0, TransportMode::Tcp)).is_err());
    }

    #[test]
    fn test_disposed_listener_stops_accepting() {
        let ev = test_event_loop();
        let (listener, peers) = accepting(&ev, TransportMode::Tcp);
        let port = listener.local_port();
        listener.dispose(false);

        let refused = Rc::new(RefCell::new(None));
        let refused2 = refused.clone();
        run_future(&ev, async move {
            // give the aborted accept task a chance to close the socket
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let result = TcpStream::connect(("127.0.0.1", port)).await;
            *refused2.borrow_mut() = Some(result.is_err());
        });
        assert_eq!(*refused.borrow(), Some(true));
        assert!(peers.borrow().is_empty());
    }
}
