use std::cell::RefCell;
use std::rc::Rc;

use anyhow::bail;
use clap::Parser;
use clap_derive::Parser;
use dualnet::config::{NetConfig, RunMode};
use dualnet::disposable::Disposable;
use dualnet::event_loop::EventLoop;
use dualnet::listener::{Listener, TransportMode};
use dualnet::peer::Peer;
use dualnet::test_util::message::{TestCodec, TestMessage};
use tracing::{debug, info, Level};

/// Echoes every push and request back to the client that sent it.
#[derive(Parser)]
struct Args {
    ip: String,
    port: u16,

    /// tcp, kcp or both
    #[clap(long, default_value = "both")]
    mode: String,

    /// Clients that stay silent this long are disconnected
    #[clap(long, default_value_t = 30000)]
    idle_timeout_ms: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

pub fn parse_mode(s: &str) -> anyhow::Result<TransportMode> {
    match s {
        "tcp" => Ok(TransportMode::Tcp),
        "kcp" => Ok(TransportMode::Kcp),
        "both" => Ok(TransportMode::Both),
        other => bail!("unknown transport mode {:?}, expected tcp, kcp or both", other),
    }
}

fn text(msg: &dyn dualnet::message::Message) -> &str {
    msg.downcast_ref::<TestMessage>()
        .map(|m| m.text.as_str())
        .unwrap_or("<?>")
}

fn on_accept(peers: &Rc<RefCell<Vec<Peer>>>, peer: Peer, idle_timeout_ms: u64) {
    info!("{:?} connected over {}", peer.peer_addr(), if peer.is_kcp() { "kcp" } else { "tcp" });
    peer.reset_timeout_ms(idle_timeout_ms);

    peer.set_on_receive_push(move |peer, msg| {
        peer.reset_timeout_ms(idle_timeout_ms);
        debug!("push from {}: {}", peer.ip(), text(msg.as_ref()));
        peer.send_push(msg.as_ref())
    });
    peer.set_on_receive_request(move |peer, id, msg| {
        peer.reset_timeout_ms(idle_timeout_ms);
        debug!("request {} from {}: {}", id, peer.ip(), text(msg.as_ref()));
        peer.send_response(id, msg.as_ref())?;
        peer.flush()
    });

    let addr = peer.peer_addr();
    let weak_peers = Rc::downgrade(peers);
    peer.set_on_disconnect(move || {
        info!("{:?} disconnected", addr);
        if let Some(peers) = weak_peers.upgrade() {
            peers.borrow_mut().retain(|p| !p.disposed());
        }
    });

    peers.borrow_mut().push(peer);
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mode = parse_mode(&args.mode)?;
    let ev = EventLoop::new(NetConfig::new(), Rc::new(TestCodec))?;

    let listener = ev.enter(|ctx| Listener::new(ctx, &args.ip, args.port, mode))?;
    let peers: Rc<RefCell<Vec<Peer>>> = Default::default();
    let peers2 = peers.clone();
    let idle_timeout_ms = args.idle_timeout_ms;
    listener.set_on_accept(move |peer| on_accept(&peers2, peer, idle_timeout_ms));

    info!("echo server on port {}", listener.local_port());
    ev.run(RunMode::Default)
}
