use std::cell::RefCell;
use std::io::BufRead;
use std::rc::Rc;

use anyhow::bail;
use clap::Parser;
use clap_derive::Parser;
use dualnet::config::{NetConfig, RunMode};
use dualnet::dispatcher::Dispatcher;
use dualnet::disposable::Disposable;
use dualnet::event_loop::{EventLoop, LoopContext};
use dualnet::listener::TransportMode;
use dualnet::message::Message;
use dualnet::peer::Peer;
use dualnet::reconnect::{ReconnectConfig, ReconnectHooks, Reconnector};
use dualnet::resolver::Resolver;
use dualnet::test_util::message::{TestCodec, TestMessage};
use tracing::{error, info, warn, Level};

/// Connects to an echo server and keeps the connection alive. Every line read from stdin is sent
///  as a push, `quit` ends the session.
#[derive(Parser)]
struct Args {
    host: String,
    port: u16,

    /// tcp, kcp or both
    #[clap(long, default_value = "both")]
    mode: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

thread_local! {
    // only touched on the event loop thread
    static CLIENT: RefCell<Option<(Rc<LoopContext>, Reconnector)>> = const { RefCell::new(None) };
}

pub fn parse_mode(s: &str) -> anyhow::Result<TransportMode> {
    match s {
        "tcp" => Ok(TransportMode::Tcp),
        "kcp" => Ok(TransportMode::Kcp),
        "both" => Ok(TransportMode::Both),
        other => bail!("unknown transport mode {:?}, expected tcp, kcp or both", other),
    }
}

fn text(msg: &dyn Message) -> String {
    msg.downcast_ref::<TestMessage>()
        .map(|m| m.text.clone())
        .unwrap_or_else(|| "<?>".to_string())
}

struct EchoHooks;

impl ReconnectHooks for EchoHooks {
    fn enter_message(&self) -> Box<dyn Message> {
        Box::new(TestMessage::new("enter"))
    }

    fn ping_message(&self) -> Box<dyn Message> {
        Box::new(TestMessage::new("ping"))
    }

    fn on_first_package(&self, peer: &Peer, msg: Box<dyn Message>) -> anyhow::Result<()> {
        info!("entered {:?}: {}", peer.peer_addr(), text(msg.as_ref()));
        Ok(())
    }

    fn on_package(&self, _peer: &Peer, msg: Box<dyn Message>) -> anyhow::Result<()> {
        info!("echo: {}", text(msg.as_ref()));
        Ok(())
    }

    fn on_ping(&self, rtt_ms: Option<u64>) {
        match rtt_ms {
            Some(rtt_ms) => info!("ping: {}ms", rtt_ms),
            None => warn!("ping: timeout"),
        }
    }
}

/// Runs on the loop thread
fn on_input(line: String) {
    let client = CLIENT.with(|c| {
        let c = c.borrow();
        c.as_ref().map(|(ctx, r)| (ctx.clone(), r.peer()))
    });
    let Some((ctx, peer)) = client else { return; };

    if line == "quit" {
        let client = CLIENT.with(|c| c.borrow_mut().take());
        if let Some((_, reconnector)) = client {
            reconnector.dispose(true);
        }
        ctx.stop();
        return;
    }

    match peer {
        Some(peer) => {
            if let Err(e) = peer.send_push(&TestMessage::new(&line)).and_then(|_| peer.flush()) {
                warn!("sending failed: {}", e);
            }
        }
        None => warn!("not connected"),
    }
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
    let dispatcher = ev.enter(|ctx| Dispatcher::new(ctx));
    let resolver = ev.enter(|ctx| Resolver::new(ctx));

    let ctx = ev.context();
    let port = args.port;
    ev.enter(|_| resolver.resolve(&args.host, 2000, move |result| {
        let ips = match result {
            Ok(ips) => ips,
            Err(e) => {
                error!("{}", e);
                ctx.stop();
                return;
            }
        };
        info!("connecting to {:?} port {}", ips, port);

        let config = ReconnectConfig::new(ips, port, mode, ctx.config());
        match Reconnector::new(&ctx, config, Rc::new(EchoHooks)) {
            Ok(reconnector) => CLIENT.with(|c| *c.borrow_mut() = Some((ctx.clone(), reconnector))),
            Err(e) => {
                error!("{}", e);
                ctx.stop();
            }
        }
    }))?;

    let handle = dispatcher.handle();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break; };
            let quit = line == "quit";
            if handle.dispatch(move || on_input(line)).is_err() || quit {
                break;
            }
        }
    });

    ev.run(RunMode::Default)?;

    CLIENT.with(|c| c.borrow_mut().take());
    dispatcher.dispose(false);
    Ok(())
}
