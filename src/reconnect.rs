//! Keeping a client session alive: dial, announce ourselves, wait for the server's first package,
//!  then keep pinging. Any failure starts over with a fresh dial.
//!
//! ```ascii
//!            Tick / Dial
//!   Idle ------------------> Connecting
//!    ^  ^                      |    |
//!    |  +---- DialFailed ------+    | DialSucceeded / SendEnter
//!    |                              v
//!    |                          Connected
//!    |                              | EnterSent
//!    |                              v
//!    +-- first package timeout -- AwaitingFirstPackage
//!    |                              | PackageReceived
//!    |                              v
//!    +------ PeerLost ---------- Running  (SendPing every N ticks)
//! ```
//!
//! [ReconnectMachine] is the pure state machine, [Reconnector] drives it on the event loop.

use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, trace, warn};

use crate::config::NetConfig;
use crate::dialer::Dialer;
use crate::disposable::Disposable;
use crate::event_loop::LoopContext;
use crate::listener::TransportMode;
use crate::message::Message;
use crate::peer::Peer;
use crate::timer::Timer;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReconnectState {
    Idle,
    Connecting,
    /// connected, the enter message is on its way
    Connected,
    AwaitingFirstPackage,
    Running,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReconnectEvent {
    Tick { now_ms: u64 },
    DialSucceeded,
    DialFailed,
    EnterSent { now_ms: u64 },
    PackageReceived,
    PeerLost,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReconnectAction {
    Dial,
    SendEnter,
    SendPing,
    DropPeer,
}

pub struct ReconnectMachine {
    state: ReconnectState,
    first_package_timeout_ms: u64,
    ping_interval_ticks: u32,
    first_package_deadline_ms: u64,
    running_ticks: u32,
}

impl ReconnectMachine {
    /// `ping_interval_ticks == 0` disables pings.
    pub fn new(first_package_timeout_ms: u64, ping_interval_ticks: u32) -> ReconnectMachine {
        ReconnectMachine {
            state: ReconnectState::Idle,
            first_package_timeout_ms,
            ping_interval_ticks,
            first_package_deadline_ms: 0,
            running_ticks: 0,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// Applies an event and returns what the driver has to do. Events that do not apply to the
    ///  current state are ignored.
    pub fn advance(&mut self, event: ReconnectEvent) -> Vec<ReconnectAction> {
        use ReconnectAction::*;
        use ReconnectEvent::*;
        use ReconnectState::*;

        let (next, actions) = match (self.state, event) {
            (Idle, Tick { .. }) => (Connecting, vec![Dial]),
            (Connecting, DialSucceeded) => (Connected, vec![SendEnter]),
            (Connecting, DialFailed) => (Idle, vec![]),
            (Connected, EnterSent { now_ms }) => {
                self.first_package_deadline_ms = now_ms + self.first_package_timeout_ms;
                (AwaitingFirstPackage, vec![])
            }
            (AwaitingFirstPackage, PackageReceived) => {
                self.running_ticks = 0;
                (Running, vec![])
            }
            (AwaitingFirstPackage, Tick { now_ms }) if now_ms > self.first_package_deadline_ms => {
                debug!("no package from server within {} ms", self.first_package_timeout_ms);
                (Idle, vec![DropPeer])
            }
            (Running, Tick { .. }) => {
                self.running_ticks = self.running_ticks.wrapping_add(1);
                if self.ping_interval_ticks > 0 && self.running_ticks % self.ping_interval_ticks == 0 {
                    (Running, vec![SendPing])
                }
                else {
                    (Running, vec![])
                }
            }
            (Connected | AwaitingFirstPackage | Running, PeerLost) => (Idle, vec![DropPeer]),
            (state, event) => {
                trace!("ignoring {:?} in state {:?}", event, state);
                (state, vec![])
            }
        };

        if next != self.state {
            debug!("reconnect state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
        actions
    }
}

impl Debug for ReconnectMachine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReconnectMachine{{{:?}}}", self.state)
    }
}


/// The application side of a reconnecting session.
pub trait ReconnectHooks {
    /// The push that announces the client after every successful dial
    fn enter_message(&self) -> Box<dyn Message>;

    fn ping_message(&self) -> Box<dyn Message>;

    /// Handles the server's first package after the enter message. An error drops the connection.
    fn on_first_package(&self, peer: &Peer, msg: Box<dyn Message>) -> anyhow::Result<()>;

    fn on_package(&self, peer: &Peer, msg: Box<dyn Message>) -> anyhow::Result<()>;

    /// Round trip time of a ping, `None` if it timed out
    fn on_ping(&self, _rtt_ms: Option<u64>) {}
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub ips: Vec<String>,
    pub port: u16,
    pub mode: TransportMode,
    pub tick_interval: Duration,
    pub dial_timeout: Duration,
    pub first_package_timeout: Duration,
    pub ping_interval_ticks: u32,
    /// An unanswered ping drops the connection.
    pub ping_timeout: Duration,
}

impl ReconnectConfig {
    pub fn new(ips: Vec<String>, port: u16, mode: TransportMode, net_config: &NetConfig) -> ReconnectConfig {
        ReconnectConfig {
            ips,
            port,
            mode,
            tick_interval: Duration::from_millis(16),
            dial_timeout: net_config.default_dial_timeout,
            first_package_timeout: Duration::from_millis(5000),
            ping_interval_ticks: 60,
            ping_timeout: Duration::from_millis(2000),
        }
    }
}

/// Drives a [ReconnectMachine] on its own timer, performing its actions with a [Dialer] and the
///  resulting [Peer].
pub struct Reconnector {
    inner: Rc<ReconnectorInner>,
}

struct ReconnectorInner {
    ctx: Rc<LoopContext>,
    myself: Weak<ReconnectorInner>,
    config: ReconnectConfig,
    hooks: Rc<dyn ReconnectHooks>,
    dialer: Dialer,
    timer: Timer,
    machine: RefCell<ReconnectMachine>,
    peer: RefCell<Option<Peer>>,
    disposed: Cell<bool>,
}

impl Reconnector {
    pub fn new(ctx: &Rc<LoopContext>, config: ReconnectConfig, hooks: Rc<dyn ReconnectHooks>) -> anyhow::Result<Reconnector> {
        let machine = ReconnectMachine::new(config.first_package_timeout.as_millis() as u64, config.ping_interval_ticks);
        let tick_ms = config.tick_interval.as_millis() as u64;

        let inner = Rc::new_cyclic(|myself| ReconnectorInner {
            ctx: ctx.clone(),
            myself: myself.clone(),
            dialer: Dialer::new(ctx, config.mode),
            config,
            hooks,
            timer: Timer::new(ctx),
            machine: RefCell::new(machine),
            peer: RefCell::new(None),
            disposed: Cell::new(false),
        });

        let myself = inner.myself.clone();
        inner.dialer.set_on_accept(move |peer| {
            if let Some(inner) = myself.upgrade() {
                inner.on_dial_result(peer);
            }
        });

        let myself = inner.myself.clone();
        inner.timer.start(0, tick_ms, move || {
            if let Some(inner) = myself.upgrade() {
                inner.tick();
            }
        })?;

        Ok(Reconnector { inner })
    }

    pub fn state(&self) -> ReconnectState {
        self.inner.machine.borrow().state()
    }

    /// The current connection, if there is one
    pub fn peer(&self) -> Option<Peer> {
        self.inner.peer.borrow().clone()
    }
}

impl Disposable for Reconnector {
    fn disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    fn dispose(&self, graceful: bool) {
        if self.inner.disposed.replace(true) {
            return;
        }
        self.inner.timer.stop();
        self.inner.dialer.dispose(graceful);
        let peer = self.inner.peer.borrow_mut().take();
        if let Some(peer) = peer {
            peer.dispose(graceful);
        }
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.dispose(false);
    }
}

impl Debug for Reconnector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reconnector{{{:?}:{}, {:?}}}", self.inner.config.ips, self.inner.config.port, self.state())
    }
}

impl ReconnectorInner {
    fn advance(&self, event: ReconnectEvent) {
        let actions = self.machine.borrow_mut().advance(event);
        for action in actions {
            if self.disposed.get() {
                return;
            }
            self.perform(action);
        }
    }

    fn tick(&self) {
        if self.disposed.get() {
            return;
        }
        let lost = self.peer.borrow().as_ref().is_some_and(|p| p.disposed());
        if lost {
            self.advance(ReconnectEvent::PeerLost);
        }
        self.advance(ReconnectEvent::Tick { now_ms: self.ctx.now_ms() });
    }

    fn perform(&self, action: ReconnectAction) {
        match action {
            ReconnectAction::Dial => {
                let ips: Vec<&str> = self.config.ips.iter()
                    .map(String::as_str)
                    .collect();
                if let Err(e) = self.dialer.dial_ips(&ips, self.config.port, self.config.dial_timeout.as_millis() as u64) {
                    warn!("cannot dial {:?}:{}: {}", self.config.ips, self.config.port, e);
                    self.advance(ReconnectEvent::DialFailed);
                }
            }
            ReconnectAction::SendEnter => {
                let peer = self.peer.borrow().clone();
                let sent = match peer {
                    Some(peer) => peer.send_push(self.hooks.enter_message().as_ref()),
                    None => Err(anyhow!("no connection")),
                };
                match sent {
                    Ok(()) => self.advance(ReconnectEvent::EnterSent { now_ms: self.ctx.now_ms() }),
                    Err(e) => {
                        debug!("sending enter message failed: {}", e);
                        self.advance(ReconnectEvent::PeerLost);
                    }
                }
            }
            ReconnectAction::SendPing => self.send_ping(),
            ReconnectAction::DropPeer => {
                let peer = self.peer.borrow_mut().take();
                if let Some(peer) = peer {
                    peer.dispose(false);
                }
            }
        }
    }

    fn on_dial_result(&self, peer: Option<Peer>) {
        let Some(peer) = peer else {
            self.advance(ReconnectEvent::DialFailed);
            return;
        };

        let myself = self.myself.clone();
        peer.set_on_receive_push(move |peer, msg| {
            match myself.upgrade() {
                Some(inner) => inner.on_package(peer, msg),
                None => Ok(()),
            }
        });
        *self.peer.borrow_mut() = Some(peer);
        self.advance(ReconnectEvent::DialSucceeded);
    }

    fn on_package(&self, peer: &Peer, msg: Box<dyn Message>) -> anyhow::Result<()> {
        let state = self.machine.borrow().state();
        match state {
            ReconnectState::AwaitingFirstPackage => {
                self.hooks.on_first_package(peer, msg)?;
                self.advance(ReconnectEvent::PackageReceived);
                Ok(())
            }
            ReconnectState::Running => self.hooks.on_package(peer, msg),
            _ => {
                trace!("ignoring package in state {:?}", state);
                Ok(())
            }
        }
    }

    fn send_ping(&self) {
        let Some(peer) = self.peer.borrow().clone() else { return; };

        let sent_ms = self.ctx.now_ms();
        let myself = self.myself.clone();
        let result = peer.send_request(self.hooks.ping_message().as_ref(), self.config.ping_timeout.as_millis() as u64, move |response| {
            let Some(inner) = myself.upgrade() else { return Ok(()); };
            match response {
                Some(_) => {
                    inner.hooks.on_ping(Some(inner.ctx.now_ms().saturating_sub(sent_ms)));
                    Ok(())
                }
                None => {
                    inner.hooks.on_ping(None);
                    Err(anyhow!("ping timed out"))
                }
            }
        });

        if let Err(e) = result.and_then(|_| peer.flush()) {
            debug!("ping failed: {}", e);
        }
    }
}
