//! A dual-transport networking engine for a single-threaded event loop.
//!
//! Application messages travel either over TCP (length-prefixed stream framing) or over a KCP-style
//!  reliable UDP protocol that multiplexes many logical connections ("convs") over one shared UDP
//!  socket. Both transports look the same from above: a [peer::Peer] wraps whichever transport
//!  won the connection race and offers push / request / response semantics with timeouts.
//!
//! Everything is driven by an [event_loop::EventLoop], which runs all I/O completions, timers and
//!  user callbacks on one thread. The only way to inject work from other threads is a
//!  [dispatcher::DispatchHandle].
//!
//! ```text
//!  Listener / Dialer  (race TCP and reliable UDP)
//!        |
//!        v
//!      Peer  ---- envelope: i32 correlation id + payload
//!        |
//!        v
//!   Transport  (StreamTransport | KcpTransport)   ---- frame: u32 LE length + payload
//! ```
pub mod config;
pub mod disposable;
pub mod event_loop;
pub mod timer;
pub mod dispatcher;
pub mod resolver;
pub mod message;
pub mod envelope;
pub mod transport;
pub mod peer;
pub mod listener;
pub mod dialer;
pub mod reconnect;
pub mod util;
pub mod test_util;
