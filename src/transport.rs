//! The transport capability: what a [crate::peer::Peer] needs from an underlying connection.
//!
//! There are two implementations, [stream::StreamTransport] over TCP and
//!  [rudp::session::KcpTransport] over reliable UDP. Both deliver the same length-prefixed frames
//!  (see [frame]) to their bound [PackageHandler].
pub mod frame;
pub mod stream;
pub mod rudp;

use std::net::SocketAddr;
use std::rc::Weak;

use bytes::Bytes;

use crate::disposable::Disposable;


/// Receives the payloads of complete inbound frames, in order.
pub trait PackageHandler {
    /// An error is fatal to the connection.
    fn handle_package(&self, payload: Bytes) -> anyhow::Result<()>;

    /// Called once when the transport failed or was closed by the remote side.
    fn on_transport_closed(&self);
}

pub trait Transport: Disposable {
    fn peer_addr(&self) -> SocketAddr;

    /// Sends a complete frame, i.e. including its length prefix. An error means the connection is
    ///  unusable.
    fn send_frame(&self, frame: Bytes) -> anyhow::Result<()>;

    /// Transmits buffered outbound data immediately instead of waiting for the next update.
    fn flush(&self) -> anyhow::Result<()>;

    /// Per-tick processing, driven by the owning peer. Inbound frames decoded here are handed to
    ///  the bound handler before this returns.
    fn update(&self, now_ms: u64) -> anyhow::Result<()>;

    fn is_kcp(&self) -> bool;

    fn bind_handler(&self, handler: Weak<dyn PackageHandler>);
}
