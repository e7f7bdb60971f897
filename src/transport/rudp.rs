//! Reliable UDP: a KCP control block per session, many sessions per UDP socket.
//!
//! A socket is a [endpoint::UdpEndpoint]. It demultiplexes datagrams by the conv in the ARQ
//!  header and runs the [handshake] that assigns convs. Each session is a
//!  [session::KcpTransport] wrapping a [kcp::Kcp].
pub mod endpoint;
pub mod handshake;
pub mod session;
