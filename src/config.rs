use std::time::Duration;
use anyhow::bail;


const DEFAULT_MTU: usize = 1400;
const DEFAULT_DEAD_LINK: u32 = 20;


/// Controls how long [crate::event_loop::EventLoop::run] blocks, and how eagerly reliable UDP
///  sessions advance their ARQ clock.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RunMode {
    /// Block until [crate::event_loop::LoopContext::stop] is called or no active handles remain.
    ///  Reliable UDP sessions skip ARQ updates until the ARQ's next scheduled deadline.
    Default,
    /// Process events that are ready right now, then return. Reliable UDP sessions run their ARQ
    ///  update on every tick.
    NoWait,
}

/// Settings of the KCP control block of every reliable UDP session.
#[derive(Debug, Clone)]
pub struct KcpConfig {
    /// Maximum size of a UDP datagram emitted by the ARQ, including its 24 byte header.
    pub mtu: usize,
    /// Send and receive windows in *segments*, not bytes.
    pub send_window: u16,
    pub recv_window: u16,
    /// Use the low-latency retransmission timeout calculation.
    pub nodelay: bool,
    /// Internal flush interval of the ARQ.
    pub interval: Duration,
    /// Retransmit a segment after this many acks for later segments were seen. 0 disables fast
    ///  resend.
    pub fast_resend: u32,
    pub no_congestion_window: bool,
    pub min_rto: Duration,
    /// In stream mode, small sends are coalesced into full segments and message boundaries are
    ///  not preserved by the ARQ. Framing on top restores them.
    pub stream_mode: bool,
    /// A segment that was transmitted this many times without being acknowledged marks the
    ///  session as dead.
    pub dead_link: u32,
}

impl Default for KcpConfig {
    fn default() -> Self {
        KcpConfig {
            mtu: DEFAULT_MTU,
            send_window: 1024,
            recv_window: 1024,
            nodelay: true,
            interval: Duration::from_millis(10),
            fast_resend: 2,
            no_congestion_window: true,
            min_rto: Duration::from_millis(10),
            stream_mode: true,
            dead_link: DEFAULT_DEAD_LINK,
        }
    }
}

impl KcpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 50 || self.mtu > 65507 {
            bail!("KCP mtu must be between 50 and 65507, was {}", self.mtu);
        }
        if self.send_window == 0 || self.recv_window == 0 {
            bail!("KCP windows must not be empty");
        }
        if self.interval < Duration::from_millis(10) || self.interval > Duration::from_millis(5000) {
            bail!("KCP interval must be between 10ms and 5s, was {:?}", self.interval);
        }
        if self.dead_link == 0 {
            bail!("KCP dead link threshold must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Interval of every peer's self-timer, which drives transport updates and request timeouts.
    pub peer_tick_interval: Duration,

    /// A listener-side handshake record that is not completed within this time is discarded, and
    ///  its conv becomes available again.
    pub handshake_ttl: Duration,
    /// Interval of the per-socket timer that purges expired handshakes (listener side) and
    ///  resends handshake nonces (dialer side).
    pub handshake_tick_interval: Duration,
    /// A dialer resends its handshake nonce every this many handshake ticks until it gets a reply.
    pub dial_nonce_resend_ticks: u32,

    /// Connect timeout used by [crate::reconnect::Reconnector] and the demos. Dialing directly
    ///  takes an explicit timeout.
    pub default_dial_timeout: Duration,

    /// Size of the receive buffer for a single read from a socket. Needs to hold the largest UDP
    ///  datagram.
    pub recv_buf_len: usize,

    /// Inbound stream frames longer than this are treated as a protocol violation. This is a
    ///  sanity check against garbage length prefixes which would otherwise make the reassembly
    ///  buffer grow without bound.
    pub max_frame_len: usize,

    pub kcp: KcpConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig::new()
    }
}

impl NetConfig {
    pub fn new() -> NetConfig {
        NetConfig {
            peer_tick_interval: Duration::from_millis(10),
            handshake_ttl: Duration::from_millis(3000),
            handshake_tick_interval: Duration::from_millis(10),
            dial_nonce_resend_ticks: 16,
            default_dial_timeout: Duration::from_millis(2000),
            recv_buf_len: 65535,
            max_frame_len: 16*1024*1024,
            kcp: KcpConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.peer_tick_interval.is_zero() {
            bail!("peer tick interval must be positive");
        }
        if self.handshake_tick_interval.is_zero() {
            bail!("handshake tick interval must be positive");
        }
        if self.handshake_ttl < self.handshake_tick_interval {
            bail!("handshake TTL must be at least one handshake tick");
        }
        if self.dial_nonce_resend_ticks == 0 {
            bail!("nonce resend ticks must be positive");
        }
        if self.recv_buf_len < self.kcp.mtu {
            bail!("receive buffer ({} bytes) must hold a full KCP datagram ({} bytes)", self.recv_buf_len, self.kcp.mtu);
        }
        if self.max_frame_len == 0 || self.max_frame_len > i32::MAX as usize {
            bail!("max frame length must be in 1..=i32::MAX");
        }

        self.kcp.validate()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_default_is_valid() {
        NetConfig::new().validate().unwrap();
    }

    #[rstest]
    #[case::zero_tick(|c: &mut NetConfig| c.peer_tick_interval = Duration::ZERO)]
    #[case::ttl_below_tick(|c: &mut NetConfig| c.handshake_ttl = Duration::from_millis(1))]
    #[case::no_resend(|c: &mut NetConfig| c.dial_nonce_resend_ticks = 0)]
    #[case::tiny_recv_buf(|c: &mut NetConfig| c.recv_buf_len = 100)]
    #[case::zero_frame_len(|c: &mut NetConfig| c.max_frame_len = 0)]
    #[case::tiny_mtu(|c: &mut NetConfig| c.kcp.mtu = 20)]
    #[case::empty_window(|c: &mut NetConfig| c.kcp.recv_window = 0)]
    #[case::fast_interval(|c: &mut NetConfig| c.kcp.interval = Duration::from_millis(1))]
    fn test_invalid(#[case] modify: fn(&mut NetConfig)) {
        let mut config = NetConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
