use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

/// Maximum UDP payload for IPV4 (65535 - 8 byte UDP header - 20 byte IP header)
pub const MAX_UDP_PAYLOAD: usize = 65507;

#[derive(Debug, Clone)]
pub struct AckConfig {
    /// the address the end point's socket is bound to. Port 0 binds to an ephemeral port, which
    ///  is typical for clients
    pub self_addr: SocketAddr,

    /// The interval at which the retry loop scans pending messages for overdue acknowledgements.
    ///  This is the granularity of retries: a message's ack timeout is effectively rounded up to
    ///  a multiple of it.
    pub retry_interval: Duration,

    /// time after a (re)transmission after which a message counts as lost if it was not
    ///  acknowledged, triggering a retransmission
    pub ack_timeout: Duration,

    /// The number of retransmissions before a message is dropped, i.e. a message is sent at
    ///  most `1 + max_retries` times.
    pub max_retries: u32,

    /// upper bound for an encoded envelope, both for sending and receiving
    pub max_datagram_size: usize,

    /// Peers in explicit acknowledgement mode that send nothing for this long are forgotten,
    ///  falling back to the default mode. `None` keeps them until they unregister.
    ///
    /// Only received datagrams (including acknowledgements) count as activity, so both sides of
    ///  a connection see the same last exchange even if the final message before a pause was
    ///  lost. Both sides should use the same value: a side that evicts earlier stops
    ///  acknowledging while its peer still expects acknowledgements.
    pub peer_idle_timeout: Option<Duration>,
}

impl AckConfig {
    pub fn new(self_addr: SocketAddr) -> AckConfig {
        AckConfig {
            self_addr,
            retry_interval: Duration::from_millis(100),
            ack_timeout: Duration::from_millis(200),
            max_retries: 5,
            max_datagram_size: MAX_UDP_PAYLOAD,
            peer_idle_timeout: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_interval.is_zero() {
            bail!("retry interval must be positive");
        }
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        if self.max_datagram_size < 64 {
            bail!("max datagram size of {} bytes is too small", self.max_datagram_size);
        }
        if self.max_datagram_size > MAX_UDP_PAYLOAD {
            bail!("max datagram size of {} bytes exceeds the maximum UDP payload of {} bytes", self.max_datagram_size, MAX_UDP_PAYLOAD);
        }
        if let Some(peer_idle_timeout) = self.peer_idle_timeout {
            if peer_idle_timeout.is_zero() {
                bail!("peer idle timeout must be positive");
            }
        }
        Ok(())
    }
}
