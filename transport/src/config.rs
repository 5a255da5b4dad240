use std::{net::Ipv6Addr, time::Duration};

/// Tunable constants for the UDP transport: bind port, multicast group,
/// buffer size, and handshake retry parameters.
#[derive(Debug, Clone)]
pub struct Config {
  /// The well-known election UDP port.
  pub bind_port: u16,

  /// All-nodes link-local multicast group, `ff02::1`.
  pub multicast_group: Ipv6Addr,

  /// Receive buffer size, rounded up to the wire grammar's 256-byte
  /// datagram cap.
  pub recv_buffer_size: usize,

  /// Consecutive handshake attempts before transport gives up and
  /// terminates.
  pub handshake_attempts: u32,

  /// Delay between handshake attempts.
  pub handshake_interval: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      bind_port: 3142,
      multicast_group: Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1),
      recv_buffer_size: 256,
      handshake_attempts: 10,
      handshake_interval: Duration::from_secs(1),
    }
  }
}
