//! Link-local IPv6 multicast UDP transport.
//!
//! Binds the well-known election port, joins the all-nodes multicast
//! group, announces itself to the engine over the bus with a capped
//! retry handshake, then relays datagrams in both directions until the
//! engine's side of the bus closes.

pub mod config;

use {
  bytes::Bytes,
  config::Config,
  leaderelect_bus::{Bus, Envelope, Inbox, Mailbox, TaskHandle},
  socket2::{Domain, Protocol, SockAddr, Socket, Type},
  std::net::{IpAddr, SocketAddr, SocketAddrV6},
  thiserror::Error,
  tokio::{net::UdpSocket, task::JoinHandle},
  tracing::{debug, info, warn},
};

/// Bus message type the engine assigns to "transport announcing its
/// handle" (`engine::msg_type::ANNOUNCE_TRANSPORT`). Duplicated here
/// rather than pulling in the engine crate, since it's the one constant
/// this crate needs to agree with the engine on.
const ANNOUNCE_TRANSPORT: u16 = 0;

#[derive(Debug, Error)]
pub enum Error {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to announce to the engine after {0} attempts")]
  HandshakeFailed(u32),
}

/// Binds the election socket, performs the startup handshake with the
/// engine identified by `engine_handle`, and spawns the relay loop.
pub async fn spawn(
  bus: Bus,
  engine_handle: TaskHandle,
  config: Config,
) -> Result<JoinHandle<()>, Error> {
  let inbox = bus.register(32);
  let own_handle = inbox.handle();
  let engine_mailbox = announce(&bus, engine_handle, own_handle, &config).await?;
  let socket = bind_multicast(&config)?;
  let dest = SocketAddr::new(IpAddr::V6(config.multicast_group), config.bind_port);
  Ok(tokio::spawn(run_loop(
    socket,
    inbox,
    engine_mailbox,
    dest,
    config.recv_buffer_size,
  )))
}

async fn announce(
  bus: &Bus,
  engine_handle: TaskHandle,
  own_handle: TaskHandle,
  config: &Config,
) -> Result<Mailbox, Error> {
  for attempt in 1..=config.handshake_attempts {
    if let Some(mailbox) = bus.mailbox(engine_handle) {
      let envelope = Envelope::new(
        ANNOUNCE_TRANSPORT,
        Bytes::copy_from_slice(&own_handle.to_bytes()),
        Some(own_handle),
      );
      match mailbox.send(envelope).await {
        Ok(()) => {
          info!(attempt, "announced transport handle to engine");
          return Ok(mailbox);
        }
        Err(e) => warn!(attempt, error = %e, "failed to announce to engine"),
      }
    } else {
      warn!(attempt, "engine's task handle not yet resolvable on the bus");
    }
    tokio::time::sleep(config.handshake_interval).await;
  }
  Err(Error::HandshakeFailed(config.handshake_attempts))
}

fn bind_multicast(config: &Config) -> Result<UdpSocket, Error> {
  let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
  socket.set_reuse_address(true)?;
  socket.set_nonblocking(true)?;
  let bind_addr = SocketAddrV6::new(std::net::Ipv6Addr::UNSPECIFIED, config.bind_port, 0, 0);
  socket.bind(&SockAddr::from(bind_addr))?;
  socket.join_multicast_v6(&config.multicast_group, 0)?;
  Ok(UdpSocket::from_std(socket.into())?)
}

async fn run_loop(
  socket: UdpSocket,
  mut inbox: Inbox,
  engine: Mailbox,
  dest: SocketAddr,
  recv_buffer_size: usize,
) {
  let mut buf = vec![0u8; recv_buffer_size];
  loop {
    tokio::select! {
      recv = socket.recv_from(&mut buf) => {
        match recv {
          Ok((len, from)) => handle_inbound(&engine, &buf[..len], from),
          // transient socket errors are logged, never fatal.
          Err(e) => warn!(error = %e, "transient error receiving UDP datagram"),
        }
      }
      envelope = inbox.recv() => {
        match envelope {
          Some(envelope) => {
            if let Err(e) = socket.send_to(&envelope.payload, dest).await {
              warn!(error = %e, "failed to send multicast datagram");
            }
          }
          None => {
            info!("engine side of the bus closed, shutting down transport");
            return;
          }
        }
      }
    }
  }
}

fn handle_inbound(engine: &Mailbox, payload: &[u8], from: SocketAddr) {
  if payload.is_empty() || payload.len() >= 256 {
    warn!(len = payload.len(), %from, "dropping oversized or empty datagram");
    return;
  }
  let envelope = Envelope::new(payload.len() as u16, Bytes::copy_from_slice(payload), None);
  if let Err(e) = engine.try_send(envelope) {
    warn!(error = %e, %from, "engine inbox full or closed, dropping inbound datagram");
  } else {
    debug!(%from, len = payload.len(), "delivered inbound datagram to engine");
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    leaderelect_bus::Bus,
    std::net::{Ipv6Addr, SocketAddrV6},
  };

  fn loopback_socket() -> UdpSocket {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).unwrap();
    socket.set_nonblocking(true).unwrap();
    socket
      .bind(&SockAddr::from(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0)))
      .unwrap();
    UdpSocket::from_std(socket.into()).unwrap()
  }

  #[tokio::test]
  async fn inbound_datagram_reaches_engine_mailbox() {
    let socket = loopback_socket();
    let peer = loopback_socket();
    let local_addr = socket.local_addr().unwrap();

    let bus = Bus::new();
    let mut engine_inbox = bus.register(8);
    let engine_mailbox = bus.mailbox(engine_inbox.handle()).unwrap();
    let transport_inbox = bus.register(8);

    tokio::spawn(run_loop(socket, transport_inbox, engine_mailbox, local_addr, 256));

    peer.send_to(b"nd_init", local_addr).await.unwrap();

    let envelope = tokio::time::timeout(std::time::Duration::from_secs(2), engine_inbox.recv())
      .await
      .expect("timed out waiting for inbound datagram")
      .expect("engine inbox closed unexpectedly");
    assert_eq!(envelope.msg_type, 7);
    assert_eq!(&envelope.payload[..], b"nd_init");
  }

  #[tokio::test]
  async fn outbound_envelope_is_sent_as_a_datagram() {
    let socket = loopback_socket();
    let peer = loopback_socket();
    let socket_addr = socket.local_addr().unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let bus = Bus::new();
    let engine_inbox = bus.register(8);
    let engine_mailbox = bus.mailbox(engine_inbox.handle()).unwrap();
    let transport_inbox = bus.register(8);
    let transport_mailbox = bus.mailbox(transport_inbox.handle()).unwrap();

    tokio::spawn(run_loop(socket, transport_inbox, engine_mailbox, peer_addr, 256));

    transport_mailbox
      .send(Envelope::new(7, Bytes::from_static(b"nd_init"), None))
      .await
      .unwrap();

    let mut buf = [0u8; 64];
    let (len, _from) = tokio::time::timeout(std::time::Duration::from_secs(2), peer.recv_from(&mut buf))
      .await
      .expect("timed out waiting for outbound datagram")
      .unwrap();
    assert_eq!(&buf[..len], b"nd_init");
    let _ = socket_addr;
  }
}
