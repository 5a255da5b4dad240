//! The leader-election engine: neighbor table, election value `m`,
//! current-best `(min, leader)`, and the two timed state machines
//! (neighbor discovery and leader election) that drive them.
//!
//! All of this state is owned exclusively by the task running
//! [`Engine::run`]. No other task reads or writes it directly; the
//! type-2 leader-query request/reply exchanged over the bus is the only
//! exported read channel.

pub mod config;
pub mod error;
pub mod le;
pub mod nd;
pub mod neighbors;
pub mod wire;

use {
  bytes::Bytes,
  config::Config,
  error::Error,
  le::LePhase,
  leaderelect_bus::{Bus, Envelope, Inbox, Mailbox, TaskHandle},
  metrics::{gauge, increment_counter},
  nd::NdPhase,
  neighbors::NeighborTable,
  rand::Rng,
  std::time::Instant,
  tokio::task::JoinHandle,
  tracing::{debug, info, trace, warn},
  wire::Message,
};

/// Bus message types the engine's inbox understands. `>2, <256` is
/// reserved for inbound datagram payloads, with `msg_type` equal to the
/// payload length.
pub mod msg_type {
  pub const ANNOUNCE_TRANSPORT: u16 = 0;
  pub const ANNOUNCE_ADDRESS: u16 = 1;
  pub const LEADER_QUERY: u16 = 2;
}

const UNKNOWN_LEADER: &str = "unknown";
const ENGINE_INBOX_CAPACITY: usize = 32;

/// A cheap, `Clone`-able handle to a running engine, used by the
/// query/shell surface. Holds nothing but a bus mailbox; every
/// interaction crosses the bus.
#[derive(Clone)]
pub struct EngineHandle {
  mailbox: Mailbox,
}

impl EngineHandle {
  /// The mailbox transport announces itself through, and the mailbox an
  /// external query surface sends `who_is_leader` requests to.
  pub fn mailbox(&self) -> Mailbox {
    self.mailbox.clone()
  }

  /// Sends a type-2 request, awaits the reply, no timeout.
  /// The engine's tick loop always services this promptly, so a failed
  /// request here means the engine task has died.
  pub async fn who_is_leader(&self) -> String {
    match self
      .mailbox
      .request(msg_type::LEADER_QUERY, Bytes::new(), None)
      .await
    {
      Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
      Err(e) => {
        warn!(error = %e, "leader query failed, engine task may have died");
        UNKNOWN_LEADER.to_string()
      }
    }
  }
}

/// Registers the engine's inbox on `bus` and spawns its run loop.
pub fn spawn(bus: Bus, config: Config) -> (EngineHandle, JoinHandle<()>) {
  let inbox = bus.register(ENGINE_INBOX_CAPACITY);
  let mailbox = bus
    .mailbox(inbox.handle())
    .expect("just registered this handle");
  let engine = Engine::new(inbox, bus, config);
  let join = tokio::spawn(engine.run());
  (EngineHandle { mailbox }, join)
}

struct Engine {
  inbox: Inbox,
  bus: Bus,
  config: Config,

  m: u16,
  min: u16,
  leader: String,
  own_addr: Option<String>,
  allow_le: bool,
  has_elected_leader: bool,
  seen_transport_announce: bool,
  seen_addr_announce: bool,

  transport: Option<Mailbox>,
  neighbors: Option<NeighborTable>,

  nd: NdPhase,
  le: LePhase,
}

impl Engine {
  fn new(inbox: Inbox, bus: Bus, config: Config) -> Self {
    let now = Instant::now();
    // drawn uniformly at random at startup, immutable thereafter.
    let m: u16 = rand::thread_rng().gen_range(1..=255);
    Self {
      nd: NdPhase::new(now, &config),
      le: LePhase::new(now, &config),
      neighbors: Some(NeighborTable::new(config.max_neighbors)),
      m,
      min: m,
      leader: UNKNOWN_LEADER.to_string(),
      own_addr: None,
      allow_le: false,
      has_elected_leader: false,
      seen_transport_announce: false,
      seen_addr_announce: false,
      transport: None,
      inbox,
      bus,
      config,
    }
  }

  async fn run(mut self) {
    let mut ticker = tokio::time::interval(self.config.tick);
    loop {
      ticker.tick().await;
      let now = Instant::now();

      // drain at most one inbox message per tick.
      if let Some(envelope) = self.inbox.try_recv() {
        self.dispatch(envelope, now);
      }

      self.advance_nd(now);
      self.advance_le(now);
    }
  }

  fn dispatch(&mut self, envelope: Envelope, now: Instant) {
    match envelope.msg_type {
      msg_type::ANNOUNCE_TRANSPORT if !self.seen_transport_announce => {
        match TaskHandle::from_bytes(&envelope.payload) {
          Some(handle) => {
            self.transport = self.bus.mailbox(handle);
            self.seen_transport_announce = true;
            info!("recorded transport's task handle");
          }
          None => warn!("malformed transport announce payload, ignoring"),
        }
      }
      msg_type::ANNOUNCE_ADDRESS if !self.seen_addr_announce => {
        let addr = String::from_utf8_lossy(&envelope.payload).into_owned();
        info!(%addr, "recorded own address");
        self.leader = addr.clone();
        self.own_addr = Some(addr);
        self.allow_le = true;
        self.seen_addr_announce = true;
      }
      msg_type::LEADER_QUERY => {
        trace!(leader = %self.leader, "answering leader query");
        envelope.reply(Bytes::from(self.leader.clone().into_bytes()));
      }
      t if t > 2 && t < 256 => self.handle_datagram(&envelope.payload, now),
      other => debug!(msg_type = other, "ignoring unrecognized bus message"),
    }
  }

  fn handle_datagram(&mut self, payload: &[u8], now: Instant) {
    let msg = match Self::parse_datagram(payload) {
      Ok(msg) => msg,
      Err(e) => {
        debug!(error = %e, "ignoring malformed datagram");
        return;
      }
    };
    increment_counter!("datagrams_received");

    match msg {
      Message::NdInit => {
        if let Some(addr) = self.own_addr.clone() {
          self.send_datagram(Message::NdAck(addr));
        }
      }
      Message::NdAck(addr) => self.handle_nd_ack(addr, now),
      Message::NdHello(_addr) => self.nd.note_ack_received(now),
      Message::LeInit | Message::LeM => {
        if let Some(addr) = self.own_addr.clone() {
          self.broadcast_own_best(addr);
        }
      }
      Message::LeAck { min, leader, sender } => {
        self.handle_le_ack(min, leader, sender)
      }
    }
  }

  fn parse_datagram(payload: &[u8]) -> Result<Message, Error> {
    let text = std::str::from_utf8(payload).map_err(|_| Error::NonUtf8Payload)?;
    Ok(Message::parse(text)?)
  }

  fn handle_nd_ack(&mut self, addr: String, now: Instant) {
    if self.own_addr.as_deref() == Some(addr.as_str()) {
      return;
    }
    let Some(table) = self.neighbors.as_mut() else {
      return;
    };
    if table.try_insert(addr.clone()) {
      increment_counter!("neighbors_discovered");
      gauge!("neighbor_count", table.len() as f64);
      self.nd.note_ack_received(now);
      self.send_datagram(Message::NdHello(addr));
    } else {
      let e = Error::NeighborRejected;
      debug!(error = %e, %addr, "dropping neighbor announcement");
    }
  }

  fn handle_le_ack(&mut self, min: u16, leader: String, sender: String) {
    // locate the sender in the neighbor table; an ack from an unknown
    // sender is dropped.
    let Some(table) = self.neighbors.as_mut() else {
      return;
    };
    if !table.contains(&sender) {
      return;
    }
    // recorded on the neighbor table regardless of whether it advances
    // tempMin, since it's this node's record of what that neighbor last
    // reported.
    if min > 0 {
      table.set_value(&sender, min);
    }
    self.le.note_le_ack(min, leader, sender);
  }

  fn broadcast_own_best(&mut self, own_addr: String) {
    let msg = Message::LeAck {
      min: self.min,
      leader: self.leader.clone(),
      sender: own_addr,
    };
    self.send_datagram(msg);
  }

  fn advance_nd(&mut self, now: Instant) {
    let count = self.neighbors.as_ref().map(|t| t.len()).unwrap_or(0);
    if let nd::Action::Broadcast(msg) = self.nd.tick(now, count) {
      self.send_datagram(msg);
    }
  }

  fn advance_le(&mut self, now: Instant) {
    if self.has_elected_leader || !self.allow_le {
      return;
    }
    let Some(addr) = self.own_addr.clone() else {
      return;
    };
    let count = self.neighbors.as_ref().map(|t| t.len()).unwrap_or(0);
    let result = self.le.tick(now, count, &mut self.min, &mut self.leader, &addr);

    if let Some(msg) = result.broadcast {
      self.send_datagram(msg);
    }

    if result.converged {
      self.has_elected_leader = true;
      // the neighbor table is no longer needed once converged.
      self.neighbors = None;
      increment_counter!("elections_converged");
      gauge!("election_min", self.min as f64);
      info!(min = self.min, leader = %self.leader, "leader election converged");
    }
  }

  fn send_datagram(&self, msg: Message) {
    let Some(transport) = &self.transport else {
      debug!(%msg, "dropping outbound datagram, transport not yet known");
      return;
    };
    let text = msg.to_string();
    let len = text.len();
    if len == 0 || len >= 256 {
      warn!(len, "refusing to send oversized datagram");
      return;
    }
    let envelope = Envelope::new(len as u16, Bytes::from(text.into_bytes()), Some(self.inbox.handle()));
    if let Err(e) = transport.try_send(envelope) {
      warn!(error = %e, "failed to queue outbound datagram");
    }
  }
}
