//! A typed, bounded, in-process message-passing primitive with
//! request/reply semantics.
//!
//! Every task that wants to receive messages registers an [`Inbox`] with
//! the bus and gets back a [`TaskHandle`] that other tasks use to address
//! it. There is no routing beyond that: a handle names exactly one bounded
//! queue, and messages sent to it are delivered in FIFO order from a given
//! sender (tokio's mpsc already guarantees this), but in no particular
//! order across senders, per the ordering guarantees a caller should
//! expect from this primitive.

use {
  bytes::Bytes,
  parking_lot::Mutex,
  std::{collections::HashMap, sync::atomic::AtomicU64, sync::atomic::Ordering, sync::Arc},
  thiserror::Error,
  tokio::sync::{mpsc, oneshot},
};

/// Default inbox capacity for tasks that don't need a larger backlog.
pub const DEFAULT_INBOX_CAPACITY: usize = 8;

/// Opaque identifier for a task registered with the bus.
///
/// Cheap to copy and compare; carries no information beyond identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl TaskHandle {
  fn next() -> Self {
    Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
  }
}

impl std::fmt::Display for TaskHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "task#{}", self.0)
  }
}

impl TaskHandle {
  /// Encodes the handle so it can travel as a message payload, the same
  /// way transport announces itself to the engine (bus message type 0,
  /// whose payload is "transport's task handle").
  pub fn to_bytes(self) -> [u8; 8] {
    self.0.to_le_bytes()
  }

  pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
    Some(Self(u64::from_le_bytes(bytes.try_into().ok()?)))
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("inbox is full")]
  Full,

  #[error("receiver's inbox has been dropped")]
  Closed,

  #[error("reply channel was dropped before a reply was sent")]
  NoReply,
}

/// A message in flight on the bus.
///
/// `msg_type` carries protocol-level meaning assigned by whoever is using
/// the bus (see `engine::dispatch` for the meanings this workspace
/// assigns to specific type values). `reply` is populated only for
/// request/reply exchanges.
#[derive(Debug)]
pub struct Envelope {
  pub msg_type: u16,
  pub payload: Bytes,
  pub sender: Option<TaskHandle>,
  reply: Option<oneshot::Sender<Bytes>>,
}

impl Envelope {
  pub fn new(
    msg_type: u16,
    payload: impl Into<Bytes>,
    sender: Option<TaskHandle>,
  ) -> Self {
    Self {
      msg_type,
      payload: payload.into(),
      sender,
      reply: None,
    }
  }

  /// True if this envelope is a request awaiting a reply.
  pub fn wants_reply(&self) -> bool {
    self.reply.is_some()
  }

  /// Satisfies a pending request. A no-op (other than logging) if the
  /// requester has already given up waiting.
  pub fn reply(mut self, payload: impl Into<Bytes>) {
    if let Some(tx) = self.reply.take() {
      if tx.send(payload.into()).is_err() {
        tracing::debug!("reply sent but requester is no longer listening");
      }
    } else {
      tracing::debug!("reply() called on an envelope that wasn't a request");
    }
  }
}

/// The receiving end of a task's registered inbox.
pub struct Inbox {
  handle: TaskHandle,
  rx: mpsc::Receiver<Envelope>,
  registry: Arc<Mutex<HashMap<TaskHandle, mpsc::Sender<Envelope>>>>,
}

impl Inbox {
  pub fn handle(&self) -> TaskHandle {
    self.handle
  }

  /// Blocking receive: suspends until a message arrives or every sender
  /// has dropped its handle to this inbox.
  pub async fn recv(&mut self) -> Option<Envelope> {
    self.rx.recv().await
  }

  /// Non-blocking receive: returns `None` immediately if the inbox is
  /// empty. Used by the engine's "drain at most one message per tick"
  /// loop.
  pub fn try_recv(&mut self) -> Option<Envelope> {
    self.rx.try_recv().ok()
  }
}

impl Drop for Inbox {
  fn drop(&mut self) {
    self.registry.lock().remove(&self.handle);
  }
}

/// The sending end of a registered task's inbox. Cheap to clone; every
/// producer that wants to talk to a task holds one of these.
#[derive(Clone)]
pub struct Mailbox {
  to: TaskHandle,
  tx: mpsc::Sender<Envelope>,
}

impl Mailbox {
  pub fn task(&self) -> TaskHandle {
    self.to
  }

  /// Non-blocking send. Fails immediately if the destination's inbox is
  /// full or has been dropped.
  pub fn try_send(&self, envelope: Envelope) -> Result<(), Error> {
    self.tx.try_send(envelope).map_err(|e| match e {
      mpsc::error::TrySendError::Full(_) => Error::Full,
      mpsc::error::TrySendError::Closed(_) => Error::Closed,
    })
  }

  /// Blocking send: suspends until there is room in the destination's
  /// inbox.
  pub async fn send(&self, envelope: Envelope) -> Result<(), Error> {
    self.tx.send(envelope).await.map_err(|_| Error::Closed)
  }

  /// Sends a request and awaits its reply. The caller blocks with no
  /// timeout: the callee is expected to always service requests
  /// promptly (see `engine`'s leader-query handling).
  pub async fn request(
    &self,
    msg_type: u16,
    payload: impl Into<Bytes>,
    sender: Option<TaskHandle>,
  ) -> Result<Bytes, Error> {
    let (tx, rx) = oneshot::channel();
    let envelope = Envelope {
      msg_type,
      payload: payload.into(),
      sender,
      reply: Some(tx),
    };
    self.send(envelope).await?;
    rx.await.map_err(|_| Error::NoReply)
  }
}

/// Registers a new task's inbox with the given capacity, returning the
/// inbox (kept by the owning task) and a mailbox (handed out to anyone
/// who needs to address it).
///
/// Use this when the caller already holds the mailbox it needs (e.g. in
/// tests, or when a component is handed its peer's mailbox directly at
/// construction time). Tasks that need to be *discovered* by others
/// through an opaque handle should instead register with a [`Bus`].
pub fn register(capacity: usize) -> (Inbox, Mailbox) {
  let handle = TaskHandle::next();
  let (tx, rx) = mpsc::channel(capacity.max(1));
  (
    Inbox {
      handle,
      rx,
      registry: Arc::new(Mutex::new(HashMap::new())),
    },
    Mailbox { to: handle, tx },
  )
}

/// A registry mapping [`TaskHandle`]s to mailboxes.
///
/// This is how the transport and engine tasks find each other: transport
/// repeatedly announces its handle to the engine at startup until the
/// engine is ready to receive it (bus message type 0). Resolving "the
/// engine's handle" to a live mailbox needs this registry because neither
/// side already holds a reference to the other at that point.
#[derive(Clone, Default)]
pub struct Bus {
  registry: Arc<Mutex<HashMap<TaskHandle, mpsc::Sender<Envelope>>>>,
}

impl Bus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a new task inbox on this bus and returns it. The task's
  /// handle becomes resolvable via [`Bus::mailbox`] as soon as this
  /// returns, even before the owning task starts polling it.
  pub fn register(&self, capacity: usize) -> Inbox {
    let handle = TaskHandle::next();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    self.registry.lock().insert(handle, tx);
    Inbox {
      handle,
      rx,
      registry: self.registry.clone(),
    }
  }

  /// Resolves a task handle to a mailbox, if that task is still
  /// registered. Returns `None` if the handle is unknown or the task has
  /// since dropped its inbox.
  pub fn mailbox(&self, handle: TaskHandle) -> Option<Mailbox> {
    let tx = self.registry.lock().get(&handle)?.clone();
    Some(Mailbox { to: handle, tx })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn send_recv_round_trips() {
    let (mut inbox, mailbox) = register(DEFAULT_INBOX_CAPACITY);
    mailbox
      .send(Envelope::new(42, Bytes::from_static(b"hi"), None))
      .await
      .unwrap();
    let got = inbox.recv().await.unwrap();
    assert_eq!(got.msg_type, 42);
    assert_eq!(&got.payload[..], b"hi");
  }

  #[tokio::test]
  async fn try_send_fails_when_full() {
    let (mut _inbox, mailbox) = register(1);
    mailbox
      .try_send(Envelope::new(1, Bytes::new(), None))
      .unwrap();
    let err = mailbox.try_send(Envelope::new(1, Bytes::new(), None));
    assert!(matches!(err, Err(Error::Full)));
  }

  #[tokio::test]
  async fn try_recv_empty_returns_none() {
    let (mut inbox, _mailbox) = register(DEFAULT_INBOX_CAPACITY);
    assert!(inbox.try_recv().is_none());
  }

  #[tokio::test]
  async fn request_reply_round_trips() {
    let (mut inbox, mailbox) = register(DEFAULT_INBOX_CAPACITY);
    let requester = tokio::spawn(async move {
      mailbox.request(2, Bytes::new(), None).await.unwrap()
    });

    let envelope = inbox.recv().await.unwrap();
    assert!(envelope.wants_reply());
    envelope.reply(Bytes::from_static(b"fe80::1"));

    let reply = requester.await.unwrap();
    assert_eq!(&reply[..], b"fe80::1");
  }

  #[tokio::test]
  async fn closed_inbox_reports_closed() {
    let (inbox, mailbox) = register(DEFAULT_INBOX_CAPACITY);
    drop(inbox);
    let err = mailbox.send(Envelope::new(1, Bytes::new(), None)).await;
    assert!(matches!(err, Err(Error::Closed)));
  }

  #[tokio::test]
  async fn bus_resolves_registered_handles() {
    let bus = Bus::new();
    let mut inbox = bus.register(DEFAULT_INBOX_CAPACITY);
    let handle = inbox.handle();

    assert!(bus.mailbox(TaskHandle::next()).is_none());
    let mailbox = bus.mailbox(handle).expect("just registered");

    mailbox
      .send(Envelope::new(0, Bytes::new(), None))
      .await
      .unwrap();
    assert!(inbox.recv().await.is_some());
  }

  #[tokio::test]
  async fn bus_forgets_dropped_inboxes() {
    let bus = Bus::new();
    let inbox = bus.register(DEFAULT_INBOX_CAPACITY);
    let handle = inbox.handle();
    drop(inbox);
    assert!(bus.mailbox(handle).is_none());
  }

  #[test]
  fn task_handle_round_trips_through_bytes() {
    let bus = Bus::new();
    let handle = bus.register(1).handle();
    assert_eq!(TaskHandle::from_bytes(&handle.to_bytes()), Some(handle));
  }
}
