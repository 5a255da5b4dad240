//! The "malformed input" / "capacity-exceeded" error taxonomy.
//!
//! None of these ever reach the query surface; `who_is_leader` always
//! answers from `self.leader` regardless. They exist so the exceptional
//! paths in `dispatch`/`handle_nd_ack` have a typed `Result` to log at
//! the call site instead of ad hoc string messages.

use {crate::wire::ParseError, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
  #[error("datagram payload is not valid UTF-8")]
  NonUtf8Payload,

  #[error("malformed datagram: {0}")]
  MalformedDatagram(#[from] ParseError),

  #[error("neighbor table is full or already contains this address")]
  NeighborRejected,
}
