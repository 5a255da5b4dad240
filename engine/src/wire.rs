//! The text wire grammar joining neighbor-discovery and leader-election.
//!
//! A small tagged-variant parser over the payload bytes, in place of
//! hand-rolled prefix/length parsing. `Message` is the tagged variant,
//! `parse`/`Display` are the two directions of the grammar.

use {std::fmt, thiserror::Error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
  /// "I am here, respond": kicks off a neighbor-discovery round.
  NdInit,
  /// "I exist; my address is X".
  NdAck(String),
  /// Direct ack to a newly seen neighbor.
  NdHello(String),
  /// "send me your min": kicks off a leader-election round.
  LeInit,
  /// Alternative request for min. Accepted but never sent by this
  /// implementation: retained for protocol compatibility.
  LeM,
  /// "my current best is (min, leader); I am sender".
  LeAck { min: u16, leader: String, sender: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
  #[error("unrecognized wire message prefix")]
  UnknownPrefix,
  #[error("malformed le_ack payload")]
  MalformedLeAck,
}

impl Message {
  pub fn parse(s: &str) -> Result<Self, ParseError> {
    if s == "nd_init" {
      return Ok(Message::NdInit);
    }
    if let Some(addr) = s.strip_prefix("nd_ack:") {
      return Ok(Message::NdAck(addr.to_string()));
    }
    if let Some(addr) = s.strip_prefix("nd_hello:") {
      return Ok(Message::NdHello(addr.to_string()));
    }
    if s == "le_init" {
      return Ok(Message::LeInit);
    }
    if s == "le_m?:" {
      return Ok(Message::LeM);
    }
    if let Some(rest) = s.strip_prefix("le_ack:") {
      return parse_le_ack(rest);
    }
    Err(ParseError::UnknownPrefix)
  }
}

fn parse_le_ack(rest: &str) -> Result<Message, ParseError> {
  // "<DDD>:<leader_ipv6>;<sender_ipv6>": leader/sender addresses may
  // themselves contain colons, so only the first 4 bytes ("DDD:") are
  // fixed-width; everything else is split on the final ';'.
  if rest.len() < 4 || rest.as_bytes()[3] != b':' {
    return Err(ParseError::MalformedLeAck);
  }
  let (ddd, tail) = rest.split_at(3);
  let min: u16 = ddd.parse().map_err(|_| ParseError::MalformedLeAck)?;
  let tail = &tail[1..]; // drop the ':'
  let (leader, sender) =
    tail.split_once(';').ok_or(ParseError::MalformedLeAck)?;
  if leader.is_empty() || sender.is_empty() {
    return Err(ParseError::MalformedLeAck);
  }
  Ok(Message::LeAck {
    min,
    leader: leader.to_string(),
    sender: sender.to_string(),
  })
}

impl fmt::Display for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Message::NdInit => write!(f, "nd_init"),
      Message::NdAck(addr) => write!(f, "nd_ack:{addr}"),
      Message::NdHello(addr) => write!(f, "nd_hello:{addr}"),
      Message::LeInit => write!(f, "le_init"),
      Message::LeM => write!(f, "le_m?:"),
      Message::LeAck { min, leader, sender } => {
        write!(f, "le_ack:{min:03}:{leader};{sender}")
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_bare_literals() {
    assert_eq!(Message::parse("nd_init"), Ok(Message::NdInit));
    assert_eq!(Message::parse("le_init"), Ok(Message::LeInit));
    assert_eq!(Message::parse("le_m?:"), Ok(Message::LeM));
  }

  #[test]
  fn parses_addressed_messages() {
    assert_eq!(
      Message::parse("nd_ack:fe80::1"),
      Ok(Message::NdAck("fe80::1".into()))
    );
    assert_eq!(
      Message::parse("nd_hello:fe80::1"),
      Ok(Message::NdHello("fe80::1".into()))
    );
  }

  #[test]
  fn le_ack_round_trips_with_ipv6_colons_in_addresses() {
    let msg = Message::LeAck {
      min: 7,
      leader: "fe80::1".into(),
      sender: "fe80::2".into(),
    };
    let wire = msg.to_string();
    assert_eq!(wire, "le_ack:007:fe80::1;fe80::2");
    assert_eq!(Message::parse(&wire), Ok(msg));
  }

  #[test]
  fn le_ack_pads_to_three_digits() {
    let msg = Message::LeAck {
      min: 256,
      leader: "fe80::1".into(),
      sender: "fe80::2".into(),
    };
    assert_eq!(msg.to_string(), "le_ack:256:fe80::1;fe80::2");
  }

  #[test]
  fn rejects_unknown_prefix() {
    assert_eq!(Message::parse("bogus"), Err(ParseError::UnknownPrefix));
  }

  #[test]
  fn rejects_malformed_le_ack() {
    assert_eq!(
      Message::parse("le_ack:abc:fe80::1;fe80::2"),
      Err(ParseError::MalformedLeAck)
    );
    assert_eq!(
      Message::parse("le_ack:007:fe80::1"),
      Err(ParseError::MalformedLeAck)
    );
  }
}
