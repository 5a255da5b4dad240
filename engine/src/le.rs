//! Leader-election state machine and its merge step.

use {
  crate::{config::Config, wire::Message},
  std::{
    collections::HashSet,
    time::{Duration, Instant},
  },
};

/// Sentinel for `tempMin`: "undefined", larger than any real `min`.
/// Reset to this value at round boundaries.
const TEMP_MIN_SENTINEL: u16 = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  NotRunning,
  /// stateLE = 0
  S0,
  /// stateLE = 1: initial collection window after `le_init`.
  S1,
  /// stateLE = 2: settle wait (`T1`).
  S2,
  /// stateLE = 3: per-round collection window (`T2`).
  S3,
  /// stateLE = 5: converged, terminal.
  Converged,
}

#[derive(Default)]
pub struct TickResult {
  pub broadcast: Option<Message>,
  pub converged: bool,
}

/// Drives the leader-election state machine. `min`/`leader` are the
/// engine's persistent current-best pair, threaded through by mutable
/// reference since the merge step (state 3) is the only place that ever
/// updates them once an election is underway.
pub struct LePhase {
  state: State,
  next_run_at: Instant,
  counter: u32,
  t1_deadline: Option<Instant>,
  t2_deadline: Option<Instant>,
  reported: HashSet<String>,
  temp_min: u16,
  temp_leader: String,

  k: u32,
  t1: Duration,
  t2: Duration,
  delay_le: Duration,
}

impl LePhase {
  pub fn new(start: Instant, config: &Config) -> Self {
    Self {
      state: State::NotRunning,
      next_run_at: start + config.delay_le,
      counter: config.k,
      t1_deadline: None,
      t2_deadline: None,
      reported: HashSet::new(),
      temp_min: TEMP_MIN_SENTINEL,
      temp_leader: String::new(),
      k: config.k,
      t1: config.t1,
      t2: config.t2,
      delay_le: config.delay_le,
    }
  }

  pub fn is_running(&self) -> bool {
    !matches!(self.state, State::NotRunning | State::Converged)
  }

  pub fn has_converged(&self) -> bool {
    matches!(self.state, State::Converged)
  }

  /// Processes an inbound `le_ack:DDD:L;S`, regardless of current
  /// sub-state. A non-positive `min` is ignored as malformed input.
  pub fn note_le_ack(&mut self, min: u16, leader: String, sender: String) {
    if min == 0 {
      return;
    }
    self.reported.insert(sender);
    if min < self.temp_min {
      self.temp_min = min;
      self.temp_leader = leader;
    }
  }

  /// Advances the state machine by one engine tick, given the current
  /// neighbor count and (allowLE && !hasElectedLeader) eligibility
  /// already checked by the caller. `min`/`leader` are the engine's
  /// current-best pair; `own_addr` is this node's own IPv6 string, used
  /// to fill in the `sender` field of outbound `le_ack:` broadcasts.
  pub fn tick(
    &mut self,
    now: Instant,
    neighbor_count: usize,
    min: &mut u16,
    leader: &mut String,
    own_addr: &str,
  ) -> TickResult {
    match self.state {
      State::NotRunning => {
        if now >= self.next_run_at {
          self.state = State::S0;
        }
        TickResult::default()
      }

      State::S0 => {
        self.counter = self.k;
        self.start_collection_window(now);
        self.state = State::S1;
        TickResult {
          broadcast: Some(Message::LeInit),
          converged: false,
        }
      }

      State::S1 => {
        if self.window_closed(now, neighbor_count) {
          self.start_settle_wait(now);
          self.state = State::S2;
        }
        TickResult::default()
      }

      State::S2 => {
        if now >= self.t1_deadline.expect("set on entry to S2") {
          self.start_collection_window(now);
          self.state = State::S3;
        }
        TickResult::default()
      }

      State::S3 => {
        if self.window_closed(now, neighbor_count) {
          let converged = self.merge(min, leader);
          let ack = Message::LeAck {
            min: *min,
            leader: leader.clone(),
            sender: own_addr.to_string(),
          };
          if converged {
            self.state = State::Converged;
          } else {
            self.start_settle_wait(now);
            self.state = State::S2;
          }
          TickResult {
            broadcast: Some(ack),
            converged,
          }
        } else {
          TickResult::default()
        }
      }

      State::Converged => TickResult::default(),
    }
  }

  fn window_closed(&self, now: Instant, neighbor_count: usize) -> bool {
    self.reported.len() >= neighbor_count
      || now >= self.t2_deadline.expect("set on entry to collection window")
  }

  fn start_collection_window(&mut self, now: Instant) {
    self.reported.clear();
    self.temp_min = TEMP_MIN_SENTINEL;
    self.temp_leader.clear();
    self.t2_deadline = Some(now + self.t2);
  }

  fn start_settle_wait(&mut self, now: Instant) {
    self.t1_deadline = Some(now + self.t1);
  }

  /// The merge step. Returns true if this merge brought the counter to
  /// zero (converged).
  fn merge(&mut self, min: &mut u16, leader: &mut String) -> bool {
    if self.temp_min < *min {
      *min = self.temp_min;
      *leader = self.temp_leader.clone();
      self.counter = self.k;
    } else if self.temp_min == *min {
      self.counter = self.counter.saturating_sub(1);
      if self.temp_leader < *leader {
        *leader = self.temp_leader.clone();
      }
    }
    self.counter == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config() -> Config {
    Config::fast()
  }

  #[test]
  fn waits_until_delay_le_elapses() {
    let start = Instant::now();
    let mut le = LePhase::new(start, &config());
    let mut min = 50u16;
    let mut leader = "fe80::a".to_string();
    let r = le.tick(start, 0, &mut min, &mut leader, "fe80::a");
    assert!(r.broadcast.is_none());
    assert!(!le.is_running());
  }

  #[test]
  fn isolated_node_never_converges() {
    let start = Instant::now();
    let cfg = config();
    let mut le = LePhase::new(start, &cfg);
    let mut min = 50u16;
    let mut leader = "fe80::a".to_string();
    let mut now = start + cfg.delay_le;

    for _ in 0..200 {
      let r = le.tick(now, 0, &mut min, &mut leader, "fe80::a");
      assert!(!r.converged);
      now += cfg.tick;
    }
    assert_eq!(min, 50);
    assert_eq!(leader, "fe80::a");
  }

  #[test]
  fn smaller_min_replaces_current_best() {
    let start = Instant::now();
    let cfg = config();
    let mut le = LePhase::new(start, &cfg);
    let mut min = 100u16;
    let mut leader = "fe80::b".to_string();
    let mut now = start + cfg.delay_le;

    // drive to S3 (send le_init, settle, then present a collection
    // window) and deliver a smaller ack before the window closes.
    le.tick(now, 1, &mut min, &mut leader, "fe80::b"); // NotRunning -> S0
    now += cfg.tick;
    le.tick(now, 1, &mut min, &mut leader, "fe80::b"); // S0 -> S1, broadcasts le_init
    now += cfg.t2 + Duration::from_millis(1);
    le.tick(now, 1, &mut min, &mut leader, "fe80::b"); // S1 -> S2 via T2 timeout
    now += cfg.t1 + Duration::from_millis(1);
    le.tick(now, 1, &mut min, &mut leader, "fe80::b"); // S2 -> S3

    le.note_le_ack(30, "fe80::a".into(), "fe80::a".into());
    let r = le.tick(now, 1, &mut min, &mut leader, "fe80::b"); // all reported -> merge
    assert!(r.broadcast.is_some());
    assert_eq!(min, 30);
    assert_eq!(leader, "fe80::a");
  }

  #[test]
  fn tie_breaks_lexicographically() {
    let start = Instant::now();
    let cfg = config();
    let mut le = LePhase::new(start, &cfg);
    let mut min = 42u16;
    let mut leader = "fe80::2".to_string();
    let mut now = start + cfg.delay_le;

    le.tick(now, 1, &mut min, &mut leader, "fe80::2"); // NotRunning -> S0
    now += cfg.tick;
    le.tick(now, 1, &mut min, &mut leader, "fe80::2"); // S0 -> S1, broadcasts le_init
    now += cfg.t2 + Duration::from_millis(1);
    le.tick(now, 1, &mut min, &mut leader, "fe80::2"); // S1 -> S2 via T2 timeout
    now += cfg.t1 + Duration::from_millis(1);
    le.tick(now, 1, &mut min, &mut leader, "fe80::2"); // S2 -> S3

    le.note_le_ack(42, "fe80::1".into(), "fe80::1".into());
    let r = le.tick(now, 1, &mut min, &mut leader, "fe80::2"); // all reported -> merge (tie)
    assert!(r.broadcast.is_some());
    assert_eq!(min, 42);
    assert_eq!(leader, "fe80::1");
  }

  #[test]
  fn converged_state_ignores_further_acks_and_ticks() {
    let start = Instant::now();
    let cfg = config();
    let mut le = LePhase::new(start, &cfg);
    let mut min = 5u16;
    let mut leader = "fe80::a".to_string();
    le.state = State::Converged;

    le.note_le_ack(1, "fe80::z".into(), "fe80::z".into());
    let r = le.tick(start, 1, &mut min, &mut leader, "fe80::a");
    assert!(r.broadcast.is_none());
    assert!(!r.converged);
    assert_eq!(min, 5);
    assert_eq!(leader, "fe80::a");
  }

  #[test]
  fn zero_min_ack_is_ignored() {
    let start = Instant::now();
    let mut le = LePhase::new(start, &config());
    le.note_le_ack(0, "fe80::x".into(), "fe80::x".into());
    assert!(le.reported.is_empty());
  }
}
