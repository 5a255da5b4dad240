//! Neighbor-discovery state machine.

use {
  crate::{config::Config, wire::Message},
  std::time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  /// stateND = 0
  Init,
  /// stateND = 1
  Listening,
}

pub enum Action {
  None,
  Broadcast(Message),
}

/// Drives the two-state discovery loop: periodically broadcast
/// `nd_init`, then listen until either a neighbor answers and the round
/// goes quiet for `nd_idle_timeout`, or nothing answers at all and the
/// round just keeps retrying.
pub struct NdPhase {
  running: bool,
  state: State,
  next_run_at: Instant,
  last_activity_at: Instant,
  idle_timeout: Duration,
  delay: Duration,
}

impl NdPhase {
  pub fn new(start: Instant, config: &Config) -> Self {
    Self {
      running: false,
      state: State::Init,
      // first run triggers at delay/3 after engine start.
      next_run_at: start + config.delay_nd / 3,
      last_activity_at: start,
      idle_timeout: config.nd_idle_timeout,
      delay: config.delay_nd,
    }
  }

  pub fn is_running(&self) -> bool {
    self.running
  }

  /// Called whenever an `nd_ack` is processed, regardless of current
  /// sub-state.
  pub fn note_ack_received(&mut self, now: Instant) {
    self.last_activity_at = now;
  }

  /// Advances the state machine by one engine tick. `neighbor_count` is
  /// the current size of the neighbor table.
  pub fn tick(&mut self, now: Instant, neighbor_count: usize) -> Action {
    if !self.running {
      if now < self.next_run_at {
        return Action::None;
      }
      self.running = true;
    }

    match self.state {
      State::Init => {
        self.last_activity_at = now;
        self.state = State::Listening;
        Action::Broadcast(Message::NdInit)
      }
      State::Listening => {
        if now.duration_since(self.last_activity_at) > self.idle_timeout {
          self.state = State::Init;
          if neighbor_count > 0 {
            // stop the round once we've been quiet for nd_idle_timeout
            // and know at least one neighbor.
            self.running = false;
            self.next_run_at = now + self.delay;
          }
          // else: the round reverts to state 0 but stays running,
          // `running` stays true, so the next tick re-enters
          // `State::Init` and re-broadcasts.
        }
        Action::None
      }
    }
  }
}
