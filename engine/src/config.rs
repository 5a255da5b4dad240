use std::time::Duration;

/// Tunable constants for the election engine: `K`, `T1`, `T2`,
/// `delay_nd`, `delay_le`, `max_neighbors`.
#[derive(Debug, Clone)]
pub struct Config {
  /// Engine tick interval, nominally 100 ms.
  pub tick: Duration,

  /// Stability-rounds threshold for leader-election convergence.
  pub k: u32,

  /// Settle interval between leader-election merge steps.
  pub t1: Duration,

  /// Per-round response window during leader-election.
  pub t2: Duration,

  /// Interval between neighbor-discovery rounds.
  pub delay_nd: Duration,

  /// Idle timeout within a single neighbor-discovery round.
  pub nd_idle_timeout: Duration,

  /// Interval between leader-election attempts.
  pub delay_le: Duration,

  /// Maximum number of distinct neighbors tracked.
  pub max_neighbors: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      tick: Duration::from_millis(100),
      k: 3,
      t1: Duration::from_secs(8),
      t2: Duration::from_secs(6),
      delay_nd: Duration::from_secs(60),
      nd_idle_timeout: Duration::from_secs(8),
      delay_le: Duration::from_secs(45),
      max_neighbors: 20,
    }
  }
}

impl Config {
  /// A config with all timers shrunk for fast, deterministic tests.
  /// Not `cfg(test)`-gated: the integration tests under `tests/` link
  /// against the compiled library, not its test-only surface, and need
  /// this too.
  pub fn fast() -> Self {
    Self {
      tick: Duration::from_millis(5),
      k: 3,
      t1: Duration::from_millis(40),
      t2: Duration::from_millis(30),
      delay_nd: Duration::from_millis(20),
      nd_idle_timeout: Duration::from_millis(40),
      delay_le: Duration::from_millis(20),
      max_neighbors: 20,
    }
  }
}
