use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Deadline handling for a single child process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutStrategy {
    /// Time the child may run before it is terminated
    pub timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL once the deadline passes
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Send SIGTERM before SIGKILL
    #[serde(default = "default_true")]
    pub allow_graceful_termination: bool,
}

fn default_kill_grace() -> u64 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for TimeoutStrategy {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            kill_grace_secs: 2,
            allow_graceful_termination: true,
        }
    }
}

impl TimeoutStrategy {
    pub fn new(timeout_secs: u64, kill_grace_secs: u64) -> Self {
        Self {
            timeout_secs,
            kill_grace_secs,
            allow_graceful_termination: true,
        }
    }

    /// Create strategy for short bridge queries that are killed outright
    pub fn quick_strategy(timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            kill_grace_secs: 0,
            allow_graceful_termination: false,
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

/// How many times a failing command is repeated and how long to wait in between
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
        }
    }

    /// Exactly one attempt, no waiting.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Delay to wait before `attempt` (1-based). The first attempt runs
    /// immediately; afterwards the delay doubles each time.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.initial_delay().saturating_mul(1u32 << exponent)
    }

    /// Sum of every backoff delay when all attempts fail.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_attempts.max(1))
            .map(|attempt| self.delay_before(attempt))
            .sum()
    }
}

/// Elapsed-time bookkeeping for one run
#[derive(Debug)]
pub struct TimeoutTracker {
    strategy: TimeoutStrategy,
    start_time: Instant,
}

impl TimeoutTracker {
    pub fn new(strategy: TimeoutStrategy) -> Self {
        Self {
            strategy,
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.strategy.deadline()
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.strategy.deadline().saturating_sub(self.elapsed())
    }

    pub fn strategy(&self) -> &TimeoutStrategy {
        &self.strategy
    }
}
