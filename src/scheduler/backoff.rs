//! Exponential backoff of failing runner operations.

/// The largest exponent of the skip countdown.
const MAX_EXPONENT: u32 = 10;

/// Tracks consecutive failures of an operation.
///
/// After the `n`th consecutive failure the next `2^n - 1` attempts are
/// skipped. Once the failures exceed the retry budget the caller should give
/// up and reset the counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffCounter {
    /// The number of failures tolerated before giving up.
    max_retries: u32,
    /// The number of consecutive failures.
    failures: u32,
    /// The number of attempts left to skip.
    countdown: u32,
}

impl BackoffCounter {
    /// Constructs a counter with the given retry budget.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            failures: 0,
            countdown: 0,
        }
    }

    /// Gets the number of consecutive failures.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Consumes one attempt, returning `true` if it should be skipped.
    pub fn skip(&mut self) -> bool {
        if self.countdown > 0 {
            self.countdown -= 1;
            true
        } else {
            false
        }
    }

    /// Records a failure.
    pub fn failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.countdown = (1 << self.failures.min(MAX_EXPONENT)) - 1;
    }

    /// Returns `true` once the failures exceed the retry budget.
    pub fn give_up(&self) -> bool {
        self.failures > self.max_retries
    }

    /// Resets the counter after a success or after giving up.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.countdown = 0;
    }
}
