//! Fibonacci backoff for reconciliation errors that carry no suggested
//! delay. Grows more slowly than exponential backoff; the sequence is kept
//! in minutes to align with GitOps tool conventions (1m, 1m, 2m, 3m, 5m,
//! 8m, 10m capped).

#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_minutes: u64,
    prev_minutes: u64,
    current_minutes: u64,
    max_minutes: u64,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            min_minutes,
            prev_minutes: 0,
            current_minutes: min_minutes,
            max_minutes,
        }
    }

    /// Next backoff in seconds, advancing the sequence.
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_minutes;
        let next = (self.prev_minutes + self.current_minutes).min(self.max_minutes);
        self.prev_minutes = self.current_minutes;
        self.current_minutes = next;
        result * 60
    }

    pub fn reset(&mut self) {
        self.prev_minutes = 0;
        self.current_minutes = self.min_minutes;
    }
}

/// Per-resource error tracking, keyed by `namespace/name` in the error
/// policy layer.
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            backoff: FibonacciBackoff::new(1, 10),
            error_count: 0,
        }
    }
}

impl BackoffState {
    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}
