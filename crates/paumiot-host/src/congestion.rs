use std::time::{Duration, Instant};

use paumiot_core::config::Config;

/// Tunables shared by every connection's controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionParams {
    /// Messages admitted per rate window
    pub max_msgs_per_sec: u32,
    /// Length of a rate window
    pub rate_window: Duration,
    /// Hard cap on queued-but-unfinished messages
    pub max_queue_depth: u32,
    /// Window a fresh connection starts with
    pub initial_window: u32,
    /// Initial slow-start threshold
    pub slow_start_threshold: u32,
    /// Multiplicative backoff growth per failure
    pub backoff_step: f32,
    /// Backoff ceiling
    pub max_backoff: f32,
}

impl From<&Config> for CongestionParams {
    fn from(config: &Config) -> Self {
        Self {
            max_msgs_per_sec: config.max_msgs_per_sec,
            rate_window: config.rate_window,
            max_queue_depth: config.max_queue_depth,
            initial_window: config.initial_window,
            slow_start_threshold: config.slow_start_threshold,
            backoff_step: config.backoff_step,
            max_backoff: config.max_backoff,
        }
    }
}

impl Default for CongestionParams {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Message may be dispatched
    Accept,
    /// Rate window exhausted; the connection is throttled
    RateLimited,
    /// Queue depth at its hard cap
    QueueFull,
    /// Congestion window full; wait for completions
    WindowFull,
}

impl Admission {
    /// Returns true if the message may be dispatched.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accept)
    }

    /// Returns true if the refusal counts as a drop.
    pub fn is_drop(&self) -> bool {
        matches!(self, Admission::RateLimited | Admission::QueueFull)
    }
}

/// Per-connection leaky-bucket rate limiter and congestion window.
#[derive(Debug, Clone)]
pub struct CongestionControl {
    params: CongestionParams,
    /// Current congestion window
    window: u32,
    /// Slow-start threshold
    ssthresh: u32,
    /// Whether the window is still in slow start
    slow_start: bool,
    /// Messages admitted in the current rate window
    msgs_in_window: u32,
    /// Start of the current rate window
    window_start: Instant,
    /// Drops since the last success
    consecutive_drops: u32,
    /// Multiplicative backoff factor
    backoff: f32,
    /// Admitted messages whose handler has not completed
    queue_depth: u32,
    /// Completions counted toward the next congestion-avoidance increment
    acked: u32,
}

impl CongestionControl {
    /// Creates a controller whose first rate window starts at `now`.
    pub fn new(params: CongestionParams, now: Instant) -> Self {
        Self {
            params,
            window: params.initial_window.max(1),
            ssthresh: params.slow_start_threshold.max(2),
            slow_start: true,
            msgs_in_window: 0,
            window_start: now,
            consecutive_drops: 0,
            backoff: 1.0,
            queue_depth: 0,
            acked: 0,
        }
    }

    /// Decides whether one more message may be dispatched.
    ///
    /// An accepted message raises the queue depth until `on_success` or `release`.
    pub fn admit(&mut self, now: Instant) -> Admission {
        if self.rate_window_elapsed(now) {
            self.window_start = now;
            self.msgs_in_window = 0;
        }

        if self.msgs_in_window >= self.params.max_msgs_per_sec {
            self.consecutive_drops += 1;
            self.on_failure();
            return Admission::RateLimited;
        }
        if self.queue_depth >= self.params.max_queue_depth {
            self.consecutive_drops += 1;
            self.on_failure();
            return Admission::QueueFull;
        }
        if self.queue_depth >= self.window {
            return Admission::WindowFull;
        }

        self.msgs_in_window += 1;
        self.queue_depth += 1;
        Admission::Accept
    }

    /// Completes an admitted message that was delivered.
    pub fn on_success(&mut self) {
        self.queue_depth = self.queue_depth.saturating_sub(1);
        if self.slow_start {
            self.window += 1;
            if self.window >= self.ssthresh {
                self.slow_start = false;
                self.acked = 0;
            }
        } else {
            self.acked += 1;
            if self.acked >= self.window {
                self.window += 1;
                self.acked = 0;
            }
        }
        self.backoff = 1.0;
        self.consecutive_drops = 0;
    }

    /// Shrinks the window after a drop or a failed delivery.
    pub fn on_failure(&mut self) {
        self.ssthresh = (self.window / 2).max(2);
        self.window = self.ssthresh;
        self.slow_start = false;
        self.acked = 0;
        let grown = self.backoff * (1.0 + self.params.backoff_step);
        self.backoff = grown.min(self.params.max_backoff);
    }

    /// Completes an admitted message without touching the window.
    pub fn release(&mut self) {
        self.queue_depth = self.queue_depth.saturating_sub(1);
    }

    /// Starts a fresh rate window at `now`.
    pub fn reset_rate(&mut self, now: Instant) {
        self.window_start = now;
        self.msgs_in_window = 0;
    }

    /// Returns true once the current rate window has run out.
    pub fn rate_window_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.params.rate_window
    }

    /// Current congestion window.
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Current slow-start threshold.
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// Returns true while in slow start.
    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    /// Messages admitted in the current rate window.
    pub fn msgs_in_window(&self) -> u32 {
        self.msgs_in_window
    }

    /// Drops since the last successful delivery.
    pub fn consecutive_drops(&self) -> u32 {
        self.consecutive_drops
    }

    /// Current backoff factor.
    pub fn backoff(&self) -> f32 {
        self.backoff
    }

    /// Admitted messages still in flight.
    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(now: Instant) -> CongestionControl {
        CongestionControl::new(CongestionParams::default(), now)
    }

    #[test]
    fn test_slow_start_then_avoidance() {
        let now = Instant::now();
        let params = CongestionParams { max_msgs_per_sec: 1000, ..CongestionParams::default() };
        let mut cc = CongestionControl::new(params, now);
        assert_eq!(cc.window(), 1);

        for _ in 0..63 {
            assert_eq!(cc.admit(now), Admission::Accept);
            cc.on_success();
        }
        assert_eq!(cc.window(), 64);
        assert!(!cc.in_slow_start());

        // One increment per full window of completions
        for _ in 0..63 {
            cc.admit(now);
            cc.on_success();
        }
        assert_eq!(cc.window(), 64);
        cc.admit(now);
        cc.on_success();
        assert_eq!(cc.window(), 65);
    }

    #[test]
    fn test_window_full_until_completion() {
        let now = Instant::now();
        let mut cc = control(now);
        assert_eq!(cc.admit(now), Admission::Accept);
        assert_eq!(cc.admit(now), Admission::WindowFull);
        assert_eq!(cc.queue_depth(), 1);
        cc.release();
        assert_eq!(cc.queue_depth(), 0);
        assert_eq!(cc.admit(now), Admission::Accept);
    }

    #[test]
    fn test_rate_limit_sheds_and_shrinks() {
        let now = Instant::now();
        let mut cc = control(now);
        let mut admitted = 0;
        let mut pre_burst_window = 0;

        for _ in 0..200 {
            match cc.admit(now) {
                Admission::Accept => {
                    admitted += 1;
                    cc.on_success();
                    pre_burst_window = cc.window();
                }
                refused => assert!(refused.is_drop()),
            }
        }
        assert!(admitted <= 101);
        assert_eq!(admitted, 100);
        assert!(cc.window() <= pre_burst_window / 2);
        assert!(cc.window() >= 2);
        assert_eq!(cc.consecutive_drops(), 100);
        assert_eq!(cc.backoff(), 8.0);

        // Next window admits again and success resets the backoff
        let later = now + Duration::from_secs(1);
        assert_eq!(cc.admit(later), Admission::Accept);
        cc.on_success();
        assert_eq!(cc.backoff(), 1.0);
        assert_eq!(cc.consecutive_drops(), 0);
    }

    #[test]
    fn test_queue_depth_cap() {
        let now = Instant::now();
        let params = CongestionParams {
            max_queue_depth: 2,
            initial_window: 2,
            ..CongestionParams::default()
        };
        let mut cc = CongestionControl::new(params, now);
        assert!(cc.admit(now).is_accepted());
        assert!(cc.admit(now).is_accepted());
        assert_eq!(cc.admit(now), Admission::QueueFull);
        assert_eq!(cc.queue_depth(), 2);
    }

    #[test]
    fn test_failure_floor() {
        let now = Instant::now();
        let mut cc = control(now);
        for _ in 0..5 {
            cc.on_failure();
        }
        assert_eq!(cc.ssthresh(), 2);
        assert_eq!(cc.window(), 2);
        assert_eq!(cc.backoff(), 7.59375);
    }
}
