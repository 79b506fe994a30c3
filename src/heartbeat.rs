use crate::config::HeartbeatConfig;
use tokio::time::{Duration, Instant};

/// Tracks keep-alive state for a single connection
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,

    /// When the session (and therefore the ping schedule) started
    started_at: Instant,

    /// Time of last ping sent
    last_ping_sent: Option<Instant>,

    /// Time of last pong received
    last_pong_received: Option<Instant>,

    /// Number of consecutive pings that went unanswered
    consecutive_failures: u32,

    /// Whether we're currently waiting for a pong
    waiting_for_pong: bool,
}

impl Heartbeat {
    /// Start tracking a freshly opened connection
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            last_ping_sent: None,
            last_pong_received: None,
            consecutive_failures: 0,
            waiting_for_pong: false,
        }
    }

    /// Record that we sent a ping
    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.waiting_for_pong = true;
    }

    /// Record that we received a pong (application or protocol level)
    pub fn record_pong_received(&mut self) {
        self.last_pong_received = Some(Instant::now());
        self.consecutive_failures = 0;
        self.waiting_for_pong = false;
    }

    /// Pings go out on a fixed interval, answered or not
    pub fn should_send_ping(&self) -> bool {
        self.since_last_ping() >= self.config.interval
    }

    /// Check if the outstanding pong is overdue and record a failure if so.
    ///
    /// Always false when no pong timeout is configured.
    pub fn check_pong_timeout(&mut self) -> bool {
        let Some(pong_timeout) = self.config.pong_timeout else {
            return false;
        };
        if !self.waiting_for_pong {
            return false;
        }
        match self.last_ping_sent {
            Some(sent) if sent.elapsed() >= pong_timeout => {
                self.consecutive_failures += 1;
                self.waiting_for_pong = false;
                true
            }
            _ => false,
        }
    }

    /// Whether enough pongs were missed to give up on the connection
    pub fn is_unhealthy(&self) -> bool {
        self.config.pong_timeout.is_some()
            && self.consecutive_failures >= self.config.failure_threshold.max(1)
    }

    /// Time until the next ping is due or the outstanding pong expires
    pub fn time_until_next_action(&self) -> Duration {
        let next_ping = self.config.interval.saturating_sub(self.since_last_ping());
        match (self.config.pong_timeout, self.waiting_for_pong, self.last_ping_sent) {
            (Some(pong_timeout), true, Some(sent)) => {
                next_ping.min(pong_timeout.saturating_sub(sent.elapsed()))
            }
            _ => next_ping,
        }
    }

    /// Get the consecutive missed-pong count
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Time since the last pong, if any arrived on this connection
    pub fn since_last_pong(&self) -> Option<Duration> {
        self.last_pong_received.map(|t| t.elapsed())
    }

    fn since_last_ping(&self) -> Duration {
        self.last_ping_sent.unwrap_or(self.started_at).elapsed()
    }
}
