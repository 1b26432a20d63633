//! Server configuration.

use std::time::Duration;

/// Default election timeout.
pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(750);

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(250);

/// Default session timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default global suspend timeout, after which a partitioned follower's
/// log is truncated to the leader's on heal.
pub const DEFAULT_GLOBAL_SUSPEND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Timing configuration for a Cohort server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Lower bound on leader-absence detection. The actual timeout is
    /// randomized between one and two times this value.
    pub election_timeout: Duration,
    /// Cadence of leader appends to idle followers. Must be shorter than
    /// the election timeout.
    pub heartbeat_interval: Duration,
    /// Idle interval after which a session is expired at apply time. Must
    /// be longer than the election timeout.
    pub session_timeout: Duration,
    /// Partition duration after which a healing follower's log is
    /// truncated to the leader's.
    pub global_suspend_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            election_timeout: DEFAULT_ELECTION_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            global_suspend_timeout: DEFAULT_GLOBAL_SUSPEND_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Sets the election timeout.
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the session timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Validates the ordering constraints between the timing knobs.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.election_timeout {
            return Err(format!(
                "heartbeat interval {:?} must be shorter than election timeout {:?}",
                self.heartbeat_interval, self.election_timeout
            ));
        }
        if self.session_timeout <= self.election_timeout {
            return Err(format!(
                "session timeout {:?} must be longer than election timeout {:?}",
                self.session_timeout, self.election_timeout
            ));
        }
        Ok(())
    }

    /// Returns the election timeout in milliseconds.
    pub fn election_timeout_ms(&self) -> u64 {
        self.election_timeout.as_millis() as u64
    }

    /// Returns the heartbeat interval in milliseconds.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval.as_millis() as u64
    }

    /// Returns the session timeout in milliseconds.
    pub fn session_timeout_ms(&self) -> u64 {
        self.session_timeout.as_millis() as u64
    }

    /// Returns the global suspend timeout in milliseconds.
    pub fn global_suspend_timeout_ms(&self) -> u64 {
        self.global_suspend_timeout.as_millis() as u64
    }
}
