//! Conversation liveness tracking.
//!
//! A single timestamp records the most recent evidence of live conversation:
//! a voice-classified capture frame, or the agent being mid-sentence. The
//! session loop polls at 1Hz and tears the call down once the configured
//! idle window elapses with nothing touching the clock.

use std::time::Duration;
use tokio::time::Instant;

/// Default idle window before a connected call is ended. Override via
/// `CallConfig`.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cadence at which the session loop polls for idleness.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct ActivityMonitor {
    last_activity: Instant,
    idle_timeout: Duration,
}

impl ActivityMonitor {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            last_activity: Instant::now(),
            idle_timeout,
        }
    }

    /// Record a qualifying conversational event.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn seconds_since_activity(&self) -> f64 {
        self.last_activity.elapsed().as_secs_f64()
    }

    pub fn is_idle(&self) -> bool {
        self.last_activity.elapsed() >= self.idle_timeout
    }
}
