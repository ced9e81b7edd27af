//! Time of the last accepted message, shared by the dispatcher (writer) and
//! the watchdog (reader).

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct LivenessClock {
    last_accepted: Mutex<Instant>,
}

impl LivenessClock {
    /// Starts the clock as if a message had just been accepted.
    pub fn new() -> Self {
        Self {
            last_accepted: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_accepted.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_accepted(&self) -> Instant {
        *self.last_accepted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn silence(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_accepted())
    }
}

impl Default for LivenessClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_silence_grows_until_touched() {
        let clock = LivenessClock::new();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.silence(), Duration::from_secs(90));

        clock.touch();
        assert_eq!(clock.silence(), Duration::ZERO);
    }
}
