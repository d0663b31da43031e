use std::time::Duration;
use tokio::time::Instant;

/// Rate limit for UI-facing snapshots
///
/// The first snapshot always passes; later ones pass only once `interval`
/// has elapsed since the last one that passed.
#[derive(Debug, Clone)]
pub struct UpdateThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl UpdateThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Returns true and records the emission if a snapshot may go out now
    pub fn try_emit(&mut self) -> bool {
        self.try_emit_at(Instant::now())
    }

    pub fn try_emit_at(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_window() {
        let start = Instant::now();
        let mut throttle = UpdateThrottle::new(Duration::from_millis(16));
        assert!(throttle.try_emit_at(start));
        assert!(!throttle.try_emit_at(start + Duration::from_millis(5)));
        assert!(!throttle.try_emit_at(start + Duration::from_millis(15)));
        assert!(throttle.try_emit_at(start + Duration::from_millis(16)));
        assert!(!throttle.try_emit_at(start + Duration::from_millis(20)));

        throttle.reset();
        assert!(throttle.try_emit_at(start + Duration::from_millis(21)));
    }
}
