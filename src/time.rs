//! Monotonic clocks used to turn absolute deadlines into delays.
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// A source of monotonic "now".
pub trait TickClock: Send + Sync {
    fn now_ticks(&self) -> Instant;
}

/// Reads [`Instant::now()`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTickClock;

impl TickClock for DefaultTickClock {
    fn now_ticks(&self) -> Instant {
        Instant::now()
    }
}

static DEFAULT_CLOCK: Lazy<Arc<dyn TickClock>> = Lazy::new(|| Arc::new(DefaultTickClock));

/// The process-wide real clock.
pub fn default_tick_clock() -> Arc<dyn TickClock> {
    DEFAULT_CLOCK.clone()
}

/// A clock that only moves when told to.
///
/// Starts at the real time it was created and advances by explicit [`advance`](Self::advance)
/// calls.
pub struct MockTickClock {
    now: Mutex<Instant>,
}

impl MockTickClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, delta: Duration) {
        *self.now.lock() += delta;
    }

    /// Moves the clock forward to `instant`. Never moves it backwards.
    pub fn advance_to(&self, instant: Instant) {
        let mut now = self.now.lock();
        if instant > *now {
            *now = instant;
        }
    }
}

impl Default for MockTickClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for MockTickClock {
    fn now_ticks(&self) -> Instant {
        *self.now.lock()
    }
}

impl fmt::Debug for MockTickClock {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("MockTickClock")
            .field("now", &*self.now.lock())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{MockTickClock, TickClock};

    #[test]
    fn mock_clock_is_monotonic() {
        let clock = MockTickClock::new();
        let start = clock.now_ticks();

        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now_ticks() - start, Duration::from_millis(5));

        clock.advance_to(start);
        assert_eq!(clock.now_ticks() - start, Duration::from_millis(5));
    }
}
