use std::sync::Arc;

use crate::Ticks;

/// Monotonic engine clock. `now()` is the tick count since the clock
/// was created; every deadline in the engine is derived from it.
///
/// `mock()` returns a clock whose time only moves when the returned
/// handle is incremented, which is what the timer tests drive.
#[derive(Clone, Debug)]
pub struct Clock {
    inner: quanta::Clock,
    start: quanta::Instant,
}

impl Clock {
    pub fn new() -> Self {
        let inner = quanta::Clock::new();
        let start = inner.now();
        Self { inner, start }
    }

    pub fn mock() -> (Self, Arc<quanta::Mock>) {
        let (inner, mock) = quanta::Clock::mock();
        let start = inner.now();
        (Self { inner, start }, mock)
    }

    #[inline]
    pub fn now(&self) -> Ticks {
        Ticks(self.inner.now().duration_since(self.start).as_millis() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mocked_clock_only_moves_when_told() {
        let (clock, mock) = Clock::mock();
        let t0 = clock.now();
        assert_eq!(t0, clock.now());
        mock.increment(std::time::Duration::from_millis(250));
        assert_eq!(clock.now().0 - t0.0, 250);
    }
}
