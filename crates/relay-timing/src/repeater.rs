use crate::{Duration, Ticks};

/// Interval gate on the engine clock. The caller passes its notion of
/// "now" so a single clock read per loop iteration is enough.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Repeater {
    interval: Duration,
    last_acted: Ticks,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: Ticks::ZERO }
    }

    /// True once per elapsed interval.
    #[inline]
    pub fn fired(&mut self, now: Ticks) -> bool {
        if now - self.last_acted >= self.interval {
            self.last_acted = now;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reset(&mut self, now: Ticks) {
        self.last_acted = now;
    }

    pub fn force_fire(&mut self) {
        self.last_acted = Ticks::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_interval() {
        let mut r = Repeater::every(Duration::from_millis(100));
        assert!(r.fired(Ticks(100)));
        assert!(!r.fired(Ticks(150)));
        assert!(r.fired(Ticks(200)));
    }

    #[test]
    fn force_fire_rewinds() {
        let mut r = Repeater::every(Duration::from_secs(10));
        assert!(r.fired(Ticks(10_000)));
        assert!(!r.fired(Ticks(10_001)));
        r.force_fire();
        assert!(r.fired(Ticks(10_002)));
    }
}
