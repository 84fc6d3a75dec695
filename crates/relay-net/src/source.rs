use rand::seq::SliceRandom;

/// Pre-allocated range of local source ports for upstream connections.
///
/// Ports are handed out in a shuffled order so two engines sharing a
/// range through SO_REUSEADDR do not collide on the same walk, and a
/// released port goes back to the pool.
#[derive(Clone, Debug)]
pub struct PortRange {
    lo: u16,
    hi: u16,
    free: Vec<u16>,
}

impl PortRange {
    pub fn new(lo: u16, hi: u16) -> Self {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        let mut free: Vec<u16> = (lo..=hi).collect();
        free.shuffle(&mut rand::rng());
        Self { lo, hi, free }
    }

    /// Draws one port, `None` when the range is exhausted.
    pub fn alloc(&mut self) -> Option<u16> {
        self.free.pop()
    }

    /// Returns a port to the pool. Ports outside the range are ignored
    /// so callers can release unconditionally.
    pub fn release(&mut self, port: u16) {
        if port >= self.lo && port <= self.hi && !self.free.contains(&port) {
            self.free.push(port);
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_release_cycle() {
        let mut range = PortRange::new(40000, 40003);
        assert_eq!(range.available(), 4);
        let p = range.alloc().unwrap();
        assert_eq!(range.available(), 3);
        range.release(p);
        assert_eq!(range.available(), 4);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut range = PortRange::new(50000, 50000);
        assert!(range.alloc().is_some());
        assert!(range.alloc().is_none());
    }

    #[test]
    fn foreign_port_release_ignored() {
        let mut range = PortRange::new(40000, 40001);
        range.release(1234);
        assert_eq!(range.available(), 2);
    }
}
