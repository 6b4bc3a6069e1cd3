//! Distributed lock manager glue.
//!
//! The locker steps its lock state machines from the tick while the rank
//! serves clients. Lock acquisition and cap issue run in the data plane.

pub struct Locker {
    ticks: u64,
    caps_issued: u64,
}

impl Locker {
    pub fn new() -> Self {
        Self {
            ticks: 0,
            caps_issued: 0,
        }
    }

    /// Step lock timeouts and queued evaluations.
    pub fn tick(&mut self) {
        self.ticks += 1;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn note_caps_issued(&mut self) {
        self.caps_issued += 1;
    }

    pub fn caps_issued(&self) -> u64 {
        self.caps_issued
    }
}

impl Default for Locker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counts() {
        let mut locker = Locker::new();
        locker.tick();
        locker.tick();
        assert_eq!(locker.ticks(), 2);
    }
}
