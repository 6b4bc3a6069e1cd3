//! Metadata load balancer.
//!
//! Samples this rank's load for the tick to publish and accepts rebalance
//! invitations after map changes. The migration decisions themselves are
//! made against the subtree map and executed by the migrator.

use tracing::debug;

/// A point-in-time load sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct MdsLoad {
    pub request_rate: f64,
    pub cache_hit_rate: f64,
    pub queue_len: f64,
}

impl MdsLoad {
    /// Scalar load figure used for counter publication.
    pub fn mds_load(&self) -> f64 {
        self.request_rate + self.queue_len
    }
}

/// Per-rank balancer state.
pub struct Balancer {
    requests_sampled: u64,
    rebalances_invited: u64,
    ticks: u64,
}

impl Balancer {
    pub fn new() -> Self {
        Self {
            requests_sampled: 0,
            rebalances_invited: 0,
            ticks: 0,
        }
    }

    /// Sample the current load.
    pub fn get_load(&mut self, queue_len: usize) -> MdsLoad {
        self.requests_sampled += 1;
        MdsLoad {
            request_rate: 0.0,
            cache_hit_rate: 1.0,
            queue_len: queue_len as f64,
        }
    }

    /// Invited after each map install outside replay.
    pub fn try_rebalance(&mut self) {
        self.rebalances_invited += 1;
        debug!("balancer invited to rebalance");
    }

    pub fn rebalances_invited(&self) -> u64 {
        self.rebalances_invited
    }

    /// Periodic balancer work while active.
    pub fn tick(&mut self) {
        self.ticks += 1;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_scalar() {
        let mut balancer = Balancer::new();
        let load = balancer.get_load(3);
        assert!(load.mds_load() >= 3.0);
    }

    #[test]
    fn test_invitations_counted() {
        let mut balancer = Balancer::new();
        balancer.try_rebalance();
        balancer.try_rebalance();
        assert_eq!(balancer.rebalances_invited(), 2);
    }
}
