//! Distributed reductions used at teardown
//!
//! Only scalar sums and maxima are needed. Implementations are barrier-style:
//! every rank must make the same sequence of calls.

/// Collective operations across cooperating ranks
pub trait Collective {
    /// This rank's index
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Ranks sharing this rank's device
    fn procs_per_device(&self) -> usize;

    /// Element-wise sum across ranks, in place
    fn sum(&self, values: &mut [f64]);

    /// Element-wise maximum across ranks, in place
    fn max(&self, values: &mut [f64]);

    /// Whether this rank writes reports
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }
}

/// A world of one rank; reductions are identities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleProcess {
    procs_per_device: usize,
}

impl SingleProcess {
    pub fn new() -> Self {
        Self { procs_per_device: 1 }
    }

    /// Report as if `procs_per_device` processes shared the device
    pub fn sharing_device(procs_per_device: usize) -> Self {
        Self {
            procs_per_device: procs_per_device.max(1),
        }
    }
}

impl Default for SingleProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn procs_per_device(&self) -> usize {
        self.procs_per_device
    }

    fn sum(&self, _values: &mut [f64]) {}

    fn max(&self, _values: &mut [f64]) {}
}
