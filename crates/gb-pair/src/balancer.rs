//! Host/device load balancer
//!
//! Splits each timestep's atoms between the host and the device. The configured
//! `requested_split` is the host fraction:
//!
//! - `> 0`: fixed share of atoms kept on the host
//! - `0`: everything on the device
//! - `< 0`: dynamic; the share is re-estimated from measured timings every
//!   [`BalancerConfig::every`] steps
//!
//! Internally the balancer tracks the *device* share, which is what kernels are
//! launched over and what the teardown report prints as "Average split".
//!
//! # Dynamic heuristic
//!
//! On a measured step the per-atom costs of the host and device phases give the
//! device share that would make both sides finish together:
//!
//! ```text
//! estimate = host_cost / (host_cost + device_cost)
//! target   = weight * target + (1 - weight) * min(estimate * gap, 1)
//! ```

use crate::collective::Collective;
use crate::config::BalancerConfig;
use crate::error::Result;
use gb_backends::{Device, DeviceCapabilities};
use std::time::Instant;

/// Initial host fraction when balancing dynamically
pub const DYNAMIC_INITIAL_HOST_FRACTION: f64 = 0.1;

/// Decides how many atoms run on the device each step and tracks the split history
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    config: BalancerConfig,
    initialized: bool,
    dynamic: bool,
    /// Target device share in `[0, 1]`
    target: f64,
    /// Host atoms fixed by [`Self::first_host_count`]
    host_count: usize,
    split_sum: f64,
    split_count: u64,
    measure_this_step: bool,
    timer_start: Option<Instant>,
    last_device_seconds: f64,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(BalancerConfig::default())
    }
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config: config.sanitized(),
            initialized: false,
            dynamic: false,
            target: 1.0,
            host_count: 0,
            split_sum: 0.0,
            split_count: 0,
            measure_this_step: false,
            timer_start: None,
            last_device_seconds: 0.0,
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Host atoms when the device builds neighbor lists; fixed for the run
    ///
    /// Returns 0 when the host builds neighbors (the split is then applied per step
    /// instead). Deterministic in its inputs.
    pub fn first_host_count(&mut self, total_atoms: usize, device_builds_neighbors: bool, requested_split: f64) -> usize {
        let count = if !device_builds_neighbors {
            0
        } else if requested_split > 0.0 {
            host_share(total_atoms, requested_split)
        } else if requested_split < 0.0 {
            host_share(total_atoms, DYNAMIC_INITIAL_HOST_FRACTION)
        } else {
            0
        };
        self.host_count = count;
        count
    }

    /// Host atoms fixed at init
    pub fn host_count(&self) -> usize {
        self.host_count
    }

    /// Whether the host computes any atoms this run
    pub fn host_participates(&self) -> bool {
        self.host_count > 0
    }

    /// Set the initial target from the requested split
    pub fn init(&mut self, caps: &DeviceCapabilities, requested_split: f64) {
        self.dynamic = requested_split < 0.0;
        self.target = if self.dynamic {
            1.0 - DYNAMIC_INITIAL_HOST_FRACTION
        } else {
            (1.0 - requested_split).clamp(0.0, 1.0)
        };
        self.split_sum = 0.0;
        self.split_count = 0;
        self.measure_this_step = false;
        self.timer_start = None;
        self.last_device_seconds = 0.0;
        self.initialized = true;

        tracing::debug!(
            device = %caps.name,
            requested_split = requested_split,
            dynamic = self.dynamic,
            device_share = self.target,
            "load_balancer_initialized"
        );
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Current target device share
    pub fn target_split(&self) -> f64 {
        self.target
    }

    /// Atoms to launch on the device for `timestep`; arms measurement on sampling steps
    pub fn device_count(&mut self, timestep: u64, total_atoms: usize) -> usize {
        self.measure_this_step = self.dynamic && timestep % self.config.every == 0;
        let device = (self.target * total_atoms as f64).floor() as usize;
        device.min(total_atoms)
    }

    /// Whether the current step is being timed for rebalancing
    pub fn measuring(&self) -> bool {
        self.measure_this_step
    }

    /// Start timing device work on a measured step
    pub fn start_timer(&mut self) {
        if self.measure_this_step {
            self.timer_start = Some(Instant::now());
        }
    }

    /// Wait for the device and record how long its work took
    pub fn stop_timer(&mut self, device: &dyn Device) -> Result<()> {
        if let Some(start) = self.timer_start.take() {
            device.synchronize()?;
            self.last_device_seconds = start.elapsed().as_secs_f64();
        }
        Ok(())
    }

    /// Device seconds measured by the last start/stop pair
    pub fn last_device_seconds(&self) -> f64 {
        self.last_device_seconds
    }

    /// Close a timestep: rebalance on measured steps, then record the target
    pub fn balance(&mut self, host_seconds: f64, host_atoms: usize, device_atoms: usize) {
        let device_seconds = self.last_device_seconds;
        self.rebalance(host_seconds, host_atoms, device_seconds, device_atoms);
        self.record_split(self.target);
    }

    /// Fold one measurement into the target; ignored unless the step was armed
    ///
    /// A side with no atoms or no time gives no cost estimate and leaves the target unchanged.
    pub fn rebalance(&mut self, host_seconds: f64, host_atoms: usize, device_seconds: f64, device_atoms: usize) {
        if !std::mem::take(&mut self.measure_this_step) {
            return;
        }
        if host_atoms == 0 || device_atoms == 0 || host_seconds <= 0.0 || device_seconds <= 0.0 {
            return;
        }

        let host_cost = host_seconds / host_atoms as f64;
        let device_cost = device_seconds / device_atoms as f64;
        let estimate = (host_cost / (host_cost + device_cost) * self.config.gap).min(1.0);
        let weight = self.config.weight;
        self.target = (weight * self.target + (1.0 - weight) * estimate).clamp(0.0, 1.0);

        tracing::debug!(
            host_cost = host_cost,
            device_cost = device_cost,
            estimate = estimate,
            device_share = self.target,
            "load_rebalanced"
        );
    }

    /// Record one observed device share; never blocks
    pub fn record_split(&mut self, observed: f64) {
        self.split_sum += observed;
        self.split_count += 1;
    }

    /// Splits recorded on this rank
    pub fn recorded_splits(&self) -> u64 {
        self.split_count
    }

    /// Mean of all recorded splits over all ranks; the target when nothing was recorded
    ///
    /// Collective: every rank must call it.
    pub fn all_ranks_average_split(&self, collective: &dyn Collective) -> f64 {
        let mut totals = [self.split_sum, self.split_count as f64];
        collective.sum(&mut totals);
        if totals[1] > 0.0 {
            totals[0] / totals[1]
        } else {
            self.target
        }
    }

    /// Back to the uninitialized state; configuration is kept
    pub fn clear(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

/// `ceil(fraction * total)` clamped to `[0, total]`
fn host_share(total_atoms: usize, fraction: f64) -> usize {
    let share = (fraction * total_atoms as f64).ceil();
    (share.max(0.0) as usize).min(total_atoms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::SingleProcess;
    use gb_backends::CpuDevice;

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities::new("test", 256, true)
    }

    #[test]
    fn first_host_count_without_device_neighbors_is_zero() {
        let mut balancer = LoadBalancer::default();
        assert_eq!(balancer.first_host_count(100, false, 0.5), 0);
        assert_eq!(balancer.first_host_count(100, false, -1.0), 0);
        assert!(!balancer.host_participates());
    }

    #[test]
    fn first_host_count_fixed_and_dynamic() {
        let mut balancer = LoadBalancer::default();
        assert_eq!(balancer.first_host_count(100, true, 0.0), 0);
        assert_eq!(balancer.first_host_count(100, true, 0.25), 25);
        assert_eq!(balancer.first_host_count(10, true, 0.01), 1);
        assert_eq!(balancer.first_host_count(10, true, 1.0), 10);
        assert_eq!(balancer.first_host_count(100, true, -1.0), 10);
        assert!(balancer.host_participates());
    }

    #[test]
    fn init_sets_device_share() {
        let mut balancer = LoadBalancer::default();
        balancer.init(&caps(), 0.0);
        assert_eq!(balancer.target_split(), 1.0);
        balancer.init(&caps(), 0.3);
        assert!((balancer.target_split() - 0.7).abs() < 1e-12);
        balancer.init(&caps(), -1.0);
        assert!(balancer.is_dynamic());
        assert!((balancer.target_split() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn average_falls_back_to_target() {
        let mut balancer = LoadBalancer::default();
        balancer.init(&caps(), 0.0);
        assert_eq!(balancer.all_ranks_average_split(&SingleProcess::new()), 1.0);

        balancer.record_split(0.5);
        balancer.record_split(0.7);
        let avg = balancer.all_ranks_average_split(&SingleProcess::new());
        assert!((avg - 0.6).abs() < 1e-12);
    }

    #[test]
    fn measurement_only_on_sampling_steps() {
        let mut balancer = LoadBalancer::default();
        balancer.init(&caps(), -1.0);
        balancer.device_count(1, 100);
        assert!(!balancer.measuring());
        balancer.device_count(25, 100);
        assert!(balancer.measuring());

        balancer.init(&caps(), 0.5);
        balancer.device_count(25, 100);
        assert!(!balancer.measuring());
    }

    #[test]
    fn equal_costs_converge_near_half() {
        let mut balancer = LoadBalancer::new(BalancerConfig {
            every: 1,
            ..BalancerConfig::default()
        });
        balancer.init(&caps(), -1.0);
        for step in 0..50 {
            let device_atoms = balancer.device_count(step, 1000);
            let host_atoms = 1000 - device_atoms;
            balancer.rebalance(host_atoms as f64 * 1e-6, host_atoms, device_atoms as f64 * 1e-6, device_atoms);
            balancer.record_split(balancer.target_split());
        }
        assert!((balancer.target_split() - 0.525).abs() < 1e-3);
    }

    #[test]
    fn timer_measures_device_work() {
        let device = CpuDevice::new();
        let mut balancer = LoadBalancer::new(BalancerConfig {
            every: 1,
            ..BalancerConfig::default()
        });
        balancer.init(&caps(), -1.0);
        balancer.device_count(0, 10);
        balancer.start_timer();
        std::thread::sleep(std::time::Duration::from_millis(1));
        balancer.stop_timer(&device).unwrap();
        assert!(balancer.last_device_seconds() > 0.0);

        balancer.balance(1.0, 1, 9);
        assert_eq!(balancer.recorded_splits(), 1);
        assert!(!balancer.measuring());
    }

    #[test]
    fn zero_interval_falls_back_to_default() {
        let mut balancer = LoadBalancer::new(BalancerConfig {
            every: 0,
            ..BalancerConfig::default()
        });
        assert_eq!(balancer.config().every, BalancerConfig::default().every);

        balancer.init(&caps(), -1.0);
        assert_eq!(balancer.device_count(3, 10), 9);
        assert!(!balancer.measuring());
        balancer.device_count(25, 10);
        assert!(balancer.measuring());
    }

    #[test]
    fn clear_resets_state() {
        let mut balancer = LoadBalancer::default();
        balancer.first_host_count(10, true, 0.5);
        balancer.init(&caps(), 0.5);
        balancer.record_split(0.5);
        balancer.clear();
        assert!(!balancer.is_initialized());
        assert_eq!(balancer.host_count(), 0);
        assert_eq!(balancer.recorded_splits(), 0);
    }
}
