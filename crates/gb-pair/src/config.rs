//! Run configuration: init inputs and load-balancer tuning

use std::env;

/// Scalar inputs to [`crate::GbGpuMemory::init`]
///
/// Validated by the caller; the pool does not re-check ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct PairParams {
    /// Orientation-potential exponents
    pub gamma: f64,
    pub upsilon: f64,
    pub mu: f64,
    /// Special bonded-neighbor weights 1-4
    pub special_lj: [f64; 4],
    /// Atoms owned by this rank
    pub nlocal: usize,
    /// Owned plus ghost atoms
    pub nall: usize,
    pub max_nbors: usize,
    /// Binning cell size for device neighbor builds
    pub cell_size: f64,
    /// Host fraction in `(0, 1]`, `0` for device only, negative for dynamic balancing
    pub gpu_split: f64,
}

impl Default for PairParams {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            upsilon: 1.0,
            mu: 2.0,
            special_lj: [1.0; 4],
            nlocal: 0,
            nall: 0,
            max_nbors: 300,
            cell_size: 0.0,
            gpu_split: 0.0,
        }
    }
}

/// Tuning constants of the dynamic host/device balancer
#[derive(Debug, Clone, PartialEq)]
pub struct BalancerConfig {
    /// Re-measure every this many timesteps
    pub every: u64,
    /// Weight kept on the previous target when blending in a new estimate
    pub weight: f64,
    /// Factor applied to the estimated device share, favouring the device
    pub gap: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            every: 25,
            weight: 0.5,
            gap: 1.05,
        }
    }
}

impl BalancerConfig {
    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GB_BALANCE_EVERY` - measurement interval in timesteps (positive)
    /// - `GB_BALANCE_WEIGHT` - blend weight in `[0, 1]`
    /// - `GB_BALANCE_GAP` - device-share factor (positive)
    ///
    /// Unparsable or out-of-range values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(every) = read_env::<u64>("GB_BALANCE_EVERY") {
            if every > 0 {
                config.every = every;
            } else {
                tracing::warn!(value = every, "GB_BALANCE_EVERY must be positive; keeping default");
            }
        }

        if let Some(weight) = read_env::<f64>("GB_BALANCE_WEIGHT") {
            if (0.0..=1.0).contains(&weight) {
                config.weight = weight;
            } else {
                tracing::warn!(value = weight, "GB_BALANCE_WEIGHT outside [0, 1]; keeping default");
            }
        }

        if let Some(gap) = read_env::<f64>("GB_BALANCE_GAP") {
            if gap > 0.0 {
                config.gap = gap;
            } else {
                tracing::warn!(value = gap, "GB_BALANCE_GAP must be positive; keeping default");
            }
        }

        config
    }

    /// Replace out-of-range fields with their defaults
    ///
    /// Struct literals bypass the checks in [`Self::from_env`]; the balancer runs
    /// every config through this before using it.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.every == 0 {
            tracing::warn!(default = defaults.every, "balancer interval must be positive; using default");
            self.every = defaults.every;
        }
        if !(0.0..=1.0).contains(&self.weight) {
            tracing::warn!(value = self.weight, "balancer weight outside [0, 1]; using default");
            self.weight = defaults.weight;
        }
        if self.gap.is_nan() || self.gap <= 0.0 {
            tracing::warn!(value = self.gap, "balancer gap must be positive; using default");
            self.gap = defaults.gap;
        }
        self
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
