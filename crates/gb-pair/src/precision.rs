//! Compile-time numeric precision
//!
//! The device scalar type is fixed when the pool type is named, e.g.
//! `GbGpuMemory<'_, Mixed>`. Nothing switches precision at runtime.
//!
//! | Mode     | Table scalar | Accumulator | Kernel define     |
//! |----------|--------------|-------------|-------------------|
//! | `Single` | `f32`        | `f32`       | `_SINGLE_SINGLE`  |
//! | `Mixed`  | `f32`        | `f64`       | `_SINGLE_DOUBLE`  |
//! | `Double` | `f64`        | `f64`       | `_DOUBLE_DOUBLE`  |

use std::fmt::Debug;

/// Scalar that can live in a device table
pub trait DeviceScalar: bytemuck::Pod + Default + PartialEq + Debug + Send + Sync + 'static {
    /// Single cast from the host's double representation
    fn from_f64(value: f64) -> Self;

    /// Widen back to `f64` (exact)
    fn to_f64(self) -> f64;
}

impl DeviceScalar for f32 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl DeviceScalar for f64 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

/// Runtime-visible name of a precision mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionMode {
    Single,
    Mixed,
    Double,
}

impl PrecisionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PrecisionMode::Single => "single",
            PrecisionMode::Mixed => "mixed",
            PrecisionMode::Double => "double",
        }
    }

    /// Whether kernels built in this mode need double arithmetic on the device
    pub fn requires_double(self) -> bool {
        !matches!(self, PrecisionMode::Single)
    }
}

/// Compile-time precision selection
pub trait Precision: Debug + Send + Sync + 'static {
    /// Scalar type of every constant table
    type Scalar: DeviceScalar;
    /// Scalar type kernels accumulate forces in
    type Accum: DeviceScalar;

    const MODE: PrecisionMode;

    /// Preprocessor define handed to every kernel program
    const DEFINE: &'static str;
}

/// `f32` tables, `f32` accumulation
#[derive(Debug, Clone, Copy, Default)]
pub struct Single;

/// `f32` tables, `f64` accumulation
#[derive(Debug, Clone, Copy, Default)]
pub struct Mixed;

/// `f64` tables, `f64` accumulation
#[derive(Debug, Clone, Copy, Default)]
pub struct Double;

impl Precision for Single {
    type Scalar = f32;
    type Accum = f32;
    const MODE: PrecisionMode = PrecisionMode::Single;
    const DEFINE: &'static str = "_SINGLE_SINGLE";
}

impl Precision for Mixed {
    type Scalar = f32;
    type Accum = f64;
    const MODE: PrecisionMode = PrecisionMode::Mixed;
    const DEFINE: &'static str = "_SINGLE_DOUBLE";
}

impl Precision for Double {
    type Scalar = f64;
    type Accum = f64;
    const MODE: PrecisionMode = PrecisionMode::Double;
    const DEFINE: &'static str = "_DOUBLE_DOUBLE";
}
