//! Device abstraction for the ellipsoid pair GPU workspace
//!
//! This crate provides:
//! - **Device Trait**: capabilities, buffer management, program compilation
//! - **CPU Device**: host-memory reference implementation used by tests
//! - **CUDA Device**: NVRTC compilation and device memory via cudarc (feature `cuda`)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │               Pair potential resource pool               │
//! │          (tables, error flag, kernels, timers)           │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ &dyn Device
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Device trait                        │
//! └─────────────────────┬───────────────────────────────────┘
//!               ┌───────┴───────┐
//!               ▼               ▼
//!         ┌─────────┐     ┌─────────┐
//!         │   CPU   │     │  CUDA   │
//!         └─────────┘     └─────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use gb_backends::{CpuDevice, Device, DeviceExt};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = CpuDevice::new();
//!
//! let buffer = device.allocate_for::<f32>(4)?;
//! device.upload(buffer, &[1.0f32, 2.0, 3.0, 4.0])?;
//!
//! let mut out = [0.0f32; 4];
//! device.download(buffer, &mut out)?;
//! assert_eq!(out[3], 4.0);
//!
//! device.free_buffer(buffer)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod error;

pub use backend::{BufferHandle, CompileOptions, Device, DeviceCapabilities, DeviceExt, KernelHandle, ProgramHandle};
pub use backends::{CpuDevice, CudaDevice};
pub use error::{BackendError, Result};
