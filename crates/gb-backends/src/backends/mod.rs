//! Device implementations
//!
//! - [`CpuDevice`]: host-memory reference device, always available
//! - [`CudaDevice`]: NVIDIA GPUs through cudarc (feature `cuda`)

pub mod cpu;
pub mod cuda;

pub use cpu::CpuDevice;
pub use cuda::CudaDevice;
