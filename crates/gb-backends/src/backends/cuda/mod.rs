//! CUDA device for NVIDIA GPUs
//!
//! Wraps a cudarc context and its default stream. Programs are compiled with
//! NVRTC; [`CompileOptions`] map onto `--use_fast_math`, `--fmad` and `-D` flags.
//!
//! # Architecture
//!
//! ```text
//! CudaDevice
//! ├── CudaContext       - driver context for one GPU ordinal
//! ├── CudaStream        - default stream, all work issued in order
//! └── CudaMemoryManager - buffers, modules and resolved functions
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use gb_backends::{CudaDevice, Device};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! if CudaDevice::is_available() {
//!     let device = CudaDevice::new(0)?;
//!     let buffer = device.allocate_buffer(1024)?;
//!     device.free_buffer(buffer)?;
//! }
//! # Ok(())
//! # }
//! ```

mod memory;

use crate::error::{BackendError, Result};

#[cfg(feature = "cuda")]
use crate::backend::{BufferHandle, CompileOptions, Device, DeviceCapabilities, KernelHandle, ProgramHandle};
#[cfg(feature = "cuda")]
use cudarc::driver::sys::CUdevice_attribute;
#[cfg(feature = "cuda")]
use cudarc::driver::{CudaContext, CudaFunction, CudaStream};
#[cfg(feature = "cuda")]
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions as NvrtcOptions};
#[cfg(feature = "cuda")]
use memory::CudaMemoryManager;
#[cfg(feature = "cuda")]
use parking_lot::RwLock;
#[cfg(feature = "cuda")]
use std::sync::Arc;
#[cfg(feature = "cuda")]
use std::time::Instant;

#[cfg(feature = "cuda")]
fn map_driver_err(err: cudarc::driver::DriverError) -> BackendError {
    BackendError::Other(format!("cuda driver error: {err}"))
}

/// NVIDIA GPU device
#[cfg(feature = "cuda")]
pub struct CudaDevice {
    context: Arc<CudaContext>,
    capabilities: DeviceCapabilities,
    memory: RwLock<CudaMemoryManager>,
}

#[cfg(feature = "cuda")]
impl CudaDevice {
    /// Open the GPU with the given ordinal and query its capabilities
    pub fn new(ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(ordinal)
            .map_err(|e| BackendError::Other(format!("CUDA device not found or initialization failed: {e}")))?;

        let name = context.name().map_err(map_driver_err)?;
        let max_group_size = context
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
            .map_err(map_driver_err)?;
        // Every architecture cudarc supports has native doubles.
        let capabilities = DeviceCapabilities::new(name, max_group_size.max(1) as usize, true);

        tracing::info!(
            ordinal = ordinal,
            name = %capabilities.name,
            max_group_size = capabilities.max_group_size,
            "cuda_device_opened"
        );

        let stream = context.default_stream();
        Ok(Self {
            context,
            capabilities,
            memory: RwLock::new(CudaMemoryManager::new(stream)),
        })
    }

    /// Whether GPU 0 can be opened
    pub fn is_available() -> bool {
        CudaContext::new(0).is_ok()
    }

    /// Stream all device work is issued on
    pub fn stream(&self) -> Arc<CudaStream> {
        Arc::clone(self.memory.read().stream())
    }

    /// Function behind a resolved kernel handle, for launching
    pub fn function(&self, kernel: KernelHandle) -> Result<CudaFunction> {
        self.memory.read().function(kernel)
    }
}

#[cfg(feature = "cuda")]
impl Device for CudaDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    fn allocate_buffer(&self, size: usize) -> Result<BufferHandle> {
        self.memory.write().allocate_buffer(size)
    }

    fn free_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.memory.write().free_buffer(handle)
    }

    fn copy_to_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        self.memory.write().copy_to_buffer(handle, data)
    }

    fn copy_from_buffer(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        self.memory.read().copy_from_buffer(handle, data)
    }

    fn zero_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.memory.write().zero_buffer(handle)
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.memory.read().buffer_size(handle)
    }

    fn compile_program(&self, label: &str, source: &str, options: &CompileOptions) -> Result<ProgramHandle> {
        let start = Instant::now();
        let nvrtc = NvrtcOptions {
            use_fast_math: Some(options.fast_math),
            fmad: Some(options.mad_enable),
            options: options.defines.iter().map(|d| format!("-D{d}")).collect(),
            ..Default::default()
        };

        let ptx = compile_ptx_with_opts(source, nvrtc).map_err(|e| BackendError::compile_failed(label, e))?;
        let module = self.context.load_module(ptx).map_err(map_driver_err)?;

        gb_tracing::performance::record_compile(label, 0, start.elapsed().as_micros() as u64);
        Ok(self.memory.write().insert_program(label, module))
    }

    fn resolve_kernel(&self, program: ProgramHandle, entry: &str) -> Result<KernelHandle> {
        self.memory.write().resolve_kernel(program, entry)
    }

    fn release_kernel(&self, kernel: KernelHandle) -> Result<()> {
        self.memory.write().remove_kernel(kernel)
    }

    fn release_program(&self, program: ProgramHandle) -> Result<()> {
        self.memory.write().remove_program(program)
    }

    fn synchronize(&self) -> Result<()> {
        self.memory.read().stream().synchronize().map_err(map_driver_err)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Placeholder when the `cuda` feature is disabled
#[cfg(not(feature = "cuda"))]
pub struct CudaDevice;

#[cfg(not(feature = "cuda"))]
impl CudaDevice {
    pub fn new(_ordinal: usize) -> Result<Self> {
        Err(BackendError::unsupported(
            "CUDA device requires the 'cuda' feature to be enabled",
        ))
    }

    pub fn is_available() -> bool {
        false
    }
}

#[cfg(test)]
#[cfg(not(feature = "cuda"))]
mod stub_tests {
    use super::*;

    #[test]
    fn test_cuda_unavailable_without_feature() {
        assert!(!CudaDevice::is_available());
        assert!(matches!(CudaDevice::new(0), Err(BackendError::UnsupportedOperation(_))));
    }
}

#[cfg(test)]
#[cfg(feature = "cuda")]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_buffer_round_trip() {
        if !CudaDevice::is_available() {
            return;
        }
        let device = CudaDevice::new(0).unwrap();
        let buffer = device.allocate_buffer(16).unwrap();
        assert_eq!(device.buffer_size(buffer).unwrap(), 16);

        device.copy_to_buffer(buffer, b"Hello, CUDA!").unwrap();
        let mut out = [0u8; 12];
        device.copy_from_buffer(buffer, &mut out).unwrap();
        assert_eq!(&out, b"Hello, CUDA!");

        device.zero_buffer(buffer).unwrap();
        device.copy_from_buffer(buffer, &mut out).unwrap();
        assert_eq!(out, [0u8; 12]);

        device.free_buffer(buffer).unwrap();
    }

    #[test]
    fn test_cuda_compile_and_resolve() {
        if !CudaDevice::is_available() {
            return;
        }
        let device = CudaDevice::new(0).unwrap();
        let source = r#"extern "C" __global__ void kernel_fill_one(float* out) { out[0] = 1.0f; }"#;
        let program = device
            .compile_program("fill_one", source, &CompileOptions::optimized().with_define("_SINGLE_SINGLE"))
            .unwrap();
        let kernel = device.resolve_kernel(program, "kernel_fill_one").unwrap();
        assert!(device.resolve_kernel(program, "kernel_missing").is_err());
        device.release_kernel(kernel).unwrap();
        device.release_program(program).unwrap();
    }
}
