//! Device trait implemented by every execution target
//!
//! A device is an externally owned, possibly shared accelerator context. All
//! methods take `&self`; implementations synchronise internally so several
//! subsystems of one process can hold references to the same device.

use super::types::{BufferHandle, CompileOptions, DeviceCapabilities, KernelHandle, ProgramHandle};
use crate::error::Result;

/// Accelerator handle: capabilities, raw memory primitives and program compilation
///
/// # Architecture
///
/// ```text
/// ┌──────────────────────────────────────────────┐
/// │                 Device trait                  │
/// │  - capabilities()                             │
/// │  - buffers (allocate / copy / zero / free)    │
/// │  - programs (compile / resolve / release)     │
/// │  - synchronize()                              │
/// └──────────────────────┬───────────────────────┘
///                        │
///              ┌─────────┴─────────┐
///              ▼                   ▼
///        ┌───────────┐       ┌────────────┐
///        │ CpuDevice │       │ CudaDevice │
///        └───────────┘       └────────────┘
/// ```
///
/// # Ordering
///
/// Copies into device memory are queued in issue order ahead of any kernel
/// that reads them. `copy_from_buffer` and `synchronize` block the caller.
///
/// # Usage
///
/// ```rust
/// use gb_backends::{CpuDevice, Device};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let device = CpuDevice::new();
/// let buffer = device.allocate_buffer(16)?;
/// device.copy_to_buffer(buffer, &[1, 2, 3, 4])?;
///
/// let mut back = [0u8; 4];
/// device.copy_from_buffer(buffer, &mut back)?;
/// assert_eq!(back, [1, 2, 3, 4]);
///
/// device.free_buffer(buffer)?;
/// # Ok(())
/// # }
/// ```
pub trait Device: Send + Sync {
    // ============================================================================================
    // Capabilities
    // ============================================================================================

    /// Static capabilities of this device
    fn capabilities(&self) -> DeviceCapabilities;

    // ============================================================================================
    // Buffer Management
    // ============================================================================================

    /// Allocate a zero-filled buffer of `size` bytes
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackendError::AllocationFailed`] if the device cannot reserve the memory.
    fn allocate_buffer(&self, size: usize) -> Result<BufferHandle>;

    /// Free a previously allocated buffer
    fn free_buffer(&self, handle: BufferHandle) -> Result<()>;

    /// Copy `data` from the host into the start of the buffer
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is invalid or `data` exceeds the buffer size.
    fn copy_to_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()>;

    /// Copy the first `data.len()` bytes of the buffer back to the host (blocking)
    fn copy_from_buffer(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()>;

    /// Fill the whole buffer with zero bytes
    fn zero_buffer(&self, handle: BufferHandle) -> Result<()>;

    /// Buffer size in bytes
    fn buffer_size(&self, handle: BufferHandle) -> Result<usize>;

    // ============================================================================================
    // Program Management
    // ============================================================================================

    /// Compile a program from source
    ///
    /// `label` names the program in logs and errors.
    fn compile_program(&self, label: &str, source: &str, options: &CompileOptions) -> Result<ProgramHandle>;

    /// Resolve a named entry point of a compiled program
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackendError::EntryPointNotFound`] if the program does not export `entry`.
    fn resolve_kernel(&self, program: ProgramHandle, entry: &str) -> Result<KernelHandle>;

    /// Release a resolved entry point
    fn release_kernel(&self, kernel: KernelHandle) -> Result<()>;

    /// Destroy a compiled program
    fn release_program(&self, program: ProgramHandle) -> Result<()>;

    // ============================================================================================
    // Synchronisation
    // ============================================================================================

    /// Block until all queued work on the device has completed
    fn synchronize(&self) -> Result<()>;

    /// Downcast for device-specific access
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Typed upload/download helpers over any [`Device`]
///
/// Element types must be `bytemuck::Pod` so they can be reinterpreted as raw bytes.
pub trait DeviceExt: Device {
    /// Allocate room for `count` elements of `T`
    fn allocate_for<T: bytemuck::Pod>(&self, count: usize) -> Result<BufferHandle> {
        self.allocate_buffer(count * std::mem::size_of::<T>())
    }

    /// Copy a typed slice into the start of the buffer
    fn upload<T: bytemuck::Pod>(&self, handle: BufferHandle, data: &[T]) -> Result<()> {
        self.copy_to_buffer(handle, bytemuck::cast_slice(data))
    }

    /// Read `out.len()` typed elements from the start of the buffer
    fn download<T: bytemuck::Pod>(&self, handle: BufferHandle, out: &mut [T]) -> Result<()> {
        self.copy_from_buffer(handle, bytemuck::cast_slice_mut(out))
    }
}

impl<D: Device + ?Sized> DeviceExt for D {}
