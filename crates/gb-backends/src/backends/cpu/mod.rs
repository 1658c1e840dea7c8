//! CPU reference device
//!
//! Implements [`Device`] in host memory. It runs no kernels; "compilation" records
//! the source and checks that requested entry points are declared in it. Live-object
//! counters make leak checks possible in tests.
//!
//! # Usage
//!
//! ```rust
//! use gb_backends::{CompileOptions, CpuDevice, Device};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = CpuDevice::new();
//! let program = device.compile_program("force", "void kernel_gayberne(int n) {}", &CompileOptions::optimized())?;
//! let kernel = device.resolve_kernel(program, "kernel_gayberne")?;
//!
//! device.release_kernel(kernel)?;
//! device.release_program(program)?;
//! assert_eq!(device.live_programs(), 0);
//! # Ok(())
//! # }
//! ```

pub(crate) mod memory;

use crate::backend::{BufferHandle, CompileOptions, Device, DeviceCapabilities, KernelHandle, ProgramHandle};
use crate::error::{BackendError, Result};
use memory::{CpuProgram, MemoryManager};
use parking_lot::RwLock;
use std::sync::Arc;

/// Default work-group limit reported by the CPU device
pub const CPU_MAX_GROUP_SIZE: usize = 1024;

/// Host-memory device
///
/// Cloning shares the underlying store, the way several subsystems share one accelerator.
#[derive(Clone)]
pub struct CpuDevice {
    capabilities: DeviceCapabilities,
    memory: Arc<RwLock<MemoryManager>>,
}

impl CpuDevice {
    /// Create a device with double support and a 1024-wide work-group limit
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities::new("cpu", CPU_MAX_GROUP_SIZE, true))
    }

    /// Create a device reporting the given capabilities
    ///
    /// ```rust
    /// use gb_backends::{CpuDevice, Device, DeviceCapabilities};
    ///
    /// let small = CpuDevice::with_capabilities(DeviceCapabilities::new("small", 4, false));
    /// assert_eq!(small.capabilities().max_group_size, 4);
    /// ```
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            memory: Arc::new(RwLock::new(MemoryManager::new())),
        }
    }

    /// Fail allocations that would push live bytes past `limit`
    pub fn set_byte_limit(&self, limit: Option<usize>) {
        self.memory.write().set_byte_limit(limit);
    }

    /// Allow `count` more allocations, then fail every further one
    pub fn fail_after_allocations(&self, count: Option<usize>) {
        self.memory.write().set_allocations_left(count);
    }

    pub fn live_buffers(&self) -> usize {
        self.memory.read().live_buffers()
    }

    pub fn live_programs(&self) -> usize {
        self.memory.read().live_programs()
    }

    pub fn live_kernels(&self) -> usize {
        self.memory.read().live_kernels()
    }

    /// Total bytes held by live buffers
    pub fn bytes_allocated(&self) -> usize {
        self.memory.read().bytes_allocated()
    }

    /// Flag string a live program was built with
    pub fn program_flags(&self, program: ProgramHandle) -> Result<String> {
        Ok(self.memory.read().program(program)?.flags.clone())
    }

    /// Entry point name behind a resolved kernel
    pub fn kernel_entry(&self, kernel: KernelHandle) -> Result<String> {
        Ok(self.memory.read().kernel_entry(kernel)?.to_string())
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `source` declares `entry` as a function: the name followed by `(`,
/// not embedded in a longer identifier.
fn declares_entry_point(source: &str, entry: &str) -> bool {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
    source.match_indices(entry).any(|(pos, _)| {
        let before_ok = source[..pos].chars().next_back().is_none_or(|c| !is_ident(c));
        let after = source[pos + entry.len()..].trim_start();
        before_ok && after.starts_with('(')
    })
}

impl Device for CpuDevice {
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
        if source.trim().is_empty() {
            return Err(BackendError::compile_failed(label, "empty source"));
        }
        let program = CpuProgram {
            label: label.to_string(),
            source: source.to_string(),
            flags: options.to_flag_string(),
        };
        Ok(self.memory.write().insert_program(program))
    }

    fn resolve_kernel(&self, program: ProgramHandle, entry: &str) -> Result<KernelHandle> {
        let mut memory = self.memory.write();
        let compiled = memory.program(program)?;
        if !declares_entry_point(&compiled.source, entry) {
            return Err(BackendError::EntryPointNotFound {
                program: compiled.label.clone(),
                entry: entry.to_string(),
            });
        }
        Ok(memory.insert_kernel(program, entry))
    }

    fn release_kernel(&self, kernel: KernelHandle) -> Result<()> {
        self.memory.write().remove_kernel(kernel)
    }

    fn release_program(&self, program: ProgramHandle) -> Result<()> {
        self.memory.write().remove_program(program)
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceExt;

    #[test]
    fn test_cpu_device_creation() {
        let device = CpuDevice::new();
        let caps = device.capabilities();
        assert_eq!(caps.max_group_size, CPU_MAX_GROUP_SIZE);
        assert!(caps.supports_double);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_typed_round_trip() {
        let device = CpuDevice::new();
        let buffer = device.allocate_for::<f32>(4).unwrap();
        assert_eq!(device.buffer_size(buffer).unwrap(), 16);

        device.upload(buffer, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let mut out = [0.0f32; 4];
        device.download(buffer, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);

        device.zero_buffer(buffer).unwrap();
        device.download(buffer, &mut out).unwrap();
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_clones_share_storage() {
        let device = CpuDevice::new();
        let other = device.clone();
        let buffer = device.allocate_buffer(8).unwrap();
        assert_eq!(other.live_buffers(), 1);
        other.free_buffer(buffer).unwrap();
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_entry_point_detection() {
        let src = "__kernel void kernel_lj_fast (int n) {}\n__kernel void kernel_lj(int n) {}";
        assert!(declares_entry_point(src, "kernel_lj"));
        assert!(declares_entry_point(src, "kernel_lj_fast"));
        assert!(!declares_entry_point(src, "lj"));
        assert!(!declares_entry_point(src, "kernel_gayberne"));
        assert!(!declares_entry_point("my_kernel_lj(1)", "kernel_lj"));
    }

    #[test]
    fn test_missing_entry_point_is_reported() {
        let device = CpuDevice::new();
        let program = device
            .compile_program("nbor", "void kernel_gb_nbor(int n) {}", &CompileOptions::default())
            .unwrap();
        let err = device.resolve_kernel(program, "kernel_gb_nbor_fast").unwrap_err();
        assert!(matches!(err, BackendError::EntryPointNotFound { .. }));
        assert_eq!(device.live_kernels(), 0);
    }

    #[test]
    fn test_empty_source_fails_to_compile() {
        let device = CpuDevice::new();
        let err = device.compile_program("empty", "  \n", &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, BackendError::CompileFailed { .. }));
    }

    #[test]
    fn test_program_flags_recorded() {
        let device = CpuDevice::new();
        let options = CompileOptions::optimized().with_define("_DOUBLE_DOUBLE");
        let program = device.compile_program("force", "void k() {}", &options).unwrap();
        let flags = device.program_flags(program).unwrap();
        assert!(flags.contains("-D_DOUBLE_DOUBLE"));
        assert!(flags.contains("-cl-fast-relaxed-math"));
    }

    #[test]
    fn test_fail_after_allocations() {
        let device = CpuDevice::new();
        device.fail_after_allocations(Some(1));
        assert!(device.allocate_buffer(8).is_ok());
        assert!(device.allocate_buffer(8).is_err());
        device.fail_after_allocations(None);
        assert!(device.allocate_buffer(8).is_ok());
        assert_eq!(device.bytes_allocated(), 16);
    }
}
