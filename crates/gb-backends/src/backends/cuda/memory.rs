//! CUDA object store: device buffers, loaded modules and resolved functions

#[cfg(feature = "cuda")]
use crate::backend::{BufferHandle, KernelHandle, ProgramHandle};
#[cfg(feature = "cuda")]
use crate::error::{BackendError, Result};

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaFunction, CudaModule, CudaSlice, CudaStream};

#[cfg(feature = "cuda")]
use std::collections::HashMap;

#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
fn map_driver_err(err: cudarc::driver::DriverError) -> BackendError {
    BackendError::Other(format!("cuda driver error: {err}"))
}

/// Buffers, modules and functions owned by one [`super::CudaDevice`]
#[cfg(feature = "cuda")]
pub(crate) struct CudaMemoryManager {
    stream: Arc<CudaStream>,

    /// Handle -> (device allocation, logical size in bytes)
    buffers: HashMap<u64, (CudaSlice<u8>, usize)>,

    /// Handle -> (label, loaded module)
    programs: HashMap<u64, (String, Arc<CudaModule>)>,

    /// Handle -> (owning program, function)
    kernels: HashMap<u64, (u64, CudaFunction)>,

    next_id: u64,
}

#[cfg(feature = "cuda")]
impl CudaMemoryManager {
    pub fn new(stream: Arc<CudaStream>) -> Self {
        Self {
            stream,
            buffers: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            next_id: 1,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    // ============================================================================================
    // Buffer Management
    // ============================================================================================

    /// Allocate zeroed device memory; zero-byte requests still get a one-byte allocation
    pub fn allocate_buffer(&mut self, size: usize) -> Result<BufferHandle> {
        let slice = self
            .stream
            .alloc_zeros::<u8>(size.max(1))
            .map_err(|e| BackendError::allocation_failed(size, e))?;

        let id = self.next_id();
        self.buffers.insert(id, (slice, size));
        Ok(BufferHandle::new(id))
    }

    pub fn free_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        self.buffers
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    pub fn copy_to_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let (slice, size) = self
            .buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;

        if data.len() > *size {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size: *size,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut dst = slice.slice_mut(0..data.len());
        self.stream.memcpy_htod(data, &mut dst).map_err(map_driver_err)
    }

    pub fn copy_from_buffer(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        let (slice, size) = self
            .buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;

        if data.len() > *size {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size: *size,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let src = slice.slice(0..data.len());
        self.stream.memcpy_dtoh(&src, data).map_err(map_driver_err)?;
        self.stream.synchronize().map_err(map_driver_err)
    }

    pub fn zero_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let (slice, _) = self
            .buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        self.stream.memset_zeros(slice).map_err(map_driver_err)
    }

    pub fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.buffers
            .get(&handle.id())
            .map(|(_, size)| *size)
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    // ============================================================================================
    // Program Management
    // ============================================================================================

    pub fn insert_program(&mut self, label: &str, module: Arc<CudaModule>) -> ProgramHandle {
        let id = self.next_id();
        self.programs.insert(id, (label.to_string(), module));
        ProgramHandle::new(id)
    }

    pub fn resolve_kernel(&mut self, program: ProgramHandle, entry: &str) -> Result<KernelHandle> {
        let (label, module) = self
            .programs
            .get(&program.id())
            .ok_or(BackendError::InvalidProgramHandle(program.id()))?;

        let function = module.load_function(entry).map_err(|_| BackendError::EntryPointNotFound {
            program: label.clone(),
            entry: entry.to_string(),
        })?;

        let id = self.next_id();
        self.kernels.insert(id, (program.id(), function));
        Ok(KernelHandle::new(id))
    }

    pub fn function(&self, kernel: KernelHandle) -> Result<CudaFunction> {
        self.kernels
            .get(&kernel.id())
            .map(|(_, f)| f.clone())
            .ok_or(BackendError::InvalidKernelHandle(kernel.id()))
    }

    pub fn remove_kernel(&mut self, kernel: KernelHandle) -> Result<()> {
        self.kernels
            .remove(&kernel.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidKernelHandle(kernel.id()))
    }

    pub fn remove_program(&mut self, program: ProgramHandle) -> Result<()> {
        if self.kernels.values().any(|(owner, _)| *owner == program.id()) {
            return Err(BackendError::Other(format!(
                "program {program} still has resolved entry points"
            )));
        }
        self.programs
            .remove(&program.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidProgramHandle(program.id()))
    }
}
