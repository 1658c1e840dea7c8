//! Object store for the CPU device
//!
//! Buffers are plain zero-filled byte vectors keyed by handle id. Programs keep
//! their source so entry points can be resolved by name.

use crate::backend::{BufferHandle, KernelHandle, ProgramHandle};
use crate::error::{BackendError, Result};
use std::collections::HashMap;

/// A "compiled" program: its label, source and the flags it was built with
#[derive(Debug, Clone)]
pub(crate) struct CpuProgram {
    pub label: String,
    pub source: String,
    pub flags: String,
}

/// Buffers, programs and kernels owned by one [`super::CpuDevice`]
pub(crate) struct MemoryManager {
    buffers: HashMap<u64, Vec<u8>>,
    programs: HashMap<u64, CpuProgram>,
    /// Kernel id -> (owning program id, entry name)
    kernels: HashMap<u64, (u64, String)>,
    next_id: u64,
    /// Upper bound on live bytes; `None` = unlimited
    byte_limit: Option<usize>,
    /// Number of further allocations allowed before failures start; `None` = unlimited
    allocations_left: Option<usize>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            next_id: 1,
            byte_limit: None,
            allocations_left: None,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn set_byte_limit(&mut self, limit: Option<usize>) {
        self.byte_limit = limit;
    }

    pub fn set_allocations_left(&mut self, count: Option<usize>) {
        self.allocations_left = count;
    }

    // ============================================================================================
    // Buffer Management
    // ============================================================================================

    pub fn allocate_buffer(&mut self, size: usize) -> Result<BufferHandle> {
        if let Some(left) = self.allocations_left.as_mut() {
            if *left == 0 {
                return Err(BackendError::allocation_failed(size, "allocation budget exhausted"));
            }
            *left -= 1;
        }
        if let Some(limit) = self.byte_limit {
            let live = self.bytes_allocated();
            if live + size > limit {
                return Err(BackendError::allocation_failed(
                    size,
                    format!("{live} bytes live, limit {limit}"),
                ));
            }
        }

        let id = self.next_id();
        self.buffers.insert(id, vec![0u8; size]);
        Ok(BufferHandle::new(id))
    }

    pub fn free_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        self.buffers
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    pub fn copy_to_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;

        if data.len() > buffer.len() {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size: buffer.len(),
            });
        }

        buffer[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn copy_from_buffer(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        let buffer = self
            .buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;

        if data.len() > buffer.len() {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size: buffer.len(),
            });
        }

        data.copy_from_slice(&buffer[..data.len()]);
        Ok(())
    }

    pub fn zero_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        buffer.fill(0);
        Ok(())
    }

    pub fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.buffers
            .get(&handle.id())
            .map(Vec::len)
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }

    // ============================================================================================
    // Program Management
    // ============================================================================================

    pub fn insert_program(&mut self, program: CpuProgram) -> ProgramHandle {
        let id = self.next_id();
        self.programs.insert(id, program);
        ProgramHandle::new(id)
    }

    pub fn program(&self, handle: ProgramHandle) -> Result<&CpuProgram> {
        self.programs
            .get(&handle.id())
            .ok_or(BackendError::InvalidProgramHandle(handle.id()))
    }

    pub fn insert_kernel(&mut self, program: ProgramHandle, entry: &str) -> KernelHandle {
        let id = self.next_id();
        self.kernels.insert(id, (program.id(), entry.to_string()));
        KernelHandle::new(id)
    }

    pub fn remove_kernel(&mut self, handle: KernelHandle) -> Result<()> {
        self.kernels
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidKernelHandle(handle.id()))
    }

    /// Remove a program; entry points resolved from it must be released first
    pub fn remove_program(&mut self, handle: ProgramHandle) -> Result<()> {
        if self.kernels.values().any(|(owner, _)| *owner == handle.id()) {
            return Err(BackendError::Other(format!(
                "program {handle} still has resolved entry points"
            )));
        }
        self.programs
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidProgramHandle(handle.id()))
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_kernels(&self) -> usize {
        self.kernels.len()
    }

    pub fn kernel_entry(&self, handle: KernelHandle) -> Result<&str> {
        self.kernels
            .get(&handle.id())
            .map(|(_, entry)| entry.as_str())
            .ok_or(BackendError::InvalidKernelHandle(handle.id()))
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}
