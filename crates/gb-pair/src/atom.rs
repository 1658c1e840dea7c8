//! Atom and neighbor-list storage the pool depends on
//!
//! The pool never moves atoms itself. It asks the collaborator to reserve storage
//! for the run, queries its footprint and timers, and releases it at teardown.

use gb_backends::{BackendError, BufferHandle, Device, DeviceExt};

/// Percent headroom reserved on top of the local atom count
pub const ATOM_HEADROOM_PERCENT: usize = 10;

/// Device bytes per atom for positions, orientation quaternion and answers (16 doubles)
pub const ATOM_BYTES_PER_ATOM: usize = 16 * std::mem::size_of::<f64>();

/// What the pool asks the collaborator to hold for one run
#[derive(Debug, Clone, PartialEq)]
pub struct AtomReservation {
    pub nlocal: usize,
    /// Local atoms handled on the host
    pub host_nlocal: usize,
    pub nall: usize,
    pub max_nbors: usize,
    pub cell_size: f64,
    /// Whether the host computes any atoms
    pub host_participates: bool,
}

/// Atom container and neighbor-list subsystem
pub trait AtomNeighborData {
    /// Reserve device storage; `false` if it could not be acquired
    fn reserve(&mut self, device: &dyn Device, request: &AtomReservation) -> bool;

    /// Release everything `reserve` acquired; no-op when nothing is held
    fn release(&mut self, device: &dyn Device);

    /// Whether neighbor lists are built on the device
    fn device_builds_neighbors(&self) -> bool;

    fn atom_bytes_per_atom(&self) -> usize;

    fn nbor_bytes_per_atom(&self, max_nbors: usize) -> usize;

    /// Atoms the neighbor subsystem can present at once
    fn max_atoms(&self) -> usize;

    /// Host bytes held for atoms and neighbor lists
    fn host_memory_usage(&self) -> f64;

    /// Device bytes held for atoms and neighbor lists
    fn gpu_bytes(&self) -> f64;

    fn transfer_seconds(&self) -> f64;

    fn cast_seconds(&self) -> f64;

    fn neighbor_copy_seconds(&self) -> f64;

    /// Time spent in the collaborator's own neighbor kernels
    fn neighbor_kernel_seconds(&self) -> f64;

    /// Zero the force/torque answer buffer
    fn zero_answers(&mut self, device: &dyn Device) -> Result<(), BackendError>;
}

/// Where neighbor lists come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NeighborMode {
    /// Built on the host and copied over
    #[default]
    Host,
    /// Built on the device
    Device,
}

/// Timers the collaborator accumulates while a run is live
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AtomTimers {
    pub transfer: f64,
    pub cast: f64,
    pub neighbor_copy: f64,
    pub neighbor_kernel: f64,
}

/// In-process atom store: one answer buffer and, for device neighbor builds, one neighbor buffer
#[derive(Debug, Default)]
pub struct HostAtomStore {
    mode: NeighborMode,
    max_atoms: usize,
    max_nbors: usize,
    answers: Option<BufferHandle>,
    neighbors: Option<BufferHandle>,
    gpu_bytes: usize,
    timers: AtomTimers,
}

impl HostAtomStore {
    pub fn new(mode: NeighborMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.answers.is_some()
    }

    /// Answer buffer, while reserved
    pub fn answers(&self) -> Option<BufferHandle> {
        self.answers
    }

    pub fn timers(&self) -> &AtomTimers {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut AtomTimers {
        &mut self.timers
    }

    fn try_reserve(&mut self, device: &dyn Device, request: &AtomReservation) -> Result<(), BackendError> {
        let max_atoms = request.nlocal + (request.nlocal * ATOM_HEADROOM_PERCENT).div_ceil(100);
        let answer_bytes = max_atoms.max(1) * ATOM_BYTES_PER_ATOM;

        let answers = device.allocate_buffer(answer_bytes)?;
        self.answers = Some(answers);
        self.gpu_bytes = answer_bytes;

        if self.mode == NeighborMode::Device {
            let nbor_bytes = max_atoms.max(1) * self.nbor_bytes_per_atom(request.max_nbors);
            self.neighbors = Some(device.allocate_for::<u8>(nbor_bytes)?);
            self.gpu_bytes += nbor_bytes;
        }

        self.max_atoms = max_atoms;
        self.max_nbors = request.max_nbors;
        Ok(())
    }
}

impl AtomNeighborData for HostAtomStore {
    fn reserve(&mut self, device: &dyn Device, request: &AtomReservation) -> bool {
        self.release(device);
        match self.try_reserve(device, request) {
            Ok(()) => {
                tracing::debug!(
                    max_atoms = self.max_atoms,
                    gpu_bytes = self.gpu_bytes,
                    neighbor_mode = ?self.mode,
                    "atom_storage_reserved"
                );
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, nlocal = request.nlocal, "atom storage reservation failed");
                self.release(device);
                false
            }
        }
    }

    fn release(&mut self, device: &dyn Device) {
        for handle in [self.neighbors.take(), self.answers.take()].into_iter().flatten() {
            if let Err(err) = device.free_buffer(handle) {
                tracing::warn!(error = %err, buffer = %handle, "failed to free atom storage");
            }
        }
        self.gpu_bytes = 0;
        self.max_atoms = 0;
        self.max_nbors = 0;
        self.timers = AtomTimers::default();
    }

    fn device_builds_neighbors(&self) -> bool {
        self.mode == NeighborMode::Device
    }

    fn atom_bytes_per_atom(&self) -> usize {
        ATOM_BYTES_PER_ATOM
    }

    /// One index per neighbor plus a count and an offset
    fn nbor_bytes_per_atom(&self, max_nbors: usize) -> usize {
        (max_nbors + 2) * std::mem::size_of::<i32>()
    }

    fn max_atoms(&self) -> usize {
        self.max_atoms
    }

    fn host_memory_usage(&self) -> f64 {
        let per_atom = ATOM_BYTES_PER_ATOM + self.nbor_bytes_per_atom(self.max_nbors);
        (self.max_atoms * per_atom) as f64
    }

    fn gpu_bytes(&self) -> f64 {
        self.gpu_bytes as f64
    }

    fn transfer_seconds(&self) -> f64 {
        self.timers.transfer
    }

    fn cast_seconds(&self) -> f64 {
        self.timers.cast
    }

    fn neighbor_copy_seconds(&self) -> f64 {
        self.timers.neighbor_copy
    }

    fn neighbor_kernel_seconds(&self) -> f64 {
        self.timers.neighbor_kernel
    }

    fn zero_answers(&mut self, device: &dyn Device) -> Result<(), BackendError> {
        match self.answers {
            Some(handle) => device.zero_buffer(handle),
            None => Err(BackendError::Other("answer buffer not reserved".into())),
        }
    }
}
