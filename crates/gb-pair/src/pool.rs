//! Resource pool for the Gay-Berne potential
//!
//! [`GbGpuMemory`] owns every device allocation the potential makes for one run:
//! the packed type tables, the error flag, the constant block, the per-type shape
//! tables and the ordered index buffer. It also owns the compiled kernels, the
//! load balancer and the timers.
//!
//! # Lifecycle
//!
//! ```text
//!             init                       clear
//!   empty ─────────────▶ allocated ─────────────▶ empty
//!     │                                             │
//!     └──── clear (no-op) ◀─────────────────────────┘
//! ```
//!
//! Each buffer lives in its own slot and is released in the reverse of acquisition
//! order. A failed `init` releases whatever it acquired before returning.
//!
//! # Usage
//!
//! ```rust
//! use gb_backends::CpuDevice;
//! use gb_pair::{GbGpuMemory, HostAtomStore, HostTables, KernelSources, NeighborMode, PairParams, Single, SingleProcess};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = CpuDevice::new();
//! let world = SingleProcess::new();
//! let sources = KernelSources::new(
//!     "void kernel_gb_nbor_fast() {} void kernel_gb_nbor() {}",
//!     "void kernel_gayberne() {}",
//!     "void kernel_sphere_gb() {} void kernel_lj_fast() {} void kernel_lj() {}",
//! );
//!
//! let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Host), sources);
//! pool.init(&PairParams { nlocal: 100, nall: 120, ..PairParams::default() }, &HostTables::new(1))?;
//! assert!(pool.bytes_in_use() > 0.0);
//!
//! pool.clear(None)?;
//! assert_eq!(device.live_buffers(), 0);
//! # Ok(())
//! # }
//! ```

use crate::atom::{AtomNeighborData, AtomReservation, HostAtomStore};
use crate::balancer::LoadBalancer;
use crate::collective::Collective;
use crate::config::{BalancerConfig, PairParams};
use crate::error::{GbError, Result};
use crate::host::HostTables;
use crate::precision::Precision;
use crate::program::{KernelProgramCache, KernelSet, KernelSources};
use crate::timing::{DeviceFault, DeviceTimers, Phase, TeardownReport, TimingAccumulators};
use crate::type_table::{self, constant_block, LayoutMode, TypeTables};
use gb_backends::{BackendError, BufferHandle, Device, DeviceExt};
use gb_tracing::performance::{record_allocation, record_transfer};
use std::io::Write;
use std::marker::PhantomData;
use std::time::Instant;

// ================================================================================================
// Buffer slots
// ================================================================================================

/// Device buffers owned by the pool, listed in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSlot {
    SigmaEpsilon,
    CutForm,
    Lj1,
    Lj3,
    ErrorFlag,
    /// `[gamma, upsilon, mu, special_lj[0..4]]`
    Constants,
    Lshape,
    Shape,
    Well,
    /// Atom indices ordered by type
    OrderedIndex,
}

impl BufferSlot {
    pub const ALL: [BufferSlot; 10] = [
        BufferSlot::SigmaEpsilon,
        BufferSlot::CutForm,
        BufferSlot::Lj1,
        BufferSlot::Lj3,
        BufferSlot::ErrorFlag,
        BufferSlot::Constants,
        BufferSlot::Lshape,
        BufferSlot::Shape,
        BufferSlot::Well,
        BufferSlot::OrderedIndex,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            BufferSlot::SigmaEpsilon => "sigma_epsilon",
            BufferSlot::CutForm => "cut_form",
            BufferSlot::Lj1 => "lj1",
            BufferSlot::Lj3 => "lj3",
            BufferSlot::ErrorFlag => "dev_error",
            BufferSlot::Constants => "gamma_upsilon_mu",
            BufferSlot::Lshape => "lshape",
            BufferSlot::Shape => "shape",
            BufferSlot::Well => "well",
            BufferSlot::OrderedIndex => "host_olist",
        }
    }

    /// The ordered index list is host-visible staging and is accounted on the host side
    fn counts_as_device_memory(self) -> bool {
        self != BufferSlot::OrderedIndex
    }
}

#[derive(Debug, Clone, Copy)]
struct OwnedBuffer {
    handle: BufferHandle,
    bytes: usize,
}

#[derive(Debug, Default)]
struct PoolBuffers {
    slots: [Option<OwnedBuffer>; 10],
}

impl PoolBuffers {
    fn get(&self, slot: BufferSlot) -> Option<OwnedBuffer> {
        self.slots[slot.index()]
    }

    fn allocate(&mut self, device: &dyn Device, slot: BufferSlot, bytes: usize) -> Result<BufferHandle> {
        debug_assert!(self.slots[slot.index()].is_none(), "slot {} already held", slot.name());
        let handle = device.allocate_buffer(bytes)?;
        self.slots[slot.index()] = Some(OwnedBuffer { handle, bytes });
        record_allocation(bytes, slot.name());
        Ok(handle)
    }

    /// Allocate exactly `data.len()` bytes and queue the copy
    fn upload(&mut self, device: &dyn Device, slot: BufferSlot, data: &[u8]) -> Result<BufferHandle> {
        let handle = self.allocate(device, slot, data.len())?;
        let start = Instant::now();
        device.copy_to_buffer(handle, data)?;
        record_transfer(data.len(), "H2D", slot.name(), start.elapsed().as_micros() as u64);
        Ok(handle)
    }

    fn device_bytes(&self) -> usize {
        BufferSlot::ALL
            .iter()
            .filter(|slot| slot.counts_as_device_memory())
            .filter_map(|slot| self.get(*slot))
            .map(|buffer| buffer.bytes)
            .sum()
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Free every held buffer, last acquired first; keeps going past failures
    fn release_all(&mut self, device: &dyn Device) -> std::result::Result<(), BackendError> {
        let mut first_err = None;
        for slot in BufferSlot::ALL.iter().rev() {
            if let Some(buffer) = self.slots[slot.index()].take() {
                if let Err(err) = device.free_buffer(buffer.handle) {
                    tracing::warn!(error = %err, buffer = slot.name(), "failed to free device buffer");
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

// ================================================================================================
// Pool
// ================================================================================================

/// Pair-table geometry chosen at init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    pub mode: LayoutMode,
    /// Row stride of the pair tables
    pub width: usize,
    pub type_count: usize,
}

/// Device-resident state of the Gay-Berne potential for one run
///
/// Borrows the device and the collective for its whole lifetime; neither is owned.
pub struct GbGpuMemory<'d, P: Precision, A: AtomNeighborData = HostAtomStore> {
    device: &'d dyn Device,
    collective: &'d dyn Collective,
    atoms: A,
    sources: KernelSources,
    programs: KernelProgramCache,
    balancer: LoadBalancer,
    timers: DeviceTimers,
    accumulators: TimingAccumulators,
    buffers: PoolBuffers,
    layout: Option<TableLayout>,
    block_size: usize,
    multiple_forms: bool,
    max_bytes: f64,
    allocated: bool,
    _precision: PhantomData<P>,
}

impl<'d, P: Precision, A: AtomNeighborData> GbGpuMemory<'d, P, A> {
    pub fn new(device: &'d dyn Device, collective: &'d dyn Collective, atoms: A, sources: KernelSources) -> Self {
        Self {
            device,
            collective,
            atoms,
            sources,
            programs: KernelProgramCache::new(),
            balancer: LoadBalancer::default(),
            timers: DeviceTimers::default(),
            accumulators: TimingAccumulators::new(),
            buffers: PoolBuffers::default(),
            layout: None,
            block_size: 0,
            multiple_forms: false,
            max_bytes: 0.0,
            allocated: false,
            _precision: PhantomData,
        }
    }

    /// Replace the balancer tuning; takes effect at the next `init`
    pub fn with_balancer_config(mut self, config: BalancerConfig) -> Self {
        self.balancer = LoadBalancer::new(config);
        self
    }

    // ============================================================================================
    // Init
    // ============================================================================================

    /// Build tables, compile kernels and start timers for one run
    ///
    /// # Errors
    ///
    /// - [`GbError::AlreadyInitialized`] if the pool is still allocated
    /// - [`GbError::FormConflict`] (fatal) before anything is allocated or compiled
    /// - [`GbError::ReservationFailed`] or [`GbError::Backend`] if acquisition fails;
    ///   everything acquired so far has been released
    pub fn init(&mut self, params: &PairParams, host: &HostTables) -> Result<()> {
        if self.allocated {
            return Err(GbError::AlreadyInitialized);
        }
        host.validate()?;

        let caps = self.device.capabilities();
        if P::MODE.requires_double() && !caps.supports_double {
            return Err(GbError::UnsupportedPrecision {
                device: caps.name,
                mode: P::MODE.as_str(),
            });
        }

        let _span = gb_tracing::perf_span!("gb_pool_init", types = host.type_count, nlocal = params.nlocal);

        let device_nbor = self.atoms.device_builds_neighbors();
        let host_count = self.balancer.first_host_count(params.nlocal, device_nbor, params.gpu_split);
        let multiple_forms = type_table::multiple_forms(&host.form);
        if let Err(err) = type_table::check_form_conflict(multiple_forms, device_nbor, host_count) {
            tracing::error!(host_atoms = host_count, "{err}");
            self.balancer.clear();
            return Err(err);
        }

        let request = AtomReservation {
            nlocal: params.nlocal,
            host_nlocal: host_count,
            nall: params.nall,
            max_nbors: params.max_nbors,
            cell_size: params.cell_size,
            host_participates: host_count > 0,
        };
        if !self.atoms.reserve(self.device, &request) {
            self.balancer.clear();
            return Err(GbError::ReservationFailed { nlocal: params.nlocal });
        }

        match self.acquire(params, host, multiple_forms) {
            Ok(()) => {
                self.allocated = true;
                tracing::info!(
                    device = %caps.name,
                    precision = P::MODE.as_str(),
                    layout = self.layout.map(|l| l.mode.as_str()).unwrap_or("none"),
                    block_size = self.block_size,
                    host_atoms = host_count,
                    multiple_forms = multiple_forms,
                    device_bytes = self.max_bytes,
                    "gb_pool_initialized"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "gb pool initialization failed; releasing partial state");
                if let Err(release_err) = self.release_resources() {
                    tracing::warn!(error = %release_err, "release after failed init reported an error");
                }
                Err(err)
            }
        }
    }

    fn acquire(&mut self, params: &PairParams, host: &HostTables, multiple_forms: bool) -> Result<()> {
        let device = self.device;
        let caps = device.capabilities();

        self.block_size = type_table::block_size(&caps);
        self.programs.compile::<P>(device, &self.sources)?;
        self.balancer.init(&caps, params.gpu_split);
        self.timers.zero_all();
        self.accumulators.zero_all();

        let tables = TypeTables::<P::Scalar>::build_for_block(self.block_size, host)?;
        let buffers = &mut self.buffers;
        buffers.upload(device, BufferSlot::SigmaEpsilon, bytemuck::cast_slice(&tables.sigma_epsilon))?;
        buffers.upload(device, BufferSlot::CutForm, bytemuck::cast_slice(&tables.cut_form))?;
        buffers.upload(device, BufferSlot::Lj1, bytemuck::cast_slice(&tables.lj1))?;
        buffers.upload(device, BufferSlot::Lj3, bytemuck::cast_slice(&tables.lj3))?;

        let flag = buffers.allocate(device, BufferSlot::ErrorFlag, std::mem::size_of::<i32>())?;
        device.zero_buffer(flag)?;

        let constants = constant_block::<P::Scalar>(params);
        buffers.upload(device, BufferSlot::Constants, bytemuck::cast_slice(&constants))?;
        buffers.upload(device, BufferSlot::Lshape, bytemuck::cast_slice(&tables.lshape))?;
        buffers.upload(device, BufferSlot::Shape, bytemuck::cast_slice(&tables.shape))?;
        buffers.upload(device, BufferSlot::Well, bytemuck::cast_slice(&tables.well))?;

        if multiple_forms {
            self.atoms.zero_answers(device)?;
        }

        self.layout = Some(TableLayout {
            mode: tables.layout_mode,
            width: tables.width,
            type_count: tables.type_count,
        });
        self.multiple_forms = multiple_forms;

        self.max_bytes = self.atoms.gpu_bytes() + self.buffers.device_bytes() as f64;
        self.accumulators.record_peak("atom_neighbor", self.atoms.gpu_bytes());
        for slot in BufferSlot::ALL.iter().filter(|s| s.counts_as_device_memory()) {
            if let Some(buffer) = self.buffers.get(*slot) {
                self.accumulators.record_peak(slot.name(), buffer.bytes as f64);
            }
        }

        let olist_bytes = self.atoms.max_atoms() * std::mem::size_of::<i32>();
        self.buffers.allocate(device, BufferSlot::OrderedIndex, olist_bytes)?;
        Ok(())
    }

    // ============================================================================================
    // Teardown
    // ============================================================================================

    /// Check the error flag, report timing and release every device resource
    ///
    /// Returns `Ok(None)` when nothing was allocated; counters are still zeroed.
    /// Collective: every rank must call it. Buffers are released even if reading
    /// the flag or writing the report fails.
    pub fn clear(&mut self, sink: Option<&mut dyn Write>) -> Result<Option<TeardownReport>> {
        if !self.allocated {
            self.timers.zero_all();
            self.accumulators.zero_all();
            self.balancer.clear();
            return Ok(None);
        }
        self.allocated = false;

        let mut guard = ReleaseGuard { pool: self, armed: true };
        let report = guard.pool.teardown_report(sink);
        let released = guard.release();

        let report = report?;
        released?;
        tracing::info!(
            average_split = report.average_split,
            max_mb = report.max_mb(),
            fault = ?report.fault,
            "gb_pool_cleared"
        );
        Ok(Some(report))
    }

    /// Reductions run on every path; a failed flag read or fault line surfaces after them.
    fn teardown_report(&mut self, mut sink: Option<&mut dyn Write>) -> Result<TeardownReport> {
        let flag = self.read_error_flag();
        let mut fault_line: std::io::Result<()> = Ok(());
        if let Ok(Some(fault)) = &flag {
            tracing::warn!(fault = ?fault, "{}", fault.message());
            if let Some(out) = sink.as_deref_mut() {
                fault_line = writeln!(out, "{}", fault.message());
            }
        }

        self.fold_timers();
        let split = self.balancer.all_ranks_average_split(self.collective);
        let device_nbor = self.atoms.device_builds_neighbors();
        let report = self
            .accumulators
            .aggregate_and_report(self.collective, split, device_nbor, sink);

        let fault = flag?;
        fault_line?;
        let mut report = report?;
        report.fault = fault;
        Ok(report)
    }

    fn read_error_flag(&self) -> Result<Option<DeviceFault>> {
        let Some(flag) = self.buffers.get(BufferSlot::ErrorFlag) else {
            return Ok(None);
        };
        let mut code = [0i32];
        self.device.download(flag.handle, &mut code)?;
        Ok(DeviceFault::from_code(code[0]))
    }

    fn fold_timers(&mut self) {
        let timers = &self.timers;
        let atoms = &self.atoms;
        let acc = &mut self.accumulators;

        acc.accumulate(Phase::Transfer, atoms.transfer_seconds());
        acc.accumulate(Phase::NeighborCopy, atoms.neighbor_copy_seconds());
        acc.accumulate(
            Phase::NeighborBuild,
            timers.kernel.total_seconds() + timers.kernel2.total_seconds() + atoms.neighbor_kernel_seconds(),
        );
        acc.accumulate(
            Phase::Force,
            timers.gayberne.total_seconds() + timers.gayberne2.total_seconds(),
        );
        if self.multiple_forms {
            acc.accumulate(Phase::Secondary, timers.pair.total_seconds());
        }
        acc.accumulate(Phase::CastPack, atoms.cast_seconds());
    }

    /// Release everything in reverse acquisition order; every step runs even if an earlier one fails
    fn release_resources(&mut self) -> Result<()> {
        let mut first_err: Option<GbError> = None;

        if let Err(err) = self.buffers.release_all(self.device) {
            first_err.get_or_insert(err.into());
        }
        self.timers.zero_all();
        self.accumulators.zero_all();
        self.balancer.clear();
        if let Err(err) = self.programs.clear(self.device) {
            first_err.get_or_insert(err);
        }
        self.atoms.release(self.device);

        self.layout = None;
        self.block_size = 0;
        self.multiple_forms = false;
        self.max_bytes = 0.0;
        self.allocated = false;
        first_err.map_or(Ok(()), Err)
    }

    // ============================================================================================
    // Accounting
    // ============================================================================================

    /// Device bytes held: collaborator storage plus every table, flag and constant buffer
    ///
    /// Reported only; nothing is rejected for exceeding a budget. Zero when not allocated.
    pub fn bytes_in_use(&self) -> f64 {
        if self.allocated {
            self.max_bytes
        } else {
            0.0
        }
    }

    /// Host bytes attributable to this potential
    pub fn host_memory_footprint(&self) -> f64 {
        self.atoms.host_memory_usage()
            + (4 * std::mem::size_of::<P::Scalar>()) as f64
            + std::mem::size_of::<Self>() as f64
            + (self.atoms.max_atoms() * std::mem::size_of::<i32>()) as f64
    }

    /// Device bytes needed per atom for atom data and `max_nbors` neighbors
    pub fn bytes_per_atom(&self, max_nbors: usize) -> usize {
        self.atoms.atom_bytes_per_atom() + self.atoms.nbor_bytes_per_atom(max_nbors)
    }

    // ============================================================================================
    // Accessors
    // ============================================================================================

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub fn layout(&self) -> Option<TableLayout> {
        self.layout
    }

    pub fn layout_mode(&self) -> Option<LayoutMode> {
        self.layout.map(|l| l.mode)
    }

    /// Whether some type pair uses a non-ellipsoid form this run
    pub fn multiple_forms(&self) -> bool {
        self.multiple_forms
    }

    /// Work-group size kernels are launched with
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Buffer held in `slot`, if allocated
    pub fn buffer(&self, slot: BufferSlot) -> Option<BufferHandle> {
        self.buffers.get(slot).map(|b| b.handle)
    }

    /// Size in bytes of the buffer in `slot`
    pub fn buffer_bytes(&self, slot: BufferSlot) -> Option<usize> {
        self.buffers.get(slot).map(|b| b.bytes)
    }

    pub fn error_flag(&self) -> Option<BufferHandle> {
        self.buffer(BufferSlot::ErrorFlag)
    }

    pub fn ordered_index(&self) -> Option<BufferHandle> {
        self.buffer(BufferSlot::OrderedIndex)
    }

    /// Whether the pool holds no device buffers
    pub fn holds_no_buffers(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn kernels(&self) -> Option<&KernelSet> {
        self.programs.kernels()
    }

    pub fn programs(&self) -> &KernelProgramCache {
        &self.programs
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn balancer_mut(&mut self) -> &mut LoadBalancer {
        &mut self.balancer
    }

    pub fn timers(&self) -> &DeviceTimers {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut DeviceTimers {
        &mut self.timers
    }

    pub fn accumulators(&self) -> &TimingAccumulators {
        &self.accumulators
    }

    pub fn accumulators_mut(&mut self) -> &mut TimingAccumulators {
        &mut self.accumulators
    }

    pub fn atoms(&self) -> &A {
        &self.atoms
    }

    pub fn atoms_mut(&mut self) -> &mut A {
        &mut self.atoms
    }

    pub fn device(&self) -> &'d dyn Device {
        self.device
    }
}

impl<P: Precision, A: AtomNeighborData> Drop for GbGpuMemory<'_, P, A> {
    fn drop(&mut self) {
        if self.allocated || !self.buffers.is_empty() || self.programs.is_compiled() {
            let _ = self.release_resources();
        }
    }
}

/// Releases the pool's resources when dropped unless [`ReleaseGuard::release`] ran first
struct ReleaseGuard<'a, 'd, P: Precision, A: AtomNeighborData> {
    pool: &'a mut GbGpuMemory<'d, P, A>,
    armed: bool,
}

impl<P: Precision, A: AtomNeighborData> ReleaseGuard<'_, '_, P, A> {
    fn release(mut self) -> Result<()> {
        self.armed = false;
        self.pool.release_resources()
    }
}

impl<P: Precision, A: AtomNeighborData> Drop for ReleaseGuard<'_, '_, P, A> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.pool.release_resources();
        }
    }
}
