//! Kernel program cache
//!
//! Compiles the three program bundles once per pool lifetime and resolves every
//! entry point up front, so dispatch never looks a kernel up by name.
//!
//! ```text
//!   Uncompiled ──compile──▶ Compiled
//!        ▲                     │
//!        └───────clear─────────┘
//! ```
//!
//! `compile` on a compiled cache and `clear` on an uncompiled one are no-ops.

use crate::error::Result;
use crate::precision::Precision;
use gb_backends::{CompileOptions, Device, KernelHandle, ProgramHandle};
use std::time::Instant;

/// Entry points of the neighbor-list program
pub const NBOR_ENTRIES: [&str; 2] = ["kernel_gb_nbor_fast", "kernel_gb_nbor"];
/// Entry points of the main force program
pub const FORCE_ENTRIES: [&str; 1] = ["kernel_gayberne"];
/// Entry points of the per-form program
pub const LJ_ENTRIES: [&str; 3] = ["kernel_sphere_gb", "kernel_lj_fast", "kernel_lj"];

/// Source text of the three program bundles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSources {
    /// Neighbor-list construction kernels
    pub nbor: String,
    /// Ellipsoid-ellipsoid force kernel
    pub force: String,
    /// Sphere and Lennard-Jones kernels used when several forms are present
    pub lj: String,
}

impl KernelSources {
    pub fn new(nbor: impl Into<String>, force: impl Into<String>, lj: impl Into<String>) -> Self {
        Self {
            nbor: nbor.into(),
            force: force.into(),
            lj: lj.into(),
        }
    }
}

/// Resolved entry points, one handle per kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSet {
    pub gb_nbor_fast: KernelHandle,
    pub gb_nbor: KernelHandle,
    pub gayberne: KernelHandle,
    pub sphere_gb: KernelHandle,
    pub lj_fast: KernelHandle,
    pub lj: KernelHandle,
}

impl KernelSet {
    fn handles(&self) -> [KernelHandle; 6] {
        [
            self.gb_nbor_fast,
            self.gb_nbor,
            self.gayberne,
            self.sphere_gb,
            self.lj_fast,
            self.lj,
        ]
    }
}

#[derive(Debug)]
enum ProgramState {
    Uncompiled,
    Compiled {
        /// nbor, force, lj
        programs: [ProgramHandle; 3],
        kernels: KernelSet,
    },
}

/// Handles acquired so far during a compile, released if a later step fails
#[derive(Default)]
struct Acquired {
    programs: Vec<ProgramHandle>,
    kernels: Vec<KernelHandle>,
}

impl Acquired {
    fn release(self, device: &dyn Device) {
        for kernel in self.kernels.into_iter().rev() {
            let _ = device.release_kernel(kernel);
        }
        for program in self.programs.into_iter().rev() {
            let _ = device.release_program(program);
        }
    }
}

/// Compile-once cache of the potential's device programs
#[derive(Debug)]
pub struct KernelProgramCache {
    state: ProgramState,
}

impl Default for KernelProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelProgramCache {
    pub fn new() -> Self {
        Self {
            state: ProgramState::Uncompiled,
        }
    }

    /// Build options for precision `P`: fast relaxed math, fused multiply-add, one precision define
    pub fn options_for<P: Precision>() -> CompileOptions {
        CompileOptions::optimized().with_define(P::DEFINE)
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.state, ProgramState::Compiled { .. })
    }

    /// Resolved entry points, if compiled
    pub fn kernels(&self) -> Option<&KernelSet> {
        match &self.state {
            ProgramState::Compiled { kernels, .. } => Some(kernels),
            ProgramState::Uncompiled => None,
        }
    }

    /// Compiled programs in `[nbor, force, lj]` order, if compiled
    pub fn programs(&self) -> Option<[ProgramHandle; 3]> {
        match &self.state {
            ProgramState::Compiled { programs, .. } => Some(*programs),
            ProgramState::Uncompiled => None,
        }
    }

    /// Compile with the options for precision `P`
    pub fn compile<P: Precision>(&mut self, device: &dyn Device, sources: &KernelSources) -> Result<()> {
        self.compile_with(device, sources, &Self::options_for::<P>())
    }

    /// Compile all three programs and resolve their entry points
    ///
    /// On failure nothing stays acquired and the cache remains uncompiled.
    pub fn compile_with(&mut self, device: &dyn Device, sources: &KernelSources, options: &CompileOptions) -> Result<()> {
        if self.is_compiled() {
            return Ok(());
        }

        let _span = gb_tracing::perf_span!("compile_kernels", flags = options.to_flag_string().as_str());
        let mut acquired = Acquired::default();
        match Self::build_all(device, sources, options, &mut acquired) {
            Ok((programs, kernels)) => {
                self.state = ProgramState::Compiled { programs, kernels };
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "kernel compilation failed; releasing partial programs");
                acquired.release(device);
                Err(err)
            }
        }
    }

    fn build_all(
        device: &dyn Device,
        sources: &KernelSources,
        options: &CompileOptions,
        acquired: &mut Acquired,
    ) -> Result<([ProgramHandle; 3], KernelSet)> {
        let mut build = |label: &str, source: &str, entries: &[&str]| -> Result<(ProgramHandle, Vec<KernelHandle>)> {
            let start = Instant::now();
            let program = device.compile_program(label, source, options)?;
            acquired.programs.push(program);

            let mut kernels = Vec::with_capacity(entries.len());
            for entry in entries {
                let kernel = device.resolve_kernel(program, entry)?;
                acquired.kernels.push(kernel);
                kernels.push(kernel);
            }
            gb_tracing::performance::record_compile(label, entries.len(), start.elapsed().as_micros() as u64);
            Ok((program, kernels))
        };

        let (nbor, nbor_kernels) = build("gb_nbor", &sources.nbor, &NBOR_ENTRIES[..])?;
        let (force, force_kernels) = build("gayberne", &sources.force, &FORCE_ENTRIES[..])?;
        let (lj, lj_kernels) = build("gb_lj", &sources.lj, &LJ_ENTRIES[..])?;

        let kernels = KernelSet {
            gb_nbor_fast: nbor_kernels[0],
            gb_nbor: nbor_kernels[1],
            gayberne: force_kernels[0],
            sphere_gb: lj_kernels[0],
            lj_fast: lj_kernels[1],
            lj: lj_kernels[2],
        };
        Ok(([nbor, force, lj], kernels))
    }

    /// Release entry points, then programs; back to uncompiled
    ///
    /// Every handle is released even if one release fails; the first error is returned.
    pub fn clear(&mut self, device: &dyn Device) -> Result<()> {
        let ProgramState::Compiled { programs, kernels } = std::mem::replace(&mut self.state, ProgramState::Uncompiled)
        else {
            return Ok(());
        };

        let mut first_err = None;
        for kernel in kernels.handles() {
            if let Err(err) = device.release_kernel(kernel) {
                first_err.get_or_insert(err);
            }
        }
        for program in programs {
            if let Err(err) = device.release_program(program) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}
