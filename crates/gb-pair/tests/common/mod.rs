//! Shared fixtures for the gb-pair integration tests

#![allow(dead_code)]

use gb_pair::{Collective, HostTables, KernelSources, PairForm, PairParams, SquareMatrix};
use std::cell::Cell;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Install the shared subscriber once per test binary; honours `GB_TRACING_*`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = gb_tracing::init_global_tracing(&gb_tracing::TracingConfig::from_env());
    });
}

/// Kernel sources declaring every entry point the pool resolves
pub fn stub_sources() -> KernelSources {
    KernelSources::new(
        "__kernel void kernel_gb_nbor_fast(int n) {}\n__kernel void kernel_gb_nbor(int n) {}\n",
        "__kernel void kernel_gayberne(int n) {}\n",
        "__kernel void kernel_sphere_gb(int n) {}\n__kernel void kernel_lj_fast(int n) {}\n__kernel void kernel_lj(int n) {}\n",
    )
}

pub fn params(nlocal: usize, gpu_split: f64) -> PairParams {
    PairParams {
        nlocal,
        nall: nlocal + nlocal / 5,
        gpu_split,
        ..PairParams::default()
    }
}

/// Tables whose every entry encodes its position, so packing mistakes are visible
pub fn distinct_tables(type_count: usize) -> HostTables {
    let pair = |base: f64| SquareMatrix::from_fn(type_count, move |i, j| base + (i * 10 + j) as f64 + 0.25);
    HostTables {
        type_count,
        shape: (0..type_count).map(|t| [1.0 + t as f64, 2.0 + t as f64, 3.0 + t as f64]).collect(),
        well: (0..type_count).map(|t| [0.5 + t as f64, 0.75, 1.5]).collect(),
        lshape: (0..type_count).map(|t| 0.125 * (t + 1) as f64).collect(),
        cutsq: pair(100.0),
        sigma: pair(200.0),
        epsilon: pair(300.0),
        form: SquareMatrix::filled(type_count, PairForm::EllipseEllipse),
        lj1: pair(400.0),
        lj2: pair(500.0),
        lj3: pair(600.0),
        lj4: pair(700.0),
        offset: pair(800.0),
    }
}

/// `distinct_tables` with type 0 treated as a sphere against every other type
pub fn mixed_form_tables(type_count: usize) -> HostTables {
    let mut tables = distinct_tables(type_count);
    tables.form.set(0, 0, PairForm::SphereSphere);
    for j in 1..type_count {
        tables.form.set(0, j, PairForm::SphereEllipse);
        tables.form.set(j, 0, PairForm::EllipseSphere);
    }
    tables
}

/// A rank in a world where every other rank reports the same values
pub struct FakeWorld {
    pub rank: usize,
    pub world_size: usize,
    pub procs_per_device: usize,
    pub sum_calls: Cell<usize>,
    pub max_calls: Cell<usize>,
}

impl FakeWorld {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self {
            rank,
            world_size,
            procs_per_device: 1,
            sum_calls: Cell::new(0),
            max_calls: Cell::new(0),
        }
    }
}

impl Collective for FakeWorld {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn procs_per_device(&self) -> usize {
        self.procs_per_device
    }

    fn sum(&self, values: &mut [f64]) {
        self.sum_calls.set(self.sum_calls.get() + 1);
        for v in values {
            *v *= self.world_size as f64;
        }
    }

    fn max(&self, _values: &mut [f64]) {
        self.max_calls.set(self.max_calls.get() + 1);
    }
}
