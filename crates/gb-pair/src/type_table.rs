//! Type-table builder
//!
//! Packs per-type and per-type-pair host constants into the flat record arrays the
//! kernels index as `table[i * width + j]`.
//!
//! # Layout
//!
//! When every type fits the shared capacity and a work-group is at least that wide,
//! the pair tables are padded to `SHARED_CAPACITY²` records so a work-group can stage
//! the whole table in local memory. Otherwise the width is the type count.
//!
//! ```text
//! type_count = 3, shared layout (width 8)
//!
//!        j=0  j=1  j=2  j=3 .. j=7
//! i=0  [ r00  r01  r02   0  ..  0 ]
//! i=1  [ r10  r11  r12   0  ..  0 ]
//! i=2  [ r20  r21  r22   0  ..  0 ]
//! i=3  [  0    0    0    0  ..  0 ]
//!  ..
//! ```
//!
//! # Records
//!
//! | Table           | Record                        |
//! |-----------------|-------------------------------|
//! | `sigma_epsilon` | `[sigma, epsilon]`            |
//! | `cut_form`      | `[cutsq, form]`               |
//! | `lj1`           | `[lj1, lj2, cutsq, form]`     |
//! | `lj3`           | `[lj3, lj4, offset, 0]`       |
//! | `shape`, `well` | `[x, y, z, 0]` per type       |
//! | `lshape`        | one scalar per type           |
//!
//! Every value is cast from `f64` to the device scalar exactly once.

use crate::config::PairParams;
use crate::error::{GbError, Result};
use crate::host::{HostTables, PairForm, SquareMatrix};
use crate::precision::DeviceScalar;
use gb_backends::DeviceCapabilities;

/// Most types whose pair tables fit a work-group's local memory
pub const SHARED_CAPACITY: usize = 8;

/// Preferred work-group size for the potential's kernels
pub const BLOCK_1D: usize = 64;

/// Scalars in the bonded/global constant block
pub const CONSTANT_BLOCK_LEN: usize = 7;

/// Pair-table packing chosen at init, fixed for the pool lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    /// Padded to `SHARED_CAPACITY²`, kernels stage tables in local memory
    Shared,
    /// `type_count²`, kernels read tables from global memory
    Generic,
}

impl LayoutMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LayoutMode::Shared => "shared",
            LayoutMode::Generic => "generic",
        }
    }
}

/// Work-group size the kernels are launched with on this device
pub fn block_size(caps: &DeviceCapabilities) -> usize {
    BLOCK_1D.min(caps.max_group_size)
}

/// Choose the layout and pair-table width for `type_count` types
pub fn select_layout(type_count: usize, block_size: usize) -> (LayoutMode, usize) {
    if type_count <= SHARED_CAPACITY && block_size >= SHARED_CAPACITY {
        (LayoutMode::Shared, SHARED_CAPACITY)
    } else {
        (LayoutMode::Generic, type_count)
    }
}

/// Whether any type pair needs a path other than uniform-ellipsoid
///
/// Scans the upper triangle including the diagonal.
pub fn multiple_forms(form: &SquareMatrix<PairForm>) -> bool {
    let n = form.dim();
    (0..n).any(|i| (i..n).any(|j| *form.get(i, j) != PairForm::EllipseEllipse))
}

/// Reject mixed forms combined with device-built neighbor lists and a host share
pub fn check_form_conflict(multiple_forms: bool, device_builds_neighbors: bool, host_atoms: usize) -> Result<()> {
    if multiple_forms && device_builds_neighbors && host_atoms > 0 {
        return Err(GbError::FormConflict { host_atoms });
    }
    Ok(())
}

/// Pack `W`-wide records for every pair below `type_count`, zero elsewhere
fn pack_records<T: DeviceScalar, const W: usize>(
    type_count: usize,
    width: usize,
    record: impl Fn(usize, usize) -> [f64; W],
) -> Vec<[T; W]> {
    let mut packed = vec![[T::default(); W]; width * width];
    for i in 0..type_count {
        for j in 0..type_count {
            packed[i * width + j] = record(i, j).map(T::from_f64);
        }
    }
    packed
}

/// Pack a two-component record per type pair into a `width × width` table
pub fn pack_pairs<T: DeviceScalar>(
    type_count: usize,
    width: usize,
    record: impl Fn(usize, usize) -> [f64; 2],
) -> Vec<[T; 2]> {
    pack_records(type_count, width, record)
}

/// Pack a four-component record per type pair into a `width × width` table
pub fn pack_quads<T: DeviceScalar>(
    type_count: usize,
    width: usize,
    record: impl Fn(usize, usize) -> [f64; 4],
) -> Vec<[T; 4]> {
    pack_records(type_count, width, record)
}

/// Per-type `(x, y, z)` rows widened to quads with a zero fourth lane
fn pack_axes<T: DeviceScalar>(rows: &[[f64; 3]]) -> Vec<[T; 4]> {
    rows.iter()
        .map(|&[x, y, z]| [x, y, z, 0.0].map(T::from_f64))
        .collect()
}

/// `[gamma, upsilon, mu, special_lj[0..4]]`
pub fn constant_block<T: DeviceScalar>(params: &PairParams) -> [T; CONSTANT_BLOCK_LEN] {
    let [s0, s1, s2, s3] = params.special_lj;
    [params.gamma, params.upsilon, params.mu, s0, s1, s2, s3].map(T::from_f64)
}

/// Device-ready tables for one run
#[derive(Debug, Clone, PartialEq)]
pub struct TypeTables<T: DeviceScalar> {
    pub layout_mode: LayoutMode,
    /// Row stride of the pair tables
    pub width: usize,
    pub type_count: usize,
    pub multiple_forms: bool,
    pub sigma_epsilon: Vec<[T; 2]>,
    pub cut_form: Vec<[T; 2]>,
    pub lj1: Vec<[T; 4]>,
    pub lj3: Vec<[T; 4]>,
    pub shape: Vec<[T; 4]>,
    pub well: Vec<[T; 4]>,
    pub lshape: Vec<T>,
}

impl<T: DeviceScalar> TypeTables<T> {
    /// Build every table for a device with the given capabilities
    pub fn build(caps: &DeviceCapabilities, host: &HostTables) -> Result<Self> {
        Self::build_for_block(block_size(caps), host)
    }

    /// Build every table for kernels launched with `block_size`-wide work-groups
    pub fn build_for_block(block_size: usize, host: &HostTables) -> Result<Self> {
        host.validate()?;
        let n = host.type_count;
        let (layout_mode, width) = select_layout(n, block_size);
        let form = |i, j| host.form.get(i, j).tag() as f64;

        let tables = Self {
            layout_mode,
            width,
            type_count: n,
            multiple_forms: multiple_forms(&host.form),
            sigma_epsilon: pack_pairs(n, width, |i, j| [*host.sigma.get(i, j), *host.epsilon.get(i, j)]),
            cut_form: pack_pairs(n, width, |i, j| [*host.cutsq.get(i, j), form(i, j)]),
            lj1: pack_quads(n, width, |i, j| {
                [*host.lj1.get(i, j), *host.lj2.get(i, j), *host.cutsq.get(i, j), form(i, j)]
            }),
            lj3: pack_quads(n, width, |i, j| {
                [*host.lj3.get(i, j), *host.lj4.get(i, j), *host.offset.get(i, j), 0.0]
            }),
            shape: pack_axes(&host.shape),
            well: pack_axes(&host.well),
            lshape: host.lshape.iter().copied().map(T::from_f64).collect(),
        };

        gb_tracing::perf_event!(
            "type_tables_built",
            layout = layout_mode.as_str(),
            width = width,
            type_count = n,
            multiple_forms = tables.multiple_forms
        );
        Ok(tables)
    }

    /// Records per pair table (`width²`)
    pub fn pair_records(&self) -> usize {
        self.width * self.width
    }

    /// Record at `(i, j)` of a pair table
    pub fn at<const W: usize>(&self, table: &[[T; W]], i: usize, j: usize) -> [T; W] {
        table[i * self.width + j]
    }
}
