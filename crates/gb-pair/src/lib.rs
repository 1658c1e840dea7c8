//! Device-resident state for the Gay-Berne ellipsoid pair potential
//!
//! This crate provides:
//! - **Type tables**: per-type and per-pair constants packed for kernel access
//! - **Resource pool**: every device buffer the potential owns, acquired and released as a unit
//! - **Kernel programs**: neighbor, force and sphere/LJ programs compiled once per run
//! - **Load balancer**: host/device atom split, fixed or re-estimated from timings
//! - **Timing report**: per-phase times reduced across ranks and printed at teardown
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!  HostTables ──▶ │         GbGpuMemory          │ ◀── PairParams
//!                 │                              │
//!                 │  TypeTables    KernelCache   │
//!                 │  LoadBalancer  Accumulators  │
//!                 └──────┬───────────────┬───────┘
//!                        │ &dyn Device   │ &dyn Collective
//!                        ▼               ▼
//!                   gb-backends     rank reductions
//! ```
//!
//! Precision is a type parameter: [`Single`], [`Mixed`] or [`Double`] pick the device
//! scalar the tables are cast to and the define the kernels are compiled with.

pub mod atom;
pub mod balancer;
pub mod collective;
pub mod config;
pub mod error;
pub mod host;
pub mod pool;
pub mod precision;
pub mod program;
pub mod timing;
pub mod type_table;

pub use atom::{AtomNeighborData, AtomReservation, HostAtomStore, NeighborMode};
pub use balancer::LoadBalancer;
pub use collective::{Collective, SingleProcess};
pub use config::{BalancerConfig, PairParams};
pub use error::{GbError, Result};
pub use host::{HostTables, PairForm, SquareMatrix};
pub use pool::{BufferSlot, GbGpuMemory, TableLayout};
pub use precision::{DeviceScalar, Double, Mixed, Precision, PrecisionMode, Single};
pub use program::{KernelProgramCache, KernelSet, KernelSources};
pub use timing::{DeviceFault, DeviceTimers, Phase, PhaseTimer, TeardownReport, TimingAccumulators};
pub use type_table::{LayoutMode, TypeTables};
