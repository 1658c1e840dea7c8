//! Teardown report, fault flag and memory accounting

mod common;

use common::{distinct_tables, params, stub_sources, FakeWorld};
use gb_backends::{CpuDevice, DeviceExt};
use gb_pair::atom::ATOM_BYTES_PER_ATOM;
use gb_pair::{
    BufferSlot, DeviceFault, GbGpuMemory, HostAtomStore, LayoutMode, NeighborMode, Phase, Single, SingleProcess,
};
use serial_test::serial;

fn rule() -> String {
    "-".repeat(69)
}

#[test]
fn leader_writes_the_fixed_report() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = SingleProcess::new();
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Device), stub_sources());
    pool.init(&params(100, 0.0), &distinct_tables(1))?;

    pool.atoms_mut().timers_mut().transfer = 0.25;
    pool.atoms_mut().timers_mut().cast = 0.125;
    pool.accumulators_mut().accumulate(Phase::Force, 2.0);
    let max_bytes = pool.bytes_in_use();

    let mut out = Vec::new();
    let report = pool.clear(Some(&mut out))?.expect("allocated");
    assert!(report.written);
    assert_eq!(report.max_bytes, max_bytes);

    let text = String::from_utf8(out).expect("utf8");
    let rule = rule();
    let expected = format!(
        "\n\n{rule}\n      GPU Time Info (average): \n{rule}\n\
         Data Transfer:   0.2500 s.\n\
         Data Cast/Pack:  0.1250 s.\n\
         Neighbor copy:   0.0000 s.\n\
         Neighbor build:  0.0000 s.\n\
         Force calc:      2.0000 s.\n\
         LJ calc:         0.0000 s.\n\
         Average split:   1.0000.\n\
         Max Mem / Proc:  {:.2} MB.\n\
         {rule}\n\n",
        max_bytes / (1024.0 * 1024.0)
    );
    assert_eq!(text, expected);
    Ok(())
}

#[test]
fn no_report_without_force_time() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = SingleProcess::new();
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Host), stub_sources());
    pool.init(&params(10, 0.0), &distinct_tables(1))?;

    let mut out = Vec::new();
    let report = pool.clear(Some(&mut out))?.expect("allocated");
    assert!(!report.written);
    assert!(out.is_empty());
    Ok(())
}

#[test]
fn followers_reduce_but_never_write() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = FakeWorld::new(1, 2);
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Host), stub_sources());
    pool.init(&params(10, 0.0), &distinct_tables(1))?;
    pool.accumulators_mut().accumulate(Phase::Force, 1.0);

    let mut out = Vec::new();
    let report = pool.clear(Some(&mut out))?.expect("allocated");
    assert!(!report.written);
    assert!(out.is_empty());
    // split average, then phase times
    assert_eq!(world.sum_calls.get(), 2);
    assert_eq!(world.max_calls.get(), 1);
    assert_eq!(report.world_size, 2);
    assert_eq!(report.average_seconds(Phase::Force), 1.0);
    Ok(())
}

#[test]
fn matrix_inversion_fault_is_reported_at_teardown() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = SingleProcess::new();
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Host), stub_sources());
    pool.init(&params(10, 0.0), &distinct_tables(1))?;

    let flag = pool.error_flag().expect("flag");
    device.upload(flag, &[2i32])?;

    let mut out = Vec::new();
    let report = pool.clear(Some(&mut out))?.expect("allocated");
    assert_eq!(report.fault, Some(DeviceFault::MatrixInversion));
    assert_eq!(String::from_utf8(out).expect("utf8"), "BAD MATRIX INVERSION IN FORCE COMPUTATION.\n");
    assert_eq!(device.live_buffers(), 0);
    Ok(())
}

/// Sink that rejects every write
struct ClosedSink;

impl std::io::Write for ClosedSink {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::other("sink closed"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn failed_fault_line_still_joins_the_reductions() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = FakeWorld::new(1, 2);
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Host), stub_sources());
    pool.init(&params(10, 0.0), &distinct_tables(1))?;
    pool.accumulators_mut().accumulate(Phase::Force, 1.0);

    let flag = pool.error_flag().expect("flag");
    device.upload(flag, &[2i32])?;

    let err = pool.clear(Some(&mut ClosedSink)).unwrap_err();
    assert!(matches!(err, gb_pair::GbError::Report(_)));
    assert_eq!(world.sum_calls.get(), 2);
    assert_eq!(world.max_calls.get(), 1);
    assert_eq!(device.live_buffers(), 0);
    assert!(!pool.is_allocated());
    assert!(pool.accumulators().is_zero());
    Ok(())
}

#[test]
fn clean_flag_reports_no_fault() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = SingleProcess::new();
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Host), stub_sources());
    pool.init(&params(10, 0.0), &distinct_tables(1))?;

    let report = pool.clear(None)?.expect("allocated");
    assert_eq!(report.fault, None);
    Ok(())
}

#[test]
fn device_timers_fold_into_phases() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = SingleProcess::new();
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Device), stub_sources());
    pool.init(&params(10, 0.0), &distinct_tables(1))?;

    pool.atoms_mut().timers_mut().neighbor_kernel = 0.5;
    pool.atoms_mut().timers_mut().neighbor_copy = 0.75;
    let timers = pool.timers_mut();
    timers.gayberne.start();
    std::thread::sleep(std::time::Duration::from_millis(1));
    timers.gayberne.stop(&device)?;

    let report = pool.clear(None)?.expect("allocated");
    assert!(report.average_seconds(Phase::Force) > 0.0);
    assert!(report.average_seconds(Phase::NeighborBuild) >= 0.5);
    assert_eq!(report.average_seconds(Phase::NeighborCopy), 0.75);
    Ok(())
}

#[test]
fn single_type_device_only_run() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = SingleProcess::new();
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Device), stub_sources());
    pool.init(&params(1000, 0.0), &distinct_tables(1))?;

    assert_eq!(pool.layout_mode(), Some(LayoutMode::Shared));
    assert!(!pool.multiple_forms());
    assert!(!pool.balancer().host_participates());

    let report = pool.clear(None)?.expect("allocated");
    assert_eq!(report.host_fraction(), 0.0);
    Ok(())
}

#[test]
fn bytes_in_use_counts_tables_and_atom_storage() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = SingleProcess::new();
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Host), stub_sources());
    pool.init(&params(100, 0.0), &distinct_tables(1))?;

    // 8x8 shared layout, f32 scalars
    let pair_tables = 64 * 8 + 64 * 8 + 64 * 16 + 64 * 16;
    let per_type = 4 + 16 + 16;
    let flag_and_constants = 4 + 7 * 4;
    let atoms = 110 * ATOM_BYTES_PER_ATOM;
    let expected = (pair_tables + per_type + flag_and_constants + atoms) as f64;
    assert_eq!(pool.bytes_in_use(), expected);

    let ordered_index = pool.buffer_bytes(BufferSlot::OrderedIndex).expect("olist");
    assert_eq!(ordered_index, 110 * 4);
    assert_eq!(device.bytes_allocated() as f64, expected + ordered_index as f64);

    assert_eq!(pool.bytes_per_atom(300), ATOM_BYTES_PER_ATOM + 302 * 4);
    assert!(pool.host_memory_footprint() > (110 * 4) as f64);

    pool.clear(None)?;
    assert_eq!(pool.bytes_in_use(), 0.0);
    Ok(())
}

#[test]
#[serial]
fn report_ignores_environment_tuning_of_a_fixed_split() -> gb_pair::Result<()> {
    std::env::set_var("GB_BALANCE_EVERY", "1");
    let config = gb_pair::BalancerConfig::from_env();
    std::env::remove_var("GB_BALANCE_EVERY");
    assert_eq!(config.every, 1);

    let device = CpuDevice::new();
    let world = SingleProcess::new();
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Host), stub_sources())
        .with_balancer_config(config);
    pool.init(&params(10, 0.5), &distinct_tables(1))?;

    let balancer = pool.balancer_mut();
    for step in 0..3 {
        let device_atoms = balancer.device_count(step, 10);
        balancer.balance(1.0, 10 - device_atoms, device_atoms);
    }
    let report = pool.clear(None)?.expect("allocated");
    assert!((report.average_split - 0.5).abs() < 1e-12);
    Ok(())
}
