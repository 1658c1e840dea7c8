//! Host/device split: fixed shares, dynamic re-estimation and the all-rank average

mod common;

use common::{distinct_tables, params, stub_sources, FakeWorld};
use gb_backends::{CpuDevice, DeviceCapabilities};
use gb_pair::{BalancerConfig, GbGpuMemory, HostAtomStore, LoadBalancer, NeighborMode, Single, SingleProcess};
use proptest::prelude::*;

fn caps() -> DeviceCapabilities {
    DeviceCapabilities::new("test", 1024, true)
}

proptest! {
    #[test]
    fn host_count_stays_within_total(total in 0usize..100_000, split in -2.0f64..2.0, device_nbor in any::<bool>()) {
        let mut balancer = LoadBalancer::default();
        let count = balancer.first_host_count(total, device_nbor, split);
        prop_assert!(count <= total);
        if !device_nbor || split == 0.0 {
            prop_assert_eq!(count, 0);
        }
    }

    #[test]
    fn target_and_device_count_stay_in_bounds(
        split in -1.0f64..1.0,
        costs in prop::collection::vec((1e-6f64..1.0, 1e-6f64..1.0), 1..40),
        total in 1usize..10_000,
    ) {
        let mut balancer = LoadBalancer::new(BalancerConfig { every: 1, ..BalancerConfig::default() });
        balancer.init(&caps(), split);

        for (step, (host_cost, device_cost)) in costs.into_iter().enumerate() {
            let device_atoms = balancer.device_count(step as u64, total);
            prop_assert!(device_atoms <= total);
            let host_atoms = total - device_atoms;
            balancer.rebalance(host_cost * host_atoms as f64, host_atoms, device_cost * device_atoms as f64, device_atoms);
            let target = balancer.target_split();
            prop_assert!((0.0..=1.0).contains(&target), "target {target}");
            balancer.record_split(target);
        }

        let average = balancer.all_ranks_average_split(&SingleProcess::new());
        prop_assert!((0.0..=1.0).contains(&average));
    }
}

#[test]
fn dynamic_average_lies_strictly_inside_the_unit_interval() {
    let mut balancer = LoadBalancer::new(BalancerConfig {
        every: 1,
        ..BalancerConfig::default()
    });
    balancer.init(&caps(), -1.0);

    // host atoms cost three times as much as device atoms
    for step in 0..100 {
        let device_atoms = balancer.device_count(step, 1000);
        let host_atoms = 1000 - device_atoms;
        balancer.rebalance(3e-6 * host_atoms as f64, host_atoms, 1e-6 * device_atoms as f64, device_atoms);
        balancer.record_split(balancer.target_split());
    }

    let average = balancer.all_ranks_average_split(&SingleProcess::new());
    assert!(average > 0.0 && average < 1.0, "average {average}");
    assert!(balancer.target_split() > 0.7);
}

#[test]
fn fixed_split_never_moves() {
    let mut balancer = LoadBalancer::new(BalancerConfig {
        every: 1,
        ..BalancerConfig::default()
    });
    balancer.init(&caps(), 0.4);
    for step in 0..10 {
        let device_atoms = balancer.device_count(step, 100);
        assert_eq!(device_atoms, 60);
        balancer.rebalance(1.0, 40, 0.001, 60);
        balancer.record_split(balancer.target_split());
    }
    assert!((balancer.all_ranks_average_split(&SingleProcess::new()) - 0.6).abs() < 1e-12);
}

#[test]
fn average_spans_every_rank() {
    let mut balancer = LoadBalancer::default();
    balancer.init(&caps(), 0.0);
    balancer.record_split(0.5);
    balancer.record_split(1.0);

    let world = FakeWorld::new(1, 4);
    let average = balancer.all_ranks_average_split(&world);
    assert!((average - 0.75).abs() < 1e-12);
    assert_eq!(world.sum_calls.get(), 1);
}

#[test]
fn pool_reports_the_device_share() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = SingleProcess::new();
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Device), stub_sources())
        .with_balancer_config(BalancerConfig {
            every: 5,
            ..BalancerConfig::default()
        });

    pool.init(&params(200, 0.3), &distinct_tables(1))?;
    assert_eq!(pool.balancer().host_count(), 60);
    assert!(pool.balancer().host_participates());
    assert_eq!(pool.balancer().config().every, 5);

    let balancer = pool.balancer_mut();
    for step in 0..4 {
        let device_atoms = balancer.device_count(step, 200);
        balancer.balance(0.01, 200 - device_atoms, device_atoms);
    }

    let report = pool.clear(None)?.expect("allocated");
    assert!((report.average_split - 0.7).abs() < 1e-12);
    assert!((report.host_fraction() - 0.3).abs() < 1e-12);
    Ok(())
}

#[test]
fn zero_interval_from_a_literal_does_not_stop_the_pool() -> gb_pair::Result<()> {
    let device = CpuDevice::new();
    let world = SingleProcess::new();
    let mut pool = GbGpuMemory::<Single>::new(&device, &world, HostAtomStore::new(NeighborMode::Device), stub_sources())
        .with_balancer_config(BalancerConfig {
            every: 0,
            ..BalancerConfig::default()
        });
    assert_eq!(pool.balancer().config().every, BalancerConfig::default().every);

    pool.init(&params(10, -1.0), &distinct_tables(1))?;
    let balancer = pool.balancer_mut();
    for step in 0..30 {
        let device_atoms = balancer.device_count(step, 10);
        assert!(device_atoms <= 10);
        balancer.balance(0.01, 10 - device_atoms, device_atoms);
    }
    pool.clear(None)?;
    Ok(())
}
