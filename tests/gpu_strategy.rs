// tests/gpu_strategy.rs
//
// The four device-selection strategies and their documented orderings.

use sandcell::core::GpuStrategy;
use sandcell::error::EngineError;
use sandcell::gpu::{select_devices, GpuDevice};

fn device(index: u32, memory_mb: u64) -> GpuDevice {
    GpuDevice {
        index,
        uuid: format!("GPU-{:08x}", index),
        memory_mb,
        owner: None,
    }
}

fn four_equal() -> Vec<GpuDevice> {
    (0..4).map(|i| device(i, 16384)).collect()
}

#[test]
fn pack_takes_lowest_indices() {
    let pick = select_devices(&four_equal(), 2, 0, GpuStrategy::Pack).unwrap();
    assert_eq!(pick.indices, vec![0, 1]);
    assert!(!pick.degraded);
}

#[test]
fn spread_strides_across_descending_list() {
    // Four free, want two: descending [3,2,1,0], stride len/want = 2,
    // so positions 0 and 2 -> {3, 1}.
    let pick = select_devices(&four_equal(), 2, 0, GpuStrategy::Spread).unwrap();
    assert_eq!(pick.indices, vec![3, 1]);
}

#[test]
fn spread_narrow_list_takes_descending_prefix() {
    // Three free, want two: not wide enough to stride.
    let free: Vec<GpuDevice> = (0..3).map(|i| device(i, 8192)).collect();
    let pick = select_devices(&free, 2, 0, GpuStrategy::Spread).unwrap();
    assert_eq!(pick.indices, vec![2, 1]);
}

#[test]
fn first_fit_respects_memory_floor() {
    let free = vec![device(0, 4096), device(1, 8192), device(2, 4096), device(3, 12288)];
    let pick = select_devices(&free, 2, 8000, GpuStrategy::FirstFit).unwrap();
    assert_eq!(pick.indices, vec![1, 3], "first two devices meeting the floor");
}

#[test]
fn best_fit_picks_tightest_device() {
    // 4G / 8G / 10G / 16G, want 8G: the 8G device is the tight fit.
    let free = vec![
        device(0, 4096),
        device(1, 8192),
        device(2, 10240),
        device(3, 16384),
    ];
    let pick = select_devices(&free, 1, 8192, GpuStrategy::BestFit).unwrap();
    assert_eq!(pick.indices, vec![1]);
    assert!(!pick.degraded);
}

#[test]
fn best_fit_degrades_to_largest_when_unsatisfiable() {
    let free = vec![
        device(0, 4096),
        device(1, 8192),
        device(2, 10240),
        device(3, 16384),
    ];
    // 32G is unsatisfiable; the largest available is taken, marked degraded.
    let pick = select_devices(&free, 1, 32768, GpuStrategy::BestFit).unwrap();
    assert_eq!(pick.indices, vec![3]);
    assert!(pick.degraded, "unsatisfiable floor must mark the pick degraded");
}

#[test]
fn insufficient_free_devices_is_quota() {
    let free = vec![device(0, 8192)];
    let err = select_devices(&free, 2, 0, GpuStrategy::FirstFit).expect_err("1 < 2");
    assert!(matches!(err, EngineError::Quota(_)), "got {:?}", err);
}

#[test]
fn memory_floor_exhaustion_is_quota() {
    let free = vec![device(0, 4096), device(1, 4096)];
    for strategy in [GpuStrategy::FirstFit, GpuStrategy::Pack, GpuStrategy::Spread] {
        let err = select_devices(&free, 1, 8192, strategy).expect_err("nothing meets 8G");
        assert!(matches!(err, EngineError::Quota(_)), "{:?} -> {:?}", strategy, err);
    }
}

#[test]
fn zero_want_is_empty_pick() {
    let pick = select_devices(&[], 0, 0, GpuStrategy::Pack).unwrap();
    assert!(pick.indices.is_empty());
}
