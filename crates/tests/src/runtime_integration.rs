//! Integration tests for the audio runtime
//!
//! Blocks travel to the audio thread and back; the blocking helpers must
//! only ever hand a caller its own block.

use ampdsp_core::domain::{limits::MAX_FRAMES, EngineConfig, RoutingPreset, StageType};
use ampdsp_infra::audio::{AudioRuntime, RuntimeError};
use std::time::Duration;

fn runtime() -> AudioRuntime {
    let config = EngineConfig {
        seed_peq_bands: false,
        ..Default::default()
    };
    AudioRuntime::from_config(&config).unwrap()
}

// ============================================================================
// COLLECTION
// ============================================================================

#[test]
fn test_uncollected_full_block_does_not_reach_next_caller() {
    let runtime = runtime();
    let mut block = runtime.acquire_block().unwrap();
    assert_eq!(block.fill(0, &vec![3; MAX_FRAMES * 2]), MAX_FRAMES);
    runtime.submit(block).unwrap();

    let mut samples = [7; 4];
    let frames = runtime
        .process_blocking(0, &mut samples, Duration::from_secs(1))
        .unwrap();
    assert_eq!(frames, 2);
    assert_eq!(samples, [7; 4]);
    runtime.shutdown().unwrap();
}

#[test]
fn test_blocking_rounds_keep_their_own_output() {
    let runtime = runtime();
    runtime
        .control()
        .apply(|state| state.add_stage(0, StageType::Polarity, None))
        .unwrap();

    for round in 1..20 {
        if round % 3 == 0 {
            let mut stray = runtime.acquire_block().unwrap();
            stray.fill(1, &[round; 16]);
            let _ = runtime.submit(stray);
        }
        let mut samples = vec![round * 10; 2 * round as usize];
        runtime
            .process_blocking(0, &mut samples, Duration::from_secs(1))
            .unwrap();
        assert!(samples.iter().step_by(2).all(|&s| s == -round * 10));
        assert!(samples.iter().skip(1).step_by(2).all(|&s| s == round * 10));
    }
}

#[test]
fn test_collect_times_out_without_blocks() {
    let runtime = runtime();
    assert!(matches!(
        runtime.recv_sequence(42, Duration::from_millis(10)),
        Err(RuntimeError::Timeout)
    ));
}

// ============================================================================
// ROUTING
// ============================================================================

#[test]
fn test_mono_sum_across_both_inputs() {
    let runtime = runtime();
    runtime
        .control()
        .apply(|state| {
            state.set_routing_preset(RoutingPreset::MonoSum);
            Ok(())
        })
        .unwrap();

    let timeout = Duration::from_secs(1);
    let mut first = [400_000; 8];
    let mut second = [-400_000, 800_000, -400_000, 800_000, -400_000, 800_000, -400_000, 800_000];
    runtime.process_blocking(0, &mut first, timeout).unwrap();
    runtime.process_blocking(1, &mut second, timeout).unwrap();

    let mut out = [0; 8];
    assert_eq!(runtime.route_blocking(&mut out, timeout).unwrap(), 4);
    assert!(out.iter().all(|&s| (s - 300_000).abs() <= 1), "{out:?}");
}
