//! Integration tests for the pipeline
//!
//! These tests drive the full path: edits on the inactive state, swaps,
//! routing and `process_buffer` on interleaved fixed-point blocks.

use ampdsp_core::domain::{
    limits::{self, FULL_SCALE_24BIT, MAX_STAGES},
    BiquadCoeffs, CrossoverKind, CrossoverRole, DspError, ErrorKind, FilterType, PipelineState,
    PoolKind, RoutingPreset, Stage, StageKind, StageType,
};
use crate::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_unity_coefficients_pass_input_unchanged() {
    let coord = coordinator();
    let mut engine = engine(&coord);
    for channel in 0..2 {
        let index = coord
            .add_stage(channel, StageType::Biquad(FilterType::Custom), None)
            .unwrap();
        coord
            .edit(|s| s.load_custom_coeffs(channel, index, BiquadCoeffs::from_array([1.0, 0.0, 0.0, 0.0, 0.0])))
            .unwrap();
    }
    coord.swap().unwrap();

    let original = sine_block(256, 440.0, 0.8, 0);
    let mut samples = original.clone();
    engine.process_buffer(&mut samples, 256, 0);
    assert_eq!(samples, original);
}

#[test]
fn test_moving_average_fir() {
    let mut state = PipelineState::new(SAMPLE_RATE);
    let index = state.add_stage(0, StageType::Fir, None).unwrap();
    state.load_fir_taps(0, index, &[0.25; 4]).unwrap();

    let mut buffer = [1.0f32; 5];
    state.process_channel(0, &mut buffer);
    let expected = [0.25, 0.5, 0.75, 1.0, 1.0];
    for (out, want) in buffer.iter().zip(expected) {
        assert!((out - want).abs() < 1e-6, "{buffer:?}");
    }
}

#[test]
fn test_linkwitz_riley_four_sections() {
    let coord = coordinator();
    coord
        .edit(|s| s.insert_crossover(0, CrossoverKind::LinkwitzRiley(4), CrossoverRole::Lowpass, 2000.0, None))
        .unwrap();
    coord
        .edit(|s| s.insert_crossover(1, CrossoverKind::LinkwitzRiley(4), CrossoverRole::Highpass, 2000.0, None))
        .unwrap();
    coord.swap().unwrap();

    let active = coord.get_active().unwrap();
    let dc = |channel: usize| -> Vec<f32> {
        active
            .channel(channel)
            .unwrap()
            .stages()
            .iter()
            .map(|s| s.biquad_params().unwrap().coeffs.dc_gain())
            .collect()
    };
    let low = dc(0);
    let high = dc(1);
    assert_eq!(low.len(), 2);
    assert_eq!(high.len(), 2);
    assert!(low.iter().all(|g| (g - 1.0).abs() < 0.05), "{low:?}");
    assert!(high.iter().all(|g| g.abs() < 0.05), "{high:?}");
}

#[test]
fn test_global_bypass_is_bit_exact() {
    let coord = coordinator();
    let mut engine = engine(&coord);
    coord.add_stage(0, StageType::Gain, None).unwrap();
    coord.add_stage(1, StageType::Mute, None).unwrap();
    coord.edit(|s| s.global_bypass = true);
    coord.swap().unwrap();

    let original = sine_block(128, 1000.0, 1.2, 0);
    let mut samples = original.clone();
    engine.process_buffer(&mut samples, 128, 0);
    assert_eq!(samples, original);
}

#[test]
fn test_chain_capacity() {
    let coord = coordinator();
    for expected in 0..MAX_STAGES {
        assert_eq!(coord.add_stage(3, StageType::Gain, None), Ok(expected));
    }
    let err = coord.add_stage(3, StageType::Gain, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(coord.edit(|s| s.channel(3).unwrap().len()), MAX_STAGES);
}

// ============================================================================
// STAGE CRUD
// ============================================================================

#[test]
fn test_remove_frees_pool_slots() {
    let coord = coordinator();
    let first = coord.add_stage(0, StageType::Fir, None).unwrap();
    coord.add_stage(1, StageType::Fir, None).unwrap();
    assert_eq!(
        coord.add_stage(2, StageType::Fir, None),
        Err(DspError::PoolExhausted(PoolKind::Fir))
    );

    coord.remove_stage(0, first).unwrap();
    assert_eq!(coord.edit(|s| s.pools().used_count(PoolKind::Fir)), 1);
    assert!(coord.add_stage(2, StageType::Fir, None).is_ok());
}

#[test]
fn test_reorder_rejects_non_permutations() {
    let coord = coordinator();
    coord.add_stage(0, StageType::Gain, None).unwrap();
    coord.add_stage(0, StageType::Polarity, None).unwrap();

    assert!(coord.reorder_stages(0, &[0, 0]).is_err());
    assert!(coord.reorder_stages(0, &[1]).is_err());
    coord.reorder_stages(0, &[1, 0]).unwrap();
    let first = coord.edit(|s| s.stage(0, 0).unwrap().stage_type());
    assert_eq!(first, StageType::Polarity);
}

#[test]
fn test_mirror_gives_partner_its_own_slots() {
    let coord = coordinator();
    let index = coord.add_stage(0, StageType::Fir, None).unwrap();
    coord.edit(|s| s.load_fir_taps(0, index, &[0.5, 0.5])).unwrap();
    coord.edit(|s| s.mirror_channel_config(0, 1)).unwrap();
    coord.swap().unwrap();

    let active = coord.get_active().unwrap();
    let slot = |channel: usize| active.stage(channel, 0).unwrap().pool_slot();
    assert_ne!(slot(0), slot(1));
    let (_, mirrored) = slot(1).unwrap();
    assert_eq!(&active.pools().fir.get(Some(mirrored)).unwrap().taps[..2], &[0.5, 0.5]);
}

// ============================================================================
// SWAP CONTINUITY
// ============================================================================

fn build_chain(coord: &ampdsp_core::domain::ConfigSwapCoordinator) {
    coord
        .edit(|s| {
            s.insert_stage(0, Stage::biquad(FilterType::Peq, 1000.0, 6.0, 1.0, SAMPLE_RATE), None)?;
            let limiter = s.add_stage(0, StageType::Limiter, None)?;
            s.update_stage(0, limiter, |st| {
                if let StageKind::Limiter(p) = &mut st.kind {
                    p.threshold_db = -20.0;
                }
            })?;
            let fir = s.add_stage(0, StageType::Fir, None)?;
            s.load_fir_taps(0, fir, &[0.5, 0.3, 0.2])?;
            let delay = s.add_stage(0, StageType::Delay, None)?;
            s.update_stage(0, delay, |st| {
                if let StageKind::Delay(p) = &mut st.kind {
                    p.delay_samples = 10;
                }
            })?;
            s.add_stage(0, StageType::Compressor, None)
        })
        .unwrap();
    coord.swap().unwrap();
}

#[test]
fn test_parameter_swap_keeps_runtime_state() {
    let coord = coordinator();
    let mut engine = engine(&coord);
    build_chain(&coord);

    let mut offset = 0;
    let mut run_block = |engine: &mut ampdsp_core::domain::AudioEngine| {
        let mut samples = sine_block(128, 700.0, 0.9, offset);
        engine.process_buffer(&mut samples, 128, 0);
        offset += 128;
    };
    run_block(&mut engine);

    // The clone goes stale while the audio path keeps running
    coord.clone_active_into_inactive();
    run_block(&mut engine);
    run_block(&mut engine);

    coord
        .edit(|s| {
            s.update_stage(0, 0, |st| st.biquad_params_mut().unwrap().frequency = 2500.0)?;
            s.update_stage(0, 1, |st| {
                if let StageKind::Limiter(p) = &mut st.kind {
                    p.threshold_db = -6.0;
                }
            })?;
            s.update_stage(0, 4, |st| {
                if let StageKind::Compressor(p) = &mut st.kind {
                    p.ratio = 10.0;
                }
            })?;
            s.add_stage(0, StageType::Limiter, None)
        })
        .unwrap();

    let before = {
        let active = coord.get_active().unwrap();
        runtime_of(&active, 0)
    };
    coord.swap().unwrap();
    let after = {
        let active = coord.get_active().unwrap();
        runtime_of(&active, 0)
    };

    assert_eq!(after.len(), before.len() + 1);
    assert_eq!(&after[..before.len()], &before[..]);
    assert!(matches!(&before[2], StageRuntime::Fir { history, .. } if history.iter().any(|&s| s != 0.0)));
    assert_eq!(
        after[before.len()],
        StageRuntime::Dynamics {
            envelope: 0.0,
            gain_reduction: 0.0
        }
    );
}

#[test]
fn test_changed_type_is_not_carried() {
    let coord = coordinator();
    let mut engine = engine(&coord);
    coord.add_stage(0, StageType::Limiter, None).unwrap();
    coord.swap().unwrap();
    let mut samples = sine_block(128, 200.0, 0.9, 0);
    engine.process_buffer(&mut samples, 128, 0);

    coord.clone_active_into_inactive();
    coord.remove_stage(0, 0).unwrap();
    coord.add_stage(0, StageType::Compressor, None).unwrap();
    coord.swap().unwrap();

    let active = coord.get_active().unwrap();
    assert_eq!(
        runtime_of(&active, 0)[0],
        StageRuntime::Dynamics {
            envelope: 0.0,
            gain_reduction: 0.0
        }
    );
}

// ============================================================================
// ROUTING
// ============================================================================

#[test]
fn test_sub_sum_routes_after_the_chains() {
    let coord = coordinator();
    let mut engine = engine(&coord);
    coord.add_stage(1, StageType::Polarity, None).unwrap();
    coord.edit(|s| s.set_routing_preset(RoutingPreset::SubSum));
    coord.swap().unwrap();

    // Polarity on the right cancels the mono sum on output 0
    let mut samples = dc_block(32, 0.5);
    engine.process_buffer(&mut samples, 32, 0);
    engine.zero_channels(1);
    let mut out = vec![1; 64];
    assert_eq!(engine.execute_routing(&mut out, 32), 32);
    assert!(left(&out).iter().all(|&s| s == 0));
    let level = (0.5 * FULL_SCALE_24BIT) as i32;
    assert!(out.iter().skip(1).step_by(2).all(|&s| s == -level));
}

#[test]
fn test_band_region_survives_reorder_through_swaps() {
    let coord = std::sync::Arc::new(ampdsp_core::domain::ConfigSwapCoordinator::new(
        PipelineState::with_peq_bands(SAMPLE_RATE),
        fast_policy(),
    ));
    let bands = limits::PEQ_BANDS;
    let mut order: Vec<usize> = (0..bands).rev().collect();
    order.rotate_left(3);
    coord.reorder_stages(0, &order).unwrap();
    let index = coord
        .edit(|s| s.add_chain_stage(0, StageType::Gain, None))
        .unwrap();
    assert_eq!(index, bands);
    coord.swap().unwrap();

    coord.clone_active_into_inactive();
    assert!(coord.edit(|s| s.has_peq_bands(0)).unwrap());
    assert_eq!(coord.edit(|s| s.chain_stage_count(0)).unwrap(), 1);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn test_audio_thread_never_sees_mixed_configuration() {
    let coord = coordinator();
    coord.add_stage(0, StageType::Polarity, None).unwrap();
    coord.swap().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let audio = {
        let coord = Arc::clone(&coord);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut engine = engine(&coord);
            let level = (0.25 * FULL_SCALE_24BIT) as i32;
            let mut blocks = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let mut samples = dc_block(64, 0.25);
                engine.process_buffer(&mut samples, 64, 0);
                let out = left(&samples);
                let first = out[0];
                // Zero is the silence emitted for a contended block
                assert!(first == level || first == -level || first == 0, "unexpected level {first}");
                assert!(out.iter().all(|&s| s == first), "mixed block {out:?}");
                blocks += 1;
            }
            (blocks, engine.metrics().snapshot())
        })
    };

    let mut published = 0;
    for round in 0..200 {
        coord.clone_active_into_inactive();
        coord.set_stage_enabled(0, 0, round % 2 == 0).unwrap();
        if coord.swap().is_ok() {
            published += 1;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    stop.store(true, Ordering::Relaxed);
    let (blocks, metrics) = audio.join().unwrap();

    let health = coord.health();
    assert!(blocks > 0);
    assert!(published > 0);
    assert_eq!(health.successes, published + 1);
    assert_eq!(metrics.buffers_processed + metrics.contended_buffers, blocks as u64);
}

#[test]
fn test_swap_contention_is_counted() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let coord = coordinator();
    let held = coord.get_active().unwrap();
    assert_eq!(coord.swap(), Err(DspError::SwapTimeout));
    drop(held);

    let session = coord.get_inactive();
    assert_eq!(coord.swap(), Err(DspError::SwapBusy));
    drop(session);

    let health = coord.health();
    assert_eq!(health.failures, 2);
    assert!(health.last_failure.is_some());
    assert!(DspError::SwapBusy.is_retryable());
}
