//! Shared fixtures for the pipeline integration tests

#[cfg(test)]
mod crud_properties;
#[cfg(test)]
mod pipeline_integration;
#[cfg(test)]
mod runtime_integration;

use ampdsp_core::domain::{
    limits::FULL_SCALE_24BIT, AudioEngine, ConfigSwapCoordinator, EngineMetrics, PipelineState,
    StageKind, SwapPolicy,
};
use std::sync::Arc;

pub const SAMPLE_RATE: u32 = 48000;

/// Swap policy with short waits so contention tests finish quickly
pub fn fast_policy() -> SwapPolicy {
    SwapPolicy {
        lock_timeout_ms: 2,
        wait_iterations: 20,
        wait_interval_ms: 1,
    }
}

pub fn coordinator() -> Arc<ConfigSwapCoordinator> {
    Arc::new(ConfigSwapCoordinator::new(PipelineState::new(SAMPLE_RATE), fast_policy()))
}

pub fn engine(coordinator: &Arc<ConfigSwapCoordinator>) -> AudioEngine {
    AudioEngine::new(Arc::clone(coordinator), Arc::new(EngineMetrics::new()))
}

/// Interleaved stereo sine, same signal on both sides, starting at frame `offset`
pub fn sine_block(frames: usize, frequency: f32, amplitude: f32, offset: usize) -> Vec<i32> {
    let step = std::f32::consts::TAU * frequency / SAMPLE_RATE as f32;
    (offset..offset + frames)
        .flat_map(|n| {
            let s = (amplitude * (step * n as f32).sin() * FULL_SCALE_24BIT) as i32;
            [s, s]
        })
        .collect()
}

/// Interleaved stereo block holding a constant level on both sides
pub fn dc_block(frames: usize, level: f32) -> Vec<i32> {
    vec![(level * FULL_SCALE_24BIT) as i32; frames * 2]
}

pub fn left(samples: &[i32]) -> Vec<i32> {
    samples.iter().step_by(2).copied().collect()
}

/// Runtime-only data of one stage, including the contents of its pool slot
#[derive(Debug, Clone, PartialEq)]
pub enum StageRuntime {
    Biquad { delay: [f32; 2] },
    Dynamics { envelope: f32, gain_reduction: f32 },
    Fir { position: u16, history: Vec<f32> },
    Delay { write_pos: u32, line: Vec<f32> },
    Gain { current: f32 },
    Other,
}

/// Runtime data of every stage of `channel`, in chain order
pub fn runtime_of(state: &PipelineState, channel: usize) -> Vec<StageRuntime> {
    let Ok(chain) = state.channel(channel) else {
        return Vec::new();
    };
    let pools = state.pools();
    chain
        .stages()
        .iter()
        .map(|stage| match &stage.kind {
            StageKind::Biquad { params, .. } => StageRuntime::Biquad { delay: params.delay },
            StageKind::Limiter(p) => StageRuntime::Dynamics {
                envelope: p.envelope,
                gain_reduction: p.gain_reduction,
            },
            StageKind::Compressor(p) => StageRuntime::Dynamics {
                envelope: p.envelope,
                gain_reduction: p.gain_reduction,
            },
            StageKind::Fir(p) => StageRuntime::Fir {
                position: p.delay_pos,
                history: pools.fir.get(p.slot).map(|b| b.delay.to_vec()).unwrap_or_default(),
            },
            StageKind::Delay(p) => StageRuntime::Delay {
                write_pos: p.write_pos,
                line: pools.delay.get(p.slot).map(|b| b.samples.to_vec()).unwrap_or_default(),
            },
            StageKind::Gain(p) => StageRuntime::Gain { current: p.current_linear },
            _ => StageRuntime::Other,
        })
        .collect()
}
