// Performance benchmarks for the DSP pipeline
//
// Run with: cargo bench --bench pipeline_bench

use ampdsp_core::domain::{
    design_crossover, AudioEngine, BiquadCoeffs, ConfigSwapCoordinator, CrossoverKind,
    CrossoverRole, EngineMetrics, FilterType, PipelineState, StageType, SwapPolicy,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn bench_coefficient_design(c: &mut Criterion) {
    let mut group = c.benchmark_group("coefficient_design");

    for filter in [FilterType::Lpf, FilterType::Peq, FilterType::LowShelf, FilterType::Allpass] {
        group.bench_with_input(BenchmarkId::from_parameter(filter.name()), &filter, |b, &filter| {
            b.iter(|| {
                black_box(BiquadCoeffs::design(
                    filter,
                    black_box(1000.0),
                    3.0,
                    0.707,
                    0.707,
                    48000,
                ));
            });
        });
    }

    group.finish();
}

fn bench_crossover_design(c: &mut Criterion) {
    let mut group = c.benchmark_group("crossover_design");

    for order in [2u8, 4, 8, 24] {
        group.bench_with_input(BenchmarkId::new("LR", order), &order, |b, &order| {
            b.iter(|| {
                let _ = black_box(design_crossover(
                    CrossoverKind::LinkwitzRiley(order),
                    CrossoverRole::Lowpass,
                    2000.0,
                    48000,
                ));
            });
        });
    }

    group.finish();
}

fn engine_with(stages: &[StageType]) -> AudioEngine {
    let mut state = PipelineState::with_peq_bands(48000);
    for channel in 0..2 {
        for &stage in stages {
            let _ = state.add_stage(channel, stage, None);
        }
    }
    let coordinator = Arc::new(ConfigSwapCoordinator::new(state, SwapPolicy::default()));
    AudioEngine::new(coordinator, Arc::new(EngineMetrics::new()))
}

fn bench_process_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_buffer_256_frames");
    let block: Vec<i32> = (0..512)
        .map(|i| ((i as f32 * 0.05).sin() * 4_000_000.0) as i32)
        .collect();

    let chains: [(&str, Vec<StageType>); 3] = [
        ("peq_only", vec![]),
        (
            "dynamics",
            vec![StageType::Gain, StageType::Compressor, StageType::Limiter],
        ),
        (
            "full",
            vec![
                StageType::Gain,
                StageType::Fir,
                StageType::Delay,
                StageType::Compressor,
                StageType::Limiter,
                StageType::Polarity,
            ],
        ),
    ];

    for (name, stages) in chains.iter() {
        let mut engine = engine_with(stages);
        group.bench_function(*name, |b| {
            let mut samples = block.clone();
            b.iter(|| {
                samples.copy_from_slice(&block);
                engine.process_buffer(black_box(&mut samples), 256, 0);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_coefficient_design,
    bench_crossover_design,
    bench_process_buffer
);
criterion_main!(benches);
