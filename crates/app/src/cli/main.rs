//! ampdsp command line
//!
//! Offline access to the pipeline: design filter sections, expand crossover
//! cascades and render a test tone through a configured chain on the audio
//! runtime. Results are printed as JSON.

use ampdsp_core::domain::{
    design_crossover, limits::FULL_SCALE_24BIT, BiquadCoeffs, ConfigManager, CrossoverKind,
    CrossoverRole, EngineConfig, FilterType, MetricsSnapshot, RoutingPreset, StageType, SwapHealth,
};
use ampdsp_infra::AudioRuntime;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ampdsp")]
#[command(about = "Multi-channel amplifier DSP pipeline", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Design one biquad section
    Design {
        /// Filter name (LPF, HPF, PEQ, LOW_SHELF, ...)
        #[arg(long)]
        filter: String,
        #[arg(long, default_value_t = 1000.0)]
        frequency: f32,
        #[arg(long, default_value_t = 0.707)]
        q: f32,
        #[arg(long, default_value_t = 0.0)]
        gain: f32,
        #[arg(long, default_value_t = 48000)]
        sample_rate: u32,
    },

    /// Expand a crossover into its biquad sections
    Crossover {
        /// BW1..BW8 or LR2..LR24
        #[arg(long)]
        kind: String,
        /// lowpass or highpass
        #[arg(long, default_value = "lowpass")]
        role: String,
        #[arg(long)]
        frequency: f32,
        #[arg(long, default_value_t = 48000)]
        sample_rate: u32,
    },

    /// Render a sine tone through the pipeline and report levels and metrics
    Render {
        /// Engine config file; defaults are used when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Stage types appended to both channels of the pair
        #[arg(long = "stage")]
        stages: Vec<String>,
        /// Crossover applied to both channels, e.g. LR4
        #[arg(long)]
        crossover: Option<String>,
        #[arg(long, default_value_t = 2000.0)]
        crossover_frequency: f32,
        #[arg(long, default_value_t = 1000.0)]
        tone: f32,
        #[arg(long, default_value_t = 0.5)]
        amplitude: f32,
        #[arg(long, default_value_t = 64)]
        blocks: usize,
        /// Stereo input index (0 or 1)
        #[arg(long, default_value_t = 0)]
        input: usize,
        /// Report the routed output pair using this preset, e.g. swap_lr
        #[arg(long)]
        routing: Option<String>,
    },

    /// Print the stored engine configuration, creating it if missing
    Config {
        /// Directory holding engine.toml
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct DesignReport {
    filter: FilterType,
    coeffs: BiquadCoeffs,
    dc_gain: f32,
    gain_at_frequency_db: f32,
}

#[derive(Serialize)]
struct SectionReport {
    label: String,
    filter: FilterType,
    q: f32,
    coeffs: BiquadCoeffs,
}

#[derive(Serialize)]
struct RenderReport {
    frames: usize,
    peak_in: f32,
    peak_out: [f32; 2],
    rms_out: [f32; 2],
    metrics: MetricsSnapshot,
    swap: SwapHealth,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Design {
            filter,
            frequency,
            q,
            gain,
            sample_rate,
        } => {
            let filter = parse_filter(&filter)?;
            let coeffs = BiquadCoeffs::design(filter, frequency, gain, q, q, sample_rate)
                .with_context(|| format!("{} has no designed coefficients", filter.name()))?;
            print_json(&DesignReport {
                filter,
                coeffs,
                dc_gain: coeffs.dc_gain(),
                gain_at_frequency_db: ampdsp_core::domain::linear_to_db(
                    coeffs.magnitude_at(frequency, sample_rate),
                ),
            })
        }

        Command::Crossover {
            kind,
            role,
            frequency,
            sample_rate,
        } => {
            let kind: CrossoverKind = kind.parse()?;
            let role: CrossoverRole = role.parse()?;
            let sections: Vec<SectionReport> = design_crossover(kind, role, frequency, sample_rate)?
                .iter()
                .filter_map(|stage| {
                    let StageType::Biquad(filter) = stage.stage_type() else {
                        return None;
                    };
                    let params = stage.biquad_params()?;
                    Some(SectionReport {
                        label: stage.label.as_str().to_string(),
                        filter,
                        q: params.q,
                        coeffs: params.coeffs,
                    })
                })
                .collect();
            print_json(&sections)
        }

        Command::Render {
            config,
            stages,
            crossover,
            crossover_frequency,
            tone,
            amplitude,
            blocks,
            input,
            routing,
        } => {
            let config = match config {
                Some(path) => EngineConfig::load_from_file(&path)
                    .await
                    .with_context(|| format!("loading {}", path.display()))?,
                None => EngineConfig::default(),
            };
            let stage_types = stages
                .iter()
                .map(|name| name.parse::<StageType>())
                .collect::<Result<Vec<_>, _>>()?;
            let crossover = crossover.map(|k| k.parse::<CrossoverKind>()).transpose()?;
            let routing = routing.map(|p| p.parse::<RoutingPreset>()).transpose()?;
            let report = render(
                &config,
                &stage_types,
                crossover,
                crossover_frequency,
                tone,
                amplitude,
                blocks,
                input,
                routing,
            )?;
            print_json(&report)
        }

        Command::Config { dir } => {
            let dir = match dir {
                Some(dir) => dir,
                None => ConfigManager::default_config_dir()?,
            };
            let manager = ConfigManager::new(dir);
            let config = manager.load().await;
            tracing::info!(path = %manager.config_path().display(), "Engine configuration");
            print_json(&config)
        }
    }
}

fn parse_filter(name: &str) -> anyhow::Result<FilterType> {
    match name.parse::<StageType>()? {
        StageType::Biquad(filter) => Ok(filter),
        other => bail!("{other} is not a biquad filter"),
    }
}

#[allow(clippy::too_many_arguments)]
fn render(
    config: &EngineConfig,
    stage_types: &[StageType],
    crossover: Option<CrossoverKind>,
    crossover_frequency: f32,
    tone: f32,
    amplitude: f32,
    blocks: usize,
    input: usize,
    routing: Option<RoutingPreset>,
) -> anyhow::Result<RenderReport> {
    let runtime = AudioRuntime::from_config(config)?;
    let channels = [input * 2, input * 2 + 1];

    runtime.control().apply(|state| {
        for channel in channels {
            for &stage_type in stage_types {
                state.add_stage(channel, stage_type, None)?;
            }
            if let Some(kind) = crossover {
                state.insert_crossover(channel, kind, CrossoverRole::Lowpass, crossover_frequency, None)?;
            }
        }
        if let Some(preset) = routing {
            state.set_routing_preset(preset);
        }
        Ok(())
    })?;
    if routing.is_some() {
        // Only one input carries the tone
        runtime.zero_channels(1 - input.min(1))?;
    }

    let frames = config.block_frames;
    let sample_rate = config.sample_rate as f32;
    let step = std::f32::consts::TAU * tone / sample_rate;
    let mut block = vec![0i32; frames * 2];
    let mut peak_out = [0.0f32; 2];
    let mut energy = [0.0f64; 2];
    let mut n = 0usize;

    for _ in 0..blocks {
        for frame in block.chunks_exact_mut(2) {
            let sample = (amplitude * (step * n as f32).sin() * FULL_SCALE_24BIT) as i32;
            frame[0] = sample;
            frame[1] = sample;
            n += 1;
        }
        runtime.process_blocking(input, &mut block, Duration::from_secs(1))?;
        if routing.is_some() {
            runtime.route_blocking(&mut block, Duration::from_secs(1))?;
        }
        for frame in block.chunks_exact(2) {
            for (side, &s) in frame.iter().enumerate() {
                let level = s as f32 / FULL_SCALE_24BIT;
                peak_out[side] = peak_out[side].max(level.abs());
                energy[side] += f64::from(level) * f64::from(level);
            }
        }
    }

    let total = (frames * blocks).max(1) as f64;
    let report = RenderReport {
        frames: frames * blocks,
        peak_in: amplitude,
        peak_out,
        rms_out: energy.map(|e| (e / total).sqrt() as f32),
        metrics: runtime.control().metrics(),
        swap: runtime.control().health(),
    };
    runtime.shutdown()?;
    Ok(report)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
