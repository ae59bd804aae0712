//! Pipeline domain: stages, coefficient design, pools, chains and the double-buffered state

pub mod chain;
pub mod coefficients;
pub mod config;
pub mod crossover;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod routing;
pub mod stage;
pub mod state;
pub mod swap;

// Re-export specific items to avoid ambiguous glob imports
pub use chain::{ChannelChain, PEQ_FREQUENCIES};
pub use coefficients::{compute_biquad_coeffs, db_to_linear, linear_to_db, BiquadCoeffs};
pub use config::{ConfigError, ConfigManager, EngineConfig};
pub use crossover::{design_crossover, CrossoverKind, CrossoverRole};
pub use dsp::{ProcessContext, StageProcessor};
pub use engine::{AudioEngine, EmergencyLimiterSettings, MAX_INPUTS};
pub use error::{DspError, ErrorKind};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use pool::{PoolKind, Pools};
pub use routing::{RoutingMatrix, RoutingPreset, ROUTING_SILENCE_DB};
pub use stage::{limits, FilterType, Stage, StageKind, StageType};
pub use state::PipelineState;
pub use swap::{swap_decision, ConfigSwapCoordinator, SwapDecision, SwapHealth, SwapPolicy};
