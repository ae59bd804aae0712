//! Runtime plumbing around the pipeline core
//!
//! [`audio::AudioRuntime`] drives an [`ampdsp_core::domain::AudioEngine`] on a
//! dedicated thread; [`audio::ControlHandle`] is the control-context side.

pub mod audio;

pub use audio::{AudioBlock, AudioRuntime, ControlHandle, RetryPolicy, RuntimeError};
