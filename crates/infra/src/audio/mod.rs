//! Audio thread and control plumbing
//!
//! - [`block`]: fixed-capacity sample blocks recycled through a free list
//! - [`runtime`]: the audio thread owning the engine
//! - [`control`]: edits and swaps from the control context

pub mod block;
pub mod control;
pub mod runtime;

pub use block::*;
pub use control::*;
pub use runtime::*;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to spawn audio thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Audio thread is not running")]
    Disconnected,

    #[error("Audio queue full")]
    QueueFull,

    #[error("No free audio block")]
    NoFreeBlock,

    #[error("Timed out waiting for a processed block")]
    Timeout,

    #[error("Processed block carries {got} frames, expected {expected}")]
    FrameMismatch { expected: usize, got: usize },

    #[error("Audio thread panicked")]
    Panicked,
}
