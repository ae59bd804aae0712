//! Recycled sample blocks
//!
//! Every block is allocated once with room for [`MAX_FRAMES`] stereo frames
//! and then travels between the producer, the audio thread and a free list.
//! Nothing is allocated per buffer.

use ampdsp_core::domain::limits::MAX_FRAMES;
use crossbeam::channel::{bounded, Receiver, Sender};

/// One interleaved stereo block of 24-bit samples carried in `i32`
#[derive(Debug, Clone)]
pub struct AudioBlock {
    input: usize,
    frames: usize,
    /// Assigned on submission; ties a processed block to its request
    sequence: u64,
    samples: Vec<i32>,
}

impl Default for AudioBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBlock {
    pub fn new() -> Self {
        Self {
            input: 0,
            frames: 0,
            sequence: 0,
            samples: vec![0; MAX_FRAMES * 2],
        }
    }

    /// Copy interleaved samples in; returns the number of frames taken
    pub fn fill(&mut self, input: usize, interleaved: &[i32]) -> usize {
        let frames = (interleaved.len() / 2).min(MAX_FRAMES);
        self.samples[..frames * 2].copy_from_slice(&interleaved[..frames * 2]);
        self.input = input;
        self.frames = frames;
        frames
    }

    pub fn input(&self) -> usize {
        self.input
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Shorten the block; never grows it
    pub(crate) fn truncate(&mut self, frames: usize) {
        self.frames = self.frames.min(frames);
    }

    pub fn samples(&self) -> &[i32] {
        &self.samples[..self.frames * 2]
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut [i32], usize, usize) {
        (&mut self.samples[..self.frames * 2], self.frames, self.input)
    }
}

/// Free list of preallocated blocks
#[derive(Clone)]
pub struct BlockPool {
    free_tx: Sender<AudioBlock>,
    free_rx: Receiver<AudioBlock>,
}

impl BlockPool {
    pub fn new(count: usize) -> Self {
        let (free_tx, free_rx) = bounded(count);
        for _ in 0..count {
            let _ = free_tx.try_send(AudioBlock::new());
        }
        Self { free_tx, free_rx }
    }

    pub fn acquire(&self) -> Option<AudioBlock> {
        self.free_rx.try_recv().ok()
    }

    /// Return a block; blocks beyond the pool's capacity are dropped
    pub fn release(&self, block: AudioBlock) {
        let _ = self.free_tx.try_send(block);
    }

    pub fn available(&self) -> usize {
        self.free_rx.len()
    }
}
