//! Dedicated audio thread
//!
//! The thread owns the [`AudioEngine`] and only ever processes a block,
//! routes the processed inputs, silences an input, applies a limiter
//! setting or stops. Blocks arrive and leave through bounded `crossbeam`
//! channels and are recycled through a [`BlockPool`], so the thread neither
//! allocates nor blocks on output. Every submitted block carries a sequence
//! id so a waiting caller only ever collects its own block.

use super::{AudioBlock, BlockPool, ControlHandle, Result, RuntimeError};
use ampdsp_core::domain::{
    AudioEngine, ConfigSwapCoordinator, EmergencyLimiterSettings, EngineConfig, EngineMetrics,
};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Blocks in flight between producer and audio thread
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

enum AudioMessage {
    Process(AudioBlock),
    Route(AudioBlock),
    ZeroChannels(usize),
    SetEmergencyLimiter(EmergencyLimiterSettings),
    Shutdown,
}

pub struct AudioRuntime {
    commands: Sender<AudioMessage>,
    processed: Receiver<AudioBlock>,
    blocks: BlockPool,
    control: ControlHandle,
    next_sequence: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

impl AudioRuntime {
    /// Move `engine` onto a new audio thread
    pub fn start(engine: AudioEngine, queue_depth: usize) -> Result<Self> {
        let queue_depth = queue_depth.max(1);
        let control = ControlHandle::new(
            Arc::clone(engine.coordinator()),
            Arc::clone(engine.metrics()),
        );
        let (commands, command_rx) = bounded(queue_depth);
        let (processed_tx, processed) = bounded(queue_depth);
        let blocks = BlockPool::new(queue_depth * 2);

        let recycle = blocks.clone();
        let thread = thread::Builder::new()
            .name("ampdsp-audio".into())
            .spawn(move || audio_loop(engine, command_rx, processed_tx, recycle))?;

        info!(queue_depth, "Audio runtime started");
        Ok(Self {
            commands,
            processed,
            blocks,
            control,
            next_sequence: AtomicU64::new(0),
            thread: Some(thread),
        })
    }

    /// Build the coordinator, metrics and engine described by `config`, then start
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let coordinator = Arc::new(ConfigSwapCoordinator::new(config.initial_state(), config.swap));
        let engine = AudioEngine::new(coordinator, Arc::new(EngineMetrics::new()))
            .with_emergency_limiter(config.emergency_limiter);
        Self::start(engine, DEFAULT_QUEUE_DEPTH)
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    pub fn acquire_block(&self) -> Result<AudioBlock> {
        self.blocks.acquire().ok_or(RuntimeError::NoFreeBlock)
    }

    pub fn release_block(&self, block: AudioBlock) {
        self.blocks.release(block);
    }

    /// Queue a block for processing without waiting; returns its sequence id
    pub fn submit(&self, block: AudioBlock) -> Result<u64> {
        self.send_block(block, AudioMessage::Process)
    }

    fn send_block(&self, mut block: AudioBlock, wrap: fn(AudioBlock) -> AudioMessage) -> Result<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        block.set_sequence(sequence);
        match self.commands.try_send(wrap(block)) {
            Ok(()) => Ok(sequence),
            Err(TrySendError::Full(AudioMessage::Process(block) | AudioMessage::Route(block))) => {
                self.blocks.release(block);
                Err(RuntimeError::QueueFull)
            }
            Err(TrySendError::Full(_)) => Err(RuntimeError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(RuntimeError::Disconnected),
        }
    }

    pub fn recv_processed(&self, timeout: Duration) -> Result<AudioBlock> {
        self.processed.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => RuntimeError::Timeout,
            RecvTimeoutError::Disconnected => RuntimeError::Disconnected,
        })
    }

    /// Wait for the processed block tagged `sequence`
    ///
    /// Blocks submitted earlier and never collected are handed back to the
    /// pool on the way. Meant for a single collecting caller.
    pub fn recv_sequence(&self, sequence: u64, timeout: Duration) -> Result<AudioBlock> {
        let deadline = Instant::now() + timeout;
        loop {
            let block = self.recv_processed(deadline.saturating_duration_since(Instant::now()))?;
            if block.sequence() == sequence {
                return Ok(block);
            }
            debug!(stale = block.sequence(), sequence, "Discarding uncollected block");
            self.blocks.release(block);
        }
    }

    /// Round-trip one interleaved block through the audio thread, in place
    ///
    /// At most [`MAX_FRAMES`](ampdsp_core::domain::limits::MAX_FRAMES)
    /// frames are processed; the rest of `interleaved` is left untouched.
    pub fn process_blocking(
        &self,
        input: usize,
        interleaved: &mut [i32],
        timeout: Duration,
    ) -> Result<usize> {
        let mut block = self.acquire_block()?;
        let frames = block.fill(input, interleaved);
        let sequence = self.submit(block)?;
        let done = self.recv_sequence(sequence, timeout)?;
        let result = if done.frames() == frames {
            interleaved[..frames * 2].copy_from_slice(done.samples());
            Ok(frames)
        } else {
            Err(RuntimeError::FrameMismatch {
                expected: frames,
                got: done.frames(),
            })
        };
        self.release_block(done);
        result
    }

    /// Run the routing matrix over the inputs processed so far
    ///
    /// Writes the routed output pair into `out` and returns the frames
    /// written, which may be fewer than `out` holds.
    pub fn route_blocking(&self, out: &mut [i32], timeout: Duration) -> Result<usize> {
        let mut block = self.acquire_block()?;
        let capacity = block.fill(0, out);
        let sequence = self.send_block(block, AudioMessage::Route)?;
        let done = self.recv_sequence(sequence, timeout)?;
        let result = if done.frames() <= capacity {
            out[..done.frames() * 2].copy_from_slice(done.samples());
            Ok(done.frames())
        } else {
            Err(RuntimeError::FrameMismatch {
                expected: capacity,
                got: done.frames(),
            })
        };
        self.release_block(done);
        result
    }

    /// Silence an input's post-chain channels until it is processed again
    pub fn zero_channels(&self, input: usize) -> Result<()> {
        self.commands
            .send(AudioMessage::ZeroChannels(input))
            .map_err(|_| RuntimeError::Disconnected)
    }

    pub fn set_emergency_limiter(&self, settings: EmergencyLimiterSettings) -> Result<()> {
        self.commands
            .send(AudioMessage::SetEmergencyLimiter(settings))
            .map_err(|_| RuntimeError::Disconnected)
    }

    /// Stop the audio thread and wait for it
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.commands.send(AudioMessage::Shutdown);
        thread.join().map_err(|_| RuntimeError::Panicked)?;
        info!("Audio runtime stopped");
        Ok(())
    }
}

impl Drop for AudioRuntime {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Audio runtime did not stop cleanly");
        }
    }
}

fn audio_loop(
    mut engine: AudioEngine,
    commands: Receiver<AudioMessage>,
    processed: Sender<AudioBlock>,
    recycle: BlockPool,
) {
    debug!("Audio thread running");
    for message in commands.iter() {
        match message {
            AudioMessage::Process(mut block) => {
                let (samples, frames, input) = block.parts_mut();
                engine.process_buffer(samples, frames, input);
                if !hand_back(&processed, &recycle, block) {
                    break;
                }
            }
            AudioMessage::Route(mut block) => {
                let (samples, frames, _) = block.parts_mut();
                let routed = engine.execute_routing(samples, frames);
                block.truncate(routed);
                if !hand_back(&processed, &recycle, block) {
                    break;
                }
            }
            AudioMessage::ZeroChannels(input) => engine.zero_channels(input),
            AudioMessage::SetEmergencyLimiter(settings) => engine.set_emergency_limiter(settings),
            AudioMessage::Shutdown => break,
        }
    }
    debug!("Audio thread exiting");
}

/// Returns false once the collecting side is gone
fn hand_back(processed: &Sender<AudioBlock>, recycle: &BlockPool, block: AudioBlock) -> bool {
    match processed.try_send(block) {
        Ok(()) => true,
        // Nobody is draining; hand the block back instead of waiting
        Err(TrySendError::Full(block)) => {
            recycle.release(block);
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}
