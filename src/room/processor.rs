use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};

use crate::dsp::convolution_reverb::{ConvolutionReverb, EARLY_BLOCK_SIZE};
use crate::dsp::denormals::DenormalGuard;
use crate::dsp::one_pole_alpha;
use crate::room::ir::{build_kernels_for_rate, IrProvider};
use crate::room::spsc_ring::SpscRing;

/// block size of the audio-thread pipeline, same as the reverb's early stage
pub const BLOCK_SIZE: usize = EARLY_BLOCK_SIZE;
/// the wet path lags the dry input by this many blocks; chosen so wet blocks
/// are virtually always ready when their turn comes
pub const OUTPUT_DELAY_BLOCKS: u64 = 6;
// power of two, larger than the output delay
const DRY_HISTORY_BLOCKS: usize = 64;
// per-direction queue capacity, sized to absorb worker scheduling jitter
// without backpressure
const QUEUE_BLOCKS: usize = 256;

const MIX_SMOOTHING_SECONDS: f64 = 0.01;

// frames-per-wallclock-second beyond this multiple of the sample rate counts
// as offline; two such blocks in a row latch the synchronous path
const OFFLINE_SPEED_FACTOR: f64 = 8.0;
const OFFLINE_TRIGGER_BLOCKS: u32 = 2;

const INVALID_SEQ: u64 = u64::MAX;

/// One block of mono dry input with its sequence number.
#[derive(Clone, Copy)]
pub struct DryBlock {
    pub seq: u64,
    pub samples: [f32; BLOCK_SIZE],
}

impl DryBlock {
    pub const fn zeroed() -> Self {
        DryBlock {
            seq: 0,
            samples: [0.0; BLOCK_SIZE],
        }
    }

    const fn invalid() -> Self {
        DryBlock {
            seq: INVALID_SEQ,
            samples: [0.0; BLOCK_SIZE],
        }
    }
}

/// One block of stereo wet output, interleaved (L, R), paired with the dry
/// block of the same sequence number.
#[derive(Clone, Copy)]
pub struct StereoWetBlock {
    pub seq: u64,
    pub samples: [f32; 2 * BLOCK_SIZE],
}

impl StereoWetBlock {
    pub const fn zeroed() -> Self {
        StereoWetBlock {
            seq: 0,
            samples: [0.0; 2 * BLOCK_SIZE],
        }
    }
}

/// The entire surface shared between the audio thread and the worker: the
/// two rings, a handful of atomics and the worker's wakeup.
struct RoomShared {
    dry_ring: SpscRing<DryBlock>,
    wet_ring: SpscRing<StereoWetBlock>,

    requested_sample_rate: AtomicCell<f64>,
    sample_rate_seq: AtomicU64,
    requested_mix: AtomicCell<f32>,
    requested_ir_index: AtomicUsize,
    reset_seq: AtomicU64,
    built_once: AtomicBool,
    running: AtomicBool,

    wake_mutex: Mutex<()>,
    wake_cond: Condvar,
    // written by the worker on exit, taken by the audio thread after join
    // when the offline latch fires
    worker_state: Mutex<Option<Box<WorkerState>>>,
}

/// Everything the worker owns: the reverb, its kernels (inside the reverb),
/// the IR provider and the control sequence numbers it has applied.
struct WorkerState {
    reverb: ConvolutionReverb,
    provider: Option<Box<dyn IrProvider + Send>>,
    sample_rate: f64,
    applied_sample_rate_seq: u64,
    applied_reset_seq: u64,
    applied_ir_index: usize,
}

impl WorkerState {
    fn new(provider: Option<Box<dyn IrProvider + Send>>, sample_rate: f64) -> Self {
        WorkerState {
            reverb: ConvolutionReverb::new(sample_rate),
            provider,
            sample_rate,
            applied_sample_rate_seq: 0,
            applied_reset_seq: 0,
            applied_ir_index: 0,
        }
    }

    /// Rebuild kernels at the current sample rate. With no provider there is
    /// nothing to rebuild; the reverb state still resets and the IR index is
    /// preserved.
    fn rebuild(&mut self, shared: &RoomShared) {
        if let Some(provider) = &self.provider {
            let kernels = build_kernels_for_rate(provider.as_ref(), self.sample_rate);
            self.reverb
                .set_ir_kernels_at_rate(self.sample_rate, kernels);
            self.reverb.set_ir_index(self.applied_ir_index);
            shared.built_once.store(true, Ordering::Release);
        } else {
            self.reverb.set_sample_rate(self.sample_rate);
        }
    }

    /// Apply pending control changes in order: sample rate, reset, IR index.
    fn apply_pending(&mut self, shared: &RoomShared) {
        let sr_seq = shared.sample_rate_seq.load(Ordering::Acquire);
        if sr_seq != self.applied_sample_rate_seq {
            self.applied_sample_rate_seq = sr_seq;
            self.sample_rate = shared.requested_sample_rate.load();
            self.rebuild(shared);
        }

        let reset_seq = shared.reset_seq.load(Ordering::Acquire);
        if reset_seq != self.applied_reset_seq {
            self.applied_reset_seq = reset_seq;
            self.reverb.reset();
            self.reverb.set_ir_index(self.applied_ir_index);
        }

        let ir_index = shared.requested_ir_index.load(Ordering::Acquire);
        if ir_index != self.applied_ir_index {
            self.applied_ir_index = ir_index;
            self.reverb.set_ir_index(ir_index);
        }
    }

    fn process_dry_block(&mut self, dry: &DryBlock) -> StereoWetBlock {
        let mut wet_l = [0.0f32; BLOCK_SIZE];
        let mut wet_r = [0.0f32; BLOCK_SIZE];
        self.reverb
            .process_block_wet(&dry.samples, &mut wet_l, &mut wet_r);

        let mut wet = StereoWetBlock::zeroed();
        wet.seq = dry.seq;
        for i in 0..BLOCK_SIZE {
            wet.samples[2 * i] = wet_l[i];
            wet.samples[2 * i + 1] = wet_r[i];
        }
        wet
    }
}

fn worker_loop(shared: Arc<RoomShared>) {
    let _denormals = DenormalGuard::new();

    let mut state = match shared.worker_state.lock().take() {
        Some(state) => state,
        None => return,
    };

    loop {
        {
            let mut guard = shared.wake_mutex.lock();
            // timed wait: a notify racing past the predicate check can only
            // delay a block by one tick, never hang the worker
            while shared.running.load(Ordering::Acquire) && shared.dry_ring.is_empty() {
                let _ = shared
                    .wake_cond
                    .wait_for(&mut guard, Duration::from_millis(2));
            }
        }

        while let Some(dry) = shared.dry_ring.pop() {
            state.apply_pending(&shared);
            let wet = state.process_dry_block(&dry);
            // drop on full; the audio thread substitutes silence
            let _ = shared.wet_ring.push(wet);
        }

        if !shared.running.load(Ordering::Acquire) {
            break;
        }
    }

    *shared.worker_state.lock() = Some(state);
}

/// Whether blocks cross the rings to a worker thread or the whole pipeline
/// runs on the calling thread. Offline is a one-way latch.
enum ProcessorMode {
    Threaded { worker: Option<thread::JoinHandle<()>> },
    Offline { state: Box<WorkerState> },
}

/// Control-plane handle, callable from any thread. The counterpart of the
/// audio-side [`RoomProcessor`]; both share only the atomic control block.
pub struct RoomControls {
    shared: Arc<RoomShared>,
}

impl RoomControls {
    pub fn set_sample_rate(&self, sample_rate: f64) {
        if sample_rate <= 0.0 {
            return;
        }
        self.shared.requested_sample_rate.store(sample_rate);
        self.shared.sample_rate_seq.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_mix(&self, mix: f32) {
        self.shared.requested_mix.store(mix.clamp(0.0, 1.0));
    }

    pub fn set_ir_index(&self, index: usize) {
        self.shared.requested_ir_index.store(index, Ordering::Release);
    }

    pub fn reset(&self) {
        self.shared.reset_seq.fetch_add(1, Ordering::AcqRel);
    }

    /// true once the worker has built kernels from the provider at least once
    pub fn built_once(&self) -> bool {
        self.shared.built_once.load(Ordering::Acquire)
    }
}

/// Audio-thread side of the room reverb.
///
/// `process` is wait-free and allocation-free: it touches its own state, the
/// atomics and the two rings, and pokes the worker's condvar. Dry blocks are
/// numbered and mirrored into a local history; wet blocks come back from the
/// worker and are re-paired with their dry block `OUTPUT_DELAY_BLOCKS`
/// later, so dry and wet leave the processor aligned.
pub struct RoomProcessor {
    shared: Arc<RoomShared>,
    mode: ProcessorMode,

    sample_rate: f64,
    mix_alpha: f32,
    current_mix: f32,
    was_active: bool,

    dry_accum: DryBlock,
    block_pos: usize,
    next_seq: u64,
    dry_history: Vec<DryBlock>,

    play_dry: Option<DryBlock>,
    current_wet: Option<StereoWetBlock>,
    future_wet: Option<StereoWetBlock>,

    frames_processed: u64,
    run_start: Option<Instant>,
    offline_hot_blocks: u32,
    offline_detection: bool,
}

/// Create the control handle and the audio-side processor, spawning the
/// convolution worker. If the worker thread cannot be started the processor
/// comes up with the offline latch already set and runs synchronously.
pub fn init_room(
    provider: Option<Box<dyn IrProvider + Send>>,
    sample_rate: f64,
) -> (RoomControls, RoomProcessor) {
    build_room(provider, sample_rate, false, true)
}

/// Like [`init_room`] but never spawns a worker: the whole pipeline runs on
/// the calling thread. Faster-than-realtime rendering through this entry is
/// deterministic by construction.
pub fn init_room_offline(
    provider: Option<Box<dyn IrProvider + Send>>,
    sample_rate: f64,
) -> (RoomControls, RoomProcessor) {
    build_room(provider, sample_rate, true, true)
}

/// Threaded-shape processor without a real worker; tests drive the rings
/// themselves.
#[cfg(test)]
pub(crate) fn init_room_detached(
    provider: Option<Box<dyn IrProvider + Send>>,
    sample_rate: f64,
) -> (RoomControls, RoomProcessor) {
    build_room(provider, sample_rate, false, false)
}

fn build_room(
    provider: Option<Box<dyn IrProvider + Send>>,
    sample_rate: f64,
    offline: bool,
    spawn_worker: bool,
) -> (RoomControls, RoomProcessor) {
    let sample_rate = if sample_rate > 0.0 { sample_rate } else { 44100.0 };

    let shared = Arc::new(RoomShared {
        dry_ring: SpscRing::new(QUEUE_BLOCKS, DryBlock::zeroed()),
        wet_ring: SpscRing::new(QUEUE_BLOCKS, StereoWetBlock::zeroed()),
        requested_sample_rate: AtomicCell::new(sample_rate),
        sample_rate_seq: AtomicU64::new(0),
        requested_mix: AtomicCell::new(0.0),
        requested_ir_index: AtomicUsize::new(0),
        reset_seq: AtomicU64::new(0),
        built_once: AtomicBool::new(false),
        running: AtomicBool::new(false),
        wake_mutex: Mutex::new(()),
        wake_cond: Condvar::new(),
        worker_state: Mutex::new(None),
    });

    let mut state = Box::new(WorkerState::new(provider, sample_rate));
    state.rebuild(&shared);

    let mode = if offline {
        ProcessorMode::Offline { state }
    } else if !spawn_worker {
        *shared.worker_state.lock() = Some(state);
        ProcessorMode::Threaded { worker: None }
    } else {
        *shared.worker_state.lock() = Some(state);
        shared.running.store(true, Ordering::Release);

        let worker_shared = Arc::clone(&shared);
        match thread::Builder::new()
            .name("room-reverb-worker".into())
            .spawn(move || worker_loop(worker_shared))
        {
            Ok(handle) => ProcessorMode::Threaded {
                worker: Some(handle),
            },
            Err(_) => {
                // worker never started: latch the synchronous fallback
                shared.running.store(false, Ordering::Release);
                let state = shared
                    .worker_state
                    .lock()
                    .take()
                    .unwrap_or_else(|| Box::new(WorkerState::new(None, sample_rate)));
                ProcessorMode::Offline { state }
            }
        }
    };

    let controls = RoomControls {
        shared: Arc::clone(&shared),
    };
    let processor = RoomProcessor {
        shared,
        mode,
        sample_rate,
        mix_alpha: one_pole_alpha(sample_rate, MIX_SMOOTHING_SECONDS),
        current_mix: 0.0,
        was_active: false,
        dry_accum: DryBlock::zeroed(),
        block_pos: 0,
        next_seq: 0,
        dry_history: vec![DryBlock::invalid(); DRY_HISTORY_BLOCKS],
        play_dry: None,
        current_wet: None,
        future_wet: None,
        frames_processed: 0,
        run_start: None,
        offline_hot_blocks: 0,
        // a threaded-shape processor without a real worker (tests) must not
        // latch itself offline
        offline_detection: spawn_worker,
    };

    (controls, processor)
}

impl RoomProcessor {
    /// Per-sample audio-thread entry: one mono dry sample in, one stereo
    /// dry-plus-wet sample out.
    pub fn process(&mut self, input: f32) -> (f32, f32) {
        if self.run_start.is_none() {
            self.run_start = Some(Instant::now());
        }
        self.frames_processed += 1;

        let target_mix = self.shared.requested_mix.load().clamp(0.0, 1.0);
        self.current_mix += (target_mix - self.current_mix) * self.mix_alpha;

        if target_mix <= 0.0 {
            // bypass: dry goes straight out. Entering bypass clears the
            // block sequencing so re-enabling starts clean.
            if self.was_active {
                self.was_active = false;
                self.shared.reset_seq.fetch_add(1, Ordering::AcqRel);
                while self.shared.wet_ring.pop().is_some() {}
                self.clear_sequencing();
            }
            return (input, input);
        }
        if !self.was_active {
            self.was_active = true;
            // sweep out anything a worker block in flight delivered late
            while self.shared.wet_ring.pop().is_some() {}
        }

        if self.block_pos == 0 {
            self.begin_block();
        }

        let m = self.current_mix;
        let dry_out = self
            .play_dry
            .as_ref()
            .map(|b| b.samples[self.block_pos])
            .unwrap_or(0.0);
        let (wet_l, wet_r) = self
            .current_wet
            .as_ref()
            .map(|w| {
                (
                    w.samples[2 * self.block_pos],
                    w.samples[2 * self.block_pos + 1],
                )
            })
            .unwrap_or((0.0, 0.0));

        let out = (
            dry_out * (1.0 - m) + wet_l * m,
            dry_out * (1.0 - m) + wet_r * m,
        );

        self.dry_accum.samples[self.block_pos] = input;
        self.block_pos += 1;
        if self.block_pos >= BLOCK_SIZE {
            self.block_pos = 0;
            self.finish_block();
        }

        out
    }

    /// Block entry for hosts that hand over whole buffers; batches into the
    /// sample path.
    pub fn process_block(&mut self, input: &[f32], out_l: &mut [f32], out_r: &mut [f32]) {
        let frames = input.len().min(out_l.len()).min(out_r.len());
        for i in 0..frames {
            let (l, r) = self.process(input[i]);
            out_l[i] = l;
            out_r[i] = r;
        }
    }

    /// true once the synchronous fallback has latched
    pub fn is_offline(&self) -> bool {
        matches!(self.mode, ProcessorMode::Offline { .. })
    }

    /// Pick up the delayed dry block and the matching wet block for the
    /// block that starts now.
    fn begin_block(&mut self) {
        // adopt a rate change for the local mix smoothing
        let sr = self.shared.requested_sample_rate.load();
        if sr != self.sample_rate {
            self.sample_rate = sr;
            self.mix_alpha = one_pole_alpha(sr, MIX_SMOOTHING_SECONDS);
        }

        self.play_dry = None;
        self.current_wet = None;

        if self.next_seq < OUTPUT_DELAY_BLOCKS {
            // ramp-up: nothing old enough to play yet
            return;
        }
        let output_seq = self.next_seq - OUTPUT_DELAY_BLOCKS;

        let slot = (output_seq as usize) & (DRY_HISTORY_BLOCKS - 1);
        if self.dry_history[slot].seq == output_seq {
            self.play_dry = Some(self.dry_history[slot]);
        }

        // a block held over from an earlier drain may be the one due now;
        // anything at or past next_seq is an echo from before a sequencing
        // clear and can never match again
        if let Some(fut) = self.future_wet {
            if fut.seq == output_seq {
                self.current_wet = Some(fut);
                self.future_wet = None;
                return;
            }
            if fut.seq < output_seq || fut.seq >= self.next_seq {
                self.future_wet = None;
            } else {
                // wet for this block never made it; play the window dry
                return;
            }
        }

        loop {
            match self.shared.wet_ring.pop() {
                Some(w) if w.seq >= self.next_seq => continue, // stale epoch
                Some(w) if w.seq < output_seq => continue,     // too old
                Some(w) if w.seq == output_seq => {
                    self.current_wet = Some(w);
                    break;
                }
                Some(w) => {
                    // early delivery: keep it for its turn
                    self.future_wet = Some(w);
                    break;
                }
                None => break,
            }
        }
    }

    /// Stamp and ship the completed dry block.
    fn finish_block(&mut self) {
        self.dry_accum.seq = self.next_seq;
        let slot = (self.next_seq as usize) & (DRY_HISTORY_BLOCKS - 1);
        self.dry_history[slot] = self.dry_accum;
        self.next_seq += 1;

        match &mut self.mode {
            ProcessorMode::Threaded { .. } => {
                // drop on full: the worker is overloaded, this window will
                // simply play dry
                let _ = self.shared.dry_ring.push(self.dry_accum);
                self.shared.wake_cond.notify_one();
                self.detect_offline();
            }
            ProcessorMode::Offline { state } => {
                state.apply_pending(&self.shared);
                let wet = state.process_dry_block(&self.dry_accum);
                let _ = self.shared.wet_ring.push(wet);
            }
        }
    }

    fn clear_sequencing(&mut self) {
        self.block_pos = 0;
        self.next_seq = 0;
        self.dry_accum = DryBlock::zeroed();
        for block in &mut self.dry_history {
            *block = DryBlock::invalid();
        }
        self.play_dry = None;
        self.current_wet = None;
        self.future_wet = None;
    }

    fn detect_offline(&mut self) {
        if !self.offline_detection {
            return;
        }
        let start = match self.run_start {
            Some(start) => start,
            None => return,
        };
        let elapsed = start.elapsed().as_secs_f64();
        if self.frames_processed as f64 > OFFLINE_SPEED_FACTOR * self.sample_rate * elapsed {
            self.offline_hot_blocks += 1;
            if self.offline_hot_blocks >= OFFLINE_TRIGGER_BLOCKS {
                self.latch_offline();
            }
        } else {
            self.offline_hot_blocks = 0;
        }
    }

    /// One-way switch to the synchronous pipeline. Only reached when the
    /// host drives us faster than realtime, so the brief join is not an
    /// audio hazard.
    fn latch_offline(&mut self) {
        let worker = match &mut self.mode {
            ProcessorMode::Threaded { worker } => worker.take(),
            ProcessorMode::Offline { .. } => return,
        };

        self.shared.running.store(false, Ordering::Release);
        self.shared.wake_cond.notify_one();
        if let Some(handle) = worker {
            let _ = handle.join();
        }

        let mut state = match self.shared.worker_state.lock().take() {
            Some(state) => state,
            // the worker died without handing its state back; carry on with
            // a fresh reverb and silent wet rather than stopping audio
            None => Box::new(WorkerState::new(None, self.sample_rate)),
        };

        // catch up on whatever the worker had not consumed, in order
        while let Some(dry) = self.shared.dry_ring.pop() {
            state.apply_pending(&self.shared);
            let wet = state.process_dry_block(&dry);
            let _ = self.shared.wet_ring.push(wet);
        }

        self.mode = ProcessorMode::Offline { state };
    }
}

impl Drop for RoomProcessor {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake_cond.notify_one();
        if let ProcessorMode::Threaded { worker } = &mut self.mode {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}
