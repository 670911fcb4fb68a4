use crate::dsp::one_pole_alpha;
use crate::dsp::partitioned_convolver::{ConvolutionKernel, PartitionedConvolver};

/// block size of the early stage, which is also the block size of the host
pub const EARLY_BLOCK_SIZE: usize = 256;
pub const EARLY_FFT_SIZE: usize = 512;
/// IR samples covered by the early stage; everything beyond feeds the late stage
pub const EARLY_IR_SAMPLES: usize = 1024;
pub const LATE_BLOCK_SIZE: usize = 1024;
pub const LATE_FFT_SIZE: usize = 2048;

const LATE_BLOCKS_PER_CHUNK: usize = LATE_BLOCK_SIZE / EARLY_BLOCK_SIZE;
// the late tail of a chunk spans slots k+1..k+4 while slot k is being read,
// so the ring must hold at least 5 slots; 8 keeps the mask cheap
const SCHEDULE_BLOCKS: usize = 8;
const SCHEDULE_LEN: usize = SCHEDULE_BLOCKS * EARLY_BLOCK_SIZE;

/// crossfade length between IRs, ~90 ms at 44.1 kHz
const FADE_BLOCKS: usize = 16;
const FADE_SAMPLES: usize = FADE_BLOCKS * EARLY_BLOCK_SIZE;

// IRs are peak-normalized but can still carry a lot of energy; a fixed wet
// scalar keeps the output of the whole IR family out of clipping range
const WET_LEVEL: f32 = 0.25;

const MIX_SMOOTHING_SECONDS: f64 = 0.01;

const STEREO_DELAY_LEN: usize = 64;

/// Early and late kernels for one IR, left and right.
///
/// A missing right side means the IR is mono (stereo is synthesized by the
/// decorrelator); a missing late side means the IR fits entirely into the
/// early stage.
#[derive(Clone, Default)]
pub struct StereoConvolutionKernel {
    pub early_left: ConvolutionKernel,
    pub early_right: Option<ConvolutionKernel>,
    pub late_left: Option<ConvolutionKernel>,
    pub late_right: Option<ConvolutionKernel>,
}

impl StereoConvolutionKernel {
    /// Build the early/late kernel pair from time-domain IR channels that are
    /// already at the engine sample rate. A stereo right channel shorter than
    /// the left is zero-extended so both sides end up with the same partition
    /// counts per stage.
    pub fn from_channels(left: &[f32], right: Option<&[f32]>) -> Self {
        let early_end = left.len().min(EARLY_IR_SAMPLES);
        let early_left = PartitionedConvolver::build_kernel_from_ir(
            &left[..early_end],
            EARLY_BLOCK_SIZE,
            EARLY_FFT_SIZE,
        );
        let late_left = (left.len() > EARLY_IR_SAMPLES).then(|| {
            PartitionedConvolver::build_kernel_from_ir(
                &left[EARLY_IR_SAMPLES..],
                LATE_BLOCK_SIZE,
                LATE_FFT_SIZE,
            )
        });

        let padded_right = right.map(|r| {
            let mut padded = r.to_vec();
            padded.resize(left.len(), 0.0);
            padded
        });
        let early_right = padded_right.as_ref().map(|r| {
            PartitionedConvolver::build_kernel_from_ir(
                &r[..early_end],
                EARLY_BLOCK_SIZE,
                EARLY_FFT_SIZE,
            )
        });
        let late_right = padded_right.as_ref().and_then(|r| {
            (r.len() > EARLY_IR_SAMPLES).then(|| {
                PartitionedConvolver::build_kernel_from_ir(
                    &r[EARLY_IR_SAMPLES..],
                    LATE_BLOCK_SIZE,
                    LATE_FFT_SIZE,
                )
            })
        });

        StereoConvolutionKernel {
            early_left,
            early_right,
            late_left,
            late_right,
        }
    }

    pub fn is_stereo(&self) -> bool {
        self.early_right.is_some()
    }

    pub fn has_late(&self) -> bool {
        self.late_left.is_some()
    }
}

/// IR selection state. A pending index requested while a fade is running is
/// queued in `next` and armed when the running fade completes; restarting
/// mid-fade would step the output by the already-faded weight.
#[derive(Clone, Copy)]
enum IrSelection {
    Steady {
        current: usize,
    },
    Crossfading {
        current: usize,
        pending: usize,
        fade_pos: usize,
        next: Option<usize>,
    },
}

impl IrSelection {
    fn current(&self) -> usize {
        match *self {
            IrSelection::Steady { current } => current,
            IrSelection::Crossfading { current, .. } => current,
        }
    }
}

/// Per-fade-side persistent state: overlap buffers for both stages and the
/// schedule ring that places late-stage output at its position in time.
/// Side A belongs to the current kernel, side B to the pending one; the
/// sides swap when a crossfade completes.
struct FadeSide {
    overlap_l: [f32; EARLY_BLOCK_SIZE],
    overlap_r: [f32; EARLY_BLOCK_SIZE],
    overlap_late_l: [f32; LATE_BLOCK_SIZE],
    overlap_late_r: [f32; LATE_BLOCK_SIZE],
    sched_l: [f32; SCHEDULE_LEN],
    sched_r: [f32; SCHEDULE_LEN],
}

impl FadeSide {
    fn new() -> Self {
        FadeSide {
            overlap_l: [0.0; EARLY_BLOCK_SIZE],
            overlap_r: [0.0; EARLY_BLOCK_SIZE],
            overlap_late_l: [0.0; LATE_BLOCK_SIZE],
            overlap_late_r: [0.0; LATE_BLOCK_SIZE],
            sched_l: [0.0; SCHEDULE_LEN],
            sched_r: [0.0; SCHEDULE_LEN],
        }
    }

    fn clear(&mut self) {
        self.overlap_l.fill(0.0);
        self.overlap_r.fill(0.0);
        self.overlap_late_l.fill(0.0);
        self.overlap_late_r.fill(0.0);
        self.sched_l.fill(0.0);
        self.sched_r.fill(0.0);
    }
}

/// Two-stage convolution reverb: mono in, stereo wet out.
///
/// The early stage convolves every 256-sample block against the first 1024
/// IR samples; the late stage gathers four early blocks, convolves them
/// against the IR tail and schedules the result back into the early output
/// stream at its proper time position. IR switching crossfades both stages
/// together; mono IRs get their stereo width from a small decorrelator.
pub struct ConvolutionReverb {
    sample_rate: f64,

    target_mix: f32,
    current_mix: f32,
    mix_alpha: f32,

    kernels: Vec<StereoConvolutionKernel>,
    selection: IrSelection,

    convolver_early: PartitionedConvolver,
    convolver_late: PartitionedConvolver,
    side_a: FadeSide,
    side_b: FadeSide,

    in_block: [f32; EARLY_BLOCK_SIZE],
    wet_a_l: [f32; EARLY_BLOCK_SIZE],
    wet_a_r: [f32; EARLY_BLOCK_SIZE],
    wet_b_l: [f32; EARLY_BLOCK_SIZE],
    wet_b_r: [f32; EARLY_BLOCK_SIZE],

    late_in: [f32; LATE_BLOCK_SIZE],
    late_in_pos: usize,
    late_tmp_l: [f32; LATE_BLOCK_SIZE],
    late_tmp_r: [f32; LATE_BLOCK_SIZE],

    block_index: u64,

    // sample-oriented adapter
    in_pos: usize,
    out_pos: usize,
    wet_ready: bool,
    wet_out_l: [f32; EARLY_BLOCK_SIZE],
    wet_out_r: [f32; EARLY_BLOCK_SIZE],

    // stereo decorrelation for mono IRs
    stereo_delay: [f32; STEREO_DELAY_LEN],
    stereo_pos: usize,
    stereo_lp: f32,
}

impl ConvolutionReverb {
    pub fn new(sample_rate: f64) -> Self {
        let mut reverb = ConvolutionReverb {
            sample_rate: sample_rate.max(1.0),
            target_mix: 0.0,
            current_mix: 0.0,
            mix_alpha: one_pole_alpha(sample_rate, MIX_SMOOTHING_SECONDS),
            kernels: Vec::new(),
            selection: IrSelection::Steady { current: 0 },
            convolver_early: PartitionedConvolver::new(),
            convolver_late: PartitionedConvolver::new(),
            side_a: FadeSide::new(),
            side_b: FadeSide::new(),
            in_block: [0.0; EARLY_BLOCK_SIZE],
            wet_a_l: [0.0; EARLY_BLOCK_SIZE],
            wet_a_r: [0.0; EARLY_BLOCK_SIZE],
            wet_b_l: [0.0; EARLY_BLOCK_SIZE],
            wet_b_r: [0.0; EARLY_BLOCK_SIZE],
            late_in: [0.0; LATE_BLOCK_SIZE],
            late_in_pos: 0,
            late_tmp_l: [0.0; LATE_BLOCK_SIZE],
            late_tmp_r: [0.0; LATE_BLOCK_SIZE],
            block_index: 0,
            in_pos: 0,
            out_pos: 0,
            wet_ready: false,
            wet_out_l: [0.0; EARLY_BLOCK_SIZE],
            wet_out_r: [0.0; EARLY_BLOCK_SIZE],
            stereo_delay: [0.0; STEREO_DELAY_LEN],
            stereo_pos: 0,
            stereo_lp: 0.0,
        };
        reverb.rebuild_for_current_kernels();
        reverb
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        if sample_rate <= 0.0 {
            return;
        }
        self.sample_rate = sample_rate;
        self.mix_alpha = one_pole_alpha(sample_rate, MIX_SMOOTHING_SECONDS);
        // sizes stay fixed, but the rebuild clears all running state
        self.rebuild_for_current_kernels();
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn set_mix(&mut self, mix: f32) {
        self.target_mix = mix.clamp(0.0, 1.0);
    }

    pub fn mix(&self) -> f32 {
        self.target_mix
    }

    /// Replace the kernel list. Clears all running state; the current and
    /// pending IR indices reset.
    pub fn set_ir_kernels(&mut self, kernels: Vec<StereoConvolutionKernel>) {
        self.kernels = kernels;
        self.selection = IrSelection::Steady { current: 0 };
        self.rebuild_for_current_kernels();
    }

    /// Adopt a new engine rate and the kernel list built for that rate in a
    /// single rebuild.
    pub fn set_ir_kernels_at_rate(&mut self, sample_rate: f64, kernels: Vec<StereoConvolutionKernel>) {
        if sample_rate > 0.0 {
            self.sample_rate = sample_rate;
            self.mix_alpha = one_pole_alpha(sample_rate, MIX_SMOOTHING_SECONDS);
        }
        self.set_ir_kernels(kernels);
    }

    pub fn ir_count(&self) -> usize {
        self.kernels.len()
    }

    pub fn ir_index(&self) -> usize {
        self.selection.current()
    }

    /// Select an IR; out-of-range indices are clamped. A change arms a
    /// crossfade, a change during a running fade is queued behind it.
    pub fn set_ir_index(&mut self, index: usize) {
        if self.kernels.is_empty() {
            self.selection = IrSelection::Steady { current: 0 };
            return;
        }
        let index = index.min(self.kernels.len() - 1);

        self.selection = match self.selection {
            IrSelection::Steady { current } if index != current => {
                self.side_b.clear();
                IrSelection::Crossfading {
                    current,
                    pending: index,
                    fade_pos: 0,
                    next: None,
                }
            }
            steady @ IrSelection::Steady { .. } => steady,
            IrSelection::Crossfading {
                current,
                pending,
                fade_pos,
                ..
            } => IrSelection::Crossfading {
                current,
                pending,
                fade_pos,
                next: (index != pending).then_some(index),
            },
        };
    }

    /// Clears all buffers, overlap and late accumulators, the crossfade
    /// state and the stereo decorrelator. The current IR index is kept.
    pub fn reset(&mut self) {
        self.convolver_early.reset();
        self.convolver_late.reset();
        self.side_a.clear();
        self.side_b.clear();

        self.in_block.fill(0.0);
        self.wet_a_l.fill(0.0);
        self.wet_a_r.fill(0.0);
        self.wet_b_l.fill(0.0);
        self.wet_b_r.fill(0.0);
        self.late_in.fill(0.0);
        self.late_in_pos = 0;
        self.late_tmp_l.fill(0.0);
        self.late_tmp_r.fill(0.0);
        self.block_index = 0;

        self.in_pos = 0;
        self.out_pos = 0;
        self.wet_ready = false;
        self.wet_out_l.fill(0.0);
        self.wet_out_r.fill(0.0);

        self.selection = IrSelection::Steady {
            current: self.selection.current(),
        };
        self.current_mix = self.target_mix;

        self.stereo_delay.fill(0.0);
        self.stereo_pos = 0;
        self.stereo_lp = 0.0;
    }

    fn rebuild_for_current_kernels(&mut self) {
        // partition counts vary per IR; size each stage's history once, to
        // the maximum it will ever see
        let mut max_early = 1;
        let mut max_late = 1;
        for k in &self.kernels {
            max_early = max_early.max(k.early_left.partitions.len());
            if let Some(r) = &k.early_right {
                max_early = max_early.max(r.partitions.len());
            }
            if let Some(l) = &k.late_left {
                max_late = max_late.max(l.partitions.len());
            }
            if let Some(r) = &k.late_right {
                max_late = max_late.max(r.partitions.len());
            }
        }
        self.convolver_early
            .configure(EARLY_BLOCK_SIZE, EARLY_FFT_SIZE, max_early);
        self.convolver_late
            .configure(LATE_BLOCK_SIZE, LATE_FFT_SIZE, max_late);
        self.reset();
    }

    /// Wet-only block path: 256 mono samples in, 256 wet samples per side
    /// out. The caller owns dry/wet mixing.
    pub fn process_block_wet(&mut self, input: &[f32], out_wet_l: &mut [f32], out_wet_r: &mut [f32]) {
        if input.len() < EARLY_BLOCK_SIZE
            || out_wet_l.len() < EARLY_BLOCK_SIZE
            || out_wet_r.len() < EARLY_BLOCK_SIZE
        {
            return;
        }
        self.in_block.copy_from_slice(&input[..EARLY_BLOCK_SIZE]);
        self.render_wet_block();
        out_wet_l[..EARLY_BLOCK_SIZE].copy_from_slice(&self.wet_out_l);
        out_wet_r[..EARLY_BLOCK_SIZE].copy_from_slice(&self.wet_out_r);
    }

    /// Sample-oriented convenience path for synchronous hosts: batches into
    /// blocks internally and mixes dry and wet with the smoothed mix.
    pub fn process_sample(&mut self, input: f32) -> (f32, f32) {
        self.current_mix += (self.target_mix - self.current_mix) * self.mix_alpha;

        let (wet_l, wet_r) = if self.wet_ready && self.out_pos < EARLY_BLOCK_SIZE {
            (self.wet_out_l[self.out_pos], self.wet_out_r[self.out_pos])
        } else {
            (0.0, 0.0)
        };

        let m = self.current_mix;
        let out = (
            input * (1.0 - m) + wet_l * m,
            input * (1.0 - m) + wet_r * m,
        );

        self.in_block[self.in_pos] = input;
        self.in_pos += 1;
        self.out_pos += 1;

        if self.in_pos >= EARLY_BLOCK_SIZE {
            self.render_wet_block();
            self.in_pos = 0;
            self.out_pos = 0;
            self.wet_ready = true;
        }

        out
    }

    fn use_decorrelation(&self) -> bool {
        match self.selection {
            IrSelection::Steady { current } => self
                .kernels
                .get(current)
                .map(|k| !k.is_stereo())
                .unwrap_or(false),
            IrSelection::Crossfading { .. } => false,
        }
    }

    /// One decorrelator step. State is advanced even when the output is
    /// bypassed so switching between mono and stereo IRs does not jump.
    fn decorrelate_sample(&mut self, wet_l: f32, wet_r: f32, active: bool) -> (f32, f32) {
        let wet_mono = 0.5 * (wet_l + wet_r);
        self.stereo_delay[self.stereo_pos] = wet_mono;

        let tap_short = self.stereo_delay[(self.stereo_pos + STEREO_DELAY_LEN - 7) % STEREO_DELAY_LEN];
        let tap_long = self.stereo_delay[(self.stereo_pos + STEREO_DELAY_LEN - 19) % STEREO_DELAY_LEN];
        self.stereo_lp = 0.25 * tap_long + 0.75 * self.stereo_lp;

        self.stereo_pos = (self.stereo_pos + 1) % STEREO_DELAY_LEN;

        if active {
            (wet_mono, 0.6 * tap_short + 0.4 * self.stereo_lp)
        } else {
            (wet_l, wet_r)
        }
    }

    fn render_wet_block(&mut self) {
        self.process_block();

        let active = self.use_decorrelation();
        for i in 0..EARLY_BLOCK_SIZE {
            let (l, r) = self.decorrelate_sample(self.wet_a_l[i], self.wet_a_r[i], active);
            self.wet_out_l[i] = l * WET_LEVEL;
            self.wet_out_r[i] = r * WET_LEVEL;
        }
    }

    fn process_block(&mut self) {
        self.convolver_early.push_input_block(&self.in_block);

        let sched_slot = (self.block_index & (SCHEDULE_BLOCKS as u64 - 1)) as usize;
        let sched_off = sched_slot * EARLY_BLOCK_SIZE;

        if self.kernels.is_empty() {
            self.wet_a_l.fill(0.0);
            self.wet_a_r.fill(0.0);
            self.side_a.sched_l[sched_off..sched_off + EARLY_BLOCK_SIZE].fill(0.0);
            self.side_a.sched_r[sched_off..sched_off + EARLY_BLOCK_SIZE].fill(0.0);
            self.side_b.sched_l[sched_off..sched_off + EARLY_BLOCK_SIZE].fill(0.0);
            self.side_b.sched_r[sched_off..sched_off + EARLY_BLOCK_SIZE].fill(0.0);
            self.block_index += 1;
            return;
        }

        let current = self.selection.current();
        let pending = match self.selection {
            IrSelection::Crossfading { pending, .. } => Some(pending),
            IrSelection::Steady { .. } => None,
        };

        // early stage, current kernel
        let a = &self.kernels[current];
        self.convolver_early
            .convolve(&a.early_left, &mut self.wet_a_l, &mut self.side_a.overlap_l);
        if let Some(right) = &a.early_right {
            self.convolver_early
                .convolve(right, &mut self.wet_a_r, &mut self.side_a.overlap_r);
        } else {
            self.wet_a_r = self.wet_a_l;
        }

        // add the late-tail contribution due at this block, consume the slot
        for i in 0..EARLY_BLOCK_SIZE {
            self.wet_a_l[i] += self.side_a.sched_l[sched_off + i];
            self.wet_a_r[i] += self.side_a.sched_r[sched_off + i];
        }
        self.side_a.sched_l[sched_off..sched_off + EARLY_BLOCK_SIZE].fill(0.0);
        self.side_a.sched_r[sched_off..sched_off + EARLY_BLOCK_SIZE].fill(0.0);

        // early stage, pending kernel during a crossfade
        if let Some(p) = pending {
            let b = &self.kernels[p];
            self.convolver_early
                .convolve(&b.early_left, &mut self.wet_b_l, &mut self.side_b.overlap_l);
            if let Some(right) = &b.early_right {
                self.convolver_early
                    .convolve(right, &mut self.wet_b_r, &mut self.side_b.overlap_r);
            } else {
                self.wet_b_r = self.wet_b_l;
            }

            for i in 0..EARLY_BLOCK_SIZE {
                self.wet_b_l[i] += self.side_b.sched_l[sched_off + i];
                self.wet_b_r[i] += self.side_b.sched_r[sched_off + i];
            }
        }
        self.side_b.sched_l[sched_off..sched_off + EARLY_BLOCK_SIZE].fill(0.0);
        self.side_b.sched_r[sched_off..sched_off + EARLY_BLOCK_SIZE].fill(0.0);

        // late stage: every 4 early blocks form one late input block
        self.late_in[self.late_in_pos..self.late_in_pos + EARLY_BLOCK_SIZE]
            .copy_from_slice(&self.in_block);
        self.late_in_pos += EARLY_BLOCK_SIZE;
        if self.late_in_pos >= LATE_BLOCK_SIZE {
            self.late_in_pos = 0;
            self.convolver_late.push_input_block(&self.late_in);

            // the chunk's tail starts 4 early blocks after its own start,
            // which is the block right after this one
            let target_start = self.block_index + 1;

            let a = &self.kernels[current];
            if let Some(late_l) = &a.late_left {
                self.convolver_late.convolve(
                    late_l,
                    &mut self.late_tmp_l,
                    &mut self.side_a.overlap_late_l,
                );
                if let Some(late_r) = &a.late_right {
                    self.convolver_late.convolve(
                        late_r,
                        &mut self.late_tmp_r,
                        &mut self.side_a.overlap_late_r,
                    );
                } else {
                    self.late_tmp_r = self.late_tmp_l;
                }
                for b in 0..LATE_BLOCKS_PER_CHUNK {
                    let slot = ((target_start + b as u64) & (SCHEDULE_BLOCKS as u64 - 1)) as usize;
                    let off = slot * EARLY_BLOCK_SIZE;
                    let src = b * EARLY_BLOCK_SIZE;
                    for i in 0..EARLY_BLOCK_SIZE {
                        self.side_a.sched_l[off + i] += self.late_tmp_l[src + i];
                        self.side_a.sched_r[off + i] += self.late_tmp_r[src + i];
                    }
                }
            }

            if let Some(p) = pending {
                let b_kernel = &self.kernels[p];
                if let Some(late_l) = &b_kernel.late_left {
                    self.convolver_late.convolve(
                        late_l,
                        &mut self.late_tmp_l,
                        &mut self.side_b.overlap_late_l,
                    );
                    if let Some(late_r) = &b_kernel.late_right {
                        self.convolver_late.convolve(
                            late_r,
                            &mut self.late_tmp_r,
                            &mut self.side_b.overlap_late_r,
                        );
                    } else {
                        self.late_tmp_r = self.late_tmp_l;
                    }
                    for b in 0..LATE_BLOCKS_PER_CHUNK {
                        let slot =
                            ((target_start + b as u64) & (SCHEDULE_BLOCKS as u64 - 1)) as usize;
                        let off = slot * EARLY_BLOCK_SIZE;
                        let src = b * EARLY_BLOCK_SIZE;
                        for i in 0..EARLY_BLOCK_SIZE {
                            self.side_b.sched_l[off + i] += self.late_tmp_l[src + i];
                            self.side_b.sched_r[off + i] += self.late_tmp_r[src + i];
                        }
                    }
                }
            }
        }

        // crossfade both stages together with a per-sample ramp
        if let IrSelection::Crossfading {
            current,
            pending,
            mut fade_pos,
            next,
        } = self.selection
        {
            for i in 0..EARLY_BLOCK_SIZE {
                let t = ((fade_pos + i) as f32 / FADE_SAMPLES as f32).min(1.0);
                self.wet_a_l[i] = self.wet_a_l[i] * (1.0 - t) + self.wet_b_l[i] * t;
                self.wet_a_r[i] = self.wet_a_r[i] * (1.0 - t) + self.wet_b_r[i] * t;
            }
            fade_pos += EARLY_BLOCK_SIZE;

            if fade_pos >= FADE_SAMPLES {
                // the pending kernel takes over; its overlap and schedule
                // state moves to the A side
                std::mem::swap(&mut self.side_a, &mut self.side_b);
                self.side_b.clear();
                self.selection = match next {
                    Some(n) if n != pending => IrSelection::Crossfading {
                        current: pending,
                        pending: n,
                        fade_pos: 0,
                        next: None,
                    },
                    _ => IrSelection::Steady { current: pending },
                };
            } else {
                self.selection = IrSelection::Crossfading {
                    current,
                    pending,
                    fade_pos,
                    next,
                };
            }
        }

        self.block_index += 1;
    }
}
