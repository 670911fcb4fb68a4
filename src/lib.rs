//! Realtime convolution-reverb core for a physically-modelled string
//! synthesizer: a mono dry stream in, a stereo wet signal out, convolved
//! with a selectable room impulse response.
//!
//! The DSP building blocks live in [`dsp`]. The realtime host (worker
//! thread, lock-free plumbing and the audio-thread adapter) lives in
//! [`room`]. The audio path never allocates, locks or blocks.

pub mod dsp;
pub mod room;

pub use crate::dsp::convolution_reverb::{
    ConvolutionReverb, StereoConvolutionKernel, EARLY_BLOCK_SIZE, EARLY_FFT_SIZE,
    EARLY_IR_SAMPLES, LATE_BLOCK_SIZE, LATE_FFT_SIZE,
};
pub use crate::dsp::denormals::DenormalGuard;
pub use crate::dsp::fft::Fft;
pub use crate::dsp::partitioned_convolver::{ConvolutionKernel, PartitionedConvolver};
pub use crate::room::ir::{IrProvider, IrSamples};
pub use crate::room::processor::{
    init_room, init_room_offline, DryBlock, RoomControls, RoomProcessor, StereoWetBlock,
    BLOCK_SIZE, OUTPUT_DELAY_BLOCKS,
};
pub use crate::room::spsc_ring::SpscRing;

// the no-allocation property test needs the instrumenting allocator in place
// for the whole test binary
#[cfg(all(test, debug_assertions))]
#[global_allocator]
static ALLOCATOR: assert_no_alloc::AllocDisabler = assert_no_alloc::AllocDisabler;
