use num_complex::Complex;

use crate::dsp::fft::Fft;

/// One channel of one impulse response, partitioned into equal-size blocks
/// and stored in the frequency domain (partition 0 = earliest IR samples).
#[derive(Clone, Default)]
pub struct ConvolutionKernel {
    pub partitions: Vec<Vec<Complex<f32>>>,
}

impl ConvolutionKernel {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// tail length in time-domain samples covered by this kernel
    pub fn tail_len(&self, block_size: usize) -> usize {
        self.partitions.len() * block_size
    }
}

/// Uniformly partitioned overlap-add convolution.
///
/// The convolver owns the frequency-domain input history ring; overlap
/// buffers are owned by the caller and passed into [`convolve`], so several
/// kernels (stereo sides, crossfade sides) can run against the same input
/// history within one block.
///
/// [`convolve`]: PartitionedConvolver::convolve
pub struct PartitionedConvolver {
    block_size: usize,
    fft_size: usize,
    ring_size: usize,
    ring_idx: usize,
    input_ring: Vec<Vec<Complex<f32>>>,
    work: Vec<Complex<f32>>,
    acc: Vec<Complex<f32>>,
    fft: Fft,
}

impl PartitionedConvolver {
    pub fn new() -> Self {
        PartitionedConvolver {
            block_size: 0,
            fft_size: 0,
            ring_size: 0,
            ring_idx: 0,
            input_ring: Vec::new(),
            work: Vec::new(),
            acc: Vec::new(),
            fft: Fft::new(0),
        }
    }

    /// Allocate for a block size, FFT size (2x the block size for
    /// overlap-add) and ring capacity (>= the largest kernel partition count
    /// that will ever be convolved against this history).
    pub fn configure(&mut self, block_size: usize, fft_size: usize, max_partitions: usize) {
        self.block_size = block_size;
        self.fft_size = fft_size;
        self.ring_size = max_partitions.max(1);
        self.ring_idx = 0;

        self.fft.resize(fft_size);

        self.input_ring = vec![vec![Complex::new(0.0, 0.0); fft_size]; self.ring_size];
        self.work = vec![Complex::new(0.0, 0.0); fft_size];
        self.acc = vec![Complex::new(0.0, 0.0); fft_size];
    }

    /// clears the input history, keeps the configuration
    pub fn reset(&mut self) {
        for frame in &mut self.input_ring {
            frame.fill(Complex::new(0.0, 0.0));
        }
        self.ring_idx = 0;
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Commit one block of time-domain input: zero-pad to the FFT size,
    /// forward-transform and store in the history ring.
    pub fn push_input_block(&mut self, input: &[f32]) {
        if input.len() < self.block_size
            || self.block_size == 0
            || self.fft_size == 0
            || self.input_ring.is_empty()
        {
            return;
        }

        for i in 0..self.block_size {
            self.work[i] = Complex::new(input[i], 0.0);
        }
        for i in self.block_size..self.fft_size {
            self.work[i] = Complex::new(0.0, 0.0);
        }
        self.fft.forward(&mut self.work);

        self.input_ring[self.ring_idx].copy_from_slice(&self.work);
        self.ring_idx = (self.ring_idx + 1) % self.ring_size;
    }

    /// Convolve the committed history against `kernel`, writing one block of
    /// output. `overlap` carries the tail of the previous inverse transform
    /// and is updated for the next call; it belongs to the (kernel, channel)
    /// pair, not to the convolver.
    ///
    /// An empty kernel zeroes the output and leaves the overlap untouched.
    /// Partitions whose bin count does not match the FFT size are skipped.
    pub fn convolve(&mut self, kernel: &ConvolutionKernel, out: &mut [f32], overlap: &mut [f32]) {
        if self.block_size == 0
            || self.fft_size == 0
            || self.input_ring.is_empty()
            || out.len() < self.block_size
            || overlap.len() < self.block_size
        {
            return;
        }
        if kernel.partitions.is_empty() {
            out[..self.block_size].fill(0.0);
            return;
        }

        self.acc.fill(Complex::new(0.0, 0.0));

        // ring_idx points at the next write; the most recent block sits one
        // slot behind it, the block from p blocks ago p+1 slots behind.
        for (p, h) in kernel.partitions.iter().enumerate().take(self.ring_size) {
            if h.len() != self.fft_size {
                continue;
            }
            let idx = (self.ring_idx + self.ring_size - 1 - p) % self.ring_size;
            let x = &self.input_ring[idx];
            for k in 0..self.fft_size {
                self.acc[k] += x[k] * h[k];
            }
        }

        self.work.copy_from_slice(&self.acc);
        self.fft.inverse(&mut self.work);

        // overlap-add: first half goes out, second half is kept for the next block
        for i in 0..self.block_size {
            out[i] = self.work[i].re + overlap[i];
            overlap[i] = self.work[i + self.block_size].re;
        }
    }

    /// Partition a time-domain IR into ceil(|ir| / block_size) blocks,
    /// zero-pad each to the FFT size and forward-transform.
    pub fn build_kernel_from_ir(ir: &[f32], block_size: usize, fft_size: usize) -> ConvolutionKernel {
        let mut kernel = ConvolutionKernel::default();
        if ir.is_empty() || block_size == 0 || fft_size == 0 {
            return kernel;
        }

        let part_count = ir.len().div_ceil(block_size);
        let fft = Fft::new(fft_size);
        let mut time = vec![Complex::new(0.0, 0.0); fft_size];

        kernel.partitions.reserve(part_count);
        for p in 0..part_count {
            let offset = p * block_size;
            let copy_count = block_size.min(ir.len() - offset);

            for i in 0..copy_count {
                time[i] = Complex::new(ir[offset + i], 0.0);
            }
            for t in time.iter_mut().skip(copy_count) {
                *t = Complex::new(0.0, 0.0);
            }

            let mut freq = time.clone();
            fft.forward(&mut freq);
            kernel.partitions.push(freq);
        }
        kernel
    }
}

impl Default for PartitionedConvolver {
    fn default() -> Self {
        Self::new()
    }
}

// TEST TEST TEST
#[cfg(test)]
mod tests {
    // Note this useful idiom: importing names from outer (for mod tests) scope.
    use super::*;

    #[test]
    fn test_impulse_through_unit_ir() {
        let block = 8;
        let fft_size = 16;
        let ir = vec![1.0f32];
        let kernel = PartitionedConvolver::build_kernel_from_ir(&ir, block, fft_size);

        let mut conv = PartitionedConvolver::new();
        conv.configure(block, fft_size, kernel.partitions.len());

        let mut input = [0.0f32; 8];
        input[0] = 1.0;
        let mut out = [0.0f32; 8];
        let mut overlap = [0.0f32; 8];

        conv.push_input_block(&input);
        conv.convolve(&kernel, &mut out, &mut overlap);
        assert_approx_eq::assert_approx_eq!(out[0], 1.0, 1e-4);
        for v in &out[1..] {
            assert_approx_eq::assert_approx_eq!(*v, 0.0, 1e-4);
        }

        // zero blocks from here on produce silence
        let zeros = [0.0f32; 8];
        for _ in 0..4 {
            conv.push_input_block(&zeros);
            conv.convolve(&kernel, &mut out, &mut overlap);
            for v in &out {
                assert_approx_eq::assert_approx_eq!(*v, 0.0, 1e-4);
            }
        }
    }

    #[test]
    fn test_impulse_reproduces_multi_partition_ir() {
        let block = 8;
        let fft_size = 16;
        let ir = vec![
            1.0f32, 0.5, 0.25, 0.0, 0.0, 0.1, 0.0, 0.0, 0.05, 0.0, 0.0, 0.0,
        ];
        let kernel = PartitionedConvolver::build_kernel_from_ir(&ir, block, fft_size);
        assert_eq!(kernel.partitions.len(), 2);

        let mut conv = PartitionedConvolver::new();
        conv.configure(block, fft_size, kernel.partitions.len());
        conv.reset();

        let mut input = [0.0f32; 8];
        input[0] = 1.0;
        let mut out = [0.0f32; 8];
        let mut overlap = [0.0f32; 8];

        conv.push_input_block(&input);
        conv.convolve(&kernel, &mut out, &mut overlap);
        for i in 0..block {
            let expected = if i < ir.len() { ir[i] } else { 0.0 };
            assert_approx_eq::assert_approx_eq!(out[i], expected, 1e-4);
        }

        let zeros = [0.0f32; 8];
        conv.push_input_block(&zeros);
        conv.convolve(&kernel, &mut out, &mut overlap);
        for i in 0..block {
            let ir_idx = block + i;
            let expected = if ir_idx < ir.len() { ir[ir_idx] } else { 0.0 };
            assert_approx_eq::assert_approx_eq!(out[i], expected, 1e-4);
        }
    }

    #[test]
    fn test_partitioned_equals_direct_convolution() {
        let block = 8;
        let fft_size = 16;
        let mut rng = fastrand::Rng::with_seed(77);

        let ir: Vec<f32> = (0..4 * block).map(|_| rng.f32() * 2.0 - 1.0).collect();
        let x: Vec<f32> = (0..8 * block).map(|_| rng.f32() * 2.0 - 1.0).collect();

        // direct time-domain convolution, first |x| samples
        let mut direct = vec![0.0f32; x.len()];
        for (n, d) in direct.iter_mut().enumerate() {
            let mut acc = 0.0f64;
            for (k, h) in ir.iter().enumerate() {
                if n >= k {
                    acc += *h as f64 * x[n - k] as f64;
                }
            }
            *d = acc as f32;
        }

        let kernel = PartitionedConvolver::build_kernel_from_ir(&ir, block, fft_size);
        let mut conv = PartitionedConvolver::new();
        conv.configure(block, fft_size, kernel.partitions.len());

        let mut out = vec![0.0f32; block];
        let mut overlap = vec![0.0f32; block];
        for (b, chunk) in x.chunks_exact(block).enumerate() {
            conv.push_input_block(chunk);
            conv.convolve(&kernel, &mut out, &mut overlap);
            for i in 0..block {
                assert_approx_eq::assert_approx_eq!(out[i], direct[b * block + i], 1e-3);
            }
        }
    }

    #[test]
    fn test_empty_kernel_zeroes_output_keeps_overlap() {
        let mut conv = PartitionedConvolver::new();
        conv.configure(8, 16, 4);

        let input = [1.0f32; 8];
        conv.push_input_block(&input);

        let mut out = [9.0f32; 8];
        let mut overlap = [0.5f32; 8];
        conv.convolve(&ConvolutionKernel::default(), &mut out, &mut overlap);
        for v in &out {
            assert_approx_eq::assert_approx_eq!(*v, 0.0, 1e-6);
        }
        for v in &overlap {
            assert_approx_eq::assert_approx_eq!(*v, 0.5, 1e-6);
        }
    }

    #[test]
    fn test_mismatched_partition_is_skipped() {
        let block = 8;
        let fft_size = 16;
        let ir = vec![1.0f32];
        let mut kernel = PartitionedConvolver::build_kernel_from_ir(&ir, block, fft_size);
        // a partition with the wrong bin count must not contribute or crash
        kernel.partitions.push(vec![Complex::new(1.0, 0.0); 4]);

        let mut conv = PartitionedConvolver::new();
        conv.configure(block, fft_size, 4);

        let mut input = [0.0f32; 8];
        input[0] = 1.0;
        let mut out = [0.0f32; 8];
        let mut overlap = [0.0f32; 8];
        conv.push_input_block(&input);
        conv.convolve(&kernel, &mut out, &mut overlap);
        assert_approx_eq::assert_approx_eq!(out[0], 1.0, 1e-4);
    }
}
