use num_complex::Complex;

/// In-place radix-2 complex FFT for a fixed power-of-two size.
///
/// The "plan" is nothing more than the precomputed bit-reversal permutation
/// for the configured size. A zero or non-power-of-two size leaves the plan
/// empty, and both transforms become no-ops; the higher layers of this crate
/// only ever configure valid sizes.
pub struct Fft {
    size: usize,
    bit_reverse: Vec<usize>,
}

impl Fft {
    pub fn new(size: usize) -> Self {
        let mut fft = Fft {
            size: 0,
            bit_reverse: Vec::new(),
        };
        fft.resize(size);
        fft
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// reconfigure for a new transform size
    pub fn resize(&mut self, size: usize) {
        if size == self.size {
            return;
        }
        self.size = size;
        self.build_bit_reverse();
    }

    fn build_bit_reverse(&mut self) {
        self.bit_reverse.clear();
        if self.size == 0 || !self.size.is_power_of_two() {
            // leave empty, transform() will no-op
            return;
        }
        let bits = self.size.trailing_zeros();
        self.bit_reverse.reserve(self.size);
        for i in 0..self.size {
            let mut x = i;
            let mut r = 0;
            for _ in 0..bits {
                r = (r << 1) | (x & 1);
                x >>= 1;
            }
            self.bit_reverse.push(r);
        }
    }

    /// in-place forward transform, unscaled
    pub fn forward(&self, data: &mut [Complex<f32>]) {
        self.transform(data, false);
    }

    /// in-place inverse transform, scaled by 1/N
    pub fn inverse(&self, data: &mut [Complex<f32>]) {
        self.transform(data, true);
        if self.size == 0 || data.len() != self.size || self.bit_reverse.is_empty() {
            return;
        }
        let inv_n = 1.0 / self.size as f32;
        for v in data.iter_mut() {
            *v *= inv_n;
        }
    }

    fn transform(&self, data: &mut [Complex<f32>], inverse: bool) {
        if self.size == 0 || data.len() != self.size || self.bit_reverse.is_empty() {
            return;
        }

        // bit-reversal permutation
        for i in 0..self.size {
            let j = self.bit_reverse[i];
            if j > i {
                data.swap(i, j);
            }
        }

        // iterative Cooley-Tukey butterflies
        let mut len = 2;
        while len <= self.size {
            let ang_sign = if inverse { 1.0 } else { -1.0 };
            let ang_step = ang_sign * (2.0 * std::f32::consts::PI / len as f32);
            let w_len = Complex::new(ang_step.cos(), ang_step.sin());
            let half = len >> 1;

            let mut i = 0;
            while i < self.size {
                let mut w = Complex::new(1.0, 0.0);
                for j in 0..half {
                    let u = data[i + j];
                    let v = data[i + j + half] * w;
                    data[i + j] = u + v;
                    data[i + j + half] = u - v;
                    w *= w_len;
                }
                i += len;
            }
            len <<= 1;
        }
    }
}

// TEST TEST TEST
#[cfg(test)]
mod tests {
    // Note this useful idiom: importing names from outer (for mod tests) scope.
    use super::*;

    fn rms(data: &[Complex<f32>]) -> f32 {
        let sum: f32 = data.iter().map(|v| v.norm_sqr()).sum();
        (sum / data.len() as f32).sqrt()
    }

    #[test]
    fn test_fft_roundtrip_all_sizes() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        let mut n = 2;
        while n <= 4096 {
            let fft = Fft::new(n);
            let orig: Vec<Complex<f32>> = (0..n)
                .map(|_| Complex::new(rng.f32() * 2.0 - 1.0, 0.0))
                .collect();
            // keep the norm bounded like real audio blocks
            let scale = 1.0 / (n as f32).sqrt();
            let orig: Vec<Complex<f32>> = orig.iter().map(|v| *v * scale).collect();

            let mut data = orig.clone();
            fft.forward(&mut data);
            fft.inverse(&mut data);

            let mut err = 0.0f32;
            for (a, b) in data.iter().zip(orig.iter()) {
                err += (*a - *b).norm_sqr();
            }
            let err_rms = (err / n as f32).sqrt();
            assert!(
                err_rms < 1e-3 * rms(&orig).max(1e-6),
                "roundtrip error too large for N={}: {}",
                n,
                err_rms
            );
            n <<= 1;
        }
    }

    #[test]
    fn test_fft_matches_naive_dft() {
        let n = 64;
        let fft = Fft::new(n);
        let mut data: Vec<Complex<f32>> = (0..n)
            .map(|i| Complex::new((i as f32 * 0.7).sin(), 0.0))
            .collect();
        let orig = data.clone();
        fft.forward(&mut data);

        for k in 0..n {
            let mut acc = Complex::new(0.0f64, 0.0f64);
            for (i, v) in orig.iter().enumerate() {
                let ang = -2.0 * std::f64::consts::PI * (k * i) as f64 / n as f64;
                acc += Complex::new(v.re as f64, v.im as f64)
                    * Complex::new(ang.cos(), ang.sin());
            }
            assert_approx_eq::assert_approx_eq!(data[k].re, acc.re as f32, 1e-3);
            assert_approx_eq::assert_approx_eq!(data[k].im, acc.im as f32, 1e-3);
        }
    }

    #[test]
    fn test_fft_invalid_sizes_are_noops() {
        for bad in [0usize, 3, 12, 100] {
            let fft = Fft::new(bad);
            let mut data = vec![Complex::new(1.0f32, 0.0); bad];
            let orig = data.clone();
            fft.forward(&mut data);
            assert_eq!(data, orig);
            fft.inverse(&mut data);
            assert_eq!(data, orig);
        }

        // length mismatch is a no-op as well
        let fft = Fft::new(8);
        let mut data = vec![Complex::new(1.0f32, 0.0); 4];
        let orig = data.clone();
        fft.forward(&mut data);
        assert_eq!(data, orig);
    }

    #[test]
    fn test_fft_impulse_spectrum_is_flat() {
        let n = 16;
        let fft = Fft::new(n);
        let mut data = vec![Complex::new(0.0f32, 0.0); n];
        data[0] = Complex::new(1.0, 0.0);
        fft.forward(&mut data);
        for v in &data {
            assert_approx_eq::assert_approx_eq!(v.re, 1.0, 1e-5);
            assert_approx_eq::assert_approx_eq!(v.im, 0.0, 1e-5);
        }
    }
}
