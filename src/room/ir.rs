use crate::dsp::convolution_reverb::StereoConvolutionKernel;

/// Raw IR audio for one room, non-interleaved, samples in [-1, 1].
pub struct IrSamples {
    /// native sample rate the IR was recorded at
    pub sample_rate: u32,
    pub left: Vec<f32>,
    /// None for mono IRs
    pub right: Option<Vec<f32>>,
}

/// Capability handed to the room processor at construction; the processor
/// never reaches into a global IR table.
pub trait IrProvider {
    fn count(&self) -> usize;
    fn samples(&self, index: usize) -> Option<IrSamples>;
}

// right channels this close to the left are collapsed to mono, which buys
// back a full convolver per stage
const DUAL_MONO_RMS_RATIO: f64 = 1e-3;

/// Linear-interpolation resample to the engine rate. Quality beyond lerp is
/// out of scope for IR material.
pub fn resample_linear(samples: &[f32], from_rate: f64, to_rate: f64) -> Vec<f32> {
    if samples.is_empty() || from_rate <= 0.0 || to_rate <= 0.0 {
        return samples.to_vec();
    }
    if (from_rate - to_rate).abs() < 1e-9 {
        return samples.to_vec();
    }

    let out_len = ((samples.len() as f64) * to_rate / from_rate).round().max(1.0) as usize;
    let step = from_rate / to_rate;

    let mut out = Vec::with_capacity(out_len);
    let mut pos = 0.0f64;
    for _ in 0..out_len {
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let s0 = samples.get(idx).copied().unwrap_or(0.0);
        let s1 = samples.get(idx + 1).copied().unwrap_or(0.0);
        out.push(s0 * (1.0 - frac) + s1 * frac);
        pos += step;
    }
    out
}

/// True when the right channel carries no information of its own:
/// L-R difference RMS below 1e-3 of the overall RMS.
pub fn is_dual_mono(left: &[f32], right: &[f32]) -> bool {
    if left.len() != right.len() || left.is_empty() {
        return false;
    }
    let mut diff_sq = 0.0f64;
    let mut total_sq = 0.0f64;
    for (l, r) in left.iter().zip(right.iter()) {
        diff_sq += ((*l - *r) as f64).powi(2);
        total_sq += (*l as f64).powi(2) + (*r as f64).powi(2);
    }
    if total_sq <= 0.0 {
        return true;
    }
    let diff_rms = (diff_sq / left.len() as f64).sqrt();
    let total_rms = (total_sq / (2 * left.len()) as f64).sqrt();
    diff_rms < DUAL_MONO_RMS_RATIO * total_rms
}

/// Build the full kernel list for an engine sample rate. An IR the provider
/// cannot deliver becomes an empty (silent) kernel so the indices stay
/// stable.
pub fn build_kernels_for_rate(
    provider: &dyn IrProvider,
    sample_rate: f64,
) -> Vec<StereoConvolutionKernel> {
    (0..provider.count())
        .map(|index| match provider.samples(index) {
            Some(ir) => {
                let native = ir.sample_rate as f64;
                let left = resample_linear(&ir.left, native, sample_rate);
                let right = ir
                    .right
                    .as_ref()
                    .filter(|r| !is_dual_mono(&ir.left, r.as_slice()))
                    .map(|r| resample_linear(r, native, sample_rate));
                StereoConvolutionKernel::from_channels(&left, right.as_deref())
            }
            None => StereoConvolutionKernel::default(),
        })
        .collect()
}
