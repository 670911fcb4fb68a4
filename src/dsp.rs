pub mod convolution_reverb;
pub mod denormals;
pub mod fft;
pub mod partitioned_convolver;

/// Coefficient for a one-pole smoother with the given time constant.
/// Degenerate rates or times return 1.0 (no smoothing).
pub fn one_pole_alpha(sample_rate: f64, time_seconds: f64) -> f32 {
    if sample_rate <= 0.0 || time_seconds <= 0.0 {
        return 1.0;
    }
    let a = 1.0 - (-1.0 / (sample_rate * time_seconds)).exp();
    a.clamp(0.0, 1.0) as f32
}
