//! Denormal handling for the DSP thread.
//!
//! Long reverb decays drift into subnormal range, and subnormal arithmetic
//! is dramatically slower on x86. The worker thread holds one of these
//! guards for the duration of its DSP work; dropping it restores the
//! previous CPU mode. Purely a performance contract, the output is not
//! required to differ.

/// Scoped flush-to-zero / denormals-are-zero for the current thread (x86).
/// On other architectures this is a no-op sentinel.
pub struct DenormalGuard {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    old_csr: u32,
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl DenormalGuard {
    // MXCSR bits: DAZ (denormals-are-zero) = bit 6, FTZ (flush-to-zero) = bit 15
    const DAZ: u32 = 0x0040;
    const FTZ: u32 = 0x8000;

    pub fn new() -> Self {
        #[cfg(target_arch = "x86")]
        use core::arch::x86::{_mm_getcsr, _mm_setcsr};
        #[cfg(target_arch = "x86_64")]
        use core::arch::x86_64::{_mm_getcsr, _mm_setcsr};

        unsafe {
            let old_csr = _mm_getcsr();
            _mm_setcsr(old_csr | Self::DAZ | Self::FTZ);
            DenormalGuard { old_csr }
        }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl Drop for DenormalGuard {
    fn drop(&mut self) {
        #[cfg(target_arch = "x86")]
        use core::arch::x86::_mm_setcsr;
        #[cfg(target_arch = "x86_64")]
        use core::arch::x86_64::_mm_setcsr;

        unsafe {
            _mm_setcsr(self.old_csr);
        }
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
impl DenormalGuard {
    pub fn new() -> Self {
        DenormalGuard {}
    }
}

impl Default for DenormalGuard {
    fn default() -> Self {
        Self::new()
    }
}

// TEST TEST TEST
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_restores_mode() {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use core::arch::x86_64::_mm_getcsr;
            let before = _mm_getcsr();
            {
                let _guard = DenormalGuard::new();
                let during = _mm_getcsr();
                assert_eq!(during & 0x8040, 0x8040);
            }
            assert_eq!(_mm_getcsr(), before);
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _guard = DenormalGuard::new();
        }
    }
}
