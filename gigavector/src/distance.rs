//! Distance kernels: L2, cosine, dot-product, with runtime SIMD dispatch.
//!
//! Each kernel has a safe scalar implementation and, on x86_64, an AVX2
//! implementation selected once per process via [`std::sync::OnceLock`] and
//! `is_x86_feature_detected!`. Both are required to agree up to float
//! summation order: tests accept `|delta| <= 1e-5 * dim`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Distance metrics supported by the indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Cosine similarity. Range `[-1, 1]`; `1.0` means identical direction.
    Cosine,
    /// Euclidean (L2) distance. Range `[0, inf)`; `0.0` means identical vectors.
    Euclidean,
    /// Dot product. Unbounded; higher means more similar for normalised inputs.
    DotProduct,
}

impl DistanceMetric {
    /// Raw metric value, exactly as defined in §4.1.
    pub fn calculate(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        check_dims(a, b)?;
        Ok(match self {
            DistanceMetric::Cosine => cosine(a, b),
            DistanceMetric::Euclidean => l2(a, b),
            DistanceMetric::DotProduct => dot(a, b),
        })
    }

    /// `true` when a larger raw score means "more similar" (Cosine, DotProduct).
    pub fn higher_is_better(&self) -> bool {
        matches!(self, DistanceMetric::Cosine | DistanceMetric::DotProduct)
    }

    /// Monotonic transform of `calculate` such that **lower always means
    /// more similar**, regardless of metric. Indices rank candidates by
    /// this value so beams, heaps, and final top-k ordering behave
    /// identically across metrics.
    pub fn rank(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        let score = self.calculate(a, b)?;
        Ok(if self.higher_is_better() {
            1.0 - score
        } else {
            score
        })
    }
}

fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

/// Euclidean (L2) distance between two equal-length slices.
#[inline]
pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    dispatch().l2(a, b).sqrt()
}

/// Cosine similarity between two equal-length slices.
///
/// Returns `0.0` when either input has zero magnitude.
#[inline]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let d = dot(a, b);
    let ma = magnitude(a);
    let mb = magnitude(b);
    if ma == 0.0 || mb == 0.0 {
        return 0.0;
    }
    d / (ma * mb)
}

/// Dot product of two equal-length slices.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    dispatch().dot(a, b)
}

/// L2 norm of a single vector.
#[inline]
pub fn magnitude(v: &[f32]) -> f32 {
    dispatch().dot(v, v).sqrt()
}

/// Normalise a vector to unit length in place. No-op on a zero vector.
pub fn normalize(v: &mut [f32]) {
    let mag = magnitude(v);
    if mag > 0.0 {
        for x in v.iter_mut() {
            *x /= mag;
        }
    }
}

/// The kernel set selected for this process: widest SIMD width the CPU
/// supports, with a scalar fallback. Selection happens once.
#[derive(Debug, Clone, Copy)]
enum Kernels {
    Scalar,
    #[cfg(target_arch = "x86_64")]
    Avx2,
}

static KERNELS: OnceLock<Kernels> = OnceLock::new();

fn dispatch() -> Kernels {
    *KERNELS.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return Kernels::Avx2;
            }
        }
        Kernels::Scalar
    })
}

impl Kernels {
    /// Sum of squared differences (not yet square-rooted).
    #[inline]
    fn l2(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            #[cfg(target_arch = "x86_64")]
            Kernels::Avx2 => unsafe { avx2::l2_sq(a, b) },
            Kernels::Scalar => scalar::l2_sq(a, b),
        }
    }

    #[inline]
    fn dot(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            #[cfg(target_arch = "x86_64")]
            Kernels::Avx2 => unsafe { avx2::dot(a, b) },
            Kernels::Scalar => scalar::dot(a, b),
        }
    }
}

mod scalar {
    #[inline]
    pub fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum()
    }

    #[inline]
    pub fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    /// # Safety
    /// Caller must have verified `avx2` and `fma` are available
    /// (`dispatch` only selects this kernel after `is_x86_feature_detected!`).
    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn dot(a: &[f32], b: &[f32]) -> f32 {
        unsafe {
            debug_assert_eq!(a.len(), b.len());
            let len = a.len();
            let mut acc = _mm256_setzero_ps();
            let lanes = 8;
            let chunks = len / lanes;

            for i in 0..chunks {
                let off = i * lanes;
                let va = _mm256_loadu_ps(a.as_ptr().add(off));
                let vb = _mm256_loadu_ps(b.as_ptr().add(off));
                acc = _mm256_fmadd_ps(va, vb, acc);
            }

            let mut buf = [0f32; 8];
            _mm256_storeu_ps(buf.as_mut_ptr(), acc);
            let mut total: f32 = buf.iter().sum();

            for i in (chunks * lanes)..len {
                total += a[i] * b[i];
            }
            total
        }
    }

    /// # Safety
    /// Same preconditions as [`dot`].
    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
        unsafe {
            debug_assert_eq!(a.len(), b.len());
            let len = a.len();
            let mut acc = _mm256_setzero_ps();
            let lanes = 8;
            let chunks = len / lanes;

            for i in 0..chunks {
                let off = i * lanes;
                let va = _mm256_loadu_ps(a.as_ptr().add(off));
                let vb = _mm256_loadu_ps(b.as_ptr().add(off));
                let diff = _mm256_sub_ps(va, vb);
                acc = _mm256_fmadd_ps(diff, diff, acc);
            }

            let mut buf = [0f32; 8];
            _mm256_storeu_ps(buf.as_mut_ptr(), acc);
            let mut total: f32 = buf.iter().sum();

            for i in (chunks * lanes)..len {
                let d = a[i] - b[i];
                total += d * d;
            }
            total
        }
    }
}
