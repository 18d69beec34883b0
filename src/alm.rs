//! Triangular harmonic-coefficient storage and the small spectral helpers
//! (`almxfl`, `alm2cl`, `synalm`) the filtering pipeline is built from.

use rand::Rng;
use rand_distr::StandardNormal;
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::errors::DelensError;

/// Layout of a triangular (lmax, mmax) coefficient array.
///
/// Coefficients are stored m-major: all degrees for m = 0, then m = 1, etc.
/// The index of (l, m) is `m (2 lmax + 1 - m) / 2 + l`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlmLayout
{
    pub lmax: usize,
    pub mmax: usize,
}

impl AlmLayout
{
    pub fn new(lmax: usize, mmax: usize) -> Self
    {
        Self { lmax, mmax: mmax.min(lmax) }
    }

    /// Layout with mmax = lmax.
    pub fn full(lmax: usize) -> Self
    {
        Self { lmax, mmax: lmax }
    }

    /// Number of coefficients held by this layout.
    pub fn size(&self) -> usize
    {
        (self.mmax + 1) * (self.lmax + 1) - (self.mmax * (self.mmax + 1)) / 2
    }

    #[inline]
    pub fn index(&self, l: usize, m: usize) -> usize
    {
        debug_assert!(m <= self.mmax && m <= l && l <= self.lmax);
        m * (2 * self.lmax + 1 - m) / 2 + l
    }

    /// Recover lmax from an array length, for a known mmax. The length must
    /// match the triangular count exactly; anything else is a contract error.
    pub fn lmax_of(size: usize, mmax: usize) -> Result<usize, DelensError>
    {
        let twice = 2 * size + mmax * (mmax + 1);
        if twice % (2 * (mmax + 1)) != 0 {
            return Err(DelensError::AlmSizeMismatch);
        }
        let lmax = twice / (2 * (mmax + 1)) - 1;
        if lmax < mmax {
            return Err(DelensError::AlmSizeMismatch);
        }
        Ok(lmax)
    }
}

/// A single spin component (gradient or curl) of a field on the sphere,
/// as a flat complex array over the layout's (l, m) triangle.
#[derive(Clone, Debug, PartialEq)]
pub struct HarmonicCoefficients
{
    pub layout: AlmLayout,
    coeffs: Vec<Complex64>,
}

impl HarmonicCoefficients
{
    pub fn zero(layout: AlmLayout) -> Self
    {
        Self { layout, coeffs: vec![Complex64::new(0.0, 0.0); layout.size()] }
    }

    /// Wrap an existing buffer. Length must match the layout.
    pub fn from_vec(layout: AlmLayout, coeffs: Vec<Complex64>) -> Result<Self, DelensError>
    {
        if coeffs.len() != layout.size() {
            return Err(DelensError::AlmSizeMismatch);
        }
        Ok(Self { layout, coeffs })
    }

    #[inline]
    pub fn get(&self, l: usize, m: usize) -> Complex64
    {
        self.coeffs[self.layout.index(l, m)]
    }

    #[inline]
    pub fn set(&mut self, l: usize, m: usize, v: Complex64)
    {
        let i = self.layout.index(l, m);
        self.coeffs[i] = v;
    }

    pub fn as_slice(&self) -> &[Complex64]
    {
        &self.coeffs
    }

    pub fn as_mut_slice(&mut self) -> &mut [Complex64]
    {
        &mut self.coeffs
    }

    /// Multiply each a_lm by fl[l], in place. Degrees beyond the end of `fl`
    /// are zeroed, matching the truncation convention of the spectral tools
    /// this mirrors.
    pub fn almxfl_inplace(&mut self, fl: &[f64])
    {
        for m in 0..=self.layout.mmax {
            for l in m..=self.layout.lmax {
                let i = self.layout.index(l, m);
                let f = if l < fl.len() { fl[l] } else { 0.0 };
                self.coeffs[i] *= f;
            }
        }
    }

    /// Multiplied copy, leaving `self` untouched.
    pub fn almxfl(&self, fl: &[f64]) -> Self
    {
        let mut out = self.clone();
        out.almxfl_inplace(fl);
        out
    }

    /// Cross power spectrum of two coefficient sets sharing a layout:
    /// `cl[l] = sum_m Re(a conj(b)) / (2l + 1)`, m > 0 counted twice.
    pub fn alm2cl(&self, other: &Self) -> Result<Vec<f64>, DelensError>
    {
        if self.layout != other.layout {
            return Err(DelensError::AlmSizeMismatch);
        }
        let lmax = self.layout.lmax;
        let mut cl = vec![0.0; lmax + 1];
        for l in 0..=lmax {
            let mut acc = (self.get(l, 0) * other.get(l, 0).conj()).re;
            for m in 1..=l.min(self.layout.mmax) {
                acc += 2.0 * (self.get(l, m) * other.get(l, m).conj()).re;
            }
            cl[l] = acc / (2 * l + 1) as f64;
        }
        Ok(cl)
    }

    /// Gaussian realization with power spectrum `cl` (zero beyond its end).
    /// The reality constraint makes m = 0 modes real with variance cl,
    /// m > 0 modes complex with variance cl/2 per part.
    pub fn synalm<R: Rng>(cl: &[f64], layout: AlmLayout, rng: &mut R) -> Self
    {
        let mut alm = Self::zero(layout);
        for m in 0..=layout.mmax {
            for l in m..=layout.lmax {
                let c = if l < cl.len() { cl[l].max(0.0) } else { 0.0 };
                let v = if m == 0 {
                    let g: f64 = rng.sample(StandardNormal);
                    Complex64::new(g * c.sqrt(), 0.0)
                } else {
                    let gr: f64 = rng.sample(StandardNormal);
                    let gi: f64 = rng.sample(StandardNormal);
                    Complex64::new(gr, gi) * (0.5 * c).sqrt()
                };
                alm.set(l, m, v);
            }
        }
        alm
    }

    // Vector-space helpers used by the solver seam.

    pub fn axpy(&mut self, a: f64, x: &Self)
    {
        for (s, x) in self.coeffs.iter_mut().zip(x.coeffs.iter()) {
            *s += *x * a;
        }
    }

    pub fn scale(&mut self, a: f64)
    {
        for s in self.coeffs.iter_mut() {
            *s *= a;
        }
    }

    pub fn fingerprint_into(&self, hasher: &mut impl std::hash::Hasher)
    {
        use std::hash::Hash;
        self.layout.hash(hasher);
        for c in &self.coeffs {
            c.re.to_bits().hash(hasher);
            c.im.to_bits().hash(hasher);
        }
    }
}

/// `1/x` where x is nonzero, 0 elsewhere. The spectral inverses in the
/// filters never divide by a vanishing power.
pub fn cli(cl: &[f64]) -> Vec<f64>
{
    cl.iter().map(|&c| if c != 0.0 { 1.0 / c } else { 0.0 }).collect()
}

/// Force a spectrum to length lmax + 1, padding with zeros.
pub fn extend_cl(cl: &[f64], lmax: usize) -> Vec<f64>
{
    let mut out = vec![0.0; lmax + 1];
    let n = cl.len().min(lmax + 1);
    out[..n].copy_from_slice(&cl[..n]);
    out
}

/// Constant spectrum of length lmax + 1.
pub fn flat_cl(value: f64, lmax: usize) -> Vec<f64>
{
    vec![value; lmax + 1]
}

#[cfg(test)]
mod tests
{
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn layout_size_and_index_roundtrip()
    {
        let layout = AlmLayout::new(10, 7);
        let mut seen = vec![false; layout.size()];
        for m in 0..=7 {
            for l in m..=10 {
                let i = layout.index(l, m);
                assert!(!seen[i]);
                seen[i] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(AlmLayout::lmax_of(layout.size(), 7).unwrap(), 10);
    }

    #[test]
    fn lmax_of_rejects_bad_sizes()
    {
        let layout = AlmLayout::full(32);
        assert!(AlmLayout::lmax_of(layout.size() + 1, 32).is_err());
    }

    #[test]
    fn almxfl_zeroes_beyond_filter()
    {
        let layout = AlmLayout::full(4);
        let mut alm = HarmonicCoefficients::zero(layout);
        for m in 0..=4 {
            for l in m..=4 {
                alm.set(l, m, Complex64::new(1.0, 1.0));
            }
        }
        alm.almxfl_inplace(&[1.0, 2.0, 3.0]);
        assert_eq!(alm.get(1, 1), Complex64::new(2.0, 2.0));
        assert_eq!(alm.get(3, 0), Complex64::new(0.0, 0.0));
    }

    #[test]
    fn synalm_power_tracks_input_spectrum()
    {
        let layout = AlmLayout::full(255);
        let cl = vec![2.0; 256];
        let mut rng = StdRng::seed_from_u64(7);
        let alm = HarmonicCoefficients::synalm(&cl, layout, &mut rng);
        let est = alm.alm2cl(&alm).unwrap();
        // average over the top degrees, where each cl has many modes
        let mean: f64 = est[200..].iter().sum::<f64>() / 56.0;
        assert!((mean - 2.0).abs() < 0.2, "mean {mean}");
    }
}
