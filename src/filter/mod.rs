//! Wiener-filtering operators: the capability seams consumed by the
//! conjugate-gradient solver, and the pieces shared between the idealized
//! harmonic-domain filter ([`iso`]) and the masked pixel-domain filter
//! ([`aniso`]).

pub mod aniso;
pub mod iso;

use crate::alm::{AlmLayout, HarmonicCoefficients};
use crate::errors::DelensError;
use crate::remapping::DeflectionEngine;
use crate::sht::SpinTransform;

/// A linear operator over harmonic coefficients. The solver depends only on
/// this interface, never on the concrete deflection or noise types behind
/// it. Mutability accommodates operators that fill caches as they run.
pub trait LinearOp
{
    fn apply(&mut self, x: &HarmonicCoefficients) -> Result<HarmonicCoefficients, DelensError>;
}

impl<F> LinearOp for F
where
    F: FnMut(&HarmonicCoefficients) -> Result<HarmonicCoefficients, DelensError>,
{
    fn apply(&mut self, x: &HarmonicCoefficients) -> Result<HarmonicCoefficients, DelensError>
    {
        self(x)
    }
}

/// Degree-weighted inner product over harmonic coefficients, restricted to
/// degrees >= lmin. Matches the pixel inner product under Parseval; the
/// floor excludes poorly constrained low multipoles from convergence tests.
#[derive(Copy, Clone, Debug)]
pub struct DotOp
{
    pub layout: AlmLayout,
    pub lmin: usize,
}

impl DotOp
{
    pub fn new(layout: AlmLayout, lmin: usize) -> Self
    {
        Self { layout, lmin }
    }

    pub fn dot(
        &self,
        a: &HarmonicCoefficients,
        b: &HarmonicCoefficients,
    ) -> Result<f64, DelensError>
    {
        if a.layout != self.layout || b.layout != self.layout {
            return Err(DelensError::AlmSizeMismatch);
        }
        let cl = a.alm2cl(b)?;
        Ok(cl
            .iter()
            .enumerate()
            .skip(self.lmin)
            .map(|(l, c)| (2 * l + 1) as f64 * c)
            .sum())
    }
}

/// One deflection instance for both lensing legs, or separate instances for
/// the E->E and E->B paths. Resolved at construction, never by comparing
/// references at run time.
pub enum DeflectionLegs<T: SpinTransform>
{
    Single(DeflectionEngine<T>),
    Dual
    {
        ee: DeflectionEngine<T>,
        eb: DeflectionEngine<T>,
    },
}

impl<T: SpinTransform> DeflectionLegs<T>
{
    pub fn is_dual(&self) -> bool
    {
        matches!(self, DeflectionLegs::Dual { .. })
    }

    pub fn ee(&mut self) -> &mut DeflectionEngine<T>
    {
        match self {
            DeflectionLegs::Single(e) => e,
            DeflectionLegs::Dual { ee, .. } => ee,
        }
    }

    pub fn eb(&mut self) -> &mut DeflectionEngine<T>
    {
        match self {
            DeflectionLegs::Single(e) => e,
            DeflectionLegs::Dual { eb, .. } => eb,
        }
    }

    pub fn ee_ref(&self) -> &DeflectionEngine<T>
    {
        match self {
            DeflectionLegs::Single(e) => e,
            DeflectionLegs::Dual { ee, .. } => ee,
        }
    }

    pub fn fingerprint(&self) -> u64
    {
        match self {
            DeflectionLegs::Single(e) => e.fingerprint(),
            DeflectionLegs::Dual { ee, eb } => ee.fingerprint() ^ eb.fingerprint().rotate_left(1),
        }
    }
}

/// Extend an effective inverse-noise spectrum to `lmax` by extrapolating the
/// logarithm of its positive tail with a least-squares quadratic. A hard
/// zero beyond the supplied range would make the diagonal preconditioner
/// singular at high degree.
pub fn extend_febl(febl: &[f64], lmax: usize) -> Vec<f64>
{
    if febl.len() > lmax {
        return febl[..=lmax].to_vec();
    }
    let pts: Vec<(f64, f64)> = febl
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > 0.0)
        .map(|(l, &v)| (l as f64, v.ln()))
        .collect();
    let (a, b, c) = quadratic_fit(&pts);
    let mut out = vec![0.0; lmax + 1];
    out[..febl.len()].copy_from_slice(febl);
    for l in febl.len()..=lmax {
        let x = l as f64;
        out[l] = (a + b * x + c * x * x).exp();
    }
    out
}

/// Least-squares quadratic a + b x + c x^2 through the given points, by the
/// 3x3 normal equations.
fn quadratic_fit(pts: &[(f64, f64)]) -> (f64, f64, f64)
{
    if pts.len() < 3 {
        let mean = if pts.is_empty() {
            0.0
        } else {
            pts.iter().map(|p| p.1).sum::<f64>() / pts.len() as f64
        };
        return (mean, 0.0, 0.0);
    }
    let mut s = [0.0; 5];
    let mut t = [0.0; 3];
    for &(x, y) in pts {
        let mut xp = 1.0;
        for (k, sk) in s.iter_mut().enumerate() {
            *sk += xp;
            if k < 3 {
                t[k] += y * xp;
            }
            xp *= x;
        }
    }
    let m = [[s[0], s[1], s[2]], [s[1], s[2], s[3]], [s[2], s[3], s[4]]];
    let det = |m: &[[f64; 3]; 3]| {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };
    let d = det(&m);
    if d.abs() < 1e-280 {
        return (t[0] / s[0].max(1.0), 0.0, 0.0);
    }
    let mut coeffs = [0.0; 3];
    for (k, coeff) in coeffs.iter_mut().enumerate() {
        let mut mk = m;
        for row in 0..3 {
            mk[row][k] = t[row];
        }
        *coeff = det(&mk) / d;
    }
    (coeffs[0], coeffs[1], coeffs[2])
}

/// Diagonal preconditioner (S^-1 + febl)^-1, zero where the prior power
/// vanishes.
pub struct PreOpDiag
{
    flmat: Vec<f64>,
    layout: AlmLayout,
}

impl PreOpDiag
{
    pub fn new(s_cls_ee: &[f64], layout: AlmLayout, febl: &[f64]) -> Result<Self, DelensError>
    {
        let lmax = layout.lmax;
        if s_cls_ee.len() <= lmax {
            return Err(DelensError::TransferLengthMismatch);
        }
        let febl = if febl.len() <= lmax {
            log::info!(
                "pre_op_diag: extending effective transfer from lmax {} to lmax {}",
                febl.len().saturating_sub(1),
                lmax
            );
            extend_febl(febl, lmax)
        } else {
            febl[..=lmax].to_vec()
        };
        let flmat: Vec<f64> = (0..=lmax)
            .map(|l| {
                let cl = s_cls_ee[l];
                if cl > 0.0 {
                    1.0 / (1.0 / cl + febl[l])
                } else {
                    0.0
                }
            })
            .collect();
        Ok(Self { flmat, layout })
    }
}

impl LinearOp for PreOpDiag
{
    fn apply(&mut self, x: &HarmonicCoefficients) -> Result<HarmonicCoefficients, DelensError>
    {
        if x.layout != self.layout {
            return Err(DelensError::AlmSizeMismatch);
        }
        Ok(x.almxfl(&self.flmat))
    }
}

/// Inverse prior spectrum: 1/cl where the power is positive, zero elsewhere
/// (those degrees are projected out of the solution, not divided by zero).
pub fn inverse_prior(s_cls_ee: &[f64], lmax: usize) -> Vec<f64>
{
    (0..=lmax)
        .map(|l| {
            let c = if l < s_cls_ee.len() { s_cls_ee[l] } else { 0.0 };
            if c > 0.0 {
                1.0 / c
            } else {
                0.0
            }
        })
        .collect()
}

/// Mask selecting degrees with positive prior power.
pub fn prior_mask(s_cls_ee: &[f64], lmax: usize) -> Vec<f64>
{
    (0..=lmax)
        .map(|l| if l < s_cls_ee.len() && s_cls_ee[l] > 0.0 { 1.0 } else { 0.0 })
        .collect()
}
