//! Position-space legs of the lensing gradient/curl quadratic estimator.
//!
//! The estimator multiplies an inverse-variance-weighted residual leg with
//! a gradient leg built from the Wiener-filtered solution at spins 1 and 3,
//! combines them as spin (-2, +3) and (+2, -1) products - the second with a
//! relative minus sign that the recovered deflection sign depends on - and
//! projects the combination back to harmonic space as a spin-1 field with a
//! final -sqrt(l(l+1)) normalization.

use crate::alm::{AlmLayout, HarmonicCoefficients};
use crate::errors::DelensError;
use crate::geometry::AngularGrid;
use crate::sht::SpinTransform;

/// Gradient and curl components of a quadratic estimator.
#[derive(Debug)]
pub struct QlmOutput
{
    pub grad: HarmonicCoefficients,
    pub curl: HarmonicCoefficients,
}

/// Patch geometry and output layout for the position-space multiplication
/// of the estimator legs.
pub struct EstimatorBuilder<T: SpinTransform>
{
    backend: T,
    layout_qlm: AlmLayout,
}

impl<T: SpinTransform> EstimatorBuilder<T>
{
    pub fn new(backend: T, layout_qlm: AlmLayout) -> Self
    {
        Self { backend, layout_qlm }
    }

    pub fn grid(&self) -> &AngularGrid
    {
        self.backend.grid()
    }

    pub fn backend(&self) -> &T
    {
        &self.backend
    }

    pub fn layout_qlm(&self) -> AlmLayout
    {
        self.layout_qlm
    }

    /// Spin-1 projection of the combined leg product, with the final
    /// estimator normalization. `weighted` selects quadrature analysis
    /// (idealized filter) versus the plain adjoint (masked filter).
    pub fn project(
        &self,
        gc_re: Vec<f64>,
        gc_im: Vec<f64>,
        weighted: bool,
    ) -> Result<QlmOutput, DelensError>
    {
        let maps = vec![gc_re, gc_im];
        let mut alms = if weighted {
            self.backend.analysis(&maps, 1, self.layout_qlm)?
        } else {
            self.backend.adjoint_synthesis(&maps, 1, self.layout_qlm)?
        };
        let fl = qlm_normalization(self.layout_qlm.lmax);
        let curl = alms.pop().ok_or(DelensError::AlmSizeMismatch)?;
        let grad = alms.pop().ok_or(DelensError::AlmSizeMismatch)?;
        Ok(QlmOutput { grad: grad.almxfl(&fl), curl: curl.almxfl(&fl) })
    }
}

/// Degree weights of the Wiener-filtered gradient leg:
/// sqrt((l+2)(l-1)) at spin 1, sqrt((l-2)(l+3)) at spin 3, zero where the
/// degree is below the spin.
pub fn gradient_leg_weights(spin: usize, lmax: usize) -> Result<Vec<f64>, DelensError>
{
    let (i1, i2): (i64, i64) = match spin {
        1 => (2, -1),
        3 => (-2, 3),
        _ => return Err(DelensError::SpinNotSupported),
    };
    Ok((0..=lmax as i64)
        .map(|l| {
            if (l as usize) < spin {
                0.0
            } else {
                (((l + i1) * (l + i2)) as f64).sqrt()
            }
        })
        .collect())
}

/// Final normalization -sqrt(l(l+1)) applied to both estimator components.
pub fn qlm_normalization(lmax: usize) -> Vec<f64>
{
    (0..=lmax).map(|l| -((l * (l + 1)) as f64).sqrt()).collect()
}

/// Combine the residual leg with the spin-3 and spin-1 gradient legs:
/// `(res - i res_im)(G3 + i C3) - (res + i res_im)(G1 - i C1)`.
/// The relative minus sign on the second product is load-bearing.
pub fn combine_legs(
    res: (&[f64], &[f64]),
    leg3: (&[f64], &[f64]),
    leg1: (&[f64], &[f64]),
) -> (Vec<f64>, Vec<f64>)
{
    let n = res.0.len();
    let mut re = vec![0.0; n];
    let mut im = vec![0.0; n];
    for i in 0..n {
        let (rr, ri) = (res.0[i], res.1[i]);
        let (g3, c3) = (leg3.0[i], leg3.1[i]);
        let (g1, c1) = (leg1.0[i], leg1.1[i]);
        re[i] = rr * g3 + ri * c3 - (rr * g1 + ri * c1);
        im[i] = rr * c3 - ri * g3 - (ri * g1 - rr * c1);
    }
    (re, im)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn leg_weights_zero_undefined_degrees()
    {
        let w1 = gradient_leg_weights(1, 6).unwrap();
        assert_eq!(w1[0], 0.0);
        // sqrt((l+2)(l-1)) at l = 2: sqrt(4)
        assert!((w1[2] - 2.0).abs() < 1e-14);
        let w3 = gradient_leg_weights(3, 6).unwrap();
        assert_eq!(&w3[..3], &[0.0, 0.0, 0.0]);
        // sqrt((l-2)(l+3)) at l = 3: sqrt(6)
        assert!((w3[3] - 6f64.sqrt()).abs() < 1e-14);
        assert!(gradient_leg_weights(2, 6).is_err());
    }

    #[test]
    fn normalization_is_minus_sqrt_l_lp1()
    {
        let fl = qlm_normalization(4);
        assert_eq!(fl[0], 0.0);
        assert!((fl[3] + 12f64.sqrt()).abs() < 1e-14);
    }

    #[test]
    fn combine_legs_keeps_the_relative_minus_sign()
    {
        // res = 1 (real), legs real: GC = G3 - G1
        let res = (vec![1.0], vec![0.0]);
        let leg3 = (vec![5.0], vec![0.0]);
        let leg1 = (vec![2.0], vec![0.0]);
        let (re, im) = combine_legs((&res.0, &res.1), (&leg3.0, &leg3.1), (&leg1.0, &leg1.1));
        assert_eq!(re[0], 3.0);
        assert_eq!(im[0], 0.0);
        // purely imaginary residual flips into the imaginary part with
        // opposite signs between the two terms
        let res = (vec![0.0], vec![1.0]);
        let (re, im) = combine_legs((&res.0, &res.1), (&leg3.0, &leg3.1), (&leg1.0, &leg1.1));
        assert_eq!(re[0], 0.0);
        assert_eq!(im[0], -7.0);
    }
}
