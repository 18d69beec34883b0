//! Idealized full-sky filter: homogeneous (or colored) noise levels make
//! the noise operator diagonal in harmonic space, so the whole pipeline
//! stays in coefficient space. Mode exclusions are expressed by zeroing the
//! transfer function; the Elm/Blm arrays keep their formal layout.

use rand::Rng;
use std::f64::consts::PI;
use std::hash::Hasher;

use crate::alm::{cli, extend_cl, flat_cl, AlmLayout, HarmonicCoefficients};
use crate::errors::DelensError;
use crate::estimator::{combine_legs, gradient_leg_weights, EstimatorBuilder, QlmOutput};
use crate::filter::{inverse_prior, prior_mask, DotOp, PreOpDiag};
use crate::remapping::DeflectionEngine;
use crate::sht::SpinTransform;
use crate::solver::{self, CgParams, CgReport};

const AMIN_TO_RAD: f64 = PI / 180.0 / 60.0;

/// Noise level input: one value for white noise, or a spectrum matching the
/// transfer function length for colored noise.
fn extend_nlev(nlev: &[f64], lmax: usize) -> Vec<f64>
{
    if nlev.len() == 1 {
        flat_cl(nlev[0], lmax)
    } else {
        extend_cl(nlev, lmax)
    }
}

/// Wiener/inverse-variance filter for full-sky maps with homogeneous noise
/// levels, inclusive of the lensing remapping.
pub struct IsoFilter<T: SpinTransform>
{
    ffi: DeflectionEngine<T>,
    layout_sol: AlmLayout,
    layout_len: AlmLayout,
    transf_elm: Vec<f64>,
    transf_blm: Vec<f64>,
    inoise_2_elm: Vec<f64>,
    inoise_1_elm: Vec<f64>,
    inoise_2_blm: Vec<f64>,
    inoise_1_blm: Vec<f64>,
    nlev_elm: Vec<f64>,
    nlev_blm: Vec<f64>,
    /// Include the EE-like term in the generalized QE.
    wee: bool,
}

impl<T: SpinTransform> IsoFilter<T>
{
    /// `nlev_e`/`nlev_b` are polarization noise levels in uK-arcmin (single
    /// value = white); `transf` the E transfer function (B defaults to it);
    /// `unlalm_info`/`lenalm_info` the (lmax, mmax) of the unlensed and
    /// lensed coefficients.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nlev_e: &[f64],
        ffi: DeflectionEngine<T>,
        transf: &[f64],
        unlalm_info: (usize, usize),
        lenalm_info: (usize, usize),
        transf_b: Option<&[f64]>,
        nlev_b: Option<&[f64]>,
        wee: bool,
    ) -> Result<Self, DelensError>
    {
        if transf.is_empty() {
            return Err(DelensError::TransferLengthMismatch);
        }
        let lmax_transf = transf.len().max(transf_b.map_or(0, |t| t.len())) - 1;
        let lmax_len = lenalm_info.0.min(lmax_transf);
        let mmax_len = lenalm_info.1.min(lmax_len);
        let layout_sol = AlmLayout::new(unlalm_info.0, unlalm_info.1);
        let layout_len = AlmLayout::new(lmax_len, mmax_len);

        let transf_elm = extend_cl(transf, lmax_len);
        let transf_blm = extend_cl(transf_b.unwrap_or(transf), lmax_len);
        let nlev_elm = extend_nlev(nlev_e, lmax_len);
        let nlev_blm = extend_nlev(nlev_b.unwrap_or(nlev_e), lmax_len);

        let inoise = |transf: &[f64], nlev: &[f64], power: i32| -> Vec<f64> {
            (0..=lmax_len)
                .map(|l| {
                    let n2 = nlev[l] * nlev[l] * AMIN_TO_RAD * AMIN_TO_RAD;
                    if n2 > 0.0 {
                        transf[l].powi(power) / n2
                    } else {
                        0.0
                    }
                })
                .collect()
        };
        Ok(Self {
            inoise_2_elm: inoise(&transf_elm, &nlev_elm, 2),
            inoise_1_elm: inoise(&transf_elm, &nlev_elm, 1),
            inoise_2_blm: inoise(&transf_blm, &nlev_blm, 2),
            inoise_1_blm: inoise(&transf_blm, &nlev_blm, 1),
            transf_elm,
            transf_blm,
            nlev_elm,
            nlev_blm,
            ffi,
            layout_sol,
            layout_len,
            wee,
        })
    }

    pub fn layout_sol(&self) -> AlmLayout
    {
        self.layout_sol
    }

    pub fn layout_len(&self) -> AlmLayout
    {
        self.layout_len
    }

    pub fn deflection(&self) -> &DeflectionEngine<T>
    {
        &self.ffi
    }

    /// Swap in the deflection of the next reconstruction iteration.
    pub fn set_deflection(&mut self, ffi: DeflectionEngine<T>)
    {
        self.ffi = ffi;
    }

    /// Effective (transfer/noise)^2 spectra for E and B.
    pub fn get_febl(&self) -> (Vec<f64>, Vec<f64>)
    {
        (self.inoise_2_elm.clone(), self.inoise_2_blm.clone())
    }

    pub fn dot_op(&self) -> DotOp
    {
        DotOp::new(self.layout_sol, 0)
    }

    pub fn fingerprint(&self) -> u64
    {
        let mut h = rustc_hash::FxHasher::default();
        for v in self.transf_elm.iter().chain(&self.transf_blm) {
            h.write_u64(v.to_bits());
        }
        for v in self.nlev_elm.iter().chain(&self.nlev_blm) {
            h.write_u64(v.to_bits());
        }
        h.write_u64(self.ffi.fingerprint());
        h.finish()
    }

    fn zero_sol(&self) -> HarmonicCoefficients
    {
        HarmonicCoefficients::zero(self.layout_sol)
    }

    /// Applies D^t B^t N^-1 B D, in place on the solution-space field.
    pub fn apply_alm(&mut self, elm: &mut HarmonicCoefficients) -> Result<(), DelensError>
    {
        if elm.layout != self.layout_sol {
            return Err(DelensError::AlmSizeMismatch);
        }
        let zero = self.zero_sol();
        let mut eblm = self.ffi.remap(elm, Some(&zero), 2, self.layout_len, false)?;
        eblm[0].almxfl_inplace(&self.inoise_2_elm);
        eblm[1].almxfl_inplace(&self.inoise_2_blm);
        let out = self.ffi.remap(&eblm[0], Some(&eblm[1]), 2, self.layout_sol, true)?;
        *elm = out.into_iter().next().ok_or(DelensError::AlmSizeMismatch)?;
        Ok(())
    }

    /// Harmonic-domain noise weighting of a lensed-space pair, in place.
    pub fn apply_map(&self, eblm: &mut [HarmonicCoefficients; 2]) -> Result<(), DelensError>
    {
        if eblm[0].layout != self.layout_len || eblm[1].layout != self.layout_len {
            return Err(DelensError::AlmSizeMismatch);
        }
        let icl_transf = cli(&self.transf_elm);
        let fl_e: Vec<f64> =
            self.inoise_1_elm.iter().zip(&icl_transf).map(|(a, b)| a * b).collect();
        let fl_b: Vec<f64> =
            self.inoise_1_blm.iter().zip(&icl_transf).map(|(a, b)| a * b).collect();
        eblm[0].almxfl_inplace(&fl_e);
        eblm[1].almxfl_inplace(&fl_b);
        Ok(())
    }

    /// Right-hand side of the normal equation: D^t B^t N^-1 applied to the
    /// data pair, with zero-prior degrees projected out.
    pub fn calc_prep(
        &mut self,
        eblm_dat: &[HarmonicCoefficients; 2],
        s_cls_ee: &[f64],
    ) -> Result<HarmonicCoefficients, DelensError>
    {
        if eblm_dat[0].layout != self.layout_len || eblm_dat[1].layout != self.layout_len {
            return Err(DelensError::AlmSizeMismatch);
        }
        let mut e = eblm_dat[0].clone();
        let mut b = eblm_dat[1].clone();
        e.almxfl_inplace(&self.inoise_1_elm);
        b.almxfl_inplace(&self.inoise_1_blm);
        let out = self.ffi.remap(&e, Some(&b), 2, self.layout_sol, true)?;
        let mut elm = out.into_iter().next().ok_or(DelensError::AlmSizeMismatch)?;
        elm.almxfl_inplace(&prior_mask(s_cls_ee, self.layout_sol.lmax));
        Ok(elm)
    }

    /// Forward CG operator: apply_alm plus the inverse prior, masked where
    /// the prior power vanishes.
    pub fn fwd_apply(
        &mut self,
        elm: &HarmonicCoefficients,
        s_cls_ee: &[f64],
    ) -> Result<HarmonicCoefficients, DelensError>
    {
        let icl = inverse_prior(s_cls_ee, self.layout_sol.lmax);
        let mask = prior_mask(s_cls_ee, self.layout_sol.lmax);
        let mut nlm = elm.clone();
        self.apply_alm(&mut nlm)?;
        nlm.axpy(1.0, &elm.almxfl(&icl));
        nlm.almxfl_inplace(&mask);
        Ok(nlm)
    }

    /// Run the Wiener solve for a data pair. Non-convergence is reported in
    /// the returned [`CgReport`], never silently dropped.
    pub fn solve(
        &mut self,
        soltn: &mut HarmonicCoefficients,
        eblm_dat: &[HarmonicCoefficients; 2],
        s_cls_ee: &[f64],
        cg: &CgParams,
    ) -> Result<CgReport, DelensError>
    {
        let rhs = self.calc_prep(eblm_dat, s_cls_ee)?;
        self.solve_with_rhs(soltn, &rhs, s_cls_ee, cg)
    }

    fn solve_with_rhs(
        &mut self,
        soltn: &mut HarmonicCoefficients,
        rhs: &HarmonicCoefficients,
        s_cls_ee: &[f64],
        cg: &CgParams,
    ) -> Result<CgReport, DelensError>
    {
        let mut pre = PreOpDiag::new(s_cls_ee, self.layout_sol, &self.get_febl().0)?;
        let dot = self.dot_op();
        let mut fwd = |v: &HarmonicCoefficients| self.fwd_apply(v, s_cls_ee);
        let report = solver::solve(soltn, rhs, &mut fwd, &mut pre, &dot, cg)?;
        if !report.converged {
            log::warn!(
                "iso wiener solve unconverged after {} iterations (residual {:.3e})",
                report.iterations,
                report.residual
            );
        }
        Ok(report)
    }

    /// Generate a data pair consistent with the filter fiducials: lensed,
    /// beam-convolved unlensed CMB plus a noise realization. Feeding in the
    /// unlensed phases supports paired simulations.
    pub fn synalm<R: Rng>(
        &mut self,
        s_cls_ee: &[f64],
        rng: &mut R,
        cmb_phas: Option<HarmonicCoefficients>,
    ) -> Result<(HarmonicCoefficients, [HarmonicCoefficients; 2]), DelensError>
    {
        let elm = match cmb_phas {
            Some(p) => {
                if p.layout != self.layout_sol {
                    return Err(DelensError::AlmSizeMismatch);
                }
                p
            }
            None => HarmonicCoefficients::synalm(s_cls_ee, self.layout_sol, rng),
        };
        let zero = self.zero_sol();
        let mut eblm = self.ffi.remap(&elm, Some(&zero), 2, self.layout_len, false)?;
        eblm[0].almxfl_inplace(&self.transf_elm);
        eblm[1].almxfl_inplace(&self.transf_blm);
        let noise_cl = |nlev: &[f64], transf: &[f64]| -> Vec<f64> {
            nlev.iter()
                .zip(transf)
                .map(|(n, t)| if *t > 0.0 { (n * AMIN_TO_RAD).powi(2) } else { 0.0 })
                .collect()
        };
        eblm[0].axpy(
            1.0,
            &HarmonicCoefficients::synalm(
                &noise_cl(&self.nlev_elm, &self.transf_elm),
                self.layout_len,
                rng,
            ),
        );
        eblm[1].axpy(
            1.0,
            &HarmonicCoefficients::synalm(
                &noise_cl(&self.nlev_blm, &self.transf_blm),
                self.layout_len,
                rng,
            ),
        );
        let b = eblm.pop().ok_or(DelensError::AlmSizeMismatch)?;
        let e = eblm.pop().ok_or(DelensError::AlmSizeMismatch)?;
        Ok((elm, [e, b]))
    }

    /// Inverse-variance-weighted residual leg of the QE, as a position-space
    /// pair on the builder's patch grid.
    fn irespmap(
        &mut self,
        eblm_dat: &[HarmonicCoefficients; 2],
        elm_wf: &HarmonicCoefficients,
        builder: &EstimatorBuilder<T>,
    ) -> Result<(Vec<f64>, Vec<f64>), DelensError>
    {
        let zero = self.zero_sol();
        let mut ebwf = self.ffi.remap(elm_wf, Some(&zero), 2, self.layout_len, false)?;
        ebwf[0].almxfl_inplace(&self.transf_elm);
        ebwf[1].almxfl_inplace(&self.transf_blm);
        for (wf, dat) in ebwf.iter_mut().zip(eblm_dat) {
            wf.scale(-1.0);
            wf.axpy(1.0, dat);
        }
        // factor 1/2 from the dagger rather than inverse of the synthesis
        let wee = if self.wee { 1.0 } else { 0.0 };
        let fl_e: Vec<f64> = self.inoise_1_elm.iter().map(|v| v * 0.5 * wee).collect();
        let fl_b: Vec<f64> = self.inoise_1_blm.iter().map(|v| v * 0.5).collect();
        ebwf[0].almxfl_inplace(&fl_e);
        ebwf[1].almxfl_inplace(&fl_b);
        let mut maps = builder.backend().synthesis(&ebwf[0], Some(&ebwf[1]), 2)?;
        let im = maps.pop().ok_or(DelensError::PixelCountMismatch)?;
        let re = maps.pop().ok_or(DelensError::PixelCountMismatch)?;
        Ok((re, im))
    }

    /// Wiener-filtered gradient leg at spin 1 or 3, lensed to position
    /// space on the builder's patch grid.
    fn gpmap(
        &mut self,
        elm_leg: &HarmonicCoefficients,
        spin: usize,
        builder: &EstimatorBuilder<T>,
    ) -> Result<(Vec<f64>, Vec<f64>), DelensError>
    {
        let fl = gradient_leg_weights(spin, self.layout_sol.lmax)?;
        let glm = elm_leg.almxfl(&fl);
        let zero = HarmonicCoefficients::zero(glm.layout);
        let mut maps = if builder.grid().fingerprint() == self.ffi.grid().fingerprint() {
            self.ffi.deflected_map(&glm, Some(&zero), spin, false)?
        } else {
            let mut patch_ffi = self.ffi.change_grid(builder.grid().clone())?;
            patch_ffi.deflected_map(&glm, Some(&zero), spin, false)?
        };
        let c = maps.pop().ok_or(DelensError::PixelCountMismatch)?;
        let g = maps.pop().ok_or(DelensError::PixelCountMismatch)?;
        Ok((g, c))
    }

    /// Lensing gradient/curl QE consistent with the filter assumptions.
    pub fn get_qlms(
        &mut self,
        eblm_dat: &[HarmonicCoefficients; 2],
        elm_wf: &HarmonicCoefficients,
        builder: &EstimatorBuilder<T>,
        elm_wf_leg2: Option<&HarmonicCoefficients>,
    ) -> Result<QlmOutput, DelensError>
    {
        if elm_wf.layout != self.layout_sol {
            return Err(DelensError::AlmSizeMismatch);
        }
        let (rep, imp) = self.irespmap(eblm_dat, elm_wf, builder)?;
        let leg = elm_wf_leg2.unwrap_or(elm_wf);
        if leg.layout != self.layout_sol {
            return Err(DelensError::AlmSizeMismatch);
        }
        let leg3 = self.gpmap(leg, 3, builder)?;
        let leg1 = self.gpmap(leg, 1, builder)?;
        let (re, im) = combine_legs((&rep, &imp), (&leg3.0, &leg3.1), (&leg1.0, &leg1.1));
        builder.project(re, im, true)
    }

    /// Single mean-field realization. Key 1 solves unit-variance harmonic
    /// phases through the filter; key 0 is the standard QE on synthesized
    /// data. Averaging over realizations is the caller's business.
    pub fn get_qlms_mf<R: Rng>(
        &mut self,
        mfkey: usize,
        builder: &EstimatorBuilder<T>,
        s_cls_ee: &[f64],
        cg: &CgParams,
        phas: Option<[HarmonicCoefficients; 2]>,
        rng: &mut R,
    ) -> Result<(QlmOutput, CgReport), DelensError>
    {
        match mfkey {
            1 => {
                let ones = flat_cl(1.0, self.layout_len.lmax);
                let mut phas = match phas {
                    Some(p) => {
                        if p[0].layout != self.layout_len || p[1].layout != self.layout_len {
                            return Err(DelensError::AlmSizeMismatch);
                        }
                        p
                    }
                    None => [
                        HarmonicCoefficients::synalm(&ones, self.layout_len, rng),
                        HarmonicCoefficients::synalm(&ones, self.layout_len, rng),
                    ],
                };
                let rhs = self.calc_prep(&phas, s_cls_ee)?;
                let mut soltn = self.zero_sol();
                let report = self.solve_with_rhs(&mut soltn, &rhs, s_cls_ee, cg)?;

                let half_e: Vec<f64> = self.transf_elm.iter().map(|v| 0.5 * v).collect();
                let half_b: Vec<f64> = self.transf_blm.iter().map(|v| 0.5 * v).collect();
                phas[0].almxfl_inplace(&half_e);
                phas[1].almxfl_inplace(&half_b);
                let mut maps = builder.backend().synthesis(&phas[0], Some(&phas[1]), 2)?;
                let imp = maps.pop().ok_or(DelensError::PixelCountMismatch)?;
                let rep = maps.pop().ok_or(DelensError::PixelCountMismatch)?;

                let leg3 = self.gpmap(&soltn, 3, builder)?;
                let leg1 = self.gpmap(&soltn, 1, builder)?;
                let (re, im) =
                    combine_legs((&rep, &imp), (&leg3.0, &leg3.1), (&leg1.0, &leg1.1));
                Ok((builder.project(re, im, true)?, report))
            }
            0 => {
                let (_, eblm_dat) = self.synalm(s_cls_ee, rng, None)?;
                let mut elm_wf = self.zero_sol();
                let report = self.solve(&mut elm_wf, &eblm_dat, s_cls_ee, cg)?;
                Ok((self.get_qlms(&eblm_dat, &elm_wf, builder, None)?, report))
            }
            _ => Err(DelensError::NotImplemented),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::cache::MemCacher;
    use crate::geometry::{AngularGrid, LongitudeBand};
    use crate::remapping::DeflectionField;
    use crate::sht::RingTransform;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_filter() -> IsoFilter<RingTransform>
    {
        let lmax = 8;
        let grid = AngularGrid::gauss(lmax + 1, 2 * lmax + 2);
        let backend = RingTransform::new(grid, 1).unwrap();
        let ffi = DeflectionEngine::new(
            DeflectionField::zero(AlmLayout::full(4)),
            backend,
            LongitudeBand::full(),
            60.0,
            Box::new(MemCacher::new()),
        )
        .unwrap();
        IsoFilter::new(
            &[10.0],
            ffi,
            &flat_cl(0.5, lmax),
            (lmax, lmax),
            (lmax, lmax),
            None,
            None,
            true,
        )
        .unwrap()
    }

    #[test]
    fn noise_spectra_follow_the_level_and_transfer()
    {
        let filter = small_filter();
        let n2 = (10.0 * AMIN_TO_RAD) * (10.0 * AMIN_TO_RAD);
        let (fe, fb) = filter.get_febl();
        assert!((fe[5] - 0.25 / n2).abs() < 1e-6 * fe[5]);
        assert_eq!(fe, fb);
    }

    #[test]
    fn apply_map_weights_by_inverse_noise_over_transfer()
    {
        let filter = small_filter();
        let layout = filter.layout_len();
        let mut rng = StdRng::seed_from_u64(3);
        let e = HarmonicCoefficients::synalm(&flat_cl(1.0, layout.lmax), layout, &mut rng);
        let b = HarmonicCoefficients::synalm(&flat_cl(1.0, layout.lmax), layout, &mut rng);
        let mut pair = [e.clone(), b.clone()];
        filter.apply_map(&mut pair).unwrap();
        // inoise_1 / transf = (transf / nlev^2) / transf = 1 / nlev^2
        let n2 = (10.0 * AMIN_TO_RAD) * (10.0 * AMIN_TO_RAD);
        let expect = e.get(4, 2) / n2;
        assert!((pair[0].get(4, 2) - expect).norm() < 1e-9 * expect.norm());
    }

    #[test]
    fn transfer_truncation_limits_the_lensed_band()
    {
        let lmax = 8;
        let grid = AngularGrid::gauss(lmax + 1, 2 * lmax + 2);
        let backend = RingTransform::new(grid, 1).unwrap();
        let ffi = DeflectionEngine::new(
            DeflectionField::zero(AlmLayout::full(4)),
            backend,
            LongitudeBand::full(),
            60.0,
            Box::new(MemCacher::new()),
        )
        .unwrap();
        let filter = IsoFilter::new(
            &[1.0],
            ffi,
            &flat_cl(1.0, 5),
            (lmax, lmax),
            (lmax, lmax),
            None,
            None,
            true,
        )
        .unwrap();
        assert_eq!(filter.layout_len().lmax, 5);
        assert_eq!(filter.layout_sol().lmax, lmax);
    }
}
