//! Masked-sky filter: the noise covariance lives in pixel space, so the
//! forward operator round-trips through position space between the lensing
//! remapping stages. Distinguishes, when asked to, between the deflections
//! mapping E to E and E to B.

use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;
use std::hash::Hasher;

use crate::alm::{AlmLayout, HarmonicCoefficients};
use crate::errors::DelensError;
use crate::estimator::{combine_legs, gradient_leg_weights, EstimatorBuilder, QlmOutput};
use crate::filter::{inverse_prior, prior_mask, DeflectionLegs, DotOp, PreOpDiag};
use crate::noise::NoiseOperator;
use crate::sht::SpinTransform;
use crate::solver::{self, CgParams, CgReport};

const AMIN_TO_RAD: f64 = PI / 180.0 / 60.0;

#[derive(Copy, Clone, PartialEq, Eq)]
enum Leg
{
    EE,
    EB,
}

/// Inverse-variance and Wiener filter over a masked pixel-domain noise
/// model, inclusive of the lensing remapping.
pub struct AnisoFilter<T: SpinTransform>
{
    ninv_backend: T,
    noise: NoiseOperator,
    legs: DeflectionLegs<T>,
    transf_elm: Vec<f64>,
    transf_blm: Vec<f64>,
    layout_sol: AlmLayout,
    layout_len: AlmLayout,
    lmin_dotop: usize,
}

impl<T: SpinTransform> AnisoFilter<T>
{
    /// `ninv_backend` carries the grid of the inverse-noise maps;
    /// `unlalm_info`/`lenalm_info` are the (lmax, mmax) of the unlensed and
    /// lensed coefficients; the lensed band is truncated to the transfer
    /// function's reach.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ninv_backend: T,
        noise: NoiseOperator,
        legs: DeflectionLegs<T>,
        transf: &[f64],
        unlalm_info: (usize, usize),
        lenalm_info: (usize, usize),
        transf_b: Option<&[f64]>,
        lmin_dotop: usize,
    ) -> Result<Self, DelensError>
    {
        if transf.is_empty() {
            return Err(DelensError::TransferLengthMismatch);
        }
        if noise.npix() != ninv_backend.grid().npix() {
            return Err(DelensError::PixelCountMismatch);
        }
        let lmax_transf = transf.len().max(transf_b.map_or(0, |t| t.len())) - 1;
        let lmax_len = lenalm_info.0.min(lmax_transf);
        let mmax_len = lenalm_info.1.min(lmax_transf).min(lmax_len);
        let layout_len = AlmLayout::new(lmax_len, mmax_len);
        let layout_sol = AlmLayout::new(unlalm_info.0, unlalm_info.1);
        Ok(Self {
            ninv_backend,
            noise,
            legs,
            transf_elm: crate::alm::extend_cl(transf, lmax_len),
            transf_blm: crate::alm::extend_cl(transf_b.unwrap_or(transf), lmax_len),
            layout_sol,
            layout_len,
            lmin_dotop,
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

    pub fn noise(&self) -> &NoiseOperator
    {
        &self.noise
    }

    pub fn npix(&self) -> usize
    {
        self.noise.npix()
    }

    /// Swap in the deflections of the next reconstruction iteration.
    pub fn set_deflection(&mut self, legs: DeflectionLegs<T>)
    {
        self.legs = legs;
    }

    pub fn dot_op(&self) -> DotOp
    {
        DotOp::new(self.layout_sol, self.lmin_dotop)
    }

    pub fn fingerprint(&self) -> u64
    {
        let mut h = rustc_hash::FxHasher::default();
        h.write_u64(self.noise.fingerprint());
        h.write_u64(self.ninv_backend.grid().fingerprint());
        h.write_u64(self.legs.fingerprint());
        for v in self.transf_elm.iter().chain(&self.transf_blm) {
            h.write_u64(v.to_bits());
        }
        h.write_usize(self.layout_sol.size());
        h.write_usize(self.layout_len.size());
        h.finish()
    }

    fn zero_sol(&self) -> HarmonicCoefficients
    {
        HarmonicCoefficients::zero(self.layout_sol)
    }

    /// Forward lensing of a solution-space E field to the lensed E/B pair.
    /// With dual legs the B component comes from the E->B deflection.
    pub fn lens_forward(
        &mut self,
        elm: &HarmonicCoefficients,
    ) -> Result<[HarmonicCoefficients; 2], DelensError>
    {
        if elm.layout != self.layout_sol {
            return Err(DelensError::AlmSizeMismatch);
        }
        let zero = self.zero_sol();
        let mut pair = self.legs.ee().remap(elm, Some(&zero), 2, self.layout_len, false)?;
        if self.legs.is_dual() {
            let pair_eb = self.legs.eb().remap(elm, Some(&zero), 2, self.layout_len, false)?;
            pair[1] = pair_eb
                .into_iter()
                .nth(1)
                .ok_or(DelensError::AlmSizeMismatch)?;
        }
        let b = pair.pop().ok_or(DelensError::AlmSizeMismatch)?;
        let e = pair.pop().ok_or(DelensError::AlmSizeMismatch)?;
        Ok([e, b])
    }

    /// Adjoint-side lensing of a lensed E/B pair back to solution space,
    /// keeping the gradient component.
    pub fn lens_backward(
        &mut self,
        eblm: &[HarmonicCoefficients; 2],
    ) -> Result<HarmonicCoefficients, DelensError>
    {
        if eblm[0].layout != self.layout_len || eblm[1].layout != self.layout_len {
            return Err(DelensError::AlmSizeMismatch);
        }
        let layout_sol = self.layout_sol;
        let layout_len = self.layout_len;
        match &mut self.legs {
            DeflectionLegs::Single(engine) => {
                let out = engine.remap(&eblm[0], Some(&eblm[1]), 2, layout_sol, true)?;
                out.into_iter().next().ok_or(DelensError::AlmSizeMismatch)
            }
            DeflectionLegs::Dual { ee, eb } => {
                let zero = HarmonicCoefficients::zero(layout_len);
                let out_e = ee.remap(&eblm[0], Some(&zero), 2, layout_sol, true)?;
                let mut elm =
                    out_e.into_iter().next().ok_or(DelensError::AlmSizeMismatch)?;
                let out_b = eb.remap(&zero, Some(&eblm[1]), 2, layout_sol, true)?;
                elm.axpy(
                    1.0,
                    &out_b.into_iter().next().ok_or(DelensError::AlmSizeMismatch)?,
                );
                Ok(elm)
            }
        }
    }

    /// Pixel-domain inverse-noise weighting, in place.
    pub fn apply_map(&self, qu: &mut [Vec<f64>]) -> Result<(), DelensError>
    {
        if qu.len() != 2 {
            return Err(DelensError::PixelCountMismatch);
        }
        let (q, u) = qu.split_at_mut(1);
        self.noise.apply_map(&mut q[0], &mut u[0])
    }

    /// Applies D^t B^t N^-1 B D, in place on the solution-space field:
    /// forward lensing, transfer, to pixels, noise weighting, back to
    /// harmonic (plain adjoint, unit weights), transfer, backward lensing.
    pub fn apply_alm(&mut self, elm: &mut HarmonicCoefficients) -> Result<(), DelensError>
    {
        let mut eblm = self.lens_forward(elm)?;
        eblm[0].almxfl_inplace(&self.transf_elm);
        eblm[1].almxfl_inplace(&self.transf_blm);
        let mut qu = self.ninv_backend.synthesis(&eblm[0], Some(&eblm[1]), 2)?;
        self.apply_map(&mut qu)?;
        let mut back = self.ninv_backend.adjoint_synthesis(&qu, 2, self.layout_len)?;
        back[0].almxfl_inplace(&self.transf_elm);
        back[1].almxfl_inplace(&self.transf_blm);
        let b = back.pop().ok_or(DelensError::AlmSizeMismatch)?;
        let e = back.pop().ok_or(DelensError::AlmSizeMismatch)?;
        *elm = self.lens_backward(&[e, b])?;
        Ok(())
    }

    /// Right-hand side of the normal equation, D^t B^t N^-1 applied to the
    /// data maps, zero-prior degrees projected out.
    pub fn calc_prep(
        &mut self,
        qu_dat: &[Vec<f64>],
        s_cls_ee: &[f64],
    ) -> Result<HarmonicCoefficients, DelensError>
    {
        if qu_dat.len() != 2 || qu_dat.iter().any(|m| m.len() != self.npix()) {
            return Err(DelensError::PixelCountMismatch);
        }
        let mut qu = qu_dat.to_vec();
        self.apply_map(&mut qu)?;
        let mut eblm = self.ninv_backend.adjoint_synthesis(&qu, 2, self.layout_len)?;
        eblm[0].almxfl_inplace(&self.transf_elm);
        eblm[1].almxfl_inplace(&self.transf_blm);
        let b = eblm.pop().ok_or(DelensError::AlmSizeMismatch)?;
        let e = eblm.pop().ok_or(DelensError::AlmSizeMismatch)?;
        let mut elm = self.lens_backward(&[e, b])?;
        elm.almxfl_inplace(&prior_mask(s_cls_ee, self.layout_sol.lmax));
        Ok(elm)
    }

    /// Effective (transfer/noise)^2 spectra for the preconditioner, from
    /// the average level of the inverse-variance maps.
    pub fn get_febl(&self) -> (Vec<f64>, Vec<f64>)
    {
        let nlevp = self.noise.nlev_febl();
        log::info!("using nlevp {nlevp:.2} amin");
        let n2 = (nlevp * AMIN_TO_RAD).powi(2);
        let fe: Vec<f64> = self.transf_elm.iter().map(|t| t * t / n2).collect();
        let fb: Vec<f64> = self.transf_blm.iter().map(|t| t * t / n2).collect();
        (fe, fb)
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

    /// Run the Wiener solve for a data map pair.
    pub fn solve(
        &mut self,
        soltn: &mut HarmonicCoefficients,
        qu_dat: &[Vec<f64>],
        s_cls_ee: &[f64],
        cg: &CgParams,
    ) -> Result<CgReport, DelensError>
    {
        let rhs = self.calc_prep(qu_dat, s_cls_ee)?;
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
                "aniso wiener solve unconverged after {} iterations (residual {:.3e})",
                report.iterations,
                report.residual
            );
        }
        Ok(report)
    }

    /// Generate data maps consistent with the filter fiducials: lensed,
    /// beamed CMB plus a pixel noise realization. Only scalar noise models
    /// have a defined synthesis here.
    pub fn synalm<R: Rng>(
        &mut self,
        s_cls_ee: &[f64],
        rng: &mut R,
        cmb_phas: Option<HarmonicCoefficients>,
    ) -> Result<(HarmonicCoefficients, Vec<Vec<f64>>), DelensError>
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
        let mut eblm = self.lens_forward(&elm)?;
        eblm[0].almxfl_inplace(&self.transf_elm);
        eblm[1].almxfl_inplace(&self.transf_blm);
        let mut qu = self.ninv_backend.synthesis(&eblm[0], Some(&eblm[1]), 2)?;
        let ninv = self
            .noise
            .scalar_ninv()
            .ok_or(DelensError::NotImplemented)?;
        for map in qu.iter_mut() {
            for (v, n) in map.iter_mut().zip(ninv) {
                let g: f64 = rng.sample(StandardNormal);
                let sigma = if *n > 0.0 { (1.0 / n).sqrt() } else { 0.0 };
                *v += g * sigma;
            }
        }
        Ok((elm, qu))
    }

    /// Inverse-variance-weighted residual legs, E and B kept separate, as
    /// position-space pairs on the builder's patch grid.
    #[allow(clippy::type_complexity)]
    fn irespmap(
        &mut self,
        qu_dat: &[Vec<f64>],
        elm_wf: &HarmonicCoefficients,
        builder: &EstimatorBuilder<T>,
    ) -> Result<((Vec<f64>, Vec<f64>), (Vec<f64>, Vec<f64>)), DelensError>
    {
        let mut ebwf = self.lens_forward(elm_wf)?;
        ebwf[0].almxfl_inplace(&self.transf_elm);
        ebwf[1].almxfl_inplace(&self.transf_blm);
        let qu_wf = self.ninv_backend.synthesis(&ebwf[0], Some(&ebwf[1]), 2)?;
        let mut qu: Vec<Vec<f64>> = qu_dat
            .iter()
            .zip(&qu_wf)
            .map(|(d, w)| d.iter().zip(w).map(|(a, b)| a - b).collect())
            .collect();
        self.apply_map(&mut qu)?;
        let mut eblm = self.ninv_backend.adjoint_synthesis(&qu, 2, self.layout_len)?;
        // factor 1/2 from the dagger rather than inverse of the synthesis
        let half_e: Vec<f64> = self.transf_elm.iter().map(|v| 0.5 * v).collect();
        let half_b: Vec<f64> = self.transf_blm.iter().map(|v| 0.5 * v).collect();
        eblm[0].almxfl_inplace(&half_e);
        eblm[1].almxfl_inplace(&half_b);
        let zero = HarmonicCoefficients::zero(self.layout_len);
        let mut res_e = builder.backend().synthesis(&eblm[0], Some(&zero), 2)?;
        let mut res_b = builder.backend().synthesis(&zero, Some(&eblm[1]), 2)?;
        let e_im = res_e.pop().ok_or(DelensError::PixelCountMismatch)?;
        let e_re = res_e.pop().ok_or(DelensError::PixelCountMismatch)?;
        let b_im = res_b.pop().ok_or(DelensError::PixelCountMismatch)?;
        let b_re = res_b.pop().ok_or(DelensError::PixelCountMismatch)?;
        Ok(((e_re, e_im), (b_re, b_im)))
    }

    /// Wiener-filtered gradient leg at spin 1 or 3, lensed by the chosen
    /// deflection to position space on the builder's patch grid.
    fn gpmap(
        &mut self,
        elm_leg: &HarmonicCoefficients,
        spin: usize,
        builder: &EstimatorBuilder<T>,
        leg: Leg,
    ) -> Result<(Vec<f64>, Vec<f64>), DelensError>
    {
        let fl = gradient_leg_weights(spin, self.layout_sol.lmax)?;
        let glm = elm_leg.almxfl(&fl);
        let zero = HarmonicCoefficients::zero(glm.layout);
        let engine = match leg {
            Leg::EE => self.legs.ee(),
            Leg::EB => self.legs.eb(),
        };
        let mut maps = if builder.grid().fingerprint() == engine.grid().fingerprint() {
            engine.deflected_map(&glm, Some(&zero), spin, false)?
        } else {
            let mut patch_engine = engine.change_grid(builder.grid().clone())?;
            patch_engine.deflected_map(&glm, Some(&zero), spin, false)?
        };
        let c = maps.pop().ok_or(DelensError::PixelCountMismatch)?;
        let g = maps.pop().ok_or(DelensError::PixelCountMismatch)?;
        Ok((g, c))
    }

    /// Lensing gradient/curl QE. The E-leg and B-leg components are kept
    /// separate; with dual deflections the B leg uses the E->B instance.
    pub fn get_qlms(
        &mut self,
        qu_dat: &[Vec<f64>],
        elm_wf: &HarmonicCoefficients,
        builder: &EstimatorBuilder<T>,
        alm_wf_leg2: Option<&HarmonicCoefficients>,
    ) -> Result<(QlmOutput, QlmOutput), DelensError>
    {
        if qu_dat.len() != 2 || qu_dat.iter().any(|m| m.len() != self.npix()) {
            return Err(DelensError::PixelCountMismatch);
        }
        if elm_wf.layout != self.layout_sol {
            return Err(DelensError::AlmSizeMismatch);
        }
        let (res_e, res_b) = self.irespmap(qu_dat, elm_wf, builder)?;
        let leg = alm_wf_leg2.unwrap_or(elm_wf);
        if leg.layout != self.layout_sol {
            return Err(DelensError::AlmSizeMismatch);
        }

        let leg3_ee = self.gpmap(leg, 3, builder, Leg::EE)?;
        let leg1_ee = self.gpmap(leg, 1, builder, Leg::EE)?;
        let (leg3_eb, leg1_eb) = if self.legs.is_dual() {
            (self.gpmap(leg, 3, builder, Leg::EB)?, self.gpmap(leg, 1, builder, Leg::EB)?)
        } else {
            (leg3_ee.clone(), leg1_ee.clone())
        };

        let (re_ee, im_ee) = combine_legs(
            (&res_e.0, &res_e.1),
            (&leg3_ee.0, &leg3_ee.1),
            (&leg1_ee.0, &leg1_ee.1),
        );
        let (re_eb, im_eb) = combine_legs(
            (&res_b.0, &res_b.1),
            (&leg3_eb.0, &leg3_eb.1),
            (&leg1_eb.0, &leg1_eb.1),
        );
        let qlm_ee = builder.project(re_ee, im_ee, false)?;
        let qlm_eb = builder.project(re_eb, im_eb, false)?;
        Ok((qlm_ee, qlm_eb))
    }

    /// Single mean-field realization. Only the standard synthesized-data QE
    /// (key 0) is defined for the pixel-domain filter; the pixel-phase
    /// variant is not implemented and says so rather than producing a
    /// plausible-looking wrong answer.
    pub fn get_qlms_mf<R: Rng>(
        &mut self,
        mfkey: usize,
        builder: &EstimatorBuilder<T>,
        s_cls_ee: &[f64],
        cg: &CgParams,
        rng: &mut R,
    ) -> Result<((QlmOutput, QlmOutput), CgReport), DelensError>
    {
        match mfkey {
            0 => {
                let (_, qu_dat) = self.synalm(s_cls_ee, rng, None)?;
                let mut elm_wf = self.zero_sol();
                let report = self.solve(&mut elm_wf, &qu_dat, s_cls_ee, cg)?;
                Ok((self.get_qlms(&qu_dat, &elm_wf, builder, None)?, report))
            }
            _ => Err(DelensError::NotImplemented),
        }
    }
}
