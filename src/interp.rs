//! Bicubic interpolation surfaces over buffered cylindrical patches.
//!
//! A deflected-field evaluation needs the field at arbitrary off-grid
//! angles. The surface samples the field on an equidistant cylindrical grid
//! at a target resolution, converts the samples to cardinal cubic B-spline
//! coefficients with an FFT prefilter, and evaluates with 4x4 tensor
//! weights, periodic in longitude. The patch carries an extra colatitude
//! margin so spline edge effects stay outside the region ever evaluated.

use rayon::prelude::*;
use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::PI;

use crate::alm::HarmonicCoefficients;
use crate::errors::DelensError;
use crate::geometry::AngularGrid;
use crate::sht::SpinTransform;

/// Default buffer margin around the target colatitude range, in arcmin.
pub const PATCH_BUFFER_AMIN: f64 = 30.0;

/// Colatitude range and sampling resolution of an interpolation patch.
/// Longitude always spans the full circle, keeping the prefilter exactly
/// periodic in that direction.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BufferedPatch
{
    pub theta_min: f64,
    pub theta_max: f64,
    pub resolution_amin: f64,
    pub phi_center: f64,
}

impl BufferedPatch
{
    /// Expand a target colatitude range by `buffer_amin`, clamping to the
    /// poles.
    pub fn new(tbounds: (f64, f64), resolution_amin: f64, phi_center: f64, buffer_amin: f64) -> Self
    {
        let buf = buffer_amin / 180.0 / 60.0 * PI;
        Self {
            theta_min: (tbounds.0 - buf).max(0.0),
            theta_max: (tbounds.1 + buf).min(PI),
            resolution_amin,
            phi_center,
        }
    }

    fn nlat(&self) -> usize
    {
        let res = self.resolution_amin / 180.0 / 60.0 * PI;
        (((self.theta_max - self.theta_min) / res).ceil() as usize + 1).max(8)
    }

    fn nlon(&self) -> usize
    {
        let res = self.resolution_amin / 180.0 / 60.0 * PI;
        ((2.0 * PI / res).ceil() as usize).max(8)
    }
}

/// Cardinal cubic B-spline surface for one or two field components.
pub struct InterpolationSurface
{
    ntheta: usize,
    nphi: usize,
    theta0: f64,
    dtheta: f64,
    phi0: f64,
    dphi: f64,
    spin: usize,
    coeffs: Vec<Vec<f64>>,
}

impl InterpolationSurface
{
    /// Synthesize `(grad, curl)` as a spin-`spin` field on the patch grid
    /// and prefilter the samples into spline coefficients.
    pub fn build<T: SpinTransform>(
        backend: &T,
        grad: &HarmonicCoefficients,
        curl: Option<&HarmonicCoefficients>,
        spin: usize,
        patch: &BufferedPatch,
    ) -> Result<Self, DelensError>
    {
        let nlat = patch.nlat();
        let nlon = patch.nlon();
        let grid = AngularGrid::ecp(nlat, nlon, patch.phi_center, (patch.theta_min, patch.theta_max));
        let phi0 = grid.ring(0).phi0;
        let ecp = backend.for_grid(grid)?;
        let maps = ecp.synthesis(grad, curl, spin)?;
        let coeffs = maps.into_iter().map(|m| prefilter(m, nlat, nlon)).collect();
        Ok(Self {
            ntheta: nlat,
            nphi: nlon,
            theta0: patch.theta_min,
            dtheta: (patch.theta_max - patch.theta_min) / (nlat - 1) as f64,
            phi0,
            dphi: 2.0 * PI / nlon as f64,
            spin,
            coeffs,
        })
    }

    pub fn spin(&self) -> usize
    {
        self.spin
    }

    /// Number of field components (1 for spin 0, 2 otherwise).
    pub fn ncomp(&self) -> usize
    {
        self.coeffs.len()
    }

    /// Grid coordinates of an angular position: fractional row/column of the
    /// patch lattice.
    #[inline]
    pub fn grid_coords(&self, theta: f64, phi: f64) -> (f64, f64)
    {
        (
            (theta - self.theta0) / self.dtheta,
            (phi - self.phi0).rem_euclid(2.0 * PI) / self.dphi,
        )
    }

    /// Evaluate all components at one angular position.
    pub fn eval(&self, theta: f64, phi: f64) -> [f64; 2]
    {
        let (x, y) = self.grid_coords(theta, phi);
        let ix = x.floor() as isize;
        let iy = y.floor() as isize;
        let wt = bspline_weights(x - ix as f64);
        let wp = bspline_weights(y - iy as f64);
        let mut out = [0.0; 2];
        for (c, o) in self.coeffs.iter().zip(out.iter_mut()) {
            let mut acc = 0.0;
            for (dt, &wt_k) in wt.iter().enumerate() {
                // clamp at the colatitude edges, wrap in longitude
                let it = (ix + dt as isize - 1).clamp(0, self.ntheta as isize - 1) as usize;
                let row = it * self.nphi;
                let mut racc = 0.0;
                for (dp, &wp_k) in wp.iter().enumerate() {
                    let ip = (iy + dp as isize - 1).rem_euclid(self.nphi as isize) as usize;
                    racc += wp_k * c[row + ip];
                }
                acc += wt_k * racc;
            }
            *o = acc;
        }
        out
    }

    /// Batch evaluation, data-parallel over positions.
    pub fn eval_many(&self, angles: &[(f64, f64)]) -> Vec<[f64; 2]>
    {
        angles.par_iter().map(|&(t, p)| self.eval(t, p)).collect()
    }
}

/// Uniform cubic B-spline weights for the four taps around a sample with
/// fractional offset t in [0, 1).
#[inline]
fn bspline_weights(t: f64) -> [f64; 4]
{
    let t2 = t * t;
    let t3 = t2 * t;
    [
        (1.0 - t) * (1.0 - t) * (1.0 - t) / 6.0,
        (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0,
        (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0,
        t3 / 6.0,
    ]
}

/// Convert samples to cardinal B-spline coefficients: divide the 2-D
/// spectrum by the separable cubic kernel response (2 + cos w) / 3.
fn prefilter(samples: Vec<f64>, nt: usize, np: usize) -> Vec<f64>
{
    let mut data: Vec<Complex64> = samples.iter().map(|&v| Complex64::new(v, 0.0)).collect();
    let mut planner = FftPlanner::new();
    let row_fwd = planner.plan_fft_forward(np);
    let row_inv = planner.plan_fft_inverse(np);
    let col_fwd = planner.plan_fft_forward(nt);
    let col_inv = planner.plan_fft_inverse(nt);

    for row in data.chunks_exact_mut(np) {
        row_fwd.process(row);
    }
    let mut col = vec![Complex64::new(0.0, 0.0); nt];
    for j in 0..np {
        for (i, c) in col.iter_mut().enumerate() {
            *c = data[i * np + j];
        }
        col_fwd.process(&mut col);
        for (i, c) in col.iter_mut().enumerate() {
            let bt = (2.0 + (2.0 * PI * i as f64 / nt as f64).cos()) / 3.0;
            let bp = (2.0 + (2.0 * PI * j as f64 / np as f64).cos()) / 3.0;
            *c /= bt * bp;
        }
        col_inv.process(&mut col);
        for (i, c) in col.iter().enumerate() {
            data[i * np + j] = *c;
        }
    }
    for row in data.chunks_exact_mut(np) {
        row_inv.process(row);
    }
    let norm = 1.0 / (nt * np) as f64;
    data.into_iter().map(|c| c.re * norm).collect()
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::alm::{flat_cl, AlmLayout};
    use crate::sht::RingTransform;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_backend() -> RingTransform
    {
        RingTransform::new(AngularGrid::gauss(33, 66), 2).unwrap()
    }

    #[test]
    fn surface_reproduces_field_at_nodes()
    {
        let lmax = 15;
        let layout = AlmLayout::full(lmax);
        let mut rng = StdRng::seed_from_u64(3);
        let alm = HarmonicCoefficients::synalm(&flat_cl(1.0, lmax), layout, &mut rng);
        let backend = test_backend();
        let patch = BufferedPatch::new((0.4, 2.7), 40.0, PI, PATCH_BUFFER_AMIN);
        let surf = InterpolationSurface::build(&backend, &alm, None, 0, &patch).unwrap();

        // compare against direct synthesis on an interior ring of angles
        let nlat = 33;
        let grid = AngularGrid::gauss(nlat, 66);
        let direct = backend.synthesis(&alm, None, 0).unwrap();
        let mut worst: f64 = 0.0;
        for (ir, r) in grid.rings().iter().enumerate() {
            if r.theta < 0.5 || r.theta > 2.6 {
                continue;
            }
            for j in 0..r.nph {
                let got = surf.eval(r.theta, r.phi(j))[0];
                worst = worst.max((got - direct[0][grid.ring(ir).ofs + j]).abs());
            }
        }
        let scale: f64 =
            direct[0].iter().map(|v| v * v).sum::<f64>().sqrt() / (direct[0].len() as f64).sqrt();
        assert!(worst < 5e-3 * scale.max(1.0), "worst abs err {worst}, rms {scale}");
    }

    #[test]
    fn spin2_surface_carries_two_components()
    {
        let lmax = 10;
        let layout = AlmLayout::full(lmax);
        let mut rng = StdRng::seed_from_u64(5);
        let e = HarmonicCoefficients::synalm(&flat_cl(1.0, lmax), layout, &mut rng);
        let b = HarmonicCoefficients::synalm(&flat_cl(1.0, lmax), layout, &mut rng);
        let backend = test_backend();
        let patch = BufferedPatch::new((0.0, PI), 60.0, PI, PATCH_BUFFER_AMIN);
        let surf = InterpolationSurface::build(&backend, &e, Some(&b), 2, &patch).unwrap();
        assert_eq!(surf.ncomp(), 2);
        let v = surf.eval(1.3, 0.7);
        assert!(v[0].is_finite() && v[1].is_finite());
    }

    #[test]
    fn prefilter_then_spline_interpolates_smooth_samples()
    {
        // 1-D sanity through the 2-D machinery: constant in theta, harmonic
        // in phi, evaluated halfway between nodes
        let (nt, np) = (16, 64);
        let mut samples = vec![0.0; nt * np];
        for i in 0..nt {
            for j in 0..np {
                samples[i * np + j] = (2.0 * PI * 3.0 * j as f64 / np as f64).cos();
            }
        }
        let coeffs = prefilter(samples, nt, np);
        let surf = InterpolationSurface {
            ntheta: nt,
            nphi: np,
            theta0: 0.0,
            dtheta: 0.1,
            phi0: 0.0,
            dphi: 2.0 * PI / np as f64,
            spin: 0,
            coeffs: vec![coeffs],
        };
        for j in 0..np {
            let phi = (j as f64 + 0.5) * surf.dphi;
            let expect = (3.0 * phi).cos();
            let got = surf.eval(0.8, phi)[0];
            assert!((got - expect).abs() < 2e-3, "phi {phi}: {got} vs {expect}");
        }
    }
}
