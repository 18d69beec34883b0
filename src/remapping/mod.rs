//! Lensing deflection of spin-weighted fields on the sphere.
//!
//! [`DeflectionField`] holds the harmonic coefficients of the displacement
//! (gradient and optional curl); [`DeflectionEngine`] turns it into per-pixel
//! deflected angles over a longitude band and applies the remapping to
//! arbitrary spin fields through a cached bicubic interpolation surface.
//! Angle buffers are memoized under content fingerprints; a new deflection
//! estimate means a new engine, never an in-place update.

pub mod angles;

use indexmap::IndexMap;
use rayon::prelude::*;
use rustc_hash::FxBuildHasher;

use crate::alm::{AlmLayout, HarmonicCoefficients};
use crate::cache::{Cacher, FingerprintBuilder, MemCacher};
use crate::errors::DelensError;
use crate::geometry::{AngularGrid, LongitudeBand};
use crate::interp::{BufferedPatch, InterpolationSurface, PATCH_BUFFER_AMIN};
use crate::sht::SpinTransform;
use angles::{deflect_angle, invert_displacement};

const NEWTON_MAX_ITER: usize = 12;
const NEWTON_TOL: f64 = 1e-11;
/// Interpolation surfaces are large; keep only the most recent few. The
/// solver re-remaps the same field repeatedly within an iteration, never
/// across many.
const SURFACE_CACHE_CAP: usize = 4;

/// Displacement coefficients: gradient component (sqrt(l(l+1)) times the
/// lensing potential) and optional curl. Immutable once built.
#[derive(Clone, Debug)]
pub struct DeflectionField
{
    grad: HarmonicCoefficients,
    curl: Option<HarmonicCoefficients>,
}

impl DeflectionField
{
    pub fn new(grad: HarmonicCoefficients, curl: Option<HarmonicCoefficients>)
        -> Result<Self, DelensError>
    {
        if let Some(c) = &curl {
            if c.layout != grad.layout {
                return Err(DelensError::AlmSizeMismatch);
            }
        }
        Ok(Self { grad, curl })
    }

    /// All-zero deflection (the identity remapping, up to interpolation).
    pub fn zero(layout: AlmLayout) -> Self
    {
        Self { grad: HarmonicCoefficients::zero(layout), curl: None }
    }

    /// From lensing potential coefficients: d_lm = sqrt(l(l+1)) p_lm.
    pub fn from_potential(plm: &HarmonicCoefficients) -> Self
    {
        let fl: Vec<f64> = (0..=plm.layout.lmax)
            .map(|l| ((l * (l + 1)) as f64).sqrt())
            .collect();
        Self { grad: plm.almxfl(&fl), curl: None }
    }

    pub fn layout(&self) -> AlmLayout
    {
        self.grad.layout
    }

    pub fn grad(&self) -> &HarmonicCoefficients
    {
        &self.grad
    }

    pub fn curl(&self) -> Option<&HarmonicCoefficients>
    {
        self.curl.as_ref()
    }

    pub fn fingerprint(&self) -> u64
    {
        let mut h = rustc_hash::FxHasher::default();
        self.grad.fingerprint_into(&mut h);
        if let Some(c) = &self.curl {
            c.fingerprint_into(&mut h);
        }
        std::hash::Hasher::finish(&h)
    }
}

/// Applies a deflection field to spin-weighted fields over a longitude band
/// of an iso-latitude grid.
pub struct DeflectionEngine<T: SpinTransform>
{
    field: DeflectionField,
    backend: T,
    band: LongitudeBand,
    resolution_amin: f64,
    cacher: Box<dyn Cacher + Send>,
    pool: rayon::ThreadPool,
    d1: Option<InterpolationSurface>,
    surfaces: IndexMap<u64, InterpolationSurface, FxBuildHasher>,
    fingerprint: u64,
}

impl<T: SpinTransform> std::fmt::Debug for DeflectionEngine<T>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("DeflectionEngine")
            .field("band", &self.band)
            .field("resolution_amin", &self.resolution_amin)
            .field("surfaces", &self.surfaces.len())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl<T: SpinTransform> DeflectionEngine<T>
{
    /// `resolution_amin` sets the sampling of the interpolation surfaces;
    /// it should oversample the finest scale of the remapped fields.
    pub fn new(
        field: DeflectionField,
        backend: T,
        band: LongitudeBand,
        resolution_amin: f64,
        cacher: Box<dyn Cacher + Send>,
    ) -> Result<Self, DelensError>
    {
        if band.width() <= 0.0 {
            return Err(DelensError::EmptyBand);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(backend.threads())
            .build()
            .map_err(|_| DelensError::ThreadPoolBuildFailed)?;
        let fingerprint = FingerprintBuilder::new()
            .with_u64(field.fingerprint())
            .with_u64(backend.grid().fingerprint())
            .with_u64(band.fingerprint())
            .with_u64(resolution_amin.to_bits())
            .finish();
        Ok(Self {
            field,
            backend,
            band,
            resolution_amin,
            cacher,
            pool,
            d1: None,
            surfaces: IndexMap::default(),
            fingerprint,
        })
    }

    pub fn field(&self) -> &DeflectionField
    {
        &self.field
    }

    pub fn grid(&self) -> &AngularGrid
    {
        self.backend.grid()
    }

    pub fn band(&self) -> &LongitudeBand
    {
        &self.band
    }

    pub fn backend(&self) -> &T
    {
        &self.backend
    }

    /// Structural fingerprint of deflection + grid + band + resolution.
    pub fn fingerprint(&self) -> u64
    {
        self.fingerprint
    }

    /// Same deflection and band over a different grid, with a fresh cache.
    /// Used when the estimator legs are evaluated on their own patch grid.
    pub fn change_grid(&self, grid: AngularGrid) -> Result<Self, DelensError>
    {
        Self::new(
            self.field.clone(),
            self.backend.for_grid(grid)?,
            self.band,
            self.resolution_amin,
            Box::new(MemCacher::new()),
        )
    }

    /// (theta, phi, flat pixel index) of every band pixel, ring order.
    fn band_pixel_angles(&self) -> Vec<(f64, f64, usize)>
    {
        let grid = self.backend.grid();
        let mut out = Vec::new();
        for (ir, r) in grid.rings().iter().enumerate() {
            for j in grid.ring_pixels_in_band(ir, &self.band) {
                out.push((r.theta, r.phi(j), r.ofs + j));
            }
        }
        out
    }

    fn patch(&self) -> BufferedPatch
    {
        BufferedPatch::new(
            self.backend.grid().theta_bounds(),
            self.resolution_amin,
            self.band.center(),
            PATCH_BUFFER_AMIN,
        )
    }

    /// Spin-1 synthesis of the displacement on the target grid.
    fn displacement_maps(&self) -> Result<Vec<Vec<f64>>, DelensError>
    {
        let zero;
        let curl = match self.field.curl() {
            Some(c) => c,
            None => {
                zero = HarmonicCoefficients::zero(self.field.layout());
                &zero
            }
        };
        self.backend.synthesis(self.field.grad(), Some(curl), 1)
    }

    fn load_angles(&self, key: (&'static str, u64)) -> Result<Vec<(f64, f64)>, DelensError>
    {
        let buffers = self.cacher.load(&key)?;
        if buffers.len() != 2 || buffers[0].len() != buffers[1].len() {
            return Err(DelensError::CacheMiss);
        }
        Ok(buffers[0].iter().copied().zip(buffers[1].iter().copied()).collect())
    }

    fn store_angles(
        &mut self,
        key: (&'static str, u64),
        angles: &[(f64, f64)],
    ) -> Result<(), DelensError>
    {
        let thetas = angles.iter().map(|a| a.0).collect();
        let phis = angles.iter().map(|a| a.1).collect();
        self.cacher.store(key, vec![thetas, phis])
    }

    /// Deflected position of every band pixel under the forward field.
    pub fn forward_angles(&mut self) -> Result<Vec<(f64, f64)>, DelensError>
    {
        let key = ("fwdang", self.fingerprint);
        if self.cacher.is_cached(&key) {
            return self.load_angles(key);
        }
        let maps = self.displacement_maps()?;
        let pixels = self.band_pixel_angles();
        let out: Vec<(f64, f64)> = self.pool.install(|| {
            pixels
                .par_iter()
                .map(|&(t, p, i)| deflect_angle(t, p, maps[0][i], maps[1][i]))
                .collect()
        });
        self.store_angles(key, &out)?;
        Ok(out)
    }

    fn ensure_d1(&mut self) -> Result<(), DelensError>
    {
        if self.d1.is_none() {
            log::debug!(
                "building spin-1 displacement surface, {} amin buffers",
                PATCH_BUFFER_AMIN
            );
            let patch = self.patch();
            self.d1 = Some(InterpolationSurface::build(
                &self.backend,
                self.field.grad(),
                self.field.curl(),
                1,
                &patch,
            )?);
        }
        Ok(())
    }

    /// Pre-image position of every band pixel: the angles whose forward
    /// deflection lands on the pixel, found by local inversion against the
    /// buffered displacement surface.
    pub fn backward_angles(&mut self) -> Result<Vec<(f64, f64)>, DelensError>
    {
        let key = ("bwdang", self.fingerprint);
        if self.cacher.is_cached(&key) {
            return self.load_angles(key);
        }
        self.ensure_d1()?;
        let pixels = self.band_pixel_angles();
        let d1 = self.d1.as_ref().ok_or(DelensError::CacheMiss)?;
        let out: Vec<(f64, f64)> = self.pool.install(|| {
            pixels
                .par_iter()
                .map(|&(t, p, _)| {
                    let (ri, ii) = invert_displacement(d1, t, p, NEWTON_MAX_ITER, NEWTON_TOL);
                    deflect_angle(t, p, ri, ii)
                })
                .collect()
        });
        self.store_angles(key, &out)?;
        Ok(out)
    }

    fn surface_key(
        grad: &HarmonicCoefficients,
        curl: Option<&HarmonicCoefficients>,
        spin: usize,
    ) -> u64
    {
        let mut h = rustc_hash::FxHasher::default();
        grad.fingerprint_into(&mut h);
        if let Some(c) = curl {
            c.fingerprint_into(&mut h);
        }
        std::hash::Hasher::write_usize(&mut h, spin);
        std::hash::Hasher::finish(&h)
    }

    fn ensure_surface(
        &mut self,
        key: u64,
        grad: &HarmonicCoefficients,
        curl: Option<&HarmonicCoefficients>,
        spin: usize,
    ) -> Result<(), DelensError>
    {
        if !self.surfaces.contains_key(&key) {
            let patch = self.patch();
            let surf = InterpolationSurface::build(&self.backend, grad, curl, spin, &patch)?;
            while self.surfaces.len() >= SURFACE_CACHE_CAP {
                self.surfaces.shift_remove_index(0);
            }
            self.surfaces.insert(key, surf);
        }
        Ok(())
    }

    /// Deflected field in position space: evaluate the field's interpolation
    /// surface at the forward (or backward) angles of every band pixel, and
    /// embed into the full grid, zero outside the band. One map for spin 0,
    /// a pair for spin > 0.
    pub fn deflected_map(
        &mut self,
        grad: &HarmonicCoefficients,
        curl: Option<&HarmonicCoefficients>,
        spin: usize,
        backwards: bool,
    ) -> Result<Vec<Vec<f64>>, DelensError>
    {
        if spin > crate::sht::MAX_SPIN {
            return Err(DelensError::SpinNotSupported);
        }
        if let Some(c) = curl {
            if c.layout != grad.layout {
                return Err(DelensError::AlmSizeMismatch);
            }
        }
        let key = Self::surface_key(grad, curl, spin);
        self.ensure_surface(key, grad, curl, spin)?;
        let angles =
            if backwards { self.backward_angles()? } else { self.forward_angles()? };
        let surf = self.surfaces.get(&key).ok_or(DelensError::CacheMiss)?;
        let values = self.pool.install(|| surf.eval_many(&angles));

        let grid = self.backend.grid();
        let ncomp = if spin == 0 { 1 } else { 2 };
        let mut out = Vec::with_capacity(ncomp);
        for comp in 0..ncomp {
            let band_vals: Vec<f64> = values.iter().map(|v| v[comp]).collect();
            out.push(grid.embed_band(&band_vals, &self.band)?);
        }
        Ok(out)
    }

    /// The remapping operator: deflect `(grad, curl)` as a spin field and
    /// return harmonic coefficients at the requested output layout.
    /// Forward composed with backward approximates the identity up to
    /// interpolation and band-limit truncation.
    pub fn remap(
        &mut self,
        grad: &HarmonicCoefficients,
        curl: Option<&HarmonicCoefficients>,
        spin: usize,
        out_layout: AlmLayout,
        backwards: bool,
    ) -> Result<Vec<HarmonicCoefficients>, DelensError>
    {
        let maps = self.deflected_map(grad, curl, spin, backwards)?;
        self.backend.analysis(&maps, spin, out_layout)
    }

    /// Band-compacted map of the approximate forward magnification
    /// determinant (1 - kappa)^2 + omega^2 - |gamma|^2, from the
    /// convergence/shear/rotation decomposition of the deflection.
    pub fn fwd_magnification(&mut self) -> Result<Vec<f64>, DelensError>
    {
        let layout = self.field.layout();
        let lmax = layout.lmax;
        let fl_k: Vec<f64> = (0..=lmax).map(|l| 0.5 * ((l * (l + 1)) as f64).sqrt()).collect();
        let fl_g: Vec<f64> = (0..=lmax)
            .map(|l| if l >= 2 { 0.5 * (((l + 2) * (l - 1)) as f64).sqrt() } else { 0.0 })
            .collect();

        let kappa = self.backend.synthesis(&self.field.grad().almxfl(&fl_k), None, 0)?;
        let zero;
        let curl = match self.field.curl() {
            Some(c) => c,
            None => {
                zero = HarmonicCoefficients::zero(layout);
                &zero
            }
        };
        let shear = self.backend.synthesis(
            &self.field.grad().almxfl(&fl_g),
            Some(&curl.almxfl(&fl_g)),
            2,
        )?;
        let omega = self.backend.synthesis(&curl.almxfl(&fl_k), None, 0)?;

        let grid = self.backend.grid();
        let m: Vec<f64> = (0..grid.npix())
            .map(|i| {
                let k = kappa[0][i];
                (1.0 - k) * (1.0 - k) + omega[0][i] * omega[0][i]
                    - shear[0][i] * shear[0][i]
                    - shear[1][i] * shear[1][i]
            })
            .collect();
        grid.compact_band(&m, &self.band)
    }
}
