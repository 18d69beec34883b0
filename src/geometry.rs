//! Iso-latitude ring grids and longitude-band windows.
//!
//! An [`AngularGrid`] is an ordered set of iso-latitude rings, each with a
//! colatitude, a pixel count, a first-pixel longitude and an integration
//! weight. A [`LongitudeBand`] restricts which pixels of a ring count as
//! inside a patch, bounding the cost of the interpolation machinery.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::hash::{Hash, Hasher};

use crate::errors::DelensError;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ring
{
    /// Colatitude in radians, in (0, pi) for quadrature grids.
    pub theta: f64,
    /// Number of equidistant pixels on the ring.
    pub nph: usize,
    /// Longitude of the first pixel.
    pub phi0: f64,
    /// Index of the first pixel in the flat map ordering.
    pub ofs: usize,
    /// Quadrature weight (already includes the 2 pi / nph longitude measure).
    pub weight: f64,
}

impl Ring
{
    #[inline]
    pub fn phi(&self, j: usize) -> f64
    {
        (self.phi0 + j as f64 * (2.0 * PI / self.nph as f64)).rem_euclid(2.0 * PI)
    }
}

/// Ordered sequence of iso-latitude rings, sorted by colatitude.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AngularGrid
{
    rings: Vec<Ring>,
    npix: usize,
}

impl AngularGrid
{
    /// Build from rings; sorts by colatitude and assigns pixel offsets.
    pub fn new(mut rings: Vec<Ring>) -> Self
    {
        rings.sort_by(|a, b| a.theta.total_cmp(&b.theta));
        let mut ofs = 0;
        for r in rings.iter_mut() {
            r.ofs = ofs;
            ofs += r.nph;
        }
        Self { rings, npix: ofs }
    }

    /// Standard Gauss-Legendre grid: exact analysis up to degree nlat - 1.
    pub fn gauss(nlat: usize, nlon: usize) -> Self
    {
        let (nodes, weights) = gauss_legendre(nlat);
        let rings = nodes
            .iter()
            .zip(weights.iter())
            .map(|(&x, &w)| Ring {
                theta: x.acos(),
                nph: nlon,
                phi0: 0.0,
                ofs: 0,
                weight: w * (2.0 * PI / nlon as f64),
            })
            .collect();
        Self::new(rings)
    }

    /// Cylindrical grid equidistant in longitude and latitude between the
    /// given colatitude bounds, endpoints included. Carries trapezoidal
    /// weights; meant for synthesis and interpolation, not exact analysis.
    pub fn ecp(nlat: usize, nlon: usize, phi_center: f64, tbounds: (f64, f64)) -> Self
    {
        let t0 = tbounds.0.min(tbounds.1).max(0.0);
        let t1 = tbounds.0.max(tbounds.1).min(PI);
        let dt = (t1 - t0) / (nlat - 1) as f64;
        let w = 2.0 * PI / nlon as f64 * dt;
        let rings = (0..nlat)
            .map(|i| Ring {
                theta: t0 + i as f64 * dt,
                nph: nlon,
                phi0: phi_center - PI,
                ofs: 0,
                weight: if i == 0 || i == nlat - 1 { 0.5 * w } else { w },
            })
            .collect();
        Self::new(rings)
    }

    pub fn nrings(&self) -> usize
    {
        self.rings.len()
    }

    pub fn npix(&self) -> usize
    {
        self.npix
    }

    pub fn ring(&self, ir: usize) -> &Ring
    {
        &self.rings[ir]
    }

    pub fn rings(&self) -> &[Ring]
    {
        &self.rings
    }

    /// Colatitude range spanned by the rings.
    pub fn theta_bounds(&self) -> (f64, f64)
    {
        (self.rings.first().map_or(0.0, |r| r.theta), self.rings.last().map_or(PI, |r| r.theta))
    }

    /// Longitudes of all pixels of ring `ir`, in ring order.
    pub fn phis(&self, ir: usize) -> Vec<f64>
    {
        let r = &self.rings[ir];
        (0..r.nph).map(|j| r.phi(j)).collect()
    }

    /// Local pixel indices of ring `ir` falling inside `band`, in ring order.
    pub fn ring_pixels_in_band(&self, ir: usize, band: &LongitudeBand) -> Vec<usize>
    {
        let r = &self.rings[ir];
        (0..r.nph).filter(|&j| band.contains(r.phi(j))).collect()
    }

    /// Total number of pixels inside `band`.
    pub fn band_npix(&self, band: &LongitudeBand) -> usize
    {
        if band.is_full() {
            return self.npix;
        }
        (0..self.nrings()).map(|ir| self.ring_pixels_in_band(ir, band).len()).sum()
    }

    /// Compact a full map to its band-restricted pixels, ring by ring.
    /// Inverse of [`AngularGrid::embed_band`]; identity for a full band.
    pub fn compact_band(&self, map: &[f64], band: &LongitudeBand) -> Result<Vec<f64>, DelensError>
    {
        if map.len() != self.npix {
            return Err(DelensError::PixelCountMismatch);
        }
        if band.is_full() {
            return Ok(map.to_vec());
        }
        let mut out = Vec::with_capacity(self.band_npix(band));
        for (ir, r) in self.rings.iter().enumerate() {
            for j in self.ring_pixels_in_band(ir, band) {
                out.push(map[r.ofs + j]);
            }
        }
        Ok(out)
    }

    /// Scatter a band-compacted map back onto the full grid, zero outside.
    pub fn embed_band(&self, bandmap: &[f64], band: &LongitudeBand) -> Result<Vec<f64>, DelensError>
    {
        if band.is_full() {
            if bandmap.len() != self.npix {
                return Err(DelensError::PixelCountMismatch);
            }
            return Ok(bandmap.to_vec());
        }
        if bandmap.len() != self.band_npix(band) {
            return Err(DelensError::PixelCountMismatch);
        }
        let mut out = vec![0.0; self.npix];
        let mut start = 0;
        for (ir, r) in self.rings.iter().enumerate() {
            for j in self.ring_pixels_in_band(ir, band) {
                out[r.ofs + j] = bandmap[start];
                start += 1;
            }
        }
        Ok(out)
    }

    /// Structural content hash, for external caching layers.
    pub fn fingerprint(&self) -> u64
    {
        let mut h = rustc_hash::FxHasher::default();
        for r in &self.rings {
            r.theta.to_bits().hash(&mut h);
            r.nph.hash(&mut h);
            r.phi0.to_bits().hash(&mut h);
            r.weight.to_bits().hash(&mut h);
        }
        h.finish()
    }
}

/// Longitude window: a center and an angular half-width, modulo 2 pi.
/// Half-width pi (full width 2 pi or more) covers the whole sky.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LongitudeBand
{
    center: f64,
    half_width: f64,
}

impl LongitudeBand
{
    /// From a center and a *full* width in radians. Widths of 2 pi or more
    /// collapse to the full sky; negative widths are a contract error.
    pub fn new(center: f64, width: f64) -> Result<Self, DelensError>
    {
        if !(width >= 0.0) {
            return Err(DelensError::BandHalfWidthOutOfRange);
        }
        Ok(Self { center: center.rem_euclid(2.0 * PI), half_width: (0.5 * width).min(PI) })
    }

    pub fn full() -> Self
    {
        Self { center: PI, half_width: PI }
    }

    pub fn center(&self) -> f64
    {
        self.center
    }

    pub fn half_width(&self) -> f64
    {
        self.half_width
    }

    pub fn width(&self) -> f64
    {
        2.0 * self.half_width
    }

    pub fn is_full(&self) -> bool
    {
        self.half_width >= PI
    }

    /// True if the angular distance from the band center is within the
    /// half-width, wrapping modulo 2 pi.
    #[inline]
    pub fn contains(&self, phi: f64) -> bool
    {
        let dph = (phi - self.center).rem_euclid(2.0 * PI);
        dph <= self.half_width || (2.0 * PI - dph) <= self.half_width
    }

    pub fn fingerprint(&self) -> u64
    {
        let mut h = rustc_hash::FxHasher::default();
        self.center.to_bits().hash(&mut h);
        self.half_width.to_bits().hash(&mut h);
        h.finish()
    }
}

/// Gauss-Legendre nodes (descending in x = cos theta) and weights, by Newton
/// iteration on the Legendre polynomial.
pub fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>)
{
    let mut nodes = vec![0.0; n];
    let mut weights = vec![0.0; n];
    for i in 0..n {
        let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut dp = 0.0;
        for _ in 0..100 {
            // P_n(x) and its derivative via the standard upward recurrence
            let (mut p0, mut p1) = (1.0, x);
            for k in 2..=n {
                let p2 = ((2 * k - 1) as f64 * x * p1 - (k - 1) as f64 * p0) / k as f64;
                p0 = p1;
                p1 = p2;
            }
            dp = n as f64 * (x * p1 - p0) / (x * x - 1.0);
            let dx = p1 / dp;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        nodes[i] = x;
        weights[i] = 2.0 / ((1.0 - x * x) * dp * dp);
    }
    (nodes, weights)
}
