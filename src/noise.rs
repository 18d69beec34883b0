//! Pixel-domain inverse-noise weighting of Q/U map pairs.
//!
//! Two covariance shapes: one inverse-variance map weighting both Stokes
//! components (optionally with a set of contaminant templates marginalized
//! out), or the full symmetric 2x2 per-pixel covariance as QQ/QU/UU maps.
//! Templates with the full covariance are not a supported combination.
//! `apply_map` mutates its arguments in place and is self-adjoint under the
//! flat pixel inner product.

use once_cell::sync::OnceCell;
use std::f64::consts::PI;
use std::hash::Hasher;

use crate::errors::DelensError;

/// Low-rank basis of contaminant modes over the concatenated (Q, U) pixel
/// vector, with the lazily inverted Gram matrix (T^t N^-1 T)^-1.
#[derive(Debug)]
pub struct TemplateBasis
{
    modes: Vec<Vec<f64>>,
    npix: usize,
    tniti: OnceCell<Vec<Vec<f64>>>,
}

impl TemplateBasis
{
    /// Each mode spans the concatenated Q and U halves (length 2 npix).
    pub fn new(modes: Vec<Vec<f64>>) -> Result<Self, DelensError>
    {
        if modes.is_empty() || modes[0].is_empty() || modes[0].len() % 2 != 0 {
            return Err(DelensError::NoiseMapLengthMismatch);
        }
        let len = modes[0].len();
        if modes.iter().any(|m| m.len() != len) {
            return Err(DelensError::NoiseMapLengthMismatch);
        }
        Ok(Self { modes, npix: len / 2, tniti: OnceCell::new() })
    }

    pub fn nmodes(&self) -> usize
    {
        self.modes.len()
    }

    pub fn npix(&self) -> usize
    {
        self.npix
    }

    /// T^t x for the concatenated pixel pair.
    pub fn dot(&self, q: &[f64], u: &[f64]) -> Vec<f64>
    {
        self.modes
            .iter()
            .map(|t| {
                let sq: f64 = t[..self.npix].iter().zip(q).map(|(a, b)| a * b).sum();
                let su: f64 = t[self.npix..].iter().zip(u).map(|(a, b)| a * b).sum();
                sq + su
            })
            .collect()
    }

    /// x += T c.
    pub fn accum(&self, q: &mut [f64], u: &mut [f64], coeffs: &[f64])
    {
        for (t, &c) in self.modes.iter().zip(coeffs) {
            for (dst, src) in q.iter_mut().zip(&t[..self.npix]) {
                *dst += c * src;
            }
            for (dst, src) in u.iter_mut().zip(&t[self.npix..]) {
                *dst += c * src;
            }
        }
    }

    /// (T^t N^-1 T)^-1, computed once against the given inverse-variance map
    /// and cached.
    fn tniti(&self, ninv: &[f64]) -> Result<&Vec<Vec<f64>>, DelensError>
    {
        if let Some(g) = self.tniti.get() {
            return Ok(g);
        }
        let n = self.nmodes();
        let mut gram = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i..n {
                let mut acc = 0.0;
                for (p, &w) in ninv.iter().enumerate() {
                    acc += w
                        * (self.modes[i][p] * self.modes[j][p]
                            + self.modes[i][self.npix + p] * self.modes[j][self.npix + p]);
                }
                gram[i][j] = acc;
                gram[j][i] = acc;
            }
        }
        let inv = invert_symmetric(gram)?;
        Ok(self.tniti.get_or_init(|| inv))
    }
}

/// Gauss-Jordan inverse with partial pivoting; the template Gram matrices
/// this sees are small and dense.
fn invert_symmetric(mut a: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>, DelensError>
{
    let n = a.len();
    let mut inv: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .ok_or(DelensError::SingularTemplateGram)?;
        if a[pivot][col].abs() < 1e-300 {
            return Err(DelensError::SingularTemplateGram);
        }
        a.swap(col, pivot);
        inv.swap(col, pivot);
        let d = a[col][col];
        for v in a[col].iter_mut() {
            *v /= d;
        }
        for v in inv[col].iter_mut() {
            *v /= d;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let f = a[row][col];
            if f == 0.0 {
                continue;
            }
            for j in 0..n {
                a[row][j] -= f * a[col][j];
                inv[row][j] -= f * inv[col][j];
            }
        }
    }
    Ok(inv)
}

#[derive(Debug)]
enum NoiseModel
{
    Scalar
    {
        ninv: Vec<f64>,
        templates: Option<TemplateBasis>,
    },
    FullCov
    {
        qq: Vec<f64>,
        qu: Vec<f64>,
        uu: Vec<f64>,
    },
}

/// Inverse-noise-covariance operator over a grid's pixel space.
#[derive(Debug)]
pub struct NoiseOperator
{
    model: NoiseModel,
    npix: usize,
}

impl NoiseOperator
{
    /// From a list of inverse-variance maps as the original data products
    /// come: one map (QQ = UU, scalar weighting) or three (QQ, QU, UU).
    /// Templates are only supported with scalar weighting.
    pub fn new(mut maps: Vec<Vec<f64>>, templates: Option<TemplateBasis>)
        -> Result<Self, DelensError>
    {
        match maps.len() {
            1 => {
                let ninv = maps.pop().ok_or(DelensError::NoiseMapLengthMismatch)?;
                Self::scalar(ninv, templates)
            }
            3 => {
                if templates.is_some() {
                    return Err(DelensError::TemplatesWithFullCovariance);
                }
                let uu = maps.pop().ok_or(DelensError::NoiseMapLengthMismatch)?;
                let qu = maps.pop().ok_or(DelensError::NoiseMapLengthMismatch)?;
                let qq = maps.pop().ok_or(DelensError::NoiseMapLengthMismatch)?;
                Self::full_cov(qq, qu, uu)
            }
            _ => Err(DelensError::NoiseMapLengthMismatch),
        }
    }

    pub fn scalar(ninv: Vec<f64>, templates: Option<TemplateBasis>) -> Result<Self, DelensError>
    {
        let npix = ninv.len();
        if let Some(t) = &templates {
            if t.npix() != npix {
                return Err(DelensError::NoiseMapLengthMismatch);
            }
        }
        Ok(Self { model: NoiseModel::Scalar { ninv, templates }, npix })
    }

    pub fn full_cov(qq: Vec<f64>, qu: Vec<f64>, uu: Vec<f64>) -> Result<Self, DelensError>
    {
        let npix = qq.len();
        if qu.len() != npix || uu.len() != npix {
            return Err(DelensError::NoiseMapLengthMismatch);
        }
        Ok(Self { model: NoiseModel::FullCov { qq, qu, uu }, npix })
    }

    pub fn npix(&self) -> usize
    {
        self.npix
    }

    pub fn has_templates(&self) -> bool
    {
        matches!(&self.model, NoiseModel::Scalar { templates: Some(_), .. })
    }

    /// The single inverse-variance map of a scalar model, if that is the
    /// shape of this operator.
    pub fn scalar_ninv(&self) -> Option<&[f64]>
    {
        match &self.model {
            NoiseModel::Scalar { ninv, .. } => Some(ninv),
            NoiseModel::FullCov { .. } => None,
        }
    }

    /// Multiply the pixel pair by the inverse noise covariance, in place.
    /// With templates present, their span is projected out of the weighted
    /// maps through the cached Gram inverse.
    pub fn apply_map(&self, q: &mut [f64], u: &mut [f64]) -> Result<(), DelensError>
    {
        if q.len() != self.npix || u.len() != self.npix {
            return Err(DelensError::PixelCountMismatch);
        }
        match &self.model {
            NoiseModel::Scalar { ninv, templates } => {
                for (v, n) in q.iter_mut().zip(ninv) {
                    *v *= n;
                }
                for (v, n) in u.iter_mut().zip(ninv) {
                    *v *= n;
                }
                if let Some(t) = templates {
                    let coeffs = t.dot(q, u);
                    let gram_inv = t.tniti(ninv)?;
                    let c: Vec<f64> = gram_inv
                        .iter()
                        .map(|row| row.iter().zip(&coeffs).map(|(a, b)| a * b).sum())
                        .collect();
                    let mut pq = vec![0.0; self.npix];
                    let mut pu = vec![0.0; self.npix];
                    t.accum(&mut pq, &mut pu, &c);
                    for ((dst, p), n) in q.iter_mut().zip(&pq).zip(ninv) {
                        *dst -= p * n;
                    }
                    for ((dst, p), n) in u.iter_mut().zip(&pu).zip(ninv) {
                        *dst -= p * n;
                    }
                }
            }
            NoiseModel::FullCov { qq, qu, uu } => {
                for i in 0..self.npix {
                    let q0 = q[i];
                    q[i] = qq[i] * q0 + qu[i] * u[i];
                    u[i] = uu[i] * u[i] + qu[i] * q0;
                }
            }
        }
        Ok(())
    }

    /// Effective polarization noise level in uK-arcmin, the harmonic proxy
    /// feeding the diagonal preconditioner.
    pub fn nlev_febl(&self) -> f64
    {
        let mean = match &self.model {
            NoiseModel::Scalar { ninv, .. } => ninv.iter().sum::<f64>(),
            NoiseModel::FullCov { qq, uu, .. } => {
                0.5 * qq.iter().sum::<f64>() + uu.iter().sum::<f64>()
            }
        };
        10800.0 / (mean / (4.0 * PI)).sqrt() / PI
    }

    pub fn fingerprint(&self) -> u64
    {
        let mut h = rustc_hash::FxHasher::default();
        match &self.model {
            NoiseModel::Scalar { ninv, templates } => {
                h.write_u8(1);
                for v in ninv {
                    h.write_u64(v.to_bits());
                }
                if let Some(t) = templates {
                    for mode in &t.modes {
                        for v in mode {
                            h.write_u64(v.to_bits());
                        }
                    }
                }
            }
            NoiseModel::FullCov { qq, qu, uu } => {
                h.write_u8(3);
                for m in [qq, qu, uu] {
                    for v in m {
                        h.write_u64(v.to_bits());
                    }
                }
            }
        }
        h.finish()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_maps(npix: usize, seed: u64) -> (Vec<f64>, Vec<f64>)
    {
        let mut rng = StdRng::seed_from_u64(seed);
        (
            (0..npix).map(|_| rng.gen::<f64>() - 0.5).collect(),
            (0..npix).map(|_| rng.gen::<f64>() - 0.5).collect(),
        )
    }

    fn pix_dot(a: &(Vec<f64>, Vec<f64>), b: &(Vec<f64>, Vec<f64>)) -> f64
    {
        a.0.iter().zip(&b.0).map(|(x, y)| x * y).sum::<f64>()
            + a.1.iter().zip(&b.1).map(|(x, y)| x * y).sum::<f64>()
    }

    #[test]
    fn scalar_operator_is_self_adjoint()
    {
        let npix = 257;
        let mut rng = StdRng::seed_from_u64(1);
        let ninv: Vec<f64> = (0..npix).map(|_| rng.gen::<f64>() + 0.1).collect();
        let op = NoiseOperator::scalar(ninv, None).unwrap();
        let a = random_maps(npix, 2);
        let b = random_maps(npix, 3);
        let mut na = a.clone();
        op.apply_map(&mut na.0, &mut na.1).unwrap();
        let mut nb = b.clone();
        op.apply_map(&mut nb.0, &mut nb.1).unwrap();
        let lhs = pix_dot(&b, &na);
        let rhs = pix_dot(&a, &nb);
        assert!((lhs - rhs).abs() < 1e-11 * lhs.abs().max(1.0));
    }

    #[test]
    fn full_covariance_operator_is_self_adjoint()
    {
        let npix = 129;
        let mut rng = StdRng::seed_from_u64(5);
        let qq: Vec<f64> = (0..npix).map(|_| rng.gen::<f64>() + 1.0).collect();
        let uu: Vec<f64> = (0..npix).map(|_| rng.gen::<f64>() + 1.0).collect();
        let qu: Vec<f64> = (0..npix).map(|_| 0.3 * (rng.gen::<f64>() - 0.5)).collect();
        let op = NoiseOperator::full_cov(qq, qu, uu).unwrap();
        let a = random_maps(npix, 6);
        let b = random_maps(npix, 7);
        let mut na = a.clone();
        op.apply_map(&mut na.0, &mut na.1).unwrap();
        let mut nb = b.clone();
        op.apply_map(&mut nb.0, &mut nb.1).unwrap();
        assert!((pix_dot(&b, &na) - pix_dot(&a, &nb)).abs() < 1e-11);
    }

    #[test]
    fn template_modes_are_projected_out()
    {
        let npix = 200;
        let mut rng = StdRng::seed_from_u64(9);
        let ninv: Vec<f64> = (0..npix).map(|_| rng.gen::<f64>() + 0.5).collect();
        let modes: Vec<Vec<f64>> = (0..3)
            .map(|k| {
                (0..2 * npix)
                    .map(|p| ((p + k) as f64 * 0.01).sin() + if p % (k + 2) == 0 { 0.4 } else { 0.0 })
                    .collect()
            })
            .collect();
        let basis = TemplateBasis::new(modes.clone()).unwrap();
        let op = NoiseOperator::scalar(ninv, Some(basis)).unwrap();
        let (mut q, mut u) = random_maps(npix, 10);
        op.apply_map(&mut q, &mut u).unwrap();
        // the weighted, deprojected map is orthogonal to every template mode
        let scale: f64 = q.iter().map(|v| v * v).sum::<f64>().sqrt();
        for t in &modes {
            let dot: f64 = t[..npix].iter().zip(&q).map(|(a, b)| a * b).sum::<f64>()
                + t[npix..].iter().zip(&u).map(|(a, b)| a * b).sum::<f64>();
            assert!(dot.abs() < 1e-9 * scale.max(1.0), "residual template amplitude {dot}");
        }
    }

    #[test]
    fn template_projection_is_self_adjoint()
    {
        let npix = 120;
        let mut rng = StdRng::seed_from_u64(11);
        let ninv: Vec<f64> = (0..npix).map(|_| rng.gen::<f64>() + 0.5).collect();
        let modes: Vec<Vec<f64>> =
            (0..2).map(|k| (0..2 * npix).map(|p| ((p * (k + 1)) as f64 * 0.02).cos()).collect()).collect();
        let op = NoiseOperator::scalar(ninv, Some(TemplateBasis::new(modes).unwrap())).unwrap();
        let a = random_maps(npix, 12);
        let b = random_maps(npix, 13);
        let mut na = a.clone();
        op.apply_map(&mut na.0, &mut na.1).unwrap();
        let mut nb = b.clone();
        op.apply_map(&mut nb.0, &mut nb.1).unwrap();
        let lhs = pix_dot(&b, &na);
        let rhs = pix_dot(&a, &nb);
        assert!((lhs - rhs).abs() < 1e-10 * lhs.abs().max(1.0));
    }

    #[test]
    fn templates_with_full_covariance_are_rejected()
    {
        let npix = 16;
        let maps = vec![vec![1.0; npix]; 3];
        let basis = TemplateBasis::new(vec![vec![1.0; 2 * npix]]).unwrap();
        assert_eq!(
            NoiseOperator::new(maps, Some(basis)).unwrap_err(),
            DelensError::TemplatesWithFullCovariance
        );
    }
}
