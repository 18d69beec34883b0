//! Wigner small-d recurrences underlying the spin-weighted ring transforms.
//!
//! For each (ring, order) pair the transform needs the column
//! `d^l_{m1 m2}(theta)` over all degrees l. The column is seeded at
//! l = max(|m1|, |m2|) from the closed-form boundary element and carried
//! upward with the standard three-term degree recurrence.

use std::f64::consts::PI;

/// ln(k!) for k = 0..=n, by running summation.
pub fn ln_factorials(n: usize) -> Vec<f64>
{
    let mut table = vec![0.0; n + 1];
    for k in 1..=n {
        table[k] = table[k - 1] + (k as f64).ln();
    }
    table
}

/// d^l_{m1 m2}(theta) for l in 0..=lmax, zeros below l = max(|m1|, |m2|).
///
/// `lnfact` must cover indices up to 2 * max(|m1|, |m2|).
pub fn wigner_d_column(m1: i32, m2: i32, theta: f64, lmax: usize, lnfact: &[f64]) -> Vec<f64>
{
    let mut d = vec![0.0; lmax + 1];
    let j = m1.abs().max(m2.abs());
    let l0 = j as usize;
    if l0 > lmax {
        return d;
    }

    let x = theta.cos();
    let ch = (0.5 * theta).cos();
    let sh = (0.5 * theta).sin();

    // Reduce to the boundary form d^j_{j n} using the exact symmetries
    // d^l_{m1 m2} = (-1)^{m1-m2} d^l_{m2 m1} and d^l_{m1 m2} = d^l_{-m2 -m1}.
    let (n, sign) = if m1 == j {
        (m2, 1.0)
    } else if m1 == -j {
        (-m2, if (j + m2).rem_euclid(2) == 0 { 1.0 } else { -1.0 })
    } else if m2 == j {
        (m1, if (j + m1).rem_euclid(2) == 0 { 1.0 } else { -1.0 })
    } else {
        (-m1, 1.0)
    };
    // d^j_{j n} = sqrt((2j)! / ((j+n)!(j-n)!)) cos^{j+n}(t/2) (-sin(t/2))^{j-n}
    let ln_c = 0.5
        * (lnfact[2 * l0] - lnfact[(j + n) as usize] - lnfact[(j - n) as usize]);
    d[l0] = sign * ln_c.exp() * ch.powi(j + n) * (-sh).powi(j - n);

    if l0 == lmax {
        return d;
    }
    let (f1, f2) = (m1 as f64, m2 as f64);
    let mut start = l0;
    if l0 == 0 {
        // m1 = m2 = 0: the generic step is degenerate at l = 0
        d[1] = x;
        start = 1;
        if lmax == 1 {
            return d;
        }
    }
    for l in start..lmax {
        let lf = l as f64;
        let lp = lf + 1.0;
        let c_next = lf * ((lp * lp - f1 * f1) * (lp * lp - f2 * f2)).sqrt();
        let c_mid = (2.0 * lf + 1.0) * (lf * lp * x - f1 * f2);
        let c_prev = lp * ((lf * lf - f1 * f1) * (lf * lf - f2 * f2)).sqrt();
        d[l + 1] = (c_mid * d[l] - c_prev * d[l - 1]) / c_next;
    }
    d
}

/// Spin-weighted Legendre columns for order m >= 0 and spin s >= 0 at
/// colatitude theta:
///
/// `lam_p[l] = (-1)^m sqrt((2l+1)/4pi) d^l_{-m, s}` (spin +s harmonic) and
/// `lam_n[l] = (-1)^{s+m} sqrt((2l+1)/4pi) d^l_{-m,-s}` (spin -s harmonic;
/// the (-1)^s keeps the negative-spin expansion of a real field pair
/// consistent with a_{l,-m} = (-1)^m conj(a_{lm}) for odd spins too).
///
/// For s = 0 the two coincide and reduce to the ordinary theta-part of Y_lm.
pub fn lam_columns(
    spin: i32,
    m: usize,
    theta: f64,
    lmax: usize,
    lnfact: &[f64],
) -> (Vec<f64>, Vec<f64>)
{
    let mm = -(m as i32);
    let mut lam_p = wigner_d_column(mm, spin, theta, lmax, lnfact);
    let mut lam_n = if spin == 0 {
        lam_p.clone()
    } else {
        let mut col = wigner_d_column(mm, -spin, theta, lmax, lnfact);
        if spin % 2 == 1 {
            for v in col.iter_mut() {
                *v = -*v;
            }
        }
        col
    };
    let parity = if m % 2 == 0 { 1.0 } else { -1.0 };
    for l in 0..=lmax {
        let norm = parity * ((2 * l + 1) as f64 / (4.0 * PI)).sqrt();
        lam_p[l] *= norm;
        lam_n[l] *= norm;
    }
    (lam_p, lam_n)
}
