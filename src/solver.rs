//! Preconditioned conjugate gradients over the operator seams.
//!
//! The solver sees only [`LinearOp`] and [`DotOp`]; everything it needs to
//! know about deflection, beams and noise is baked into the forward
//! operator. Hitting the iteration cap is reported, never silently accepted:
//! the caller gets the best iterate plus a convergence flag and decides
//! whether to continue or abort.

use crate::alm::HarmonicCoefficients;
use crate::errors::DelensError;
use crate::filter::{DotOp, LinearOp};

#[derive(Copy, Clone, Debug)]
pub struct CgParams
{
    /// Relative residual threshold, measured in the `DotOp` norm.
    pub tol: f64,
    pub max_iter: usize,
}

impl Default for CgParams
{
    fn default() -> Self
    {
        Self { tol: 1e-7, max_iter: 150 }
    }
}

/// Outcome of a solve: the iterate lives in the caller's buffer.
#[derive(Copy, Clone, Debug)]
pub struct CgReport
{
    pub iterations: usize,
    pub residual: f64,
    pub converged: bool,
}

/// Solve `fwd(x) = rhs`, starting from the current content of `x`.
pub fn solve(
    x: &mut HarmonicCoefficients,
    rhs: &HarmonicCoefficients,
    fwd: &mut dyn LinearOp,
    precond: &mut dyn LinearOp,
    dot: &DotOp,
    params: &CgParams,
) -> Result<CgReport, DelensError>
{
    if x.layout != rhs.layout {
        return Err(DelensError::AlmSizeMismatch);
    }
    let b_norm = dot.dot(rhs, rhs)?;
    if b_norm == 0.0 {
        x.scale(0.0);
        return Ok(CgReport { iterations: 0, residual: 0.0, converged: true });
    }

    let mut r = rhs.clone();
    let ax = fwd.apply(x)?;
    r.axpy(-1.0, &ax);
    let mut z = precond.apply(&r)?;
    let mut p = z.clone();
    let mut rz = dot.dot(&r, &z)?;
    let mut residual = (dot.dot(&r, &r)? / b_norm).sqrt();

    for iter in 1..=params.max_iter {
        let ap = fwd.apply(&p)?;
        let pap = dot.dot(&p, &ap)?;
        if pap <= 0.0 {
            // operator lost positive definiteness in the dot norm
            log::warn!("cg breakdown at iteration {iter}: p.Ap = {pap:.3e}");
            return Ok(CgReport { iterations: iter, residual, converged: false });
        }
        let alpha = rz / pap;
        x.axpy(alpha, &p);
        r.axpy(-alpha, &ap);
        residual = (dot.dot(&r, &r)? / b_norm).sqrt();
        log::debug!("cg iteration {iter}: residual {residual:.3e}");
        if residual < params.tol {
            return Ok(CgReport { iterations: iter, residual, converged: true });
        }
        z = precond.apply(&r)?;
        let rz_next = dot.dot(&r, &z)?;
        let beta = rz_next / rz;
        rz = rz_next;
        p.scale(beta);
        p.axpy(1.0, &z);
    }
    log::warn!(
        "cg did not converge within {} iterations, residual {residual:.3e}",
        params.max_iter
    );
    Ok(CgReport { iterations: params.max_iter, residual, converged: false })
}
