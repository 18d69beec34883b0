//! CMB lensing remapping and inverse-variance Wiener filtering on
//! iso-latitude ring grids.
//!
//! The crate reconstructs the gravitational-lensing deflection imprinted on
//! CMB polarization: a [`remapping::DeflectionEngine`] deflects spin-weighted
//! fields through cached bicubic interpolation surfaces, the
//! [`filter`] operators compose it with transfer functions and a
//! [`noise::NoiseOperator`] into the implicit linear system a conjugate
//! gradient [`solver`] inverts, and the [`estimator`] machinery turns the
//! Wiener-filtered solution into gradient/curl quadratic-estimator
//! coefficients.

pub mod alm;
pub mod cache;
pub mod errors;
pub mod estimator;
pub mod filter;
pub mod geometry;
pub mod interp;
pub mod noise;
pub mod remapping;
pub mod sht;
pub mod solver;
