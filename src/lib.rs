//! `fcs-fit` library crate.
//!
//! Curve-fitting engine for imaging fluorescence correlation spectroscopy
//! (FCS): a parametric model library for the supported acquisition
//! geometries, a per-pixel nonlinear least-squares engine, a batched
//! data-parallel engine for whole-grid throughput, and the diffusion-law
//! sweep built on top of both.
//!
//! The raw correlation computation is *not* part of this crate: the engines
//! only consume per-pixel `(acf, variance)` curves aligned to a shared lag
//! time series, produced by an external correlator.

pub mod data;
pub mod difflaw;
pub mod domain;
pub mod error;
pub mod fit;
pub mod math;
pub mod models;
