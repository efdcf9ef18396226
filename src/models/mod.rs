//! Analytic correlation model functions.
//!
//! Models are implemented as small, pure functions over a precomputed
//! [`ModelShape`] so the per-pixel and batched engines evaluate exactly the
//! same code.

pub mod model;

pub use model::*;
