//! Synthetic correlation data.
//!
//! Deterministic generator used by tests and by the diffusion-law analyzer
//! when no real image stack is wired in: each pixel gets the analytic model
//! curve plus seeded Gaussian noise, reproducible per pixel regardless of
//! evaluation order.

pub mod sample;

pub use sample::*;
