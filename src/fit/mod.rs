//! Fitting engines.
//!
//! Responsibilities:
//!
//! - hold the fit configuration: parameter values, free/fixed mask, bounds,
//!   fit-channel window, warm-start policy (`config`)
//! - run one weighted nonlinear least-squares solve per pixel (`standard`)
//! - run many independent fits in one data-parallel batched call (`batch`)

pub mod batch;
pub mod config;
pub mod standard;

pub use batch::*;
pub use config::*;
pub use standard::*;
