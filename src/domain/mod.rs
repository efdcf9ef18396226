//! Domain types used throughout the fitting engine.
//!
//! This module defines:
//!
//! - the acquisition geometry selector (`GeometryKind`)
//! - the named fit parameter vector (`FitParameters`)
//! - per-pixel observed curves and fit outputs (`PixelSample`, `PixelResult`)
//! - acquisition settings from which model shapes are derived
//! - physical unit-conversion constants

pub mod types;

pub use types::*;
