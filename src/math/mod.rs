//! Mathematical utilities: error function, Levenberg–Marquardt core, and
//! weighted linear regression.

pub mod erf;
pub mod linfit;
pub mod lm;

pub use erf::*;
pub use linfit::*;
pub use lm::*;
