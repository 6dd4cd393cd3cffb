pub mod config;
pub mod error;
pub mod series;

pub use config::{DistanceWeights, MagnitudeNorm, SearchConfig};
pub use error::*;
pub use series::{Fingerprint, Series};
