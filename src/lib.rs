pub mod burn_ext;
pub mod checkpoint;
pub mod converter;
pub mod dataloader;
pub mod dataset;
pub mod device;
pub mod error;
pub mod metrics;
pub mod model;
pub mod parse_config;
pub mod tracker;
pub mod training;
pub mod utils;

pub use error::{CrnnError, Result};
