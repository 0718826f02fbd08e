/// Bert for Sequence Classification
pub mod model;

/// The model configuration
pub mod config;

/// Training and validation steps
pub mod training;

/// Saving and loading fine-tuned artifacts
pub mod artifact;

pub use config::Config;
pub use model::{Model, ModelRecord};
