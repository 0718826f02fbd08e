/// Text Classification Items
pub mod item;

/// Dataset preparation: splitting and tokenization
pub mod preparer;

/// Batcher
pub mod batcher;

/// Classification metrics
pub mod metrics;

/// Common model traits for text classification
pub mod model;

/// Training
pub mod training;

/// Inference
pub mod inference;

pub use batcher::Batcher;
pub use inference::{infer, Predictor, Runner};
pub use item::{Item, TokenizedSample};
pub use metrics::{Detail, Snapshot};
pub use model::Classifier;
pub use preparer::Preparer;
pub use training::{train, Orchestrator, Outcome, Trainer};

/// The unique string token that identifies this pipeline
pub static PIPELINE: &str = "text-classification";
