use std::path::Path;

use burn::{
    config::Config as _,
    module::Module,
    record::{CompactRecorder, Recorder},
    tensor::backend::Backend,
};
use log::info;
use tokenizers::Tokenizer;

use super::{Config, Model};

/// The weights file, without the recorder's extension
pub const MODEL_FILE: &str = "model";

/// The weights file as written by the recorder
pub const WEIGHTS_FILE: &str = "model.mpk";

/// The model configuration file
pub const CONFIG_FILE: &str = "config.json";

/// The tokenizer file
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Write the weights, model configuration and tokenizer into `artifact_dir`
pub fn save<B: Backend>(
    model: Model<B>,
    config: &Config,
    tokenizer: &Tokenizer,
    artifact_dir: &Path,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(artifact_dir)?;

    config
        .save(artifact_dir.join(CONFIG_FILE))
        .map_err(|e| anyhow!("Unable to save model config: {}", e))?;

    model
        .save_file(artifact_dir.join(MODEL_FILE), &CompactRecorder::new())
        .map_err(|e| anyhow!("Unable to save trained model weights: {}", e))?;

    tokenizer
        .save(artifact_dir.join(TOKENIZER_FILE), false)
        .map_err(|e| anyhow!("Unable to save tokenizer: {}", e))?;

    info!("Saved model artifact to {}", artifact_dir.display());

    Ok(())
}

/// Load a model saved with [`save`], along with its configuration and tokenizer
pub fn load<B: Backend>(
    artifact_dir: &Path,
    device: &B::Device,
) -> anyhow::Result<(Model<B>, Config, Tokenizer)> {
    // Load experiment configuration
    let config = Config::load(artifact_dir.join(CONFIG_FILE))
        .map_err(|e| anyhow!("Unable to load config file: {}", e))?;

    // Load trained model weights
    let record = CompactRecorder::new()
        .load(artifact_dir.join(MODEL_FILE), device)
        .map_err(|e| anyhow!("Unable to load trained model weights: {}", e))?;

    // Create model using loaded weights
    let model = config.init::<B>(device).load_record(record);

    let tokenizer = Tokenizer::from_file(artifact_dir.join(TOKENIZER_FILE))
        .map_err(|e| anyhow!("Unable to load tokenizer: {}", e))?;

    Ok((model, config, tokenizer))
}
