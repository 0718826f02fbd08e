use std::path::PathBuf;

use hf_hub::api::tokio::{ApiBuilder, ApiRepo};
use log::debug;

/// Local paths of a pretrained model's files, inside the Hugging Face cache
#[derive(Clone, Debug)]
pub struct PretrainedFiles {
    /// `config.json`
    pub config: PathBuf,

    /// `model.safetensors`
    pub weights: PathBuf,

    /// `tokenizer.json`
    pub tokenizer: PathBuf,
}

/// Download model config, weights and tokenizer from Hugging Face Hub
/// If file exists in cache, it will not be downloaded again
// NOTE: Modified from the built-in function to work within an already-async context
pub async fn download_hf_model(
    model_name: &str,
    token: Option<String>,
) -> anyhow::Result<PretrainedFiles> {
    let api = ApiBuilder::new()
        .with_token(token)
        .build()
        .map_err(|e| anyhow!("Unable to reach the Hugging Face Hub: {}", e))?;
    let repo = api.model(model_name.to_string());

    Ok(PretrainedFiles {
        config: fetch(&repo, model_name, "config.json").await?,
        weights: fetch(&repo, model_name, "model.safetensors").await?,
        tokenizer: fetch(&repo, model_name, "tokenizer.json").await?,
    })
}

async fn fetch(repo: &ApiRepo, model_name: &str, file: &str) -> anyhow::Result<PathBuf> {
    debug!("Fetching {} from {}", file, model_name);

    repo.get(file).await.map_err(|e| {
        anyhow!(
            "Failed to download: {} file with name: {} from HuggingFace Hub: {}",
            model_name,
            file,
            e
        )
    })
}
