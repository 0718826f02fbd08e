use std::path::Path;

use hf_hub::{api::tokio::ApiBuilder, Repo, RepoType};
use log::{debug, info};

use super::Table;

/// The dataset split used for training
static TRAIN_SPLIT: &str = "train";

/// The files of a dataset repository that hold its training split, in order.
/// Parquet shards are preferred, as written by `push_to_hub`; a CSV file is used
/// when the repository has no parquet data.
pub fn train_split_files(filenames: &[String]) -> Vec<String> {
    let mut parquet: Vec<String> = filenames
        .iter()
        .filter(|name| name.ends_with(".parquet") && in_split(name, TRAIN_SPLIT))
        .cloned()
        .collect();

    if !parquet.is_empty() {
        parquet.sort();
        return parquet;
    }

    filenames
        .iter()
        .find(|name| name.ends_with(".csv"))
        .cloned()
        .into_iter()
        .collect()
}

/// `data/train-00000-of-00001.parquet` and `default/train/0000.parquet` both
/// belong to the `train` split
fn in_split(name: &str, split: &str) -> bool {
    let mut parts = name.split('/').rev();
    let file = parts.next().unwrap_or_default();

    file.starts_with(&format!("{split}-"))
        || file.starts_with(&format!("{split}."))
        || parts.any(|dir| dir == split)
}

/// Make sure the training CSV exists locally, fetching it from the Hub dataset
/// repository `{organization}/datacentric-{train_name}` when it does not.
/// Local files are always preferred.
pub async fn ensure_local(
    train_path: &Path,
    organization: &str,
    train_name: &str,
    token: Option<String>,
) -> anyhow::Result<()> {
    if train_path.exists() {
        debug!("Using local training data at {}", train_path.display());
        return Ok(());
    }

    let repo_id = format!("{organization}/datacentric-{train_name}");
    info!(
        "No local data at {}, downloading {} from the Hugging Face Hub",
        train_path.display(),
        repo_id
    );

    let api = ApiBuilder::new()
        .with_token(token)
        .build()
        .map_err(|e| anyhow!("Unable to reach the Hugging Face Hub: {}", e))?
        .repo(Repo::new(repo_id.clone(), RepoType::Dataset));

    let filenames: Vec<String> = api
        .info()
        .await
        .map_err(|e| anyhow!("Unable to list dataset {}: {}", repo_id, e))?
        .siblings
        .into_iter()
        .map(|sibling| sibling.rfilename)
        .collect();

    let files = train_split_files(&filenames);
    if files.is_empty() {
        return Err(anyhow!(
            "Dataset {} has no {} split in parquet or CSV",
            repo_id,
            TRAIN_SPLIT
        ));
    }

    let mut cached = Vec::with_capacity(files.len());
    for file in &files {
        debug!("Downloading {} from {}", file, repo_id);
        cached.push(
            api.get(file)
                .await
                .map_err(|e| anyhow!("Failed to download {} from {}: {}", file, repo_id, e))?,
        );
    }

    if let Some(parent) = train_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if files[0].ends_with(".parquet") {
        let table = Table::from_parquet(&cached)?;
        table.write_csv(train_path)?;
        info!(
            "Converted {} rows from {} parquet files",
            table.len(),
            files.len()
        );
    } else {
        tokio::fs::copy(&cached[0], train_path).await?;
    }

    info!("Dataset saved to {}", train_path.display());

    Ok(())
}
