use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::StatusCode;

use crate::{
    config::Config, models::bert::sequence_classification::artifact, utils::env::Credentials,
};

/// Hugging Face Hub REST endpoint
pub static HF_API_BASE: &str = "https://huggingface.co/api";

/// Files that must be present in an artifact directory before it is published
pub const REQUIRED_FILES: &[&str] = &[
    artifact::WEIGHTS_FILE,
    artifact::CONFIG_FILE,
    artifact::TOKENIZER_FILE,
];

/// Publish Error
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    /// No access token was found in the credentials
    #[error("no Hugging Face token available")]
    MissingToken,

    /// The repository id is not `{owner}/{name}`
    #[error("invalid repository id {0}, expected owner/name")]
    InvalidRepoId(String),

    /// The artifact is incomplete
    #[error("artifact file {0} is missing")]
    MissingFile(PathBuf),

    /// Reading the artifact failed
    #[error("unable to read artifact: {0}")]
    Io(#[from] std::io::Error),

    /// The request could not be sent
    #[error("request to the Hugging Face Hub failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The Hub answered with an error status
    #[error("Hugging Face Hub rejected {action} with HTTP {status}: {body}")]
    Rejected {
        /// What was attempted
        action: String,
        /// The response status
        status: StatusCode,
        /// The response body
        body: String,
    },
}

/// Sends a trained artifact to a model repository
#[async_trait]
pub trait Publisher {
    /// Publish the contents of `artifact_dir` to `repo_id`, returning the
    /// uploaded paths within the repository
    async fn publish(&self, artifact_dir: &Path, repo_id: &str)
        -> Result<Vec<String>, PublishError>;
}

/// A [`Publisher`] uploading to the Hugging Face Hub: the model repository is
/// created when missing, then every artifact file is uploaded to `main`
pub struct HubPublisher {
    token: String,
    api_base: String,
    client: reqwest::Client,
}

impl HubPublisher {
    /// Creates a new publisher talking to `api_base`
    pub fn new(token: String, api_base: &str) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("text-classifier/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// A publisher using the Hugging Face token from the credentials
    pub fn from_credentials(credentials: &Credentials) -> Result<Self, PublishError> {
        let token = credentials.hf_token().ok_or(PublishError::MissingToken)?;

        Self::new(token, HF_API_BASE)
    }

    /// Create the model repository. An existing repository is fine.
    async fn create_repo(&self, repo_id: &str) -> Result<(), PublishError> {
        let (owner, name) = split_repo_id(repo_id)?;

        let response = self
            .client
            .post(format!("{}/repos/create", self.api_base))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "name": name,
                "organization": owner,
                "type": "model",
            }))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                debug!("Repository {} already exists", repo_id);
                Ok(())
            }
            status => Err(PublishError::Rejected {
                action: format!("creating {repo_id}"),
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Upload one local file to `path_in_repo`
    async fn upload_file(
        &self,
        repo_id: &str,
        local_path: &Path,
        path_in_repo: &str,
    ) -> Result<(), PublishError> {
        let content = tokio::fs::read(local_path).await?;

        let response = self
            .client
            .put(upload_url(&self.api_base, repo_id, path_in_repo))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Rejected {
                action: format!("uploading {path_in_repo}"),
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        debug!("Uploaded {} to {}", path_in_repo, repo_id);

        Ok(())
    }
}

#[async_trait]
impl Publisher for HubPublisher {
    async fn publish(
        &self,
        artifact_dir: &Path,
        repo_id: &str,
    ) -> Result<Vec<String>, PublishError> {
        split_repo_id(repo_id)?;
        let files = artifact_files(artifact_dir).await?;

        self.create_repo(repo_id).await?;

        let mut uploaded = Vec::with_capacity(files.len());
        for (local_path, path_in_repo) in files {
            self.upload_file(repo_id, &local_path, &path_in_repo).await?;
            uploaded.push(path_in_repo);
        }

        Ok(uploaded)
    }
}

/// Split `{owner}/{name}`
fn split_repo_id(repo_id: &str) -> Result<(&str, &str), PublishError> {
    match repo_id.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(PublishError::InvalidRepoId(repo_id.to_string())),
    }
}

/// The endpoint a single file is uploaded to on the `main` branch
pub fn upload_url(api_base: &str, repo_id: &str, path_in_repo: &str) -> String {
    format!("{api_base}/models/{repo_id}/upload/main/{path_in_repo}")
}

/// Every regular file of `artifact_dir` with its name in the repository, sorted
/// by name. Fails when one of [`REQUIRED_FILES`] is missing.
pub async fn artifact_files(artifact_dir: &Path) -> Result<Vec<(PathBuf, String)>, PublishError> {
    for required in REQUIRED_FILES {
        let path = artifact_dir.join(required);
        if !path.is_file() {
            return Err(PublishError::MissingFile(path));
        }
    }

    let mut files = Vec::new();

    let mut entries = tokio::fs::read_dir(artifact_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            let name = entry.file_name().to_string_lossy().to_string();
            files.push((entry.path(), name));
        }
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));

    Ok(files)
}

/// Publish the artifact when a target repository is configured. Failures are
/// logged and never abort the run.
pub async fn publish_if_configured(config: &Config, credentials: &Credentials, artifact_dir: &Path) {
    let Some(repo_id) = config.publish_target() else {
        return;
    };

    let publisher = match HubPublisher::from_credentials(credentials) {
        Ok(publisher) => publisher,
        Err(e) => {
            warn!("Skipping publishing to {}: {}", repo_id, e);
            return;
        }
    };

    match publisher.publish(artifact_dir, repo_id).await {
        Ok(uploaded) => info!("Uploaded {} files to {}", uploaded.len(), repo_id),
        Err(e) => warn!("Publishing to {} failed: {}", repo_id, e),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn artifact(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), name).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn lists_every_artifact_file() {
        let dir = artifact(&["tokenizer.json", "model.mpk", "config.json"]);
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let files = artifact_files(dir.path()).await.unwrap();

        let names: Vec<&str> = files.iter().map(|(_, name)| name.as_str()).collect();
        assert_eq!(names, vec!["config.json", "model.mpk", "tokenizer.json"]);
        assert_eq!(files[1].0, dir.path().join("model.mpk"));
    }

    #[tokio::test]
    async fn refuses_incomplete_artifacts() {
        let without_weights = artifact(&["config.json", "tokenizer.json"]);
        let without_config = artifact(&["model.mpk", "tokenizer.json"]);

        assert!(matches!(
            artifact_files(without_weights.path()).await,
            Err(PublishError::MissingFile(path)) if path.ends_with("model.mpk")
        ));
        assert!(matches!(
            artifact_files(without_config.path()).await,
            Err(PublishError::MissingFile(path)) if path.ends_with("config.json")
        ));
    }

    #[tokio::test]
    async fn rejects_malformed_repo_ids_before_any_request() {
        let dir = artifact(&["model.mpk", "config.json", "tokenizer.json"]);
        let publisher = HubPublisher::new("token".to_string(), "http://127.0.0.1:9").unwrap();

        for repo_id in ["no-owner", "/name", "owner/", "a/b/c"] {
            assert!(matches!(
                publisher.publish(dir.path(), repo_id).await,
                Err(PublishError::InvalidRepoId(_))
            ));
        }
    }

    #[test]
    fn uploads_to_the_main_branch() {
        assert_eq!(
            upload_url(HF_API_BASE, "org/model", "model.mpk"),
            "https://huggingface.co/api/models/org/model/upload/main/model.mpk"
        );
    }

    #[test]
    fn requires_a_token() {
        let credentials = Credentials::parse(&format!("{}=", crate::utils::env::HUGGINGFACE_TOKEN));

        assert!(matches!(
            HubPublisher::from_credentials(&credentials),
            Err(PublishError::MissingToken)
        ));
    }
}
