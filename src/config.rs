use std::path::{Path, PathBuf};

use burn::LearningRate;

use crate::{
    cli::models::{Model, KLUE_BERT_BASE},
    pipelines::text_classification,
};

/// The location of the experiment configuration when none is given on the command line
pub static DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

/// Top-level experiment configuration, loaded once at startup
#[derive(burn::config::Config)]
pub struct Config {
    /// Random seed for the split, the data loader shuffle and the backend
    pub seed: u64,

    /// Enables debug logging
    #[config(default = false)]
    pub debug: bool,

    /// Device preference: "auto", "cpu" or "cuda"
    #[config(default = "\"auto\".to_string()")]
    pub device: String,

    /// Credentials file with HUGGINGFACE_TOKEN and friends
    #[config(default = "\"setup/.env\".to_string()")]
    pub env_file: String,

    /// Data locations and preparation settings
    pub data: DataConfig,

    /// Training hyperparameters
    pub train: TrainConfig,

    /// The pretrained model to fine-tune
    pub model: ModelConfig,

    /// Experiment metadata
    pub exp: ExperimentConfig,

    /// Experiment-tracking identifiers
    pub tracking: TrackingConfig,

    /// Hugging Face Hub settings, used for dataset download and publishing
    pub huggingface: Option<HubConfig>,
}

/// Data locations and preparation settings
#[derive(burn::config::Config)]
pub struct DataConfig {
    /// The location of the top-level data directory
    #[config(default = "\"data\".to_string()")]
    pub data_dir: String,

    /// Training file stem, read from `{data_dir}/{train_name}.csv`
    pub train_name: String,

    /// Test file stem, read from `{data_dir}/{test_name}.csv`
    #[config(default = "\"test\".to_string()")]
    pub test_name: String,

    /// Where checkpoints, the trained model and `output.csv` are written
    pub output_dir: String,

    /// Fraction of the training rows held out for validation
    pub test_size: f64,

    /// Maximum sequence length in tokens
    pub max_length: usize,
}

/// Training hyperparameters
#[derive(burn::config::Config)]
pub struct TrainConfig {
    /// Training batch size
    pub train_batch_size: usize,

    /// Validation batch size
    pub eval_batch_size: usize,

    /// Initial learning rate, decayed linearly to zero
    pub lr: LearningRate,

    /// Number of epochs
    #[config(default = 2)]
    pub num_epochs: usize,

    /// AdamW weight decay
    #[config(default = 0.01)]
    pub weight_decay: f32,

    /// AdamW beta 1
    #[config(default = 0.9)]
    pub adam_beta1: f32,

    /// AdamW beta 2
    #[config(default = 0.999)]
    pub adam_beta2: f32,

    /// AdamW epsilon
    #[config(default = 1e-8)]
    pub adam_epsilon: f32,

    /// Maximum number of epoch checkpoints kept on disk
    #[config(default = 2)]
    pub save_total_limit: usize,

    /// Report per-class metrics after training
    #[config(default = true)]
    pub detailed_metrics: bool,

    /// Rows per forward pass during inference
    #[config(default = 1)]
    pub inference_batch_size: usize,

    /// Data loader workers, defaults to the available parallelism
    pub num_workers: Option<usize>,
}

/// The pretrained model to fine-tune
#[derive(burn::config::Config)]
pub struct ModelConfig {
    /// Model name on the Hugging Face Hub, defaulting to the text classification
    /// pipeline's default model
    #[config(default = "default_model_name()")]
    pub name: String,

    /// Number of target classes
    #[config(default = 7)]
    pub num_labels: usize,
}

fn default_model_name() -> String {
    Model::default_for(text_classification::PIPELINE)
        .unwrap_or_else(|| Model::Bert(KLUE_BERT_BASE.to_string()))
        .to_string()
}

/// Experiment metadata
#[derive(burn::config::Config)]
pub struct ExperimentConfig {
    /// Who is running the experiment, used in the run name
    pub username: String,
}

/// Experiment-tracking identifiers
#[derive(burn::config::Config)]
pub struct TrackingConfig {
    /// Project the run belongs to
    pub project: String,

    /// Team or user that owns the project
    pub entity: String,
}

/// Hugging Face Hub settings
#[derive(burn::config::Config)]
pub struct HubConfig {
    /// Organization hosting the `datacentric-*` datasets
    #[config(default = "\"paper-company\".to_string()")]
    pub organization: String,

    /// Model repository the trained artifact is published to
    pub repo_id: Option<String>,
}

/// Configuration Error
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("unable to read config file {path}: {source}")]
    Io {
        /// The config file
        path: PathBuf,
        /// The underlying error
        source: std::io::Error,
    },

    /// A required key is missing or has the wrong type
    #[error("invalid config file {path}: {source}")]
    Invalid {
        /// The config file
        path: PathBuf,
        /// The underlying error
        source: serde_yaml::Error,
    },

    /// A key is present but its value is unusable
    #[error("invalid value for {key}: {reason}")]
    Value {
        /// The offending key
        key: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

impl Config {
    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml_str(&contents).map_err(|e| match e {
            ConfigError::Invalid { source, .. } => ConfigError::Invalid {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate a YAML configuration document
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::Invalid {
                path: PathBuf::new(),
                source,
            })?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.data.test_size;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::Value {
                key: "data.test_size",
                reason: format!("{fraction} is not between 0 and 1"),
            });
        }

        let positive = [
            ("data.max_length", self.data.max_length),
            ("train.train_batch_size", self.train.train_batch_size),
            ("train.eval_batch_size", self.train.eval_batch_size),
            ("train.num_epochs", self.train.num_epochs),
            ("train.inference_batch_size", self.train.inference_batch_size),
            ("train.save_total_limit", self.train.save_total_limit),
            ("model.num_labels", self.model.num_labels),
        ];

        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Value {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.train.lr <= 0.0 {
            return Err(ConfigError::Value {
                key: "train.lr",
                reason: format!("{} is not positive", self.train.lr),
            });
        }

        Ok(())
    }

    /// The training CSV
    pub fn train_path(&self) -> PathBuf {
        Path::new(&self.data.data_dir).join(format!("{}.csv", self.data.train_name))
    }

    /// The test CSV
    pub fn test_path(&self) -> PathBuf {
        Path::new(&self.data.data_dir).join(format!("{}.csv", self.data.test_name))
    }

    /// Where the prediction CSV is written
    pub fn output_path(&self) -> PathBuf {
        Path::new(&self.data.output_dir).join("output.csv")
    }

    /// Where the trained model, its config and the tokenizer are saved
    pub fn artifact_dir(&self) -> PathBuf {
        Path::new(&self.data.output_dir).join("model")
    }

    /// Where epoch checkpoints are kept during training
    pub fn checkpoint_dir(&self) -> PathBuf {
        Path::new(&self.data.output_dir).join("checkpoint")
    }

    /// The configured publish target, if any
    pub fn publish_target(&self) -> Option<&str> {
        self.huggingface
            .as_ref()
            .and_then(|hub| hub.repo_id.as_deref())
    }

    /// The Hub organization hosting the datasets
    pub fn hub_organization(&self) -> String {
        self.huggingface
            .as_ref()
            .map(|hub| hub.organization.clone())
            .unwrap_or_else(|| "paper-company".to_string())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const MINIMAL: &str = "
seed: 456
data:
  train_name: train
  output_dir: output
  test_size: 0.2
  max_length: 128
train:
  train_batch_size: 32
  eval_batch_size: 64
  lr: 5.0e-5
model: {}
exp:
  username: tester
tracking:
  project: text-classifier
  entity: team
";

    #[test]
    fn applies_defaults() {
        let config = Config::from_yaml_str(MINIMAL).unwrap();

        assert_eq!(config.seed, 456);
        assert!(!config.debug);
        assert_eq!(config.train.num_epochs, 2);
        assert_eq!(config.train.save_total_limit, 2);
        assert_eq!(config.train.inference_batch_size, 1);
        assert!(config.train.detailed_metrics);
        assert_eq!(config.model.name, "klue/bert-base");
        assert_eq!(config.model.num_labels, 7);
        assert_eq!(config.train_path(), PathBuf::from("data/train.csv"));
        assert_eq!(config.output_path(), PathBuf::from("output/output.csv"));
        assert_eq!(config.publish_target(), None);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let broken = MINIMAL.replace("seed: 456\n", "");

        let err = Config::from_yaml_str(&broken).unwrap_err();

        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
        assert!(err.to_string().contains("seed"), "{err}");
    }

    #[test]
    fn rejects_out_of_range_fraction() {
        let broken = MINIMAL.replace("test_size: 0.2", "test_size: 1.5");

        let err = Config::from_yaml_str(&broken).unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Value {
                key: "data.test_size",
                ..
            }
        ));
    }

    #[test]
    fn reads_publish_target() {
        let with_hub = format!("{MINIMAL}huggingface:\n  repo_id: org/model\n");

        let config = Config::from_yaml_str(&with_hub).unwrap();

        assert_eq!(config.publish_target(), Some("org/model"));
        assert_eq!(config.hub_organization(), "paper-company");
    }
}
