use std::{collections::BTreeMap, path::PathBuf};

use bert_burn::model::BertModelConfig;
use burn::{config::Config as _, nn::LinearConfig, tensor::backend::Backend};

use super::Model;

/// The Model Configuration, saved next to the fine-tuned weights as `config.json`
#[derive(burn::config::Config)]
pub struct Config {
    // -- Fields copied from BertModelConfig because #[serde(flatten)] is not supported yet
    /// Number of attention heads in the multi-head attention
    pub num_attention_heads: usize,
    /// Number of transformer encoder layers/blocks
    pub num_hidden_layers: usize,
    /// Layer normalization epsilon
    pub layer_norm_eps: f64,
    /// Size of bert embedding (e.g., 768 for klue/bert-base)
    pub hidden_size: usize,
    /// Size of the intermediate position wise feedforward layer
    pub intermediate_size: usize,
    /// Size of the vocabulary
    pub vocab_size: usize,
    /// Max position embeddings, for BERT equal to max_seq_len (512)
    pub max_position_embeddings: usize,
    /// Identifier for sentence type in input (e.g., 0 for single sentence, 1 for pair)
    pub type_vocab_size: usize,
    /// Dropout value across layers, typically 0.1
    pub hidden_dropout_prob: f64,
    /// BERT model name (bert)
    pub model_type: String,
    /// Index of the padding token
    pub pad_token_id: usize,
    /// Maximum sequence length for the tokenizer
    pub max_seq_len: Option<usize>,
    /// Whether to add a pooling layer to the model
    pub with_pooling_layer: Option<bool>,
    // -- End fields copied from BertModelConfig
    /// A map from class ids to class name labels
    pub id2label: BTreeMap<usize, String>,
}

impl Config {
    /// Combine a base BERT configuration with `num_labels` generic class names
    pub fn new_with_labels(model: BertModelConfig, num_labels: usize) -> Self {
        let id2label = (0..num_labels).map(|i| (i, format!("LABEL_{i}"))).collect();

        Config::new(
            model.num_attention_heads,
            model.num_hidden_layers,
            model.layer_norm_eps,
            model.hidden_size,
            model.intermediate_size,
            model.vocab_size,
            model.max_position_embeddings,
            model.type_vocab_size,
            model.hidden_dropout_prob,
            model.model_type,
            model.pad_token_id,
            id2label,
        )
        .with_max_seq_len(model.max_seq_len)
        .with_with_pooling_layer(model.with_pooling_layer)
    }

    /// Load a Hugging Face `config.json` for sequence classification
    pub fn load_pretrained(
        config_file: PathBuf,
        num_labels: usize,
        max_length: usize,
    ) -> anyhow::Result<Self> {
        let mut bert_config = BertModelConfig::load(config_file)
            .map_err(|e| anyhow!("Unable to load Hugging Face Config file: {}", e))?;

        // Enable the pooling layer for sequence classification
        bert_config.with_pooling_layer = Some(true);
        bert_config.max_seq_len = Some(max_length);

        if num_labels == 0 {
            return Err(anyhow!("Classes are not defined in the model configuration"));
        }

        Ok(Config::new_with_labels(bert_config, num_labels))
    }

    /// Get the Bert model configuration
    pub fn get_bert_config(&self) -> BertModelConfig {
        BertModelConfig::new(
            self.num_attention_heads,
            self.num_hidden_layers,
            self.layer_norm_eps,
            self.hidden_size,
            self.intermediate_size,
            self.vocab_size,
            self.max_position_embeddings,
            self.type_vocab_size,
            self.hidden_dropout_prob,
            self.model_type.clone(),
            self.pad_token_id,
        )
        .with_max_seq_len(self.max_seq_len)
        .with_with_pooling_layer(self.with_pooling_layer)
    }

    /// Number of output classes
    pub fn n_classes(&self) -> usize {
        self.id2label.len()
    }

    /// Initialize the model with default weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let model = self.get_bert_config().init(device);

        let n_classes = self.n_classes();

        let output = LinearConfig::new(self.hidden_size, n_classes).init(device);

        Model {
            model,
            output,
            n_classes,
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::config::Config as _;
    use pretty_assertions::assert_eq;

    use super::*;

    fn base() -> BertModelConfig {
        BertModelConfig::new(2, 1, 1e-12, 8, 16, 10, 16, 2, 0.1, "bert".to_string(), 0)
    }

    #[test]
    fn generates_generic_labels() {
        let config = Config::new_with_labels(base(), 3);

        assert_eq!(config.n_classes(), 3);
        assert_eq!(config.id2label[&2], "LABEL_2");
    }

    #[test]
    fn round_trips_the_base_config() {
        let config = Config::new_with_labels(base().with_with_pooling_layer(Some(true)), 7);

        let bert = config.get_bert_config();

        assert_eq!(bert.hidden_size, 8);
        assert_eq!(bert.pad_token_id, 0);
        assert_eq!(bert.with_pooling_layer, Some(true));
    }

    #[test]
    fn saves_and_loads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::new_with_labels(base(), 7);

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.id2label, config.id2label);
        assert_eq!(loaded.vocab_size, 10);
    }
}
