use std::{collections::HashMap, fmt::Display};

use lazy_static::lazy_static;

use crate::pipelines::text_classification;

/// The base model type
pub static BERT: &str = "bert";

/// klue/bert-base
pub static KLUE_BERT_BASE: &str = "klue/bert-base";

/// bert-base-multilingual-cased
pub static BASE_MULTILINGUAL_CASED: &str = "bert-base-multilingual-cased";

/// bert-base-uncased
pub static BASE_UNCASED: &str = "bert-base-uncased";

/// bert-base-cased
pub static BASE_CASED: &str = "bert-base-cased";

/// Available models to use with Bert for Text Classification
pub static TEXT_CLASSIFICATION_MODELS: &[&str; 4] = &[
    KLUE_BERT_BASE,
    BASE_MULTILINGUAL_CASED,
    BASE_UNCASED,
    BASE_CASED,
];

lazy_static! {
    /// Default model for each pipeline
    pub static ref DEFAULT_MODEL_BY_PIPELINE: HashMap<&'static str, &'static str> =
        [(text_classification::PIPELINE, KLUE_BERT_BASE)]
            .iter()
            .copied()
            .collect();
}

/// A pretrained model known to work with a pipeline
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Model {
    /// The BERT family of models, with the specific model name contained within
    Bert(String),
}

impl Model {
    /// Get the model type
    pub fn model_type(&self) -> &str {
        match self {
            Model::Bert(_) => BERT,
        }
    }

    /// Check if the model is valid for the given pipeline
    pub fn is_supported(&self, pipeline: &str) -> bool {
        match self {
            Model::Bert(name) => {
                pipeline == text_classification::PIPELINE
                    && TEXT_CLASSIFICATION_MODELS.contains(&name.as_str())
            }
        }
    }

    /// The default model for a pipeline
    pub fn default_for(pipeline: &str) -> Option<Self> {
        DEFAULT_MODEL_BY_PIPELINE
            .get(pipeline)
            .map(|name| Model::Bert(name.to_string()))
    }
}

impl Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Model::Bert(name) = self;

        write!(f, "{}", name)
    }
}

impl TryFrom<&str> for Model {
    type Error = ModelError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if TEXT_CLASSIFICATION_MODELS.contains(&value) {
            Ok(Model::Bert(value.to_string()))
        } else {
            Err(ModelError::Unknown(value.to_string()))
        }
    }
}

/// Model Error
#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    /// No model found for the given string
    #[error("no model found for {0}")]
    Unknown(String),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn resolves_known_models() {
        let model = Model::try_from("klue/bert-base").unwrap();

        assert_eq!(model.model_type(), "bert");
        assert!(model.is_supported(text_classification::PIPELINE));
        assert!(!model.is_supported("token-classification"));
    }

    #[test]
    fn rejects_unknown_models() {
        assert!(matches!(
            Model::try_from("gpt2"),
            Err(ModelError::Unknown(name)) if name == "gpt2"
        ));
    }

    #[test]
    fn defaults_to_klue_for_text_classification() {
        assert_eq!(
            Model::default_for(text_classification::PIPELINE),
            Some(Model::Bert(KLUE_BERT_BASE.to_string()))
        );
    }
}
