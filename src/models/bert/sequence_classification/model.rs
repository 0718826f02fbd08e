use std::path::PathBuf;

use bert_burn::{
    data::BertInferenceBatch,
    model::{BertModel, BertModelOutput},
};
use burn::{
    module::Module,
    nn::{loss::CrossEntropyLossConfig, Linear, LinearConfig},
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use derive_new::new;

use crate::pipelines::text_classification::{batcher, Classifier};

use super::Config;

/// BERT for sequence Classification
#[derive(Module, Debug, new)]
pub struct Model<B: Backend> {
    /// The base BERT model
    pub model: BertModel<B>,

    /// Linear layer for sequence classification
    pub output: Linear<B>,

    /// Total number of classes
    pub n_classes: usize,
}

/// Define model behavior
impl<B: Backend> Model<B> {
    /// Load pretrained encoder weights from a safetensors file, with a freshly
    /// initialized classification head
    pub fn from_safetensors(
        device: &B::Device,
        model_file: PathBuf,
        config: &Config,
    ) -> anyhow::Result<Self> {
        if config.id2label.is_empty() {
            return Err(anyhow!("Classes are not defined in the model configuration"));
        }

        let bert_config = config.get_bert_config();
        let record = BertModel::from_safetensors(model_file, device, bert_config.clone());

        // Initialize the linear output
        let output = LinearConfig::new(config.hidden_size, config.n_classes()).init(device);

        Ok(Model {
            model: bert_config.init(device).load_record(record),
            output,
            n_classes: config.n_classes(),
        })
    }

    /// Class logits: [batch_size, n_classes]
    fn logits(&self, input: BertInferenceBatch<B>) -> Tensor<B, 2> {
        let [batch_size, _seq_length] = input.tokens.dims();

        let BertModelOutput {
            pooled_output,
            hidden_states,
        } = self.model.forward(input);

        self.output
            .forward(pooled_output.unwrap_or(hidden_states))
            .slice([0..batch_size, 0..1])
            .reshape([batch_size, self.n_classes])
    }

    /// Defines forward pass for training
    pub fn forward(
        &self,
        input: BertInferenceBatch<B>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let device = &self.model.devices()[0];
        let targets = targets.to_device(device);

        let output = self.logits(input);

        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput {
            loss,
            output,
            targets,
        }
    }

    /// Defines forward pass for inference
    pub fn infer(&self, input: BertInferenceBatch<B>) -> Tensor<B, 2> {
        softmax(self.logits(input), 1)
    }
}

impl<B: Backend> Classifier<B> for Model<B> {
    fn infer(&self, input: batcher::Infer<B>) -> Tensor<B, 2> {
        Model::infer(
            self,
            BertInferenceBatch {
                tokens: input.tokens,
                mask_pad: input.mask_pad,
            },
        )
    }
}
