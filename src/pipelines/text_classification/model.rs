use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor},
};

use super::batcher;

/// A trait for models that can be used for Text Classification inference
pub trait Classifier<B: Backend>: Module<B> {
    /// Class probabilities for a batch: [batch_size, n_classes]
    fn infer(&self, input: batcher::Infer<B>) -> Tensor<B, 2>;
}
