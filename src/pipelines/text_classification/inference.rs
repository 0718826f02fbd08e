use burn::tensor::backend::Backend;
use log::{debug, info};

use crate::datasets::Table;

use super::{metrics, Batcher, Classifier, Preparer};

/// Anything that maps texts to class ids, one per text and in the same order
pub trait Predictor {
    /// Predict a class id for every text
    fn predict(&self, texts: &[String]) -> anyhow::Result<Vec<usize>>;
}

/// A [`Predictor`] running a trained [`Classifier`]
pub struct ModelPredictor<B: Backend, M> {
    /// The trained model, in evaluation mode
    model: M,

    /// Tokenization, identical to training
    preparer: Preparer,

    /// Collates token ids into tensors on the target device
    batcher: Batcher<B>,
}

impl<B: Backend, M: Classifier<B>> ModelPredictor<B, M> {
    /// Creates a new predictor
    pub fn new(model: M, preparer: Preparer, device: B::Device) -> Self {
        let batcher = Batcher::new(
            preparer.pad_token_id() as usize,
            preparer.max_length(),
            device,
        );

        Self {
            model,
            preparer,
            batcher,
        }
    }
}

impl<B: Backend, M: Classifier<B>> Predictor for ModelPredictor<B, M> {
    fn predict(&self, texts: &[String]) -> anyhow::Result<Vec<usize>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let samples = texts
            .iter()
            .map(|text| self.preparer.encode(text))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let probabilities = self.model.infer(self.batcher.collate(samples));
        let [_, n_classes] = probabilities.dims();

        let scores = probabilities.into_data().convert::<f32>().value;

        Ok(scores.chunks(n_classes).map(metrics::argmax).collect())
    }
}

/// Runs a [`Predictor`] over a table in fixed-size chunks
#[derive(Clone, Copy, Debug)]
pub struct Runner {
    batch_size: usize,
}

impl Runner {
    /// Creates a new runner. A batch size of zero is treated as one.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Predict every row of `table` and return a copy whose `target` column
    /// holds the predictions. Row order and all other columns are preserved.
    pub fn run<P: Predictor + ?Sized>(&self, predictor: &P, table: &Table) -> anyhow::Result<Table> {
        let texts = table.texts()?;
        let mut predictions = Vec::with_capacity(texts.len());

        for (i, chunk) in texts.chunks(self.batch_size).enumerate() {
            let batch = predictor.predict(chunk)?;

            if batch.len() != chunk.len() {
                return Err(anyhow!(
                    "Predictor returned {} labels for {} texts",
                    batch.len(),
                    chunk.len()
                ));
            }

            predictions.extend(batch);
            debug!("Predicted batch {} ({} rows so far)", i + 1, predictions.len());
        }

        Ok(table.with_targets(&predictions)?)
    }
}

/// Predict a class for every row of `table` with a trained model
pub fn infer<B: Backend, M: Classifier<B>>(
    device: B::Device, // Device on which to perform computation (e.g., CPU or CUDA device)
    model: M,          // The trained model
    preparer: Preparer, // Tokenization settings used during training
    table: &Table,     // Rows to classify
    batch_size: usize, // Rows per forward pass
) -> anyhow::Result<Table> {
    info!("Running inference on {} rows...", table.len());

    let predictor = ModelPredictor::new(model, preparer, device);

    Runner::new(batch_size).run(&predictor, table)
}
