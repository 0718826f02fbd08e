use std::fmt::Debug;

use burn::{
    data::dataloader,
    tensor::{backend::Backend, Bool, Data, ElementConversion, Int, Shape, Tensor},
};
use derive_new::new;

use super::TokenizedSample;

/// An inference batch for text classification
#[derive(Debug, Clone, new)]
pub struct Infer<B: Backend> {
    /// Tokenized text as 2D tensor: [batch_size, max_seq_length]
    pub tokens: Tensor<B, 2, Int>,

    /// Padding mask for the tokenized text containing booleans for padding locations
    pub mask_pad: Tensor<B, 2, Bool>,
}

/// A training batch for text classification
#[derive(Clone, Debug, new)]
pub struct Train<B: Backend> {
    /// Bert Model input
    pub input: Infer<B>,

    /// Class ids for the batch
    pub targets: Tensor<B, 1, Int>,
}

/// Collates tokenized samples into tensor batches. The padding mask comes from
/// each sample's attention mask, so the padding id never decides what is masked.
#[derive(Clone, new)]
pub struct Batcher<B: Backend> {
    /// ID of the padding token, used to fill sequences shorter than the longest one
    pad_token_id: usize,

    /// Maximum sequence length for tokenized text
    max_seq_length: usize,

    /// Device on which to perform computation (e.g., CPU or CUDA device)
    device: B::Device,
}

impl<B: Backend> Batcher<B> {
    /// Stack token ids and attention masks into an inference batch. Sequences
    /// are cut at `max_seq_length` and padded up to the longest one.
    pub fn collate(&self, samples: Vec<(Vec<u32>, Vec<bool>)>) -> Infer<B> {
        let batch_size = samples.len();
        let seq_length = samples
            .iter()
            .map(|(ids, _)| ids.len())
            .max()
            .unwrap_or(0)
            .min(self.max_seq_length);

        let mut tokens: Vec<B::IntElem> = Vec::with_capacity(batch_size * seq_length);
        let mut mask_pad: Vec<bool> = Vec::with_capacity(batch_size * seq_length);

        for (token_ids, attention_mask) in samples {
            for position in 0..seq_length {
                match token_ids.get(position) {
                    Some(id) => {
                        tokens.push((*id as i64).elem());
                        mask_pad.push(!attention_mask.get(position).copied().unwrap_or(true));
                    }
                    None => {
                        tokens.push((self.pad_token_id as i64).elem());
                        mask_pad.push(true);
                    }
                }
            }
        }

        let shape = Shape::new([batch_size, seq_length]);

        Infer {
            tokens: Tensor::from_data(Data::new(tokens, shape.clone()), &self.device),
            mask_pad: Tensor::from_data(Data::new(mask_pad, shape), &self.device),
        }
    }
}

/// Implement Batcher trait for Batcher struct for training and validation
impl<B: Backend> dataloader::batcher::Batcher<TokenizedSample, Train<B>> for Batcher<B> {
    /// Collects a vector of tokenized samples into a training batch
    fn batch(&self, items: Vec<TokenizedSample>) -> Train<B> {
        let batch_size = items.len();

        let mut samples = Vec::with_capacity(batch_size);
        let mut class_id_list = Vec::with_capacity(batch_size);

        for item in items {
            class_id_list.push(Tensor::from_data(
                Data::from([(item.label as i64).elem()]),
                &self.device,
            ));
            samples.push((item.token_ids, item.attention_mask));
        }

        Train {
            input: self.collate(samples),
            targets: Tensor::cat(class_id_list, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::NdArray,
        data::dataloader::batcher::Batcher as _,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    type TestBackend = NdArray;

    fn sample(token_ids: Vec<u32>, label: usize) -> TokenizedSample {
        let attention_mask = token_ids.iter().map(|id| *id != 0).collect();

        TokenizedSample {
            token_ids,
            attention_mask,
            label,
        }
    }

    #[test]
    fn stacks_fixed_length_samples() {
        let batcher = Batcher::<TestBackend>::new(0, 4, Default::default());

        let batch = batcher.batch(vec![sample(vec![5, 6, 0, 0], 1), sample(vec![7, 0, 0, 0], 0)]);

        assert_eq!(batch.input.tokens.dims(), [2, 4]);
        assert_eq!(
            batch.input.tokens.into_data().convert::<i64>().value,
            vec![5, 6, 0, 0, 7, 0, 0, 0]
        );
        assert_eq!(
            batch.input.mask_pad.into_data().value,
            vec![false, false, true, true, false, true, true, true]
        );
        assert_eq!(batch.targets.into_data().convert::<i64>().value, vec![1, 0]);
    }

    #[test]
    fn pads_variable_length_sequences() {
        let batcher = Batcher::<TestBackend>::new(0, 8, Default::default());

        let batch = batcher.collate(vec![
            (vec![3, 4, 5], vec![true, true, true]),
            (vec![6], vec![true]),
        ]);

        assert_eq!(batch.tokens.dims(), [2, 3]);
        assert_eq!(
            batch.tokens.into_data().convert::<i64>().value,
            vec![3, 4, 5, 6, 0, 0]
        );
        assert_eq!(
            batch.mask_pad.into_data().value,
            vec![false, false, false, false, true, true]
        );
    }

    #[test]
    fn masks_follow_the_attention_mask_not_the_padding_id() {
        // Id 0 is a real start token in this vocabulary, padding is 1
        let batcher = Batcher::<TestBackend>::new(1, 4, Default::default());

        let batch = batcher.collate(vec![(vec![0, 7, 2, 1], vec![true, true, true, false])]);

        assert_eq!(
            batch.mask_pad.into_data().value,
            vec![false, false, false, true]
        );
    }

    #[test]
    fn cuts_sequences_at_the_maximum_length() {
        let batcher = Batcher::<TestBackend>::new(0, 2, Default::default());

        let batch = batcher.collate(vec![(vec![3, 4, 5], vec![true, true, true])]);

        assert_eq!(batch.tokens.dims(), [1, 2]);
    }
}
