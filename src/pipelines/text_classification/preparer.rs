use burn::data::dataset::InMemDataset;
use log::debug;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokenizers::{Tokenizer, TruncationParams};

use crate::datasets::DatasetError;

use super::{Item, TokenizedSample};

/// Splits labeled items into train/validation partitions and turns them into
/// fixed-length tokenized samples
#[derive(Clone)]
pub struct Preparer {
    /// Tokenizer configured to truncate at `max_length`
    tokenizer: Tokenizer,

    /// Length of every tokenized sample
    max_length: usize,

    /// ID of the padding token
    pad_token_id: u32,
}

impl Preparer {
    /// Wrap a tokenizer, enabling truncation from the end at `max_length`. The
    /// padding id comes from the tokenizer's own padding settings when it has
    /// them, otherwise from the model configuration's `pad_token_id`.
    pub fn new(
        mut tokenizer: Tokenizer,
        max_length: usize,
        pad_token_id: u32,
    ) -> anyhow::Result<Self> {
        let pad_token_id = tokenizer
            .get_padding()
            .map(|padding| padding.pad_id)
            .unwrap_or(pad_token_id);

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Unable to configure truncation: {}", e))?;
        tokenizer.with_padding(None);

        Ok(Self {
            tokenizer,
            max_length,
            pad_token_id,
        })
    }

    /// The configured tokenizer
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Length of every tokenized sample
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// ID of the padding token
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Encode a text into exactly `max_length` token ids and the matching attention mask
    pub fn encode(&self, text: &str) -> anyhow::Result<(Vec<u32>, Vec<bool>)> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Unable to encode '{}': {}", text, e))?;

        let mask = encoding
            .get_attention_mask()
            .iter()
            .map(|m| *m != 0)
            .collect();

        Ok(fit_to_length(
            encoding.get_ids().to_vec(),
            mask,
            self.max_length,
            self.pad_token_id,
        ))
    }

    /// Tokenize a labeled item
    pub fn tokenize<I: Item>(&self, item: &I) -> anyhow::Result<TokenizedSample> {
        let (token_ids, attention_mask) = self.encode(item.input())?;

        Ok(TokenizedSample {
            token_ids,
            attention_mask,
            label: item.class_id(),
        })
    }

    /// Split, then tokenize both partitions
    pub fn prepare<I: Item>(
        &self,
        items: Vec<I>,
        validation_fraction: f64,
        seed: u64,
    ) -> anyhow::Result<(InMemDataset<TokenizedSample>, InMemDataset<TokenizedSample>)> {
        let (train, valid) = split(items, validation_fraction, seed)?;
        debug!("Split into {} train / {} validation rows", train.len(), valid.len());

        let train = train
            .iter()
            .map(|item| self.tokenize(item))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let valid = valid
            .iter()
            .map(|item| self.tokenize(item))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok((InMemDataset::new(train), InMemDataset::new(valid)))
    }
}

/// Truncate from the end or pad on the right so both sequences are exactly `max_length` long
pub fn fit_to_length(
    mut token_ids: Vec<u32>,
    mut attention_mask: Vec<bool>,
    max_length: usize,
    pad_token_id: u32,
) -> (Vec<u32>, Vec<bool>) {
    attention_mask.resize(token_ids.len(), true);

    token_ids.resize(max_length, pad_token_id);
    attention_mask.resize(max_length, false);

    (token_ids, attention_mask)
}

/// Shuffle with a seeded generator and hold out `ceil(n * validation_fraction)`
/// rows for validation. The same input order, seed and fraction always give the
/// same partitions.
pub fn split<I>(
    items: Vec<I>,
    validation_fraction: f64,
    seed: u64,
) -> Result<(Vec<I>, Vec<I>), DatasetError> {
    let total = items.len();
    let n_valid = ((total as f64) * validation_fraction).ceil() as usize;
    let n_train = total.saturating_sub(n_valid);

    if n_train == 0 || n_valid == 0 {
        return Err(DatasetError::Empty(format!(
            "{total} rows with validation fraction {validation_fraction} leave {n_train} train / {n_valid} validation rows"
        )));
    }

    let mut indices: Vec<usize> = (0..total).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut slots: Vec<Option<I>> = items.into_iter().map(Some).collect();

    let valid = indices[..n_valid]
        .iter()
        .filter_map(|&i| slots[i].take())
        .collect();
    let train = indices[n_valid..]
        .iter()
        .filter_map(|&i| slots[i].take())
        .collect();

    Ok((train, valid))
}
