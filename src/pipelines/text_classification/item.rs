use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// A trait for items that can be used for text classification
pub trait Item: Send + Sync + Clone + Debug {
    /// Returns the input text for the item
    fn input(&self) -> &str;

    /// Returns the class id for the item
    fn class_id(&self) -> usize;
}

/// A labeled item after tokenization. `token_ids` and `attention_mask` always
/// have the configured maximum length.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedSample {
    /// Token ids, truncated or padded
    pub token_ids: Vec<u32>,

    /// True for real tokens, false for padding
    pub attention_mask: Vec<bool>,

    /// The class id
    pub label: usize,
}
