/// BERT for Sequence Classification (such as topic classification)
pub mod sequence_classification;
