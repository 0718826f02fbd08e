use std::fs;

use burn::data::dataset::Dataset;
use pretty_assertions::assert_eq;
use text_classifier::{
    datasets::Table,
    pipelines::text_classification::{preparer, Predictor, Preparer, Runner},
};
use tokenizers::Tokenizer;

const TRAIN: &str = "text,target\n좋다,0\n싫다,1\n좋다,0\n싫다,1\n";

fn tokenizer() -> Tokenizer {
    Tokenizer::from_file(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/tokenizer.json"
    ))
    .unwrap()
}

struct Constant(usize);

impl Predictor for Constant {
    fn predict(&self, texts: &[String]) -> anyhow::Result<Vec<usize>> {
        Ok(vec![self.0; texts.len()])
    }
}

#[test]
fn split_is_reproducible_from_csv() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("train.csv");
    fs::write(&path, TRAIN).unwrap();

    let items = Table::from_csv(&path).unwrap().items(7).unwrap();

    let (train_a, valid_a) = preparer::split(items.clone(), 0.5, 456).unwrap();
    let (train_b, valid_b) = preparer::split(items, 0.5, 456).unwrap();

    assert_eq!(train_a, train_b);
    assert_eq!(valid_a, valid_b);
    assert_eq!(train_a.len(), 2);
    assert_eq!(valid_a.len(), 2);
}

#[test]
fn prepared_samples_are_fixed_length() {
    let items = Table::from_reader(csv::Reader::from_reader(TRAIN.as_bytes()))
        .unwrap()
        .items(7)
        .unwrap();
    let preparer = Preparer::new(tokenizer(), 6, 0).unwrap();

    let (train, valid) = preparer.prepare(items, 0.5, 456).unwrap();

    assert_eq!(train.len() + valid.len(), 4);
    for sample in train.iter().chain(valid.iter()) {
        assert_eq!(sample.token_ids.len(), 6);
        assert_eq!(sample.attention_mask.iter().filter(|m| **m).count(), 1);
    }
}

#[test]
fn writes_predictions_in_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("test.csv");
    let output = dir.path().join("output").join("output.csv");
    fs::write(&input, "ID,text,target\na,첫째,\nb,둘째,\nc,셋째,\n").unwrap();

    let table = Table::from_csv(&input).unwrap();
    Runner::new(1)
        .run(&Constant(2), &table)
        .unwrap()
        .write_csv(&output)
        .unwrap();

    assert_eq!(
        fs::read_to_string(&output).unwrap(),
        "ID,text,target\na,첫째,2\nb,둘째,2\nc,셋째,2\n"
    );
}

#[test]
fn bad_labels_are_rejected() {
    let table = Table::from_reader(csv::Reader::from_reader(
        "text,target\n좋다,9\n".as_bytes(),
    ))
    .unwrap();

    assert!(table.items(7).is_err());
}
