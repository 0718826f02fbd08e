//! Command line tool for inference with a trained artifact

use std::path::PathBuf;

use anyhow::anyhow;
use burn::backend::LibTorch;
use log::info;
use pico_args::Arguments;
use text_classifier::{
    config::{Config, DEFAULT_CONFIG_PATH},
    context::RunContext,
    datasets::Table,
    models::bert::sequence_classification::artifact,
    pipelines::text_classification::{self, Preparer},
};

type Backend = LibTorch;

const HELP: &str = "\
Usage: infer [OPTIONS]

Options:
  -h, --help           Print help
  -c, --config         The experiment configuration (defaults to 'config/config.yaml')
  -a, --artifact-dir   The trained model directory (defaults to '{output_dir}/model')
  -i, --input          The CSV to classify (defaults to '{data_dir}/{test_name}.csv')
  -o, --output         Where to write predictions (defaults to '{output_dir}/output.csv')
";

#[derive(Debug)]
struct Args {
    config: PathBuf,
    artifact_dir: Option<PathBuf>,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut pargs = Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        return Ok(None);
    }

    let args = Args {
        config: pargs
            .opt_value_from_str(["-c", "--config"])?
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        artifact_dir: pargs.opt_value_from_str(["-a", "--artifact-dir"])?,
        input: pargs.opt_value_from_str(["-i", "--input"])?,
        output: pargs.opt_value_from_str(["-o", "--output"])?,
    };

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        return Err(anyhow!("Unexpected arguments: {:?}", remaining));
    }

    Ok(Some(args))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        println!("{}", HELP);
        return Ok(());
    };

    let config = Config::from_yaml_file(&args.config)?;
    let context = RunContext::new(&config)?;

    let artifact_dir = args.artifact_dir.unwrap_or_else(|| config.artifact_dir());
    let input = args.input.unwrap_or_else(|| config.test_path());
    let output_path = args.output.unwrap_or_else(|| config.output_path());

    info!("Loading model from {}...", artifact_dir.display());
    let (model, model_config, tokenizer) =
        artifact::load::<Backend>(&artifact_dir, &context.device)?;

    let max_length = model_config.max_seq_len.unwrap_or(config.data.max_length);
    let preparer = Preparer::new(tokenizer, max_length, model_config.pad_token_id as u32)?;

    let table = Table::from_csv(&input)?;

    let output = text_classification::infer::<Backend, _>(
        context.device.clone(),
        model,
        preparer,
        &table,
        config.train.inference_batch_size,
    )?;
    output.write_csv(&output_path)?;

    info!(
        "Predicted {} rows, written to {}",
        output.len(),
        output_path.display()
    );

    Ok(())
}
