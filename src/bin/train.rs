//! Command line tool to fine-tune a text classifier, then predict the test set

use std::path::PathBuf;

use anyhow::anyhow;
use burn::{
    backend::{Autodiff, LibTorch},
    module::AutodiffModule,
};
use log::{info, warn};
use pico_args::Arguments;
use text_classifier::{
    cli::models::Model,
    config::{Config, DEFAULT_CONFIG_PATH},
    context::RunContext,
    datasets::{self, Table},
    models::bert::sequence_classification::{self as bert, artifact},
    pipelines::text_classification::{self, Preparer},
    publish, report,
    tracking::{self, Tracker},
    utils::hugging_face::download_hf_model,
};
use tokenizers::Tokenizer;

type Backend = LibTorch;
type TrainBackend = Autodiff<Backend>;

const HELP: &str = "\
Usage: train [OPTIONS]

Options:
  -h, --help           Print help
  -c, --config         The experiment configuration (defaults to 'config/config.yaml')
";

#[derive(Debug)]
struct Args {
    config: PathBuf,
}

impl Args {
    fn parse() -> anyhow::Result<Option<Self>> {
        let mut pargs = Arguments::from_env();

        // Help has a higher priority and should be handled separately.
        if pargs.contains(["-h", "--help"]) {
            return Ok(None);
        }

        let args = Args {
            config: pargs
                .opt_value_from_str(["-c", "--config"])?
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };

        let remaining = pargs.finish();
        if !remaining.is_empty() {
            return Err(anyhow!("Unexpected arguments: {:?}", remaining));
        }

        Ok(Some(args))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(args) = Args::parse()? else {
        print!("{}", HELP);

        return Ok(());
    };

    let config = Config::from_yaml_file(&args.config)?;
    let context = RunContext::new(&config)?;
    context.seed_backend();

    println!("{}", report::config_dump(&config)?);

    match Model::try_from(config.model.name.as_str()) {
        Ok(model) if model.is_supported(text_classification::PIPELINE) => {
            info!("Fine-tuning {} model {}", model.model_type(), model)
        }
        _ => warn!(
            "{} is not a known {} model, loading it as BERT",
            config.model.name,
            text_classification::PIPELINE
        ),
    }

    // Load the training data, downloading it when there is no local copy
    datasets::hub::ensure_local(
        &config.train_path(),
        &config.hub_organization(),
        &config.data.train_name,
        context.credentials.hf_token(),
    )
    .await?;

    let table = Table::from_csv(config.train_path())?;
    let items = table.items(config.model.num_labels)?;
    info!("Loaded {} training rows", items.len());

    // Fetch the pretrained model and its tokenizer
    let files = download_hf_model(&config.model.name, context.credentials.hf_token()).await?;

    let model_config = bert::Config::load_pretrained(
        files.config,
        config.model.num_labels,
        config.data.max_length,
    )?;

    let tokenizer = Tokenizer::from_file(&files.tokenizer)
        .map_err(|e| anyhow!("Unable to load tokenizer: {}", e))?;
    let preparer = Preparer::new(
        tokenizer,
        config.data.max_length,
        model_config.pad_token_id as u32,
    )?;

    let (dataset_train, dataset_valid) =
        preparer.prepare(items, config.data.test_size, config.seed)?;

    let model =
        bert::Model::<TrainBackend>::from_safetensors(&context.device, files.weights, &model_config)?;

    let mut tracker = tracking::open(&config, &context.credentials);

    let (model, outcome) = text_classification::train::<TrainBackend, _>(
        context.device.clone(),
        model,
        dataset_train,
        dataset_valid,
        &preparer,
        &config,
        &mut tracker,
    )?;

    println!("\n{}", report::metrics_table(&outcome.final_metrics));

    // Switch to evaluation mode for everything that follows
    let model = model.valid();

    artifact::save(
        model.clone(),
        &model_config,
        preparer.tokenizer(),
        &config.artifact_dir(),
    )?;

    let test = Table::from_csv(config.test_path())?;
    let output = text_classification::infer::<Backend, _>(
        context.device.clone(),
        model,
        preparer,
        &test,
        config.train.inference_batch_size,
    )?;
    output.write_csv(config.output_path())?;
    info!("Predictions written to {}", config.output_path().display());

    publish::publish_if_configured(&config, &context.credentials, &config.artifact_dir()).await;

    if let Err(e) = tracker.finish() {
        warn!("Unable to close the tracking run: {}", e);
    }

    Ok(())
}
