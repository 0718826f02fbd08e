use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender},
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, info, warn};
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::{
    config::Config,
    pipelines::text_classification::{training::EpochRecord, Snapshot},
    utils::env::Credentials,
};

/// The Weights & Biases API
pub static WANDB_API_BASE: &str = "https://api.wandb.ai";

/// The credential holding the Weights & Biases API key
pub static WANDB_API_KEY: &str = "WANDB_API_KEY";

/// Receives the metrics of a run as it progresses
pub trait Tracker {
    /// Record the loss and validation metrics of one epoch
    fn log_epoch(&mut self, record: &EpochRecord) -> anyhow::Result<()>;

    /// Record the metrics of the selected model
    fn log_final(&mut self, metrics: &Snapshot) -> anyhow::Result<()>;

    /// Close the run
    fn finish(&mut self) -> anyhow::Result<()>;
}

/// The run name: `{user}_{dataset}_{lr}_{batch_size}_{validation_fraction}`,
/// with floats written in scientific notation below `1e-4` (`2e-05`) so names
/// match runs logged by earlier tooling
pub fn run_name(config: &Config) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        config.exp.username,
        config.data.train_name,
        short_float(config.train.lr),
        config.train.train_batch_size,
        short_float(config.data.test_size)
    )
}

/// Shortest round-trip float text, switching to `{mantissa}e{sign}{exp:02}`
/// outside `[1e-4, 1e16)` and keeping a `.0` on whole numbers
pub fn short_float(value: f64) -> String {
    if !value.is_finite() || value == 0.0 {
        return format!("{value:?}");
    }

    let scientific = format!("{value:e}");
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some((mantissa, exponent)) => (mantissa, exponent.parse::<i32>().unwrap_or(0)),
        None => (scientific.as_str(), 0),
    };

    if (-4..16).contains(&exponent) {
        format!("{value:?}")
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    }
}

/// Tracking Error
#[derive(thiserror::Error, Debug)]
pub enum TrackingError {
    /// The run file could not be created or written
    #[error("unable to write run file: {0}")]
    Io(#[from] std::io::Error),

    /// An event could not be serialized
    #[error("unable to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Events were sent after the run was closed
    #[error("run {0} is already finished")]
    Finished(String),
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Start {
        run: &'a str,
        project: &'a str,
        entity: &'a str,
    },
    Epoch(&'a EpochRecord),
    Final {
        metrics: &'a Snapshot,
    },
    Finish {
        run: &'a str,
    },
}

/// A [`Tracker`] appending one JSON object per event to `{dir}/{run}.jsonl`
pub struct FileTracker {
    run: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileTracker {
    /// Open a run file in `{output_dir}/runs/` named after the run
    pub fn from_config(config: &Config) -> Result<Self, TrackingError> {
        let dir = Path::new(&config.data.output_dir).join("runs");

        Self::open(
            &dir,
            &run_name(config),
            &config.tracking.project,
            &config.tracking.entity,
        )
    }

    /// Create the run file and write the start event
    pub fn open(dir: &Path, run: &str, project: &str, entity: &str) -> Result<Self, TrackingError> {
        fs::create_dir_all(dir)?;

        let path = dir.join(format!("{run}.jsonl"));
        let writer = BufWriter::new(File::create(&path)?);

        let mut tracker = Self {
            run: run.to_string(),
            path,
            writer: Some(writer),
        };

        tracker.write(&Event::Start {
            run,
            project,
            entity,
        })?;

        info!("Tracking run {} in {}", run, tracker.path.display());

        Ok(tracker)
    }

    /// The run file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, event: &Event<'_>) -> Result<(), TrackingError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| TrackingError::Finished(self.run.clone()))?;

        serde_json::to_writer(&mut *writer, event)?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        Ok(())
    }
}

impl Tracker for FileTracker {
    fn log_epoch(&mut self, record: &EpochRecord) -> anyhow::Result<()> {
        Ok(self.write(&Event::Epoch(record))?)
    }

    fn log_final(&mut self, metrics: &Snapshot) -> anyhow::Result<()> {
        Ok(self.write(&Event::Final { metrics })?)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        let run = self.run.clone();
        self.write(&Event::Finish { run: &run })?;
        self.writer = None;

        debug!("Closed run {}", run);

        Ok(())
    }
}

/// A [`Tracker`] that drops everything, used when the run file cannot be opened
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn log_epoch(&mut self, _record: &EpochRecord) -> anyhow::Result<()> {
        Ok(())
    }

    fn log_final(&mut self, _metrics: &Snapshot) -> anyhow::Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sends every event to each of its trackers. A failing tracker does not
/// stop the others.
#[derive(Default)]
pub struct Fanout {
    trackers: Vec<Box<dyn Tracker>>,
}

impl Fanout {
    /// Add a tracker
    pub fn push(&mut self, tracker: Box<dyn Tracker>) {
        self.trackers.push(tracker);
    }

    /// Number of trackers
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// True when events go nowhere
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    fn each(
        &mut self,
        mut f: impl FnMut(&mut dyn Tracker) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let errors: Vec<String> = self
            .trackers
            .iter_mut()
            .filter_map(|tracker| f(tracker.as_mut()).err())
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(errors.join("; ")))
        }
    }
}

impl Tracker for Fanout {
    fn log_epoch(&mut self, record: &EpochRecord) -> anyhow::Result<()> {
        self.each(|tracker| tracker.log_epoch(record))
    }

    fn log_final(&mut self, metrics: &Snapshot) -> anyhow::Result<()> {
        self.each(|tracker| tracker.log_final(metrics))
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.each(|tracker| tracker.finish())
    }
}

/// The trackers for a run: the local run file, plus Weights & Biases when an
/// API key is among the credentials. Trackers that cannot start are skipped
/// with a warning.
pub fn open(config: &Config, credentials: &Credentials) -> Fanout {
    let mut fanout = Fanout::default();

    match FileTracker::from_config(config) {
        Ok(tracker) => fanout.push(Box::new(tracker)),
        Err(e) => warn!("Local run file disabled: {}", e),
    }

    match credentials.get(WANDB_API_KEY) {
        Some(api_key) => match WandbTracker::start(WANDB_API_BASE, api_key, config) {
            Ok(tracker) => fanout.push(Box::new(tracker)),
            Err(e) => warn!("Weights & Biases tracking disabled: {}", e),
        },
        None => info!("No {} provided, tracking the run locally only", WANDB_API_KEY),
    }

    fanout
}

enum Message {
    History(Value),
    Summary(Value),
    Finish,
}

/// Where a Weights & Biases run lives and how it is described
struct WandbRun {
    api_base: String,
    api_key: String,
    entity: String,
    project: String,
    id: String,
    display_name: String,
    config: Value,
}

impl WandbRun {
    fn file_stream_url(&self) -> String {
        format!(
            "{}/files/{}/{}/{}/file_stream",
            self.api_base, self.entity, self.project, self.id
        )
    }

    /// Create the run through the GraphQL `upsertBucket` mutation
    fn create(&self, client: &reqwest::blocking::Client) -> anyhow::Result<()> {
        let response: Value = client
            .post(format!("{}/graphql", self.api_base))
            .basic_auth("api", Some(&self.api_key))
            .json(&json!({
                "query": UPSERT_RUN,
                "variables": {
                    "name": self.id,
                    "project": self.project,
                    "entity": self.entity,
                    "displayName": self.display_name,
                    "config": self.config.to_string(),
                },
            }))
            .send()?
            .error_for_status()?
            .json()?;

        if let Some(errors) = response.get("errors") {
            return Err(anyhow!("run creation rejected: {}", errors));
        }

        Ok(())
    }

    fn stream(&self, client: &reqwest::blocking::Client, body: Value) -> anyhow::Result<()> {
        client
            .post(self.file_stream_url())
            .basic_auth("api", Some(&self.api_key))
            .json(&body)
            .send()?
            .error_for_status()?;

        Ok(())
    }
}

const UPSERT_RUN: &str = "\
mutation UpsertBucket($name: String, $project: String, $entity: String, $displayName: String, $config: JSONString) {
  upsertBucket(input: {name: $name, modelName: $project, entityName: $entity, displayName: $displayName, config: $config}) {
    bucket { id name }
  }
}";

/// A [`Tracker`] reporting to Weights & Biases. Requests run on a background
/// thread so training never waits on the network; a run that cannot be created
/// only logs a warning and drops its events.
pub struct WandbTracker {
    run: String,
    sender: Option<Sender<Message>>,
    worker: Option<JoinHandle<()>>,
}

impl WandbTracker {
    /// Start a run named after the experiment under `tracking.entity/tracking.project`
    pub fn start(api_base: &str, api_key: String, config: &Config) -> anyhow::Result<Self> {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();

        let run = WandbRun {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            entity: config.tracking.entity.clone(),
            project: config.tracking.project.clone(),
            id,
            display_name: run_name(config),
            config: run_config(config)?,
        };

        let display_name = run.display_name.clone();
        let (sender, receiver) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("wandb".to_string())
            .spawn(move || report(run, receiver))?;

        Ok(Self {
            run: display_name,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    fn send(&self, message: Message) -> anyhow::Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| TrackingError::Finished(self.run.clone()))?
            .send(message)
            .map_err(|_| anyhow!("Weights & Biases worker for {} stopped", self.run))
    }
}

impl Tracker for WandbTracker {
    fn log_epoch(&mut self, record: &EpochRecord) -> anyhow::Result<()> {
        self.send(Message::History(history_row(record)))
    }

    fn log_final(&mut self, metrics: &Snapshot) -> anyhow::Result<()> {
        self.send(Message::Summary(summary(metrics)))
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        let sender = self
            .sender
            .take()
            .ok_or_else(|| TrackingError::Finished(self.run.clone()))?;

        // A worker that could not reach the service has already stopped
        let _ = sender.send(Message::Finish);
        drop(sender);

        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("Weights & Biases worker for {} panicked", self.run))?;
        }

        debug!("Closed Weights & Biases run {}", self.run);

        Ok(())
    }
}

/// The worker loop: create the run, then stream history rows and the summary
fn report(run: WandbRun, receiver: Receiver<Message>) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("Could not start Weights & Biases client: {}", e);
            return;
        }
    };

    if let Err(e) = run.create(&client) {
        warn!(
            "Could not connect to Weights & Biases, continuing without it: {}",
            e
        );
        return;
    }
    info!(
        "Tracking run {} in Weights & Biases project {}/{}",
        run.display_name, run.entity, run.project
    );

    let mut offset = 0;

    for message in receiver {
        let result = match message {
            Message::History(row) => {
                let body = json!({
                    "files": {
                        "wandb-history.jsonl": { "offset": offset, "content": [row.to_string()] }
                    }
                });
                offset += 1;
                run.stream(&client, body)
            }
            Message::Summary(summary) => run.stream(
                &client,
                json!({
                    "files": {
                        "wandb-summary.json": { "offset": 0, "content": [summary.to_string()] }
                    }
                }),
            ),
            Message::Finish => {
                if let Err(e) = run.stream(&client, json!({ "complete": true, "exitcode": 0 })) {
                    warn!("Unable to close the Weights & Biases run: {}", e);
                }
                break;
            }
        };

        if let Err(e) = result {
            warn!("Unable to send metrics to Weights & Biases: {}", e);
        }
    }
}

/// Run configuration in the `{key: {value: ...}}` shape the service expects
fn run_config(config: &Config) -> Result<Value, TrackingError> {
    let sections = match serde_json::to_value(config)? {
        Value::Object(sections) => sections,
        other => return Ok(json!({ "config": { "value": other } })),
    };

    Ok(Value::Object(
        sections
            .into_iter()
            .map(|(key, value)| (key, json!({ "value": value })))
            .collect(),
    ))
}

/// One history row per epoch, keyed the way the training loop reports them
fn history_row(record: &EpochRecord) -> Value {
    let mut row = Map::new();
    row.insert("_step".to_string(), json!(record.epoch));
    row.insert("epoch".to_string(), json!(record.epoch));
    row.insert("train/loss".to_string(), json!(record.train_loss));

    for (key, value) in record.metrics.entries() {
        row.insert(format!("eval/{key}"), json!(value));
    }

    Value::Object(row)
}

/// Final metrics of the selected model
fn summary(metrics: &Snapshot) -> Value {
    Value::Object(
        metrics
            .entries()
            .into_iter()
            .map(|(key, value)| (format!("final/{key}"), json!(value)))
            .collect(),
    )
}
