use std::{fmt, sync::Arc};

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::{Dataset, InMemDataset},
    },
    lr_scheduler::{linear::LinearLrSchedulerConfig, LrScheduler},
    module::{AutodiffModule, Module},
    optim::{AdamWConfig, Optimizer},
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::AutodiffBackend, ElementConversion},
    train::{
        checkpoint::{Checkpointer, FileCheckpointer},
        ClassificationOutput, TrainStep, ValidStep,
    },
};
use derive_new::new;
use log::{debug, info, warn};
use serde::Serialize;

use crate::{config::Config, tracking::Tracker};

use super::{
    batcher::Train,
    metrics::{self, Detail, Snapshot},
    Batcher, Preparer, TokenizedSample,
};

/// Log the running loss every this many steps at debug level
const LOG_EVERY_STEPS: usize = 50;

/// Epoch checkpoints are kept at full precision so the restored best model is
/// exactly the one that was evaluated
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// File name prefix of epoch checkpoints, stored as `{prefix}-{epoch}.mpk`
pub const CHECKPOINT_PREFIX: &str = "model";

/// The epoch-level operations the Orchestrator drives. Implementations own the
/// model and are its only writer.
pub trait Trainer {
    /// Run one epoch of optimization and return the mean training loss
    fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<f64>;

    /// Run a full validation pass
    fn evaluate(&self, detail: Detail) -> anyhow::Result<Snapshot>;

    /// Persist the current weights as the checkpoint for `epoch`
    fn save_checkpoint(&mut self, epoch: usize) -> anyhow::Result<()>;

    /// Remove the checkpoint for `epoch`
    fn delete_checkpoint(&mut self, epoch: usize) -> anyhow::Result<()>;

    /// Replace the current weights with the checkpoint for `epoch`
    fn restore_checkpoint(&mut self, epoch: usize) -> anyhow::Result<()>;
}

/// Where the Orchestrator is in a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Nothing has happened yet
    Idle,
    /// Optimizing during the given epoch
    Training(usize),
    /// Validating after the given epoch
    Evaluating(usize),
    /// Saving and rotating checkpoints after the given epoch
    Checkpointing(usize),
    /// Loading the best checkpoint
    Selecting,
    /// Training finished
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Idle => write!(f, "idle"),
            Stage::Training(epoch) => write!(f, "training (epoch {epoch})"),
            Stage::Evaluating(epoch) => write!(f, "evaluating (epoch {epoch})"),
            Stage::Checkpointing(epoch) => write!(f, "checkpointing (epoch {epoch})"),
            Stage::Selecting => write!(f, "selecting best checkpoint"),
            Stage::Done => write!(f, "done"),
        }
    }
}

/// What happened during one epoch
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EpochRecord {
    /// 1-based epoch number
    pub epoch: usize,

    /// Mean training loss
    pub train_loss: f64,

    /// Validation metrics after the epoch
    pub metrics: Snapshot,
}

/// The result of a training run
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    /// One record per epoch, in order
    pub history: Vec<EpochRecord>,

    /// The epoch whose weights were loaded at the end
    pub best_epoch: usize,

    /// Validation metrics of the selected model
    pub final_metrics: Snapshot,

    /// Epochs whose checkpoints are still on disk
    pub checkpoints: Vec<usize>,
}

/// Drives a [`Trainer`] through the epochs, keeps the checkpoint with the best
/// validation macro-F1 and loads it back at the end
#[derive(Clone, Debug, new)]
pub struct Orchestrator {
    /// Number of epochs
    num_epochs: usize,

    /// Maximum number of checkpoints kept on disk
    save_total_limit: usize,

    /// Metrics detail for the final evaluation
    final_detail: Detail,
}

impl Orchestrator {
    /// Run every epoch, then select the best checkpoint. Any failure aborts the run.
    pub fn run<T: Trainer + ?Sized>(
        &self,
        trainer: &mut T,
        tracker: &mut dyn Tracker,
    ) -> anyhow::Result<Outcome> {
        let mut stage = Stage::Idle;
        let mut history = Vec::with_capacity(self.num_epochs);
        let mut saved: Vec<usize> = Vec::new();
        let mut best: Option<(usize, f64)> = None;

        for epoch in 1..=self.num_epochs {
            stage = transition(stage, Stage::Training(epoch));
            let train_loss = trainer.train_epoch(epoch)?;
            info!("[Epoch {}/{}] loss: {:.4}", epoch, self.num_epochs, train_loss);

            stage = transition(stage, Stage::Evaluating(epoch));
            let metrics = trainer.evaluate(Detail::Summary)?;
            info!(
                "[Epoch {}/{}] eval_accuracy: {:.4}, eval_f1: {:.4}",
                epoch, self.num_epochs, metrics.accuracy, metrics.f1
            );

            if best.map_or(true, |(_, f1)| metrics.f1 > f1) {
                best = Some((epoch, metrics.f1));
            }

            stage = transition(stage, Stage::Checkpointing(epoch));
            trainer.save_checkpoint(epoch)?;
            saved.push(epoch);

            for evicted in evictions(&saved, best.map(|(e, _)| e), self.save_total_limit) {
                debug!("Deleting checkpoint for epoch {}", evicted);
                trainer.delete_checkpoint(evicted)?;
                saved.retain(|e| *e != evicted);
            }

            let record = EpochRecord {
                epoch,
                train_loss,
                metrics,
            };
            if let Err(e) = tracker.log_epoch(&record) {
                warn!("Unable to track epoch {}: {}", epoch, e);
            }
            history.push(record);
        }

        stage = transition(stage, Stage::Selecting);
        let (best_epoch, best_f1) = best.ok_or_else(|| anyhow!("No epochs were run"))?;
        trainer.restore_checkpoint(best_epoch)?;
        info!(
            "Loaded best model from epoch {} (eval_f1: {:.4})",
            best_epoch, best_f1
        );

        let final_metrics = trainer.evaluate(self.final_detail)?;
        if let Err(e) = tracker.log_final(&final_metrics) {
            warn!("Unable to track final metrics: {}", e);
        }

        transition(stage, Stage::Done);

        Ok(Outcome {
            history,
            best_epoch,
            final_metrics,
            checkpoints: saved,
        })
    }
}

fn transition(from: Stage, to: Stage) -> Stage {
    debug!("{} -> {}", from, to);
    to
}

/// Checkpoints to delete so that at most `limit` remain, oldest first. The best
/// checkpoint is never deleted; it is kept next to the most recent one even
/// when `limit` is 1.
pub fn evictions(saved: &[usize], best: Option<usize>, limit: usize) -> Vec<usize> {
    let mut order = saved.to_vec();
    order.sort_unstable();

    let len = order.len();

    // Move the best checkpoint just before the latest so only older ones are rotated out
    if let Some(pos) = best.and_then(|best| order.iter().position(|e| *e == best)) {
        if len >= 2 && pos < len - 2 {
            let epoch = order.remove(pos);
            order.insert(len - 2, epoch);
        }
    }

    let limit = if limit == 1 && best.is_some() && best != order.last().copied() {
        2
    } else {
        limit
    };

    order.truncate(len.saturating_sub(limit));
    order
}

/// A [`Trainer`] backed by Burn: autodiff train steps, an optimizer, a learning
/// rate scheduler and file checkpoints
pub struct BurnTrainer<B: AutodiffBackend, M, O, S> {
    /// The model being fine-tuned
    model: M,

    /// Optimizer
    optim: O,

    /// Learning rate scheduler, stepped once per batch
    scheduler: S,

    /// Stores one record per epoch
    checkpointer: FileCheckpointer<CheckpointRecorder>,

    /// Training batches, shuffled
    dataloader_train: Arc<dyn DataLoader<Train<B>>>,

    /// Validation batches on the non-autodiff backend
    dataloader_valid: Arc<dyn DataLoader<Train<B::InnerBackend>>>,

    /// Device for restored records
    device: B::Device,
}

impl<B: AutodiffBackend, M, O, S> BurnTrainer<B, M, O, S> {
    /// Creates a new trainer
    pub fn new(
        model: M,
        optim: O,
        scheduler: S,
        checkpointer: FileCheckpointer<CheckpointRecorder>,
        dataloader_train: Arc<dyn DataLoader<Train<B>>>,
        dataloader_valid: Arc<dyn DataLoader<Train<B::InnerBackend>>>,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            optim,
            scheduler,
            checkpointer,
            dataloader_train,
            dataloader_valid,
            device,
        }
    }

    /// Give up the trained model
    pub fn into_model(self) -> M {
        self.model
    }
}

impl<B, M, O, S> Trainer for BurnTrainer<B, M, O, S>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + TrainStep<Train<B>, ClassificationOutput<B>>,
    M::InnerModule: ValidStep<Train<B::InnerBackend>, ClassificationOutput<B::InnerBackend>>,
    O: Optimizer<M, B>,
    S: LrScheduler<B>,
{
    fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<f64> {
        let mut total_loss = 0.0;
        let mut steps = 0;

        for batch in self.dataloader_train.iter() {
            let output = TrainStep::step(&self.model, batch);
            total_loss += output.item.loss.into_scalar().elem::<f64>();
            steps += 1;

            let lr = self.scheduler.step();
            self.model = self.optim.step(lr, self.model.clone(), output.grads);

            if steps % LOG_EVERY_STEPS == 0 {
                debug!(
                    "[Epoch {}] step {}: loss {:.4}, lr {:.2e}",
                    epoch,
                    steps,
                    total_loss / steps as f64,
                    lr
                );
            }
        }

        if steps == 0 {
            return Err(anyhow!("Training data produced no batches"));
        }

        Ok(total_loss / steps as f64)
    }

    fn evaluate(&self, detail: Detail) -> anyhow::Result<Snapshot> {
        let model = self.model.valid();

        let mut scores = Vec::new();
        let mut labels = Vec::new();

        for batch in self.dataloader_valid.iter() {
            let output = ValidStep::step(&model, batch);
            let [_, n_classes] = output.output.dims();

            let values = output.output.into_data().convert::<f32>().value;
            scores.extend(values.chunks(n_classes).map(<[f32]>::to_vec));

            labels.extend(
                output
                    .targets
                    .into_data()
                    .convert::<i64>()
                    .value
                    .into_iter()
                    .map(|label| label as usize),
            );
        }

        Ok(metrics::compute(&scores, &labels, detail)?)
    }

    fn save_checkpoint(&mut self, epoch: usize) -> anyhow::Result<()> {
        Checkpointer::<<M as Module<B>>::Record, B>::save(
            &self.checkpointer,
            epoch,
            self.model.clone().into_record(),
        )
        .map_err(|e| anyhow!("Unable to save checkpoint for epoch {}: {:?}", epoch, e))
    }

    fn delete_checkpoint(&mut self, epoch: usize) -> anyhow::Result<()> {
        Checkpointer::<<M as Module<B>>::Record, B>::delete(&self.checkpointer, epoch)
            .map_err(|e| anyhow!("Unable to delete checkpoint for epoch {}: {:?}", epoch, e))
    }

    fn restore_checkpoint(&mut self, epoch: usize) -> anyhow::Result<()> {
        let record = Checkpointer::<<M as Module<B>>::Record, B>::restore(
            &self.checkpointer,
            epoch,
            &self.device,
        )
        .map_err(|e| anyhow!("Unable to restore checkpoint for epoch {}: {:?}", epoch, e))?;

        self.model = self.model.clone().load_record(record);

        Ok(())
    }
}

/// Fine-tune `model` on the prepared datasets and return the best-scoring weights
pub fn train<B, M>(
    device: B::Device,       // Device on which to perform computation (e.g., CPU or CUDA device)
    model: M,                // Pretrained model with a fresh classification head
    dataset_train: InMemDataset<TokenizedSample>, // Training dataset
    dataset_valid: InMemDataset<TokenizedSample>, // Validation dataset
    preparer: &Preparer,     // Tokenization settings shared with the collator
    config: &Config,         // Experiment configuration
    tracker: &mut dyn Tracker, // Experiment tracking side channel
) -> anyhow::Result<(M, Outcome)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + TrainStep<Train<B>, ClassificationOutput<B>>,
    M::InnerModule: ValidStep<Train<B::InnerBackend>, ClassificationOutput<B::InnerBackend>>,
{
    let hyper = &config.train;

    // Initialize batchers for training and validation data
    let pad_token_id = preparer.pad_token_id() as usize;
    let batcher_train = Batcher::<B>::new(pad_token_id, preparer.max_length(), device.clone());
    let batcher_valid =
        Batcher::<B::InnerBackend>::new(pad_token_id, preparer.max_length(), device.clone());

    let workers = match hyper.num_workers {
        Some(workers) => workers,
        None => std::thread::available_parallelism()?.into(),
    };

    let steps_per_epoch = dataset_train.len().div_ceil(hyper.train_batch_size);
    let total_steps = (steps_per_epoch * hyper.num_epochs).max(1);

    // Initialize data loaders for training and validation data
    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(hyper.train_batch_size)
        .shuffle(config.seed)
        .num_workers(workers)
        .build(dataset_train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(hyper.eval_batch_size)
        .num_workers(workers)
        .build(dataset_valid);

    // Initialize optimizer
    let optim = AdamWConfig::new()
        .with_beta_1(hyper.adam_beta1)
        .with_beta_2(hyper.adam_beta2)
        .with_epsilon(hyper.adam_epsilon)
        .with_weight_decay(hyper.weight_decay)
        .init::<B, M>();

    // Initialize learning rate scheduler, decaying linearly to zero
    let scheduler = LinearLrSchedulerConfig::new(hyper.lr, 0.0, total_steps).init();

    let checkpoint_dir = config.checkpoint_dir();
    let checkpointer = FileCheckpointer::new(
        CheckpointRecorder::new(),
        checkpoint_dir.to_string_lossy().as_ref(),
        CHECKPOINT_PREFIX,
    );

    info!(
        "Training for {} epochs, {} steps per epoch",
        hyper.num_epochs, steps_per_epoch
    );

    let mut trainer = BurnTrainer::new(
        model,
        optim,
        scheduler,
        checkpointer,
        dataloader_train,
        dataloader_valid,
        device,
    );

    let outcome = Orchestrator::new(
        hyper.num_epochs,
        hyper.save_total_limit,
        Detail::from(hyper.detailed_metrics),
    )
    .run(&mut trainer, tracker)?;

    Ok((trainer.into_model(), outcome))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::pipelines::text_classification::metrics::ClassMetrics;

    /// A trainer whose "weights" are the epoch they were last trained in
    #[derive(Default)]
    struct Scripted {
        f1_by_epoch: Vec<f64>,
        weights: usize,
        checkpoints: BTreeMap<usize, usize>,
        deleted: Vec<usize>,
        fail_at: Option<usize>,
    }

    impl Scripted {
        fn new(f1_by_epoch: &[f64]) -> Self {
            Self {
                f1_by_epoch: f1_by_epoch.to_vec(),
                ..Default::default()
            }
        }
    }

    impl Trainer for Scripted {
        fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<f64> {
            if self.fail_at == Some(epoch) {
                return Err(anyhow!("out of memory"));
            }
            self.weights = epoch;
            Ok(1.0 / epoch as f64)
        }

        fn evaluate(&self, detail: Detail) -> anyhow::Result<Snapshot> {
            let f1 = self.f1_by_epoch[self.weights - 1];
            let per_class = match detail {
                Detail::Summary => BTreeMap::new(),
                Detail::PerClass => {
                    BTreeMap::from([(0, ClassMetrics { accuracy: f1, f1 })])
                }
            };
            Ok(Snapshot {
                accuracy: f1,
                f1,
                per_class,
            })
        }

        fn save_checkpoint(&mut self, epoch: usize) -> anyhow::Result<()> {
            self.checkpoints.insert(epoch, self.weights);
            Ok(())
        }

        fn delete_checkpoint(&mut self, epoch: usize) -> anyhow::Result<()> {
            self.checkpoints
                .remove(&epoch)
                .ok_or_else(|| anyhow!("no checkpoint {}", epoch))?;
            self.deleted.push(epoch);
            Ok(())
        }

        fn restore_checkpoint(&mut self, epoch: usize) -> anyhow::Result<()> {
            self.weights = *self
                .checkpoints
                .get(&epoch)
                .ok_or_else(|| anyhow!("no checkpoint {}", epoch))?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        epochs: Vec<usize>,
        finals: usize,
    }

    impl Tracker for Recording {
        fn log_epoch(&mut self, record: &EpochRecord) -> anyhow::Result<()> {
            self.epochs.push(record.epoch);
            Ok(())
        }

        fn log_final(&mut self, _metrics: &Snapshot) -> anyhow::Result<()> {
            self.finals += 1;
            Ok(())
        }

        fn finish(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn returns_the_best_epoch_not_the_last() {
        let mut trainer = Scripted::new(&[0.70, 0.85, 0.60]);
        let mut tracker = Recording::default();

        let outcome = Orchestrator::new(3, 2, Detail::PerClass)
            .run(&mut trainer, &mut tracker)
            .unwrap();

        assert_eq!(outcome.best_epoch, 2);
        assert_eq!(trainer.weights, 2);
        assert_eq!(outcome.final_metrics.f1, 0.85);
        assert_eq!(outcome.final_metrics.per_class.len(), 1);
        assert_eq!(outcome.history.len(), 3);
        assert_eq!(outcome.checkpoints, vec![2, 3]);
        assert_eq!(tracker.epochs, vec![1, 2, 3]);
        assert_eq!(tracker.finals, 1);
    }

    #[test]
    fn never_evicts_the_best_checkpoint() {
        let mut trainer = Scripted::new(&[0.90, 0.50, 0.40, 0.30]);

        let outcome = Orchestrator::new(4, 2, Detail::Summary)
            .run(&mut trainer, &mut Recording::default())
            .unwrap();

        assert_eq!(outcome.best_epoch, 1);
        assert_eq!(outcome.checkpoints, vec![1, 4]);
        assert_eq!(trainer.deleted, vec![2, 3]);
        assert_eq!(trainer.weights, 1);
        assert!(outcome.final_metrics.per_class.is_empty());
    }

    #[test]
    fn ties_keep_the_earlier_epoch() {
        let mut trainer = Scripted::new(&[0.80, 0.80]);

        let outcome = Orchestrator::new(2, 2, Detail::Summary)
            .run(&mut trainer, &mut Recording::default())
            .unwrap();

        assert_eq!(outcome.best_epoch, 1);
    }

    #[test]
    fn failures_abort_the_run() {
        let mut trainer = Scripted::new(&[0.5, 0.6]);
        trainer.fail_at = Some(2);
        let mut tracker = Recording::default();

        let result = Orchestrator::new(2, 2, Detail::Summary).run(&mut trainer, &mut tracker);

        assert!(result.is_err());
        assert_eq!(tracker.epochs, vec![1]);
        assert_eq!(tracker.finals, 0);
    }

    #[test]
    fn eviction_keeps_the_most_recent() {
        assert_eq!(evictions(&[1, 2, 3], Some(3), 2), vec![1]);
        assert_eq!(evictions(&[1, 2, 3], Some(2), 2), vec![1]);
        assert_eq!(evictions(&[1, 2], Some(2), 2), Vec::<usize>::new());
    }

    #[test]
    fn eviction_protects_an_older_best() {
        assert_eq!(evictions(&[1, 2, 3], Some(1), 2), vec![2]);
        assert_eq!(evictions(&[1, 3, 4], Some(1), 2), vec![3]);
    }

    #[test]
    fn eviction_with_limit_one_keeps_best_and_latest() {
        assert_eq!(evictions(&[1, 2], Some(1), 1), Vec::<usize>::new());
        assert_eq!(evictions(&[1, 2, 3], Some(3), 1), vec![1, 2]);
        assert_eq!(evictions(&[1, 2, 3], Some(1), 1), vec![2]);
    }
}
