//! Iteration-driven training loop.
//!
//! This module provides:
//! - [`TrainingState`], the counters persisted in checkpoints
//! - [`TrainingLoop`], which steps the model, validates on a fixed cadence
//!   and keeps the best checkpoint
//!
//! The loop runs one state machine on the calling thread:
//! `Initializing -> Stepping -> (Validating -> Checkpointing -> Stepping)* -> Stopped`.

use crate::checkpoint::{
    decode_record, encode_record, Checkpoint, CheckpointManager, INITIAL_BEST_METRIC,
};
use crate::loss::LossComposer;
use crate::lr_schedule::LearningRateScheduler;
use crate::model::StackedSegmentationModel;
use crate::validation::{ValidationPass, ValidationReport};
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use indicatif::ProgressBar;
use rootnav_core::{AverageMeter, Error, Result, RootClass, RunningScore, TrainingParams};
use rootnav_dataset::{BatchSource, RootBatch};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Training state for checkpointing and resumption
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed optimizer steps
    pub iteration: usize,
    pub best_metric: f64,
    pub stop_flag: bool,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            iteration: 0,
            best_metric: INITIAL_BEST_METRIC,
            stop_flag: false,
        }
    }
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Stepping,
    Validating,
    Checkpointing,
    Stopped,
}

/// Configuration for the training loop
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub train_iters: usize,
    pub print_interval: usize,
    pub val_interval: usize,
    pub batch_size: usize,
    pub checkpoint_dir: PathBuf,
    /// Where the latest validation prediction is rendered
    pub snapshot_path: Option<PathBuf>,
    /// JSON-lines file receiving every validation report
    pub metrics_path: Option<PathBuf>,
}

impl TrainerConfig {
    pub fn from_params(params: &TrainingParams, run_dir: &Path) -> Self {
        Self {
            train_iters: params.train_iters,
            print_interval: params.print_interval,
            val_interval: params.val_interval,
            batch_size: params.batch_size,
            checkpoint_dir: run_dir.to_path_buf(),
            snapshot_path: Some(run_dir.join("snapshot.png")),
            metrics_path: Some(run_dir.join("metrics.jsonl")),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.train_iters == 0 {
            return Err(Error::Config("train_iters must be greater than 0".into()));
        }
        if self.print_interval == 0 || self.val_interval == 0 {
            return Err(Error::Config(
                "print_interval and val_interval must be greater than 0".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Outcome of one validation boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationRecord {
    pub iteration: usize,
    pub val_loss: f64,
    pub mean_iou: f64,
    pub checkpoint_written: bool,
}

/// Summary returned by [`TrainingLoop::run`]
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub start_iteration: usize,
    pub final_iteration: usize,
    pub steps_taken: usize,
    pub best_metric: f64,
    pub validations: Vec<ValidationRecord>,
}

/// Drives training of `M` with optimizer `O`, pulling training batches from
/// `T` and validation batches from `V`.
pub struct TrainingLoop<B, M, O, T, V>
where
    B: AutodiffBackend,
{
    model: M,
    optimizer: O,
    scheduler: LearningRateScheduler,
    loss: LossComposer,
    train_stream: T,
    val_stream: V,
    checkpoints: CheckpointManager,
    config: TrainerConfig,
    state: TrainingState,
    phase: Phase,
    time_meter: AverageMeter,
    val_loss_meter: AverageMeter,
    running_score: RunningScore,
    steps_taken: usize,
    validations: Vec<ValidationRecord>,
    progress: Option<ProgressBar>,
    device: B::Device,
}

impl<B, M, O, T, V> TrainingLoop<B, M, O, T, V>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + StackedSegmentationModel<B>,
    <M as AutodiffModule<B>>::InnerModule: StackedSegmentationModel<B::InnerBackend>,
    O: Optimizer<M, B>,
    T: BatchSource<B>,
    V: BatchSource<B::InnerBackend>,
{
    pub fn new(
        model: M,
        optimizer: O,
        scheduler: LearningRateScheduler,
        train_stream: T,
        val_stream: V,
        config: TrainerConfig,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;
        if train_stream.n_classes() != val_stream.n_classes() {
            return Err(Error::Config(format!(
                "training data has {} classes but validation data has {}",
                train_stream.n_classes(),
                val_stream.n_classes()
            )));
        }

        let loss = LossComposer::default();
        if loss.class_weights().len() != train_stream.n_classes() {
            return Err(Error::Config(format!(
                "{} class weights configured for {} classes",
                loss.class_weights().len(),
                train_stream.n_classes()
            )));
        }

        let n_classes = train_stream.n_classes();
        Ok(Self {
            model,
            optimizer,
            scheduler,
            loss,
            train_stream,
            val_stream,
            checkpoints: CheckpointManager::new(config.checkpoint_dir.clone()),
            config,
            state: TrainingState::default(),
            phase: Phase::Initializing,
            time_meter: AverageMeter::new(),
            val_loss_meter: AverageMeter::new(),
            running_score: RunningScore::new(n_classes),
            steps_taken: 0,
            validations: Vec::new(),
            progress: None,
            device,
        })
    }

    /// Replaces the loss, e.g. to use different class weights.
    pub fn with_loss(mut self, loss: LossComposer) -> Result<Self> {
        if loss.class_weights().len() != self.train_stream.n_classes() {
            return Err(Error::Config(format!(
                "{} class weights configured for {} classes",
                loss.class_weights().len(),
                self.train_stream.n_classes()
            )));
        }
        self.loss = loss;
        Ok(self)
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Restores model, optimizer, scheduler and counters from `path`.
    ///
    /// A missing file leaves the loop untouched so training starts fresh.
    /// A file that exists but cannot be decoded is an error.
    pub fn resume(mut self, path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(self);
        };
        let Some(checkpoint) = CheckpointManager::load(path)? else {
            return Ok(self);
        };

        info!("Loading model and optimizer from checkpoint {:?}", path);

        let model_record = decode_record::<B, _>(checkpoint.model_state, &self.device)?;
        self.model = self.model.load_record(model_record);

        let optimizer_record = decode_record::<B, _>(checkpoint.optimizer_state, &self.device)?;
        self.optimizer = self.optimizer.load_record(optimizer_record);

        self.scheduler.load_state(checkpoint.scheduler_state);
        self.state.iteration = checkpoint.iteration;
        self.state.best_metric = checkpoint.best_metric;
        self.checkpoints.set_best_metric(checkpoint.best_metric);

        info!(
            "Loaded checkpoint {:?} (iter {}, best mean IoU {:.4})",
            path, checkpoint.iteration, checkpoint.best_metric
        );

        if self.state.iteration >= self.config.train_iters {
            info!(
                "Checkpoint is already at iteration {} of {}, nothing left to train",
                self.state.iteration, self.config.train_iters
            );
            self.stop();
        }

        Ok(self)
    }

    /// Runs until `train_iters` optimizer steps have been taken.
    pub fn run(&mut self) -> Result<TrainingSummary> {
        let start_iteration = self.state.iteration;
        if self.phase == Phase::Initializing {
            info!(
                "Starting training at iteration {} of {}",
                start_iteration, self.config.train_iters
            );
            self.phase = Phase::Stepping;
        }

        while self.phase != Phase::Stopped {
            self.step()?;
        }

        Ok(TrainingSummary {
            start_iteration,
            final_iteration: self.state.iteration,
            steps_taken: self.steps_taken,
            best_metric: self.state.best_metric,
            validations: self.validations.clone(),
        })
    }

    /// Takes one optimizer step, then validates and checkpoints if due.
    /// Returns the phase the loop is left in.
    pub fn step(&mut self) -> Result<Phase> {
        if self.phase == Phase::Stopped {
            return Ok(Phase::Stopped);
        }
        self.phase = Phase::Stepping;

        self.train_step()?;

        if self.validation_due() {
            let outcome = self.validate_and_checkpoint();
            if outcome.is_err() && self.state.iteration >= self.config.train_iters {
                self.stop();
            }
            self.validations.push(outcome?);
            self.phase = Phase::Stepping;
        }

        if self.state.iteration >= self.config.train_iters {
            self.stop();
        }

        Ok(self.phase)
    }

    fn validate_and_checkpoint(&mut self) -> Result<ValidationRecord> {
        let report = self.validate()?;
        let written = self.checkpoint(&report)?;
        Ok(ValidationRecord {
            iteration: report.iteration,
            val_loss: report.val_loss,
            mean_iou: report.scores.mean_iou,
            checkpoint_written: written,
        })
    }

    fn train_step(&mut self) -> Result<()> {
        let batch = self.next_train_batch()?;
        let start = Instant::now();

        let lr = self.scheduler.step();

        let output = self
            .model
            .forward_stack(batch.images)
            .pop()
            .ok_or_else(|| Error::Model("model returned no outputs".into()))?;
        let loss = self.loss.compose(output, batch.labels, batch.heatmaps)?;

        let classification = loss.classification_value();
        if !classification.is_finite() || !loss.regression_value().is_finite() {
            return Err(Error::Training(format!(
                "non-finite loss at iteration {}",
                self.state.iteration + 1
            )));
        }

        let grads = GradientsParams::from_grads(loss.total().backward(), &self.model);
        self.model = self.optimizer.step(lr, self.model.clone(), grads);
        self.steps_taken += 1;

        self.time_meter.update(start.elapsed().as_secs_f64(), 1);
        self.state.iteration += 1;

        if let Some(progress) = &self.progress {
            progress.set_position(self.state.iteration as u64);
            progress.set_message(format!("loss {classification:.4} lr {lr:.2e}"));
        }

        if self.state.iteration % self.config.print_interval == 0 {
            info!(
                "Iter [{}/{}]  Loss: {:.4}  Time/Image: {:.4}",
                self.state.iteration,
                self.config.train_iters,
                classification,
                self.time_meter.avg / self.config.batch_size as f64
            );
            self.time_meter.reset();
        }

        Ok(())
    }

    /// Pulls the next training batch, starting a new epoch when the stream
    /// runs dry.
    fn next_train_batch(&mut self) -> Result<RootBatch<B>> {
        if let Some(batch) = self.train_stream.next_batch()? {
            return Ok(batch);
        }

        debug!("Training stream exhausted at iteration {}, starting a new epoch", self.state.iteration);
        self.train_stream.reset();
        self.train_stream
            .next_batch()?
            .ok_or_else(|| Error::Dataset("training stream produced no batches".into()))
    }

    pub fn validation_due(&self) -> bool {
        let iteration = self.state.iteration;
        iteration % self.config.val_interval == 0 || iteration == self.config.train_iters
    }

    /// Scores the current model on the validation stream and logs the result.
    pub fn validate(&mut self) -> Result<ValidationReport> {
        self.phase = Phase::Validating;

        let model = self.model.valid();
        let report = ValidationPass::new(&self.loss, self.state.iteration).run::<B::InnerBackend, _, _>(
            &model,
            &mut self.val_stream,
            &mut self.running_score,
            &mut self.val_loss_meter,
        )?;

        info!("Iter {} Loss: {:.4}", report.iteration, report.val_loss);
        for (name, value) in report.scores.entries() {
            info!("{}: {:.4}", name, value);
        }
        for (&class, iou) in &report.class_iou {
            let name = RootClass::from_index(class).map_or("unknown", RootClass::name);
            info!("Class IoU {} ({}): {:.4}", class, name, iou);
        }

        if let (Some(path), Some(snapshot)) = (&self.config.snapshot_path, &report.snapshot) {
            if let Err(e) = snapshot.save(path) {
                warn!("Failed to write validation snapshot {:?}: {}", path, e);
            }
        }

        if let Some(path) = &self.config.metrics_path {
            if let Err(e) = append_report(path, &report) {
                warn!("Failed to append validation metrics to {:?}: {}", path, e);
            }
        }

        Ok(report)
    }

    /// Writes a checkpoint when `report` ties or beats the best mean IoU so
    /// far. Returns whether one was written.
    ///
    /// A failed write is only an error on the final iteration.
    pub fn checkpoint(&mut self, report: &ValidationReport) -> Result<bool> {
        self.phase = Phase::Checkpointing;

        let mean_iou = report.scores.mean_iou;
        if !self.checkpoints.is_improvement(mean_iou) {
            debug!(
                "Mean IoU {:.4} below best {:.4}, keeping previous checkpoint",
                mean_iou,
                self.checkpoints.best_metric()
            );
            return Ok(false);
        }

        let state = TrainingState {
            best_metric: mean_iou,
            ..self.state
        };
        let checkpoint = Checkpoint::new(
            &state,
            encode_record::<B, _>(self.model.clone().into_record())?,
            encode_record::<B, _>(self.optimizer.to_record())?,
            self.scheduler.state(),
        );

        match self.checkpoints.save(&checkpoint) {
            Ok(_) => {
                self.state.best_metric = mean_iou;
                Ok(true)
            }
            Err(e) if self.state.iteration >= self.config.train_iters => Err(e),
            Err(e) => {
                warn!(
                    "Failed to save checkpoint at iteration {}: {}",
                    self.state.iteration, e
                );
                Ok(false)
            }
        }
    }

    fn stop(&mut self) {
        self.state.stop_flag = true;
        self.phase = Phase::Stopped;
        if let Some(progress) = &self.progress {
            progress.finish_with_message(format!("stopped at iteration {}", self.state.iteration));
        }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn scheduler(&self) -> &LearningRateScheduler {
        &self.scheduler
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Optimizer steps taken by this loop, excluding any restored by resume
    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    pub fn validations(&self) -> &[ValidationRecord] {
        &self.validations
    }
}

fn append_report(path: &Path, report: &ValidationReport) -> Result<()> {
    let line = serde_json::to_string(report)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}
