//! Training CLI Tool
//!
//! Trains a RootNav segmentation model from a TOML configuration. Every run
//! gets its own directory under `runs/<config name>/<timestamp>` holding the
//! configuration, the log, the best checkpoint, the latest validation
//! snapshot and a JSON-lines metrics history.

use anyhow::{Context, Result};
use burn::module::Module;
use burn::optim::Optimizer;
use burn::tensor::backend::Backend;
use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rootnav_core::{
    backend_name, default_device, load_toml_config, setup_cli_logging, DefaultBackend,
    RootNavConfig, Split, TrainingBackend, NUM_CLASSES,
};
use rootnav_dataset::{DataStream, RootDataset, StreamConfig};
use rootnav_training::{
    LearningRateScheduler, OptimizerChoice, RootHourglass, RootHourglassConfig, TrainerConfig,
    TrainingLoop, TrainingSummary, WithOptimizer,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// RootNav training tool
#[derive(Parser, Debug)]
#[command(
    name = "rootnav-train",
    about = "Train RootNav root segmentation models",
    long_about = "Train stacked hourglass models that segment plant roots and locate \
                  primary root tips, lateral root tips and seeds."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a training job
    Train(TrainArgs),
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    /// Path to training configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Resume from checkpoint, overriding `training.resume`
    #[arg(short, long, value_name = "FILE")]
    resume: Option<PathBuf>,

    /// Override number of training iterations
    #[arg(long, value_name = "N")]
    train_iters: Option<usize>,

    /// Directory holding all runs
    #[arg(long, value_name = "DIR", default_value = "runs")]
    runs_dir: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Dry run (validate config and dataset without training)
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Train(args) => train(args),
    }
}

fn train(args: TrainArgs) -> Result<()> {
    let mut config: RootNavConfig =
        load_toml_config(&args.config).context("Failed to load configuration file")?;

    if let Some(train_iters) = args.train_iters {
        config.training.train_iters = train_iters;
    }
    if let Some(resume) = &args.resume {
        config.training.resume = Some(resume.clone());
    }
    config.validate().context("Invalid configuration")?;

    if args.dry_run {
        setup_cli_logging(args.verbose, None)?;
        print_config_summary(&config);
        let train = RootDataset::open(&config.data.path, Split::Train, NUM_CLASSES)
            .context("Failed to open training data")?;
        let valid = RootDataset::open(&config.data.path, Split::Valid, NUM_CLASSES)
            .context("Failed to open validation data")?;
        info!(
            "Configuration validated successfully (dry run): {} training and {} validation samples",
            train.len(),
            valid.len()
        );
        return Ok(());
    }

    let run_dir = create_run_dir(&args.runs_dir, &args.config)?;
    setup_cli_logging(args.verbose, Some(&run_dir.join("train.log")))?;

    info!("RootNav - Training Tool");
    info!("=======================");
    info!("Run directory: {}", run_dir.display());
    print_config_summary(&config);

    let summary = run_training(&config, &run_dir)?;

    info!("");
    info!("Training Summary:");
    info!("  Iterations: {} -> {}", summary.start_iteration, summary.final_iteration);
    info!("  Validations: {}", summary.validations.len());
    info!("  Best mean IoU: {:.4}", summary.best_metric);
    info!("  Outputs: {}", run_dir.display());

    Ok(())
}

/// Creates `<runs_dir>/<config stem>/<UTC timestamp>` and copies the
/// configuration into it.
fn create_run_dir(runs_dir: &Path, config_path: &Path) -> Result<PathBuf> {
    let name = config_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("rootnav");
    let run_dir = runs_dir
        .join(name)
        .join(Utc::now().format("%Y%m%d-%H%M%S").to_string());

    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;

    let file_name = config_path.file_name().unwrap_or(config_path.as_os_str());
    std::fs::copy(config_path, run_dir.join(file_name))
        .context("Failed to copy configuration into the run directory")?;

    Ok(run_dir)
}

fn print_config_summary(config: &RootNavConfig) {
    let training = &config.training;
    info!("");
    info!("Configuration Summary:");
    info!("  Backend: {}", backend_name());
    info!("  Seed: {}", config.seed);
    info!("  Model: {} stacks, {} features", config.model.stacks, config.model.features);
    info!("  Iterations: {}", training.train_iters);
    info!("  Batch size: {}", training.batch_size);
    info!("  Workers: {}", training.n_workers);
    info!("  Optimizer: {} (lr {})", training.optimizer.name, training.optimizer.lr);
    match &training.lr_schedule {
        Some(schedule) => info!("  LR schedule: {:?}", schedule.name),
        None => info!("  LR schedule: constant"),
    }
    info!("  Horizontal flip: {}", training.hflip());
    info!("  Print / validation interval: {} / {}", training.print_interval, training.val_interval);
    info!("  Dataset: {} at {}", config.data.dataset, config.data.path.display());
    if let Some(resume) = &training.resume {
        info!("  Resume: {}", resume.display());
    }
    info!("");
}

fn run_training(config: &RootNavConfig, run_dir: &Path) -> Result<TrainingSummary> {
    let training = &config.training;
    let device = default_device();

    info!("Loading dataset...");
    let train_data = RootDataset::open(&config.data.path, Split::Train, NUM_CLASSES)
        .context("Failed to open training data")?;
    let valid_data = RootDataset::open(&config.data.path, Split::Valid, NUM_CLASSES)
        .context("Failed to open validation data")?;
    info!(
        "Found {} training and {} validation samples",
        train_data.len(),
        valid_data.len()
    );

    let train_stream = DataStream::<TrainingBackend>::new(
        Arc::new(train_data),
        StreamConfig::train(training.batch_size, training.n_workers, training.hflip(), config.seed),
        device.clone(),
    )?;
    let val_stream = DataStream::<DefaultBackend>::new(
        Arc::new(valid_data),
        StreamConfig::valid(training.batch_size, training.n_workers),
        device.clone(),
    )?;

    TrainingBackend::seed(config.seed);
    let model = RootHourglassConfig::from_params(&config.model).init::<TrainingBackend>(&device);
    info!("Model: {} stacks, {} parameters", model.stacks(), model.num_params());

    let scheduler =
        LearningRateScheduler::from_config(training.lr_schedule.as_ref(), training.optimizer.lr)?;

    let progress = ProgressBar::new(training.train_iters as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} iters ({eta}) {msg}")?
            .progress_chars("=>-"),
    );

    let optimizer = OptimizerChoice::from_config(&training.optimizer);
    info!("Optimizer: {}", optimizer.name());

    let job = TrainingJob {
        model,
        scheduler,
        train_stream,
        val_stream,
        config: TrainerConfig::from_params(training, run_dir),
        resume: training.resume.as_deref(),
        device,
        progress,
    };

    let summary = optimizer
        .dispatch::<TrainingBackend, RootHourglass<TrainingBackend>, _>(job)
        .context("Training failed")?;

    Ok(summary)
}

/// Everything a training run needs except the optimizer, which is chosen at
/// runtime.
struct TrainingJob<'a> {
    model: RootHourglass<TrainingBackend>,
    scheduler: LearningRateScheduler,
    train_stream: DataStream<TrainingBackend>,
    val_stream: DataStream<DefaultBackend>,
    config: TrainerConfig,
    resume: Option<&'a Path>,
    device: <TrainingBackend as Backend>::Device,
    progress: ProgressBar,
}

impl WithOptimizer<TrainingBackend, RootHourglass<TrainingBackend>> for TrainingJob<'_> {
    type Output = rootnav_core::Result<TrainingSummary>;

    fn run<O: Optimizer<RootHourglass<TrainingBackend>, TrainingBackend>>(
        self,
        optimizer: O,
    ) -> Self::Output {
        let mut training = TrainingLoop::new(
            self.model,
            optimizer,
            self.scheduler,
            self.train_stream,
            self.val_stream,
            self.config,
            self.device,
        )?
        .with_progress(self.progress)
        .resume(self.resume)?;

        training.run()
    }
}
