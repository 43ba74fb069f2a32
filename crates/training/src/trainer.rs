use std::{fmt, fs, sync::Arc};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor,
};
use clmbr_model::{Batch, EhrTransformer, ParamPath, ParameterSet, Phase};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    checkpoint::{self, BestArtifacts, BestRecord, FreezeSelection},
    config::RunConfig,
    data::{BatchStore, BatchStream, BatchTask, DirectoryBatchStore, LabelerType, Split, StreamItem, StreamOptions},
    evaluation::{EvaluationReport, Evaluator},
    logging::Logger,
    loss::{LossOutput, TaskLoss},
    metrics::TrainingMetrics,
    optimizer::{AdamWConfig, GradientScaler, TrainerOptimizer, TrainerOptimizerOptions},
    partition::ParameterPartition,
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

/// Learning-rate divisor applied when frozen weights rejoin training.
const UNFREEZE_LR_DIVISOR: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Diverged,
    EarlyStopped,
    MaxIterReached,
    EpochsExhausted,
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::Diverged => "diverged",
            StopReason::EarlyStopped => "early stopped",
            StopReason::MaxIterReached => "reached max_iter",
            StopReason::EpochsExhausted => "finished all epochs",
            StopReason::Interrupted => "interrupted",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub reason: StopReason,
    /// Stream steps consumed, including skipped empty batches.
    pub steps: usize,
    pub best: Option<BestRecord>,
    pub loss_scale: f64,
}

/// Best-metric bookkeeping across evaluation checkpoints.
struct Progress {
    best_metric: f64,
    best: Option<BestRecord>,
    last_good: usize,
}

pub struct Trainer {
    config: TrainingConfig,
    run: RunConfig,
    model: EhrTransformer,
    train_store: Arc<dyn BatchStore>,
    dev_store: Arc<dyn BatchStore>,
    dev_split: Split,
    partition: ParameterPartition,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    loss: TaskLoss,
    scaler: GradientScaler,
    metrics: TrainingMetrics,
    logger: Logger,
    rng: StdRng,
    num_train_batches: usize,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let train_store: Arc<dyn BatchStore> =
            Arc::new(DirectoryBatchStore::open(&config.data.batches_path)?);
        let dev_store = match &config.data.dev_batches_path {
            Some(path) => Some(Arc::new(DirectoryBatchStore::open(path)?) as Arc<dyn BatchStore>),
            None => None,
        };
        Self::with_stores(config, train_store, dev_store)
    }

    /// Builds a trainer over already opened batch stores. When `dev_store` is given its train
    /// split replaces the dev split of `train_store` for evaluation.
    pub fn with_stores(
        config: TrainingConfig,
        train_store: Arc<dyn BatchStore>,
        dev_store: Option<Arc<dyn BatchStore>>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let directory = config.runtime.directory.clone();
        if directory.exists() {
            return Err(TrainingError::initialization(format!(
                "run directory {} already exists",
                directory.display()
            )));
        }
        fs::create_dir_all(&directory)?;
        let mut logger = Logger::create(&directory, config.runtime.tensorboard_dir.as_deref())?;
        logger.info(format!("Training model in {}", directory.display()));

        let device = select_device();

        let source = match &config.transfer.start_from_checkpoint {
            Some(path) => {
                logger.info(format!("Starting from checkpoint {}", path.display()));
                Some(checkpoint::load_checkpoint(path, &device)?)
            }
            None => None,
        };

        let info = train_store.info();
        let run = RunConfig::resolve(&config, info, source.as_ref().map(|(run, _)| run))?;
        checkpoint::save_config(&directory, &run)?;
        logger.info(format!("Got config {}", serde_json::to_string(&run)?));

        if !device.is_cpu() {
            if let Err(err) = device.set_seed(run.seed) {
                log::warn!("failed to seed device RNG: {err}");
            }
        }

        let model = EhrTransformer::new(run.transformer.clone(), run.task.clone())
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        let mut params = model
            .init(run.seed, &device)
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        seed_task_parameters(&mut params, &config, &run, &info.task)?;

        let (trainable, frozen) = match &source {
            Some((_, source_params)) => {
                let freeze = if config.transfer.freeze_weights {
                    FreezeSelection::Transplanted
                } else {
                    FreezeSelection::None
                };
                let transplanted = checkpoint::transplant(source_params, params, &freeze)?;
                for module in &transplanted.fresh {
                    logger.info(format!("Have to train {module} from scratch"));
                }
                (transplanted.trainable, transplanted.frozen)
            }
            None => (params, ParameterSet::new()),
        };
        drop(source);

        let partition = ParameterPartition::new(
            trainable,
            frozen,
            config.runtime.precision.compute_dtype(),
        )?;
        logger.info(format!(
            "Total params {} ({} frozen tensors)",
            partition.trainable_element_count(),
            partition.frozen_paths().len()
        ));

        let num_train_batches = train_store.batch_count(Split::Train);
        if num_train_batches == 0 {
            return Err(TrainingError::initialization(
                "batch store has no train batches",
            ));
        }
        logger.info(format!(
            "total steps {} num train batches {}",
            run.n_epochs * num_train_batches,
            num_train_batches
        ));

        let optimizer = build_optimizer(&partition, &config, &run, run.learning_rate)?;
        let scheduler = build_scheduler(&config, &run, num_train_batches, run.learning_rate)?;
        let scaler = GradientScaler::new(config.runtime.loss_scale.clone());

        let (dev_store, dev_split) = match dev_store {
            Some(store) => (store, Split::Train),
            None => (Arc::clone(&train_store), Split::Dev),
        };

        Ok(Self {
            rng: StdRng::seed_from_u64(run.seed),
            loss: TaskLoss::new(run.task.clone()),
            config,
            run,
            model,
            train_store,
            dev_store,
            dev_split,
            partition,
            optimizer,
            scheduler,
            scaler,
            metrics: TrainingMetrics::new(),
            logger,
            num_train_batches,
        })
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn partition(&self) -> &ParameterPartition {
        &self.partition
    }

    /// Overwrites one task-head weight before training starts.
    pub fn seed_task_head(
        &mut self,
        module: &str,
        weight: &str,
        value: &Tensor,
    ) -> Result<(), TrainingError> {
        self.partition.replace(&ParamPath::new(module, weight), value)
    }

    /// Runs evaluation on a split of the run's batches with the current parameters.
    pub fn evaluate(&self, split: Split) -> Result<EvaluationReport, TrainingError> {
        let (store, split) = match split {
            Split::Dev => (self.dev_store.as_ref(), self.dev_split),
            other => (self.train_store.as_ref(), other),
        };
        let params = self.partition.compute_params()?;
        Evaluator::new(&self.model).evaluate(
            &params,
            store,
            split,
            self.config.evaluation.max_batches,
        )
    }

    pub fn train(&mut self) -> Result<TrainingOutcome, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<TrainingOutcome, TrainingError>
    where
        F: FnMut() -> bool,
    {
        self.logger
            .info(format!("Starting loss scale {}", self.scaler.loss_scale()));
        let train = self.evaluate(Split::Train)?;
        self.logger.info(format!("Starting train loss {}", describe(&train)));
        let dev = self.evaluate(Split::Dev)?;
        self.logger.info(format!("Starting dev loss {}", describe(&dev)));

        let stream = BatchStream::spawn(
            Arc::clone(&self.train_store),
            StreamOptions {
                seed: self.run.seed,
                n_epochs: self.run.n_epochs,
                num_threads: self.config.data.num_batch_threads,
                prefetch_depth: self.config.data.prefetch_depth,
            },
        )?;

        let evaluation = self.config.evaluation.clone();
        let per_limit = evaluation.every_n_steps.min(self.num_train_batches).max(1);
        let unfreeze_step = self
            .config
            .transfer
            .unfreeze_max_step
            .min(self.num_train_batches * self.config.transfer.unfreeze_epochs);

        let mut progress = Progress {
            best_metric: f64::INFINITY,
            best: None,
            last_good: 0,
        };
        let mut steps = 0usize;
        let mut reason = StopReason::EpochsExhausted;

        for item in stream {
            if should_stop() {
                self.logger.info("Stop requested, shutting down");
                reason = StopReason::Interrupted;
                break;
            }
            let StreamItem { step, batch } = item?;
            steps = step + 1;
            let Some(batch) = batch else {
                continue;
            };

            if (step % per_limit == 0 && step != 0) || evaluation.early_steps.contains(&step) {
                if let Some(stop) = self.evaluation_checkpoint(step, &mut progress)? {
                    reason = stop;
                    break;
                }
            }

            if self.config.transfer.freeze_weights && step == unfreeze_step {
                self.unfreeze()?;
            }

            self.train_step(step, &batch)?;
        }

        self.logger.info(format!(
            "Training {} after {} steps, loss scale {}",
            reason,
            steps,
            self.scaler.loss_scale()
        ));
        self.logger.flush();
        Ok(TrainingOutcome {
            reason,
            steps,
            best: progress.best,
            loss_scale: self.scaler.loss_scale(),
        })
    }

    /// One mixed-precision update. Overflowing gradients discard the update.
    fn train_step(&mut self, step: usize, batch: &Batch) -> Result<(), TrainingError> {
        let params = self.partition.compute_params()?;
        let output = self
            .model
            .forward(&params, batch, &mut Phase::Train(&mut self.rng))
            .map_err(|err| TrainingError::runtime(format!("step {step} forward failed: {err}")))?;
        let LossOutput { loss, metrics, .. } = self.loss.compute(&output, batch, false)?;

        let scaled = self.scaler.scale(&loss)?;
        let mut grads = scaled
            .backward()
            .map_err(|err| TrainingError::runtime(format!("step {step} backward failed: {err}")))?;
        let check = self.optimizer.unscale_gradients(&mut grads, &self.scaler)?;
        let average_loss = metrics.average_loss() as f64;
        let found_inf = check.found_inf || !average_loss.is_finite();
        self.scaler.update(found_inf);

        if found_inf {
            self.optimizer.zero_grad(&mut grads);
            self.metrics.record_skipped();
            log::debug!(
                "step {step}: non-finite gradients, loss scale now {}",
                self.scaler.loss_scale()
            );
            return Ok(());
        }

        self.optimizer.set_learning_rate(self.scheduler.step());
        self.optimizer.step(&mut grads)?;

        let snapshot =
            self.metrics
                .record_step(metrics.num_indices() as u64, average_loss, check.norm);
        if step % self.config.runtime.log_every_n_steps == 0 {
            self.logger.log_training_step(
                step,
                self.optimizer.learning_rate(),
                self.scaler.loss_scale(),
                &snapshot,
            );
        }
        Ok(())
    }

    /// Evaluates train and dev splits and decides whether training continues.
    fn evaluation_checkpoint(
        &mut self,
        step: usize,
        progress: &mut Progress,
    ) -> Result<Option<StopReason>, TrainingError> {
        self.logger.info(format!(
            "Loss scale {} (stable steps {}), learning rate {:.5e}",
            self.scaler.loss_scale(),
            self.scaler.stable_steps(),
            self.scheduler.learning_rate()
        ));
        let train = self.evaluate(Split::Train)?;
        self.logger.log_evaluation(step, "Train", &train);
        let dev = self.evaluate(Split::Dev)?;
        self.logger.log_evaluation(step, "Dev", &dev);

        let metric = dev.metric();
        if metric.is_nan() || self.scaler.is_collapsed() {
            self.logger.error("Diverged, shutting down");
            return Ok(Some(StopReason::Diverged));
        }

        if metric < progress.best_metric {
            progress.last_good = step;
            progress.best_metric = metric;
            let test = self.evaluate(Split::Test)?;
            let params = self.partition.master_params()?;
            let optimizer_state = self.optimizer.state()?;
            let record = checkpoint::write_best_artifacts(
                &self.config.runtime.directory,
                &self.run,
                &BestArtifacts {
                    step,
                    metric,
                    params: &params,
                    optimizer: &optimizer_state,
                    test: &test,
                },
            )?;
            self.logger.info(format!(
                "New best at step {} with metric {}, test {}",
                step,
                metric,
                describe(&test)
            ));
            progress.best = Some(record);
        } else if let Some(window) = self.config.evaluation.early_stopping_window_steps {
            if step - progress.last_good > window {
                self.logger.info(format!(
                    "We haven't seen improvement in the dev loss in {window} steps, so apply early stopping"
                ));
                return Ok(Some(StopReason::EarlyStopped));
            }
        }

        if let Some(max_iter) = self.config.evaluation.max_iter {
            if step > max_iter {
                self.logger.info("Stopping due to max iter");
                return Ok(Some(StopReason::MaxIterReached));
            }
        }

        self.logger.info("Continuing to train ...");
        self.logger.flush();
        Ok(None)
    }

    fn unfreeze(&mut self) -> Result<(), TrainingError> {
        let released = self.partition.unfreeze()?;
        let lr = self.run.learning_rate / UNFREEZE_LR_DIVISOR;
        self.optimizer = build_optimizer(&self.partition, &self.config, &self.run, lr)?;
        self.scheduler = build_scheduler(&self.config, &self.run, self.num_train_batches, lr)?;
        self.logger.info(format!(
            "Swapping to full training: {released} tensors unfrozen, learning rate {}",
            self.optimizer.learning_rate()
        ));
        Ok(())
    }
}

/// Seeds task heads from batch-info priors or a linear probe before any transplant.
fn seed_task_parameters(
    params: &mut ParameterSet,
    config: &TrainingConfig,
    run: &RunConfig,
    task: &BatchTask,
) -> Result<(), TrainingError> {
    match task {
        BatchTask::Clmbr { .. } => Ok(()),
        BatchTask::SurvivalClmbr { survival_dict } => {
            checkpoint::seed_hazard_bias(params, &run.task, &survival_dict.lambdas)
        }
        BatchTask::LabeledPatients {
            labeler_type,
            lambda,
            ..
        } => {
            if let Some(path) = &config.transfer.linear_probe {
                let probe = checkpoint::load_linear_probe(path)?;
                return checkpoint::apply_linear_probe(params, &run.task, &probe);
            }
            match (labeler_type, lambda) {
                (LabelerType::Survival, Some(lambda)) => {
                    checkpoint::seed_hazard_bias(params, &run.task, &[*lambda])
                }
                _ => Ok(()),
            }
        }
    }
}

fn build_optimizer(
    partition: &ParameterPartition,
    config: &TrainingConfig,
    run: &RunConfig,
    learning_rate: f64,
) -> Result<TrainerOptimizer, TrainingError> {
    TrainerOptimizer::new(
        partition.trainable_vars(),
        AdamWConfig {
            learning_rate,
            beta1: config.optimizer.beta1,
            beta2: config.optimizer.beta2,
            epsilon: config.optimizer.epsilon,
            weight_decay: run.weight_decay,
        },
        TrainerOptimizerOptions {
            clip_global_norm: Some(run.max_grad_norm),
            ..TrainerOptimizerOptions::default()
        },
    )
}

fn build_scheduler(
    config: &TrainingConfig,
    run: &RunConfig,
    num_train_batches: usize,
    base_lr: f64,
) -> Result<Box<dyn LRScheduler>, TrainingError> {
    SchedulerConfig {
        base_lr,
        total_steps: run.n_epochs * num_train_batches,
        warmup_steps: config.optimizer.warmup_steps,
    }
    .build()
}

fn describe(report: &EvaluationReport) -> String {
    serde_json::to_string(report).unwrap_or_else(|_| format!("{report:?}"))
}

/// Picks Metal, then CUDA, then the CPU.
pub fn select_device() -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    log::info!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available,
        metal_available
    );

    if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("device: using Metal GPU #0");
                return device;
            }
            Err(err) => log::warn!("failed to initialize metal device, falling back to CPU: {err}"),
        }
    } else if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                log::info!("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => log::warn!("cuda reported available but initialization failed: {err}"),
        }
    } else {
        log::info!("no GPU backend available; using CPU");
    }
    Device::Cpu
}
