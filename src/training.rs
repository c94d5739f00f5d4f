use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use burn::{
    config::Config,
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsAccumulator, GradientsParams, Optimizer},
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use log::{debug, info, warn};
use ndarray::Axis;

use crate::{
    data::{SegBatch, SegBatcher, SegDataset, CLASS_NAMES, SEMANTIC_CLASS_COUNT},
    logger::{JsonlLogger, ScalarLogger},
    metric::{label_array, mean_iou, MeanIouMetric},
    model::{predicted_labels, ModelConfig, SegModel},
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,

    pub optimizer: AdamConfig,

    #[config(default = 100)]
    pub epoch_count: usize,

    #[config(default = 1)]
    pub val_interval: usize,

    #[config(default = 32)]
    pub train_batch_size: usize,

    #[config(default = 32)]
    pub test_batch_size: usize,

    #[config(default = 1)]
    pub accumulate_gradient: usize,

    #[config(default = 2.0e-4)]
    pub learning_rate: f64,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 4)]
    pub worker_count: usize,
}

/// Highest validation mean IoU seen so far; starts at 0.0.
#[derive(Debug, Default)]
pub struct BestIou {
    best: f64,
}

impl BestIou {
    /// Record a new score; true when it strictly improves on the best.
    pub fn observe(&mut self, iou: f64) -> bool {
        if iou > self.best {
            self.best = iou;
            true
        } else {
            false
        }
    }

    pub fn value(&self) -> f64 {
        self.best
    }
}

#[derive(Debug, Clone)]
pub struct EpochReport {
    pub avg_loss: f64,
    pub mean_iou: f64,
    pub optimizer_steps: usize,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub avg_loss: f64,
    pub mean_iou: f64,
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: EpochReport,
    pub val: Option<ValidationReport>,
}

pub struct FitReport<B: AutodiffBackend> {
    pub model: SegModel<B>,
    pub best_iou: f64,
    pub epochs: Vec<EpochSummary>,
}

pub struct TrainerOptions {
    pub learning_rate: f64,
    pub accumulate_gradient: usize,
    pub val_interval: usize,
    pub save_dir: PathBuf,
    pub semantic_classes: usize,
}

pub struct Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<SegModel<B>, B>,
{
    model: SegModel<B>,
    optim: O,
    dataloader_train: Arc<dyn DataLoader<SegBatch<B>>>,
    dataloader_valid: Arc<dyn DataLoader<SegBatch<B::InnerBackend>>>,
    logger: Box<dyn ScalarLogger>,
    options: TrainerOptions,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<SegModel<B>, B>,
{
    pub fn new(
        model: SegModel<B>,
        optim: O,
        dataloader_train: Arc<dyn DataLoader<SegBatch<B>>>,
        dataloader_valid: Arc<dyn DataLoader<SegBatch<B::InnerBackend>>>,
        logger: Box<dyn ScalarLogger>,
        options: TrainerOptions,
    ) -> Self {
        Self {
            model,
            optim,
            dataloader_train,
            dataloader_valid,
            logger,
            options,
        }
    }

    /// Run the whole training schedule: each epoch trains, validates on
    /// the configured interval, logs a summary, and checkpoints.
    pub fn fit(mut self, epochs: usize) -> Result<FitReport<B>> {
        fs::create_dir_all(&self.options.save_dir)?;

        let mut best = BestIou::default();
        let mut train_iters = 0usize;
        let mut val_iters = 0usize;
        let mut summaries = Vec::with_capacity(epochs);

        info!("===> start training for {epochs} epochs");
        for epoch in 1..=epochs {
            let train = self.train_epoch(epoch, &mut train_iters)?;

            let val = if epoch % self.options.val_interval == 0 {
                let report = self.valid_epoch(epoch, &mut val_iters)?;
                if best.observe(report.mean_iou) {
                    info!(
                        "best model saved, validation mean IoU {:.7}",
                        report.mean_iou
                    );
                    self.save(self.options.save_dir.join("model_best"))?;
                }
                Some(report)
            } else {
                None
            };

            self.save(self.options.save_dir.join(format!("model_{epoch}")))?;

            info!("Epoch {epoch}");
            info!("Train loss: {:.7}", train.avg_loss);
            info!("Train mean IoU: {:.7}", train.mean_iou);
            if let Some(val) = &val {
                info!("Valid loss: {:.7}", val.avg_loss);
                info!("Valid mean IoU: {:.7}", val.mean_iou);
            }

            summaries.push(EpochSummary { epoch, train, val });
        }

        Ok(FitReport {
            model: self.model,
            best_iou: best.value(),
            epochs: summaries,
        })
    }

    fn train_epoch(&mut self, epoch: usize, iters: &mut usize) -> Result<EpochReport> {
        let mut metric = MeanIouMetric::new(self.options.semantic_classes);
        let mut accumulator = GradientsAccumulator::new();
        let mut accumulated = 0usize;
        let mut steps = 0usize;
        let mut loss_sum = 0.0;
        let mut batches = 0usize;

        for batch in self.dataloader_train.iter() {
            let output = self.model.forward_segmentation(batch.images, batch.masks);

            let grads = GradientsParams::from_grads(output.loss.backward(), &self.model);
            accumulator.accumulate(&self.model, grads);
            accumulated += 1;
            if accumulated == self.options.accumulate_gradient {
                let grads = accumulator.grads();
                self.model =
                    self.optim
                        .step(self.options.learning_rate, self.model.clone(), grads);
                accumulated = 0;
                steps += 1;
            }

            let loss_value: f64 = output.loss.into_scalar().elem();
            loss_sum += loss_value;
            batches += 1;

            metric.update(
                &label_array(predicted_labels(output.logits))?,
                &label_array(output.targets)?,
            );

            self.logger.log_scalar("loss/train_loss", loss_value, *iters);
            *iters += 1;

            debug!(
                "epoch {epoch} iter {batches}: loss={:.5} {}={}",
                loss_sum / batches as f64,
                metric.name(),
                metric.print_score()
            );
        }

        // Flush a trailing partial accumulation window.
        if accumulated > 0 {
            let grads = accumulator.grads();
            self.model = self
                .optim
                .step(self.options.learning_rate, self.model.clone(), grads);
            steps += 1;
        }

        let score = metric.get_score();
        self.logger.log_scalar("mIoU/train_miou", score, epoch);

        Ok(EpochReport {
            avg_loss: loss_sum / batches.max(1) as f64,
            mean_iou: score,
            optimizer_steps: steps,
        })
    }

    fn valid_epoch(&mut self, epoch: usize, iters: &mut usize) -> Result<ValidationReport> {
        let model = self.model.valid();

        let mut preds = Vec::new();
        let mut truths = Vec::new();
        let mut loss_sum = 0.0;
        let mut batches = 0usize;

        for batch in self.dataloader_valid.iter() {
            let output = model.forward_segmentation(batch.images, batch.masks);

            let loss_value: f64 = output.loss.into_scalar().elem();
            loss_sum += loss_value;
            batches += 1;

            preds.push(label_array(predicted_labels(output.logits))?);
            truths.push(label_array(output.targets)?);

            self.logger.log_scalar("loss/val_loss", loss_value, *iters);
            *iters += 1;
        }

        // Score the whole epoch at once over the concatenated label maps.
        let score = if preds.is_empty() {
            0.0
        } else {
            let pred_views: Vec<_> = preds.iter().map(|a| a.view()).collect();
            let truth_views: Vec<_> = truths.iter().map(|a| a.view()).collect();
            mean_iou(
                &ndarray::concatenate(Axis(0), &pred_views)?,
                &ndarray::concatenate(Axis(0), &truth_views)?,
                self.options.semantic_classes,
            )
        };
        self.logger.log_scalar("mIoU/val_miou", score, epoch);

        Ok(ValidationReport {
            avg_loss: loss_sum / batches.max(1) as f64,
            mean_iou: score,
        })
    }

    /// Serialize model parameters only; optimizer state is not recorded.
    fn save(&self, path: PathBuf) -> Result<()> {
        self.model
            .clone()
            .save_file(&path, &CompactRecorder::new())
            .map_err(|e| anyhow!("failed to save checkpoint {}: {e:?}", path.display()))
    }
}

/// Wire datasets, model, optimizer, and logger together and train.
pub fn train<B: AutodiffBackend>(
    data_dir: &Path,
    save_dir: &Path,
    resume: Option<&Path>,
    pretrained: bool,
    config: TrainingConfig,
    device: B::Device,
) -> Result<()> {
    fs::create_dir_all(save_dir)?;
    config.save(save_dir.join("config.json"))?;

    B::seed(config.seed);

    let batcher_train = SegBatcher::<B>::new(device.clone());
    let batcher_valid = SegBatcher::<B::InnerBackend>::new(device.clone());

    let train_set = SegDataset::load(&data_dir.join("train"))?;
    let val_set = SegDataset::load(&data_dir.join("validation"))?;
    info!(
        "loaded {} training and {} validation samples ({} classes: {})",
        train_set.len(),
        val_set.len(),
        CLASS_NAMES.len(),
        CLASS_NAMES.join(", ")
    );

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.train_batch_size)
        .shuffle(config.seed)
        .num_workers(config.worker_count)
        .build(train_set);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.test_batch_size)
        .num_workers(config.worker_count)
        .build(val_set);

    let mut model = config.model.init::<B>(&device);

    if pretrained {
        let path = data_dir.join("pretrained_encoder");
        if path.with_extension("mpk").exists() {
            model = model.load_encoder_record(&path, &device)?;
            info!("loaded pretrained encoder from {}", path.display());
        } else {
            warn!(
                "pretrained encoder not found at {}, training from scratch",
                path.display()
            );
        }
    }

    if let Some(path) = resume {
        model = model
            .load_file(path, &CompactRecorder::new(), &device)
            .map_err(|e| anyhow!("failed to load resume checkpoint {}: {e:?}", path.display()))?;
        info!("resumed model from {}", path.display());
    }

    let optim = config.optimizer.init();
    let logger = JsonlLogger::create(&save_dir.join("scalars.jsonl"))?;

    let trainer = Trainer::new(
        model,
        optim,
        dataloader_train,
        dataloader_valid,
        Box::new(logger),
        TrainerOptions {
            learning_rate: config.learning_rate,
            accumulate_gradient: config.accumulate_gradient.max(1),
            val_interval: config.val_interval.max(1),
            save_dir: save_dir.to_path_buf(),
            semantic_classes: SEMANTIC_CLASS_COUNT,
        },
    );

    let report = trainer.fit(config.epoch_count)?;
    info!(
        "training finished, best validation mean IoU {:.7}",
        report.best_iou
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::BestIou;

    #[test]
    fn best_iou_updates_only_on_strict_improvement() {
        let mut best = BestIou::default();
        let decisions: Vec<bool> = [0.10, 0.25, 0.20]
            .into_iter()
            .map(|iou| best.observe(iou))
            .collect();

        assert_eq!(decisions, vec![true, true, false]);
        assert_eq!(best.value(), 0.25);
    }

    #[test]
    fn best_iou_ignores_ties() {
        let mut best = BestIou::default();
        assert!(best.observe(0.5));
        assert!(!best.observe(0.5));
        assert_eq!(best.value(), 0.5);
    }

    #[test]
    fn best_iou_zero_score_is_not_an_improvement() {
        let mut best = BestIou::default();
        assert!(!best.observe(0.0));
    }
}
