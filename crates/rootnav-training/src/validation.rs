//! Validation pass over a held-out stream.

use crate::loss::LossComposer;
use crate::model::StackedSegmentationModel;
use burn::tensor::backend::Backend;
use burn::tensor::ElementConversion;
use image::RgbImage;
use rootnav_core::{AverageMeter, Error, Result, RunningScore, Scores};
use rootnav_dataset::BatchSource;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Outcome of one validation pass
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Training iteration the model was scored at
    pub iteration: usize,
    /// Mean classification loss per batch
    pub val_loss: f64,
    pub batches: usize,
    pub scores: Scores,
    /// IoU of every class seen in the labels or predictions
    pub class_iou: BTreeMap<usize, f64>,
    /// Decoded prediction of the first validation image
    #[serde(skip)]
    pub snapshot: Option<RgbImage>,
}

/// Scores a model on a full pass of a validation stream.
///
/// The model is expected to be in inference mode already, e.g. the result of
/// `AutodiffModule::valid`, so the pass tracks no gradients and cannot
/// change parameters.
pub struct ValidationPass<'a> {
    loss: &'a LossComposer,
    iteration: usize,
}

impl<'a> ValidationPass<'a> {
    pub fn new(loss: &'a LossComposer, iteration: usize) -> Self {
        Self { loss, iteration }
    }

    /// Runs the pass. `metrics` and `loss_meter` are reset before the first
    /// batch and again once the report is built.
    pub fn run<B, M, S>(
        &self,
        model: &M,
        stream: &mut S,
        metrics: &mut RunningScore,
        loss_meter: &mut AverageMeter,
    ) -> Result<ValidationReport>
    where
        B: Backend,
        M: StackedSegmentationModel<B>,
        S: BatchSource<B>,
    {
        metrics.reset();
        loss_meter.reset();
        stream.reset();

        let mut batches = 0;
        let mut snapshot = None;

        while let Some(batch) = stream.next_batch()? {
            let [_, _, height, width] = batch.images.dims();

            let output = model
                .forward_stack(batch.images)
                .pop()
                .ok_or_else(|| Error::Model("model returned no outputs".into()))?;

            let loss = self.loss.classification(output.clone(), batch.labels.clone())?;
            loss_meter.update(loss.into_scalar().elem::<f64>(), 1);

            let predicted: Vec<i64> = output.argmax(1).into_data().iter::<i64>().collect();
            let ground_truth: Vec<i64> = batch.labels.into_data().iter::<i64>().collect();
            metrics.update(&ground_truth, &predicted)?;

            if snapshot.is_none() {
                let first = &predicted[..height * width];
                snapshot = Some(stream.decode_segmap(first, width, height));
            }

            batches += 1;
        }

        if batches == 0 {
            warn!("Validation stream produced no batches");
        }
        debug!("Validated {} batches", batches);

        let (scores, class_iou) = metrics.get_scores();
        let report = ValidationReport {
            iteration: self.iteration,
            val_loss: loss_meter.avg,
            batches,
            scores,
            class_iou,
            snapshot,
        };

        metrics.reset();
        loss_meter.reset();

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RootHourglassConfig;
    use burn::backend::NdArray;
    use image::{GrayImage, Luma, Rgb};
    use rootnav_dataset::{DataStream, RootDataset, RootSample, StreamConfig};
    use std::sync::Arc;

    type TestBackend = NdArray;

    fn stream(count: usize, batch_size: usize) -> DataStream<TestBackend> {
        let samples = (0..count)
            .map(|i| RootSample {
                name: format!("v{i}"),
                image: RgbImage::from_pixel(4, 4, Rgb([(i * 40) as u8, 90, 200])),
                label: GrayImage::from_fn(4, 4, |x, _| Luma([(x % 3) as u8])),
                heatmap: RgbImage::new(4, 4),
            })
            .collect();
        let dataset = Arc::new(RootDataset::from_samples(samples, 6).unwrap());
        DataStream::new(dataset, StreamConfig::valid(batch_size, 1), Default::default()).unwrap()
    }

    #[test]
    fn test_pass_covers_every_pixel_once() -> Result<()> {
        let device = Default::default();
        let model = RootHourglassConfig::new()
            .with_stacks(1)
            .with_features(4)
            .init::<TestBackend>(&device);
        let loss = LossComposer::default();

        let mut stream = stream(5, 2);
        let mut metrics = RunningScore::new(6);
        let mut meter = AverageMeter::new();

        let report = ValidationPass::new(&loss, 20).run(&model, &mut stream, &mut metrics, &mut meter)?;

        assert_eq!(report.iteration, 20);
        assert_eq!(report.batches, 3);
        assert!(report.val_loss.is_finite());
        assert!(report.val_loss > 0.0);
        assert!(report.scores.overall_accuracy >= 0.0 && report.scores.overall_accuracy <= 1.0);
        assert_eq!(report.snapshot.as_ref().map(|s| s.dimensions()), Some((4, 4)));

        // Accumulators are left clean for the next pass
        assert_eq!(metrics.total(), 0);
        assert_eq!(meter.count, 0);

        // A second pass over the same data gives the same result
        let again = ValidationPass::new(&loss, 40).run(&model, &mut stream, &mut metrics, &mut meter)?;
        assert_eq!(again.batches, 3);
        assert_eq!(again.scores, report.scores);
        Ok(())
    }

    #[test]
    fn test_pass_leaves_parameters_untouched() -> Result<()> {
        use crate::checkpoint::encode_record;
        use burn::backend::Autodiff;
        use burn::module::{AutodiffModule, Module};

        type TrainBackend = Autodiff<TestBackend>;

        let device = Default::default();
        let model = RootHourglassConfig::new()
            .with_stacks(2)
            .with_features(4)
            .init::<TrainBackend>(&device);
        let trained_before = encode_record::<TrainBackend, _>(model.clone().into_record())?;

        let inference = model.valid();
        let inference_before = encode_record::<TestBackend, _>(inference.clone().into_record())?;

        let loss = LossComposer::default();
        ValidationPass::new(&loss, 10).run(
            &inference,
            &mut stream(4, 2),
            &mut RunningScore::new(6),
            &mut AverageMeter::new(),
        )?;

        // Batch norm statistics and weights are unchanged in both copies
        assert_eq!(encode_record::<TestBackend, _>(inference.into_record())?, inference_before);
        assert_eq!(encode_record::<TrainBackend, _>(model.into_record())?, trained_before);
        Ok(())
    }

    #[test]
    fn test_empty_stream() -> Result<()> {
        let device = Default::default();
        let model = RootHourglassConfig::new()
            .with_stacks(1)
            .with_features(4)
            .init::<TestBackend>(&device);
        let loss = LossComposer::default();
        let dataset = Arc::new(RootDataset::from_samples(Vec::new(), 6)?);
        let mut empty =
            DataStream::<TestBackend>::new(dataset, StreamConfig::valid(2, 1), Default::default())?;

        let report = ValidationPass::new(&loss, 0).run(
            &model,
            &mut empty,
            &mut RunningScore::new(6),
            &mut AverageMeter::new(),
        )?;
        assert_eq!(report.batches, 0);
        assert_eq!(report.scores, Scores::default());
        assert!(report.snapshot.is_none());
        Ok(())
    }
}
