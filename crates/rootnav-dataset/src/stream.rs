//! Batched, seeded streams of RootNav samples.
//!
//! This module provides:
//! - [`RootBatch`], the tensors consumed by a training or validation step
//! - [`BatchSource`], the contract the training loop pulls batches through
//! - [`DataStream`], a source backed by a [`RootDataset`]
//!
//! Sample decoding runs on a dedicated thread pool. Shuffling and flip
//! decisions are drawn on the calling thread so a seed reproduces a run
//! regardless of the worker count.

use crate::augmentation::HorizontalFlip;
use crate::dataset::{RootDataset, RootSample};
use crate::segmap;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use image::RgbImage;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rootnav_core::{Error, Result};
use std::sync::Arc;

/// One batch of images, class-id labels and keypoint heatmaps
#[derive(Debug, Clone)]
pub struct RootBatch<B: Backend> {
    /// `[N, 3, H, W]`, values in `[0, 1]`
    pub images: Tensor<B, 4>,
    /// `[N, H, W]` class ids
    pub labels: Tensor<B, 3, Int>,
    /// `[N, 3, H, W]`, values in `[0, 1]`
    pub heatmaps: Tensor<B, 4>,
}

impl<B: Backend> RootBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.images.dims()[0]
    }
}

/// Source of batches for one backend.
///
/// `next_batch` blocks until a batch is ready and returns `Ok(None)` once
/// the current pass over the data is exhausted; `reset` starts a new pass.
pub trait BatchSource<B: Backend> {
    /// Number of classes labels are drawn from.
    fn n_classes(&self) -> usize;

    fn next_batch(&mut self) -> Result<Option<RootBatch<B>>>;

    fn reset(&mut self);

    /// Renders a predicted class map for inspection.
    fn decode_segmap(&self, classes: &[i64], width: usize, height: usize) -> RgbImage {
        segmap::decode_segmap(classes, width, height)
    }
}

/// Options for building a [`DataStream`]
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub batch_size: usize,
    /// Reshuffle the sample order on every pass
    pub shuffle: bool,
    pub hflip: f64,
    /// Threads decoding samples
    pub n_workers: usize,
    pub seed: u64,
}

impl StreamConfig {
    /// Shuffled, optionally flipped stream for training.
    pub fn train(batch_size: usize, n_workers: usize, hflip: f64, seed: u64) -> Self {
        Self {
            batch_size,
            shuffle: true,
            hflip,
            n_workers,
            seed,
        }
    }

    /// Ordered stream without augmentation for validation.
    pub fn valid(batch_size: usize, n_workers: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            hflip: 0.0,
            n_workers,
            seed: 0,
        }
    }
}

/// Batch source over a [`RootDataset`]
pub struct DataStream<B: Backend> {
    dataset: Arc<RootDataset>,
    batch_size: usize,
    shuffle: bool,
    flip: HorizontalFlip,
    rng: ChaCha8Rng,
    order: Vec<usize>,
    cursor: usize,
    pool: rayon::ThreadPool,
    device: B::Device,
}

impl<B: Backend> DataStream<B> {
    pub fn new(dataset: Arc<RootDataset>, config: StreamConfig, device: B::Device) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch size must be greater than 0".into()));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.n_workers.max(1))
            .thread_name(|i| format!("rootnav-loader-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("Failed to build loader thread pool: {e}")))?;

        let mut stream = Self {
            order: (0..dataset.len()).collect(),
            dataset,
            batch_size: config.batch_size,
            shuffle: config.shuffle,
            flip: HorizontalFlip::new(config.hflip),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            cursor: 0,
            pool,
            device,
        };
        if stream.shuffle {
            stream.order.shuffle(&mut stream.rng);
        }

        Ok(stream)
    }

    /// Number of batches in one pass.
    pub fn batches_per_pass(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Sample order of the current pass.
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

impl<B: Backend> BatchSource<B> for DataStream<B> {
    fn n_classes(&self) -> usize {
        self.dataset.n_classes()
    }

    fn next_batch(&mut self) -> Result<Option<RootBatch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let flips: Vec<bool> = indices.iter().map(|_| self.flip.sample(&mut self.rng)).collect();

        let dataset = &self.dataset;
        let flip = self.flip;
        let samples = self.pool.install(|| {
            indices
                .par_iter()
                .zip(flips.par_iter())
                .map(|(&index, &flipped)| {
                    let sample = dataset.get(index)?;
                    Ok(if flipped { flip.apply(sample) } else { sample })
                })
                .collect::<Result<Vec<_>>>()
        })?;

        collate(&samples, &self.device).map(Some)
    }

    fn reset(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }
}

/// Stacks samples of identical size into batch tensors.
pub fn collate<B: Backend>(samples: &[RootSample], device: &B::Device) -> Result<RootBatch<B>> {
    let first = samples
        .first()
        .ok_or_else(|| Error::Dataset("Cannot collate an empty batch".into()))?;
    let (width, height) = first.dimensions();
    let (w, h, n) = (width as usize, height as usize, samples.len());

    let mut images = Vec::with_capacity(n * 3 * h * w);
    let mut labels = Vec::with_capacity(n * h * w);
    let mut heatmaps = Vec::with_capacity(n * 3 * h * w);

    for sample in samples {
        if sample.dimensions() != (width, height) {
            return Err(Error::ShapeMismatch(format!(
                "Sample '{}' is {:?} but the batch is {:?}",
                sample.name,
                sample.dimensions(),
                (width, height)
            )));
        }

        push_chw(&mut images, sample.image.as_raw());
        labels.extend(sample.label.as_raw().iter().map(|&class| class as i64));
        push_chw(&mut heatmaps, sample.heatmap.as_raw());
    }

    Ok(RootBatch {
        images: Tensor::from_data(TensorData::new(images, [n, 3, h, w]), device),
        labels: Tensor::from_data(TensorData::new(labels, [n, h, w]), device),
        heatmaps: Tensor::from_data(TensorData::new(heatmaps, [n, 3, h, w]), device),
    })
}

/// Appends interleaved RGB bytes as planar channels scaled to `[0, 1]`.
fn push_chw(out: &mut Vec<f32>, rgb: &[u8]) {
    for channel in 0..3 {
        out.extend(
            rgb.chunks_exact(3)
                .map(|pixel| pixel[channel] as f32 / 255.0),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{GrayImage, Luma, Rgb};

    type TestBackend = NdArray;

    fn dataset(count: usize) -> Arc<RootDataset> {
        let samples = (0..count)
            .map(|i| RootSample {
                name: format!("s{i}"),
                image: RgbImage::from_pixel(4, 2, Rgb([i as u8, 0, 255])),
                label: GrayImage::from_pixel(4, 2, Luma([(i % 6) as u8])),
                heatmap: RgbImage::from_pixel(4, 2, Rgb([0, 0, 51])),
            })
            .collect();
        Arc::new(RootDataset::from_samples(samples, 6).unwrap())
    }

    fn drain(stream: &mut DataStream<TestBackend>) -> Vec<usize> {
        let mut sizes = Vec::new();
        while let Some(batch) = stream.next_batch().unwrap() {
            sizes.push(batch.batch_size());
        }
        sizes
    }

    #[test]
    fn test_batch_shapes_and_values() -> Result<()> {
        let device = Default::default();
        let mut stream =
            DataStream::<TestBackend>::new(dataset(3), StreamConfig::valid(2, 1), device)?;

        let batch = stream.next_batch()?.unwrap();
        assert_eq!(batch.images.dims(), [2, 3, 2, 4]);
        assert_eq!(batch.labels.dims(), [2, 2, 4]);
        assert_eq!(batch.heatmaps.dims(), [2, 3, 2, 4]);

        let labels: Vec<i64> = batch.labels.into_data().iter::<i64>().collect();
        assert_eq!(&labels[..8], &[0; 8]);
        assert_eq!(&labels[8..], &[1; 8]);

        let heat: Vec<f32> = batch.heatmaps.into_data().iter::<f32>().collect();
        assert!(heat[..16].iter().all(|&v| v == 0.0));
        assert!(heat[16..24].iter().all(|&v| (v - 0.2).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_partial_last_batch_and_reset() -> Result<()> {
        let mut stream = DataStream::<TestBackend>::new(
            dataset(5),
            StreamConfig::valid(2, 2),
            Default::default(),
        )?;
        assert_eq!(stream.batches_per_pass(), 3);
        assert_eq!(drain(&mut stream), vec![2, 2, 1]);
        assert!(stream.next_batch()?.is_none());

        stream.reset();
        assert_eq!(drain(&mut stream), vec![2, 2, 1]);
        Ok(())
    }

    #[test]
    fn test_validation_order_is_stable() -> Result<()> {
        let mut stream = DataStream::<TestBackend>::new(
            dataset(6),
            StreamConfig::valid(4, 1),
            Default::default(),
        )?;
        assert_eq!(stream.order(), &[0, 1, 2, 3, 4, 5]);
        stream.reset();
        assert_eq!(stream.order(), &[0, 1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() -> Result<()> {
        let build = |seed| {
            DataStream::<TestBackend>::new(
                dataset(32),
                StreamConfig::train(4, 2, 0.5, seed),
                Default::default(),
            )
        };

        let mut a = build(11)?;
        let mut b = build(11)?;
        assert_eq!(a.order(), b.order());
        a.reset();
        b.reset();
        assert_eq!(a.order(), b.order());

        let mut sorted = a.order().to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..32).collect::<Vec<_>>());

        let c = build(12)?;
        assert_ne!(a.order(), c.order());
        Ok(())
    }

    #[test]
    fn test_collate_rejects_mixed_sizes() {
        let mut samples: Vec<RootSample> = (0..2)
            .map(|i| RootSample {
                name: format!("s{i}"),
                image: RgbImage::new(4, 2),
                label: GrayImage::new(4, 2),
                heatmap: RgbImage::new(4, 2),
            })
            .collect();
        samples[1].image = RgbImage::new(2, 2);
        samples[1].label = GrayImage::new(2, 2);
        samples[1].heatmap = RgbImage::new(2, 2);

        let result = collate::<TestBackend>(&samples, &Default::default());
        assert!(matches!(result, Err(Error::ShapeMismatch(_))));
    }
}
