//! Composite loss for joint segmentation and keypoint regression.
//!
//! The main model output is scored twice: every channel as a per-pixel class
//! distribution (weighted cross-entropy), and the tip and seed channels as a
//! heatmap regression (mean-squared error).

use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::{
    activation::log_softmax, backend::Backend, ElementConversion, Int, Tensor, TensorData,
};
use rootnav_core::{Error, Result, CLASS_WEIGHTS, HEATMAP_CHANNELS};

/// Classification and regression losses of one batch.
///
/// Both are scalars attached to the current graph.
#[derive(Debug, Clone)]
pub struct LossValue<B: Backend> {
    pub classification: Tensor<B, 1>,
    pub regression: Tensor<B, 1>,
}

impl<B: Backend> LossValue<B> {
    /// Sum of both terms; one backward pass on it yields the gradients of both.
    pub fn total(&self) -> Tensor<B, 1> {
        self.classification.clone() + self.regression.clone()
    }

    pub fn classification_value(&self) -> f64 {
        self.classification.clone().into_scalar().elem::<f64>()
    }

    pub fn regression_value(&self) -> f64 {
        self.regression.clone().into_scalar().elem::<f64>()
    }
}

/// Builds [`LossValue`]s from model outputs with fixed class weights
#[derive(Debug, Clone)]
pub struct LossComposer {
    class_weights: Vec<f32>,
    heatmap_channels: [usize; 3],
}

impl Default for LossComposer {
    fn default() -> Self {
        Self::new(CLASS_WEIGHTS.to_vec())
    }
}

impl LossComposer {
    pub fn new(class_weights: Vec<f32>) -> Self {
        Self {
            class_weights,
            heatmap_channels: HEATMAP_CHANNELS,
        }
    }

    pub fn class_weights(&self) -> &[f32] {
        &self.class_weights
    }

    /// Computes both losses for one batch.
    ///
    /// `output` is `[N, C, H, W]` with `C` equal to the number of class
    /// weights, `labels` is `[N, H, W]` and `heatmaps` is `[N, 3, H, W]`.
    pub fn compose<B: Backend>(
        &self,
        output: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
        heatmaps: Tensor<B, 4>,
    ) -> Result<LossValue<B>> {
        let [n, c, h, w] = output.dims();
        if c != self.class_weights.len() {
            return Err(Error::ShapeMismatch(format!(
                "model output has {c} channels but {} class weights are configured",
                self.class_weights.len()
            )));
        }
        if let Some(&channel) = self.heatmap_channels.iter().find(|&&channel| channel >= c) {
            return Err(Error::ShapeMismatch(format!(
                "heatmap channel {channel} is out of range for a {c}-channel output"
            )));
        }

        let [hn, hc, hh, hw] = heatmaps.dims();
        if hc != self.heatmap_channels.len() {
            return Err(Error::ShapeMismatch(format!(
                "heatmap target has {hc} channels, expected {}",
                self.heatmap_channels.len()
            )));
        }
        if [hn, hh, hw] != [n, h, w] {
            return Err(Error::ShapeMismatch(format!(
                "heatmap target is {:?} but the prediction is {:?}",
                [hn, hc, hh, hw],
                output.dims()
            )));
        }

        let prediction = self.select_heatmap_channels(output.clone());
        let classification = self.classification(output, labels)?;
        let regression = MseLoss::new().forward(prediction, heatmaps, Reduction::Mean);

        Ok(LossValue {
            classification,
            regression,
        })
    }

    /// Weighted cross-entropy of `output` against `labels`, normalised by the
    /// total weight of the labelled pixels.
    pub fn classification<B: Backend>(
        &self,
        output: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
    ) -> Result<Tensor<B, 1>> {
        let [n, c, h, w] = output.dims();
        if c != self.class_weights.len() {
            return Err(Error::ShapeMismatch(format!(
                "model output has {c} channels but {} class weights are configured",
                self.class_weights.len()
            )));
        }
        if labels.dims() != [n, h, w] {
            return Err(Error::ShapeMismatch(format!(
                "labels are {:?} but the prediction is {:?}",
                labels.dims(),
                [n, c, h, w]
            )));
        }

        let device = output.device();
        let weights = Tensor::<B, 1>::from_data(
            TensorData::new(self.class_weights.clone(), [self.class_weights.len()]),
            &device,
        );

        let log_probs = log_softmax(output, 1);
        let nll = log_probs
            .gather(1, labels.clone().reshape([n, 1, h, w]))
            .reshape([n * h * w])
            .neg();
        let pixel_weights = weights.select(0, labels.reshape([n * h * w]));

        Ok((nll * pixel_weights.clone()).sum() / pixel_weights.sum())
    }

    /// Stacks the heatmap channels of `output` into a `[N, 3, H, W]` tensor.
    pub fn select_heatmap_channels<B: Backend>(&self, output: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels = self
            .heatmap_channels
            .iter()
            .map(|&channel| output.clone().narrow(1, channel, 1))
            .collect();
        Tensor::cat(channels, 1)
    }
}
