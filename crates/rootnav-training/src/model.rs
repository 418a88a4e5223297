//! Stacked hourglass segmentation model.
//!
//! The training loop only relies on [`StackedSegmentationModel`]: a forward
//! pass returns one output per stack and the last one is the main output.
//! [`RootHourglass`] is a compact reference implementation of that contract.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use rootnav_core::{ModelParams, NUM_CLASSES};

/// A model producing a stack of intermediate `[N, C, H, W]` outputs.
pub trait StackedSegmentationModel<B: Backend>: Module<B> {
    /// Runs the model. The last element is the main output.
    fn forward_stack(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>>;
}

/// Configuration for the [`RootHourglass`] model
#[derive(Config, Debug)]
pub struct RootHourglassConfig {
    /// Output channels of every stack, one per segmentation class
    #[config(default = "6")]
    pub n_classes: usize,

    /// Number of stacked hourglass units
    #[config(default = "2")]
    pub stacks: usize,

    /// Feature channels inside each unit
    #[config(default = "32")]
    pub features: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,
}

impl RootHourglassConfig {
    pub fn from_params(params: &ModelParams) -> Self {
        Self::new()
            .with_n_classes(NUM_CLASSES)
            .with_stacks(params.stacks)
            .with_features(params.features)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> RootHourglass<B> {
        let stem = ConvBlock::new(self.in_channels, self.features, 3, device);
        let units = (0..self.stacks.max(1))
            .map(|_| HourglassUnit::new(self.features, self.n_classes, device))
            .collect();

        RootHourglass { stem, units }
    }
}

/// Conv2d, BatchNorm and ReLU with same padding
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

/// One encoder/decoder unit with a class head.
///
/// The unit halves the resolution once and restores it with a transposed
/// convolution, so input height and width must be even.
#[derive(Module, Debug)]
pub struct HourglassUnit<B: Backend> {
    down: ConvBlock<B>,
    pool: MaxPool2d,
    bottleneck: ConvBlock<B>,
    up: ConvTranspose2d<B>,
    merge: ConvBlock<B>,
    head: Conv2d<B>,
    remap: Conv2d<B>,
}

impl<B: Backend> HourglassUnit<B> {
    pub fn new(features: usize, n_classes: usize, device: &B::Device) -> Self {
        Self {
            down: ConvBlock::new(features, features, 3, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            bottleneck: ConvBlock::new(features, features, 3, device),
            up: ConvTranspose2dConfig::new([features, features], [2, 2])
                .with_stride([2, 2])
                .init(device),
            merge: ConvBlock::new(features, features, 3, device),
            head: Conv2dConfig::new([features, n_classes], [1, 1]).init(device),
            remap: Conv2dConfig::new([n_classes, features], [1, 1]).init(device),
        }
    }

    /// Returns the features for the next unit and this unit's class output.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let skip = x.clone();
        let low = self.pool.forward(self.down.forward(x));
        let low = self.bottleneck.forward(low);
        let up = self.up.forward(low);

        let merged = self.merge.forward(up + skip.clone());
        let output = self.head.forward(merged.clone());
        let next = skip + merged + self.remap.forward(output.clone());

        (next, output)
    }
}

/// Stacked hourglass network emitting one class map per unit
#[derive(Module, Debug)]
pub struct RootHourglass<B: Backend> {
    stem: ConvBlock<B>,
    units: Vec<HourglassUnit<B>>,
}

impl<B: Backend> RootHourglass<B> {
    pub fn stacks(&self) -> usize {
        self.units.len()
    }
}

impl<B: Backend> StackedSegmentationModel<B> for RootHourglass<B> {
    fn forward_stack(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut x = self.stem.forward(images);
        let mut outputs = Vec::with_capacity(self.units.len());

        for unit in &self.units {
            let (next, output) = unit.forward(x);
            outputs.push(output);
            x = next;
        }

        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn test_output_stack_shapes() {
        let device = Default::default();
        let model = RootHourglassConfig::new()
            .with_stacks(3)
            .with_features(8)
            .init::<TestBackend>(&device);
        assert_eq!(model.stacks(), 3);

        let images = Tensor::<TestBackend, 4>::random([2, 3, 8, 12], Distribution::Default, &device);
        let outputs = model.forward_stack(images);

        assert_eq!(outputs.len(), 3);
        for output in outputs {
            assert_eq!(output.dims(), [2, NUM_CLASSES, 8, 12]);
        }
    }

    #[test]
    fn test_config_from_params() {
        let params = ModelParams { stacks: 1, features: 4 };
        let config = RootHourglassConfig::from_params(&params);
        assert_eq!(config.n_classes, NUM_CLASSES);
        assert_eq!(config.stacks, 1);
        assert_eq!(config.features, 4);
    }
}
