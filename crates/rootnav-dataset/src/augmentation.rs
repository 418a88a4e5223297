//! Data augmentation for RootNav samples.
//!
//! Geometric transforms must move the image, the label map and the heatmap
//! together, so every augmentation here operates on a whole [`RootSample`].

use crate::dataset::RootSample;
use image::imageops;
use rand::Rng;

/// Random horizontal flip
#[derive(Debug, Clone, Copy)]
pub struct HorizontalFlip {
    probability: f64,
}

impl HorizontalFlip {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }

    /// A flip that never fires.
    pub fn disabled() -> Self {
        Self::new(0.0)
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Draws whether the next sample is flipped. Consumes no randomness when
    /// the flip is disabled.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> bool {
        self.probability > 0.0 && rng.gen::<f64>() < self.probability
    }

    /// Mirrors the sample around its vertical axis.
    pub fn apply(&self, sample: RootSample) -> RootSample {
        RootSample {
            name: sample.name,
            image: imageops::flip_horizontal(&sample.image),
            label: imageops::flip_horizontal(&sample.label),
            heatmap: imageops::flip_horizontal(&sample.heatmap),
        }
    }
}
