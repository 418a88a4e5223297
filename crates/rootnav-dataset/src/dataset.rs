//! RootNav samples and datasets.

use crate::loader::{self, SampleEntry};
use image::{GrayImage, RgbImage};
use rootnav_core::{Error, Result, Split};
use std::path::Path;
use tracing::info;

/// One training sample: an RGB image, its class-id label map and its
/// three-channel keypoint heatmap
#[derive(Debug, Clone)]
pub struct RootSample {
    /// Identifier, usually the file stem
    pub name: String,
    pub image: RgbImage,
    pub label: GrayImage,
    pub heatmap: RgbImage,
}

impl RootSample {
    /// Width and height of the sample.
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Checks that all three images agree in size and that every label is a
    /// valid class id.
    pub fn validate(&self, n_classes: usize) -> Result<()> {
        let dims = self.image.dimensions();
        if self.label.dimensions() != dims || self.heatmap.dimensions() != dims {
            return Err(Error::Dataset(format!(
                "Sample '{}' has mismatched sizes: image {:?}, label {:?}, heatmap {:?}",
                self.name,
                dims,
                self.label.dimensions(),
                self.heatmap.dimensions()
            )));
        }

        if let Some(bad) = self.label.pixels().find(|p| p[0] as usize >= n_classes) {
            return Err(Error::Dataset(format!(
                "Sample '{}' has label {} outside [0, {n_classes})",
                self.name, bad[0]
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Storage {
    Disk(Vec<SampleEntry>),
    Memory(Vec<RootSample>),
}

/// Indexed collection of samples, either decoded lazily from disk or held
/// in memory
#[derive(Debug, Clone)]
pub struct RootDataset {
    storage: Storage,
    n_classes: usize,
}

impl RootDataset {
    /// Opens a split of an on-disk dataset. Images are decoded on access.
    pub fn open(root: &Path, split: Split, n_classes: usize) -> Result<Self> {
        let entries = loader::discover_samples(root, split)?;
        if entries.is_empty() {
            return Err(Error::Dataset(format!(
                "No samples found for split '{split}' in {}",
                root.display()
            )));
        }

        info!("Loaded {} split with {} samples", split, entries.len());

        Ok(Self {
            storage: Storage::Disk(entries),
            n_classes,
        })
    }

    /// Wraps already decoded samples after validating them.
    pub fn from_samples(samples: Vec<RootSample>, n_classes: usize) -> Result<Self> {
        for sample in &samples {
            sample.validate(n_classes)?;
        }

        Ok(Self {
            storage: Storage::Memory(samples),
            n_classes,
        })
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Disk(entries) => entries.len(),
            Storage::Memory(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of segmentation classes labels may use.
    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Returns the sample at `index`, decoding it if stored on disk.
    pub fn get(&self, index: usize) -> Result<RootSample> {
        match &self.storage {
            Storage::Disk(entries) => {
                let entry = entries.get(index).ok_or_else(|| {
                    Error::Dataset(format!("Index {index} out of range ({} samples)", entries.len()))
                })?;
                loader::load_sample(entry, self.n_classes)
            }
            Storage::Memory(samples) => samples.get(index).cloned().ok_or_else(|| {
                Error::Dataset(format!("Index {index} out of range ({} samples)", samples.len()))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn sample(name: &str, label: u8) -> RootSample {
        RootSample {
            name: name.into(),
            image: RgbImage::from_pixel(3, 2, Rgb([10, 20, 30])),
            label: GrayImage::from_pixel(3, 2, Luma([label])),
            heatmap: RgbImage::new(3, 2),
        }
    }

    #[test]
    fn test_memory_dataset() -> Result<()> {
        let dataset = RootDataset::from_samples(vec![sample("a", 0), sample("b", 5)], 6)?;
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(1)?.name, "b");
        assert!(dataset.get(2).is_err());
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_label() {
        let result = RootDataset::from_samples(vec![sample("a", 6)], 6);
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_rejects_size_mismatch() {
        let mut bad = sample("a", 0);
        bad.heatmap = RgbImage::new(2, 2);
        assert!(bad.validate(6).is_err());
    }
}
