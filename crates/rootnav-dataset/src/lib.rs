//! Dataset loading and batching for RootNav training.
//!
//! This crate provides:
//! - Discovery and decoding of image/label/heatmap triples on disk
//! - Seeded horizontal-flip augmentation
//! - Batched streams that produce Burn tensors
//! - Colour decoding of predicted class maps

pub mod augmentation;
pub mod dataset;
pub mod loader;
pub mod segmap;
pub mod stream;

pub use augmentation::HorizontalFlip;
pub use dataset::{RootDataset, RootSample};
pub use loader::{discover_samples, load_sample, SampleEntry};
pub use segmap::decode_segmap;
pub use stream::{collate, BatchSource, DataStream, RootBatch, StreamConfig};
