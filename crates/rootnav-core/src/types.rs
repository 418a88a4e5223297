//! Core type definitions for RootNav segmentation.

use serde::{Deserialize, Serialize};

/// Number of segmentation classes produced by a RootNav model.
pub const NUM_CLASSES: usize = 6;

/// Per-class cross-entropy weights, indexed by [`RootClass`].
///
/// Background pixels outnumber root tips and seeds by several orders of
/// magnitude, so the rare keypoint classes carry most of the weight.
pub const CLASS_WEIGHTS: [f32; NUM_CLASSES] = [0.0021, 0.1861, 2.3898, 0.6323, 28.6333, 31.0194];

/// Output channels that double as keypoint heatmap predictions, in the
/// channel order of the heatmap target (primary tip, lateral tip, seed).
pub const HEATMAP_CHANNELS: [usize; 3] = [
    RootClass::PrimaryTip as usize,
    RootClass::LateralTip as usize,
    RootClass::Seed as usize,
];

/// Segmentation class of a single pixel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RootClass {
    Background = 0,
    PrimaryRoot = 1,
    PrimaryTip = 2,
    LateralRoot = 3,
    LateralTip = 4,
    Seed = 5,
}

impl RootClass {
    /// All classes in index order.
    pub const ALL: [RootClass; NUM_CLASSES] = [
        RootClass::Background,
        RootClass::PrimaryRoot,
        RootClass::PrimaryTip,
        RootClass::LateralRoot,
        RootClass::LateralTip,
        RootClass::Seed,
    ];

    /// Looks up a class by its index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Class index as used in label images and output channels.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            RootClass::Background => "background",
            RootClass::PrimaryRoot => "primary_root",
            RootClass::PrimaryTip => "primary_tip",
            RootClass::LateralRoot => "lateral_root",
            RootClass::LateralTip => "lateral_tip",
            RootClass::Seed => "seed",
        }
    }

    /// Display colour used when decoding segmentation maps.
    pub fn color(self) -> [u8; 3] {
        match self {
            RootClass::Background => [0, 0, 0],
            RootClass::PrimaryRoot => [255, 0, 0],
            RootClass::PrimaryTip => [255, 255, 0],
            RootClass::LateralRoot => [0, 128, 255],
            RootClass::LateralTip => [0, 255, 255],
            RootClass::Seed => [255, 0, 255],
        }
    }
}

impl std::fmt::Display for RootClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Dataset split on disk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Valid,
}

impl Split {
    /// Directory name of the split under the dataset root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}
