//! On-disk dataset discovery and sample decoding.
//!
//! A split directory holds three parallel folders matched by file stem:
//!
//! ```text
//! <root>/<split>/images/<stem>.{png,jpg,jpeg}
//! <root>/<split>/labels/<stem>.png     8-bit class ids
//! <root>/<split>/heatmaps/<stem>.png   RGB: primary tip, lateral tip, seed
//! ```

use crate::dataset::RootSample;
use rootnav_core::{Error, Result, Split};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// File paths of one sample on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEntry {
    /// Shared file stem
    pub name: String,
    pub image: PathBuf,
    pub label: PathBuf,
    pub heatmap: PathBuf,
}

/// Lists every sample of `split` under `root`, sorted by name.
pub fn discover_samples(root: &Path, split: Split) -> Result<Vec<SampleEntry>> {
    let split_dir = root.join(split.dir_name());
    let images_dir = split_dir.join("images");
    let labels_dir = split_dir.join("labels");
    let heatmaps_dir = split_dir.join("heatmaps");

    if !images_dir.is_dir() {
        return Err(Error::Dataset(format!(
            "Image directory does not exist: {}",
            images_dir.display()
        )));
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(&images_dir)? {
        let path = entry?.path();
        if !path.is_file() || !has_image_extension(&path) {
            continue;
        }

        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let label = labels_dir.join(format!("{name}.png"));
        if !label.is_file() {
            return Err(Error::Dataset(format!(
                "Missing label for '{name}': {}",
                label.display()
            )));
        }

        let heatmap = heatmaps_dir.join(format!("{name}.png"));
        if !heatmap.is_file() {
            return Err(Error::Dataset(format!(
                "Missing heatmap for '{name}': {}",
                heatmap.display()
            )));
        }

        entries.push(SampleEntry {
            name: name.to_string(),
            image: path.clone(),
            label,
            heatmap,
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("Discovered {} {} samples in {}", entries.len(), split, split_dir.display());

    Ok(entries)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decodes the three images of an entry and validates them.
pub fn load_sample(entry: &SampleEntry, n_classes: usize) -> Result<RootSample> {
    let image = image::open(&entry.image)?.to_rgb8();
    let label = image::open(&entry.label)?.to_luma8();
    let heatmap = image::open(&entry.heatmap)?.to_rgb8();

    let sample = RootSample {
        name: entry.name.clone(),
        image,
        label,
        heatmap,
    };
    sample.validate(n_classes)?;

    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};
    use tempfile::TempDir;

    fn write_sample(root: &Path, split: Split, name: &str, label_value: u8) {
        let dir = root.join(split.dir_name());
        for sub in ["images", "labels", "heatmaps"] {
            fs::create_dir_all(dir.join(sub)).unwrap();
        }
        RgbImage::new(4, 3)
            .save(dir.join("images").join(format!("{name}.png")))
            .unwrap();
        GrayImage::from_pixel(4, 3, Luma([label_value]))
            .save(dir.join("labels").join(format!("{name}.png")))
            .unwrap();
        RgbImage::new(4, 3)
            .save(dir.join("heatmaps").join(format!("{name}.png")))
            .unwrap();
    }

    #[test]
    fn test_discover_sorted() -> Result<()> {
        let dir = TempDir::new().unwrap();
        write_sample(dir.path(), Split::Train, "plant_b", 1);
        write_sample(dir.path(), Split::Train, "plant_a", 2);
        fs::write(dir.path().join("train/images/notes.txt"), "ignored").unwrap();

        let entries = discover_samples(dir.path(), Split::Train)?;
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["plant_a", "plant_b"]);

        let sample = load_sample(&entries[0], 6)?;
        assert_eq!(sample.dimensions(), (4, 3));
        assert!(sample.label.pixels().all(|p| p[0] == 2));
        Ok(())
    }

    #[test]
    fn test_missing_heatmap() {
        let dir = TempDir::new().unwrap();
        write_sample(dir.path(), Split::Valid, "plant", 0);
        fs::remove_file(dir.path().join("valid/heatmaps/plant.png")).unwrap();

        let result = discover_samples(dir.path(), Split::Valid);
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_missing_split() {
        let dir = TempDir::new().unwrap();
        assert!(discover_samples(dir.path(), Split::Train).is_err());
    }

    #[test]
    fn test_label_out_of_range() -> Result<()> {
        let dir = TempDir::new().unwrap();
        write_sample(dir.path(), Split::Train, "plant", 9);

        let entries = discover_samples(dir.path(), Split::Train)?;
        let result = load_sample(&entries[0], 6);
        assert!(matches!(result, Err(Error::Dataset(_))));
        Ok(())
    }
}
