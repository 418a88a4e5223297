//! Colour decoding of predicted segmentation maps.

use image::{Rgb, RgbImage};
use rootnav_core::RootClass;

/// Renders a row-major map of class ids as an RGB image. Ids without a
/// class, and pixels missing from a short `classes` slice, are drawn black.
pub fn decode_segmap(classes: &[i64], width: usize, height: usize) -> RgbImage {
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let index = y as usize * width + x as usize;
        let color = classes
            .get(index)
            .and_then(|&class| usize::try_from(class).ok())
            .and_then(RootClass::from_index)
            .map_or([0, 0, 0], RootClass::color);
        Rgb(color)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_palette() {
        let map = decode_segmap(&[0, 1, 5, 42], 2, 2);
        assert_eq!(map.dimensions(), (2, 2));
        assert_eq!(map.get_pixel(0, 0), &Rgb(RootClass::Background.color()));
        assert_eq!(map.get_pixel(1, 0), &Rgb(RootClass::PrimaryRoot.color()));
        assert_eq!(map.get_pixel(0, 1), &Rgb(RootClass::Seed.color()));
        assert_eq!(map.get_pixel(1, 1), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_decode_short_input() {
        let map = decode_segmap(&[2], 2, 1);
        assert_eq!(map.get_pixel(0, 0), &Rgb(RootClass::PrimaryTip.color()));
        assert_eq!(map.get_pixel(1, 0), &Rgb([0, 0, 0]));
    }
}
