//! Conversions between decoded image batches and [`image::RgbImage`], plus
//! contact-sheet composition.

use candle_core::{DType, Device, Tensor};
use image::{imageops, Rgb, RgbImage};

use crate::error::{Error, Result};

/// Convert a decoded batch (`[B, 3, H, W]`, f32 in `[0, 1]`) into one
/// `RgbImage` per sample.
pub fn tensor_to_images(images: &Tensor) -> Result<Vec<RgbImage>> {
    let (_b, c, h, w) = images.dims4()?;
    if c != 3 {
        return Err(Error::ShapeMismatch {
            expected: "3 channels".to_string(),
            actual: format!("{c} channels"),
        });
    }
    let images = (images.clamp(0f32, 1f32)? * 255.)?
        .to_dtype(DType::U8)?
        .to_device(&Device::Cpu)?;
    let mut out = Vec::new();
    for sample in images.chunk(images.dim(0)?, 0)? {
        let flattened = sample.squeeze(0)?.permute((1, 2, 0))?.flatten_all()?;
        #[allow(clippy::cast_possible_truncation)]
        let img = RgbImage::from_raw(w as u32, h as u32, flattened.to_vec1::<u8>()?).ok_or(
            Error::ShapeMismatch {
                expected: format!("{w}x{h}x3 buffer"),
                actual: "undersized buffer".to_string(),
            },
        )?;
        out.push(img);
    }
    Ok(out)
}

/// Convert an `RgbImage` into a `[3, H, W]` f32 tensor in `[0, 1]`.
pub fn image_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = img.dimensions();
    let data = img.as_raw().clone();
    let tensor = Tensor::from_vec(data, (h as usize, w as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?;
    Ok(tensor)
}

/// Compose a contact sheet, `per_row` images per row on a black background
/// with `padding` pixels between and around tiles.
///
/// All images must share the dimensions of the first.
pub fn make_grid(images: &[RgbImage], per_row: usize, padding: u32) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(Error::EmptyPrompts);
    }
    if per_row == 0 {
        return Err(Error::InvalidOption {
            name: "n_rows",
            reason: "must be nonzero".to_string(),
        });
    }
    let (w, h) = images[0].dimensions();
    let cols = per_row.min(images.len()) as u32;
    let rows = images.len().div_ceil(per_row) as u32;
    let mut canvas = RgbImage::from_pixel(
        cols * (w + padding) + padding,
        rows * (h + padding) + padding,
        Rgb([0, 0, 0]),
    );
    for (idx, img) in images.iter().enumerate() {
        let col = (idx % per_row) as u32;
        let row = (idx / per_row) as u32;
        let x = i64::from(col * (w + padding) + padding);
        let y = i64::from(row * (h + padding) + padding);
        imageops::replace(&mut canvas, img, x, y);
    }
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([value, value, value]))
    }

    #[test]
    fn tensor_round_trips_through_image() {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..2 * 3 * 4 * 4).map(|v| v as f32 / 100.).collect();
        let tensor = Tensor::from_vec(data, (2, 3, 4, 4), &device).unwrap();
        let images = tensor_to_images(&tensor).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].dimensions(), (4, 4));

        let back = image_to_tensor(&images[0], &device).unwrap();
        assert_eq!(back.dims(), &[3, 4, 4]);
    }

    #[test]
    fn tensor_values_clamp_to_unit_range() {
        let device = Device::Cpu;
        let tensor = Tensor::from_vec(vec![-1f32, 0., 0.5, 2.], (1, 1, 2, 2), &device).unwrap();
        assert!(tensor_to_images(&tensor).is_err());

        let tensor = Tensor::from_vec(
            vec![-1f32; 12].into_iter().collect::<Vec<_>>(),
            (1, 3, 2, 2),
            &device,
        )
        .unwrap();
        let images = tensor_to_images(&tensor).unwrap();
        assert!(images[0].pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn grid_dimensions_follow_layout() {
        let images = vec![solid(8, 6, 10), solid(8, 6, 20), solid(8, 6, 30)];
        let grid = make_grid(&images, 2, 2).unwrap();
        // two columns, two rows
        assert_eq!(grid.dimensions(), (2 * (8 + 2) + 2, 2 * (6 + 2) + 2));
        // first tile starts after the leading padding
        assert_eq!(grid.get_pixel(2, 2).0, [10, 10, 10]);
        // padding stays black
        assert_eq!(grid.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn grid_with_single_row_shrinks_columns_to_count() {
        let images = vec![solid(4, 4, 1)];
        let grid = make_grid(&images, 3, 2).unwrap();
        assert_eq!(grid.dimensions(), (4 + 2 + 2, 4 + 2 + 2));
    }

    #[test]
    fn grid_rejects_zero_per_row() {
        let images = vec![solid(4, 4, 1)];
        assert!(make_grid(&images, 0, 2).is_err());
    }
}
