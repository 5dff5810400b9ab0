// Fake segmentation models and image fixtures shared by unit tests

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use ndarray::Array3;
use std::io::Cursor;
use std::sync::Arc;

use crate::core::errors::SegmentationResult;
use crate::services::segmentation::{LazyModel, MaskValues, SegmentationModel};

/// Binary model whose logit grows with pixel brightness: `(gray / 255) * 8 - 4`.
pub struct BrightnessModel {
    pub values: MaskValues,
}

impl SegmentationModel for BrightnessModel {
    fn predict(&self, image: &DynamicImage, scale_factor: f32) -> SegmentationResult<Array3<f32>> {
        let width = ((image.width() as f32 * scale_factor) as u32).max(1);
        let height = ((image.height() as f32 * scale_factor) as u32).max(1);
        let gray = image
            .resize_exact(width, height, image::imageops::FilterType::Nearest)
            .to_luma8();

        Ok(Array3::from_shape_fn(
            (1, height as usize, width as usize),
            |(_, y, x)| gray.get_pixel(x as u32, y as u32)[0] as f32 / 255.0 * 8.0 - 4.0,
        ))
    }

    fn mask_values(&self) -> &MaskValues {
        &self.values
    }
}

/// Multi-class model splitting the image into `classes` vertical bands.
pub struct BandModel {
    pub classes: usize,
    pub values: MaskValues,
}

impl SegmentationModel for BandModel {
    fn predict(&self, image: &DynamicImage, _scale_factor: f32) -> SegmentationResult<Array3<f32>> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        Ok(Array3::from_shape_fn((self.classes, height, width), |(c, _, x)| {
            if x * self.classes / width == c {
                5.0
            } else {
                -5.0
            }
        }))
    }

    fn mask_values(&self) -> &MaskValues {
        &self.values
    }
}

pub fn brightness_model() -> Arc<LazyModel> {
    Arc::new(LazyModel::preloaded(Arc::new(BrightnessModel {
        values: MaskValues::Binary,
    })))
}

/// Horizontal gradient, dark on the left and bright on the right
pub fn gradient_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, _| {
        Luma([(x * 255 / (width - 1).max(1)) as u8])
    }))
}

pub fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let img = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img.clone(),
    };
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
    bytes
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient_image(width, height), ImageFormat::Png)
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient_image(width, height), ImageFormat::Jpeg)
}
