//! Conversion between images and the normalized CHW layout the networks
//! consume and produce.

use super::InferenceError;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::Array3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

/// Both networks take 256x256 RGB input.
pub const MODEL_INPUT: Geometry = Geometry {
    width: 256,
    height: 256,
};

const MEAN: f32 = 0.5;
const STD: f32 = 0.5;

/// RGB, resized to `geometry`, each channel mapped from [0, 255] to [-1, 1].
pub fn to_normalized_chw(image: &DynamicImage, geometry: Geometry) -> Array3<f32> {
    let mut rgb = image.to_rgb8();
    if rgb.dimensions() != (geometry.width, geometry.height) {
        rgb = imageops::resize(&rgb, geometry.width, geometry.height, FilterType::CatmullRom);
    }

    Array3::from_shape_fn(
        (3, geometry.height as usize, geometry.width as usize),
        |(c, y, x)| {
            let value = rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
            (value - MEAN) / STD
        },
    )
}

/// Inverse of [`to_normalized_chw`]; out-of-range values saturate.
pub fn from_normalized_chw(array: &Array3<f32>) -> Result<RgbImage, InferenceError> {
    let (channels, height, width) = array.dim();
    if channels != 3 {
        return Err(InferenceError::Postprocessing(format!(
            "expected 3 output channels, got {channels}"
        )));
    }
    if height == 0 || width == 0 {
        return Err(InferenceError::Postprocessing(
            "model produced an empty image".to_string(),
        ));
    }

    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(array[[0, y, x]]),
            denormalize(array[[1, y, x]]),
            denormalize(array[[2, y, x]]),
        ])
    }))
}

fn denormalize(value: f32) -> u8 {
    let unit = (value * STD + MEAN).clamp(0.0, 1.0);
    (unit * 255.0).round() as u8
}
