//! Image preprocessing: raw image bytes to the normalized `1x3x224x224` input
//! tensor the classifier expects

use image::{imageops::FilterType, ImageResult, RgbImage};
use tch::Tensor;

/// Side length of the square model input
pub const INPUT_SIZE: u32 = 224;

/// Per channel (RGB) normalization constants the backbone was trained with
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode an image of any supported format and convert it to RGB
pub fn decode_rgb(bytes: &[u8]) -> ImageResult<RgbImage> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Resize to `INPUT_SIZE` square, scale to [0, 1] and normalize each channel.
/// The result is laid out channel first (all R, then all G, then all B)
pub fn normalize(image: &RgbImage) -> Vec<f32> {
    let resized = image::imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;

    let mut data = vec![0f32; 3 * plane];
    for (i, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.;
            data[c * plane + i] = (value - MEAN[c]) / STD[c];
        }
    }
    data
}

/// Full preprocessing pipeline from encoded image bytes to a batch of one
pub fn input_tensor(bytes: &[u8]) -> ImageResult<Tensor> {
    let image = decode_rgb(bytes)?;
    let size = INPUT_SIZE as i64;
    Ok(Tensor::from_slice(&normalize(&image)).view([1, 3, size, size]))
}
