use crate::error::AppError;
use crate::models::classify_types::RawPrediction;
use crate::models::image_types::{ImageHandle, ImageSource};
use image::{DynamicImage, ImageReader};
use ndarray::Array4;
use ort::session::Session;
use ort::value::Value;
use std::io::Cursor;

const CROP_PCT: f32 = 0.875;

// ImageNet normalization constants
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

pub fn decode_image(image: &ImageHandle) -> Result<DynamicImage, AppError> {
    let decoded = match &image.source {
        ImageSource::Path(path) => ImageReader::open(path)
            .map_err(|e| AppError::InvalidInput(format!("Failed to open image {}: {}", path.display(), e)))?
            .with_guessed_format()
            .map_err(|e| AppError::InvalidInput(format!("Failed to read image {}: {}", path.display(), e)))?
            .decode(),
        ImageSource::Bytes(bytes) => ImageReader::new(Cursor::new(&bytes[..]))
            .with_guessed_format()
            .map_err(|e| AppError::InvalidInput(format!("Failed to read image {}: {}", image.name, e)))?
            .decode(),
    };
    decoded.map_err(|e| AppError::InvalidInput(format!("Failed to decode image {}: {}", image.name, e)))
}

pub fn preprocess_image(img: &DynamicImage, crop_size: u32) -> Result<Array4<f32>, AppError> {
    // Center crop matching a shortest-edge resize to ceil(crop_size / crop_pct),
    // taken in source coordinates so only crop_size^2 pixels are ever resampled
    let resize_size = (crop_size as f32 / CROP_PCT).ceil() as u32;
    let (w, h) = (img.width().max(1), img.height().max(1));
    let src_side = (crop_size as f32 * w.min(h) as f32 / resize_size as f32).round().max(1.0) as u32;
    let (src_w, src_h) = (src_side.min(w), src_side.min(h));
    let cropped = img
        .crop_imm((w - src_w) / 2, (h - src_h) / 2, src_w, src_h)
        .resize_exact(crop_size, crop_size, image::imageops::FilterType::Triangle);
    let rgb = cropped.to_rgb8();

    // HWC bytes -> normalized CHW planes
    let hw = (crop_size * crop_size) as usize;
    let mut data = vec![0f32; 3 * hw];
    for (i, pixel) in rgb.into_raw().chunks_exact(3).enumerate() {
        for c in 0..3 {
            data[c * hw + i] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }

    Array4::from_shape_vec((1, 3, crop_size as usize, crop_size as usize), data)
        .map_err(|e| AppError::Inference(format!("Failed to create tensor: {}", e)))
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp_sum: f32 = logits.iter().map(|&x| (x - max_logit).exp()).sum();
    logits.iter().map(|&x| (x - max_logit).exp() / exp_sum).collect()
}

/// Ranks class probabilities and attaches labels, falling back to `class_<idx>`.
pub fn top_k_predictions(probabilities: &[f32], labels: &[String], top_k: usize) -> Vec<RawPrediction> {
    let mut indexed: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(top_k);

    indexed
        .into_iter()
        .map(|(idx, prob)| {
            let label = labels
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", idx));
            RawPrediction::new(label, prob as f64)
        })
        .collect()
}

pub fn run_inference_with_model(
    model: &mut Session,
    input: Array4<f32>,
    labels: &[String],
    top_k: usize,
) -> Result<Vec<RawPrediction>, AppError> {
    let input_name = model
        .inputs()
        .first()
        .map(|input| input.name().to_string())
        .ok_or_else(|| AppError::Inference("Model declares no inputs".to_string()))?;

    let input_tensor = Value::from_array(input)
        .map_err(|e| AppError::Inference(format!("Failed to create tensor value: {}", e)))?;

    let outputs = model
        .run(ort::inputs![input_name.as_str() => input_tensor])
        .map_err(|e| AppError::Inference(format!("Model run failed: {}", e)))?;

    let output_value = outputs
        .values()
        .next()
        .ok_or_else(|| AppError::Inference("Model produced no outputs".to_string()))?;

    let (_, logits) = output_value
        .try_extract_tensor::<f32>()
        .map_err(|e| AppError::Inference(format!("Failed to extract output tensor: {}", e)))?;

    if logits.is_empty() {
        return Err(AppError::Inference("Model produced an empty output tensor".to_string()));
    }

    Ok(top_k_predictions(&softmax(logits), labels, top_k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb([200, 40, 40]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_preprocess_produces_nchw_tensor() {
        let handle = ImageHandle::from_bytes("red.png", png_bytes(320, 200));
        let img = decode_image(&handle).unwrap();
        let tensor = preprocess_image(&img, 224).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);

        let expected_r = (200.0 / 255.0 - MEAN[0]) / STD[0];
        assert!((tensor[[0, 0, 100, 100]] - expected_r).abs() < 1e-3);
    }

    #[test]
    fn test_preprocess_handles_extreme_aspect_ratio() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 4000, Rgb([200, 40, 40])));
        let tensor = preprocess_image(&img, 224).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);

        let wide = DynamicImage::ImageRgb8(RgbImage::from_pixel(3000, 2, Rgb([200, 40, 40])));
        let tensor = preprocess_image(&wide, 224).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
        let expected_g = (40.0 / 255.0 - MEAN[1]) / STD[1];
        assert!((tensor[[0, 1, 10, 200]] - expected_g).abs() < 1e-3);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let handle = ImageHandle::from_bytes("noise.bin", vec![1u8, 2, 3, 4]);
        let err = decode_image(&handle).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_softmax_and_top_k() {
        let probs = softmax(&[1.0, 3.0, 2.0]);
        let total: f32 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);

        let labels = vec!["cat".to_string(), "dog".to_string()];
        let top = top_k_predictions(&probs, &labels, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].label.as_deref(), Some("dog"));
        assert_eq!(top[1].label.as_deref(), Some("class_2"));
        assert!(top[0].score > top[1].score);
    }
}
