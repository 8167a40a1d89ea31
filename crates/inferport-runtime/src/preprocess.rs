use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use image::imageops::{self, FilterType};
use inferport_core::{InputGeometry, InputLayout, Shape, Tensor};

/// Turns raw image bytes into a model-ready tensor of the given geometry.
pub trait Preprocessor: Send + Sync + 'static {
    /// Returns the tensor and the time spent producing it.
    fn preprocess(&self, image: &[u8], geometry: InputGeometry) -> Result<(Tensor, Duration)>;
}

/// Decodes JPEG/PNG, centre-crops to a square, resizes bilinearly and
/// scales RGB to `[0, 1]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImagePreprocessor;

impl Preprocessor for ImagePreprocessor {
    fn preprocess(&self, image: &[u8], geometry: InputGeometry) -> Result<(Tensor, Duration)> {
        let started = Instant::now();
        ensure!(
            geometry.width > 0 && geometry.height > 0,
            "input geometry must be non-empty"
        );
        let width = u32::try_from(geometry.width).context("input width out of range")?;
        let height = u32::try_from(geometry.height).context("input height out of range")?;

        let rgb = image::load_from_memory(image)
            .context("failed to decode image")?
            .to_rgb8();
        let side = rgb.width().min(rgb.height());
        let x = (rgb.width() - side) / 2;
        let y = (rgb.height() - side) / 2;
        let square = imageops::crop_imm(&rgb, x, y, side, side).to_image();
        let resized = imageops::resize(&square, width, height, FilterType::Triangle);

        let plane = geometry.width * geometry.height;
        let mut values = vec![0f32; plane * 3];
        for (x, y, px) in resized.enumerate_pixels() {
            let pos = y as usize * geometry.width + x as usize;
            for (c, v) in px.0.iter().enumerate() {
                let idx = match geometry.layout {
                    InputLayout::Nhwc => pos * 3 + c,
                    InputLayout::Nchw => c * plane + pos,
                };
                values[idx] = f32::from(*v) / 255.0;
            }
        }

        let tensor = Tensor::from_f32(Shape::from_slice(&geometry.shape()), &values)?;
        Ok((tensor, started.elapsed()))
    }
}
