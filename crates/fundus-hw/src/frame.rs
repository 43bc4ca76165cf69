//! Frame type and image processing: YUYV conversion, digital crop, display scaling.

use crate::controls::{Rect, Resolution};
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::str::FromStr;

/// JPEG quality used for photos and preview snapshots.
pub const JPEG_QUALITY: u8 = 92;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB24 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn from_image(image: RgbImage, sequence: u32) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    /// Convert into an `image` buffer for scaling or encoding.
    pub fn into_image(self) -> Result<RgbImage, FrameError> {
        let expected = (self.width * self.height * 3) as usize;
        let actual = self.data.len();
        RgbImage::from_raw(self.width, self.height, self.data)
            .ok_or(FrameError::InvalidLength { expected, actual })
    }
}

/// How a frame is fitted into the preview display box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalePolicy {
    /// Fill the box and crop the overflow. Keeps the photo's center framing.
    #[default]
    Cover,
    /// Fit the whole frame inside the box with black bars.
    Contain,
}

impl FromStr for ScalePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cover" | "fill" => Ok(Self::Cover),
            "contain" | "fit" | "letterbox" => Ok(Self::Contain),
            other => Err(format!("unknown scale policy: {other} (expected cover or contain)")),
        }
    }
}

/// Convert packed YUYV (4:2:2) to RGB24 using BT.601.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v, y);
    let g = 0.714_14f32.mul_add(-v, 0.344_14f32.mul_add(-u, y));
    let b = 1.772f32.mul_add(u, y);

    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Cut `crop` out of a full-sensor image and scale it back to `output`.
///
/// This is the software equivalent of an ISP scaler crop: every zoom level
/// produces frames at the configured output size.
pub fn crop_and_resize(image: &RgbImage, crop: Rect, output: Resolution) -> RgbImage {
    let (w, h) = image.dimensions();
    let x = crop.x.min(w.saturating_sub(1));
    let y = crop.y.min(h.saturating_sub(1));
    let cw = crop.width.min(w - x).max(1);
    let ch = crop.height.min(h - y).max(1);
    let window = imageops::crop_imm(image, x, y, cw, ch).to_image();
    if (cw, ch) == (output.width, output.height) {
        return window;
    }
    imageops::resize(&window, output.width, output.height, FilterType::Triangle)
}

/// Scale an image into a `box_w` x `box_h` display box.
///
/// The result is always exactly the box size.
pub fn scale_into(image: &RgbImage, box_w: u32, box_h: u32, policy: ScalePolicy) -> RgbImage {
    let (img_w, img_h) = image.dimensions();
    if box_w == 0 || box_h == 0 || img_w == 0 || img_h == 0 {
        return image.clone();
    }
    let sx = box_w as f64 / img_w as f64;
    let sy = box_h as f64 / img_h as f64;

    match policy {
        ScalePolicy::Cover => {
            let scale = sx.max(sy);
            let new_w = ((img_w as f64 * scale).ceil() as u32).max(box_w);
            let new_h = ((img_h as f64 * scale).ceil() as u32).max(box_h);
            let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
            let x0 = (new_w - box_w) / 2;
            let y0 = (new_h - box_h) / 2;
            imageops::crop_imm(&resized, x0, y0, box_w, box_h).to_image()
        }
        ScalePolicy::Contain => {
            let scale = sx.min(sy);
            let new_w = ((img_w as f64 * scale).floor() as u32).clamp(1, box_w);
            let new_h = ((img_h as f64 * scale).floor() as u32).clamp(1, box_h);
            let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
            let mut canvas = RgbImage::from_pixel(box_w, box_h, Rgb([0, 0, 0]));
            let x0 = (box_w - new_w) / 2;
            let y0 = (box_h - new_h) / 2;
            imageops::overlay(&mut canvas, &resized, i64::from(x0), i64::from(y0));
            canvas
        }
    }
}

/// Encode an RGB image as JPEG in memory.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, FrameError> {
    let mut out = Cursor::new(Vec::new());
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.encode_image(image)?;
    Ok(out.into_inner())
}

/// Write an RGB image to `path` as JPEG.
pub fn save_jpeg(image: &RgbImage, path: &std::path::Path) -> Result<(), FrameError> {
    image.save_with_format(path, ImageFormat::Jpeg)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
}
