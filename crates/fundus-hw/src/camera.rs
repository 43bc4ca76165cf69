//! Camera device trait and the V4L2 backend built on the `v4l` crate.

use crate::controls::{
    AfMode, ControlKey, ControlValue, Controls, Rect, Resolution, LENS_POSITION_MAX,
    LENS_POSITION_MIN,
};
use crate::frame::{self, Frame, FrameError};
use image::{ImageFormat, RgbImage};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

// V4L2 control IDs from <linux/v4l2-controls.h>.
const V4L2_CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const V4L2_CID_FOCUS_ABSOLUTE: u32 = 0x009a_090a;
const V4L2_CID_FOCUS_AUTO: u32 = 0x009a_090c;
const V4L2_CID_AUTO_FOCUS_START: u32 = 0x009a_091c;

// V4L2_CID_EXPOSURE_AUTO menu entries.
const V4L2_EXPOSURE_MANUAL: i64 = 1;
const V4L2_EXPOSURE_APERTURE_PRIORITY: i64 = 3;

const STREAM_BUFFERS: u32 = 4;
/// Buffers dropped right after STREAMON; sensors often hand out dark or
/// half-exposed frames first.
const WARMUP_FRAMES: usize = 3;
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("camera is not streaming")]
    NotStreaming,
    #[error("control {key:?} failed: {reason}")]
    ControlFailed { key: ControlKey, reason: String },
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The sensor/ISP surface the rig drives.
///
/// `start()` leaves the crop window at the full frame, so the first metadata
/// read after it reports the 1.0x geometry.
pub trait CameraDevice: Send {
    /// Negotiate the output resolution. Returns what the driver accepted.
    fn configure(&mut self, resolution: Resolution) -> Result<Resolution, CameraError>;
    fn start(&mut self) -> Result<(), CameraError>;
    fn stop(&mut self) -> Result<(), CameraError>;
    /// Pull the latest frame from the live stream.
    fn capture_frame(&mut self) -> Result<Frame, CameraError>;
    /// Capture one frame with the active configuration and write it as JPEG.
    fn capture_to_file(&mut self, path: &Path) -> Result<(), CameraError>;
    fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError>;
    /// Current values of every readable control.
    fn read_metadata(&mut self) -> Result<Controls, CameraError>;
    fn supported_controls(&self) -> BTreeSet<ControlKey>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpeg,
    /// Packed 24-bit RGB.
    Rgb3,
}

/// V4L2 camera with a software scaler crop.
pub struct V4l2Camera {
    device: Device,
    pub device_path: String,
    resolution: Resolution,
    pixel_format: PixelFormat,
    /// Live mmap stream between `start()` and `stop()`. Dropping it issues
    /// STREAMOFF and unmaps the buffers.
    stream: Option<MmapStream<'static>>,
    crop: Rect,
    supported: BTreeSet<ControlKey>,
    /// Driver range of `V4L2_CID_FOCUS_ABSOLUTE`.
    focus_range: Option<(i64, i64)>,
}

impl V4l2Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        // Digital zoom is done in software, so the crop is always available.
        let mut supported = BTreeSet::from([ControlKey::ScalerCrop]);
        let mut focus_range = None;
        match device.query_controls() {
            Ok(descriptions) => {
                for desc in descriptions {
                    match desc.id {
                        V4L2_CID_EXPOSURE_AUTO => {
                            supported.insert(ControlKey::AeEnable);
                        }
                        V4L2_CID_AUTO_WHITE_BALANCE => {
                            supported.insert(ControlKey::AwbEnable);
                        }
                        V4L2_CID_FOCUS_AUTO => {
                            supported.insert(ControlKey::AfMode);
                        }
                        V4L2_CID_AUTO_FOCUS_START => {
                            supported.insert(ControlKey::AfTrigger);
                        }
                        V4L2_CID_FOCUS_ABSOLUTE if desc.maximum > desc.minimum => {
                            supported.insert(ControlKey::LensPosition);
                            focus_range = Some((desc.minimum, desc.maximum));
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to enumerate camera controls"),
        }

        tracing::info!(?supported, ?focus_range, "camera controls");

        Ok(Self {
            device,
            device_path: device_path.to_string(),
            resolution: Resolution::new(0, 0),
            pixel_format: PixelFormat::Yuyv,
            stream: None,
            crop: Rect::new(0, 0, 0, 0),
            supported,
            focus_range,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }

    /// Dequeue the next buffer from the live stream and decode it to a
    /// full-sensor RGB image.
    fn grab(&mut self) -> Result<(RgbImage, u32), CameraError> {
        let (resolution, pixel_format) = (self.resolution, self.pixel_format);
        let stream = self.stream.as_mut().ok_or(CameraError::NotStreaming)?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let used = (meta.bytesused as usize).min(buf.len());
        let image = decode(&buf[..used], resolution, pixel_format)?;
        Ok((image, meta.sequence))
    }

    /// Grab a frame and apply the current crop window.
    fn grab_cropped(&mut self) -> Result<Frame, CameraError> {
        let (image, sequence) = self.grab()?;
        let image = if self.crop == Rect::full(self.resolution) {
            image
        } else {
            frame::crop_and_resize(&image, self.crop, self.resolution)
        };
        Ok(Frame::from_image(image, sequence))
    }

    fn write(&self, key: ControlKey, id: u32, value: Value) -> Result<(), CameraError> {
        self.device
            .set_control(Control { id, value })
            .map_err(|e| CameraError::ControlFailed {
                key,
                reason: e.to_string(),
            })
    }

    fn read(&self, id: u32) -> Option<Value> {
        self.device.control(id).ok().map(|c| c.value)
    }

    fn lens_to_driver(&self, position: f64) -> Option<i64> {
        let (min, max) = self.focus_range?;
        let t = ((position - LENS_POSITION_MIN) / (LENS_POSITION_MAX - LENS_POSITION_MIN))
            .clamp(0.0, 1.0);
        Some(min + (t * (max - min) as f64).round() as i64)
    }

    fn lens_from_driver(&self, raw: i64) -> Option<f64> {
        let (min, max) = self.focus_range?;
        let t = (raw - min) as f64 / (max - min) as f64;
        Some(LENS_POSITION_MIN + t * (LENS_POSITION_MAX - LENS_POSITION_MIN))
    }
}

impl CameraDevice for V4l2Camera {
    fn configure(&mut self, resolution: Resolution) -> Result<Resolution, CameraError> {
        // S_FMT is refused while buffers are mapped.
        self.stream = None;

        let mut fmt = self.device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = resolution.width;
        fmt.height = resolution.height;

        let negotiated = self.device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        self.pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpeg
        } else if fourcc == FourCC::new(b"RGB3") {
            PixelFormat::Rgb3
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, MJPG, or RGB3)"
            )));
        };

        self.resolution = Resolution::new(negotiated.width, negotiated.height);
        self.crop = Rect::full(self.resolution);

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(self.resolution)
    }

    fn start(&mut self) -> Result<(), CameraError> {
        if self.resolution.width == 0 {
            return Err(CameraError::FormatNegotiationFailed(
                "start() before configure()".into(),
            ));
        }
        self.crop = Rect::full(self.resolution);
        if self.stream.is_some() {
            return Ok(());
        }

        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        // The first dequeue queues every buffer and issues STREAMON.
        for _ in 0..WARMUP_FRAMES {
            let (_, meta) = stream.next().map_err(|e| {
                CameraError::CaptureFailed(format!("stream did not deliver frames: {e}"))
            })?;
            tracing::trace!(seq = meta.sequence, "discarding warmup frame");
        }

        self.stream = Some(stream);
        tracing::debug!(device = %self.device_path, "camera started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        if self.stream.take().is_some() {
            tracing::debug!(device = %self.device_path, "camera stopped");
        }
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        self.grab_cropped()
    }

    fn capture_to_file(&mut self, path: &Path) -> Result<(), CameraError> {
        let frame = self.grab_cropped()?;
        let image = frame.into_image()?;
        frame::save_jpeg(&image, path).map_err(|e| match e {
            FrameError::Codec(image::ImageError::IoError(io)) => CameraError::Io(io),
            other => CameraError::Frame(other),
        })
    }

    fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError> {
        for (&key, value) in controls {
            match (key, value) {
                (ControlKey::ScalerCrop, ControlValue::Rect(rect)) => {
                    let full = Rect::full(self.resolution);
                    if rect.is_empty() || !full.contains(rect) {
                        return Err(CameraError::ControlFailed {
                            key,
                            reason: format!("crop {rect:?} outside sensor {full:?}"),
                        });
                    }
                    self.crop = *rect;
                }
                (ControlKey::AeEnable, ControlValue::Bool(on)) => {
                    let mode = if *on {
                        V4L2_EXPOSURE_APERTURE_PRIORITY
                    } else {
                        V4L2_EXPOSURE_MANUAL
                    };
                    self.write(key, V4L2_CID_EXPOSURE_AUTO, Value::Integer(mode))?;
                }
                (ControlKey::AwbEnable, ControlValue::Bool(on)) => {
                    self.write(key, V4L2_CID_AUTO_WHITE_BALANCE, Value::Boolean(*on))?;
                }
                (ControlKey::AfMode, ControlValue::AfMode(mode)) => {
                    let on = *mode == AfMode::Continuous;
                    self.write(key, V4L2_CID_FOCUS_AUTO, Value::Boolean(on))?;
                }
                (ControlKey::AfTrigger, ControlValue::Trigger) => {
                    if self.supported.contains(&ControlKey::AfTrigger) {
                        self.write(key, V4L2_CID_AUTO_FOCUS_START, Value::Integer(1))?;
                    }
                }
                (ControlKey::LensPosition, ControlValue::Float(position)) => {
                    let raw = self.lens_to_driver(*position).ok_or(CameraError::ControlFailed {
                        key,
                        reason: "no absolute focus control".into(),
                    })?;
                    self.write(key, V4L2_CID_FOCUS_ABSOLUTE, Value::Integer(raw))?;
                }
                (key, value) => {
                    return Err(CameraError::ControlFailed {
                        key,
                        reason: format!("value {value:?} has the wrong type"),
                    });
                }
            }
        }
        Ok(())
    }

    fn read_metadata(&mut self) -> Result<Controls, CameraError> {
        let mut metadata = Controls::new();
        if self.resolution.width > 0 {
            metadata.insert(ControlKey::ScalerCrop, ControlValue::Rect(self.crop));
        }
        if let Some(Value::Integer(mode)) = self.read(V4L2_CID_EXPOSURE_AUTO) {
            metadata.insert(
                ControlKey::AeEnable,
                ControlValue::Bool(mode != V4L2_EXPOSURE_MANUAL),
            );
        }
        if let Some(Value::Boolean(on)) = self.read(V4L2_CID_AUTO_WHITE_BALANCE) {
            metadata.insert(ControlKey::AwbEnable, ControlValue::Bool(on));
        }
        if let Some(Value::Boolean(on)) = self.read(V4L2_CID_FOCUS_AUTO) {
            let mode = if on { AfMode::Continuous } else { AfMode::Manual };
            metadata.insert(ControlKey::AfMode, ControlValue::AfMode(mode));
        }
        if let Some(Value::Integer(raw)) = self.read(V4L2_CID_FOCUS_ABSOLUTE) {
            if let Some(position) = self.lens_from_driver(raw) {
                metadata.insert(ControlKey::LensPosition, ControlValue::Float(position));
            }
        }
        Ok(metadata)
    }

    fn supported_controls(&self) -> BTreeSet<ControlKey> {
        self.supported.clone()
    }
}

fn decode(buf: &[u8], resolution: Resolution, format: PixelFormat) -> Result<RgbImage, CameraError> {
    let Resolution { width, height } = resolution;
    let data = match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)?,
        PixelFormat::Rgb3 => {
            let pixels = (width * height * 3) as usize;
            if buf.len() < pixels {
                return Err(FrameError::InvalidLength {
                    expected: pixels,
                    actual: buf.len(),
                }
                .into());
            }
            buf[..pixels].to_vec()
        }
        PixelFormat::Mjpeg => {
            let decoded = image::load_from_memory_with_format(buf, ImageFormat::Jpeg)
                .map_err(FrameError::from)?;
            return Ok(decoded.to_rgb8());
        }
    };
    Frame {
        data,
        width,
        height,
        timestamp: std::time::Instant::now(),
        sequence: 0,
    }
    .into_image()
    .map_err(CameraError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rgb3_checks_length() {
        let res = Resolution::new(4, 2);
        let image = decode(&[7u8; 4 * 2 * 3], res, PixelFormat::Rgb3).unwrap();
        assert_eq!(image.dimensions(), (4, 2));
        assert_eq!(image.get_pixel(3, 1).0, [7, 7, 7]);

        let err = decode(&[0u8; 10], res, PixelFormat::Rgb3).unwrap_err();
        assert!(matches!(
            err,
            CameraError::Frame(FrameError::InvalidLength { expected: 24, actual: 10 })
        ));
    }

    #[test]
    fn test_decode_yuyv_gray() {
        // Y=128 U=V=128 is mid gray.
        let image = decode(&[128u8; 4 * 2 * 2], Resolution::new(4, 2), PixelFormat::Yuyv).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [128, 128, 128]);
    }
}
