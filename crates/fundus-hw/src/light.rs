//! Illumination outputs driven through the Linux GPIO character device.
//!
//! Each LED driver is one output line requested with the v1 line-handle
//! ioctl, so the two channels can be switched independently.

use crate::profiles::LightLines;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use thiserror::Error;

/// `GPIO_GET_LINEHANDLE_IOCTL` = `_IOWR(0xB4, 0x03, struct gpiohandle_request)`
/// where sizeof(struct gpiohandle_request) = 364 bytes (verified by assert below).
const GPIO_GET_LINEHANDLE_IOCTL: libc::c_ulong = 0xC16C_B403;

/// `GPIOHANDLE_SET_LINE_VALUES_IOCTL` = `_IOWR(0xB4, 0x09, struct gpiohandle_data)`.
const GPIOHANDLE_SET_LINE_VALUES_IOCTL: libc::c_ulong = 0xC040_B409;

const GPIOHANDLES_MAX: usize = 64;
const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;
const GPIOHANDLE_REQUEST_ACTIVE_LOW: u32 = 1 << 2;

const CONSUMER_LABEL: &[u8] = b"fundus";

/// Mirror of `struct gpiohandle_request` from `<linux/gpio.h>`.
#[repr(C)]
struct GpioHandleRequest {
    line_offsets: [u32; GPIOHANDLES_MAX],
    flags: u32,
    default_values: [u8; GPIOHANDLES_MAX],
    consumer_label: [u8; 32],
    lines: u32,
    fd: libc::c_int,
}

/// Mirror of `struct gpiohandle_data`.
#[repr(C)]
struct GpioHandleData {
    values: [u8; GPIOHANDLES_MAX],
}

const _SIZE_ASSERT: () = assert!(
    std::mem::size_of::<GpioHandleRequest>() == 364,
    "GpioHandleRequest must be 364 bytes to match the kernel ABI"
);

/// The two illumination channels on the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightChannel {
    Infrared,
    Visible,
}

#[derive(Debug, Error)]
pub enum LightError {
    #[error("failed to open GPIO chip {chip}: {source}")]
    Open {
        chip: String,
        source: std::io::Error,
    },
    #[error("failed to request GPIO line {line}: {source}")]
    Request { line: u32, source: std::io::Error },
    #[error("failed to drive {channel:?} light: {source}")]
    Write {
        channel: LightChannel,
        source: std::io::Error,
    },
}

/// Two independent on/off illumination outputs.
pub trait LightDriver: Send {
    fn set(&mut self, channel: LightChannel, on: bool) -> Result<(), LightError>;

    fn set_infrared(&mut self, on: bool) -> Result<(), LightError> {
        self.set(LightChannel::Infrared, on)
    }

    fn set_visible(&mut self, on: bool) -> Result<(), LightError> {
        self.set(LightChannel::Visible, on)
    }
}

/// A requested output line. Dropping it releases the line.
struct GpioLine {
    fd: OwnedFd,
    offset: u32,
}

impl GpioLine {
    fn request(chip: &File, offset: u32, active_high: bool) -> Result<Self, LightError> {
        let mut flags = GPIOHANDLE_REQUEST_OUTPUT;
        if !active_high {
            flags |= GPIOHANDLE_REQUEST_ACTIVE_LOW;
        }
        let mut request = GpioHandleRequest {
            line_offsets: [0; GPIOHANDLES_MAX],
            flags,
            default_values: [0; GPIOHANDLES_MAX],
            consumer_label: [0; 32],
            lines: 1,
            fd: -1,
        };
        request.line_offsets[0] = offset;
        request.consumer_label[..CONSUMER_LABEL.len()].copy_from_slice(CONSUMER_LABEL);

        // SAFETY:
        // - the chip fd is valid for the lifetime of `chip`
        // - `request` is repr(C) and sized to match the kernel ABI
        let ret = unsafe {
            libc::ioctl(
                chip.as_raw_fd(),
                GPIO_GET_LINEHANDLE_IOCTL,
                &mut request as *mut GpioHandleRequest,
            )
        };
        if ret < 0 || request.fd < 0 {
            return Err(LightError::Request {
                line: offset,
                source: std::io::Error::last_os_error(),
            });
        }

        // SAFETY: the kernel just handed us this fd and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(request.fd) };
        Ok(Self { fd, offset })
    }

    fn write(&self, on: bool) -> std::io::Result<()> {
        let mut data = GpioHandleData {
            values: [0; GPIOHANDLES_MAX],
        };
        data.values[0] = u8::from(on);

        // SAFETY: `fd` is a line handle owned by us; `data` matches the ABI.
        let ret = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                GPIOHANDLE_SET_LINE_VALUES_IOCTL,
                &mut data as *mut GpioHandleData,
            )
        };
        if ret < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// IR and visible LED drivers on two GPIO lines.
pub struct GpioLights {
    chip_path: String,
    infrared: GpioLine,
    visible: GpioLine,
}

impl GpioLights {
    /// Request both lines as outputs, initially off.
    pub fn open(lines: &LightLines) -> Result<Self, LightError> {
        let chip = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&lines.chip)
            .map_err(|source| LightError::Open {
                chip: lines.chip.clone(),
                source,
            })?;

        let infrared = GpioLine::request(&chip, lines.infrared_line, lines.active_high)?;
        let visible = GpioLine::request(&chip, lines.visible_line, lines.active_high)?;

        tracing::info!(
            chip = %lines.chip,
            infrared = infrared.offset,
            visible = visible.offset,
            active_high = lines.active_high,
            "illumination lines requested"
        );

        Ok(Self {
            chip_path: lines.chip.clone(),
            infrared,
            visible,
        })
    }

    pub fn chip_path(&self) -> &str {
        &self.chip_path
    }
}

impl LightDriver for GpioLights {
    fn set(&mut self, channel: LightChannel, on: bool) -> Result<(), LightError> {
        let line = match channel {
            LightChannel::Infrared => &self.infrared,
            LightChannel::Visible => &self.visible,
        };
        tracing::trace!(?channel, on, line = line.offset, "set light");
        line.write(on)
            .map_err(|source| LightError::Write { channel, source })
    }
}

impl Drop for GpioLights {
    fn drop(&mut self) {
        // Lines keep their last value after release; leave the rig dark.
        for (channel, line) in [
            (LightChannel::Visible, &self.visible),
            (LightChannel::Infrared, &self.infrared),
        ] {
            if let Err(e) = line.write(false) {
                tracing::warn!(?channel, error = %e, "failed to switch light off on release");
            }
        }
    }
}
