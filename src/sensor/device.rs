//! device.rs
//! Attribute-file access for an IIO device: channel enables, scan indices,
//! calibration and the global buffer switch. No policy lives here beyond path
//! construction and the group-level calibration fallback.

use std::{
    fmt::Display,
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use log::{debug, warn};

use crate::sensor::channel::ChannelInfo;
use crate::utils::error::{RelayError, Result};

pub const DEFAULT_DEVICE_LINK: &str = "/dev/mpu_9250";
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/bus/iio/devices";

/// Scale and offset applied as `(raw + offset) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub scale: f64,
    pub offset: f64,
}

#[derive(Debug, Clone)]
pub struct SysfsDevice {
    attr_dir: PathBuf,
    char_dev: PathBuf,
}

impl SysfsDevice {
    /// Builds an adapter from explicit paths.
    pub fn new(attr_dir: impl Into<PathBuf>, char_dev: impl Into<PathBuf>) -> Self {
        Self {
            attr_dir: attr_dir.into(),
            char_dev: char_dev.into(),
        }
    }

    /// Resolves a udev symlink such as `/dev/mpu_9250` to the real node
    /// (`/dev/iio:deviceN`) and its attribute directory under `sysfs_root`.
    pub fn from_symlink(link: &Path, sysfs_root: &Path) -> Result<Self> {
        if !link.exists() {
            return Err(RelayError::DeviceMissing(link.to_path_buf()));
        }
        let real = fs::canonicalize(link)?;
        let node = real
            .file_name()
            .ok_or_else(|| RelayError::DeviceMissing(link.to_path_buf()))?;
        let attr_dir = sysfs_root.join(node);
        debug!("[Device] {} -> {} ({})", link.display(), real.display(), attr_dir.display());
        Ok(Self::new(attr_dir, real))
    }

    pub fn attr_dir(&self) -> &Path {
        &self.attr_dir
    }

    pub fn char_dev(&self) -> &Path {
        &self.char_dev
    }

    /// Reads an attribute, trimmed. Missing or empty attributes are `None`.
    pub fn read_attr(&self, subpath: &str) -> Option<String> {
        let text = fs::read_to_string(self.attr_dir.join(subpath)).ok()?;
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    pub fn write_attr(&self, subpath: &str, value: impl Display) -> io::Result<()> {
        fs::write(self.attr_dir.join(subpath), value.to_string())
    }

    pub fn set_channel_enabled(&self, channel: &ChannelInfo, enabled: bool) -> io::Result<()> {
        self.write_attr(
            &format!("scan_elements/in_{}_en", channel.device_name),
            u8::from(enabled),
        )
    }

    /// Position of the channel inside a scan packet.
    pub fn channel_index(&self, channel: &ChannelInfo) -> Option<u32> {
        self.read_attr(&format!("scan_elements/in_{}_index", channel.device_name))?
            .parse()
            .ok()
    }

    /// Channel-specific scale/offset, else the axis-group attribute, else 1.0/0.0.
    pub fn calibration(&self, channel: &ChannelInfo) -> Calibration {
        let scale = self.calibration_value(channel, "scale");
        let offset = self.calibration_value(channel, "offset");
        if scale.is_none() && offset.is_none() {
            warn!(
                "[Device] no scale/offset for {} or group {}; publishing raw counts",
                channel.device_name, channel.group
            );
        }
        Calibration {
            scale: scale.unwrap_or(1.0),
            offset: offset.unwrap_or(0.0),
        }
    }

    fn calibration_value(&self, channel: &ChannelInfo, attr: &str) -> Option<f64> {
        [channel.device_name, channel.group]
            .iter()
            .find_map(|stem| self.read_attr(&format!("in_{stem}_{attr}"))?.parse().ok())
    }

    pub fn set_buffer_enabled(&self, enabled: bool) -> io::Result<()> {
        self.write_attr("buffer/enable", u8::from(enabled))
    }

    /// Opens the raw scan stream. Non-blocking so the reader can poll with a bound.
    pub fn open_stream(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.char_dev)
    }
}
