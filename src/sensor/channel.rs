//! channel.rs
//! The nine scalar channels of the MPU-9250 and the masks built from them.
//!
//! Single-bit flags are the only values ever matched against device metadata.
//! Composite flags (`ACCEL_XYZ`, `ALL`, ...) exist so clients can request a whole
//! axis group by name; they are never iterated as channels of their own.

use bitflags::Flags;

bitflags::bitflags! {
    /// Set of sensor channels; the unit of subscription and of hardware configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChannelMask: u16 {
        const ACCEL_X = 1 << 0;
        const ACCEL_Y = 1 << 1;
        const ACCEL_Z = 1 << 2;
        const GYRO_X = 1 << 3;
        const GYRO_Y = 1 << 4;
        const GYRO_Z = 1 << 5;
        const MAGN_X = 1 << 6;
        const MAGN_Y = 1 << 7;
        const MAGN_Z = 1 << 8;

        const ACCEL_XYZ = Self::ACCEL_X.bits() | Self::ACCEL_Y.bits() | Self::ACCEL_Z.bits();
        const GYRO_XYZ = Self::GYRO_X.bits() | Self::GYRO_Y.bits() | Self::GYRO_Z.bits();
        const MAGN_XYZ = Self::MAGN_X.bits() | Self::MAGN_Y.bits() | Self::MAGN_Z.bits();
        const ALL = Self::ACCEL_XYZ.bits() | Self::GYRO_XYZ.bits() | Self::MAGN_XYZ.bits();
    }
}

/// Static naming for one atomic channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub flag: ChannelMask,
    /// Name clients use in `config_channels`.
    pub name: &'static str,
    /// IIO name: attribute stem on the device and key on the wire.
    pub device_name: &'static str,
    /// Axis group used for the fallback `in_<group>_scale` lookup.
    pub group: &'static str,
}

// Ordered by bit position so a single-bit mask indexes it via trailing_zeros.
static CHANNELS: [ChannelInfo; 9] = [
    ChannelInfo { flag: ChannelMask::ACCEL_X, name: "ACCEL_X", device_name: "accel_x", group: "accel" },
    ChannelInfo { flag: ChannelMask::ACCEL_Y, name: "ACCEL_Y", device_name: "accel_y", group: "accel" },
    ChannelInfo { flag: ChannelMask::ACCEL_Z, name: "ACCEL_Z", device_name: "accel_z", group: "accel" },
    ChannelInfo { flag: ChannelMask::GYRO_X, name: "GYRO_X", device_name: "anglvel_x", group: "anglvel" },
    ChannelInfo { flag: ChannelMask::GYRO_Y, name: "GYRO_Y", device_name: "anglvel_y", group: "anglvel" },
    ChannelInfo { flag: ChannelMask::GYRO_Z, name: "GYRO_Z", device_name: "anglvel_z", group: "anglvel" },
    ChannelInfo { flag: ChannelMask::MAGN_X, name: "MAGN_X", device_name: "magn_x", group: "magn" },
    ChannelInfo { flag: ChannelMask::MAGN_Y, name: "MAGN_Y", device_name: "magn_y", group: "magn" },
    ChannelInfo { flag: ChannelMask::MAGN_Z, name: "MAGN_Z", device_name: "magn_z", group: "magn" },
];

impl ChannelMask {
    pub const NONE: Self = Self::empty();

    /// Every single-bit flag in declaration order. Composites are filtered out
    /// by population count, so adding a new union never adds a channel.
    pub fn atomic() -> impl Iterator<Item = ChannelMask> {
        <Self as Flags>::FLAGS
            .iter()
            .map(|flag| *flag.value())
            .filter(|value| value.bits().count_ones() == 1)
    }

    /// Atomic channels contained in this mask.
    pub fn channels(self) -> impl Iterator<Item = ChannelMask> {
        Self::atomic().filter(move |channel| self.contains(*channel))
    }

    /// Naming for a single-bit mask; `None` for composites and the empty mask.
    pub fn info(self) -> Option<&'static ChannelInfo> {
        if self.bits().count_ones() != 1 {
            return None;
        }
        CHANNELS.get(self.bits().trailing_zeros() as usize)
    }

    /// Resolves a client-supplied name, single or composite, ignoring case.
    pub fn from_command_name(name: &str) -> Option<Self> {
        Self::from_name(&name.trim().to_ascii_uppercase())
    }

    /// Human-readable list of the atomic channels, for log lines.
    pub fn describe(self) -> String {
        if self.is_empty() {
            return "NONE".to_string();
        }
        self.channels()
            .filter_map(|c| c.info())
            .map(|info| info.name)
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_iteration_skips_composites() {
        let atoms: Vec<_> = ChannelMask::atomic().collect();
        assert_eq!(atoms.len(), 9);
        assert!(atoms.iter().all(|a| a.bits().count_ones() == 1));
        assert_eq!(atoms.first(), Some(&ChannelMask::ACCEL_X));
        assert_eq!(atoms.last(), Some(&ChannelMask::MAGN_Z));
    }

    #[test]
    fn info_table_matches_bit_order() {
        for atom in ChannelMask::atomic() {
            let info = atom.info().expect("atomic channel has info");
            assert_eq!(info.flag, atom);
            assert_eq!(ChannelMask::from_name(info.name), Some(atom));
        }
        assert!(ChannelMask::ACCEL_XYZ.info().is_none());
        assert!(ChannelMask::NONE.info().is_none());
    }

    #[test]
    fn gyro_uses_device_name_on_the_wire() {
        assert_eq!(ChannelMask::GYRO_Z.info().map(|i| i.device_name), Some("anglvel_z"));
        assert_eq!(ChannelMask::GYRO_Z.info().map(|i| i.group), Some("anglvel"));
    }

    #[test]
    fn command_names_resolve_case_insensitively() {
        assert_eq!(ChannelMask::from_command_name("accel_x"), Some(ChannelMask::ACCEL_X));
        assert_eq!(ChannelMask::from_command_name("Gyro_XYZ"), Some(ChannelMask::GYRO_XYZ));
        assert_eq!(ChannelMask::from_command_name("ALL"), Some(ChannelMask::ALL));
        assert_eq!(ChannelMask::from_command_name("TEMP"), None);
        assert_eq!(ChannelMask::from_command_name(""), None);
    }

    #[test]
    fn channels_of_composite_expand_to_atoms() {
        let mask = ChannelMask::MAGN_XYZ | ChannelMask::ACCEL_Y;
        let names: Vec<_> = mask.channels().filter_map(|c| c.info()).map(|i| i.name).collect();
        assert_eq!(names, vec!["ACCEL_Y", "MAGN_X", "MAGN_Y", "MAGN_Z"]);
        assert_eq!(mask.describe(), "ACCEL_Y|MAGN_X|MAGN_Y|MAGN_Z");
        assert_eq!(ChannelMask::NONE.describe(), "NONE");
    }
}
