use std::fmt;
use std::str::FromStr;

/// Identifies the protocol dialect and firmware-prefix rules of a target.
///
/// The set is closed: every supported chip maps to exactly one of the four
/// wire protocols (BK7231 HCI frames, Bouffalo length-prefixed commands,
/// Espressif SLIP framing, WinnerMicro 0x21 frames).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ChipFamily {
    Bk7231T,
    Bk7231U,
    Bk7231N,
    Bk7231M,
    Bk7238,
    Bk7236,
    Bk7252,
    Bk7252N,
    Bk7258,
    Bl602,
    Bl702,
    Bl616,
    W600,
    W800,
    Esp32,
    Esp32S3,
    Esp32C3,
}

/// Firmware packaging flavour for release-asset matching.
///
/// QIO images carry a bootloader prefix, UA images do not; everything
/// outside the BK7231 family ships unflavoured.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Flavour {
    Qio,
    Ua,
    Plain,
}

/// Writes at BK7231T/U addresses below this offset hit the bootloader.
pub const BK_BOOTLOADER_END: u32 = 0x11000;

impl ChipFamily {
    pub const ALL: [ChipFamily; 17] = [
        ChipFamily::Bk7231T,
        ChipFamily::Bk7231U,
        ChipFamily::Bk7231N,
        ChipFamily::Bk7231M,
        ChipFamily::Bk7238,
        ChipFamily::Bk7236,
        ChipFamily::Bk7252,
        ChipFamily::Bk7252N,
        ChipFamily::Bk7258,
        ChipFamily::Bl602,
        ChipFamily::Bl702,
        ChipFamily::Bl616,
        ChipFamily::W600,
        ChipFamily::W800,
        ChipFamily::Esp32,
        ChipFamily::Esp32S3,
        ChipFamily::Esp32C3,
    ];

    /// The display name, as used in release assets and backup file names.
    pub fn name(self) -> &'static str {
        match self {
            ChipFamily::Bk7231T => "BK7231T",
            ChipFamily::Bk7231U => "BK7231U",
            ChipFamily::Bk7231N => "BK7231N",
            ChipFamily::Bk7231M => "BK7231M",
            ChipFamily::Bk7238 => "BK7238",
            ChipFamily::Bk7236 => "BK7236",
            ChipFamily::Bk7252 => "BK7252",
            ChipFamily::Bk7252N => "BK7252N",
            ChipFamily::Bk7258 => "BK7258",
            ChipFamily::Bl602 => "BL602",
            ChipFamily::Bl702 => "BL702",
            ChipFamily::Bl616 => "BL616",
            ChipFamily::W600 => "W600",
            ChipFamily::W800 => "W800",
            ChipFamily::Esp32 => "ESP32",
            ChipFamily::Esp32S3 => "ESP32S3",
            ChipFamily::Esp32C3 => "ESP32C3",
        }
    }

    /// The firmware packaging flavour used when matching release assets.
    pub fn flavour(self) -> Flavour {
        match self {
            ChipFamily::Bk7231N
            | ChipFamily::Bk7231M
            | ChipFamily::Bk7236
            | ChipFamily::Bk7238
            | ChipFamily::Bk7252N
            | ChipFamily::Bk7258 => Flavour::Qio,
            ChipFamily::Bk7231T | ChipFamily::Bk7231U | ChipFamily::Bk7252 => Flavour::Ua,
            _ => Flavour::Plain,
        }
    }

    /// The firmware-file name prefix used to match release assets.
    pub fn firmware_prefix(self) -> String {
        match self.flavour() {
            Flavour::Qio => format!("Open{}_QIO_", self.name()),
            Flavour::Ua => format!("Open{}_UA_", self.name()),
            Flavour::Plain => format!("Open{}_", self.name()),
        }
    }

    pub fn is_bk(self) -> bool {
        matches!(
            self,
            ChipFamily::Bk7231T
                | ChipFamily::Bk7231U
                | ChipFamily::Bk7231N
                | ChipFamily::Bk7231M
                | ChipFamily::Bk7238
                | ChipFamily::Bk7236
                | ChipFamily::Bk7252
                | ChipFamily::Bk7252N
                | ChipFamily::Bk7258
        )
    }

    pub fn is_bl(self) -> bool {
        matches!(self, ChipFamily::Bl602 | ChipFamily::Bl702 | ChipFamily::Bl616)
    }

    pub fn is_esp(self) -> bool {
        matches!(self, ChipFamily::Esp32 | ChipFamily::Esp32S3 | ChipFamily::Esp32C3)
    }

    pub fn is_wm(self) -> bool {
        matches!(self, ChipFamily::W600 | ChipFamily::W800)
    }

    /// BK7231T/U BootROMs keep their bootloader in the first sectors and
    /// additionally offset flash-read addresses by the flash size.
    pub fn is_bk_tu(self) -> bool {
        matches!(self, ChipFamily::Bk7231T | ChipFamily::Bk7231U)
    }

    /// The first writable offset, for families with a protected bootloader.
    pub fn bootloader_floor(self) -> Option<u32> {
        if self.is_bk_tu() {
            Some(BK_BOOTLOADER_END)
        } else {
            None
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChipFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();

        ChipFamily::ALL
            .iter()
            .copied()
            .find(|family| family.name() == normalized)
            .ok_or_else(|| format!("unknown chip family: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_derive_qio_prefixes() {
        assert_eq!(ChipFamily::Bk7231N.firmware_prefix(), "OpenBK7231N_QIO_");
        assert_eq!(ChipFamily::Bk7258.firmware_prefix(), "OpenBK7258_QIO_");
    }

    #[test]
    fn it_should_derive_ua_prefixes() {
        assert_eq!(ChipFamily::Bk7231T.firmware_prefix(), "OpenBK7231T_UA_");
        assert_eq!(ChipFamily::Bk7252.firmware_prefix(), "OpenBK7252_UA_");
    }

    #[test]
    fn it_should_derive_plain_prefixes() {
        assert_eq!(ChipFamily::Bl602.firmware_prefix(), "OpenBL602_");
        assert_eq!(ChipFamily::Esp32C3.firmware_prefix(), "OpenESP32C3_");
        assert_eq!(ChipFamily::W800.firmware_prefix(), "OpenW800_");
    }

    #[test]
    fn it_should_parse_family_names_loosely() {
        assert_eq!("bk7231n".parse::<ChipFamily>().unwrap(), ChipFamily::Bk7231N);
        assert_eq!("ESP32-C3".parse::<ChipFamily>().unwrap(), ChipFamily::Esp32C3);
        assert_eq!("w800".parse::<ChipFamily>().unwrap(), ChipFamily::W800);
        assert!("bk9999".parse::<ChipFamily>().is_err());
    }

    #[test]
    fn it_should_only_protect_the_tu_bootloader() {
        assert_eq!(ChipFamily::Bk7231T.bootloader_floor(), Some(0x11000));
        assert_eq!(ChipFamily::Bk7231U.bootloader_floor(), Some(0x11000));
        assert_eq!(ChipFamily::Bk7231N.bootloader_floor(), None);
        assert_eq!(ChipFamily::Esp32.bootloader_floor(), None);
    }
}
