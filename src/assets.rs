//! Binary assets bundled into the executable.
//!
//! The Bouffalo eflash loaders and the W800 stub ship as raw or
//! gzip-compressed images; the Espressif stubs ship as JSON with base64
//! payloads and are decoded by the ESP32 driver.

use std::io::Read;

use flate2::read::GzDecoder;

use crate::{Error, Result};

/// BL602 eflash loader: 176-byte boot header, segment header, loader code.
pub const BL602_EFLASH_LOADER: &[u8] = include_bytes!("../assets/eflash_loader_602.bin");

/// BL602 device-tree blob matching the loader build.
pub const BL602_DTS: &[u8] = include_bytes!("../assets/bl602_dts.bin");

/// BL702 eflash loader, gzip-compressed.
pub const BL702_EFLASH_LOADER_GZ: &[u8] = include_bytes!("../assets/eflash_loader_702.bin.gz");

/// W800 RAM stub, gzip-compressed, with the raw image as fallback.
pub const W800_STUB_GZ: &[u8] = include_bytes!("../assets/w800_stub.bin.gz");
pub const W800_STUB_RAW: &[u8] = include_bytes!("../assets/w800_stub.bin");

pub const ESP32_STUB_JSON: &str = include_str!("../assets/stub_esp32.json");
pub const ESP32S3_STUB_JSON: &str = include_str!("../assets/stub_esp32s3.json");
pub const ESP32C3_STUB_JSON: &str = include_str!("../assets/stub_esp32c3.json");

/// Unpacks a gzip-compressed asset.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();

    decoder
        .read_to_end(&mut out)
        .map_err(|err| Error::InvalidAsset(format!("gzip decode failed: {}", err)))?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_unpack_the_w800_stub() {
        let stub = gunzip(W800_STUB_GZ).unwrap();

        assert_eq!(stub, W800_STUB_RAW);
    }

    #[test]
    fn it_should_reject_garbage_gzip_data() {
        assert!(gunzip(&[0x00, 0x01, 0x02]).is_err());
    }

    #[test]
    fn it_should_carry_a_boot_header_in_the_bl602_loader() {
        assert_eq!(&BL602_EFLASH_LOADER[0..4], b"BFNP");
        assert!(BL602_EFLASH_LOADER.len() > 176 + 16);
    }
}
