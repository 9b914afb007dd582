//! Flasher stub images for the Espressif targets.
//!
//! Each stub ships as JSON carrying base64 text/data segments and the RAM
//! entry point; the driver stages the segments with the MEM commands and
//! jumps to the entry.

use serde::Deserialize;

use crate::assets;
use crate::chip::ChipFamily;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct StubImage {
    entry: u32,
    text: String,
    text_start: u32,
    data: String,
    data_start: u32,
}

/// A decoded stub: the entry point and its RAM segments.
#[derive(Debug, Clone)]
pub struct Stub {
    pub entry: u32,
    pub segments: Vec<(u32, Vec<u8>)>,
}

/// Loads the bundled stub for `family`.
pub fn load(family: ChipFamily) -> Result<Stub> {
    let json = match family {
        ChipFamily::Esp32 => assets::ESP32_STUB_JSON,
        ChipFamily::Esp32S3 => assets::ESP32S3_STUB_JSON,
        ChipFamily::Esp32C3 => assets::ESP32C3_STUB_JSON,
        other => {
            return Err(Error::InvalidAsset(format!("no stub is bundled for {}", other)));
        }
    };

    let image: StubImage = serde_json::from_str(json)
        .map_err(|err| Error::InvalidAsset(format!("stub JSON decode failed: {}", err)))?;

    let text = base64::decode(&image.text)
        .map_err(|err| Error::InvalidAsset(format!("stub text segment: {}", err)))?;
    let data = base64::decode(&image.data)
        .map_err(|err| Error::InvalidAsset(format!("stub data segment: {}", err)))?;

    Ok(Stub {
        entry: image.entry,
        segments: vec![(image.text_start, text), (image.data_start, data)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_load_every_bundled_stub() {
        for family in [ChipFamily::Esp32, ChipFamily::Esp32S3, ChipFamily::Esp32C3] {
            let stub = load(family).unwrap();

            assert_ne!(stub.entry, 0);
            assert_eq!(stub.segments.len(), 2);
            assert!(stub.segments.iter().all(|(addr, bytes)| *addr != 0 && !bytes.is_empty()));
        }
    }

    #[test]
    fn it_should_refuse_non_espressif_families() {
        assert!(load(ChipFamily::Bk7231N).is_err());
    }
}
