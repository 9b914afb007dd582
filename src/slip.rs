//! SLIP framing for the Espressif serial protocol.
//!
//! Packets are delimited by 0xC0; a literal 0xC0 in the payload is sent as
//! `0xDB 0xDC` and a literal 0xDB as `0xDB 0xDD`.

use crate::{Error, Result};

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Encodes `payload` into a full frame, delimiters included.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);

    frame.push(END);

    for &byte in payload {
        match byte {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            other => frame.push(other),
        }
    }

    frame.push(END);
    frame
}

/// Decodes a frame back into its payload.
///
/// Leading and trailing 0xC0 delimiters are tolerated so that
/// `decode(&encode(x))` round-trips.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    let body = trim_delimiters(frame);
    let mut payload = Vec::with_capacity(body.len());
    let mut bytes = body.iter().copied();

    while let Some(byte) = bytes.next() {
        match byte {
            ESC => match bytes.next() {
                Some(ESC_END) => payload.push(END),
                Some(ESC_ESC) => payload.push(ESC),
                other => {
                    return Err(Error::ProtocolFraming {
                        op: "slip",
                        reason: format!("invalid escape sequence 0xDB {:02x?}", other),
                    })
                }
            },
            END => {
                return Err(Error::ProtocolFraming {
                    op: "slip",
                    reason: "unescaped 0xC0 inside frame body".into(),
                })
            }
            other => payload.push(other),
        }
    }

    Ok(payload)
}

fn trim_delimiters(frame: &[u8]) -> &[u8] {
    let start = frame.iter().take_while(|&&b| b == END).count();
    let end = frame.len() - frame.iter().rev().take_while(|&&b| b == END).count();

    if start >= end {
        &[]
    } else {
        &frame[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::assert_eq_hex;

    #[test]
    fn it_should_escape_delimiter_and_escape_bytes() {
        let frame = encode(&[0x01, 0xC0, 0x02, 0xDB, 0x03]);

        assert_eq_hex!(
            &frame[..],
            &[0xC0, 0x01, 0xDB, 0xDC, 0x02, 0xDB, 0xDD, 0x03, 0xC0]
        );
    }

    #[test]
    fn it_should_round_trip_any_byte_sequence() {
        let mut payload = Vec::new();

        for i in 0..=255u8 {
            payload.push(i);
            payload.push(0xC0);
            payload.push(0xDB);
        }

        assert_eq!(decode(&encode(&payload)).unwrap(), payload);
    }

    #[test]
    fn it_should_round_trip_the_empty_payload() {
        assert_eq!(decode(&encode(&[])).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn it_should_reject_dangling_escapes() {
        assert!(decode(&[0xC0, 0x01, 0xDB, 0xC0]).is_err());
    }
}
