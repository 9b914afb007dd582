//! Driver for the WinnerMicro W600 / W800 bootloaders.
//!
//! The ROM announces itself by spewing `'C'` bytes, which double as the
//! XMODEM initiation once a transfer starts. Commands are 0x21-framed with
//! a CRC-16; firmware travels as XMODEM-1K, either a ready-made FLS image
//! or a raw binary wrapped in a pseudo-FLS header on the fly. The W800
//! additionally takes a RAM stub (also via XMODEM) that provides flash
//! reads; the W600 can only write.

pub mod proto;

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::assets;
use crate::chip::ChipFamily;
use crate::crc::crc32;
use crate::flasher::{CancelToken, EventSink, FlashOptions, Flasher, FlasherState, LogLevel, Session};
use crate::transport::Transport;
use crate::xmodem::XmodemSender;
use crate::{Error, Result};

use proto::Cmd;

const ESC: u8 = 0x1B;
const SYNC_BYTE: u8 = 0x43; // 'C'

const SYNC_ATTEMPTS: u32 = 1000;
const SYNC_WINDOW: Duration = Duration::from_secs(2);
const SYNC_BYTE_TIMEOUT: Duration = Duration::from_millis(100);

const READ_BLOCK: usize = 4096;
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const READ_ATTEMPTS: u32 = 10;

/// Raw images carry their firmware body at this offset.
const RAW_BODY_OFFSET: usize = 0x2000;

/// Below this size a raw binary cannot be a full-flash backup.
const RAW_IMAGE_MIN: usize = 0x10_0000;

pub struct WmFlasher<T: Transport> {
    family: ChipFamily,
    session: Session<T>,
    target_baud: u32,
    memory_bytes: u32,
    read_result: Option<Vec<u8>>,
}

impl<T: Transport> WmFlasher<T> {
    pub fn new(
        family: ChipFamily,
        transport: T,
        target_baud: u32,
        options: FlashOptions,
        events: EventSink,
        cancel: CancelToken,
    ) -> WmFlasher<T> {
        WmFlasher {
            family,
            session: Session::new(transport, options, events, cancel),
            target_baud,
            // The W600 never reports a size; 1 MiB is what it ships with
            memory_bytes: if family == ChipFamily::W800 { 0x20_0000 } else { 0x10_0000 },
            read_result: None,
        }
    }

    fn prepare(&mut self) -> Result<()> {
        self.session.connect()?;

        self.session.set_state(FlasherState::Syncing);
        self.sync()?;

        self.session.set_state(FlasherState::Identifying);
        self.identify_flash()?;

        self.session.set_state(FlasherState::Configuring);

        if self.family == ChipFamily::W800 {
            self.upload_stub()?;
        }

        self.change_baud()?;

        Ok(())
    }

    /// Declares sync once more than three `'C'` bytes arrive inside one
    /// window. A W600 stuck in secboot needs an escape burst first.
    fn sync(&mut self) -> Result<()> {
        for attempt in 0..SYNC_ATTEMPTS {
            self.session.ensure_active()?;

            let deadline = Instant::now() + SYNC_WINDOW;
            let mut seen = 0u32;

            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                if remaining.as_millis() == 0 {
                    break;
                }

                match self.session.read_byte(remaining.min(SYNC_BYTE_TIMEOUT))? {
                    Some(SYNC_BYTE) => {
                        seen += 1;

                        if seen > 3 {
                            self.session.drain()?;
                            self.session.log(LogLevel::Info, "Bootloader is listening");
                            return Ok(());
                        }
                    }
                    Some(_) | None => {}
                }
            }

            if self.family == ChipFamily::W600 && attempt % 10 == 0 {
                self.interrupt_secboot()?;
            }
        }

        Err(Error::SyncFailed {
            attempts: SYNC_ATTEMPTS,
        })
    }

    /// Breaks a W600 out of secboot: a spaced escape burst, then the
    /// erase-secboot command.
    fn interrupt_secboot(&mut self) -> Result<()> {
        debug!("escaping secboot mode");

        for _ in 0..250 {
            self.session.write(&[ESC])?;
            thread::sleep(Duration::from_millis(1));
        }

        self.session.write(&proto::frame(Cmd::EraseSecboot, &[]))?;
        self.session.drain()?;

        Ok(())
    }

    /// Opcode 0x3C; the answer is an ASCII `FID` line.
    fn identify_flash(&mut self) -> Result<()> {
        self.session.write(&proto::frame(Cmd::GetFlashId, &[]))?;

        let id_bytes = if self.family == ChipFamily::W800 { 2 } else { 1 };

        // Scan the ASCII reply byte-wise so trailing bootloader chatter
        // stays queued for whoever reads next
        let deadline = Instant::now() + READ_TIMEOUT;
        let mut response = Vec::new();

        let id = loop {
            match proto::parse_flash_id(&response, id_bytes) {
                Ok(id) => break id,
                Err(_) => {
                    let remaining = match deadline.checked_duration_since(Instant::now()) {
                        Some(remaining) if remaining.as_millis() > 0 => remaining,
                        _ => {
                            return Err(Error::ProtocolFraming {
                                op: "GetFlashId",
                                reason: format!("no FID line in {:02x?}", response),
                            })
                        }
                    };

                    match self.session.read_byte(remaining.min(SYNC_BYTE_TIMEOUT))? {
                        Some(byte) => response.push(byte),
                        None => {}
                    }
                }
            }
        };

        if self.family == ChipFamily::W800 {
            // The second byte is log2 of the array size in megabits
            let size_byte = id[1];

            if size_byte >= 0x11 {
                self.memory_bytes = (1u32 << (size_byte - 0x11)) << 17;
            }

            self.session.log(
                LogLevel::Info,
                &format!("Flash id {:02x}{:02x}, {} MiB", id[0], id[1], self.memory_bytes >> 20),
            );
        } else {
            self.session
                .log(LogLevel::Info, &format!("Flash id {:02x}", id[0]));
        }

        Ok(())
    }

    /// Stages the W800 RAM stub over XMODEM and waits for it to come up.
    fn upload_stub(&mut self) -> Result<()> {
        let stub = if !assets::W800_STUB_RAW.is_empty() {
            assets::W800_STUB_RAW.to_vec()
        } else {
            assets::gunzip(assets::W800_STUB_GZ)?
        };

        self.session.log(LogLevel::Info, "Uploading flash stub");

        XmodemSender::new()
            .padding(0xFF)
            .send(&mut self.session, &stub)?;

        // The stub reboots the UART service and spews 'C' again
        self.sync()
    }

    /// Opcode 0x31. In-place transports just take the new rate after the
    /// command has drained.
    fn change_baud(&mut self) -> Result<()> {
        if self.target_baud == self.session.baud {
            return Ok(());
        }

        let mut params = [0u8; 4];
        LittleEndian::write_u32(&mut params, self.target_baud);

        self.session.write(&proto::frame(Cmd::SetBaudRate, &params))?;
        thread::sleep(Duration::from_millis(20));

        let baud = self.target_baud;
        self.session.set_baud(baud)?;
        self.session
            .log(LogLevel::Info, &format!("Baud rate set to {}", baud));

        Ok(())
    }

    /// One 0x4A read. The response must carry the payload plus its
    /// trailing CRC-32 in full before anything is sliced.
    fn read_block(&mut self, offset: u32, wanted: usize) -> Result<Vec<u8>> {
        let mut params = [0u8; 8];
        LittleEndian::write_u32(&mut params[0..4], offset);
        LittleEndian::write_u32(&mut params[4..8], wanted as u32);

        for attempt in 0..READ_ATTEMPTS {
            self.session.ensure_active()?;
            self.session.write(&proto::frame(Cmd::ReadFlash, &params))?;

            let response = match self.session.try_read_exact(wanted + 4, READ_TIMEOUT)? {
                Some(response) => response,
                None => {
                    debug!("short or missing read response at {:#x}, attempt {}", offset, attempt + 1);
                    self.session.drain()?;
                    continue;
                }
            };

            let data = &response[..wanted];
            let device_crc = LittleEndian::read_u32(&response[wanted..]);

            if crc32(0xFFFF_FFFF, data) != device_crc {
                debug!("read CRC mismatch at {:#x}, attempt {}", offset, attempt + 1);
                self.session.drain()?;
                continue;
            }

            return Ok(data.to_vec());
        }

        Err(Error::VerificationMismatch {
            kind: "CRC-32",
            device: "unstable read responses".into(),
            host: format!("block at {:#x}", offset),
        })
    }

    fn run_read(&mut self, start_sector: u32, sectors: u32, full_read: bool) -> Result<()> {
        if self.family != ChipFamily::W800 {
            return Err(Error::Unsupported("the W600 bootloader cannot read flash back"));
        }

        self.prepare()?;

        let (start, amount) = if full_read {
            (0u32, self.memory_bytes as usize)
        } else {
            (start_sector * 4096, sectors as usize * 4096)
        };

        // The flash size is only known after identification, so an
        // out-of-range start can only be rejected here
        if start >= self.memory_bytes {
            return Err(Error::AddressOutOfRange {
                start,
                size: self.memory_bytes,
            });
        }

        // Never read past the end of the array; the final block shrinks
        let amount = amount.min(self.memory_bytes.saturating_sub(start) as usize);

        self.session.set_state(FlasherState::Working);
        self.session.log(
            LogLevel::Info,
            &format!("Reading {} KiB from {:#x}", amount / 1024, start),
        );

        let mut buffer = Vec::with_capacity(amount);

        while buffer.len() < amount {
            let offset = start + buffer.len() as u32;
            let wanted = (amount - buffer.len()).min(READ_BLOCK);

            buffer.extend_from_slice(&self.read_block(offset, wanted)?);
            self.session.progress(buffer.len() as u64, amount as u64);
        }

        self.read_result = Some(buffer);

        Ok(())
    }

    fn run_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let image = self.package_image(offset, data)?;

        self.prepare()?;

        self.session.set_state(FlasherState::Working);
        self.session.log(
            LogLevel::Info,
            &format!("Sending {} KiB over XMODEM", image.len() / 1024),
        );

        XmodemSender::new()
            .padding(0xFF)
            .send(&mut self.session, &image)?;

        self.session.log(LogLevel::Success, "Transfer acknowledged by the bootloader");

        Ok(())
    }

    /// Either passes a ready FLS image through, or carves the firmware
    /// body out of a raw full-flash backup and wraps it.
    fn package_image(&mut self, offset: u32, data: &[u8]) -> Result<Vec<u8>> {
        if proto::is_fls_image(data) {
            return Ok(data.to_vec());
        }

        if data.len() < RAW_IMAGE_MIN {
            return Err(Error::InvalidImage(
                "not an FLS image, and too small to be a raw flash backup".into(),
            ));
        }

        if data.len() < RAW_BODY_OFFSET + 4 {
            return Err(Error::InvalidImage("raw image has no firmware body".into()));
        }

        let body = &data[RAW_BODY_OFFSET..];

        if body[0..4] != proto::SECBOOT_MAGIC {
            return Err(Error::InvalidImage(format!(
                "no secboot header at {:#x}: {:02x?}",
                RAW_BODY_OFFSET,
                &body[0..4]
            )));
        }

        let addr = proto::FLASH_BASE + offset + RAW_BODY_OFFSET as u32;
        let mut image = proto::build_pseudo_fls(self.family, addr, body);

        self.session.log(
            LogLevel::Info,
            &format!("Wrapped raw body of {} KiB in a pseudo-FLS header", body.len() / 1024),
        );

        image.extend_from_slice(body);

        Ok(image)
    }

    fn run_erase(&mut self) -> Result<()> {
        Err(Error::Unsupported(
            "the WinnerMicro bootloader has no erase command; write a full image instead",
        ))
    }
}

impl<T: Transport> Flasher for WmFlasher<T> {
    fn do_read(&mut self, start_sector: u32, sectors: u32, full_read: bool) -> Result<()> {
        let result = self.run_read(start_sector, sectors, full_read);
        self.session.finish(&result);
        result
    }

    fn do_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let result = self.run_write(offset, data);
        self.session.finish(&result);
        result
    }

    fn do_erase(&mut self, _start_sector: u32, _sectors: u32, _erase_all: bool) -> Result<bool> {
        let result = self.run_erase();
        self.session.finish(&result);
        result.map(|()| true)
    }

    fn read_result(&self) -> Option<&[u8]> {
        self.read_result.as_deref()
    }

    fn close(&mut self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedTransport;
    use crate::xmodem::{ACK, EOT, STX};

    fn flasher(family: ChipFamily, transport: ScriptedTransport) -> WmFlasher<ScriptedTransport> {
        WmFlasher::new(
            family,
            transport,
            921_600,
            FlashOptions::default(),
            EventSink::new(),
            CancelToken::new(),
        )
    }

    #[test]
    fn it_should_reject_reads_on_the_w600() {
        let mut flasher = flasher(ChipFamily::W600, ScriptedTransport::new());
        let err = flasher.do_read(0, 1, false).unwrap_err();

        assert!(matches!(err, Error::Unsupported(_)));
        // Surfaced before the port was even opened
        assert!(!flasher.session.transport_mut().connected);
    }

    #[test]
    fn it_should_reject_erase_everywhere() {
        for family in [ChipFamily::W600, ChipFamily::W800] {
            let mut flasher = flasher(family, ScriptedTransport::new());

            assert!(matches!(
                flasher.do_erase(0, 1, false).unwrap_err(),
                Error::Unsupported(_)
            ));
        }
    }

    #[test]
    fn it_should_sync_on_four_c_bytes() {
        let mut transport = ScriptedTransport::new();
        transport.queue(&[0x00, SYNC_BYTE, SYNC_BYTE]);
        transport.queue(&[SYNC_BYTE, SYNC_BYTE]);

        let mut flasher = flasher(ChipFamily::W800, transport);

        flasher.session.connect().unwrap();
        flasher.sync().unwrap();
    }

    #[test]
    fn it_should_retry_short_read_responses_before_succeeding() {
        // First response is truncated (no room for the CRC), the retry is
        // whole: the short one must be rejected before slicing.
        let block: Vec<u8> = (0..READ_BLOCK).map(|i| (i % 249) as u8).collect();
        let mut served_short = false;

        let block_for_responder = block.clone();
        let transport = ScriptedTransport::new().respond_with(move |written| {
            if written.first() != Some(&proto::FRAME_HEAD) {
                return vec![];
            }

            if !served_short {
                served_short = true;
                return vec![vec![0xAA; 100]];
            }

            let mut response = block_for_responder.clone();
            response.extend_from_slice(&crc32(0xFFFF_FFFF, &block_for_responder).to_le_bytes());
            vec![response]
        });

        let mut flasher = flasher(ChipFamily::W800, transport);

        flasher.session.connect().unwrap();

        let out = flasher.read_block(0, READ_BLOCK).unwrap();

        assert_eq!(out, block);
    }

    #[test]
    fn it_should_write_a_wrapped_raw_backup_over_xmodem() {
        // A 2 MiB raw backup: the body at 0x2000 starts with the secboot
        // magic and gets carved, wrapped and sent.
        let mut backup = vec![0x11u8; 0x20_0000];
        backup[RAW_BODY_OFFSET..RAW_BODY_OFFSET + 4].copy_from_slice(&proto::SECBOOT_MAGIC);

        let transport = ScriptedTransport::new().respond_with(move |written| {
            // Command frames
            if written.first() == Some(&proto::FRAME_HEAD) {
                let cmd = written[5];

                return match cmd {
                    0x3C => vec![b"FID:1715".to_vec(), vec![SYNC_BYTE]],
                    // Baud change: the bootloader resumes spewing 'C'
                    0x31 => vec![vec![SYNC_BYTE]],
                    _ => vec![],
                };
            }

            // XMODEM packets
            match written.first() {
                Some(&STX) => vec![vec![ACK]],
                Some(&EOT) => vec![vec![ACK], vec![SYNC_BYTE; 4]],
                _ => vec![],
            }
        });

        let mut transport = transport;
        // The bootloader is already spewing 'C' when we attach
        transport.queue(&[SYNC_BYTE; 4]);

        let mut flasher = flasher(ChipFamily::W800, transport);

        flasher.do_write(0, &backup).unwrap();

        let writes = flasher.session.transport_mut().writes.clone();

        // Stub upload plus firmware: ceil(1024/1024) + ceil((48 + 0x1FE000)/1024)
        let packets: Vec<&Vec<u8>> = writes.iter().filter(|w| w.first() == Some(&STX)).collect();
        let body_len = 0x20_0000 - RAW_BODY_OFFSET;
        let expected = 1 + (48 + body_len + 1023) / 1024;

        assert_eq!(packets.len(), expected);

        // Every EOT was acknowledged and the state machine completed
        assert_eq!(flasher.session.state(), FlasherState::Completed);

        // The first firmware packet opens with the pseudo-FLS magic
        let first_fw_packet = packets[1];
        assert_eq!(&first_fw_packet[3..7], &proto::SECBOOT_MAGIC);
    }

    #[test]
    fn it_should_reject_reads_past_the_end_of_flash() {
        let transport = ScriptedTransport::new().respond_with(move |written| {
            if written.first() == Some(&proto::FRAME_HEAD) {
                return match written[5] {
                    0x3C => vec![b"FID:1715".to_vec(), vec![SYNC_BYTE]],
                    0x31 => vec![vec![SYNC_BYTE]],
                    _ => vec![],
                };
            }

            match written.first() {
                Some(&STX) => vec![vec![ACK]],
                Some(&EOT) => vec![vec![ACK], vec![SYNC_BYTE; 4]],
                _ => vec![],
            }
        });

        let mut transport = transport;
        transport.queue(&[SYNC_BYTE; 4]);

        let mut flasher = flasher(ChipFamily::W800, transport);

        // The FID line reports a 2 MiB part; sector 1024 starts at 4 MiB
        let err = flasher.do_read(1024, 1, false).unwrap_err();

        assert!(matches!(
            err,
            Error::AddressOutOfRange {
                start: 0x40_0000,
                size: 0x20_0000,
            }
        ));
        assert_eq!(flasher.session.state(), FlasherState::Failed);
    }

    #[test]
    fn it_should_refuse_raw_images_without_a_secboot_header() {
        let backup = vec![0x00u8; 0x20_0000];
        let mut flasher = flasher(ChipFamily::W800, ScriptedTransport::new());

        let err = flasher.package_image(0, &backup).unwrap_err();

        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[test]
    fn it_should_truncate_the_final_block_to_the_flash_size() {
        // 6 KiB of flash: a full-read plan is one 4 KiB block plus a
        // ragged 2 KiB tail.
        let flash: Vec<u8> = (0..6144).map(|i| (i % 247) as u8).collect();

        let flash_for_responder = flash.clone();
        let transport = ScriptedTransport::new().respond_with(move |written| {
            if written.first() != Some(&proto::FRAME_HEAD) || written[5] != 0x4A {
                return vec![];
            }

            let offset = u32::from_le_bytes([written[9], written[10], written[11], written[12]]) as usize;
            let wanted = u32::from_le_bytes([written[13], written[14], written[15], written[16]]) as usize;

            let data = &flash_for_responder[offset..offset + wanted];
            let mut response = data.to_vec();
            response.extend_from_slice(&crc32(0xFFFF_FFFF, data).to_le_bytes());
            vec![response]
        });

        let mut flasher = flasher(ChipFamily::W800, transport);
        flasher.memory_bytes = 6144;

        flasher.session.connect().unwrap();

        let mut buffer = Vec::new();

        while buffer.len() < 6144 {
            let wanted = (6144 - buffer.len()).min(READ_BLOCK);
            buffer.extend(flasher.read_block(buffer.len() as u32, wanted).unwrap());
        }

        assert_eq!(buffer, flash);
    }
}
