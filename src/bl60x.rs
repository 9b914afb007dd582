//! Driver for the Bouffalo BL602 / BL702 / BL616 BootROM.
//!
//! The ROM autobauds on a burst of `'U'` bytes after an RTS/DTR pulse and
//! then speaks length-prefixed commands. BL602 and BL702 cannot touch the
//! flash from ROM: an eflash loader is staged into RAM first (boot header,
//! segment header, chunked data, check, run) and the same command dialect
//! continues against the loader. BL616 serves flash commands straight from
//! ROM after a single configuration frame. Reads and writes are verified
//! with an on-device SHA-256.

pub mod bootheader;
pub mod partition;
pub mod proto;

use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::assets;
use crate::chip::ChipFamily;
use crate::flasher::{CancelToken, EventSink, FlashOptions, Flasher, FlasherState, LogLevel, Session};
use crate::transport::Transport;
use crate::{Error, Result};

use bootheader::{ClockParams, FlashParams, IMAGE_START};
use partition::PartitionTable;
use proto::{Op, RomError};

/// Reads move in flash sectors; writes in loader-sized chunks.
const READ_CHUNK: usize = 4096;

/// Flash offset of the partition table.
const PARTITION_TABLE_OFFSET: u32 = 0xE000;

const SYNC_ATTEMPTS: u32 = 1000;
const SYNC_TIMEOUT: Duration = Duration::from_millis(75);
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
const DATA_TIMEOUT: Duration = Duration::from_millis(2000);
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);

const PENDING_POLLS: u32 = 500;
const PENDING_INTERVAL: Duration = Duration::from_millis(20);

const CHUNK_ATTEMPTS: u32 = 3;

pub struct Bl60xFlasher<T: Transport> {
    family: ChipFamily,
    session: Session<T>,
    memory_bytes: u32,
    read_result: Option<Vec<u8>>,
    warned_control_lines: bool,
}

impl<T: Transport> Bl60xFlasher<T> {
    pub fn new(
        family: ChipFamily,
        transport: T,
        _target_baud: u32,
        options: FlashOptions,
        events: EventSink,
        cancel: CancelToken,
    ) -> Bl60xFlasher<T> {
        Bl60xFlasher {
            family,
            session: Session::new(transport, options, events, cancel),
            memory_bytes: 0x20_0000,
            read_result: None,
            warned_control_lines: false,
        }
    }

    fn prepare(&mut self) -> Result<()> {
        self.session.connect()?;

        self.session.set_state(FlasherState::Syncing);
        self.sync()?;

        self.session.set_state(FlasherState::Identifying);
        let version = self.get_boot_info()?;
        let detected = detect_variant(version);

        self.session.log(
            LogLevel::Info,
            &format!("BootROM version {:#010x} ({})", version, detected.name()),
        );

        if detected != self.family {
            self.session.log(
                LogLevel::Warning,
                &format!("Connected chip looks like a {}, not a {}", detected, self.family),
            );
        }

        self.session.set_state(FlasherState::Configuring);

        match self.family {
            ChipFamily::Bl602 => self.upload_eflash_loader(assets::BL602_EFLASH_LOADER)?,
            ChipFamily::Bl702 => {
                let loader = assets::gunzip(assets::BL702_EFLASH_LOADER_GZ)?;
                self.upload_eflash_loader(&loader)?;
            }
            _ => self.send_bl616_config()?,
        }

        self.identify_flash()?;

        Ok(())
    }

    /// Pulses the board into bootloader mode: RTS asserts reset while DTR
    /// selects the boot pin.
    fn pulse_bootloader(&mut self) {
        let mut honoured = self.session.set_rts(true);
        honoured &= self.session.set_dtr(true);
        thread::sleep(Duration::from_millis(100));
        honoured &= self.session.set_dtr(false);
        thread::sleep(Duration::from_millis(100));
        honoured &= self.session.set_rts(false);
        thread::sleep(Duration::from_millis(500));

        if !honoured && !self.warned_control_lines {
            self.warned_control_lines = true;
            self.session.log(
                LogLevel::Warning,
                "DTR/RTS not honoured by this adapter; hold BOOT and reset manually",
            );
        }
    }

    fn sync(&mut self) -> Result<()> {
        for attempt in 0..SYNC_ATTEMPTS {
            self.session.ensure_active()?;

            if attempt % 10 == 0 {
                self.pulse_bootloader();
                self.session.drain()?;
            }

            if self.handshake()? {
                self.session.log(LogLevel::Info, "Device entered UART bootloader mode");
                return Ok(());
            }
        }

        Err(Error::SyncFailed {
            attempts: SYNC_ATTEMPTS,
        })
    }

    /// One `'U'` burst; true when the ROM answers "OK".
    fn handshake(&mut self) -> Result<bool> {
        self.session.write(&[proto::HANDSHAKE_BYTE; proto::HANDSHAKE_LEN])?;

        match self.session.try_read_exact(2, SYNC_TIMEOUT)? {
            Some(head) if head == b"OK" => {
                self.session.drain()?;
                Ok(true)
            }
            Some(_) => {
                self.session.drain()?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Sends `op` and reads the two-byte status, polling through "PD"
    /// (pending) responses. Returns the response data, or `None` on
    /// timeout.
    fn command(
        &mut self,
        op: Op,
        name: &'static str,
        payload: &[u8],
        want_data: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        self.session.write(&proto::command(op, payload))?;
        self.read_response(name, want_data, timeout)
    }

    fn read_response(
        &mut self,
        name: &'static str,
        want_data: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        for _ in 0..PENDING_POLLS {
            let head = match self.session.try_read_exact(2, timeout)? {
                Some(head) => head,
                None => return Ok(None),
            };

            match &head[..] {
                b"OK" => {
                    if !want_data {
                        return Ok(Some(Vec::new()));
                    }

                    let len_bytes = self.session.read_exact(2, RESPONSE_TIMEOUT)?;
                    let len = LittleEndian::read_u16(&len_bytes) as usize;
                    let data = self.session.read_exact(len, DATA_TIMEOUT)?;

                    return Ok(Some(data));
                }
                b"FL" => {
                    let code_bytes = self.session.read_exact(2, RESPONSE_TIMEOUT)?;
                    let code = LittleEndian::read_u16(&code_bytes);

                    debug!("{} failed: {}", name, RomError::from(code));

                    return Err(Error::ProtocolStatus { op: name, status: code });
                }
                b"PD" => {
                    thread::sleep(PENDING_INTERVAL);
                    continue;
                }
                other => {
                    return Err(Error::ProtocolFraming {
                        op: name,
                        reason: format!("unexpected status bytes {:02x?}", other),
                    })
                }
            }
        }

        Err(Error::ProtocolFraming {
            op: name,
            reason: "device stayed pending past the poll budget".into(),
        })
    }

    /// Opcode 0x10; returns the 32-bit bootrom version.
    fn get_boot_info(&mut self) -> Result<u32> {
        let data = self
            .command(Op::GetBootInfo, "GetBootInfo", &[], true, RESPONSE_TIMEOUT)?
            .ok_or(Error::Timeout(RESPONSE_TIMEOUT))?;

        if data.len() < 4 {
            return Err(Error::ProtocolFraming {
                op: "GetBootInfo",
                reason: format!("boot info of {} bytes is too short", data.len()),
            });
        }

        Ok(LittleEndian::read_u32(&data[0..4]))
    }

    /// Stages the eflash loader into RAM and restarts the dialogue against
    /// it.
    fn upload_eflash_loader(&mut self, image: &[u8]) -> Result<()> {
        if image.len() < 192 {
            return Err(Error::InvalidAsset("eflash loader image is truncated".into()));
        }

        let header = &image[0..176];
        let segment_header = &image[176..192];
        let size = LittleEndian::read_u32(&image[180..184]) as usize;

        if image.len() < 192 + size {
            return Err(Error::InvalidAsset(
                "eflash loader segment extends past the image".into(),
            ));
        }

        let data = image[192..192 + size].to_vec();

        self.session.log(LogLevel::Info, "Uploading eflash loader");

        self.command(Op::LoadBootHeader, "LoadBootHeader", header, false, RESPONSE_TIMEOUT)?
            .ok_or(Error::Timeout(RESPONSE_TIMEOUT))?;
        self.command(
            Op::LoadSegmentHeader,
            "LoadSegmentHeader",
            segment_header,
            false,
            RESPONSE_TIMEOUT,
        )?
        .ok_or(Error::Timeout(RESPONSE_TIMEOUT))?;

        for chunk in data.chunks(proto::MAX_CHUNK) {
            self.session.ensure_active()?;
            self.command(Op::LoadSegmentData, "LoadSegmentData", chunk, false, RESPONSE_TIMEOUT)?
                .ok_or(Error::Timeout(RESPONSE_TIMEOUT))?;
        }

        self.command(Op::CheckImage, "CheckImage", &[], false, RESPONSE_TIMEOUT)?
            .ok_or(Error::Timeout(RESPONSE_TIMEOUT))?;
        self.command(Op::RunImage, "RunImage", &[], false, RESPONSE_TIMEOUT)?
            .ok_or(Error::Timeout(RESPONSE_TIMEOUT))?;

        // Give the loader a moment to come up, then re-handshake with it
        thread::sleep(Duration::from_millis(300));
        self.session.drain()?;

        for _ in 0..10 {
            if self.handshake()? {
                return Ok(());
            }
        }

        Err(Error::SyncFailed { attempts: 10 })
    }

    /// BL616 serves flash commands from ROM once it has its clock and
    /// flash pinmux configuration.
    fn send_bl616_config(&mut self) -> Result<()> {
        // xtal selection, flash pin auto-detect, no power override
        let config = [0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

        self.command(Op::FlashConfig616, "FlashConfig", &config, false, RESPONSE_TIMEOUT)?
            .ok_or(Error::Timeout(RESPONSE_TIMEOUT))?;

        Ok(())
    }

    fn identify_flash(&mut self) -> Result<()> {
        let data = self
            .command(Op::FlashGetJedecId, "FlashGetJedecId", &[], true, RESPONSE_TIMEOUT)?
            .ok_or(Error::Timeout(RESPONSE_TIMEOUT))?;

        if data.len() < 4 {
            return Err(Error::ProtocolFraming {
                op: "FlashGetJedecId",
                reason: format!("jedec id of {} bytes is too short", data.len()),
            });
        }

        // The fourth byte is log2 of the array size in megabits
        if data[3] >= 0x11 {
            self.memory_bytes = (1u32 << (data[3] - 0x11)) << 17;
        } else {
            warn!("implausible flash size byte {:#04x}, keeping the default", data[3]);
        }

        self.session.log(
            LogLevel::Info,
            &format!(
                "Flash JEDEC id {:02x}{:02x}{:02x}, {} MiB",
                data[0],
                data[1],
                data[2],
                self.memory_bytes >> 20
            ),
        );

        Ok(())
    }

    /// Reads `amount` bytes from `addr` in up-to-4 KiB chunks, re-syncing
    /// mid-stream when a chunk comes back short.
    fn read_region(&mut self, addr: u32, amount: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(amount);

        while out.len() < amount {
            self.session.ensure_active()?;

            let offset = addr + out.len() as u32;
            let wanted = (amount - out.len()).min(READ_CHUNK);

            let mut payload = [0u8; 8];
            LittleEndian::write_u32(&mut payload[0..4], offset);
            LittleEndian::write_u32(&mut payload[4..8], wanted as u32);

            let mut done = false;

            for _ in 0..CHUNK_ATTEMPTS {
                match self.command(Op::FlashRead, "FlashRead", &payload, true, DATA_TIMEOUT)? {
                    Some(chunk) if chunk.len() == wanted => {
                        out.extend_from_slice(&chunk);
                        done = true;
                        break;
                    }
                    Some(chunk) => {
                        debug!("short read of {} bytes at {:#x}, re-syncing", chunk.len(), offset);
                        self.resync_midstream()?;
                    }
                    None => self.resync_midstream()?,
                }
            }

            if !done {
                return Err(Error::ProtocolFraming {
                    op: "FlashRead",
                    reason: format!("chunk at {:#x} failed after {} attempts", offset, CHUNK_ATTEMPTS),
                });
            }

            self.session.progress(out.len() as u64, amount as u64);
        }

        Ok(out)
    }

    fn resync_midstream(&mut self) -> Result<()> {
        self.session.drain()?;

        for _ in 0..10 {
            if self.handshake()? {
                return Ok(());
            }
        }

        Err(Error::SyncFailed { attempts: 10 })
    }

    fn erase_region(&mut self, addr: u32, len: u32) -> Result<()> {
        let mut payload = [0u8; 8];
        LittleEndian::write_u32(&mut payload[0..4], addr);
        LittleEndian::write_u32(&mut payload[4..8], addr + len - 1);

        self.command(Op::FlashErase, "FlashErase", &payload, false, ERASE_TIMEOUT)?
            .ok_or(Error::Timeout(ERASE_TIMEOUT))?;

        Ok(())
    }

    fn write_region(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let total = data.len() as u64;
        let mut written = 0u64;

        for chunk in data.chunks(proto::MAX_CHUNK) {
            self.session.ensure_active()?;

            let mut payload = Vec::with_capacity(4 + chunk.len());
            let mut offset = [0u8; 4];
            LittleEndian::write_u32(&mut offset, addr + written as u32);
            payload.extend_from_slice(&offset);
            payload.extend_from_slice(chunk);

            self.command(Op::FlashWrite, "FlashWrite", &payload, false, DATA_TIMEOUT)?
                .ok_or(Error::Timeout(DATA_TIMEOUT))?;

            written += chunk.len() as u64;
            self.session.progress(written, total);
        }

        Ok(())
    }

    /// Compares the device SHA-256 over `[addr, addr+len)` against
    /// `expected`.
    fn verify_region(&mut self, addr: u32, expected: &[u8]) -> Result<()> {
        let mut payload = [0u8; 8];
        LittleEndian::write_u32(&mut payload[0..4], addr);
        LittleEndian::write_u32(&mut payload[4..8], expected.len() as u32);

        let device = self
            .command(Op::FlashReadSha, "FlashReadSha", &payload, true, DATA_TIMEOUT)?
            .ok_or(Error::Timeout(DATA_TIMEOUT))?;

        let host = Sha256::digest(expected);

        if device[..] != host[..] {
            return Err(Error::VerificationMismatch {
                kind: "SHA-256",
                device: hex_string(&device),
                host: hex_string(&host),
            });
        }

        self.session.log(LogLevel::Success, "SHA-256 verification passed");

        Ok(())
    }

    fn run_read(&mut self, start_sector: u32, sectors: u32, full_read: bool) -> Result<()> {
        self.prepare()?;

        let (start, amount) = if full_read {
            (0, self.memory_bytes as usize)
        } else {
            (start_sector * 4096, sectors as usize * 4096)
        };

        self.session.set_state(FlasherState::Working);
        self.session.log(
            LogLevel::Info,
            &format!("Reading {} KiB from {:#x}", amount / 1024, start),
        );

        let buffer = self.read_region(start, amount)?;

        self.session.set_state(FlasherState::Verifying);
        self.verify_region(start, &buffer)?;
        self.read_result = Some(buffer);

        Ok(())
    }

    fn run_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.prepare()?;

        // A raw application dropped at offset 0 needs the boot header the
        // ROM will look for, and a partition table for the firmware it
        // carries.
        let build_header = offset == 0
            && !bootheader::has_boot_header(data)
            && matches!(self.family, ChipFamily::Bl602 | ChipFamily::Bl702);

        let image = if build_header {
            let header = bootheader::build(&FlashParams::default(), &ClockParams::default(), data);

            let mut image = Vec::with_capacity(IMAGE_START as usize + data.len());
            image.extend_from_slice(&header);
            image.resize(IMAGE_START as usize, 0xFF);
            image.extend_from_slice(data);
            image
        } else {
            data.to_vec()
        };

        self.session.set_state(FlasherState::Working);
        self.session.log(
            LogLevel::Info,
            &format!("Erasing and writing {} KiB at {:#x}", image.len() / 1024, offset),
        );

        self.erase_region(offset, image.len() as u32)?;
        self.write_region(offset, &image)?;

        if build_header {
            if offset + image.len() as u32 <= PARTITION_TABLE_OFFSET {
                let table = PartitionTable::standard(self.memory_bytes);
                table.validate(self.memory_bytes)?;

                let table_bytes = table.build()?;

                self.erase_region(PARTITION_TABLE_OFFSET, table_bytes.len() as u32)?;
                self.write_region(PARTITION_TABLE_OFFSET, &table_bytes)?;
            } else {
                self.session.log(
                    LogLevel::Warning,
                    "Image overlaps the partition table region; table not written",
                );
            }
        }

        self.session.set_state(FlasherState::Verifying);
        self.verify_region(offset, &image)
    }

    fn run_erase(&mut self, start_sector: u32, sectors: u32, erase_all: bool) -> Result<()> {
        self.prepare()?;
        self.session.set_state(FlasherState::Working);

        if erase_all {
            self.session.log(LogLevel::Info, "Erasing the whole flash");

            self.command(Op::FlashChipErase, "FlashChipErase", &[], false, ERASE_TIMEOUT)?
                .ok_or(Error::Timeout(ERASE_TIMEOUT))?;

            return Ok(());
        }

        let start = start_sector * 4096;
        let len = sectors * 4096;

        self.session
            .log(LogLevel::Info, &format!("Erasing {:#x}..{:#x}", start, start + len));

        self.erase_region(start, len)
    }
}

impl<T: Transport> Flasher for Bl60xFlasher<T> {
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

    fn do_erase(&mut self, start_sector: u32, sectors: u32, erase_all: bool) -> Result<bool> {
        let result = self.run_erase(start_sector, sectors, erase_all);
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

fn detect_variant(version: u32) -> ChipFamily {
    let hex = format!("{:x}", version);

    if ["702", "704", "706"].iter().any(|p| hex.starts_with(p)) {
        ChipFamily::Bl702
    } else if ["616", "618"].iter().any(|p| hex.starts_with(p)) {
        ChipFamily::Bl616
    } else {
        ChipFamily::Bl602
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
