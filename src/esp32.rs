//! Driver for the Espressif ESP32 / ESP32-S3 / ESP32-C3 ROM bootloader
//! and its RAM stub.
//!
//! Commands are SLIP-framed; the chip is reset into download mode with a
//! DTR/RTS dance. The ROM can identify the chip and read flash (slowly);
//! everything fast runs through a stub staged into RAM with the MEM
//! commands. Writes always need the stub and are verified with MD5; the
//! fast read path streams raw SLIP packets acknowledged by a running byte
//! total and closed by an MD5 digest.

pub mod proto;
pub mod stub;

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use md5::{Digest, Md5};

use crate::chip::ChipFamily;
use crate::flasher::{CancelToken, EventSink, FlashOptions, Flasher, FlasherState, LogLevel, Session};
use crate::slip;
use crate::transport::Transport;
use crate::{Error, Result};

use proto::{Op, Response, SpiRegs};

/// RAM upload block size for the MEM commands.
const MEM_CHUNK: usize = 0x1800;
/// Flash write block size.
const WRITE_BLOCK: usize = 0x400;
/// Fast-read packet size and in-flight window.
const READ_PACKET: u32 = 0x1000;
const READ_WINDOW: u32 = 64;
/// Slow-read chunk served by the ROM.
const SLOW_CHUNK: usize = 64;

const SYNC_TIMEOUT: Duration = Duration::from_millis(300);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(3000);
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);
const STUB_GREETING_TIMEOUT: Duration = Duration::from_secs(5);
const READ_PACKET_TIMEOUT: Duration = Duration::from_millis(2000);

const SYNC_OUTER_ATTEMPTS: u32 = 4;
const SYNC_INNER_ATTEMPTS: u32 = 10;
const BLOCK_ATTEMPTS: u32 = 3;
const READ_RETRIES: u32 = 5;

/// The stub announces itself with this marker once it is running.
const STUB_GREETING: &[u8] = b"OHAI";

pub struct Esp32Flasher<T: Transport> {
    family: ChipFamily,
    session: Session<T>,
    target_baud: u32,
    stub_running: bool,
    flash_size: u32,
    read_result: Option<Vec<u8>>,
    warned_control_lines: bool,
}

impl<T: Transport> Esp32Flasher<T> {
    pub fn new(
        family: ChipFamily,
        transport: T,
        target_baud: u32,
        options: FlashOptions,
        events: EventSink,
        cancel: CancelToken,
    ) -> Esp32Flasher<T> {
        Esp32Flasher {
            family,
            session: Session::new(transport, options, events, cancel),
            target_baud,
            stub_running: false,
            flash_size: 0x40_0000,
            read_result: None,
            warned_control_lines: false,
        }
    }

    fn spi_regs(&self) -> SpiRegs {
        match self.family {
            ChipFamily::Esp32 => SpiRegs::esp32(),
            _ => SpiRegs::esp32_s3_c3(),
        }
    }

    /// Holds the chip in reset with the strap pin low, then releases it
    /// into the ROM downloader.
    fn reset_to_bootloader(&mut self) -> Result<()> {
        let mut honoured = self.session.set_dtr(false);
        honoured &= self.session.set_rts(true);
        thread::sleep(Duration::from_millis(100));
        honoured &= self.session.set_dtr(true);
        honoured &= self.session.set_rts(false);
        thread::sleep(Duration::from_millis(500));

        if !honoured && !self.warned_control_lines {
            self.warned_control_lines = true;
            self.session.log(
                LogLevel::Warning,
                "DTR/RTS not honoured by this adapter; hold BOOT and reset manually",
            );
        }

        self.session.drain()
    }

    /// Reads one SLIP frame and returns its decoded payload.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut body = Vec::new();
        let mut in_frame = false;

        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if remaining > Duration::from_millis(0) => remaining,
                _ => return Ok(None),
            };

            let byte = match self.session.read_byte(remaining)? {
                Some(byte) => byte,
                None => return Ok(None),
            };

            if byte == slip::END {
                if in_frame && !body.is_empty() {
                    return Ok(Some(slip::decode(&body)?));
                }

                // Leading or doubled delimiter
                in_frame = true;
                continue;
            }

            if in_frame {
                body.push(byte);
            }
        }
    }

    /// Sends `op` and waits for its response, skipping unrelated frames.
    fn command(
        &mut self,
        op: Op,
        name: &'static str,
        data: &[u8],
        checksum: u32,
        timeout: Duration,
    ) -> Result<Response> {
        self.try_command(op, name, data, checksum, timeout)?
            .ok_or(Error::Timeout(timeout))
    }

    fn try_command(
        &mut self,
        op: Op,
        name: &'static str,
        data: &[u8],
        checksum: u32,
        timeout: Duration,
    ) -> Result<Option<Response>> {
        let frame = slip::encode(&proto::command_frame(op, data, checksum));
        self.session.write(&frame)?;

        for _ in 0..100 {
            let payload = match self.read_frame(timeout)? {
                Some(payload) => payload,
                None => return Ok(None),
            };

            if let Some(response) = Response::parse(&payload) {
                if response.op == u8::from(op) {
                    response.check(name)?;
                    return Ok(Some(response));
                }

                debug!("skipping response for op {:#04x} while waiting for {}", response.op, name);
            }
        }

        Ok(None)
    }

    /// Resets and syncs: the sync packet may be answered by a burst of
    /// responses split over several frames, which are all drained.
    fn sync(&mut self) -> Result<()> {
        for _ in 0..SYNC_OUTER_ATTEMPTS {
            self.reset_to_bootloader()?;

            for _ in 0..SYNC_INNER_ATTEMPTS {
                self.session.ensure_active()?;

                // The header shape is the acceptance criterion; the value
                // word of sync responses is unspecified.
                match self.try_command(Op::Sync, "Sync", &proto::sync_data(), 0, SYNC_TIMEOUT) {
                    Ok(Some(_)) => {
                        for _ in 0..7 {
                            if self.read_frame(Duration::from_millis(50))?.is_none() {
                                break;
                            }
                        }

                        self.session.log(LogLevel::Info, "Device entered download mode");
                        return Ok(());
                    }
                    Ok(None) => continue,
                    Err(Error::ProtocolStatus { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
        }

        Err(Error::SyncFailed {
            attempts: SYNC_OUTER_ATTEMPTS * SYNC_INNER_ATTEMPTS,
        })
    }

    fn read_reg(&mut self, addr: u32) -> Result<u32> {
        let mut data = [0u8; 4];
        LittleEndian::write_u32(&mut data, addr);

        let response = self.command(Op::ReadReg, "ReadReg", &data, 0, COMMAND_TIMEOUT)?;

        Ok(response.value)
    }

    fn write_reg(&mut self, addr: u32, value: u32, mask: u32, delay: u32) -> Result<()> {
        let mut data = [0u8; 16];
        LittleEndian::write_u32(&mut data[0..4], addr);
        LittleEndian::write_u32(&mut data[4..8], value);
        LittleEndian::write_u32(&mut data[8..12], mask);
        LittleEndian::write_u32(&mut data[12..16], delay);

        self.command(Op::WriteReg, "WriteReg", &data, 0, COMMAND_TIMEOUT)?;

        Ok(())
    }

    /// Attaches the SPI bus; required before any register-driven flash
    /// access. The ROM wants a wider argument block than the stub.
    fn spi_attach(&mut self) -> Result<()> {
        let data = if self.stub_running { vec![0u8; 4] } else { vec![0u8; 8] };

        self.command(Op::SpiAttach, "SpiAttach", &data, 0, COMMAND_TIMEOUT)?;

        Ok(())
    }

    /// Reads the flash JEDEC id by driving the SPI controller directly:
    /// program the bit counts and the command phase, pulse the execute
    /// bit, poll it clear and collect `W0`.
    fn flash_id(&mut self) -> Result<u32> {
        let regs = self.spi_regs();

        let old_usr = self.read_reg(regs.usr)?;
        let old_usr2 = self.read_reg(regs.usr2)?;

        self.write_reg(regs.mosi_dlen, 0, 0xFFFF_FFFF, 0)?;
        self.write_reg(regs.miso_dlen, 24 - 1, 0xFFFF_FFFF, 0)?;
        self.write_reg(regs.usr, proto::SPI_USR_COMMAND | proto::SPI_USR_MISO, 0xFFFF_FFFF, 0)?;
        self.write_reg(regs.usr2, (7 << 28) | 0x9F, 0xFFFF_FFFF, 0)?;
        self.write_reg(regs.cmd, proto::SPI_CMD_USR, 0xFFFF_FFFF, 0)?;

        let mut spins = 0;

        while self.read_reg(regs.cmd)? & proto::SPI_CMD_USR != 0 {
            spins += 1;

            if spins > 100 {
                return Err(Error::ProtocolFraming {
                    op: "FlashId",
                    reason: "SPI command never completed".into(),
                });
            }
        }

        let id = self.read_reg(regs.w0)? & 0x00FF_FFFF;

        self.write_reg(regs.usr, old_usr, 0xFFFF_FFFF, 0)?;
        self.write_reg(regs.usr2, old_usr2, 0xFFFF_FFFF, 0)?;

        Ok(id)
    }

    /// Identifies the connected chip: `GET_SECURITY_INFO` on the newer
    /// ROMs, the magic register on the older ones.
    fn identify(&mut self) -> Result<()> {
        let detected = match self.try_command(Op::GetSecurityInfo, "GetSecurityInfo", &[], 0, SYNC_TIMEOUT)
        {
            Ok(Some(response)) if response.data.len() >= 16 => {
                let chip_id = LittleEndian::read_u32(&response.data[12..16]);

                match chip_id {
                    5 => Some(ChipFamily::Esp32C3),
                    9 => Some(ChipFamily::Esp32S3),
                    other => {
                        debug!("unrecognised security-info chip id {}", other);
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(Error::ProtocolStatus { .. }) => None,
            Err(err) => return Err(err),
        };

        let detected = match detected {
            Some(family) => family,
            None => {
                let magic = self.read_reg(proto::CHIP_MAGIC_REG)?;

                match magic {
                    proto::MAGIC_ESP32 => ChipFamily::Esp32,
                    proto::MAGIC_ESP32S3 => ChipFamily::Esp32S3,
                    proto::MAGIC_ESP32C3_V0 | proto::MAGIC_ESP32C3_V1 => ChipFamily::Esp32C3,
                    proto::MAGIC_ESP32S2 => {
                        return Err(Error::Unsupported("ESP32-S2 is not supported"));
                    }
                    proto::MAGIC_ESP8266 => {
                        return Err(Error::Unsupported("ESP8266 is not supported"));
                    }
                    other => {
                        return Err(Error::ProtocolFraming {
                            op: "ChipDetect",
                            reason: format!("unknown chip magic {:#010x}", other),
                        });
                    }
                }
            }
        };

        self.session
            .log(LogLevel::Info, &format!("Detected {}", detected.name()));

        if detected != self.family {
            self.session.log(
                LogLevel::Warning,
                &format!("Connected chip is a {}, not a {}", detected, self.family),
            );
        }

        Ok(())
    }

    /// Stages the stub into RAM and waits for its greeting.
    fn upload_stub(&mut self) -> Result<()> {
        let stub = stub::load(self.family)?;

        self.session.log(LogLevel::Info, "Uploading flasher stub");

        for (addr, bytes) in &stub.segments {
            let blocks = (bytes.len() + MEM_CHUNK - 1) / MEM_CHUNK;

            let mut begin = [0u8; 16];
            LittleEndian::write_u32(&mut begin[0..4], bytes.len() as u32);
            LittleEndian::write_u32(&mut begin[4..8], blocks as u32);
            LittleEndian::write_u32(&mut begin[8..12], MEM_CHUNK as u32);
            LittleEndian::write_u32(&mut begin[12..16], *addr);

            self.command(Op::MemBegin, "MemBegin", &begin, 0, COMMAND_TIMEOUT)?;

            for (seq, block) in bytes.chunks(MEM_CHUNK).enumerate() {
                let mut data = Vec::with_capacity(16 + block.len());
                let mut head = [0u8; 16];
                LittleEndian::write_u32(&mut head[0..4], block.len() as u32);
                LittleEndian::write_u32(&mut head[4..8], seq as u32);
                data.extend_from_slice(&head);
                data.extend_from_slice(block);

                self.command(Op::MemData, "MemData", &data, proto::checksum(block), COMMAND_TIMEOUT)?;
            }
        }

        let mut end = [0u8; 8];
        LittleEndian::write_u32(&mut end[0..4], 0);
        LittleEndian::write_u32(&mut end[4..8], stub.entry);

        self.command(Op::MemEnd, "MemEnd", &end, 0, COMMAND_TIMEOUT)?;

        // The stub greets with "OHAI" once it owns the UART
        let deadline = Instant::now() + STUB_GREETING_TIMEOUT;

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_default();

            match self.read_frame(remaining)? {
                Some(payload) if payload == STUB_GREETING => break,
                Some(_) => continue,
                None => {
                    return Err(Error::ProtocolFraming {
                        op: "MemEnd",
                        reason: "stub never announced itself".into(),
                    })
                }
            }
        }

        self.stub_running = true;
        self.session.log(LogLevel::Info, "Stub is running");

        Ok(())
    }

    /// Raises the link rate; the transport may close/reopen underneath, so
    /// the stream is treated as fresh afterwards.
    fn change_baud(&mut self) -> Result<()> {
        if self.target_baud == self.session.baud {
            return Ok(());
        }

        let mut data = [0u8; 8];
        LittleEndian::write_u32(&mut data[0..4], self.target_baud);
        LittleEndian::write_u32(
            &mut data[4..8],
            if self.stub_running { self.session.baud } else { 0 },
        );

        self.command(Op::ChangeBaudrate, "ChangeBaudrate", &data, 0, COMMAND_TIMEOUT)?;

        let baud = self.target_baud;
        self.session.set_baud(baud)?;
        thread::sleep(Duration::from_millis(50));
        self.session.drain()?;
        self.session
            .log(LogLevel::Info, &format!("Baud rate set to {}", baud));

        Ok(())
    }

    /// Common preamble: sync, identify, flash-id over the SPI registers.
    fn prepare(&mut self, need_stub: bool) -> Result<()> {
        self.session.connect()?;

        self.session.set_state(FlasherState::Syncing);
        self.sync()?;

        self.session.set_state(FlasherState::Identifying);
        self.identify()?;

        self.session.set_state(FlasherState::Configuring);
        self.spi_attach()?;

        let flash_id = self.flash_id()?;
        let capacity = (flash_id >> 16) & 0xFF;

        if (0x12..=0x19).contains(&capacity) {
            self.flash_size = 1 << capacity;
        }

        self.session.log(
            LogLevel::Info,
            &format!("Flash JEDEC id {:#08x}, {} MiB", flash_id, self.flash_size >> 20),
        );

        match self.upload_stub() {
            Ok(()) => {
                self.spi_attach()?;
            }
            Err(err) if !need_stub => {
                self.session.log(
                    LogLevel::Warning,
                    &format!("Stub upload failed ({}), falling back to the ROM loader", err),
                );
            }
            Err(err) => return Err(err),
        }

        self.change_baud()?;

        Ok(())
    }

    fn verify_md5(&mut self, offset: u32, expected: &[u8]) -> Result<()> {
        self.session.set_state(FlasherState::Verifying);

        let mut data = [0u8; 16];
        LittleEndian::write_u32(&mut data[0..4], offset);
        LittleEndian::write_u32(&mut data[4..8], expected.len() as u32);

        let timeout = Duration::from_secs(8 * ((expected.len() >> 20).max(1) as u64));
        let response = self.command(Op::SpiFlashMd5, "SpiFlashMd5", &data, 0, timeout)?;

        // The stub answers with 16 raw bytes, the ROM with 32 hex chars
        let device = if response.data.len() >= 32 {
            decode_hex_digest(&response.data[..32])?
        } else if response.data.len() >= 16 {
            response.data[..16].to_vec()
        } else {
            return Err(Error::ProtocolFraming {
                op: "SpiFlashMd5",
                reason: format!("digest of {} bytes", response.data.len()),
            });
        };

        let host = Md5::digest(expected);

        if device[..] != host[..] {
            return Err(Error::VerificationMismatch {
                kind: "MD5",
                device: hex_string(&device),
                host: hex_string(&host),
            });
        }

        self.session.log(LogLevel::Success, "MD5 verification passed");

        Ok(())
    }

    fn run_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        // Writes run through the stub; there is no ROM fallback
        self.prepare(true)?;

        self.session.set_state(FlasherState::Working);
        self.session.log(
            LogLevel::Info,
            &format!("Writing {} KiB at {:#x}", data.len() / 1024, offset),
        );

        let blocks = (data.len() + WRITE_BLOCK - 1) / WRITE_BLOCK;

        let mut begin = [0u8; 16];
        LittleEndian::write_u32(&mut begin[0..4], data.len() as u32);
        LittleEndian::write_u32(&mut begin[4..8], blocks as u32);
        LittleEndian::write_u32(&mut begin[8..12], WRITE_BLOCK as u32);
        LittleEndian::write_u32(&mut begin[12..16], offset);

        self.command(Op::FlashBegin, "FlashBegin", &begin, 0, ERASE_TIMEOUT)?;

        for (seq, block) in data.chunks(WRITE_BLOCK).enumerate() {
            if self.session.is_cancelled() {
                // FLASH_END must not be sent for an abandoned transfer
                self.session.log(LogLevel::Warning, "Write cancelled by user");
                return Err(Error::Cancelled);
            }

            let mut padded = block.to_vec();
            padded.resize(WRITE_BLOCK, 0xFF);

            let mut frame = Vec::with_capacity(16 + WRITE_BLOCK);
            let mut head = [0u8; 16];
            LittleEndian::write_u32(&mut head[0..4], padded.len() as u32);
            LittleEndian::write_u32(&mut head[4..8], seq as u32);
            frame.extend_from_slice(&head);
            frame.extend_from_slice(&padded);

            let mut sent = false;

            for _ in 0..BLOCK_ATTEMPTS {
                match self.try_command(
                    Op::FlashData,
                    "FlashData",
                    &frame,
                    proto::checksum(&padded),
                    COMMAND_TIMEOUT,
                )? {
                    Some(_) => {
                        sent = true;
                        break;
                    }
                    None => self.session.drain()?,
                }
            }

            if !sent {
                return Err(Error::Timeout(COMMAND_TIMEOUT));
            }

            self.session
                .progress(((seq + 1) * WRITE_BLOCK).min(data.len()) as u64, data.len() as u64);
        }

        self.verify_md5(offset, data)?;

        // Stay in the bootloader
        let mut end = [0u8; 4];
        LittleEndian::write_u32(&mut end, 1);
        self.command(Op::FlashEnd, "FlashEnd", &end, 0, COMMAND_TIMEOUT)?;

        Ok(())
    }

    /// Stub streaming read: raw SLIP data packets, each acknowledged with
    /// the running total, closed by a 16-byte digest.
    fn read_fast(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut params = [0u8; 16];
        LittleEndian::write_u32(&mut params[0..4], offset);
        LittleEndian::write_u32(&mut params[4..8], length);
        LittleEndian::write_u32(&mut params[8..12], READ_PACKET);
        LittleEndian::write_u32(&mut params[12..16], READ_WINDOW);

        self.command(Op::ReadFlash, "ReadFlash", &params, 0, COMMAND_TIMEOUT)?;

        let mut buffer = Vec::with_capacity(length as usize);
        let mut retries = 0;

        while (buffer.len() as u32) < length {
            self.session.ensure_active()?;

            match self.read_frame(READ_PACKET_TIMEOUT)? {
                Some(packet) => {
                    retries = 0;
                    buffer.extend_from_slice(&packet);

                    let mut ack = [0u8; 4];
                    LittleEndian::write_u32(&mut ack, buffer.len() as u32);
                    self.session.write(&slip::encode(&ack))?;

                    self.session.progress(buffer.len() as u64, length as u64);
                }
                None => {
                    retries += 1;

                    if retries > READ_RETRIES {
                        return Err(Error::Timeout(READ_PACKET_TIMEOUT));
                    }
                }
            }
        }

        if buffer.len() as u32 != length {
            return Err(Error::ProtocolFraming {
                op: "ReadFlash",
                reason: format!("stub streamed {} of {} bytes", buffer.len(), length),
            });
        }

        // The trailing digest covers the whole stream
        self.session.set_state(FlasherState::Verifying);

        let digest = self
            .read_frame(READ_PACKET_TIMEOUT)?
            .ok_or(Error::Timeout(READ_PACKET_TIMEOUT))?;

        if digest.len() != 16 {
            return Err(Error::ProtocolFraming {
                op: "ReadFlash",
                reason: format!("trailing digest of {} bytes", digest.len()),
            });
        }

        let host = Md5::digest(&buffer);

        if digest[..] != host[..] {
            return Err(Error::VerificationMismatch {
                kind: "MD5",
                device: hex_string(&digest),
                host: hex_string(&host),
            });
        }

        self.session.log(LogLevel::Success, "MD5 verification passed");

        Ok(buffer)
    }

    /// ROM fallback: 64 bytes per command.
    fn read_slow(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(length as usize);

        while (buffer.len() as u32) < length {
            self.session.ensure_active()?;

            let chunk_offset = offset + buffer.len() as u32;
            let wanted = ((length as usize) - buffer.len()).min(SLOW_CHUNK);

            let mut params = [0u8; 8];
            LittleEndian::write_u32(&mut params[0..4], chunk_offset);
            LittleEndian::write_u32(&mut params[4..8], wanted as u32);

            let response = self.command(Op::ReadFlashSlow, "ReadFlashSlow", &params, 0, COMMAND_TIMEOUT)?;

            if response.data.len() < wanted {
                return Err(Error::ProtocolFraming {
                    op: "ReadFlashSlow",
                    reason: format!("{} bytes for a {} byte chunk", response.data.len(), wanted),
                });
            }

            buffer.extend_from_slice(&response.data[..wanted]);
            self.session.progress(buffer.len() as u64, length as u64);
        }

        self.verify_md5(offset, &buffer)?;

        Ok(buffer)
    }

    fn run_read(&mut self, start_sector: u32, sectors: u32, full_read: bool) -> Result<()> {
        self.prepare(false)?;

        let (offset, length) = if full_read {
            (0, self.flash_size)
        } else {
            (start_sector * 4096, sectors * 4096)
        };

        self.session.set_state(FlasherState::Working);
        self.session.log(
            LogLevel::Info,
            &format!("Reading {} KiB from {:#x}", length / 1024, offset),
        );

        let buffer = if self.stub_running {
            self.read_fast(offset, length)?
        } else {
            self.read_slow(offset, length)?
        };

        self.read_result = Some(buffer);

        Ok(())
    }

    fn run_erase(&mut self, _start_sector: u32, _sectors: u32, _erase_all: bool) -> Result<()> {
        // The ROM protocol has no discrete erase; FLASH_BEGIN erases the
        // target region as part of a write
        Err(Error::Unsupported(
            "standalone erase is not available on ESP32; writes erase their target region",
        ))
    }
}

impl<T: Transport> Flasher for Esp32Flasher<T> {
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

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex_digest(ascii: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(ascii).map_err(|_| Error::ProtocolFraming {
        op: "SpiFlashMd5",
        reason: "digest is not ASCII hex".into(),
    })?;

    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| Error::ProtocolFraming {
                op: "SpiFlashMd5",
                reason: "digest is not ASCII hex".into(),
            })
        })
        .collect()
}
