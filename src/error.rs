use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The serial link could not be acquired. Fatal for the operation.
    #[error("Could not open the serial port: {0}")]
    TransportOpen(#[source] serialport::Error),

    /// Writing to an open serial link failed. Fatal for the operation.
    #[error("Could not write to the serial port: {0}")]
    TransportWrite(#[source] io::Error),

    #[error("Could not change the serial baud rate: {0}")]
    TransportBaud(#[source] serialport::Error),

    /// The device never acknowledged bootloader-mode commands.
    #[error("Device did not enter bootloader mode after {attempts} attempts")]
    SyncFailed { attempts: u32 },

    /// A response arrived but did not have the shape we expect.
    #[error("Malformed {op} response: {reason}")]
    ProtocolFraming { op: &'static str, reason: String },

    /// The device answered with a non-zero status code.
    #[error("Device reported status {status:#06x} for {op}")]
    ProtocolStatus { op: &'static str, status: u16 },

    #[error("Timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    /// A CRC, MD5 or SHA-256 comparison failed after a read or write.
    #[error("{kind} mismatch: device reported {device}, host computed {host}")]
    VerificationMismatch {
        kind: &'static str,
        device: String,
        host: String,
    },

    /// The flash chip id is not present in the registry.
    #[error("Unknown flash chip id {0:#08x}")]
    UnknownFlash(u32),

    /// A write or erase would touch the bootloader without the override flag.
    #[error("Refusing to touch {addr:#x}: the bootloader region below {floor:#x} is protected")]
    ProtectedRegion { addr: u32, floor: u32 },

    /// A requested range starts past the end of the flash array.
    #[error("Address {start:#x} is beyond the {size:#x} byte flash")]
    AddressOutOfRange { start: u32, size: u32 },

    /// The eFuse encryption key does not match the expected family key.
    #[error("Device encryption key differs from the expected key for {family}")]
    EncryptionKeyMismatch { family: &'static str },

    /// Cooperative cancellation was observed at a checkpoint.
    #[error("Operation cancelled")]
    Cancelled,

    /// The XMODEM receiver never sent `'C'` or `NAK`.
    #[error("XMODEM receiver did not initiate the transfer")]
    XmodemInitiationFailed,

    #[error("XMODEM transfer aborted: {0}")]
    XmodemAborted(&'static str),

    #[error("{0}")]
    Unsupported(&'static str),

    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    #[error("Invalid partition table: {0}")]
    InvalidPartitionTable(String),

    #[error("Invalid bundled asset: {0}")]
    InvalidAsset(String),

    /// An I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
