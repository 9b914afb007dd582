//! The common operation surface exposed by every chip driver, plus the
//! session plumbing they share: receive buffering, timeout-budgeted reads,
//! progress/log/state callbacks and cooperative cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::transport::Transport;
use crate::{Error, Result};

/// Severity of a user-facing log entry.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// Linear per-operation state machine shared by all drivers.
///
/// Transitions never roll back; `Failed` is terminal for the operation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlasherState {
    Idle,
    Opening,
    Syncing,
    Identifying,
    Configuring,
    Working,
    Verifying,
    Completed,
    Cancelled,
    Failed,
}

/// Cooperative cancellation flag, observable at driver checkpoints.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options recognised by the drivers.
#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// Continue despite a non-standard BK encryption key.
    pub skip_key_check: bool,
    /// Continue despite a BK post-read CRC mismatch.
    pub ignore_crc_err: bool,
    /// Permit BK7231T/U writes below the bootloader boundary.
    pub overwrite_bootloader: bool,
    /// Multiplies every per-command timeout. Clamped to >= 1.0.
    pub read_timeout_multiplier: f32,
}

impl Default for FlashOptions {
    fn default() -> FlashOptions {
        FlashOptions {
            skip_key_check: false,
            ignore_crc_err: false,
            overwrite_bootloader: false,
            read_timeout_multiplier: 1.0,
        }
    }
}

type LogCallback = Box<dyn FnMut(LogLevel, &str)>;
type ProgressCallback = Box<dyn FnMut(u64, u64)>;
type StateCallback = Box<dyn FnMut(FlasherState)>;

/// The three callbacks wired by the outer application.
///
/// All of them are invoked synchronously from the engine task and must not
/// block it. When no callback is installed, entries are mirrored onto the
/// `log` crate so nothing is silently dropped.
#[derive(Default)]
pub struct EventSink {
    log: Option<LogCallback>,
    progress: Option<ProgressCallback>,
    state: Option<StateCallback>,
}

impl EventSink {
    pub fn new() -> EventSink {
        EventSink::default()
    }

    pub fn on_log(mut self, callback: impl FnMut(LogLevel, &str) + 'static) -> Self {
        self.log = Some(Box::new(callback));
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(u64, u64) + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn on_state(mut self, callback: impl FnMut(FlasherState) + 'static) -> Self {
        self.state = Some(Box::new(callback));
        self
    }

    fn emit_log(&mut self, level: LogLevel, message: &str) {
        match self.log.as_mut() {
            Some(callback) => callback(level, message),
            None => match level {
                LogLevel::Info | LogLevel::Success => info!("{}", message),
                LogLevel::Warning => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            },
        }
    }

    fn emit_progress(&mut self, done: u64, total: u64) {
        if let Some(callback) = self.progress.as_mut() {
            callback(done, total);
        }
    }

    fn emit_state(&mut self, state: FlasherState) {
        debug!("state -> {:?}", state);

        if let Some(callback) = self.state.as_mut() {
            callback(state);
        }
    }
}

/// Common operation surface of the chip drivers.
pub trait Flasher {
    /// Reads `sectors` 4 KiB sectors starting at `start_sector`, or the
    /// whole flash when `full_read` is set. Populates [`Flasher::read_result`].
    fn do_read(&mut self, start_sector: u32, sectors: u32, full_read: bool) -> Result<()>;

    /// Writes `data` at `offset`, then verifies.
    fn do_write(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// Erases `sectors` sectors starting at `start_sector`, or the whole
    /// flash when `erase_all` is set.
    fn do_erase(&mut self, start_sector: u32, sectors: u32, erase_all: bool) -> Result<bool>;

    /// The buffer produced by the most recent successful read.
    fn read_result(&self) -> Option<&[u8]>;

    /// Releases the transport and subscriptions. Idempotent.
    fn close(&mut self);
}

/// Per-operation driver state: the transport, the ordered receive queue,
/// the current baud rate and the wired callbacks.
///
/// The session exclusively owns the transport between `connect` and
/// `close`; drivers funnel every byte through it.
pub struct Session<T: Transport> {
    transport: T,
    rx: VecDeque<u8>,
    pub baud: u32,
    pub options: FlashOptions,
    events: EventSink,
    cancel: CancelToken,
    state: FlasherState,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, options: FlashOptions, events: EventSink, cancel: CancelToken) -> Session<T> {
        Session {
            transport,
            rx: VecDeque::new(),
            baud: 115_200,
            options,
            events,
            cancel,
            state: FlasherState::Idle,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        self.set_state(FlasherState::Opening);
        self.transport.connect()
    }

    pub fn close(&mut self) {
        self.transport.disconnect();
    }

    pub fn state(&self) -> FlasherState {
        self.state
    }

    pub fn set_state(&mut self, state: FlasherState) {
        self.state = state;
        self.events.emit_state(state);
    }

    pub fn log(&mut self, level: LogLevel, message: &str) {
        self.events.emit_log(level, message);
    }

    /// Progress is only meaningful while transferring or verifying; calls
    /// in any other state are dropped.
    pub fn progress(&mut self, done: u64, total: u64) {
        if matches!(self.state, FlasherState::Working | FlasherState::Verifying) {
            self.events.emit_progress(done, total);
        }
    }

    /// Returns `Err(Cancelled)` once the cancel flag is observed.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport.write(bytes)
    }

    pub fn set_dtr(&mut self, level: bool) -> bool {
        self.transport.set_dtr(level)
    }

    pub fn set_rts(&mut self, level: bool) -> bool {
        self.transport.set_rts(level)
    }

    /// Applies a new baud rate. The receive stream is considered unreliable
    /// across the change; callers drain after the blackout window.
    pub fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.transport.set_baud(baud)?;
        self.baud = baud;

        Ok(())
    }

    fn scaled(&self, timeout: Duration) -> Duration {
        timeout.mul_f32(self.options.read_timeout_multiplier.max(1.0))
    }

    /// Reads exactly `count` bytes within `timeout`, or `None` when the
    /// budget elapses first. Partial data stays queued for the next call.
    pub fn try_read_exact(&mut self, count: usize, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + self.scaled(timeout);

        while self.rx.len() < count {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if remaining > Duration::from_millis(0) => remaining,
                _ => return Ok(None),
            };

            if let Some(chunk) = self.transport.poll_chunk(remaining)? {
                self.rx.extend(chunk);
            }
        }

        Ok(Some(self.rx.drain(..count).collect()))
    }

    /// Like [`Session::try_read_exact`] but a lapse is an error.
    pub fn read_exact(&mut self, count: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.try_read_exact(count, timeout)?
            .ok_or_else(|| Error::Timeout(self.scaled(timeout)))
    }

    pub fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
        Ok(self.try_read_exact(1, timeout)?.map(|bytes| bytes[0]))
    }

    /// Discards everything queued plus anything still in flight.
    pub fn drain(&mut self) -> Result<()> {
        self.rx.clear();

        while self.transport.poll_chunk(Duration::from_millis(1))?.is_some() {}

        Ok(())
    }

    /// Maps an operation outcome to the terminal state and log entry.
    pub fn finish(&mut self, result: &Result<()>) {
        match result {
            Ok(()) => self.set_state(FlasherState::Completed),
            Err(Error::Cancelled) => {
                self.log(LogLevel::Warning, "Operation cancelled by user");
                self.set_state(FlasherState::Cancelled);
            }
            Err(err) => {
                let message = err.to_string();
                self.log(LogLevel::Error, &message);
                self.set_state(FlasherState::Failed);
            }
        }
    }

    #[cfg(test)]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport> crate::xmodem::BlockIo for Session<T> {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.write(bytes)
    }

    fn recv_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
        self.read_byte(timeout)
    }

    fn on_progress(&mut self, progress: crate::xmodem::XmodemProgress) {
        self.progress(progress.bytes_sent as u64, progress.total as u64);
    }
}
