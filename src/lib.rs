pub mod assets;
pub mod bk72xx;
pub mod bl60x;
pub mod chip;
pub mod cli;
pub mod crc;
mod error;
pub mod esp32;
pub mod flashdb;
pub mod flasher;
pub mod slip;
pub mod transport;
pub mod wm;
pub mod xmodem;

pub use chip::ChipFamily;
pub use error::Error;
pub use flasher::{CancelToken, EventSink, FlashOptions, Flasher, FlasherState, LogLevel};

/// Convenience alias used by every fallible function in this crate.
pub type Result<T> = std::result::Result<T, Error>;

use transport::Transport;

/// Builds the driver matching `family` on top of `transport`.
///
/// `target_baud` is the rate negotiated once the bootloader answers; the
/// returned driver owns the transport until `close()` is called, and the
/// caller must not touch the port while an operation is running.
pub fn flasher_for<T: Transport + 'static>(
    family: ChipFamily,
    transport: T,
    target_baud: u32,
    options: FlashOptions,
    events: EventSink,
    cancel: CancelToken,
) -> Box<dyn Flasher> {
    if family.is_bk() {
        Box::new(bk72xx::Bk72xxFlasher::new(family, transport, target_baud, options, events, cancel))
    } else if family.is_bl() {
        Box::new(bl60x::Bl60xFlasher::new(family, transport, target_baud, options, events, cancel))
    } else if family.is_esp() {
        Box::new(esp32::Esp32Flasher::new(family, transport, target_baud, options, events, cancel))
    } else {
        Box::new(wm::WmFlasher::new(family, transport, target_baud, options, events, cancel))
    }
}
