//! Firmware update for Nordic nRF5 peripherals running the legacy
//! (SDK v8 style) BLE DFU bootloader.
//!
//! - **Protocol**: control point opcodes, notifications, size announcement
//! - **Transport**: the GATT client capability ([`GattTransport`]) and its
//!   btleplug implementation
//! - **Session**: connecting and resolving the DFU characteristics, switching
//!   an application into bootloader mode
//! - **Engine**: the handshake state machine, driving the packet streamer
//! - **Diagnostics**: subscriber list receiving every milestone and error
//!
//! ```no_run
//! use nrf_legacy_dfu::{find_device, provision, DeviceFilter, Diagnostics, FirmwareImage, ImageType};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let diag = Diagnostics::new();
//! diag.add_logger(|event| println!("{}", event));
//!
//! let device = find_device(&DeviceFilter::default(), None).await?;
//! let image = FirmwareImage::new(std::fs::read("app.bin")?, ImageType::Application)?;
//! provision(&device, &image, &diag).await?;
//! # Ok(())
//! # }
//! ```

pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod package;
pub mod protocol;
pub mod session;
pub mod streamer;
pub mod transport;
pub mod transport_btleplug;

#[cfg(test)]
mod mock;

pub use diagnostics::{DfuEvent, Diagnostics, SubscriberId};
pub use engine::{provision, provision_with, TransferOptions};
pub use error::{ConnectError, ModeError, PackageError, TransferError, TransportError};
pub use package::FirmwareImage;
pub use protocol::{ImageType, ProtocolVersion};
pub use session::{connect, write_mode, DeviceSession};
pub use transport::GattTransport;
pub use transport_btleplug::{find_device, BlePeripheral, DeviceFilter};
