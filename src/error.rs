//! Error types, one enum per public contract.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::describe_code;

/// Failures of the underlying GATT link.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("No Bluetooth adapter found")]
    NoAdapter,

    #[error("No device matching {0}")]
    DeviceNotFound(String),

    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("Not connected")]
    NotConnected,

    #[error("{0}")]
    Other(String),
}

/// Connection Establisher failures.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect error: {0}")]
    Link(#[source] TransportError),

    #[error("connect error: DFU service unavailable: {0}")]
    Service(#[source] TransportError),

    #[error("connect error: {name} characteristic unavailable: {source}")]
    Characteristic {
        name: &'static str,
        #[source]
        source: TransportError,
    },
}

/// Mode Writer failures.
#[derive(Debug, Error)]
pub enum ModeError {
    #[error("writeMode error: {0}")]
    Connect(#[from] ConnectError),

    #[error("writeMode error: {0}")]
    Write(#[source] TransportError),
}

/// Undecodable control point notification.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("empty notification")]
    Empty,

    #[error("notification with opcode {opcode} truncated to {len} bytes")]
    Truncated { opcode: u8, len: usize },

    #[error("unknown notification opcode {0}")]
    UnknownOpcode(u8),
}

/// Transfer Engine failures. All of them end the transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("version read error: {0}")]
    VersionRead(String),

    #[error("controlChar missing notify property")]
    NotifyUnsupported,

    #[error("notification subscribe error: {0}")]
    Subscribe(#[source] TransportError),

    #[error("start error: {0}")]
    Start(#[source] TransportError),

    #[error("error from control: opcode {opcode} returned {}", describe_code(.code))]
    ControlResponse { opcode: u8, code: u8 },

    #[error("error writing init: {0}")]
    InitPacket(#[source] TransportError),

    #[error("error sending packet count: {0}")]
    ReceiptInterval(#[source] TransportError),

    #[error("error sending receive: {0}")]
    ReceiveImage(#[source] TransportError),

    #[error("writePacket error at offset {offset}: {source}")]
    PacketWrite {
        offset: usize,
        #[source]
        source: TransportError,
    },

    #[error("error checking length: {0}")]
    CheckLength(#[source] TransportError),

    #[error("error validating: {0}")]
    Validate(#[source] TransportError),

    #[error("error resetting: {0}")]
    Reset(#[source] TransportError),

    #[error("malformed control event: {0}")]
    MalformedEvent(#[from] EventError),

    #[error("control notifications ended before the transfer completed")]
    NotificationsClosed,

    #[error("no control event within {0:?}")]
    Timeout(Duration),
}

/// Firmware image loading failures.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Unsupported package: {0}")]
    Unsupported(String),

    #[error("Image of {0} bytes does not fit a 32 bit length")]
    TooLarge(usize),
}
