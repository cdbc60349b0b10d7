use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::borrow::Borrow;
use std::fmt;

use crate::error::EventError;

// As defined by the nRF51 SDK v8 legacy "DFU over BLE" bootloader
// (dfu_transport_ble.c / ble_dfu.h).

/// Legacy DFU service & characteristic UUIDs
pub mod dfu_uuids {
    use uuid::Uuid;
    /// Legacy DFU Service
    pub const SERVICE: Uuid = Uuid::from_u128(0x00001530_1212_EFDE_1523_785FEABCD123);
    /// Control Point Characteristic (write, notify)
    pub const CTRL_PT: Uuid = Uuid::from_u128(0x00001531_1212_EFDE_1523_785FEABCD123);
    /// Packet Characteristic (write without response)
    pub const PACKET: Uuid = Uuid::from_u128(0x00001532_1212_EFDE_1523_785FEABCD123);
    /// DFU Version Characteristic (read, optional)
    pub const VERSION: Uuid = Uuid::from_u128(0x00001534_1212_EFDE_1523_785FEABCD123);
}

/// Bytes per data packet written to the packet characteristic.
pub const PACKET_SIZE: usize = 20;

/// Number of receipt notifications the device should emit over a whole image.
pub const NOTIFY_STEPS: usize = 40;

/// Written to the control point of a running application to make it jump
/// into the bootloader.
pub const ENTER_BOOTLOADER: [u8; 1] = [ControlOpcode::StartDfu as u8];

/// Placeholder init packet accepted by bootloaders that expect one but do
/// not check its content.
pub const NULL_INIT_PACKET: [u8; 1] = [0x00];

/// Control point opcodes, both directions.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlOpcode {
    StartDfu = 0x01,
    InitPacket = 0x02,
    ReceiveFirmwareImage = 0x03,
    ValidateFirmware = 0x04,
    ActivateAndReset = 0x05,
    SystemReset = 0x06,
    CheckLength = 0x07,
    SetReceiptInterval = 0x08,
    Response = 0x10,
    PacketReceiptNotification = 0x11,
}

/// Result codes carried by a RESPONSE notification.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

/// Describe a raw result code, including ones the bootloader should never send.
pub fn describe_code<C: Borrow<u8>>(code: C) -> String {
    let code = *code.borrow();
    match ResponseCode::try_from(code) {
        Ok(known) => format!("{:?}", known),
        Err(_) => format!("unknown result code {}", code),
    }
}

/// Firmware component carried by the image.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ImageType {
    None = 0x00,
    SoftDevice = 0x01,
    Bootloader = 0x02,
    SoftDeviceBootloader = 0x03,
    Application = 0x04,
}

// Not derived: num_enum reads `#[default]` as the fallback for unknown bytes.
impl Default for ImageType {
    fn default() -> Self {
        ImageType::Application
    }
}

/// Sub-state byte of the INIT_PACKET command.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum InitPacketState {
    Begin = 0x00,
    End = 0x01,
}

/// Bootloader protocol revision, read from the version characteristic.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    /// Assumed when the bootloader has no version characteristic.
    pub const DEFAULT: ProtocolVersion = ProtocolVersion { major: 6, minor: 0 };

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let major = *bytes.first()?;
        let minor = bytes.get(1).copied().unwrap_or(0);
        Some(ProtocolVersion { major, minor })
    }

    /// Bootloaders newer than revision 6 expect an init packet before the image.
    pub fn requires_init_packet(&self) -> bool {
        self.major > 6
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Outbound control point command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlCommand {
    StartDfu(ImageType),
    InitPacket(InitPacketState),
    ReceiveFirmwareImage,
    ValidateFirmware,
    ActivateAndReset,
    CheckLength,
    SetReceiptInterval(u16),
}

impl ControlCommand {
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            ControlCommand::StartDfu(_) => ControlOpcode::StartDfu,
            ControlCommand::InitPacket(_) => ControlOpcode::InitPacket,
            ControlCommand::ReceiveFirmwareImage => ControlOpcode::ReceiveFirmwareImage,
            ControlCommand::ValidateFirmware => ControlOpcode::ValidateFirmware,
            ControlCommand::ActivateAndReset => ControlOpcode::ActivateAndReset,
            ControlCommand::CheckLength => ControlOpcode::CheckLength,
            ControlCommand::SetReceiptInterval(_) => ControlOpcode::SetReceiptInterval,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload: Vec<u8> = vec![self.opcode().into()];
        match self {
            ControlCommand::StartDfu(image_type) => payload.push((*image_type).into()),
            ControlCommand::InitPacket(state) => payload.push((*state).into()),
            ControlCommand::SetReceiptInterval(interval) => {
                payload.extend_from_slice(&interval.to_le_bytes())
            }
            _ => {}
        }
        payload
    }
}

/// Inbound control point notification.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlEvent {
    /// Answer to a previously written command.
    Response { request: u8, code: u8, payload: Vec<u8> },
    /// Flow control: the device has received `bytes` so far.
    PacketReceipt { bytes: u32 },
}

impl ControlEvent {
    pub fn parse(bytes: &[u8]) -> Result<Self, EventError> {
        let (&opcode, rest) = bytes.split_first().ok_or(EventError::Empty)?;
        match ControlOpcode::try_from(opcode) {
            Ok(ControlOpcode::Response) => {
                if rest.len() < 2 {
                    return Err(EventError::Truncated { opcode, len: bytes.len() });
                }
                Ok(ControlEvent::Response {
                    request: rest[0],
                    code: rest[1],
                    payload: rest[2..].to_vec(),
                })
            }
            Ok(ControlOpcode::PacketReceiptNotification) => {
                let count: [u8; 4] = rest
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(EventError::Truncated { opcode, len: bytes.len() })?;
                Ok(ControlEvent::PacketReceipt { bytes: u32::from_le_bytes(count) })
            }
            _ => Err(EventError::UnknownOpcode(opcode)),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            ControlEvent::Response { code, .. } => *code == u8::from(ResponseCode::Success),
            ControlEvent::PacketReceipt { .. } => true,
        }
    }

    /// Byte count trailing a CHECK_LENGTH response.
    pub fn byte_count(&self) -> Option<u32> {
        match self {
            ControlEvent::Response { payload, .. } => {
                payload.get(..4).and_then(|b| b.try_into().ok()).map(u32::from_le_bytes)
            }
            ControlEvent::PacketReceipt { bytes } => Some(*bytes),
        }
    }
}

/// Build the 12 byte image size announcement: SoftDevice, Bootloader and
/// Application lengths as little-endian u32.
pub fn size_announcement(image_type: ImageType, len: u32) -> [u8; 12] {
    let (soft, boot, app) = match image_type {
        ImageType::SoftDevice => (len, 0, 0),
        ImageType::Bootloader => (0, len, 0),
        ImageType::Application => (0, 0, len),
        ImageType::None | ImageType::SoftDeviceBootloader => (0, 0, 0),
    };
    let mut packet = [0u8; 12];
    packet[0..4].copy_from_slice(&soft.to_le_bytes());
    packet[4..8].copy_from_slice(&boot.to_le_bytes());
    packet[8..12].copy_from_slice(&app.to_le_bytes());
    packet
}

/// Packets per receipt notification for an image of `image_len` bytes.
///
/// Saturates at `u16::MAX`, the widest value SET_RECEIPT_INTERVAL can carry.
pub fn receipt_interval(image_len: usize) -> u16 {
    let interval = image_len / (PACKET_SIZE * NOTIFY_STEPS);
    u16::try_from(interval).unwrap_or(u16::MAX)
}
