//! Connection Establisher and Mode Writer.

use btleplug::api::WriteType;

use crate::diagnostics::Diagnostics;
use crate::error::{ConnectError, ModeError, TransportError};
use crate::protocol::dfu_uuids::{CTRL_PT, PACKET, SERVICE, VERSION};
use crate::protocol::{ControlCommand, ProtocolVersion, ENTER_BOOTLOADER};
use crate::transport::{Characteristic, GattTransport};

/// A connected device with its DFU characteristics resolved.
///
/// Lives for one provisioning attempt; call [`DeviceSession::close`] when done.
pub struct DeviceSession<'a, T: GattTransport + ?Sized> {
    device: &'a T,
    pub control: Characteristic,
    pub packet: Characteristic,
    pub version: Option<Characteristic>,
}

impl<'a, T: GattTransport + ?Sized> DeviceSession<'a, T> {
    pub fn device(&self) -> &'a T {
        self.device
    }

    /// Protocol revision from the version characteristic, or the default
    /// when the bootloader does not expose one.
    pub async fn protocol_version(&self) -> Result<ProtocolVersion, TransportError> {
        let Some(chr) = &self.version else {
            return Ok(ProtocolVersion::DEFAULT);
        };
        let bytes = self.device.read(chr).await?;
        ProtocolVersion::parse(&bytes)
            .ok_or_else(|| TransportError::Other("empty version characteristic".into()))
    }

    pub async fn write_control(&self, command: &ControlCommand) -> Result<(), TransportError> {
        tracing::trace!(?command, "Control write");
        self.device
            .write(&self.control, &command.encode(), WriteType::WithResponse)
            .await
    }

    pub async fn write_packet(&self, bytes: &[u8]) -> Result<(), TransportError> {
        tracing::trace!(len = bytes.len(), "Packet write");
        self.device
            .write(&self.packet, bytes, WriteType::WithoutResponse)
            .await
    }

    pub async fn close(self) -> Result<(), TransportError> {
        self.device.disconnect().await
    }
}

/// Connect to `device` and resolve the DFU service characteristics.
///
/// A missing version characteristic is not an error; the session then
/// carries `version: None`.
pub async fn connect<'a, T: GattTransport + ?Sized>(
    device: &'a T,
    diag: &Diagnostics,
) -> Result<DeviceSession<'a, T>, ConnectError> {
    let result = resolve(device, diag).await;
    if let Err(err) = &result {
        diag.error(err.to_string());
        if let Err(e) = device.disconnect().await {
            tracing::warn!(%e, "failed to disconnect after connect error");
        }
    }
    result
}

async fn resolve<'a, T: GattTransport + ?Sized>(
    device: &'a T,
    diag: &Diagnostics,
) -> Result<DeviceSession<'a, T>, ConnectError> {
    device.connect().await.map_err(ConnectError::Link)?;
    diag.log("connected to device");

    device.primary_service(SERVICE).await.map_err(ConnectError::Service)?;
    diag.log("found DFU service");

    let control = device
        .characteristic(SERVICE, CTRL_PT)
        .await
        .map_err(|source| ConnectError::Characteristic { name: "control", source })?;
    diag.log("found control characteristic");

    let packet = device
        .characteristic(SERVICE, PACKET)
        .await
        .map_err(|source| ConnectError::Characteristic { name: "packet", source })?;
    diag.log("found packet characteristic");

    let version = match device.characteristic(SERVICE, VERSION).await {
        Ok(chr) => {
            diag.log("found version characteristic");
            Some(chr)
        }
        Err(e) => {
            tracing::debug!(%e, "no version characteristic");
            None
        }
    };

    Ok(DeviceSession {
        device,
        control,
        packet,
        version,
    })
}

/// Ask the running application to reboot into its bootloader.
///
/// Returns `device` so the caller can reconnect to it for [`provision`](crate::engine::provision).
pub async fn write_mode<'a, T: GattTransport + ?Sized>(device: &'a T, diag: &Diagnostics) -> Result<&'a T, ModeError> {
    let result = enter_bootloader(device, diag).await;
    if let Err(err) = &result {
        diag.error(err.to_string());
    }
    result
}

async fn enter_bootloader<'a, T: GattTransport + ?Sized>(device: &'a T, diag: &Diagnostics) -> Result<&'a T, ModeError> {
    let session = connect(device, diag).await?;
    diag.log("writing modeData...");
    let written = device
        .write(&session.control, &ENTER_BOOTLOADER, WriteType::WithResponse)
        .await;
    if let Err(source) = written {
        if let Err(e) = session.close().await {
            tracing::warn!(%e, "failed to disconnect after mode write error");
        }
        return Err(ModeError::Write(source));
    }
    diag.log("modeData written");
    // The device usually drops the link itself while rebooting.
    if let Err(e) = session.close().await {
        tracing::debug!(%e, "disconnect after mode write");
    }
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBootloader, Op};
    use std::sync::{Arc, Mutex};

    fn recorded(diag: &Diagnostics) -> Arc<Mutex<Vec<String>>> {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        diag.add_logger(move |e| sink.lock().unwrap().push(e.to_string()));
        out
    }

    #[tokio::test]
    async fn resolves_all_characteristics() {
        let device = MockBootloader::new().with_version(&[7, 1]);
        let diag = Diagnostics::new();
        let log = recorded(&diag);

        let session = connect(&device, &diag).await.unwrap();
        assert_eq!(session.control.uuid, CTRL_PT);
        assert_eq!(session.packet.uuid, PACKET);
        assert_eq!(session.version.as_ref().map(|c| c.uuid), Some(VERSION));
        assert_eq!(session.protocol_version().await.unwrap(), ProtocolVersion { major: 7, minor: 1 });
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "connected to device",
                "found DFU service",
                "found control characteristic",
                "found packet characteristic",
                "found version characteristic",
            ]
        );
    }

    #[tokio::test]
    async fn missing_version_falls_back_to_default() {
        let device = MockBootloader::new();
        let diag = Diagnostics::new();

        let session = connect(&device, &diag).await.unwrap();
        assert!(session.version.is_none());
        assert_eq!(session.protocol_version().await.unwrap(), ProtocolVersion::DEFAULT);
        assert!(!device.ops().contains(&Op::Read(VERSION)));
    }

    #[tokio::test]
    async fn missing_packet_characteristic_fails() {
        let device = MockBootloader::new().without_characteristic(PACKET);
        let diag = Diagnostics::new();
        let log = recorded(&diag);

        let err = connect(&device, &diag).await.err().unwrap();
        assert!(matches!(err, ConnectError::Characteristic { name: "packet", .. }));
        assert!(log.lock().unwrap().last().unwrap().starts_with("connect error"));
        assert_eq!(device.ops().last(), Some(&Op::Disconnect));
    }

    #[tokio::test]
    async fn missing_service_fails() {
        let device = MockBootloader::new().without_service();
        let err = connect(&device, &Diagnostics::new()).await.err().unwrap();
        assert!(matches!(err, ConnectError::Service(TransportError::ServiceNotFound(uuid)) if uuid == SERVICE));
    }

    #[tokio::test]
    async fn link_failure_fails() {
        let device = MockBootloader::new().unreachable();
        let err = connect(&device, &Diagnostics::new()).await.err().unwrap();
        assert!(matches!(err, ConnectError::Link(_)));
    }

    #[tokio::test]
    async fn write_mode_sends_single_byte_and_disconnects() {
        let device = MockBootloader::new();
        let diag = Diagnostics::new();
        let log = recorded(&diag);

        let returned = write_mode(&device, &diag).await.unwrap();
        assert!(std::ptr::eq(returned, &device));
        assert_eq!(
            device.ops(),
            vec![Op::Connect, Op::WriteControl(vec![0x01]), Op::Disconnect]
        );
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("modeData written"));
    }

    #[tokio::test]
    async fn write_mode_wraps_write_failure() {
        let device = MockBootloader::new().fail_control_writes();
        let diag = Diagnostics::new();
        let log = recorded(&diag);

        let err = write_mode(&device, &diag).await.err().unwrap();
        assert!(matches!(err, ModeError::Write(_)));
        assert!(log.lock().unwrap().last().unwrap().starts_with("writeMode error"));
        assert_eq!(device.ops().last(), Some(&Op::Disconnect));
    }

    #[tokio::test]
    async fn write_mode_wraps_connect_failure() {
        let device = MockBootloader::new().without_service();
        let err = write_mode(&device, &Diagnostics::new()).await.err().unwrap();
        assert!(matches!(err, ModeError::Connect(ConnectError::Service(_))));
    }
}
