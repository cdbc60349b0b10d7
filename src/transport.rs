use async_trait::async_trait;
use btleplug::api::{CharPropFlags, WriteType};
use futures::stream::BoxStream;
use uuid::Uuid;

pub use crate::error::TransportError;

/// A characteristic resolved on a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharPropFlags,
}

impl Characteristic {
    pub fn can_notify(&self) -> bool {
        self.properties.contains(CharPropFlags::NOTIFY)
    }
}

/// Value change pushed by the device on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

pub type NotificationStream = BoxStream<'static, Notification>;

/// GATT client capability the DFU procedure runs on.
///
/// One implementor value stands for one remote device. Every call completes
/// only once the link has acknowledged it.
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Open the link and discover the remote GATT database
    async fn connect(&self) -> Result<(), TransportError>;
    /// Close the link
    async fn disconnect(&self) -> Result<(), TransportError>;
    /// Check that `service` is exposed as a primary service
    async fn primary_service(&self, service: Uuid) -> Result<(), TransportError>;
    /// Look up a characteristic of `service`
    async fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic, TransportError>;
    /// Read a characteristic value
    async fn read(&self, chr: &Characteristic) -> Result<Vec<u8>, TransportError>;
    /// Write a characteristic value
    async fn write(&self, chr: &Characteristic, bytes: &[u8], write_type: WriteType) -> Result<(), TransportError>;
    /// Enable value change notifications for `chr`
    async fn subscribe(&self, chr: &Characteristic) -> Result<(), TransportError>;
    /// Stream of notifications from every subscribed characteristic
    async fn notifications(&self) -> Result<NotificationStream, TransportError>;
}
