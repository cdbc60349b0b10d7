use crate::protocol::dfu_uuids::SERVICE;
use crate::transport::{Characteristic, GattTransport, Notification, NotificationStream, TransportError};

use async_trait::async_trait;
use btleplug::api::BDAddr;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::Adapter;
use btleplug::platform::Peripheral;
use futures::stream::{self, Stream, StreamExt};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Which advertising device to pick during discovery.
///
/// With neither a name nor an address set, the first device advertising the
/// legacy DFU service matches.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub name: Option<String>,
    pub address: Option<BDAddr>,
}

impl DeviceFilter {
    pub fn matches(&self, local_name: Option<&str>, address: BDAddr, services: &[Uuid]) -> bool {
        if let Some(addr) = self.address {
            if addr != address {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if local_name != Some(name.as_str()) {
                return false;
            }
        }
        if self.name.is_none() && self.address.is_none() {
            return services.contains(&SERVICE);
        }
        true
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.address) {
            (Some(n), Some(a)) => write!(f, "name {:?} at {}", n, a),
            (Some(n), None) => write!(f, "name {:?}", n),
            (None, Some(a)) => write!(f, "address {}", a),
            (None, None) => write!(f, "DFU service {}", SERVICE),
        }
    }
}

async fn default_adapter() -> Result<Adapter, TransportError> {
    let manager = btleplug::platform::Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(TransportError::NoAdapter)
}

/// First candidate whose advertised properties match `filter`.
async fn first_match<T, S>(candidates: S, filter: &DeviceFilter) -> Result<Option<T>, TransportError>
where
    S: Stream<Item = Result<(T, Option<PeripheralProperties>), TransportError>>,
{
    futures::pin_mut!(candidates);
    while let Some(candidate) = candidates.next().await {
        let (device, props) = candidate?;
        let Some(props) = props else {
            continue;
        };
        tracing::debug!(name = ?props.local_name, addr = %props.address, "Discovered");
        if filter.matches(props.local_name.as_deref(), props.address, &props.services) {
            tracing::info!(name = ?props.local_name, addr = %props.address, "Found device");
            return Ok(Some(device));
        }
    }
    Ok(None)
}

/// Check devices the adapter already knows, then every discovery or
/// advertisement update, until one matches.
async fn find_peripheral(central: &Adapter, filter: &DeviceFilter) -> Result<Peripheral, TransportError> {
    tracing::info!(%filter, "Searching for device");
    central.start_scan(ScanFilter::default()).await?;
    let events = central.events().await?;
    let cached = central.peripherals().await?;

    let updates = events
        .filter_map(|event| async move {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
                _ => None,
            }
        })
        .then(move |id| async move { central.peripheral(&id).await });
    let candidates = stream::iter(cached.into_iter().map(Ok))
        .chain(updates)
        .then(|peripheral: Result<Peripheral, btleplug::Error>| async move {
            let peripheral = peripheral?;
            let props = peripheral.properties().await?;
            Ok::<_, TransportError>((peripheral, props))
        });

    match first_match(candidates, filter).await? {
        Some(peripheral) => {
            central.stop_scan().await?;
            Ok(peripheral)
        }
        None => Err(TransportError::Other("unexpected end of scan event stream".into())),
    }
}

/// Scan until a device matches `filter`, giving up after `scan_timeout` if set.
pub async fn find_device(filter: &DeviceFilter, scan_timeout: Option<Duration>) -> Result<BlePeripheral, TransportError> {
    let central = default_adapter().await?;
    let found = match scan_timeout {
        Some(limit) => match tokio::time::timeout(limit, find_peripheral(&central, filter)).await {
            Ok(found) => found,
            Err(_) => {
                central.stop_scan().await?;
                Err(TransportError::DeviceNotFound(filter.to_string()))
            }
        },
        None => find_peripheral(&central, filter).await,
    };
    Ok(BlePeripheral { peripheral: found? })
}

/// A discovered device, reachable through btleplug.
#[derive(Clone)]
pub struct BlePeripheral {
    peripheral: Peripheral,
}

impl BlePeripheral {
    pub fn new(peripheral: Peripheral) -> Self {
        BlePeripheral { peripheral }
    }

    pub fn address(&self) -> BDAddr {
        self.peripheral.address()
    }

    fn platform_characteristic(&self, chr: &Characteristic) -> Result<btleplug::api::Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == chr.uuid && c.service_uuid == chr.service_uuid)
            .ok_or(TransportError::CharacteristicNotFound(chr.uuid))
    }
}

#[async_trait]
impl GattTransport for BlePeripheral {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.peripheral.is_connected().await? {
            self.peripheral.connect().await?;
        }
        self.peripheral.discover_services().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(self.peripheral.disconnect().await?)
    }

    async fn primary_service(&self, service: Uuid) -> Result<(), TransportError> {
        if self.peripheral.services().iter().any(|s| s.uuid == service && s.primary) {
            Ok(())
        } else {
            Err(TransportError::ServiceNotFound(service))
        }
    }

    async fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic, TransportError> {
        let found = self
            .peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter())
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))?;
        Ok(Characteristic {
            uuid: found.uuid,
            service_uuid: found.service_uuid,
            properties: found.properties,
        })
    }

    async fn read(&self, chr: &Characteristic) -> Result<Vec<u8>, TransportError> {
        let chr = self.platform_characteristic(chr)?;
        Ok(self.peripheral.read(&chr).await?)
    }

    async fn write(&self, chr: &Characteristic, bytes: &[u8], write_type: WriteType) -> Result<(), TransportError> {
        let chr = self.platform_characteristic(chr)?;
        Ok(self.peripheral.write(&chr, bytes, write_type).await?)
    }

    async fn subscribe(&self, chr: &Characteristic) -> Result<(), TransportError> {
        let chr = self.platform_characteristic(chr)?;
        Ok(self.peripheral.subscribe(&chr).await?)
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| Notification {
                uuid: n.uuid,
                value: n.value,
            })
            .boxed())
    }
}
