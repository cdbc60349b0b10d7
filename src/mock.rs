//! Scripted in-memory legacy bootloader for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, WriteType};
use futures::channel::mpsc;
use futures::StreamExt;
use uuid::Uuid;

use crate::protocol::dfu_uuids::{CTRL_PT, PACKET, SERVICE, VERSION};
use crate::transport::{Characteristic, GattTransport, Notification, NotificationStream, TransportError};

/// Operation observed by the mock, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Connect,
    Disconnect,
    Subscribe(Uuid),
    Read(Uuid),
    WriteControl(Vec<u8>),
    WritePacket(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitSize,
    InitData,
    Receiving,
}

struct State {
    ops: Vec<Op>,
    phase: Phase,
    subscribed: bool,
    notify_tx: Option<mpsc::UnboundedSender<Notification>>,
    expected: usize,
    received: Vec<u8>,
    data_packets: Vec<Vec<u8>>,
    prn: u16,
    since_prn: u16,
}

pub struct MockBootloader {
    state: Mutex<State>,
    version: Option<Vec<u8>>,
    service: bool,
    missing: Vec<Uuid>,
    control_props: CharPropFlags,
    reachable: bool,
    silent: bool,
    fail_control: Option<Vec<u8>>,
    fail_init_packet: bool,
    fail_packet_at: Option<usize>,
    codes: HashMap<u8, u8>,
    busy: AtomicBool,
    overlapped: Arc<AtomicBool>,
}

impl MockBootloader {
    pub fn new() -> Self {
        MockBootloader {
            state: Mutex::new(State {
                ops: Vec::new(),
                phase: Phase::Idle,
                subscribed: false,
                notify_tx: None,
                expected: 0,
                received: Vec::new(),
                data_packets: Vec::new(),
                prn: 0,
                since_prn: 0,
            }),
            version: None,
            service: true,
            missing: Vec::new(),
            control_props: CharPropFlags::WRITE | CharPropFlags::NOTIFY,
            reachable: true,
            silent: false,
            fail_control: None,
            fail_init_packet: false,
            fail_packet_at: None,
            codes: HashMap::new(),
            busy: AtomicBool::new(false),
            overlapped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Expose a version characteristic holding `value`.
    pub fn with_version(mut self, value: &[u8]) -> Self {
        self.version = Some(value.to_vec());
        self
    }

    pub fn without_service(mut self) -> Self {
        self.service = false;
        self
    }

    pub fn without_characteristic(mut self, uuid: Uuid) -> Self {
        self.missing.push(uuid);
        self
    }

    pub fn without_notify(mut self) -> Self {
        self.control_props = CharPropFlags::WRITE;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Accept writes but never notify.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn fail_control_writes(mut self) -> Self {
        self.fail_control = Some(Vec::new());
        self
    }

    /// Fail control writes starting with `prefix`.
    pub fn fail_control_write_at(mut self, prefix: &[u8]) -> Self {
        self.fail_control = Some(prefix.to_vec());
        self
    }

    /// Fail the packet write carrying init data.
    pub fn fail_init_packet(mut self) -> Self {
        self.fail_init_packet = true;
        self
    }

    /// Fail the write of firmware data packet number `index`.
    pub fn fail_packet_write_at(mut self, index: usize) -> Self {
        self.fail_packet_at = Some(index);
        self
    }

    /// Answer requests with `opcode` using result `code`.
    pub fn respond_with(mut self, opcode: u8, code: u8) -> Self {
        self.codes.insert(opcode, code);
        self
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn received_image(&self) -> Vec<u8> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn data_packets(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().data_packets.clone()
    }

    pub fn control_writes(&self) -> Vec<Vec<u8>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::WriteControl(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    /// True if a GATT operation started while another was still running.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn code_for(&self, opcode: u8) -> u8 {
        self.codes.get(&opcode).copied().unwrap_or(1)
    }

    fn notify(&self, state: &State, value: Vec<u8>) {
        if self.silent || !state.subscribed {
            return;
        }
        if let Some(tx) = &state.notify_tx {
            let _ = tx.unbounded_send(Notification { uuid: CTRL_PT, value });
        }
    }

    fn respond(&self, state: &State, opcode: u8, trailing: &[u8]) {
        let mut value = vec![0x10, opcode, self.code_for(opcode)];
        value.extend_from_slice(trailing);
        self.notify(state, value);
    }

    fn on_control(&self, state: &mut State, bytes: &[u8]) {
        match bytes {
            [0x01, ..] => state.phase = Phase::AwaitSize,
            [0x02, 0x00] => state.phase = Phase::InitData,
            [0x02, 0x01] => {
                state.phase = Phase::Idle;
                self.respond(state, 0x02, &[]);
            }
            [0x03] => {
                state.phase = Phase::Receiving;
                state.since_prn = 0;
                if state.expected == 0 {
                    state.phase = Phase::Idle;
                    self.respond(state, 0x03, &[]);
                }
            }
            [0x04] => self.respond(state, 0x04, &[]),
            [0x07] => {
                let count = (state.received.len() as u32).to_le_bytes();
                self.respond(state, 0x07, &count);
            }
            [0x08, lo, hi] => state.prn = u16::from_le_bytes([*lo, *hi]),
            _ => {}
        }
    }

    fn on_packet(&self, state: &mut State, bytes: &[u8]) {
        match state.phase {
            Phase::AwaitSize => {
                state.expected = bytes
                    .chunks(4)
                    .map(|b| u32::from_le_bytes(b.try_into().unwrap()) as usize)
                    .sum();
                state.phase = Phase::Idle;
                self.respond(state, 0x01, &[]);
            }
            Phase::Receiving => {
                state.received.extend_from_slice(bytes);
                state.data_packets.push(bytes.to_vec());
                state.since_prn += 1;
                if state.received.len() >= state.expected {
                    state.phase = Phase::Idle;
                    self.respond(state, 0x03, &[]);
                } else if state.prn > 0 && state.since_prn == state.prn {
                    state.since_prn = 0;
                    let count = (state.received.len() as u32).to_le_bytes();
                    let mut value = vec![0x11];
                    value.extend_from_slice(&count);
                    self.notify(state, value);
                }
            }
            Phase::Idle => state.data_packets.push(bytes.to_vec()),
            Phase::InitData => {}
        }
    }

    async fn guard<R>(&self, op: impl FnOnce() -> R) -> R {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::task::yield_now().await;
        let result = op();
        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

impl Default for MockBootloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GattTransport for MockBootloader {
    async fn connect(&self) -> Result<(), TransportError> {
        self.guard(|| {
            if !self.reachable {
                return Err(TransportError::Other("device unreachable".into()));
            }
            self.state.lock().unwrap().ops.push(Op::Connect);
            Ok(())
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.guard(|| {
            let mut state = self.state.lock().unwrap();
            state.ops.push(Op::Disconnect);
            state.subscribed = false;
            state.notify_tx = None;
            Ok(())
        })
        .await
    }

    async fn primary_service(&self, service: Uuid) -> Result<(), TransportError> {
        if self.service && service == SERVICE {
            Ok(())
        } else {
            Err(TransportError::ServiceNotFound(service))
        }
    }

    async fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic, TransportError> {
        let properties = match uuid {
            _ if !self.service || service != SERVICE || self.missing.contains(&uuid) => None,
            CTRL_PT => Some(self.control_props),
            PACKET => Some(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            VERSION if self.version.is_some() => Some(CharPropFlags::READ),
            _ => None,
        };
        properties
            .map(|properties| Characteristic {
                uuid,
                service_uuid: service,
                properties,
            })
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    async fn read(&self, chr: &Characteristic) -> Result<Vec<u8>, TransportError> {
        self.guard(|| {
            self.state.lock().unwrap().ops.push(Op::Read(chr.uuid));
            match (chr.uuid, &self.version) {
                (VERSION, Some(value)) => Ok(value.clone()),
                _ => Err(TransportError::CharacteristicNotFound(chr.uuid)),
            }
        })
        .await
    }

    async fn write(&self, chr: &Characteristic, bytes: &[u8], _write_type: WriteType) -> Result<(), TransportError> {
        self.guard(|| {
            let mut state = self.state.lock().unwrap();
            match chr.uuid {
                CTRL_PT => {
                    if self.fail_control.as_ref().is_some_and(|prefix| bytes.starts_with(prefix)) {
                        return Err(TransportError::Other("control write rejected".into()));
                    }
                    state.ops.push(Op::WriteControl(bytes.to_vec()));
                    self.on_control(&mut state, bytes);
                }
                PACKET => {
                    let data_phase = matches!(state.phase, Phase::Receiving | Phase::Idle);
                    if data_phase && self.fail_packet_at == Some(state.data_packets.len()) {
                        return Err(TransportError::Other("packet write rejected".into()));
                    }
                    if self.fail_init_packet && state.phase == Phase::InitData {
                        return Err(TransportError::Other("init packet rejected".into()));
                    }
                    state.ops.push(Op::WritePacket(bytes.to_vec()));
                    self.on_packet(&mut state, bytes);
                }
                other => return Err(TransportError::CharacteristicNotFound(other)),
            }
            Ok(())
        })
        .await
    }

    async fn subscribe(&self, chr: &Characteristic) -> Result<(), TransportError> {
        self.guard(|| {
            let mut state = self.state.lock().unwrap();
            state.ops.push(Op::Subscribe(chr.uuid));
            state.subscribed = true;
            Ok(())
        })
        .await
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = mpsc::unbounded();
        self.state.lock().unwrap().notify_tx = Some(tx);
        Ok(rx.boxed())
    }
}
