//! Transfer Engine.
//!
//! The handshake is an explicit state machine: [`transition`] maps the current
//! [`State`] and one inbound [`ControlEvent`] to the next state and the
//! [`Step`]s to perform. The driver executes those steps one at a time, each
//! write completing before the next starts, then waits for the next event.
//!
//! ```text
//! Init --START_DFU, size--> AwaitStartResponse
//! AwaitStartResponse --RSP(1), major > 6--> AwaitInitPacketResponse
//! AwaitStartResponse | AwaitInitPacketResponse --RSP(1|2)--> Streaming
//! Streaming --PRN--> Streaming
//! Streaming --RSP(3)--> AwaitLengthCheck --RSP(7)--> AwaitValidate --RSP(4)--> Complete
//! ```

use std::fmt;
use std::time::Duration;

use futures::StreamExt;

use crate::diagnostics::{DfuEvent, Diagnostics};
use crate::error::{EventError, TransferError, TransportError};
use crate::package::FirmwareImage;
use crate::protocol::{
    size_announcement, ControlCommand, ControlEvent, ControlOpcode, InitPacketState, ProtocolVersion,
    NULL_INIT_PACKET,
};
use crate::session::{connect, DeviceSession};
use crate::streamer::{stream_batch, TransferContext};
use crate::transport::{GattTransport, NotificationStream};

/// Tunables of a single transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Upper bound on every wait for a control event. `None` waits forever.
    pub event_timeout: Option<Duration>,
    /// Written to the packet characteristic during the init packet exchange.
    pub init_packet: Vec<u8>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            event_timeout: None,
            init_packet: NULL_INIT_PACKET.to_vec(),
        }
    }
}

/// Wait states of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitStartResponse,
    AwaitInitPacketResponse,
    Streaming,
    AwaitLengthCheck,
    AwaitValidate,
    Complete,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::AwaitStartResponse => write!(f, "AWAIT_START"),
            State::AwaitInitPacketResponse => write!(f, "AWAIT_INIT_PACKET"),
            State::Streaming => write!(f, "STREAMING"),
            State::AwaitLengthCheck => write!(f, "AWAIT_LENGTH_CHECK"),
            State::AwaitValidate => write!(f, "AWAIT_VALIDATE"),
            State::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Outbound action requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Control(ControlCommand),
    /// Write the init packet to the packet characteristic.
    InitPacket,
    /// Hand over to the packet streamer for one batch.
    StreamBatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: State,
    pub steps: Vec<Step>,
}

impl Transition {
    fn to(next: State, steps: Vec<Step>) -> Option<Self> {
        Some(Transition { next, steps })
    }
}

fn begin_streaming(interval: u16) -> Option<Transition> {
    Transition::to(
        State::Streaming,
        vec![
            Step::Control(ControlCommand::SetReceiptInterval(interval)),
            Step::Control(ControlCommand::ReceiveFirmwareImage),
            Step::StreamBatch,
        ],
    )
}

/// Advance the handshake by one control event.
///
/// `Ok(None)` means the event does not apply to `state` and is ignored. A
/// RESPONSE with a failure code is an error in every state.
pub fn transition(
    state: State,
    event: &ControlEvent,
    version: ProtocolVersion,
    interval: u16,
) -> Result<Option<Transition>, TransferError> {
    let request = match event {
        ControlEvent::Response { request, code, .. } => {
            if !event.is_success() {
                return Err(TransferError::ControlResponse {
                    opcode: *request,
                    code: *code,
                });
            }
            ControlOpcode::try_from(*request).ok()
        }
        ControlEvent::PacketReceipt { .. } => {
            return Ok(match state {
                State::Streaming => Transition::to(State::Streaming, vec![Step::StreamBatch]),
                _ => None,
            });
        }
    };

    Ok(match (state, request) {
        (State::AwaitStartResponse, Some(ControlOpcode::StartDfu)) => {
            if version.requires_init_packet() {
                Transition::to(
                    State::AwaitInitPacketResponse,
                    vec![
                        Step::Control(ControlCommand::InitPacket(InitPacketState::Begin)),
                        Step::InitPacket,
                        Step::Control(ControlCommand::InitPacket(InitPacketState::End)),
                    ],
                )
            } else {
                begin_streaming(interval)
            }
        }
        (State::AwaitInitPacketResponse, Some(ControlOpcode::InitPacket)) => begin_streaming(interval),
        (State::Streaming, Some(ControlOpcode::ReceiveFirmwareImage)) => Transition::to(
            State::AwaitLengthCheck,
            vec![Step::Control(ControlCommand::CheckLength)],
        ),
        (State::AwaitLengthCheck, Some(ControlOpcode::CheckLength)) => Transition::to(
            State::AwaitValidate,
            vec![Step::Control(ControlCommand::ValidateFirmware)],
        ),
        (State::AwaitValidate, Some(ControlOpcode::ValidateFirmware)) => Transition::to(
            State::Complete,
            vec![Step::Control(ControlCommand::ActivateAndReset)],
        ),
        _ => None,
    })
}

fn control_failure(command: &ControlCommand) -> fn(TransportError) -> TransferError {
    match command {
        ControlCommand::StartDfu(_) => TransferError::Start,
        ControlCommand::InitPacket(_) => TransferError::InitPacket,
        ControlCommand::SetReceiptInterval(_) => TransferError::ReceiptInterval,
        ControlCommand::ReceiveFirmwareImage => TransferError::ReceiveImage,
        ControlCommand::CheckLength => TransferError::CheckLength,
        ControlCommand::ValidateFirmware => TransferError::Validate,
        ControlCommand::ActivateAndReset => TransferError::Reset,
    }
}

fn milestone(command: &ControlCommand) -> String {
    match command {
        ControlCommand::StartDfu(image_type) => format!("sent start: {:?}", image_type),
        ControlCommand::InitPacket(InitPacketState::Begin) => "sent init packet begin".into(),
        ControlCommand::InitPacket(InitPacketState::End) => "sent init packet end".into(),
        ControlCommand::SetReceiptInterval(interval) => format!("sent packet count: {}", interval),
        ControlCommand::ReceiveFirmwareImage => "sent receive".into(),
        ControlCommand::CheckLength => "complete, check length".into(),
        ControlCommand::ValidateFirmware => "complete, validate...".into(),
        ControlCommand::ActivateAndReset => "complete, reset...".into(),
    }
}

struct Transfer<'s, 'a, T: GattTransport + ?Sized> {
    session: &'s DeviceSession<'a, T>,
    image: &'s FirmwareImage,
    version: ProtocolVersion,
    options: &'s TransferOptions,
    diag: &'s Diagnostics,
    ctx: TransferContext,
    state: State,
    events: Option<NotificationStream>,
}

impl<'s, 'a, T: GattTransport + ?Sized> Transfer<'s, 'a, T> {
    async fn run(mut self) -> Result<(), TransferError> {
        self.start().await?;
        while self.state != State::Complete {
            let event = self.next_event().await?;
            let Some(Transition { next, steps }) =
                transition(self.state, &event, self.version, self.ctx.interval())?
            else {
                tracing::debug!(state = %self.state, ?event, "Ignoring control event");
                continue;
            };
            if let ControlEvent::PacketReceipt { bytes } = event {
                self.diag.log(format!("transferred: {}", bytes));
                if bytes as usize != self.ctx.offset() {
                    tracing::warn!(reported = bytes, sent = self.ctx.offset(), "Receipt count mismatch");
                }
            }
            if let Some(bytes) = event.byte_count().filter(|_| next == State::AwaitValidate) {
                self.diag.log(format!("length: {}", bytes));
                if bytes as usize != self.image.len() {
                    tracing::warn!(reported = bytes, expected = self.image.len(), "Length mismatch");
                }
            }
            for step in &steps {
                self.execute(step).await?;
            }
            if next != self.state {
                tracing::info!(from = %self.state, to = %next, "State transition");
            }
            self.state = next;
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), TransferError> {
        let session = self.session;
        if !session.control.can_notify() {
            return Err(TransferError::NotifyUnsupported);
        }

        self.diag.log("enabling notifications");
        let device = session.device();
        device.subscribe(&session.control).await.map_err(TransferError::Subscribe)?;
        self.events = Some(device.notifications().await.map_err(TransferError::Subscribe)?);

        let image_type = self.image.image_type();
        self.diag.log(format!("sending imagetype: {:?}", image_type));
        self.execute(&Step::Control(ControlCommand::StartDfu(image_type))).await?;

        let announcement = size_announcement(image_type, self.image.len_u32());
        session.write_packet(&announcement).await.map_err(TransferError::Start)?;
        self.diag.log(format!("sent buffer size: {}", self.image.len()));

        self.state = State::AwaitStartResponse;
        Ok(())
    }

    async fn execute(&mut self, step: &Step) -> Result<(), TransferError> {
        match step {
            Step::Control(command) => {
                self.session
                    .write_control(command)
                    .await
                    .map_err(control_failure(command))?;
                self.diag.log(milestone(command));
            }
            Step::InitPacket => {
                self.session
                    .write_packet(&self.options.init_packet)
                    .await
                    .map_err(TransferError::InitPacket)?;
                self.diag.log("write null init packet");
            }
            Step::StreamBatch => {
                let sent = stream_batch(
                    self.session.device(),
                    &self.session.packet,
                    self.image.data(),
                    &mut self.ctx,
                )
                .await?;
                tracing::debug!(sent, offset = self.ctx.offset(), "Batch written");
                self.diag.emit(DfuEvent::Progress {
                    sent: self.ctx.offset(),
                    total: self.ctx.image_len(),
                });
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ControlEvent, TransferError> {
        let control = self.session.control.uuid;
        let timeout = self.options.event_timeout;
        let events = self.events.as_mut().ok_or(TransferError::NotificationsClosed)?;
        loop {
            let next = match timeout {
                Some(limit) => tokio::time::timeout(limit, events.next())
                    .await
                    .map_err(|_| TransferError::Timeout(limit))?,
                None => events.next().await,
            };
            let notification = next.ok_or(TransferError::NotificationsClosed)?;
            if notification.uuid != control {
                continue;
            }
            match ControlEvent::parse(&notification.value) {
                Ok(event) => {
                    tracing::trace!(?event, "Control event");
                    return Ok(event);
                }
                Err(EventError::UnknownOpcode(opcode)) => {
                    tracing::debug!(opcode, "Ignoring unknown control notification");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Update `device` with `image`, waiting indefinitely for each device event.
pub async fn provision<T: GattTransport + ?Sized>(
    device: &T,
    image: &FirmwareImage,
    diag: &Diagnostics,
) -> Result<(), TransferError> {
    provision_with(device, image, &TransferOptions::default(), diag).await
}

/// Update `device` with `image`.
///
/// Connects, negotiates the protocol version, runs the handshake and streams
/// the image. The link is closed again whatever the outcome.
pub async fn provision_with<T: GattTransport + ?Sized>(
    device: &T,
    image: &FirmwareImage,
    options: &TransferOptions,
    diag: &Diagnostics,
) -> Result<(), TransferError> {
    let session = connect(device, diag).await?;
    let result = transfer(&session, image, options, diag).await;

    match &result {
        Ok(()) => {
            diag.log("transfer complete");
            // The bootloader resets on activation and usually drops the link first.
            if let Err(e) = session.close().await {
                tracing::debug!(%e, "disconnect after reset");
            }
        }
        Err(err) => {
            diag.error(err.to_string());
            if let Err(e) = session.close().await {
                tracing::warn!(%e, "failed to disconnect after transfer error");
            }
        }
    }
    result
}

async fn transfer<T: GattTransport + ?Sized>(
    session: &DeviceSession<'_, T>,
    image: &FirmwareImage,
    options: &TransferOptions,
    diag: &Diagnostics,
) -> Result<(), TransferError> {
    let version = if session.version.is_some() {
        diag.log("reading version char...");
        session
            .protocol_version()
            .await
            .map_err(|e| TransferError::VersionRead(e.to_string()))?
    } else {
        ProtocolVersion::DEFAULT
    };
    diag.log(format!("using dfu version {}", version));

    let transfer = Transfer {
        session,
        image,
        version,
        options,
        diag,
        ctx: TransferContext::new(image.len()),
        state: State::AwaitStartResponse,
        events: None,
    };
    transfer.run().await
}
