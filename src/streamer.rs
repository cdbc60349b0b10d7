//! Packet Streamer: paced, linear scan of the firmware image.

use std::ops::Range;

use btleplug::api::WriteType;

use crate::error::TransferError;
use crate::protocol::{receipt_interval, PACKET_SIZE};
use crate::transport::{Characteristic, GattTransport};

/// Streaming position of one transfer. Never shared between transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferContext {
    offset: usize,
    len: usize,
    interval: u16,
}

impl TransferContext {
    pub fn new(image_len: usize) -> Self {
        TransferContext {
            offset: 0,
            len: image_len,
            interval: receipt_interval(image_len),
        }
    }

    /// Bytes already written.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Packets per receipt notification; 0 disables pacing.
    pub fn interval(&self) -> u16 {
        self.interval
    }

    pub fn image_len(&self) -> usize {
        self.len
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.len
    }

    /// Byte range of the next packet, `None` once the image is exhausted.
    pub fn next_packet(&self) -> Option<Range<usize>> {
        if self.is_complete() {
            return None;
        }
        Some(self.offset..(self.offset + PACKET_SIZE).min(self.len))
    }

    fn advance(&mut self, written: usize) {
        self.offset = (self.offset + written).min(self.len);
    }
}

/// Write the next batch of packets and return how many were sent.
///
/// A batch ends after `interval` packets or at the end of the image; with an
/// interval of 0 the whole remainder is sent.
pub async fn stream_batch<T: GattTransport + ?Sized>(
    device: &T,
    packet: &Characteristic,
    image: &[u8],
    ctx: &mut TransferContext,
) -> Result<usize, TransferError> {
    let mut count = 0usize;
    while let Some(range) = ctx.next_packet() {
        let chunk = &image[range];
        device
            .write(packet, chunk, WriteType::WithoutResponse)
            .await
            .map_err(|source| TransferError::PacketWrite {
                offset: ctx.offset(),
                source,
            })?;
        ctx.advance(chunk.len());
        count += 1;
        tracing::trace!(offset = ctx.offset(), count, "Packet written");
        if ctx.interval() > 0 && count >= usize::from(ctx.interval()) {
            break;
        }
    }
    Ok(count)
}
