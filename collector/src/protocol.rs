//! Record frame definitions matching the firmware.

use crc::{Crc, CRC_16_XMODEM};

/// Protocol version (must match firmware)
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest encoded frame the firmware emits
pub const MAX_FRAME_SIZE: usize = 400;

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Frame IDs matching the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Open = 0x01,
    Line = 0x02,
    Flush = 0x03,
    Close = 0x04,
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Open),
            0x02 => Ok(FrameKind::Line),
            0x03 => Ok(FrameKind::Flush),
            0x04 => Ok(FrameKind::Close),
            _ => Err(value),
        }
    }
}

/// Parsed frame from the device.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Payload as text (session names and record lines are ASCII)
    pub fn text(&self) -> anyhow::Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|e| anyhow::anyhow!("Frame payload is not UTF-8: {}", e))
    }
}

/// Parse a COBS-decoded frame.
/// Format: [version: u8][frame_id: u8][length: u16 LE][payload][crc: u16 LE]
pub fn parse_frame(data: &[u8]) -> anyhow::Result<Frame> {
    if data.len() < 6 {
        anyhow::bail!("Frame too short: {} bytes", data.len());
    }

    let version = data[0];
    let kind_byte = data[1];
    let length = u16::from_le_bytes([data[2], data[3]]) as usize;

    if data.len() < 4 + length + 2 {
        anyhow::bail!(
            "Frame payload incomplete: expected {}, got {}",
            4 + length + 2,
            data.len()
        );
    }

    let received_crc = u16::from_le_bytes([data[4 + length], data[4 + length + 1]]);
    let calculated_crc = CRC.checksum(&data[..4 + length]);
    if calculated_crc != received_crc {
        anyhow::bail!(
            "CRC mismatch: expected {:04x}, got {:04x}",
            calculated_crc,
            received_crc
        );
    }

    if version != PROTOCOL_VERSION {
        anyhow::bail!(
            "Protocol version mismatch: expected {}, got {}",
            PROTOCOL_VERSION,
            version
        );
    }

    let kind = FrameKind::try_from(kind_byte)
        .map_err(|v| anyhow::anyhow!("Unknown frame ID: {:#04x}", v))?;

    Ok(Frame {
        kind,
        payload: data[4..4 + length].to_vec(),
    })
}

/// COBS decode a frame, zero delimiter included (corncobs expects it).
pub fn cobs_decode(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoded = vec![0u8; data.len()];
    let len = corncobs::decode_buf(data, &mut decoded)
        .map_err(|e| anyhow::anyhow!("COBS decode error: {:?}", e))?;
    decoded.truncate(len);
    Ok(decoded)
}

/// Splits the serial byte stream on zero delimiters.
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    overflowed: bool,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_FRAME_SIZE),
            overflowed: false,
        }
    }

    /// Feed one byte; returns a complete encoded frame with its delimiter.
    ///
    /// Oversized frames are discarded up to the next delimiter.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte == 0x00 {
            let mut frame = std::mem::take(&mut self.buffer);
            let overflowed = std::mem::replace(&mut self.overflowed, false);
            if overflowed || frame.is_empty() {
                return None;
            }
            frame.push(0x00);
            return Some(frame);
        }

        if self.buffer.len() >= MAX_FRAME_SIZE {
            self.overflowed = true;
            self.buffer.clear();
        }
        if !self.overflowed {
            self.buffer.push(byte);
        }
        None
    }
}
