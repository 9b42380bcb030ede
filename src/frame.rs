//! # Wire frame codec
//!
//! Every packet exchanged with the vehicle on the piloting and telemetry
//! characteristics shares one layout: a six byte header followed by a
//! command specific payload, with no length prefix or padding.
//!
//! ```text
//! byte 0      frame type (1 = ack, 2 = data, 3 = low latency, 4 = data with ack)
//! byte 1      sequence number of the source channel, wrapping u8
//! byte 2      project id
//! byte 3      class id
//! bytes 4..6  command id, u16 little endian
//! bytes 6..   payload, verbatim
//! ```
//!
//! Link level acknowledgements are the one exception: they are three raw
//! bytes, `[0x01, sequence, acknowledged sequence]`, and never pass
//! through this codec.

use crate::error::{Error, Result};

/// Transfer semantics of a frame, from the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Acknowledges a previously received frame.
    Ack = 0x01,
    /// Plain data, no acknowledgement expected.
    Data = 0x02,
    /// Data on the high priority channel.
    LowLatency = 0x03,
    /// Data that the receiver must acknowledge.
    DataWithAck = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameType::Ack),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::LowLatency),
            0x04 => Ok(FrameType::DataWithAck),
            other => Err(Error::MalformedFrame(format!(
                "unknown frame type 0x{other:02x}"
            ))),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(value: FrameType) -> Self {
        value as u8
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Transfer semantics of this frame.
    pub frame_type: FrameType,
    /// Sequence number assigned by the sender for its source channel.
    pub sequence: u8,
    /// Project id selecting the command table (0x00 common, 0x02 minidrone).
    pub project: u8,
    /// Class id within the project.
    pub class: u8,
    /// Command id within the class.
    pub command: u16,
    /// Command specific payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serializes the frame for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(6 + self.payload.len());
        bytes.push(self.frame_type.into());
        bytes.push(self.sequence);
        bytes.push(self.project);
        bytes.push(self.class);
        bytes.extend_from_slice(&self.command.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parses a frame received from the vehicle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFrame`] when fewer than six bytes are given
    /// or the frame type byte is not one of the four known values.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 {
            return Err(Error::MalformedFrame(format!(
                "expected at least 6 header bytes, got {}",
                bytes.len()
            )));
        }

        Ok(Frame {
            frame_type: FrameType::try_from(bytes[0])?,
            sequence: bytes[1],
            project: bytes[2],
            class: bytes[3],
            command: u16::from_le_bytes([bytes[4], bytes[5]]),
            payload: bytes[6..].to_vec(),
        })
    }
}
