//! # GATT directory and link writer
//!
//! The vehicle exposes every protocol endpoint as a GATT characteristic
//! whose 128 bit UUID follows one pattern: `9a66XXXX-0800-9191-11e4-012d1540cb8e`,
//! where `XXXX` is a 16 bit short code. The crate addresses endpoints by
//! short code only; [`Directory`] maps codes back to the full service and
//! characteristic UUID strings discovered on the peripheral.
//!
//! [`BleAdapter`] is the seam to the platform BLE stack. Implementations
//! connect to the peripheral however they like; this crate only needs the
//! four operations of the trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::frame::{Frame, FrameType};
use crate::sequence::SequenceRegistry;

const UUID_PREFIX: &str = "9a66";
const UUID_TAIL: &str = "0800919111e4012d1540cb8e";

/// Characteristic short codes used by the protocol.
pub mod channel {
    /// Piloting parameter stream, written every drive tick without response.
    pub const PILOTING: u16 = 0xfa0a;
    /// Command frames, written with response.
    pub const COMMANDS: u16 = 0xfa0b;
    /// Emergency cut-out, written with response.
    pub const EMERGENCY: u16 = 0xfa0c;
    /// Acknowledgements we send for frames received on [`DATA_WITH_ACK`].
    pub const ACK_OUT: u16 = 0xfa1e;
    /// Notifications that need no acknowledgement.
    pub const DATA_NO_ACK: u16 = 0xfb0e;
    /// Notifications the vehicle expects us to acknowledge on [`ACK_OUT`].
    pub const DATA_WITH_ACK: u16 = 0xfb0f;
    /// Vehicle acknowledgements of our command frames.
    pub const COMMAND_ACK: u16 = 0xfb1b;
    /// Vehicle responses on the high priority channel.
    pub const LOW_LATENCY_ACK: u16 = 0xfb1c;
    /// Media store response chunks.
    pub const FTP_DATA: u16 = 0xfd23;
    /// Media store request chunks, written with response.
    pub const FTP_CONTROL: u16 = 0xfd24;
}

/// Expands a 16 bit short code into the full protocol UUID, lowercase and
/// without dashes.
pub fn expand_uuid(short: u16) -> String {
    format!("{UUID_PREFIX}{short:04x}{UUID_TAIL}")
}

/// Extracts the short code from a protocol UUID.
///
/// Accepts dashed or undashed, upper or lower case forms. Returns `None`
/// for UUIDs outside the protocol's `9a66...cb8e` pattern.
pub fn short_code(uuid: &str) -> Option<u16> {
    let compact: String = uuid
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if compact.len() != 32 || !compact.starts_with(UUID_PREFIX) || !compact.ends_with(UUID_TAIL) {
        return None;
    }

    u16::from_str_radix(&compact[4..8], 16).ok()
}

/// Whether writes to `target` request a link layer response.
///
/// The piloting stream and our acknowledgements are fire and forget;
/// commands, the emergency channel and file-transfer requests are written
/// with response.
fn write_with_response(target: u16) -> bool {
    matches!(
        target,
        channel::COMMANDS | channel::EMERGENCY | channel::FTP_CONTROL
    )
}

/// Location of one characteristic on the connected peripheral.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Service UUID exactly as reported by the platform stack.
    pub service: String,
    /// Characteristic UUID exactly as reported by the platform stack.
    pub characteristic: String,
}

/// Map from characteristic short code to discovered endpoint.
///
/// Built once during connection from the adapter's discovery results and
/// never mutated afterwards.
#[derive(Debug, Default)]
pub struct Directory {
    endpoints: HashMap<u16, Endpoint>,
}

impl Directory {
    /// Builds the directory from `(service uuid, characteristic uuid)` pairs.
    ///
    /// Characteristics outside the protocol UUID pattern are ignored.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut endpoints = HashMap::new();
        for (service, characteristic) in entries {
            if let Some(code) = short_code(&characteristic) {
                endpoints.insert(
                    code,
                    Endpoint {
                        service,
                        characteristic,
                    },
                );
            }
        }
        Directory { endpoints }
    }

    /// Looks up the endpoint for a short code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the characteristic was not present
    /// in the discovery results.
    pub fn get(&self, target: u16) -> Result<&Endpoint> {
        self.endpoints
            .get(&target)
            .ok_or_else(|| Error::NotFound(format!("characteristic {target:04x}")))
    }

    /// Whether the directory contains `target`.
    pub fn contains(&self, target: u16) -> bool {
        self.endpoints.contains_key(&target)
    }

    /// Verifies that every listed short code was discovered.
    pub(crate) fn require(&self, targets: &[u16]) -> Result<()> {
        for target in targets {
            self.get(*target)?;
        }
        Ok(())
    }
}

/// Platform BLE operations required by the protocol.
///
/// Implementations wrap whatever BLE stack the host provides. All methods
/// operate on an already connected peripheral; connection management stays
/// outside this crate.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Enumerates all services and characteristics of the peripheral as
    /// `(service uuid, characteristic uuid)` pairs.
    async fn discover(&self) -> Result<Vec<(String, String)>>;

    /// Writes `data` to a characteristic.
    ///
    /// `with_response` selects the link layer write mode; implementations
    /// that cannot write without response may always request one.
    async fn write(
        &self,
        service: &str,
        characteristic: &str,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Reads the current value of a characteristic.
    async fn read(&self, service: &str, characteristic: &str) -> Result<Vec<u8>>;

    /// Subscribes to notifications on a characteristic.
    ///
    /// Each notification's payload is delivered verbatim on the returned
    /// channel. Dropping the receiver ends the subscription.
    async fn subscribe(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>>;
}

/// Serializes outbound traffic: frames, raw chunks and acknowledgements.
///
/// Owns the sequence registry so that every write takes its number and
/// hits the adapter in one place.
pub(crate) struct LinkWriter {
    adapter: Arc<dyn BleAdapter>,
    directory: Directory,
    sequences: SequenceRegistry,
}

impl LinkWriter {
    pub(crate) fn new(adapter: Arc<dyn BleAdapter>, directory: Directory) -> Self {
        LinkWriter {
            adapter,
            directory,
            sequences: SequenceRegistry::new(),
        }
    }

    pub(crate) fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Encodes and writes one command frame on `target`.
    ///
    /// The frame takes the next sequence number of the target channel even
    /// when the transport write subsequently fails.
    pub(crate) async fn write_frame(
        &self,
        target: u16,
        frame_type: FrameType,
        project: u8,
        class: u8,
        command: u16,
        payload: &[u8],
    ) -> Result<()> {
        let endpoint = self.directory.get(target)?;
        let frame = Frame {
            frame_type,
            sequence: self.sequences.next(target),
            project,
            class,
            command,
            payload: payload.to_vec(),
        };

        self.adapter
            .write(
                &endpoint.service,
                &endpoint.characteristic,
                &frame.encode(),
                write_with_response(target),
            )
            .await
    }

    /// Writes bytes verbatim, without frame header or sequence number.
    ///
    /// Used for file-transfer chunks, which carry their own tag byte.
    pub(crate) async fn write_plain(&self, target: u16, data: &[u8]) -> Result<()> {
        let endpoint = self.directory.get(target)?;
        self.adapter
            .write(
                &endpoint.service,
                &endpoint.characteristic,
                data,
                write_with_response(target),
            )
            .await
    }

    /// Writes the three byte acknowledgement `[0x01, seq, acked]` on `target`.
    pub(crate) async fn write_ack(&self, target: u16, acked: u8) -> Result<()> {
        let endpoint = self.directory.get(target)?;
        let bytes = [
            FrameType::Ack.into(),
            self.sequences.next(target),
            acked,
        ];
        self.adapter
            .write(
                &endpoint.service,
                &endpoint.characteristic,
                &bytes,
                write_with_response(target),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingAdapter;

    #[test]
    fn expand_and_short_code_are_inverse() {
        let uuid = expand_uuid(0xfa0b);
        assert_eq!(uuid, "9a66fa0b0800919111e4012d1540cb8e");
        assert_eq!(short_code(&uuid), Some(0xfa0b));
    }

    #[test]
    fn short_code_accepts_dashed_uppercase() {
        assert_eq!(
            short_code("9A66FB0F-0800-9191-11E4-012D1540CB8E"),
            Some(0xfb0f)
        );
    }

    #[test]
    fn short_code_rejects_foreign_uuids() {
        assert_eq!(short_code("00002a000000100080000805f9b34fb"), None);
        assert_eq!(short_code("180f"), None);
    }

    #[test]
    fn directory_skips_unrelated_characteristics() {
        let directory = Directory::from_entries([
            ("180f".to_string(), "2a19".to_string()),
            (expand_uuid(0xfa00), expand_uuid(0xfa0b)),
        ]);

        assert!(directory.contains(channel::COMMANDS));
        assert!(!directory.contains(channel::PILOTING));
        assert!(directory.get(channel::PILOTING).is_err());
    }

    #[tokio::test]
    async fn write_frame_targets_the_right_characteristic() {
        let adapter = RecordingAdapter::new();
        let writer = LinkWriter::new(adapter.clone(), adapter.directory());

        writer
            .write_frame(channel::COMMANDS, FrameType::DataWithAck, 0x02, 0x00, 0x01, &[])
            .await
            .unwrap();

        let writes = adapter.writes_to(channel::COMMANDS);
        assert_eq!(writes, vec![vec![0x04, 0x00, 0x02, 0x00, 0x01, 0x00]]);
        assert!(adapter.writes_to(channel::PILOTING).is_empty());

        let recorded = adapter.recorded();
        assert_eq!(recorded[0].service, expand_uuid(0xfa00));
        assert_eq!(recorded[0].characteristic, expand_uuid(channel::COMMANDS));
    }

    #[tokio::test]
    async fn sequence_advances_per_write() {
        let adapter = RecordingAdapter::new();
        let writer = LinkWriter::new(adapter.clone(), adapter.directory());

        for _ in 0..3 {
            writer
                .write_frame(channel::COMMANDS, FrameType::DataWithAck, 0x02, 0x00, 0x01, &[])
                .await
                .unwrap();
        }

        let sequences: Vec<u8> = adapter
            .writes_to(channel::COMMANDS)
            .iter()
            .map(|bytes| bytes[1])
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn response_mode_follows_the_channel() {
        let adapter = RecordingAdapter::new();
        let writer = LinkWriter::new(adapter.clone(), adapter.directory());

        writer
            .write_frame(channel::PILOTING, FrameType::Data, 0x02, 0x00, 0x02, &[0; 9])
            .await
            .unwrap();
        writer
            .write_frame(channel::COMMANDS, FrameType::DataWithAck, 0x02, 0x00, 0x01, &[])
            .await
            .unwrap();

        let writes = adapter.recorded();
        assert!(!writes[0].with_response);
        assert!(writes[1].with_response);
    }

    #[tokio::test]
    async fn ack_is_three_raw_bytes() {
        let adapter = RecordingAdapter::new();
        let writer = LinkWriter::new(adapter.clone(), adapter.directory());

        writer.write_ack(channel::ACK_OUT, 0x2a).await.unwrap();

        assert_eq!(adapter.writes_to(channel::ACK_OUT), vec![vec![0x01, 0x00, 0x2a]]);
    }

    #[tokio::test]
    async fn plain_write_carries_no_header() {
        let adapter = RecordingAdapter::new();
        let writer = LinkWriter::new(adapter.clone(), adapter.directory());

        writer
            .write_plain(channel::FTP_CONTROL, b"\x03LIS/media\0")
            .await
            .unwrap();

        assert_eq!(
            adapter.writes_to(channel::FTP_CONTROL),
            vec![b"\x03LIS/media\0".to_vec()]
        );
    }
}
