//! # Notification dispatch
//!
//! All subscribed characteristics funnel into one queue of [`Inbound`]
//! events, and a single task consumes it. Handling a notification means:
//! route file-transfer chunks to the transfer engine, decode everything
//! else as a frame, fold state changes into the mirror, raise the
//! emergency trigger on a motor cut-out report, and acknowledge frames
//! that ask for it.
//!
//! The decode table is one flat match over `(project, class, command)`.
//! Unknown combinations land in the default arm and are logged, never
//! fatal; firmware newer than this crate must not take the dispatcher
//! down.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use crate::commands::{PROJECT_COMMON, PROJECT_MINIDRONE};
use crate::frame::{Frame, FrameType};
use crate::ftp::FtpEngine;
use crate::gatt::{channel, LinkWriter};
use crate::telemetry::{
    AlertState, Bounded, ChargingInfo, FlyingState, MassStorage, MassStorageInfo, PictureState,
    StateMirror, VehicleState,
};

// Minidrone project state classes
const CLS_PILOTING_STATE: u8 = 0x03;
const CMD_FLAT_TRIM_CHANGED: u16 = 0x00;
const CMD_FLYING_STATE_CHANGED: u16 = 0x01;
const CMD_ALERT_STATE_CHANGED: u16 = 0x02;
const CMD_AUTO_TAKE_OFF_CHANGED: u16 = 0x03;

const CLS_SPEED_SETTINGS_STATE: u8 = 0x05;
const CMD_MAX_VERTICAL_SPEED_CHANGED: u16 = 0x00;
const CMD_MAX_ROTATION_SPEED_CHANGED: u16 = 0x01;
const CMD_WHEELS_CHANGED: u16 = 0x02;
const CMD_MAX_HORIZONTAL_SPEED_CHANGED: u16 = 0x03;

const CLS_MEDIA_RECORD_STATE: u8 = 0x07;
const CMD_PICTURE_STATE_CHANGED: u16 = 0x00;
const CMD_PICTURE_STATE_CHANGED_V2: u16 = 0x01;

const CLS_PILOTING_SETTINGS_STATE: u8 = 0x09;
const CMD_MAX_ALTITUDE_CHANGED: u16 = 0x00;
const CMD_MAX_TILT_CHANGED: u16 = 0x01;

const CLS_SETTINGS_STATE: u8 = 0x0b;
const CMD_CUT_OUT_MODE_CHANGED: u16 = 0x02;

// Common project state classes
const CLS_NETWORK_EVENT: u8 = 0x01;
const CMD_DISCONNECTION: u16 = 0x00;

const CLS_COMMON_SETTINGS_STATE: u8 = 0x03;
const CMD_ALL_SETTINGS_CHANGED: u16 = 0x00;
const CMD_PRODUCT_NAME_CHANGED: u16 = 0x02;
const CMD_PRODUCT_VERSION_CHANGED: u16 = 0x03;

const CLS_COMMON_STATE: u8 = 0x05;
const CMD_ALL_STATES_CHANGED: u16 = 0x00;
const CMD_BATTERY_STATE_CHANGED: u16 = 0x01;
const CMD_MASS_STORAGE_LIST_CHANGED: u16 = 0x02;
const CMD_MASS_STORAGE_INFO_CHANGED: u16 = 0x03;
const CMD_SENSOR_STATES_CHANGED: u16 = 0x08;

const CLS_HEADLIGHTS_STATE: u8 = 0x17;
const CMD_HEADLIGHT_INTENSITY_CHANGED: u16 = 0x00;

const CLS_CHARGER_STATE: u8 = 0x1d;
const CMD_CHARGING_INFO: u16 = 0x03;

/// One notification, tagged with the short code of its source
/// characteristic.
pub(crate) struct Inbound {
    /// Short code of the characteristic that produced the bytes.
    pub source: u16,
    /// Notification payload, verbatim.
    pub data: Vec<u8>,
}

/// Where acknowledgements for frames from `source` are written.
///
/// The mapping is fixed by the protocol; sources without an entry simply
/// never get acknowledged.
fn ack_target(source: u16) -> Option<u16> {
    match source {
        channel::DATA_WITH_ACK => Some(channel::ACK_OUT),
        _ => None,
    }
}

fn u8_at(payload: &[u8], at: usize) -> Option<u8> {
    payload.get(at).copied()
}

fn u32_at(payload: &[u8], at: usize) -> Option<u32> {
    let bytes = payload.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn f32_at(payload: &[u8], at: usize) -> Option<f32> {
    Some(f32::from_bits(u32_at(payload, at)?))
}

/// Three consecutive little endian floats: current, min, max.
fn bounded_at(payload: &[u8], at: usize) -> Option<Bounded> {
    Some(Bounded {
        current: f32_at(payload, at)?,
        min: f32_at(payload, at + 4)?,
        max: f32_at(payload, at + 8)?,
    })
}

/// NUL terminated string starting at `at`; returns the text and the index
/// past the terminator.
fn c_str_at(payload: &[u8], at: usize) -> Option<(String, usize)> {
    let slice = payload.get(at..)?;
    let end = slice.iter().position(|b| *b == 0).unwrap_or(slice.len());
    let text = String::from_utf8_lossy(&slice[..end]).into_owned();
    Some((text, at + end + 1))
}

/// What applying a decoded frame to the mirror produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    /// The state was updated.
    Updated,
    /// The state was updated and the vehicle reported a motor cut-out.
    Emergency,
    /// The `(project, class, command)` triple is not in the table.
    Unknown,
    /// The triple is known but the payload could not be decoded.
    Malformed,
}

/// Folds one frame into the vehicle state.
fn apply(state: &mut VehicleState, frame: &Frame) -> Applied {
    let payload = frame.payload.as_slice();

    match (frame.project, frame.class, frame.command) {
        (PROJECT_MINIDRONE, CLS_PILOTING_STATE, CMD_FLAT_TRIM_CHANGED) => {
            state.flat_trim_done = true;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_PILOTING_STATE, CMD_FLYING_STATE_CHANGED) => {
            let Some(flying) = u32_at(payload, 0).and_then(FlyingState::from_code) else {
                return Applied::Malformed;
            };
            state.flying_state = flying;
            if flying == FlyingState::Emergency {
                Applied::Emergency
            } else {
                Applied::Updated
            }
        }
        (PROJECT_MINIDRONE, CLS_PILOTING_STATE, CMD_ALERT_STATE_CHANGED) => {
            let Some(alert) = u32_at(payload, 0).and_then(AlertState::from_code) else {
                return Applied::Malformed;
            };
            state.alert_state = alert;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_PILOTING_STATE, CMD_AUTO_TAKE_OFF_CHANGED) => {
            let Some(enabled) = u8_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.auto_takeoff = enabled != 0;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_SPEED_SETTINGS_STATE, CMD_MAX_VERTICAL_SPEED_CHANGED) => {
            let Some(limit) = bounded_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.max_vertical_speed = limit;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_SPEED_SETTINGS_STATE, CMD_MAX_ROTATION_SPEED_CHANGED) => {
            let Some(limit) = bounded_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.max_rotation_speed = limit;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_SPEED_SETTINGS_STATE, CMD_WHEELS_CHANGED) => {
            let Some(present) = u8_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.wheels = present != 0;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_SPEED_SETTINGS_STATE, CMD_MAX_HORIZONTAL_SPEED_CHANGED) => {
            let Some(limit) = bounded_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.max_horizontal_speed = limit;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_MEDIA_RECORD_STATE, CMD_PICTURE_STATE_CHANGED) => {
            let (Some(ready), Some(storage)) = (u8_at(payload, 0), u8_at(payload, 1)) else {
                return Applied::Malformed;
            };
            state.picture_ready = ready != 0;
            state.picture_storage_id = storage;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_MEDIA_RECORD_STATE, CMD_PICTURE_STATE_CHANGED_V2) => {
            let Some(picture) = u32_at(payload, 0).and_then(PictureState::from_code) else {
                return Applied::Malformed;
            };
            let Some(error) = u32_at(payload, 4) else {
                return Applied::Malformed;
            };
            state.picture_state = picture;
            state.picture_error = error;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_PILOTING_SETTINGS_STATE, CMD_MAX_ALTITUDE_CHANGED) => {
            let Some(limit) = bounded_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.max_altitude = limit;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_PILOTING_SETTINGS_STATE, CMD_MAX_TILT_CHANGED) => {
            let Some(limit) = bounded_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.max_tilt = limit;
            Applied::Updated
        }
        (PROJECT_MINIDRONE, CLS_SETTINGS_STATE, CMD_CUT_OUT_MODE_CHANGED) => {
            let Some(enabled) = u8_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.cut_out_mode = enabled != 0;
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_NETWORK_EVENT, CMD_DISCONNECTION) => {
            let Some(cause) = u32_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.disconnection_cause = Some(cause);
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_COMMON_SETTINGS_STATE, CMD_ALL_SETTINGS_CHANGED) => {
            state.all_settings_received = true;
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_COMMON_SETTINGS_STATE, CMD_PRODUCT_NAME_CHANGED) => {
            let Some((name, _)) = c_str_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.product_name = name;
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_COMMON_SETTINGS_STATE, CMD_PRODUCT_VERSION_CHANGED) => {
            let Some((software, next)) = c_str_at(payload, 0) else {
                return Applied::Malformed;
            };
            let Some((hardware, _)) = c_str_at(payload, next) else {
                return Applied::Malformed;
            };
            state.software_version = software;
            state.hardware_version = hardware;
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_COMMON_STATE, CMD_ALL_STATES_CHANGED) => {
            state.all_states_received = true;
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_COMMON_STATE, CMD_BATTERY_STATE_CHANGED) => {
            let Some(percent) = u8_at(payload, 0) else {
                return Applied::Malformed;
            };
            state.battery = percent;
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_COMMON_STATE, CMD_MASS_STORAGE_LIST_CHANGED) => {
            let Some(id) = u8_at(payload, 0) else {
                return Applied::Malformed;
            };
            let Some((name, _)) = c_str_at(payload, 1) else {
                return Applied::Malformed;
            };
            state.mass_storage = Some(MassStorage { id, name });
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_COMMON_STATE, CMD_MASS_STORAGE_INFO_CHANGED) => {
            let (Some(id), Some(size), Some(used)) =
                (u8_at(payload, 0), u32_at(payload, 1), u32_at(payload, 5))
            else {
                return Applied::Malformed;
            };
            let (Some(plugged), Some(full), Some(internal)) =
                (u8_at(payload, 9), u8_at(payload, 10), u8_at(payload, 11))
            else {
                return Applied::Malformed;
            };
            state.mass_storage_info = Some(MassStorageInfo {
                id,
                size,
                used,
                plugged: plugged != 0,
                full: full != 0,
                internal: internal != 0,
            });
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_COMMON_STATE, CMD_SENSOR_STATES_CHANGED) => {
            let (Some(sensor), Some(ok)) = (u32_at(payload, 0), u8_at(payload, 4)) else {
                return Applied::Malformed;
            };
            let ok = ok != 0;
            match sensor {
                0 => state.sensors.imu = ok,
                1 => state.sensors.barometer = ok,
                2 => state.sensors.ultrasound = ok,
                3 => state.sensors.gps = ok,
                4 => state.sensors.magnetometer = ok,
                5 => state.sensors.vertical_camera = ok,
                _ => return Applied::Malformed,
            }
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_HEADLIGHTS_STATE, CMD_HEADLIGHT_INTENSITY_CHANGED) => {
            let (Some(left), Some(right)) = (u8_at(payload, 0), u8_at(payload, 1)) else {
                return Applied::Malformed;
            };
            state.headlight_left = left;
            state.headlight_right = right;
            Applied::Updated
        }
        (PROJECT_COMMON, CLS_CHARGER_STATE, CMD_CHARGING_INFO) => {
            let (Some(phase), Some(rate)) = (u32_at(payload, 0), u32_at(payload, 4)) else {
                return Applied::Malformed;
            };
            let (Some(intensity), Some(full_charge_minutes)) =
                (u8_at(payload, 8), u8_at(payload, 9))
            else {
                return Applied::Malformed;
            };
            state.charging = ChargingInfo {
                phase,
                rate,
                intensity,
                full_charge_minutes,
            };
            Applied::Updated
        }
        _ => Applied::Unknown,
    }
}

/// Handles one inbound notification.
pub(crate) async fn handle_event(
    event: Inbound,
    link: &LinkWriter,
    mirror: &StateMirror,
    ftp: &FtpEngine,
    emergency: &Notify,
) {
    if event.source == channel::FTP_DATA {
        ftp.handle_chunk(&event.data).await;
        return;
    }

    // fb1b and fb1c carry three raw bytes acknowledging our own writes,
    // not frames
    if event.source == channel::COMMAND_ACK || event.source == channel::LOW_LATENCY_ACK {
        debug!(
            "channel {:04x} acknowledged sequence {:?}",
            event.source,
            event.data.get(2)
        );
        return;
    }

    let frame = match Frame::decode(&event.data) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("dropping notification from {:04x}: {err}", event.source);
            return;
        }
    };

    let mut applied = Applied::Updated;
    mirror.update(|state| applied = apply(state, &frame));
    match applied {
        Applied::Updated => {}
        Applied::Emergency => {
            warn!("vehicle reported motor cut-out");
            emergency.notify_one();
        }
        Applied::Unknown => {
            debug!(
                "unhandled notification ({:#04x}, {:#04x}, {:#06x})",
                frame.project, frame.class, frame.command
            );
        }
        Applied::Malformed => {
            warn!(
                "undecodable payload for ({:#04x}, {:#04x}, {:#06x})",
                frame.project, frame.class, frame.command
            );
        }
    }

    if frame.frame_type == FrameType::DataWithAck {
        match ack_target(event.source) {
            Some(target) => {
                if let Err(err) = link.write_ack(target, frame.sequence).await {
                    warn!("acknowledgement on {target:04x} failed: {err}");
                }
            }
            None => debug!("no acknowledgement route for {:04x}", event.source),
        }
    }
}

/// Consumes inbound events until shutdown or until every producer is gone.
pub(crate) async fn run(
    mut events: mpsc::Receiver<Inbound>,
    link: Arc<LinkWriter>,
    mirror: Arc<StateMirror>,
    ftp: Arc<FtpEngine>,
    emergency: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(event) => handle_event(event, &link, &mirror, &ftp, &emergency).await,
                None => {
                    debug!("notification sources closed");
                    break;
                }
            },
            _ = shutdown.changed() => {
                debug!("dispatcher stopping");
                break;
            }
        }
    }
}
