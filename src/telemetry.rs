//! # Vehicle telemetry model
//!
//! The vehicle pushes its state as notifications; this module holds the
//! decoded picture of it. [`VehicleState`] starts at neutral defaults and
//! fields change only when the corresponding notification arrives, so a
//! value of zero may mean "not yet reported".
//!
//! The mirror has a single writer, the dispatcher task. Readers take
//! snapshots; two fields read through separate snapshots may straddle an
//! update, but every individual field is written atomically.

use std::sync::Mutex;

/// Flight phase reported by the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlyingState {
    /// On the ground, motors off.
    #[default]
    Landed,
    /// Motors ramping up.
    TakingOff,
    /// Holding position.
    Hovering,
    /// Executing piloting commands.
    Flying,
    /// Descending to land.
    Landing,
    /// Motors cut after a fault or an emergency command.
    Emergency,
    /// Rolling on wheels (Airborne Cargo with wheel accessory).
    Rolling,
}

impl FlyingState {
    /// Maps the wire code to a state, `None` for codes this crate does not
    /// know.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(FlyingState::Landed),
            1 => Some(FlyingState::TakingOff),
            2 => Some(FlyingState::Hovering),
            3 => Some(FlyingState::Flying),
            4 => Some(FlyingState::Landing),
            5 => Some(FlyingState::Emergency),
            6 => Some(FlyingState::Rolling),
            _ => None,
        }
    }
}

/// Alert condition reported by the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertState {
    /// No alert.
    #[default]
    None,
    /// Alert raised by the user.
    User,
    /// Motors cut out.
    CutOut,
    /// Battery critically low.
    CriticalBattery,
    /// Battery low.
    LowBattery,
}

impl AlertState {
    /// Maps the wire code to an alert, `None` for unknown codes.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(AlertState::None),
            1 => Some(AlertState::User),
            2 => Some(AlertState::CutOut),
            3 => Some(AlertState::CriticalBattery),
            4 => Some(AlertState::LowBattery),
            _ => None,
        }
    }
}

/// Availability of the picture function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureState {
    /// A picture can be taken.
    #[default]
    Ready,
    /// A capture is in progress.
    Busy,
    /// The function is unavailable, for example with no storage present.
    NotAvailable,
}

impl PictureState {
    /// Maps the wire code to a state, `None` for unknown codes.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PictureState::Ready),
            1 => Some(PictureState::Busy),
            2 => Some(PictureState::NotAvailable),
            _ => None,
        }
    }
}

/// A `{current, min, max}` triple the vehicle reports for one adjustable
/// limit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bounded {
    /// Value currently in effect.
    pub current: f32,
    /// Lowest value the vehicle accepts.
    pub min: f32,
    /// Highest value the vehicle accepts.
    pub max: f32,
}

/// Health of the onboard sensors, false until reported good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorStates {
    /// Inertial measurement unit.
    pub imu: bool,
    /// Barometric pressure sensor.
    pub barometer: bool,
    /// Downward ultrasound ranger.
    pub ultrasound: bool,
    /// GPS receiver.
    pub gps: bool,
    /// Magnetometer.
    pub magnetometer: bool,
    /// Downward camera.
    pub vertical_camera: bool,
}

/// Battery charging details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChargingInfo {
    /// Raw charging phase code.
    pub phase: u32,
    /// Raw charge rate code.
    pub rate: u32,
    /// Charging intensity in tenths of an ampere.
    pub intensity: u8,
    /// Estimated minutes until full charge.
    pub full_charge_minutes: u8,
}

/// A storage medium announced by the vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MassStorage {
    /// Identifier used in media paths.
    pub id: u8,
    /// Human readable name.
    pub name: String,
}

/// Capacity details of a storage medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MassStorageInfo {
    /// Identifier of the medium this describes.
    pub id: u8,
    /// Total size in megabytes.
    pub size: u32,
    /// Used space in megabytes.
    pub used: u32,
    /// Whether the medium is plugged in.
    pub plugged: bool,
    /// Whether the medium is full.
    pub full: bool,
    /// Whether the medium is built in.
    pub internal: bool,
}

/// Last decoded state of the vehicle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VehicleState {
    /// Battery charge in percent.
    pub battery: u8,
    /// Current flight phase.
    pub flying_state: FlyingState,
    /// Current alert condition.
    pub alert_state: AlertState,
    /// Whether automatic take-off on throw is armed.
    pub auto_takeoff: bool,
    /// Whether a flat trim has completed since connection.
    pub flat_trim_done: bool,
    /// Whether the wheel accessory is fitted.
    pub wheels: bool,
    /// Altitude ceiling in meters.
    pub max_altitude: Bounded,
    /// Tilt limit in degrees.
    pub max_tilt: Bounded,
    /// Vertical speed limit in meters per second.
    pub max_vertical_speed: Bounded,
    /// Rotation speed limit in degrees per second.
    pub max_rotation_speed: Bounded,
    /// Horizontal speed limit in meters per second.
    pub max_horizontal_speed: Bounded,
    /// Whether the camera reports ready for a picture.
    pub picture_ready: bool,
    /// Storage medium pictures are written to.
    pub picture_storage_id: u8,
    /// Availability of the picture function.
    pub picture_state: PictureState,
    /// Raw error code of the last capture, zero when none.
    pub picture_error: u32,
    /// Left headlight intensity, 0 to 255.
    pub headlight_left: u8,
    /// Right headlight intensity, 0 to 255.
    pub headlight_right: u8,
    /// Whether motors cut out on impact.
    pub cut_out_mode: bool,
    /// Sensor health flags.
    pub sensors: SensorStates,
    /// Battery charging details.
    pub charging: ChargingInfo,
    /// Most recently announced storage medium.
    pub mass_storage: Option<MassStorage>,
    /// Capacity of the most recently described medium.
    pub mass_storage_info: Option<MassStorageInfo>,
    /// Product name, empty until reported.
    pub product_name: String,
    /// Firmware version, empty until reported.
    pub software_version: String,
    /// Hardware revision, empty until reported.
    pub hardware_version: String,
    /// Whether the settings dump requested at connection has completed.
    pub all_settings_received: bool,
    /// Whether the state dump requested at connection has completed.
    pub all_states_received: bool,
    /// Cause code of a vehicle initiated disconnection.
    pub disconnection_cause: Option<u32>,
}

/// Shared holder of the vehicle state.
///
/// Written only by the dispatcher task; everyone else clones snapshots out.
#[derive(Debug, Default)]
pub(crate) struct StateMirror {
    inner: Mutex<VehicleState>,
}

impl StateMirror {
    /// Clones the current state.
    pub fn snapshot(&self) -> VehicleState {
        self.inner.lock().unwrap().clone()
    }

    /// Applies one mutation under the lock.
    pub fn update(&self, apply: impl FnOnce(&mut VehicleState)) {
        apply(&mut self.inner.lock().unwrap());
    }
}
