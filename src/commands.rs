//! # Command encoder
//!
//! Builds and sends the one-shot command frames of the protocol: flight
//! commands, settings, animations and clock synchronization. Piloting
//! parameters are not commands; they flow through the drive loop in
//! [`crate::drive`].
//!
//! Arguments are validated against the vehicle's documented ranges before
//! anything touches the link, so a rejected command consumes no sequence
//! number.

use std::sync::Arc;

use chrono::{DateTime, Local};
use tracing::warn;

use crate::error::{Error, Result};
use crate::frame::FrameType;
use crate::gatt::{channel, LinkWriter};
use crate::telemetry::{PictureState, StateMirror};

// Project identifiers
pub(crate) const PROJECT_COMMON: u8 = 0x00;
pub(crate) const PROJECT_MINIDRONE: u8 = 0x02;

// Minidrone project classes and commands
pub(crate) const CLS_PILOTING: u8 = 0x00;
pub(crate) const CMD_FLAT_TRIM: u16 = 0x00;
pub(crate) const CMD_TAKE_OFF: u16 = 0x01;
pub(crate) const CMD_PCMD: u16 = 0x02;
pub(crate) const CMD_LANDING: u16 = 0x03;
pub(crate) const CMD_EMERGENCY: u16 = 0x04;
pub(crate) const CMD_AUTO_TAKE_OFF: u16 = 0x05;

const CLS_SPEED_SETTINGS: u8 = 0x01;
const CMD_MAX_VERTICAL_SPEED: u16 = 0x00;
const CMD_MAX_ROTATION_SPEED: u16 = 0x01;

const CLS_ANIMATIONS: u8 = 0x04;
const CMD_FLIP: u16 = 0x00;

const CLS_MEDIA_RECORD: u8 = 0x06;
const CMD_PICTURE_V2: u16 = 0x01;

const CLS_PILOTING_SETTINGS: u8 = 0x08;
const CMD_MAX_ALTITUDE: u16 = 0x00;
const CMD_MAX_TILT: u16 = 0x01;

const CLS_SETTINGS: u8 = 0x0a;
const CMD_CUT_OUT_MODE: u16 = 0x00;

// Common project classes and commands
const CLS_COMMON_SETTINGS: u8 = 0x02;
const CMD_ALL_SETTINGS: u16 = 0x00;

const CLS_COMMON: u8 = 0x04;
const CMD_ALL_STATES: u16 = 0x00;
const CMD_CURRENT_DATE: u16 = 0x01;
const CMD_CURRENT_TIME: u16 = 0x02;

const CLS_HEADLIGHTS: u8 = 0x16;
const CMD_HEADLIGHTS: u16 = 0x00;

const CLS_COMMON_ANIMATIONS: u8 = 0x18;
const CMD_ANIMATION_START: u16 = 0x00;
const CMD_ANIMATION_STOP: u16 = 0x01;
const CMD_ANIMATION_STOP_ALL: u16 = 0x02;

// Ranges accepted by the vehicle for the adjustable limits
const ALTITUDE_RANGE: (f32, f32) = (2.6, 10.0);
const TILT_RANGE: (f32, f32) = (5.0, 25.0);
const VERTICAL_SPEED_RANGE: (f32, f32) = (0.5, 2.0);
const ROTATION_SPEED_RANGE: (f32, f32) = (0.0, 360.0);

/// Direction of an aerobatic flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FlipDirection {
    /// Forward somersault.
    Front = 0,
    /// Backward somersault.
    Back = 1,
    /// Roll to the right.
    Right = 2,
    /// Roll to the left.
    Left = 3,
}

/// Headlight animation patterns of the Airborne Night models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HeadlightAnimation {
    /// Both lights flashing together.
    Flash = 0,
    /// Lights blinking alternately.
    Blink = 1,
    /// Intensity oscillating smoothly.
    Oscillation = 2,
}

fn check_range(what: &str, value: f32, range: (f32, f32)) -> Result<()> {
    if value < range.0 || value > range.1 {
        return Err(Error::InvalidParameter(format!(
            "{what} {value} out of range {}..{}",
            range.0, range.1
        )));
    }
    Ok(())
}

/// Sends one-shot command frames on the command and emergency channels.
pub(crate) struct CommandEncoder {
    link: Arc<LinkWriter>,
    mirror: Arc<StateMirror>,
}

impl CommandEncoder {
    pub fn new(link: Arc<LinkWriter>, mirror: Arc<StateMirror>) -> Self {
        CommandEncoder { link, mirror }
    }

    async fn command(&self, class: u8, command: u16, payload: &[u8]) -> Result<()> {
        self.link
            .write_frame(
                channel::COMMANDS,
                FrameType::DataWithAck,
                PROJECT_MINIDRONE,
                class,
                command,
                payload,
            )
            .await
    }

    async fn common(&self, class: u8, command: u16, payload: &[u8]) -> Result<()> {
        self.link
            .write_frame(
                channel::COMMANDS,
                FrameType::DataWithAck,
                PROJECT_COMMON,
                class,
                command,
                payload,
            )
            .await
    }

    async fn setting(&self, class: u8, command: u16, value: f32) -> Result<()> {
        self.command(class, command, &value.to_le_bytes()).await
    }

    /// Calibrates the horizontal reference. The vehicle must sit on a flat
    /// surface.
    pub async fn flat_trim(&self) -> Result<()> {
        self.command(CLS_PILOTING, CMD_FLAT_TRIM, &[]).await
    }

    /// Spins up and climbs to the default hover altitude.
    pub async fn take_off(&self) -> Result<()> {
        self.command(CLS_PILOTING, CMD_TAKE_OFF, &[]).await
    }

    /// Descends and stops the motors.
    pub async fn landing(&self) -> Result<()> {
        self.command(CLS_PILOTING, CMD_LANDING, &[]).await
    }

    /// Cuts the motors immediately, wherever the vehicle is.
    ///
    /// Fire and forget: a transport failure is logged, never returned, so
    /// the call can be issued from any context without error plumbing.
    pub async fn emergency(&self) {
        let sent = self
            .link
            .write_frame(
                channel::EMERGENCY,
                FrameType::DataWithAck,
                PROJECT_MINIDRONE,
                CLS_PILOTING,
                CMD_EMERGENCY,
                &[],
            )
            .await;
        if let Err(err) = sent {
            warn!("emergency command failed: {err}");
        }
    }

    /// Arms or disarms automatic take-off on throw.
    pub async fn set_auto_take_off(&self, enable: bool) -> Result<()> {
        self.command(CLS_PILOTING, CMD_AUTO_TAKE_OFF, &[u8::from(enable)])
            .await
    }

    /// Performs an aerobatic flip in the given direction.
    pub async fn flip(&self, direction: FlipDirection) -> Result<()> {
        self.command(CLS_ANIMATIONS, CMD_FLIP, &(direction as u32).to_le_bytes())
            .await
    }

    /// Takes a picture with the downward camera.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] when the vehicle has reported a capture in
    /// progress or an unavailable camera and no later ready state.
    pub async fn take_picture(&self) -> Result<()> {
        let picture_state = self.mirror.snapshot().picture_state;
        if picture_state != PictureState::Ready {
            return Err(Error::Busy(format!(
                "picture function is {picture_state:?}"
            )));
        }
        self.command(CLS_MEDIA_RECORD, CMD_PICTURE_V2, &[]).await
    }

    /// Sets the altitude ceiling in meters, accepted range 2.6 to 10.0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for values outside the range;
    /// nothing is written in that case.
    pub async fn set_max_altitude(&self, meters: f32) -> Result<()> {
        check_range("max altitude", meters, ALTITUDE_RANGE)?;
        self.setting(CLS_PILOTING_SETTINGS, CMD_MAX_ALTITUDE, meters)
            .await
    }

    /// Sets the tilt limit in degrees, accepted range 5 to 25.
    pub async fn set_max_tilt(&self, degrees: f32) -> Result<()> {
        check_range("max tilt", degrees, TILT_RANGE)?;
        self.setting(CLS_PILOTING_SETTINGS, CMD_MAX_TILT, degrees)
            .await
    }

    /// Sets the vertical speed limit in meters per second, accepted range
    /// 0.5 to 2.0.
    pub async fn set_max_vertical_speed(&self, meters_per_second: f32) -> Result<()> {
        check_range("max vertical speed", meters_per_second, VERTICAL_SPEED_RANGE)?;
        self.setting(CLS_SPEED_SETTINGS, CMD_MAX_VERTICAL_SPEED, meters_per_second)
            .await
    }

    /// Sets the rotation speed limit in degrees per second, accepted range
    /// 0 to 360.
    pub async fn set_max_rotation_speed(&self, degrees_per_second: f32) -> Result<()> {
        check_range("max rotation speed", degrees_per_second, ROTATION_SPEED_RANGE)?;
        self.setting(CLS_SPEED_SETTINGS, CMD_MAX_ROTATION_SPEED, degrees_per_second)
            .await
    }

    /// Enables or disables the motor cut-out on impact.
    pub async fn set_cut_out_mode(&self, enable: bool) -> Result<()> {
        self.command(CLS_SETTINGS, CMD_CUT_OUT_MODE, &[u8::from(enable)])
            .await
    }

    /// Sets both headlight intensities, 0 to 255 each.
    pub async fn headlights(&self, left: u8, right: u8) -> Result<()> {
        self.common(CLS_HEADLIGHTS, CMD_HEADLIGHTS, &[left, right]).await
    }

    /// Starts a headlight animation.
    pub async fn start_headlight_animation(&self, animation: HeadlightAnimation) -> Result<()> {
        self.common(
            CLS_COMMON_ANIMATIONS,
            CMD_ANIMATION_START,
            &(animation as u32).to_le_bytes(),
        )
        .await
    }

    /// Stops one headlight animation.
    pub async fn stop_headlight_animation(&self, animation: HeadlightAnimation) -> Result<()> {
        self.common(
            CLS_COMMON_ANIMATIONS,
            CMD_ANIMATION_STOP,
            &(animation as u32).to_le_bytes(),
        )
        .await
    }

    /// Stops every running headlight animation.
    pub async fn stop_headlight_animations(&self) -> Result<()> {
        self.common(CLS_COMMON_ANIMATIONS, CMD_ANIMATION_STOP_ALL, &[])
            .await
    }

    /// Synchronizes the vehicle clock, used to timestamp recorded media.
    ///
    /// Sends the date as `yyyy-MM-dd` and the time as `THHMMSSmmm`, each
    /// NUL terminated, in two frames.
    pub async fn set_date_time(&self, when: DateTime<Local>) -> Result<()> {
        let mut date = when.format("%Y-%m-%d").to_string().into_bytes();
        date.push(0);
        self.common(CLS_COMMON, CMD_CURRENT_DATE, &date).await?;

        let mut time = when.format("T%H%M%S%3f").to_string().into_bytes();
        time.push(0);
        self.common(CLS_COMMON, CMD_CURRENT_TIME, &time).await
    }

    /// Asks the vehicle to dump all its settings.
    pub async fn request_all_settings(&self) -> Result<()> {
        self.common(CLS_COMMON_SETTINGS, CMD_ALL_SETTINGS, &[]).await
    }

    /// Asks the vehicle to dump all its state.
    pub async fn request_all_states(&self) -> Result<()> {
        self.common(CLS_COMMON, CMD_ALL_STATES, &[]).await
    }
}
