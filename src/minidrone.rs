//! # Vehicle handle
//!
//! [`Minidrone`] ties the pieces together over one connected peripheral:
//! it discovers the GATT directory, subscribes to every notification
//! source, then runs three background tasks until disconnect. The drive
//! loop keeps the 25 ms piloting cadence, the dispatcher folds
//! notifications into the telemetry mirror, and the supervisor forces a
//! landing whenever the vehicle reports a motor cut-out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::{CommandEncoder, FlipDirection, HeadlightAnimation};
use crate::dispatch::{self, Inbound};
use crate::drive::{self, DriveParameter, DriveQueue, DRIVE_TICK};
use crate::error::{Error, Result};
use crate::ftp::{FtpEngine, FtpOp, DEFAULT_REQUEST_TIMEOUT};
use crate::gatt::{channel, BleAdapter, Directory, LinkWriter};
use crate::telemetry::{FlyingState, StateMirror, VehicleState};

/// Queue depth between the notification forwarders and the dispatcher.
const EVENT_QUEUE: usize = 64;

/// Channels the connection cannot work without.
const REQUIRED_CHANNELS: [u16; 4] = [
    channel::PILOTING,
    channel::COMMANDS,
    channel::EMERGENCY,
    channel::ACK_OUT,
];

/// Channels we subscribe to when present.
const NOTIFY_CHANNELS: [u16; 5] = [
    channel::DATA_NO_ACK,
    channel::DATA_WITH_ACK,
    channel::COMMAND_ACK,
    channel::LOW_LATENCY_ACK,
    channel::FTP_DATA,
];

/// Configures and opens a [`Minidrone`] session.
pub struct MinidroneBuilder {
    ftp_timeout: Duration,
}

impl MinidroneBuilder {
    /// Builder with default settings.
    pub fn new() -> Self {
        MinidroneBuilder {
            ftp_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Overrides the deadline applied to each media store request.
    pub fn ftp_timeout(mut self, timeout: Duration) -> Self {
        self.ftp_timeout = timeout;
        self
    }

    /// Builds the session on an already connected peripheral.
    ///
    /// Discovers the GATT directory, subscribes to the notification
    /// characteristics, starts the background tasks and requests the
    /// initial settings and state dumps.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] when a piloting channel is missing
    /// from the directory, or with a transport error from discovery or
    /// subscription. Missing notification characteristics only degrade
    /// the session and are logged instead.
    pub async fn connect(self, adapter: Arc<dyn BleAdapter>) -> Result<Minidrone> {
        let directory = Directory::from_entries(adapter.discover().await?);
        directory.require(&REQUIRED_CHANNELS)?;

        let link = Arc::new(LinkWriter::new(adapter.clone(), directory));
        let mirror = Arc::new(StateMirror::default());
        let queue = Arc::new(DriveQueue::default());
        let ftp = Arc::new(FtpEngine::new(link.clone(), self.ftp_timeout));
        let commands = Arc::new(CommandEncoder::new(link.clone(), mirror.clone()));
        let emergency = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);

        let mut tasks = Vec::new();
        for source in NOTIFY_CHANNELS {
            let endpoint = match link.directory().get(source) {
                Ok(endpoint) => endpoint.clone(),
                Err(_) => {
                    warn!("characteristic {source:04x} not present, its notifications are unavailable");
                    continue;
                }
            };
            let notifications = adapter
                .subscribe(&endpoint.service, &endpoint.characteristic)
                .await?;
            tasks.push(tokio::spawn(forward(
                source,
                notifications,
                events.clone(),
                shutdown_rx.clone(),
            )));
        }
        // the dispatcher sees a closed queue once every forwarder is gone
        drop(events);

        tasks.push(tokio::spawn(dispatch::run(
            events_rx,
            link.clone(),
            mirror.clone(),
            ftp.clone(),
            emergency.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(drive::run(
            queue.clone(),
            link.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(supervise(
            commands.clone(),
            emergency.clone(),
            shutdown_rx,
        )));

        let drone = Minidrone {
            commands,
            queue,
            ftp,
            mirror,
            shutdown,
            tasks,
        };
        drone.bootstrap().await;
        info!("session established");
        Ok(drone)
    }
}

impl Default for MinidroneBuilder {
    fn default() -> Self {
        MinidroneBuilder::new()
    }
}

/// Forwards notifications from one characteristic into the dispatcher
/// queue, tagging each with its source.
async fn forward(
    source: u16,
    mut notifications: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = notifications.recv() => match maybe {
                Some(data) => {
                    if events.send(Inbound { source, data }).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!("subscription {source:04x} closed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Issues one landing per emergency report.
///
/// The trigger coalesces reports that arrive while a landing is already
/// being written, so a burst of cut-out notifications produces a single
/// command.
async fn supervise(
    commands: Arc<CommandEncoder>,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = trigger.notified() => {
                warn!("forcing a landing after motor cut-out report");
                if let Err(err) = commands.landing().await {
                    warn!("emergency landing failed: {err}");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

fn check_intensity(value: i8) -> Result<()> {
    if !(-100..=100).contains(&value) {
        return Err(Error::InvalidParameter(format!(
            "intensity {value} out of range -100..100"
        )));
    }
    Ok(())
}

/// Drive ticks needed to cover `duration`, rounding up.
fn ticks_for(duration: Duration) -> usize {
    let tick = DRIVE_TICK.as_millis();
    (duration.as_millis().div_ceil(tick)) as usize
}

/// Handle to a connected vehicle.
///
/// Motion methods quantize their duration to the 25 ms drive tick and
/// return as soon as the parameters are queued; command methods resolve
/// once the frame has been written.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # async fn example(adapter: Arc<dyn minidrone::BleAdapter>) -> minidrone::Result<()> {
/// let drone = minidrone::Minidrone::connect(adapter).await?;
/// drone.take_off().await?;
/// drone.pitch(Duration::from_millis(500), 50)?;
/// drone.hover();
/// drone.landing().await?;
/// drone.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct Minidrone {
    commands: Arc<CommandEncoder>,
    queue: Arc<DriveQueue>,
    ftp: Arc<FtpEngine>,
    mirror: Arc<StateMirror>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Minidrone {
    /// Opens a session with default settings. See
    /// [`MinidroneBuilder::connect`].
    pub async fn connect(adapter: Arc<dyn BleAdapter>) -> Result<Self> {
        MinidroneBuilder::new().connect(adapter).await
    }

    /// Builder for sessions with non-default settings.
    pub fn builder() -> MinidroneBuilder {
        MinidroneBuilder::new()
    }

    async fn bootstrap(&self) {
        // settings, state and clock sync are best effort: an unanswered
        // dump leaves the mirror sparse but the session usable
        if let Err(err) = self.commands.request_all_settings().await {
            warn!("settings dump request failed: {err}");
        }
        if let Err(err) = self.commands.request_all_states().await {
            warn!("state dump request failed: {err}");
        }
        if let Err(err) = self.commands.set_date_time(Local::now()).await {
            warn!("clock sync failed: {err}");
        }
    }

    /// Snapshot of the last reported vehicle state.
    pub fn state(&self) -> VehicleState {
        self.mirror.snapshot()
    }

    /// Battery charge in percent, zero until first reported.
    pub fn battery(&self) -> u8 {
        self.mirror.snapshot().battery
    }

    /// Current flight phase.
    pub fn flying_state(&self) -> FlyingState {
        self.mirror.snapshot().flying_state
    }

    /// Calibrates the horizontal reference while on a flat surface.
    pub async fn flat_trim(&self) -> Result<()> {
        self.commands.flat_trim().await
    }

    /// Spins up and climbs to hover altitude.
    pub async fn take_off(&self) -> Result<()> {
        self.commands.take_off().await
    }

    /// Descends and stops the motors.
    pub async fn landing(&self) -> Result<()> {
        self.commands.landing().await
    }

    /// Cuts the motors immediately. Fire and forget; failures are logged.
    pub async fn emergency(&self) {
        self.commands.emergency().await;
    }

    /// Arms or disarms automatic take-off on throw.
    pub async fn set_auto_take_off(&self, enable: bool) -> Result<()> {
        self.commands.set_auto_take_off(enable).await
    }

    /// Performs an aerobatic flip.
    pub async fn flip(&self, direction: FlipDirection) -> Result<()> {
        self.commands.flip(direction).await
    }

    /// Takes a picture with the downward camera.
    pub async fn take_picture(&self) -> Result<()> {
        self.commands.take_picture().await
    }

    /// Sets the altitude ceiling in meters, range 2.6 to 10.0.
    pub async fn set_max_altitude(&self, meters: f32) -> Result<()> {
        self.commands.set_max_altitude(meters).await
    }

    /// Sets the tilt limit in degrees, range 5 to 25.
    pub async fn set_max_tilt(&self, degrees: f32) -> Result<()> {
        self.commands.set_max_tilt(degrees).await
    }

    /// Sets the vertical speed limit in meters per second, range 0.5 to 2.
    pub async fn set_max_vertical_speed(&self, meters_per_second: f32) -> Result<()> {
        self.commands.set_max_vertical_speed(meters_per_second).await
    }

    /// Sets the rotation speed limit in degrees per second, range 0 to 360.
    pub async fn set_max_rotation_speed(&self, degrees_per_second: f32) -> Result<()> {
        self.commands.set_max_rotation_speed(degrees_per_second).await
    }

    /// Enables or disables the motor cut-out on impact.
    pub async fn set_cut_out_mode(&self, enable: bool) -> Result<()> {
        self.commands.set_cut_out_mode(enable).await
    }

    /// Sets both headlight intensities.
    pub async fn headlights(&self, left: u8, right: u8) -> Result<()> {
        self.commands.headlights(left, right).await
    }

    /// Starts a headlight animation.
    pub async fn start_headlight_animation(&self, animation: HeadlightAnimation) -> Result<()> {
        self.commands.start_headlight_animation(animation).await
    }

    /// Stops one headlight animation.
    pub async fn stop_headlight_animation(&self, animation: HeadlightAnimation) -> Result<()> {
        self.commands.stop_headlight_animation(animation).await
    }

    /// Stops every running headlight animation.
    pub async fn stop_headlight_animations(&self) -> Result<()> {
        self.commands.stop_headlight_animations().await
    }

    /// Sets the vehicle clock, used to timestamp recorded media.
    pub async fn set_date_time(&self, when: DateTime<Local>) -> Result<()> {
        self.commands.set_date_time(when).await
    }

    fn motion(&self, duration: Duration, param: DriveParameter) -> Result<()> {
        check_intensity(param.roll)?;
        check_intensity(param.pitch)?;
        check_intensity(param.yaw)?;
        check_intensity(param.gaz)?;
        self.queue.push(param, ticks_for(duration));
        Ok(())
    }

    /// Queues combined motion: one parameter carrying all four axes, each
    /// intensity a percent from -100 to 100. A climbing right roll is
    /// `drive(d, 50, 0, 0, 50)`; the single-axis helpers are shorthands
    /// for this.
    pub fn drive(&self, duration: Duration, roll: i8, pitch: i8, yaw: i8, gaz: i8) -> Result<()> {
        self.motion(duration, DriveParameter::motion(roll, pitch, yaw, gaz))
    }

    /// Rolls right (positive) or left (negative) at `intensity` percent
    /// for `duration`.
    pub fn roll(&self, duration: Duration, intensity: i8) -> Result<()> {
        self.motion(duration, DriveParameter::motion(intensity, 0, 0, 0))
    }

    /// Pitches forward (positive) or backward (negative) at `intensity`
    /// percent for `duration`.
    pub fn pitch(&self, duration: Duration, intensity: i8) -> Result<()> {
        self.motion(duration, DriveParameter::motion(0, intensity, 0, 0))
    }

    /// Turns clockwise (positive) or counterclockwise (negative) at
    /// `intensity` percent for `duration`.
    pub fn yaw(&self, duration: Duration, intensity: i8) -> Result<()> {
        self.motion(duration, DriveParameter::motion(0, 0, intensity, 0))
    }

    /// Climbs (positive) or descends (negative) at `intensity` percent
    /// for `duration`.
    pub fn gaz(&self, duration: Duration, intensity: i8) -> Result<()> {
        self.motion(duration, DriveParameter::motion(0, 0, 0, intensity))
    }

    /// Queues a single neutral parameter behind whatever is pending.
    pub fn hover(&self) {
        self.queue.push(DriveParameter::hover(), 1);
    }

    /// Cancels pending motion: drops the queue and levels out on the next
    /// tick.
    pub fn stop(&self) {
        self.queue.replace(DriveParameter::hover());
    }

    /// Turns continuous replay of the last piloting parameter on or off.
    ///
    /// With replay on, the vehicle keeps its current motion between
    /// queued parameters instead of leveling out.
    pub fn set_continuous_mode(&self, on: bool) {
        self.queue.set_continuous(on);
    }

    /// Lists the media directory at `path`.
    pub async fn list_media(&self, path: &str) -> Result<String> {
        let listing = self.ftp.request(FtpOp::List, path, None).await?;
        Ok(String::from_utf8_lossy(&listing).into_owned())
    }

    /// Downloads the file at `path`, verifying its digest.
    pub async fn download_media(&self, path: &str) -> Result<Vec<u8>> {
        self.ftp.request(FtpOp::Get, path, None).await
    }

    /// Downloads the file at `path`, reporting the cumulative byte count
    /// to `progress` as chunks arrive.
    pub async fn download_media_with_progress<F>(&self, path: &str, progress: F) -> Result<Vec<u8>>
    where
        F: FnMut(usize) + Send + 'static,
    {
        self.ftp
            .request(FtpOp::Get, path, Some(Box::new(progress)))
            .await
    }

    /// Deletes the file at `path`, returning the vehicle's confirmation
    /// message.
    pub async fn delete_media(&self, path: &str) -> Result<String> {
        let message = self.ftp.request(FtpOp::Delete, path, None).await?;
        Ok(String::from_utf8_lossy(&message).into_owned())
    }

    /// Stops the background tasks and releases the session.
    ///
    /// Nothing is written to the vehicle after this resolves; land first.
    pub async fn disconnect(mut self) -> Result<()> {
        debug!("shutting down");
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!("background task ended abnormally: {err}");
            }
        }
        info!("disconnected");
        Ok(())
    }
}
