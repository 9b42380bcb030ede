//! # Piloting drive loop
//!
//! The vehicle holds attitude only while piloting frames keep arriving, so
//! a dedicated task writes one frame every 25 ms. Motion commands do not
//! write directly; they enqueue [`DriveParameter`]s and the loop drains the
//! queue one parameter per tick.
//!
//! Two safeguards shape the tick when the queue is empty: with continuous
//! mode on, the last transmitted parameter is repeated, which holds the
//! current motion; with it off, six empty ticks in a row produce a single
//! neutral hover frame so a starved vehicle levels out instead of drifting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use crate::commands::{CLS_PILOTING, CMD_PCMD, PROJECT_MINIDRONE};
use crate::frame::FrameType;
use crate::gatt::{channel, LinkWriter};

/// Interval between piloting frames.
pub(crate) const DRIVE_TICK: Duration = Duration::from_millis(25);

/// Empty ticks tolerated before a neutral hover frame is substituted.
const STALL_TICKS: u32 = 6;

/// One tick's worth of piloting input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveParameter {
    /// Whether the roll and pitch values should be honored. An inactive
    /// parameter occupies its tick without producing a frame.
    pub active: bool,
    /// Roll and pitch activation flag sent to the vehicle, 0 or 1.
    pub flag: u8,
    /// Roll, -100 to 100.
    pub roll: i8,
    /// Pitch, -100 to 100.
    pub pitch: i8,
    /// Yaw rotation speed, -100 to 100.
    pub yaw: i8,
    /// Vertical speed, -100 to 100.
    pub gaz: i8,
}

impl DriveParameter {
    /// Neutral parameter: level attitude, no motion.
    pub fn hover() -> Self {
        DriveParameter {
            active: true,
            flag: 0,
            roll: 0,
            pitch: 0,
            yaw: 0,
            gaz: 0,
        }
    }

    /// Parameter with the roll/pitch flag raised.
    pub fn motion(roll: i8, pitch: i8, yaw: i8, gaz: i8) -> Self {
        DriveParameter {
            active: true,
            flag: 1,
            roll,
            pitch,
            yaw,
            gaz,
        }
    }
}

#[derive(Default)]
struct QueueState {
    params: VecDeque<DriveParameter>,
    continuous: bool,
}

/// Parameter queue shared between callers and the drive loop.
///
/// The lock is held only for queue surgery, never across a write.
#[derive(Default)]
pub(crate) struct DriveQueue {
    state: Mutex<QueueState>,
}

impl DriveQueue {
    /// Appends `copies` copies of `param`.
    pub fn push(&self, param: DriveParameter, copies: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..copies {
            state.params.push_back(param);
        }
    }

    /// Drops everything pending and enqueues `param` once.
    pub fn replace(&self, param: DriveParameter) {
        let mut state = self.state.lock().unwrap();
        state.params.clear();
        state.params.push_back(param);
    }

    /// Turns continuous replay of the last transmitted parameter on or off.
    pub fn set_continuous(&self, on: bool) {
        self.state.lock().unwrap().continuous = on;
    }

    /// Whether continuous replay is on.
    pub fn continuous(&self) -> bool {
        self.state.lock().unwrap().continuous
    }

    /// Pops the oldest parameter together with the continuous flag, in one
    /// critical section.
    fn pop(&self) -> (Option<DriveParameter>, bool) {
        let mut state = self.state.lock().unwrap();
        (state.params.pop_front(), state.continuous)
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.state.lock().unwrap().params.len()
    }
}

/// Serializes one parameter into a piloting payload.
///
/// Layout: flag, roll, pitch, yaw and gaz as single bytes, then the
/// milliseconds since the loop started as u32 little endian.
fn encode_pcmd(param: &DriveParameter, elapsed_ms: u32) -> [u8; 9] {
    let mut payload = [0u8; 9];
    payload[0] = param.flag;
    payload[1] = param.roll as u8;
    payload[2] = param.pitch as u8;
    payload[3] = param.yaw as u8;
    payload[4] = param.gaz as u8;
    payload[5..9].copy_from_slice(&elapsed_ms.to_le_bytes());
    payload
}

/// Runs the 25 ms piloting loop until `shutdown` fires.
///
/// Transport failures are logged and the cadence continues; only shutdown
/// stops the loop, and nothing is written after it.
pub(crate) async fn run(
    queue: Arc<DriveQueue>,
    link: Arc<LinkWriter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut ticker = interval_at(started + DRIVE_TICK, DRIVE_TICK);
    let mut last_sent = DriveParameter::hover();
    let mut empty_ticks = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (popped, continuous) = queue.pop();
                let param = match popped {
                    Some(param) => {
                        empty_ticks = 0;
                        param
                    }
                    None if continuous => last_sent,
                    None => {
                        empty_ticks += 1;
                        if empty_ticks < STALL_TICKS {
                            continue;
                        }
                        empty_ticks = 0;
                        DriveParameter::hover()
                    }
                };

                if !param.active {
                    continue;
                }
                last_sent = param;

                let elapsed_ms = started.elapsed().as_millis() as u32;
                let payload = encode_pcmd(&param, elapsed_ms);
                let written = link
                    .write_frame(
                        channel::PILOTING,
                        FrameType::Data,
                        PROJECT_MINIDRONE,
                        CLS_PILOTING,
                        CMD_PCMD,
                        &payload,
                    )
                    .await;
                if let Err(err) = written {
                    warn!("piloting write failed: {err}");
                }
            }
            _ = shutdown.changed() => {
                debug!("drive loop stopping");
                break;
            }
        }
    }
}
