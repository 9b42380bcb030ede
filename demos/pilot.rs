//! Flies a short pattern against a simulated vehicle.
//!
//! The simulator stands in for a powered-on minidrone: it answers the
//! state dumps, walks the flying state machine on take-off and landing,
//! and counts the piloting frames the drive loop produces. Swap it for a
//! real `BleAdapter` implementation to fly hardware.
//!
//! Run with: cargo run --example pilot

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use minidrone::gatt::{channel, expand_uuid, short_code, BleAdapter};
use minidrone::{FlipDirection, Frame, FrameType, Minidrone, Result};

struct SimulatedVehicle {
    senders: Mutex<HashMap<u16, mpsc::Sender<Vec<u8>>>>,
    piloting_frames: Mutex<usize>,
}

impl SimulatedVehicle {
    fn new() -> Arc<Self> {
        Arc::new(SimulatedVehicle {
            senders: Mutex::new(HashMap::new()),
            piloting_frames: Mutex::new(0),
        })
    }

    fn piloting_frames(&self) -> usize {
        *self.piloting_frames.lock().unwrap()
    }

    async fn notify(&self, source: u16, data: Vec<u8>) {
        let sender = self.senders.lock().unwrap().get(&source).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(data).await;
        }
    }

    async fn notify_state(&self, project: u8, class: u8, command: u16, payload: &[u8]) {
        let frame = Frame {
            frame_type: FrameType::Data,
            sequence: 0,
            project,
            class,
            command,
            payload: payload.to_vec(),
        };
        self.notify(channel::DATA_NO_ACK, frame.encode()).await;
    }

    async fn react(&self, frame: &Frame) {
        match (frame.project, frame.class, frame.command) {
            // take-off: taking off, then hovering
            (0x02, 0x00, 0x0001) => {
                self.notify_state(0x02, 0x03, 0x0001, &1u32.to_le_bytes()).await;
                self.notify_state(0x02, 0x03, 0x0001, &2u32.to_le_bytes()).await;
            }
            // landing: landing, then landed
            (0x02, 0x00, 0x0003) => {
                self.notify_state(0x02, 0x03, 0x0001, &4u32.to_le_bytes()).await;
                self.notify_state(0x02, 0x03, 0x0001, &0u32.to_le_bytes()).await;
            }
            // state dump: battery and landed state
            (0x00, 0x04, 0x0000) => {
                self.notify_state(0x00, 0x05, 0x0001, &[98]).await;
                self.notify_state(0x02, 0x03, 0x0001, &0u32.to_le_bytes()).await;
                self.notify_state(0x00, 0x05, 0x0000, &[]).await;
            }
            // settings dump: product name
            (0x00, 0x02, 0x0000) => {
                self.notify_state(0x00, 0x03, 0x0002, b"Travis\0").await;
                self.notify_state(0x00, 0x03, 0x0000, &[]).await;
            }
            _ => {}
        }
    }
}

#[async_trait]
impl BleAdapter for SimulatedVehicle {
    async fn discover(&self) -> Result<Vec<(String, String)>> {
        let layout = [
            (0xfa00u16, 0xfa0au16),
            (0xfa00, 0xfa0b),
            (0xfa00, 0xfa0c),
            (0xfa00, 0xfa1e),
            (0xfb00, 0xfb0e),
            (0xfb00, 0xfb0f),
            (0xfb00, 0xfb1b),
            (0xfb00, 0xfb1c),
            (0xfd21, 0xfd23),
            (0xfd21, 0xfd24),
        ];
        Ok(layout
            .into_iter()
            .map(|(service, characteristic)| (expand_uuid(service), expand_uuid(characteristic)))
            .collect())
    }

    async fn write(
        &self,
        _service: &str,
        characteristic: &str,
        data: &[u8],
        _with_response: bool,
    ) -> Result<()> {
        match short_code(characteristic) {
            Some(channel::PILOTING) => *self.piloting_frames.lock().unwrap() += 1,
            Some(channel::COMMANDS) => {
                if let Ok(frame) = Frame::decode(data) {
                    self.react(&frame).await;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn read(&self, _service: &str, _characteristic: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn subscribe(
        &self,
        _service: &str,
        characteristic: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(16);
        if let Some(code) = short_code(characteristic) {
            self.senders.lock().unwrap().insert(code, tx);
        }
        Ok(rx)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let vehicle = SimulatedVehicle::new();
    let drone = Minidrone::connect(vehicle.clone()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = drone.state();
    println!(
        "Connected to {} (battery {}%)",
        if state.product_name.is_empty() {
            "unknown vehicle"
        } else {
            state.product_name.as_str()
        },
        state.battery
    );

    drone.flat_trim().await?;
    drone.take_off().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("Flying state: {:?}", drone.flying_state());

    println!("Flying a small square...");
    for _ in 0..2 {
        drone.pitch(Duration::from_millis(250), 40)?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        drone.roll(Duration::from_millis(250), 40)?;
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    println!("Climbing to the right...");
    drone.drive(Duration::from_millis(250), 40, 0, 0, 30)?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    drone.stop();

    println!("Flip!");
    drone.flip(FlipDirection::Front).await?;

    drone.landing().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("Flying state: {:?}", drone.flying_state());
    println!("Piloting frames sent: {}", vehicle.piloting_frames());

    drone.disconnect().await?;
    Ok(())
}
