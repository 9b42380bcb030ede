//! End-to-end flows over a scripted peripheral.
//!
//! The adapter below stands in for a connected vehicle: it records every
//! write by characteristic and lets a test inject notifications, so whole
//! sessions run through the public surface only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::sleep;

use minidrone::frame::{Frame, FrameType};
use minidrone::gatt::{channel, expand_uuid, short_code, BleAdapter};
use minidrone::telemetry::FlyingState;
use minidrone::{Minidrone, Result};

struct ScriptedVehicle {
    writes: Mutex<Vec<(u16, Vec<u8>)>>,
    senders: Mutex<HashMap<u16, mpsc::Sender<Vec<u8>>>>,
}

impl ScriptedVehicle {
    fn new() -> Arc<Self> {
        Arc::new(ScriptedVehicle {
            writes: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
        })
    }

    fn writes_to(&self, target: u16) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(code, _)| *code == target)
            .map(|(_, data)| data.clone())
            .collect()
    }

    async fn notify(&self, source: u16, data: Vec<u8>) {
        let sender = self.senders.lock().unwrap().get(&source).cloned();
        sender.unwrap().send(data).await.unwrap();
    }

    async fn notify_frame(&self, source: u16, project: u8, class: u8, command: u16, payload: &[u8]) {
        let frame = Frame {
            frame_type: FrameType::Data,
            sequence: 0,
            project,
            class,
            command,
            payload: payload.to_vec(),
        };
        self.notify(source, frame.encode()).await;
    }
}

#[async_trait]
impl BleAdapter for ScriptedVehicle {
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
        if let Some(code) = short_code(characteristic) {
            self.writes.lock().unwrap().push((code, data.to_vec()));
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
        let (tx, rx) = mpsc::channel(32);
        if let Some(code) = short_code(characteristic) {
            self.senders.lock().unwrap().insert(code, tx);
        }
        Ok(rx)
    }
}

fn chunk(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![tag];
    bytes.extend_from_slice(payload);
    bytes
}

#[tokio::test]
async fn connect_bootstraps_then_commands_continue_the_sequence() {
    let vehicle = ScriptedVehicle::new();
    let drone = Minidrone::connect(vehicle.clone()).await.unwrap();

    // settings dump, state dump, date, time
    let commands = vehicle.writes_to(channel::COMMANDS);
    assert_eq!(commands.len(), 4);
    assert_eq!(&commands[0][2..6], &[0x00, 0x02, 0x00, 0x00]);
    assert_eq!(&commands[1][2..6], &[0x00, 0x04, 0x00, 0x00]);
    assert_eq!(&commands[2][2..6], &[0x00, 0x04, 0x01, 0x00]);
    assert_eq!(&commands[3][2..6], &[0x00, 0x04, 0x02, 0x00]);

    drone.take_off().await.unwrap();
    let commands = vehicle.writes_to(channel::COMMANDS);
    assert_eq!(commands[4], vec![0x04, 0x04, 0x02, 0x00, 0x01, 0x00]);

    drone.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn queued_motion_flows_at_the_drive_cadence() {
    let vehicle = ScriptedVehicle::new();
    let drone = Minidrone::connect(vehicle.clone()).await.unwrap();

    drone.pitch(Duration::from_millis(100), 50).unwrap();
    sleep(Duration::from_millis(130)).await;

    // 100 ms of motion is four 25 ms ticks
    let piloting = vehicle.writes_to(channel::PILOTING);
    assert_eq!(piloting.len(), 4);
    for frame in &piloting {
        assert_eq!(frame.len(), 15);
        assert_eq!(&frame[2..6], &[0x02, 0x00, 0x02, 0x00]);
        assert_eq!(frame[6], 1);
        assert_eq!(frame[8], 50);
    }

    drone.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn combined_axis_drive_shares_one_frame() {
    let vehicle = ScriptedVehicle::new();
    let drone = Minidrone::connect(vehicle.clone()).await.unwrap();

    // climbing right roll: both axes must ride in the same pcmd
    drone.drive(Duration::from_millis(100), 50, 0, 0, 50).unwrap();
    sleep(Duration::from_millis(130)).await;

    let piloting = vehicle.writes_to(channel::PILOTING);
    assert_eq!(piloting.len(), 4);
    for frame in &piloting {
        assert_eq!(frame[6], 1);
        assert_eq!(frame[7], 50);
        assert_eq!(frame[8], 0);
        assert_eq!(frame[9], 0);
        assert_eq!(frame[10], 50);
    }

    drone.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn notifications_update_the_telemetry_mirror() {
    let vehicle = ScriptedVehicle::new();
    let drone = Minidrone::connect(vehicle.clone()).await.unwrap();

    vehicle
        .notify_frame(channel::DATA_NO_ACK, 0x00, 0x05, 0x01, &[87])
        .await;
    vehicle
        .notify_frame(channel::DATA_NO_ACK, 0x02, 0x03, 0x01, &2u32.to_le_bytes())
        .await;
    sleep(Duration::from_millis(10)).await;

    assert_eq!(drone.battery(), 87);
    assert_eq!(drone.flying_state(), FlyingState::Hovering);

    drone.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn acknowledged_notifications_are_acked_back() {
    let vehicle = ScriptedVehicle::new();
    let drone = Minidrone::connect(vehicle.clone()).await.unwrap();

    let frame = Frame {
        frame_type: FrameType::DataWithAck,
        sequence: 0x21,
        project: 0x00,
        class: 0x05,
        command: 0x01,
        payload: vec![44],
    };
    vehicle.notify(channel::DATA_WITH_ACK, frame.encode()).await;
    sleep(Duration::from_millis(10)).await;

    assert_eq!(drone.battery(), 44);
    assert_eq!(
        vehicle.writes_to(channel::ACK_OUT),
        vec![vec![0x01, 0x00, 0x21]]
    );

    drone.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cut_out_report_forces_one_landing() {
    let vehicle = ScriptedVehicle::new();
    let drone = Minidrone::connect(vehicle.clone()).await.unwrap();

    vehicle
        .notify_frame(channel::DATA_NO_ACK, 0x02, 0x03, 0x01, &5u32.to_le_bytes())
        .await;
    sleep(Duration::from_millis(10)).await;

    assert_eq!(drone.flying_state(), FlyingState::Emergency);
    let landings: Vec<_> = vehicle
        .writes_to(channel::COMMANDS)
        .into_iter()
        .filter(|frame| frame[2..6] == [0x02, 0x00, 0x03, 0x00])
        .collect();
    assert_eq!(landings.len(), 1);

    drone.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn media_listing_round_trip() {
    let vehicle = ScriptedVehicle::new();
    let drone = Minidrone::connect(vehicle.clone()).await.unwrap();
    let digest = format!("{:x}", md5::compute(b"img_001.jpg\n"));

    let (listing, ()) = tokio::join!(drone.list_media("/media"), async {
        tokio::task::yield_now().await;
        vehicle
            .notify(channel::FTP_DATA, chunk(0x03, b"img_001.jpg\n"))
            .await;
        vehicle
            .notify(channel::FTP_DATA, chunk(0x01, digest.as_bytes()))
            .await;
    });

    assert_eq!(listing.unwrap(), "img_001.jpg\n");
    assert_eq!(
        vehicle.writes_to(channel::FTP_CONTROL),
        vec![chunk(0x03, b"LIS/media\0")]
    );

    drone.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn disconnect_silences_the_link() {
    let vehicle = ScriptedVehicle::new();
    let drone = Minidrone::connect(vehicle.clone()).await.unwrap();

    drone.yaw(Duration::from_millis(50), 30).unwrap();
    sleep(Duration::from_millis(60)).await;
    assert!(!vehicle.writes_to(channel::PILOTING).is_empty());

    drone.disconnect().await.unwrap();

    let recorded = vehicle.writes.lock().unwrap().len();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(vehicle.writes.lock().unwrap().len(), recorded);
}
