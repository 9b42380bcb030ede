// Shared in-memory BLE adapter for unit tests. Integration tests under
// tests/ carry their own copy since this module is crate private.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::gatt::{channel, expand_uuid, short_code, BleAdapter, Directory};

#[derive(Clone)]
pub(crate) struct RecordedWrite {
    pub service: String,
    pub characteristic: String,
    pub data: Vec<u8>,
    pub with_response: bool,
}

/// Adapter that records writes and lets tests inject notifications.
pub(crate) struct RecordingAdapter {
    available: Vec<(String, String)>,
    writes: Mutex<Vec<RecordedWrite>>,
    senders: Mutex<HashMap<u16, mpsc::Sender<Vec<u8>>>>,
    fail_writes: AtomicBool,
}

impl RecordingAdapter {
    pub fn new() -> Arc<Self> {
        Self::with_entries(Self::entries())
    }

    /// Adapter reporting only the given characteristics.
    pub fn with_entries(available: Vec<(String, String)>) -> Arc<Self> {
        Arc::new(RecordingAdapter {
            available,
            writes: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// The full protocol characteristic set this adapter reports.
    pub fn entries() -> Vec<(String, String)> {
        let services = [
            (0xfa00u16, vec![channel::PILOTING, channel::COMMANDS, channel::EMERGENCY, channel::ACK_OUT]),
            (0xfb00, vec![channel::DATA_NO_ACK, channel::DATA_WITH_ACK, channel::COMMAND_ACK, channel::LOW_LATENCY_ACK]),
            (0xfd21, vec![channel::FTP_DATA, channel::FTP_CONTROL]),
        ];

        services
            .into_iter()
            .flat_map(|(service, characteristics)| {
                characteristics
                    .into_iter()
                    .map(move |c| (expand_uuid(service), expand_uuid(c)))
            })
            .collect()
    }

    pub fn directory(&self) -> Directory {
        Directory::from_entries(self.available.clone())
    }

    /// When set, every write fails with a transport error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<RecordedWrite> {
        self.writes.lock().unwrap().clone()
    }

    /// Payloads of all writes that hit the characteristic with `short` code.
    pub fn writes_to(&self, short: u16) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|w| short_code(&w.characteristic) == Some(short))
            .map(|w| w.data.clone())
            .collect()
    }

    /// Delivers a notification to whoever subscribed to `short`.
    pub async fn notify(&self, short: u16, data: Vec<u8>) {
        let sender = self.senders.lock().unwrap().get(&short).cloned();
        if let Some(sender) = sender {
            sender.send(data).await.unwrap();
        }
    }
}

#[async_trait]
impl BleAdapter for RecordingAdapter {
    async fn discover(&self) -> Result<Vec<(String, String)>> {
        Ok(self.available.clone())
    }

    async fn write(
        &self,
        service: &str,
        characteristic: &str,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Transport("write refused".to_string()));
        }
        self.writes.lock().unwrap().push(RecordedWrite {
            service: service.to_string(),
            characteristic: characteristic.to_string(),
            data: data.to_vec(),
            with_response,
        });
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
