//! Browses the picture store of a simulated vehicle.
//!
//! The simulator answers the FTP-like exchange the way a real vehicle
//! does: chunked responses, MD5 digests after every payload and a
//! `Delete successful` confirmation. Listing, download with progress and
//! deletion all run against it.
//!
//! Run with: cargo run --example media_list

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use minidrone::gatt::{channel, expand_uuid, short_code, BleAdapter};
use minidrone::{Minidrone, Result};

const MEDIA_DIR: &str = "/internal_000/Rolling_Spider/media";

fn listing() -> String {
    "photo_20260823_101502.jpg\nphoto_20260823_101617.jpg\nphoto_20260823_102244.jpg\n"
        .to_string()
}

fn photo_bytes() -> Vec<u8> {
    // a recognizable header followed by filler
    let mut bytes = b"\xff\xd8\xff\xe0JFIF\0".to_vec();
    bytes.extend((0..600u16).map(|i| (i % 251) as u8));
    bytes
}

/// Splits payload bytes into tagged response chunks of at most twenty
/// bytes, the way the vehicle does.
fn response_chunks(payload: &[u8]) -> Vec<Vec<u8>> {
    let pieces: Vec<&[u8]> = payload.chunks(19).collect();
    let last = pieces.len() - 1;
    pieces
        .iter()
        .enumerate()
        .map(|(index, piece)| {
            let tag = match (index, last) {
                (0, 0) => 3u8,
                (0, _) => 2,
                (index, last) if index == last => 1,
                _ => 0,
            };
            let mut chunk = vec![tag];
            chunk.extend_from_slice(piece);
            chunk
        })
        .collect()
}

fn digest_chunks(payload: &[u8]) -> Vec<Vec<u8>> {
    let labelled = format!("MD5{:x}", md5::compute(payload));
    response_chunks(labelled.as_bytes())
}

struct SimulatedStore {
    senders: Mutex<HashMap<u16, mpsc::Sender<Vec<u8>>>>,
    request: Mutex<Vec<u8>>,
    /// Payload of the download in flight, for the closing digest.
    serving: Mutex<Option<Vec<u8>>>,
}

impl SimulatedStore {
    fn new() -> Arc<Self> {
        Arc::new(SimulatedStore {
            senders: Mutex::new(HashMap::new()),
            request: Mutex::new(Vec::new()),
            serving: Mutex::new(None),
        })
    }

    async fn respond(&self, chunks: Vec<Vec<u8>>) {
        let sender = self
            .senders
            .lock()
            .unwrap()
            .get(&channel::FTP_DATA)
            .cloned();
        if let Some(sender) = sender {
            for chunk in chunks {
                let _ = sender.send(chunk).await;
            }
        }
    }

    async fn handle_request(&self, request: &[u8]) {
        let text = match request.iter().position(|b| *b == 0) {
            Some(end) => &request[..end],
            None => request,
        };

        if let Some(_path) = text.strip_prefix(b"LIS") {
            let payload = listing().into_bytes();
            let mut chunks = response_chunks(&payload);
            chunks.push(b"\x03End of Transfer".to_vec());
            chunks.extend(digest_chunks(&payload));
            self.respond(chunks).await;
        } else if let Some(_path) = text.strip_prefix(b"GET") {
            let payload = photo_bytes();
            let mut chunks = response_chunks(&payload);
            chunks.extend(digest_chunks(&payload));
            *self.serving.lock().unwrap() = Some(payload);
            self.respond(chunks).await;
        } else if let Some(_path) = text.strip_prefix(b"DEL") {
            self.respond(vec![b"\x03Delete successful".to_vec()]).await;
        } else if text == b"MD5 OK" {
            // close the confirmed download
            let served = self.serving.lock().unwrap().take();
            if let Some(payload) = served {
                let mut chunks = vec![b"\x03End of Transfer".to_vec()];
                chunks.extend(digest_chunks(&payload));
                self.respond(chunks).await;
            }
        }
    }
}

#[async_trait]
impl BleAdapter for SimulatedStore {
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
        if short_code(characteristic) != Some(channel::FTP_CONTROL) {
            return Ok(());
        }
        let Some((tag, payload)) = data.split_first() else {
            return Ok(());
        };

        // reassemble the tagged request chunks
        let complete = {
            let mut request = self.request.lock().unwrap();
            match tag {
                2 => {
                    *request = payload.to_vec();
                    None
                }
                0 => {
                    request.extend_from_slice(payload);
                    None
                }
                1 => {
                    request.extend_from_slice(payload);
                    Some(std::mem::take(&mut *request))
                }
                _ => Some(payload.to_vec()),
            }
        };
        if let Some(request) = complete {
            self.handle_request(&request).await;
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

    let store = SimulatedStore::new();
    let drone = Minidrone::connect(store.clone()).await?;

    println!("Listing {MEDIA_DIR}");
    let media = drone.list_media(MEDIA_DIR).await?;
    for name in media.lines() {
        println!("  {name}");
    }

    let first = media.lines().next().unwrap_or("photo.jpg");
    let path = format!("{MEDIA_DIR}/{first}");
    println!("Downloading {path}");
    let photo = drone
        .download_media_with_progress(&path, |received| {
            print!("\r  {received} bytes");
            let _ = std::io::stdout().flush();
        })
        .await?;
    println!("\r  {} bytes, digest verified", photo.len());

    println!("Deleting {path}");
    let confirmation = drone.delete_media(&path).await?;
    println!("  {confirmation}");

    drone.disconnect().await?;
    Ok(())
}
