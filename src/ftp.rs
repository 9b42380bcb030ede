//! # Media store transfers
//!
//! The vehicle exposes its picture store through a tiny FTP-like exchange
//! on two characteristics: requests go out on the control characteristic,
//! responses come back as notifications on the data characteristic.
//!
//! A request is ASCII text, `LIS`, `GET` or `DEL` followed by a path and a
//! NUL, split into chunks of at most twenty bytes. The first byte of every
//! chunk is a tag describing its position: `2` opens a multi chunk
//! message, `0` continues it, `1` closes it and `3` stands alone.
//!
//! Responses interleave payload chunks with ASCII control messages
//! (`error..`, `Delete successful..`, `End of Transfer`) and always close
//! with an MD5 digest of the payload, which this engine verifies before a
//! result is released. Downloads confirm the digest back to the vehicle
//! with a `MD5 OK` message before the final transfer end arrives.
//!
//! One request is in flight at a time; the next caller waits for the
//! previous exchange to finish or time out.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::gatt::{channel, LinkWriter};

/// Command text bytes per request chunk; one tag byte precedes them.
const CHUNK_DATA: usize = 19;

// Chunk position tags
const TAG_MIDDLE: u8 = 0x00;
const TAG_FINAL: u8 = 0x01;
const TAG_FIRST: u8 = 0x02;
const TAG_SINGLE: u8 = 0x03;

// Control messages sent by the vehicle
const MARKER_ERROR: &[u8] = b"error";
const MARKER_DELETE_OK: &[u8] = b"Delete successful";
const MARKER_TRANSFER_END: &[u8] = b"End of Transfer";
const MARKER_DIGEST: &[u8] = b"MD5";

/// Digest confirmation we send back during a download.
const DIGEST_ACK: &[u8] = b"MD5 OK";

/// Deadline applied to a whole request when the builder does not override
/// it.
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback fed the cumulative number of payload bytes received.
pub(crate) type ProgressFn = Box<dyn FnMut(usize) + Send>;

/// The request kinds of the exchange.
///
/// `DigestAck` never starts a request; it is the continuation a download
/// switches to once it has confirmed the file digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FtpOp {
    /// Directory listing.
    #[default]
    List,
    /// File download.
    Get,
    /// File deletion.
    Delete,
    /// `MD5 OK` confirmation during a download.
    DigestAck,
}

impl FtpOp {
    fn prefix(self) -> &'static [u8] {
        match self {
            FtpOp::List => b"LIS",
            FtpOp::Get => b"GET",
            FtpOp::Delete => b"DEL",
            FtpOp::DigestAck => DIGEST_ACK,
        }
    }
}

/// Where the exchange currently stands.
///
/// Each variant carries exactly the data that stage needs, so a stale
/// buffer cannot leak into the next request.
enum Stage {
    /// No request pending; chunks are logged and dropped.
    Idle,
    /// Accumulating payload chunks.
    Receiving {
        buffer: Vec<u8>,
    },
    /// Payload complete, accumulating the digest the vehicle reports.
    AwaitingRemoteDigest {
        result: Vec<u8>,
        local_digest: String,
        remote: Vec<u8>,
    },
    /// Download confirmed its digest, waiting for `End of Transfer`.
    AwaitingTransferEnd {
        result: Vec<u8>,
        local_digest: String,
    },
}

impl Default for Stage {
    fn default() -> Self {
        Stage::Idle
    }
}

/// What the dispatcher should do after a chunk was folded in.
enum Action {
    Nothing,
    /// Report the cumulative download size to the progress callback.
    Progress(usize),
    /// Write the `MD5 OK` confirmation.
    SendDigestAck,
    /// Hand the finished result to the waiting caller and reset.
    Resolve(Result<Vec<u8>>),
}

#[derive(Default)]
struct Session {
    op: FtpOp,
    stage: Stage,
    reply: Option<oneshot::Sender<Result<Vec<u8>>>>,
}

impl Session {
    /// Folds one response chunk into the session.
    fn step(&mut self, tag: u8, payload: &[u8]) -> Action {
        match &mut self.stage {
            Stage::Idle => {
                debug!("transfer chunk with no request pending, dropped");
                Action::Nothing
            }
            Stage::Receiving { buffer } => {
                if payload.starts_with(MARKER_ERROR) {
                    return Action::Resolve(Err(Error::Ftp(text(payload))));
                }
                match self.op {
                    FtpOp::List | FtpOp::Delete => {
                        if payload.starts_with(MARKER_DELETE_OK) {
                            return Action::Resolve(Ok(payload.to_vec()));
                        }
                        if payload.starts_with(MARKER_TRANSFER_END) {
                            let result = mem::take(buffer);
                            self.await_digest(result, Vec::new());
                            return Action::Nothing;
                        }
                        buffer.extend_from_slice(payload);
                        // a terminal tag ends the payload even without an
                        // explicit transfer end marker
                        if tag == TAG_FINAL || tag == TAG_SINGLE {
                            let result = mem::take(buffer);
                            self.await_digest(result, Vec::new());
                        }
                        Action::Nothing
                    }
                    FtpOp::Get => {
                        if payload.starts_with(MARKER_TRANSFER_END) {
                            return Action::Resolve(Err(Error::ProtocolError(
                                "transfer end before the file digest".to_string(),
                            )));
                        }
                        if payload.starts_with(MARKER_DIGEST) {
                            let result = mem::take(buffer);
                            let remote = payload[MARKER_DIGEST.len()..].to_vec();
                            self.await_digest(result, remote);
                            if tag == TAG_FINAL || tag == TAG_SINGLE {
                                return self.close_digest();
                            }
                            return Action::Nothing;
                        }
                        buffer.extend_from_slice(payload);
                        Action::Progress(buffer.len())
                    }
                    FtpOp::DigestAck => Action::Resolve(Err(Error::ProtocolError(
                        "payload chunk during digest confirmation".to_string(),
                    ))),
                }
            }
            Stage::AwaitingRemoteDigest { remote, .. } => {
                // a transfer end may still trail a payload that already
                // closed on a terminal tag
                if remote.is_empty() && payload.starts_with(MARKER_TRANSFER_END) {
                    return Action::Nothing;
                }
                remote.extend_from_slice(payload);
                if tag == TAG_FINAL || tag == TAG_SINGLE {
                    return self.close_digest();
                }
                Action::Nothing
            }
            Stage::AwaitingTransferEnd { .. } => {
                if payload.starts_with(MARKER_TRANSFER_END) {
                    let Stage::AwaitingTransferEnd {
                        result,
                        local_digest,
                    } = mem::take(&mut self.stage)
                    else {
                        return Action::Nothing;
                    };
                    self.stage = Stage::AwaitingRemoteDigest {
                        result,
                        local_digest,
                        remote: Vec::new(),
                    };
                    return Action::Nothing;
                }
                Action::Resolve(Err(Error::ProtocolError(format!(
                    "unexpected chunk while awaiting transfer end: {:?}",
                    text(payload)
                ))))
            }
        }
    }

    /// Moves to the digest stage for `result`, hashing it on the way.
    fn await_digest(&mut self, result: Vec<u8>, remote: Vec<u8>) {
        let local_digest = hex_digest(&result);
        self.stage = Stage::AwaitingRemoteDigest {
            result,
            local_digest,
            remote,
        };
    }

    /// Compares digests once the remote one is complete.
    fn close_digest(&mut self) -> Action {
        let Stage::AwaitingRemoteDigest {
            result,
            local_digest,
            remote,
        } = mem::take(&mut self.stage)
        else {
            return Action::Nothing;
        };

        // the vehicle may label its digest with the same MD5 prefix
        let digest = remote
            .strip_prefix(MARKER_DIGEST)
            .unwrap_or(remote.as_slice());
        let remote_digest = text(digest);
        if !remote_digest.eq_ignore_ascii_case(&local_digest) {
            return Action::Resolve(Err(Error::DigestMismatch {
                local: local_digest,
                remote: remote_digest,
            }));
        }

        match self.op {
            FtpOp::List | FtpOp::Delete => Action::Resolve(Ok(result)),
            FtpOp::Get => {
                // block digest confirmed; the transfer still has to close
                self.op = FtpOp::DigestAck;
                self.stage = Stage::AwaitingTransferEnd {
                    result,
                    local_digest,
                };
                Action::SendDigestAck
            }
            FtpOp::DigestAck => Action::Resolve(Ok(result)),
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// ASCII text of a chunk payload, cut at the first NUL.
fn text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn serialize_request(op: FtpOp, path: &str) -> Vec<u8> {
    match op {
        FtpOp::DigestAck => DIGEST_ACK.to_vec(),
        _ => {
            let mut request = op.prefix().to_vec();
            request.extend_from_slice(path.as_bytes());
            request.push(0);
            request
        }
    }
}

/// Splits request text into tagged chunks of at most twenty bytes.
fn chunk_request(request: &[u8]) -> Vec<Vec<u8>> {
    let pieces: Vec<&[u8]> = request.chunks(CHUNK_DATA).collect();
    let last = pieces.len() - 1;

    pieces
        .iter()
        .enumerate()
        .map(|(index, piece)| {
            let tag = match (index, last) {
                (0, 0) => TAG_SINGLE,
                (0, _) => TAG_FIRST,
                (index, last) if index == last => TAG_FINAL,
                _ => TAG_MIDDLE,
            };
            let mut chunk = Vec::with_capacity(piece.len() + 1);
            chunk.push(tag);
            chunk.extend_from_slice(piece);
            chunk
        })
        .collect()
}

/// Serializes media store requests and verifies their responses.
pub(crate) struct FtpEngine {
    link: Arc<LinkWriter>,
    timeout: Duration,
    /// Admits one request at a time.
    gate: AsyncMutex<()>,
    session: Mutex<Session>,
    /// Download progress callback, kept apart from the session. It is
    /// invoked with no engine lock held, so it may block or call back in
    /// without wedging the session.
    progress: Mutex<Option<ProgressFn>>,
}

impl FtpEngine {
    pub fn new(link: Arc<LinkWriter>, timeout: Duration) -> Self {
        FtpEngine {
            link,
            timeout,
            gate: AsyncMutex::new(()),
            session: Mutex::new(Session::default()),
            progress: Mutex::new(None),
        }
    }

    /// Runs one request to completion.
    ///
    /// # Errors
    ///
    /// Besides transport errors, fails with [`Error::Ftp`] when the
    /// vehicle reports one, [`Error::DigestMismatch`] when verification
    /// fails, [`Error::ProtocolError`] on a chunk that does not fit the
    /// current stage and [`Error::Timeout`] when the exchange stalls past
    /// the deadline.
    pub async fn request(
        &self,
        op: FtpOp,
        path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<u8>> {
        let _slot = self.gate.lock().await;

        let receiver = {
            let mut session = self.session.lock().unwrap();
            let (tx, rx) = oneshot::channel();
            session.op = op;
            session.stage = Stage::Receiving { buffer: Vec::new() };
            session.reply = Some(tx);
            rx
        };
        *self.progress.lock().unwrap() = progress;

        if let Err(err) = self.send_request(op, path).await {
            self.clear_session();
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.clear_session();
                Err(Error::ProtocolError(
                    "transfer session dropped".to_string(),
                ))
            }
            Err(_) => {
                self.clear_session();
                Err(Error::Timeout(self.timeout))
            }
        }
    }

    async fn send_request(&self, op: FtpOp, path: &str) -> Result<()> {
        for chunk in chunk_request(&serialize_request(op, path)) {
            self.link.write_plain(channel::FTP_CONTROL, &chunk).await?;
        }
        Ok(())
    }

    /// Folds one notification from the data characteristic into the
    /// pending exchange. Called by the dispatcher.
    pub(crate) async fn handle_chunk(&self, data: &[u8]) {
        let Some((tag, payload)) = data.split_first() else {
            warn!("empty transfer chunk");
            return;
        };

        let action = {
            let mut session = self.session.lock().unwrap();
            session.step(*tag, payload)
        };

        match action {
            Action::Nothing => {}
            Action::Progress(received) => self.report_progress(received),
            Action::SendDigestAck => {
                if let Err(err) = self.send_request(FtpOp::DigestAck, "").await {
                    warn!("digest confirmation failed: {err}");
                    self.resolve(Err(err));
                }
            }
            Action::Resolve(result) => self.resolve(result),
        }
    }

    /// Runs the progress callback outside every engine lock.
    fn report_progress(&self, received: usize) {
        let taken = self.progress.lock().unwrap().take();
        if let Some(mut report) = taken {
            report(received);
            let mut slot = self.progress.lock().unwrap();
            // a request that started meanwhile keeps its own callback
            if slot.is_none() {
                *slot = Some(report);
            }
        }
    }

    /// Delivers `result` to the waiting caller and returns to idle.
    fn resolve(&self, result: Result<Vec<u8>>) {
        let reply = {
            let mut session = self.session.lock().unwrap();
            let reply = session.reply.take();
            *session = Session::default();
            reply
        };
        self.progress.lock().unwrap().take();
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn clear_session(&self) {
        *self.session.lock().unwrap() = Session::default();
        self.progress.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingAdapter;

    fn engine(adapter: &Arc<RecordingAdapter>) -> FtpEngine {
        let link = Arc::new(LinkWriter::new(adapter.clone(), adapter.directory()));
        FtpEngine::new(link, Duration::from_secs(5))
    }

    fn chunk(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![tag];
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn short_request_is_one_single_chunk() {
        let chunks = chunk_request(&serialize_request(FtpOp::List, "/media"));
        assert_eq!(chunks, vec![chunk(TAG_SINGLE, b"LIS/media\0")]);
    }

    #[test]
    fn long_request_is_tagged_first_middle_final() {
        let path = "/internal_000/Rolling_Spider/media/photo_20260823.jpg";
        let chunks = chunk_request(&serialize_request(FtpOp::Get, path));

        assert!(chunks.len() > 2);
        assert_eq!(chunks[0][0], TAG_FIRST);
        for middle in &chunks[1..chunks.len() - 1] {
            assert_eq!(middle[0], TAG_MIDDLE);
        }
        assert_eq!(chunks.last().unwrap()[0], TAG_FINAL);
        for piece in &chunks {
            assert!(piece.len() <= CHUNK_DATA + 1);
        }

        let mut reassembled = Vec::new();
        for piece in &chunks {
            reassembled.extend_from_slice(&piece[1..]);
        }
        assert_eq!(reassembled, serialize_request(FtpOp::Get, path));
    }

    #[tokio::test]
    async fn listing_with_matching_digest_succeeds() {
        let adapter = RecordingAdapter::new();
        let engine = engine(&adapter);
        let digest = hex_digest(b"ok-listing");

        let (result, ()) = tokio::join!(engine.request(FtpOp::List, "/media", None), async {
            tokio::task::yield_now().await;
            engine.handle_chunk(&chunk(TAG_SINGLE, b"ok-listing")).await;
            engine.handle_chunk(&chunk(TAG_FINAL, digest.as_bytes())).await;
        });

        assert_eq!(result.unwrap(), b"ok-listing");
        assert_eq!(
            adapter.writes_to(channel::FTP_CONTROL),
            vec![chunk(TAG_SINGLE, b"LIS/media\0")]
        );
    }

    #[tokio::test]
    async fn listing_with_wrong_digest_fails() {
        let adapter = RecordingAdapter::new();
        let engine = engine(&adapter);
        let wrong = "0".repeat(32);

        let (result, ()) = tokio::join!(engine.request(FtpOp::List, "/media", None), async {
            tokio::task::yield_now().await;
            engine.handle_chunk(&chunk(TAG_SINGLE, b"ok-listing")).await;
            engine.handle_chunk(&chunk(TAG_FINAL, wrong.as_bytes())).await;
        });

        assert!(matches!(result, Err(Error::DigestMismatch { .. })));
    }

    #[tokio::test]
    async fn digest_may_span_chunks_and_carry_a_prefix() {
        let adapter = RecordingAdapter::new();
        let engine = engine(&adapter);
        let digest = hex_digest(b"ok-listing");
        let labelled = [MARKER_DIGEST, digest.as_bytes()].concat();

        let (result, ()) = tokio::join!(engine.request(FtpOp::List, "/media", None), async {
            tokio::task::yield_now().await;
            engine.handle_chunk(&chunk(TAG_SINGLE, b"ok-listing")).await;
            engine.handle_chunk(&chunk(TAG_FIRST, &labelled[..19])).await;
            engine.handle_chunk(&chunk(TAG_FINAL, &labelled[19..])).await;
        });

        assert_eq!(result.unwrap(), b"ok-listing");
    }

    #[tokio::test]
    async fn delete_succeeds_on_the_confirmation_message() {
        let adapter = RecordingAdapter::new();
        let engine = engine(&adapter);

        let (result, ()) = tokio::join!(
            engine.request(FtpOp::Delete, "/media/img_001.jpg", None),
            async {
                tokio::task::yield_now().await;
                engine
                    .handle_chunk(&chunk(TAG_SINGLE, b"Delete successful"))
                    .await;
            }
        );

        assert_eq!(result.unwrap(), b"Delete successful");
    }

    #[tokio::test]
    async fn remote_error_message_fails_the_request() {
        let adapter = RecordingAdapter::new();
        let engine = engine(&adapter);

        let (result, ()) = tokio::join!(engine.request(FtpOp::List, "/nowhere", None), async {
            tokio::task::yield_now().await;
            engine
                .handle_chunk(&chunk(TAG_SINGLE, b"error: no such directory"))
                .await;
        });

        assert!(matches!(result, Err(Error::Ftp(_))));
    }

    #[tokio::test]
    async fn download_confirms_the_digest_and_reports_progress() {
        let adapter = RecordingAdapter::new();
        let engine = engine(&adapter);
        let digest = hex_digest(b"payload-bytes");
        let labelled = [MARKER_DIGEST, digest.as_bytes()].concat();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress: ProgressFn = {
            let seen = seen.clone();
            Box::new(move |received| seen.lock().unwrap().push(received))
        };

        let (result, ()) = tokio::join!(
            engine.request(FtpOp::Get, "/f.jpg", Some(progress)),
            async {
                tokio::task::yield_now().await;
                engine.handle_chunk(&chunk(TAG_FIRST, b"payload")).await;
                engine.handle_chunk(&chunk(TAG_MIDDLE, b"-bytes")).await;
                engine.handle_chunk(&chunk(TAG_FINAL, &labelled)).await;
                engine
                    .handle_chunk(&chunk(TAG_SINGLE, b"End of Transfer"))
                    .await;
                engine.handle_chunk(&chunk(TAG_FINAL, digest.as_bytes())).await;
            }
        );

        assert_eq!(result.unwrap(), b"payload-bytes");
        assert_eq!(*seen.lock().unwrap(), vec![7, 13]);

        // request chunk first, then the MD5 OK confirmation
        let control = adapter.writes_to(channel::FTP_CONTROL);
        assert_eq!(control.len(), 2);
        assert_eq!(control[1], chunk(TAG_SINGLE, b"MD5 OK"));
    }

    #[tokio::test]
    async fn progress_callback_runs_with_the_session_unlocked() {
        let adapter = RecordingAdapter::new();
        let engine = Arc::new(engine(&adapter));

        // a callback that reaches back into the engine must not deadlock
        // on the session it was reported from
        let reentrant = engine.clone();
        let progress: ProgressFn = Box::new(move |_| reentrant.clear_session());

        let (result, ()) = tokio::join!(
            engine.request(FtpOp::Get, "/f.jpg", Some(progress)),
            async {
                tokio::task::yield_now().await;
                engine.handle_chunk(&chunk(TAG_FIRST, b"payload")).await;
            }
        );

        // clearing mid-download drops the pending reply
        assert!(matches!(result, Err(Error::ProtocolError(_))));
    }

    #[tokio::test]
    async fn unexpected_chunk_resets_for_the_next_request() {
        let adapter = RecordingAdapter::new();
        let engine = engine(&adapter);
        let digest = hex_digest(b"file");
        let labelled = [MARKER_DIGEST, digest.as_bytes()].concat();

        let (result, ()) = tokio::join!(
            engine.request(FtpOp::Get, "/media/img_001.jpg", None),
            async {
                tokio::task::yield_now().await;
                engine.handle_chunk(&chunk(TAG_FIRST, b"file")).await;
                engine.handle_chunk(&chunk(TAG_FINAL, &labelled)).await;
                // garbage instead of End of Transfer
                engine.handle_chunk(&chunk(TAG_SINGLE, b"unrelated")).await;
            }
        );
        assert!(matches!(result, Err(Error::ProtocolError(_))));

        // the session is idle again and a fresh listing works
        let listing_digest = hex_digest(b"d");
        let (result, ()) = tokio::join!(engine.request(FtpOp::List, "/media", None), async {
            tokio::task::yield_now().await;
            engine.handle_chunk(&chunk(TAG_SINGLE, b"d")).await;
            engine
                .handle_chunk(&chunk(TAG_FINAL, listing_digest.as_bytes()))
                .await;
        });
        assert_eq!(result.unwrap(), b"d");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_times_out() {
        let adapter = RecordingAdapter::new();
        let link = Arc::new(LinkWriter::new(adapter.clone(), adapter.directory()));
        let engine = FtpEngine::new(link, Duration::from_millis(50));

        let result = engine.request(FtpOp::List, "/media", None).await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn chunk_without_a_request_is_ignored() {
        let adapter = RecordingAdapter::new();
        let engine = engine(&adapter);

        engine.handle_chunk(&chunk(TAG_SINGLE, b"stray")).await;
        engine.handle_chunk(&[]).await;

        assert!(adapter.recorded().is_empty());
    }
}
