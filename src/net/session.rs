//! Transfer sessions.
//!
//! A session moves exactly one file over one connection, in one direction.
//! The send and receive loops here only see an abstract writer or a channel
//! of body payloads; binding them to a live connection (slot ownership,
//! teardown on failure) is the connection layer's job.
//!
//! # State machine
//!
//! ```text
//! Sender:   Idle -> HeaderSent    -> Streaming -> Completed
//! Receiver: Idle -> HeaderAwaited -> Streaming -> Completed
//!                  any non-terminal state      -> Failed(reason)
//! ```
//!
//! # Progress
//!
//! [`SessionTracker`] is the single place that publishes progress. It emits
//! one `TransferProgress` event per body frame, and the byte count only ever
//! grows. The terminal methods consume the tracker, so a session reports
//! `Completed` or `Failed` exactly once and nothing after that.
//!
//! # Memory
//!
//! The sender reuses one read buffer and one frame buffer of at most
//! `max_frame_len` bytes. The receiver writes each payload to a temporary
//! file in the download directory as it arrives. Memory use does not depend
//! on file size.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::codec::{FrameCodec, TransferDescriptor, FRAME_PREFIX_LEN};
use super::identity::PeerIdentity;
use crate::config::TransferConfig;
use crate::error::FileDropError;
use crate::events::{EventBus, NodeEvent};

/// Name used when a received file name is empty or unusable.
const FALLBACK_FILE_NAME: &str = "unnamed";

/// Collision suffixes tried before giving up on persisting a received file.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Unique identifier for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw u64 value of this transfer ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

/// Which end of the transfer this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    Sender,
    Receiver,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HeaderSent,
    HeaderAwaited,
    Streaming,
    Completed,
    Failed(FileDropError),
}

impl SessionState {
    /// Returns true if the session is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed(_))
    }

    /// Returns true once the header is on the wire or being read.
    pub(crate) fn has_begun(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}

/// Snapshot of a transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub role: SessionRole,
    pub peer: PeerIdentity,
    pub file_name: Arc<str>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub state: SessionState,
    pub started_at: Instant,
}

impl TransferProgress {
    /// Completed share in `[0, 1]`. An empty file counts as fully transferred.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.transferred_bytes as f64 / self.total_bytes as f64).min(1.0)
    }

    pub fn percent(&self) -> u8 {
        (self.fraction() * 100.0) as u8
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, SessionState::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SessionState::Failed(_))
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Average throughput since the session started.
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.started_at.elapsed().as_secs_f64();
        if secs <= f64::EPSILON {
            return 0;
        }
        (self.transferred_bytes as f64 / secs) as u64
    }
}

/// Abort signal shared by a session, its handle and its connection.
///
/// The first reason recorded wins; later aborts only re-cancel.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<FileDropError>>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self, reason: FileDropError) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn cancel(&self) {
        self.abort(FileDropError::Cancelled);
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn aborted(&self) {
        self.token.cancelled().await;
    }

    pub fn reason(&self) -> FileDropError {
        self.reason.lock().clone().unwrap_or(FileDropError::Cancelled)
    }
}

/// Entry in the [`TransferTable`].
#[derive(Debug)]
struct TransferEntry {
    progress: TransferProgress,
    abort: AbortHandle,
    finished_at: Option<Instant>,
}

/// Every session this node has run, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TransferTable {
    inner: Arc<DashMap<TransferId, TransferEntry>>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, progress: TransferProgress, abort: AbortHandle) {
        self.inner
            .insert(progress.transfer_id, TransferEntry {
                progress,
                abort,
                finished_at: None,
            });
    }

    fn update(&self, progress: &TransferProgress) {
        if let Some(mut entry) = self.inner.get_mut(&progress.transfer_id) {
            entry.progress = progress.clone();
            if entry.finished_at.is_none() && progress.state.is_terminal() {
                entry.finished_at = Some(Instant::now());
            }
        }
    }

    pub fn get(&self, id: TransferId) -> Option<TransferProgress> {
        self.inner.get(&id).map(|entry| entry.progress.clone())
    }

    /// Returns all transfers (including completed/failed)
    pub fn all(&self) -> Vec<TransferProgress> {
        self.inner
            .iter()
            .map(|entry| entry.value().progress.clone())
            .collect()
    }

    pub fn active(&self) -> Vec<TransferProgress> {
        self.inner
            .iter()
            .filter(|entry| entry.value().progress.is_active())
            .map(|entry| entry.value().progress.clone())
            .collect()
    }

    /// Cancels an active transfer. Returns false if unknown or finished.
    pub fn cancel(&self, id: TransferId) -> bool {
        match self.inner.get(&id) {
            Some(entry) if entry.progress.is_active() => {
                entry.abort.cancel();
                true
            }
            _ => false,
        }
    }

    /// Removes completed or failed transfers from tracking
    pub fn cleanup_finished(&self) {
        self.inner.retain(|_, entry| entry.progress.is_active());
    }

    /// Removes transfers that finished at least `retention` ago.
    /// Returns how many were removed.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, entry| match entry.finished_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        before.saturating_sub(self.inner.len())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Caller-side view of one transfer.
#[derive(Debug)]
pub struct TransferHandle {
    id: TransferId,
    abort: AbortHandle,
    progress: watch::Receiver<TransferProgress>,
}

impl TransferHandle {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Latest snapshot.
    pub fn progress(&self) -> TransferProgress {
        self.progress.borrow().clone()
    }

    /// Stops the transfer; it fails with `Cancelled` unless already finished.
    pub fn cancel(&self) {
        self.abort.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.progress.borrow().state.is_terminal()
    }

    /// Waits for the terminal state.
    pub async fn wait(&mut self) -> Result<TransferProgress, FileDropError> {
        let settled = self
            .progress
            .wait_for(|p| p.state.is_terminal())
            .await
            .map(|p| p.clone())
            .ok();
        let progress = settled.unwrap_or_else(|| self.progress.borrow().clone());
        match &progress.state {
            SessionState::Completed => Ok(progress),
            SessionState::Failed(err) => Err(err.clone()),
            _ => Err(FileDropError::connection_lost("session ended without a result")),
        }
    }
}

/// Everything a session needs from its node.
#[derive(Debug, Clone)]
pub(crate) struct SessionContext {
    pub(crate) events: Arc<EventBus>,
    pub(crate) transfers: TransferTable,
    pub(crate) config: Arc<TransferConfig>,
}

/// Publishes one session's progress to its handle, the table and observers.
pub(crate) struct SessionTracker {
    progress: TransferProgress,
    reported: bool,
    watch: watch::Sender<TransferProgress>,
    events: Arc<EventBus>,
    transfers: TransferTable,
}

impl SessionTracker {
    /// Registers a new session and announces it.
    pub(crate) fn start(
        role: SessionRole,
        peer: PeerIdentity,
        descriptor: &TransferDescriptor,
        state: SessionState,
        abort: AbortHandle,
        ctx: &SessionContext,
    ) -> (Self, TransferHandle) {
        let id = TransferId::next();
        let progress = TransferProgress {
            transfer_id: id,
            role,
            peer,
            file_name: Arc::from(descriptor.file_name.as_str()),
            total_bytes: descriptor.file_size,
            transferred_bytes: 0,
            state,
            started_at: Instant::now(),
        };
        let (watch, rx) = watch::channel(progress.clone());

        ctx.transfers.insert(progress.clone(), abort.clone());
        ctx.events.emit(NodeEvent::TransferStarted(progress.clone()));
        info!(
            transfer_id = %id,
            role = ?role,
            peer = %progress.peer,
            file_name = %progress.file_name,
            size = progress.total_bytes,
            "transfer started"
        );

        let tracker = Self {
            progress,
            reported: false,
            watch,
            events: ctx.events.clone(),
            transfers: ctx.transfers.clone(),
        };
        let handle = TransferHandle {
            id,
            abort,
            progress: rx,
        };
        (tracker, handle)
    }

    #[inline]
    pub(crate) fn id(&self) -> TransferId {
        self.progress.transfer_id
    }

    #[inline]
    pub(crate) fn state(&self) -> &SessionState {
        &self.progress.state
    }

    fn publish(&self) {
        self.watch.send_replace(self.progress.clone());
        self.transfers.update(&self.progress);
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.progress.state = state;
        self.publish();
    }

    /// Records `n` more bytes and emits a progress event.
    pub(crate) fn advance(&mut self, n: u64) {
        self.progress.transferred_bytes += n;
        self.reported = true;
        self.publish();
        self.events
            .emit(NodeEvent::TransferProgress(self.progress.clone()));
    }

    pub(crate) fn complete(mut self, path: PathBuf) -> TransferProgress {
        if !self.reported {
            self.events
                .emit(NodeEvent::TransferProgress(self.progress.clone()));
        }
        self.progress.state = SessionState::Completed;
        self.publish();
        info!(
            transfer_id = %self.progress.transfer_id,
            bytes = self.progress.transferred_bytes,
            path = %path.display(),
            "transfer completed"
        );
        self.events.emit(NodeEvent::TransferCompleted {
            progress: self.progress.clone(),
            path,
        });
        self.progress
    }

    pub(crate) fn fail(mut self, err: FileDropError) -> TransferProgress {
        self.progress.state = SessionState::Failed(err.clone());
        self.publish();
        error!(
            transfer_id = %self.progress.transfer_id,
            bytes = self.progress.transferred_bytes,
            error = %err,
            "transfer failed"
        );
        self.events.emit(NodeEvent::TransferFailed {
            progress: self.progress.clone(),
            error: err,
        });
        self.progress
    }
}

/// Streams `source` as one transfer: header frame, then body frames.
///
/// Stops at the first failure, abort or stall. The caller decides what a
/// failure means for the connection.
pub(crate) async fn send_stream<W, R>(
    writer: &mut W,
    source: R,
    descriptor: &TransferDescriptor,
    tracker: &mut SessionTracker,
    abort: &AbortHandle,
    config: &TransferConfig,
) -> Result<(), FileDropError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    if abort.is_aborted() {
        return Err(abort.reason());
    }

    let codec = FrameCodec::new(config.max_frame_len);
    let mut frame = BytesMut::with_capacity(FRAME_PREFIX_LEN + codec.max_frame_len());
    let mut chunk = vec![0u8; codec.max_frame_len()];

    codec.encode_header(descriptor, &mut frame)?;
    tracker.set_state(SessionState::HeaderSent);
    write_frame(writer, &frame, abort, config.stall_timeout).await?;
    frame.clear();
    tracker.set_state(SessionState::Streaming);

    let mut source = source.take(descriptor.file_size);
    let mut sent = 0u64;
    while sent < descriptor.file_size {
        let n = tokio::select! {
            biased;
            _ = abort.aborted() => return Err(abort.reason()),
            read = source.read(&mut chunk) => read?,
        };
        if n == 0 {
            return Err(FileDropError::io(format!(
                "source ended after {sent} of {} bytes",
                descriptor.file_size
            )));
        }

        codec.encode_body(&chunk[..n], &mut frame)?;
        write_frame(writer, &frame, abort, config.stall_timeout).await?;
        frame.clear();

        sent += n as u64;
        tracker.advance(n as u64);
    }

    tokio::select! {
        biased;
        _ = abort.aborted() => return Err(abort.reason()),
        flushed = writer.flush() => flushed.map_err(|e| FileDropError::from_transport(&e))?,
    }
    debug!(transfer_id = %tracker.id(), bytes = sent, "all frames written");
    Ok(())
}

async fn write_frame<W>(
    writer: &mut W,
    frame: &[u8],
    abort: &AbortHandle,
    stall: Duration,
) -> Result<(), FileDropError>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = abort.aborted() => Err(abort.reason()),
        written = tokio::time::timeout(stall, writer.write_all(frame)) => match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FileDropError::from_transport(&e)),
            Err(_) => Err(FileDropError::Stalled),
        },
    }
}

/// Writes incoming body payloads to a temporary file, then moves it into
/// the download directory.
///
/// On any failure the temporary file is removed and nothing is left in the
/// download directory.
pub(crate) async fn receive_stream(
    mut body: mpsc::Receiver<Bytes>,
    descriptor: &TransferDescriptor,
    tracker: &mut SessionTracker,
    abort: &AbortHandle,
    config: &TransferConfig,
) -> Result<PathBuf, FileDropError> {
    tracker.set_state(SessionState::Streaming);

    let dir = config.download_dir.clone();
    let temp = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(".filedrop-")
            .suffix(".part")
            .tempfile_in(dir)
    })
    .await
    .map_err(|e| FileDropError::io(e.to_string()))??;
    let (file, temp_path) = temp.into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut received = 0u64;
    while received < descriptor.file_size {
        let chunk = tokio::select! {
            biased;
            _ = abort.aborted() => return Err(abort.reason()),
            next = tokio::time::timeout(config.stall_timeout, body.recv()) => match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) if abort.is_aborted() => return Err(abort.reason()),
                Ok(None) => {
                    return Err(FileDropError::connection_lost("connection closed mid-transfer"))
                }
                Err(_) => return Err(FileDropError::Stalled),
            },
        };

        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        tracker.advance(chunk.len() as u64);
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    let dir = config.download_dir.clone();
    let name = sanitize_file_name(&descriptor.file_name);
    tokio::task::spawn_blocking(move || persist_unique(temp_path, &dir, &name))
        .await
        .map_err(|e| FileDropError::io(e.to_string()))?
}

/// Moves `temp` to `dir/name`, adding ` (n)` before the extension if taken.
fn persist_unique(mut temp: TempPath, dir: &Path, name: &str) -> Result<PathBuf, FileDropError> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = dir.join(numbered_name(name, attempt));
        match temp.persist_noclobber(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => temp = e.path,
            Err(e) => return Err(e.error.into()),
        }
    }
    Err(FileDropError::io(format!("no free file name for {name}")))
}

fn numbered_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    match path.extension() {
        Some(ext) => format!("{stem} ({attempt}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({attempt})"),
    }
}

/// Keeps only the last path component of a name chosen by the remote peer.
pub fn sanitize_file_name(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStream;
    use crate::net::codec::Frame;
    use crate::net::identity::PeerId;
    use futures::StreamExt;
    use tempfile::TempDir;
    use tokio_util::codec::FramedRead;

    fn test_ctx(dir: &Path, max_frame_len: usize) -> SessionContext {
        SessionContext {
            events: Arc::new(EventBus::new()),
            transfers: TransferTable::new(),
            config: Arc::new(TransferConfig {
                download_dir: dir.to_path_buf(),
                max_frame_len,
                stall_timeout: Duration::from_millis(200),
                body_channel_depth: 4,
                finished_retention: Duration::from_secs(60),
            }),
        }
    }

    fn peer() -> PeerIdentity {
        PeerIdentity::new(PeerId::random(), "Bob-Laptop")
    }

    fn drain(events: &mut EventStream) -> Vec<NodeEvent> {
        let mut out = Vec::new();
        while let Some(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn progress_bytes(events: &[NodeEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                NodeEvent::TransferProgress(p) => Some(p.transferred_bytes),
                _ => None,
            })
            .collect()
    }

    fn part_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".part")
            })
            .count()
    }

    // ==================== State Tests ====================

    #[test]
    fn test_session_state_terminal() {
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::HeaderSent.is_terminal());
        assert!(!SessionState::HeaderAwaited.is_terminal());
        assert!(!SessionState::Streaming.is_terminal());
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed(FileDropError::Cancelled).is_terminal());
        assert!(!SessionState::Idle.has_begun());
        assert!(SessionState::HeaderSent.has_begun());
    }

    #[test]
    fn test_transfer_id_display() {
        let id = TransferId(42);
        assert_eq!(id.to_string(), "transfer-42");
        assert!(TransferId::next() < TransferId::next());
    }

    #[test]
    fn test_progress_fraction() {
        let mut progress = TransferProgress {
            transfer_id: TransferId(1),
            role: SessionRole::Sender,
            peer: peer(),
            file_name: Arc::from("a"),
            total_bytes: 4,
            transferred_bytes: 1,
            state: SessionState::Streaming,
            started_at: Instant::now(),
        };
        assert_eq!(progress.fraction(), 0.25);
        assert_eq!(progress.percent(), 25);

        progress.total_bytes = 0;
        progress.transferred_bytes = 0;
        assert_eq!(progress.fraction(), 1.0);
    }

    #[test]
    fn test_abort_first_reason_wins() {
        let abort = AbortHandle::new();
        assert!(!abort.is_aborted());
        abort.abort(FileDropError::Stalled);
        abort.cancel();
        assert!(abort.is_aborted());
        assert_eq!(abort.reason(), FileDropError::Stalled);
    }

    // ==================== Tracker Tests ====================

    #[tokio::test]
    async fn test_tracker_reports_monotonic_then_terminal() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(dir.path(), 4);
        let mut events = ctx.events.subscribe();
        let descriptor = TransferDescriptor::new("a.bin", 10);

        let (mut tracker, mut handle) = SessionTracker::start(
            SessionRole::Sender,
            peer(),
            &descriptor,
            SessionState::Idle,
            AbortHandle::new(),
            &ctx,
        );
        tracker.advance(4);
        tracker.advance(4);
        tracker.advance(2);
        tracker.complete(PathBuf::from("a.bin"));

        let seen = drain(&mut events);
        assert!(matches!(seen.first(), Some(NodeEvent::TransferStarted(_))));
        assert_eq!(progress_bytes(&seen), vec![4, 8, 10]);
        assert!(matches!(seen.last(), Some(NodeEvent::TransferCompleted { .. })));

        let done = handle.wait().await.unwrap();
        assert_eq!(done.fraction(), 1.0);
        assert!(ctx.transfers.active().is_empty());
        assert_eq!(ctx.transfers.all().len(), 1);
    }

    #[tokio::test]
    async fn test_tracker_empty_file_reports_full_progress() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(dir.path(), 4);
        let mut events = ctx.events.subscribe();

        let (tracker, _handle) = SessionTracker::start(
            SessionRole::Receiver,
            peer(),
            &TransferDescriptor::new("empty", 0),
            SessionState::HeaderAwaited,
            AbortHandle::new(),
            &ctx,
        );
        tracker.complete(PathBuf::from("empty"));

        let seen = drain(&mut events);
        let fractions: Vec<f64> = seen
            .iter()
            .filter_map(|e| match e {
                NodeEvent::TransferProgress(p) => Some(p.fraction()),
                _ => None,
            })
            .collect();
        assert_eq!(fractions, vec![1.0]);
    }

    #[tokio::test]
    async fn test_handle_wait_returns_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(dir.path(), 4);
        let (tracker, mut handle) = SessionTracker::start(
            SessionRole::Sender,
            peer(),
            &TransferDescriptor::new("a", 1),
            SessionState::Idle,
            AbortHandle::new(),
            &ctx,
        );
        tracker.fail(FileDropError::Stalled);
        assert_eq!(handle.wait().await.unwrap_err(), FileDropError::Stalled);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_table_cancel_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(dir.path(), 4);
        let abort = AbortHandle::new();
        let (tracker, handle) = SessionTracker::start(
            SessionRole::Sender,
            peer(),
            &TransferDescriptor::new("a", 1),
            SessionState::Idle,
            abort.clone(),
            &ctx,
        );

        assert!(ctx.transfers.cancel(handle.id()));
        assert!(abort.is_aborted());
        tracker.fail(FileDropError::Cancelled);

        assert!(!ctx.transfers.cancel(handle.id()));
        ctx.transfers.cleanup_finished();
        assert!(ctx.transfers.is_empty());
    }

    #[tokio::test]
    async fn test_table_prunes_after_retention() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(dir.path(), 4);
        let start = |name: &str| {
            SessionTracker::start(
                SessionRole::Receiver,
                peer(),
                &TransferDescriptor::new(name, 1),
                SessionState::HeaderAwaited,
                AbortHandle::new(),
                &ctx,
            )
        };
        let (done, _h1) = start("done");
        let (_running, running) = start("running");
        done.complete(dir.path().join("done"));

        assert_eq!(ctx.transfers.prune_finished(Duration::from_secs(60)), 0);
        assert_eq!(ctx.transfers.len(), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ctx.transfers.prune_finished(Duration::from_millis(10)), 1);
        assert_eq!(ctx.transfers.len(), 1);
        assert!(ctx.transfers.get(running.id()).is_some());
    }

    // ==================== Sender Tests ====================

    mod sender_tests {
        use super::*;

        async fn send_bytes(
            data: Vec<u8>,
            max_frame_len: usize,
        ) -> (Result<(), FileDropError>, Vec<Frame>, Vec<NodeEvent>) {
            let dir = TempDir::new().unwrap();
            let ctx = test_ctx(dir.path(), max_frame_len);
            let mut events = ctx.events.subscribe();
            let descriptor = TransferDescriptor::new("data.bin", data.len() as u64);
            let abort = AbortHandle::new();
            let (mut tracker, _handle) = SessionTracker::start(
                SessionRole::Sender,
                peer(),
                &descriptor,
                SessionState::Idle,
                abort.clone(),
                &ctx,
            );

            let (mut near, far) = tokio::io::duplex(64 * 1024);
            let reader = tokio::spawn(async move {
                FramedRead::new(far, FrameCodec::new(max_frame_len))
                    .map(|f| f.unwrap())
                    .collect::<Vec<_>>()
                    .await
            });

            let result = send_stream(
                &mut near,
                &data[..],
                &descriptor,
                &mut tracker,
                &abort,
                &ctx.config,
            )
            .await;
            drop(near);
            let frames = reader.await.unwrap();
            (result, frames, drain(&mut events))
        }

        #[tokio::test]
        async fn test_frames_respect_max_len() {
            let data: Vec<u8> = (0..10u8).collect();
            let (result, frames, events) = send_bytes(data.clone(), 4).await;
            result.unwrap();

            assert_eq!(
                frames[0],
                Frame::Header(TransferDescriptor::new("data.bin", 10))
            );
            let bodies: Vec<&Bytes> = frames[1..]
                .iter()
                .map(|f| match f {
                    Frame::Body(b) => b,
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            assert!(bodies.iter().all(|b| !b.is_empty() && b.len() <= 4));
            let joined: Vec<u8> = bodies.iter().flat_map(|b| b.iter().copied()).collect();
            assert_eq!(joined, data);

            let bytes = progress_bytes(&events);
            assert!(bytes.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(bytes.last(), Some(&10));
        }

        #[tokio::test]
        async fn test_empty_source_sends_only_header() {
            let (result, frames, events) = send_bytes(Vec::new(), 4).await;
            result.unwrap();
            assert_eq!(frames.len(), 1);
            assert!(progress_bytes(&events).is_empty());
        }

        #[tokio::test]
        async fn test_short_source_is_io_error() {
            let dir = TempDir::new().unwrap();
            let ctx = test_ctx(dir.path(), 4);
            let descriptor = TransferDescriptor::new("short", 10);
            let abort = AbortHandle::new();
            let (mut tracker, _handle) = SessionTracker::start(
                SessionRole::Sender,
                peer(),
                &descriptor,
                SessionState::Idle,
                abort.clone(),
                &ctx,
            );
            let (mut near, _far) = tokio::io::duplex(1024);

            let err = send_stream(&mut near, &b"abc"[..], &descriptor, &mut tracker, &abort, &ctx.config)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        }

        #[tokio::test]
        async fn test_unread_stream_stalls() {
            let dir = TempDir::new().unwrap();
            let ctx = test_ctx(dir.path(), 64);
            let descriptor = TransferDescriptor::new("big", 4096);
            let abort = AbortHandle::new();
            let (mut tracker, _handle) = SessionTracker::start(
                SessionRole::Sender,
                peer(),
                &descriptor,
                SessionState::Idle,
                abort.clone(),
                &ctx,
            );
            let (mut near, _far) = tokio::io::duplex(128);
            let data = vec![7u8; 4096];

            let err = send_stream(&mut near, &data[..], &descriptor, &mut tracker, &abort, &ctx.config)
                .await
                .unwrap_err();
            assert_eq!(err, FileDropError::Stalled);
        }

        #[tokio::test]
        async fn test_abort_before_start_leaves_idle() {
            let dir = TempDir::new().unwrap();
            let ctx = test_ctx(dir.path(), 4);
            let descriptor = TransferDescriptor::new("a", 1);
            let abort = AbortHandle::new();
            let (mut tracker, _handle) = SessionTracker::start(
                SessionRole::Sender,
                peer(),
                &descriptor,
                SessionState::Idle,
                abort.clone(),
                &ctx,
            );
            abort.cancel();
            let (mut near, _far) = tokio::io::duplex(1024);

            let err = send_stream(&mut near, &b"a"[..], &descriptor, &mut tracker, &abort, &ctx.config)
                .await
                .unwrap_err();
            assert_eq!(err, FileDropError::Cancelled);
            assert!(!tracker.state().has_begun());
        }
    }

    // ==================== Receiver Tests ====================

    mod receiver_tests {
        use super::*;

        struct Receiving {
            dir: TempDir,
            ctx: SessionContext,
            tracker: SessionTracker,
            abort: AbortHandle,
            descriptor: TransferDescriptor,
        }

        fn receiving(name: &str, size: u64) -> Receiving {
            let dir = TempDir::new().unwrap();
            let ctx = test_ctx(dir.path(), 4);
            let descriptor = TransferDescriptor::new(name, size);
            let abort = AbortHandle::new();
            let (tracker, _handle) = SessionTracker::start(
                SessionRole::Receiver,
                peer(),
                &descriptor,
                SessionState::HeaderAwaited,
                abort.clone(),
                &ctx,
            );
            Receiving {
                dir,
                ctx,
                tracker,
                abort,
                descriptor,
            }
        }

        #[tokio::test]
        async fn test_writes_file_and_persists() {
            let mut r = receiving("photo.jpg", 6);
            let (tx, rx) = mpsc::channel(4);
            tx.send(Bytes::from_static(b"abcd")).await.unwrap();
            tx.send(Bytes::from_static(b"ef")).await.unwrap();

            let path = receive_stream(rx, &r.descriptor, &mut r.tracker, &r.abort, &r.ctx.config)
                .await
                .unwrap();
            assert_eq!(path, r.dir.path().join("photo.jpg"));
            assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
            assert_eq!(part_files(r.dir.path()), 0);
        }

        #[tokio::test]
        async fn test_existing_name_gets_suffix() {
            let mut r = receiving("photo.jpg", 1);
            std::fs::write(r.dir.path().join("photo.jpg"), b"old").unwrap();
            let (tx, rx) = mpsc::channel(4);
            tx.send(Bytes::from_static(b"n")).await.unwrap();

            let path = receive_stream(rx, &r.descriptor, &mut r.tracker, &r.abort, &r.ctx.config)
                .await
                .unwrap();
            assert_eq!(path, r.dir.path().join("photo (1).jpg"));
            assert_eq!(std::fs::read(r.dir.path().join("photo.jpg")).unwrap(), b"old");
        }

        #[tokio::test]
        async fn test_hostile_name_stays_in_download_dir() {
            let mut r = receiving("../../etc/passwd", 1);
            let (tx, rx) = mpsc::channel(4);
            tx.send(Bytes::from_static(b"x")).await.unwrap();

            let path = receive_stream(rx, &r.descriptor, &mut r.tracker, &r.abort, &r.ctx.config)
                .await
                .unwrap();
            assert_eq!(path, r.dir.path().join("passwd"));
        }

        #[tokio::test]
        async fn test_abort_discards_temp_file() {
            let mut r = receiving("big.bin", 100);
            let (tx, rx) = mpsc::channel(4);
            tx.send(Bytes::from_static(b"abcd")).await.unwrap();

            let abort = r.abort.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                abort.cancel();
            });

            let err = receive_stream(rx, &r.descriptor, &mut r.tracker, &r.abort, &r.ctx.config)
                .await
                .unwrap_err();
            assert_eq!(err, FileDropError::Cancelled);
            drop(tx);
            assert_eq!(std::fs::read_dir(r.dir.path()).unwrap().count(), 0);
        }

        #[tokio::test]
        async fn test_closed_channel_is_connection_lost() {
            let mut r = receiving("big.bin", 100);
            let (tx, rx) = mpsc::channel(4);
            tx.send(Bytes::from_static(b"abcd")).await.unwrap();
            drop(tx);

            let err = receive_stream(rx, &r.descriptor, &mut r.tracker, &r.abort, &r.ctx.config)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::ConnectionLost);
            assert_eq!(std::fs::read_dir(r.dir.path()).unwrap().count(), 0);
        }

        #[tokio::test]
        async fn test_silence_is_stall() {
            let mut r = receiving("big.bin", 100);
            let (_tx, rx) = mpsc::channel(4);

            let err = receive_stream(rx, &r.descriptor, &mut r.tracker, &r.abort, &r.ctx.config)
                .await
                .unwrap_err();
            assert_eq!(err, FileDropError::Stalled);
            assert_eq!(part_files(r.dir.path()), 0);
        }
    }

    // ==================== File Name Tests ====================

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("/home/user/photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\doc.txt"), "doc.txt");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(".."), "unnamed");
        assert_eq!(sanitize_file_name("dir/"), "unnamed");
        assert_eq!(sanitize_file_name(""), "unnamed");
        assert_eq!(sanitize_file_name("a\u{0}b"), "ab");
    }

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("photo.jpg", 0), "photo.jpg");
        assert_eq!(numbered_name("photo.jpg", 2), "photo (2).jpg");
        assert_eq!(numbered_name("README", 1), "README (1)");
        assert_eq!(numbered_name("archive.tar.gz", 1), "archive.tar (1).gz");
    }
}
