//! Chunked file upload over the session relay.
//!
//! ```text
//!  sender                                   receiver
//!  ──────                                   ────────
//!  FileUploadRequest  pos=0, no bytes  ──▶  UploadRequested (accept/refuse)
//!                     ◀──  FileUploadResponse pos=0, destination
//!  read [0, B)
//!  FileUploadRequest  pos=B, bytes     ──▶  append, echo
//!                     ◀──  FileUploadResponse pos=B
//!  ...                                      ...
//!  echo pos >= total  → Completed
//! ```
//!
//! The transfer state travels in the messages themselves.  The receiver only
//! remembers which uploads it accepted and where each one is written; chunks
//! for any other correlation id are refused, and the destination a chunk
//! carries is never trusted.  The sender's continuation stays registered
//! (responses do not delete it) until the transfer completes or fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use relay_core::protocol::messages::{FileUploadRequest, FileUploadResponse, Message};
use relay_core::{Connection, Reply};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::client::ClientError;
use crate::application::events::ClientEvent;

/// Error text returned to the sender when the receiver declines an upload.
pub const UPLOAD_REFUSED: &str = "The file upload request was refused by the user!";

/// Storage the transfer protocol reads from and writes to.
///
/// Paths are opaque tokens chosen by each side; the other side only echoes
/// them back.
#[cfg_attr(test, mockall::automock)]
pub trait FileStore: Send + Sync {
    /// Size of the file at `path` in bytes.
    fn length(&self, path: &Path) -> std::io::Result<u64>;

    /// Up to `len` bytes starting at `offset`.  Shorter at end of file.
    fn read(&self, path: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>>;

    /// Creates `path`, truncating any existing content.
    fn create(&self, path: &Path) -> std::io::Result<()>;

    fn append(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()>;
}

/// Where an upload stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    InProgress,
    Completed,
    Failed(String),
}

/// Progress report for one upload, on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    pub file_name: String,
    /// Bytes transferred so far, capped at `total_bytes`.
    pub transferred: u64,
    pub total_bytes: u64,
    pub status: UploadStatus,
}

impl UploadProgress {
    fn of(response: &FileUploadResponse, status: UploadStatus) -> Self {
        Self {
            file_name: response.file_name.clone(),
            transferred: response.current_position.min(response.total_bytes),
            total_bytes: response.total_bytes,
            status,
        }
    }
}

// ── Sender ────────────────────────────────────────────────────────────────────

/// Proposes `source` to the session peer and drives the transfer from the
/// peer's echoes.  Returns the transfer's correlation id.
pub(crate) fn start_upload<F>(
    connection: &Connection,
    files: Arc<dyn FileStore>,
    source: &Path,
    buffer_size: u32,
    mut on_progress: F,
) -> Result<Uuid, ClientError>
where
    F: FnMut(UploadProgress) + Send + 'static,
{
    let buffer_size = buffer_size.max(1);
    let total_bytes = files.length(source).map_err(|e| ClientError::File {
        path: source.to_path_buf(),
        source: e,
    })?;
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.display().to_string());
    let offer = FileUploadRequest::offer(
        file_name,
        source.display().to_string(),
        total_bytes,
        buffer_size,
    );

    let id = Uuid::new_v4();
    connection
        .callbacks()
        .register::<FileUploadResponse, _>(id, move |connection, reply| {
            if let Some(progress) = send_next_chunk(connection, files.as_ref(), reply, buffer_size) {
                on_progress(progress);
            }
        })?;

    info!(
        "offering {} ({total_bytes} bytes) in chunks of {buffer_size}",
        offer.file_name
    );
    if let Err(e) = connection.send(Message::with_correlation(id, offer)) {
        connection.callbacks().remove(&id);
        return Err(e.into());
    }
    Ok(id)
}

/// Handles one echo on the sending side.  Ends the transfer (removing the
/// continuation) on completion or error.
fn send_next_chunk(
    connection: &Connection,
    files: &dyn FileStore,
    reply: Reply<FileUploadResponse>,
    buffer_size: u32,
) -> Option<UploadProgress> {
    let id = reply.correlation_id;
    let echo = &reply.body;

    if reply.has_error {
        connection.callbacks().remove(&id);
        warn!("upload {id} of {} failed: {}", echo.file_name, reply.error_text());
        return Some(UploadProgress::of(
            echo,
            UploadStatus::Failed(reply.error_text().to_string()),
        ));
    }

    if echo.is_complete() {
        connection.callbacks().remove(&id);
        info!("upload {id} of {} complete", echo.file_name);
        return Some(UploadProgress::of(echo, UploadStatus::Completed));
    }

    let source = Path::new(&echo.source_path);
    let chunk = match files.read(source, echo.current_position, buffer_size as usize) {
        Ok(chunk) => chunk,
        Err(e) => {
            connection.callbacks().remove(&id);
            warn!("upload {id}: reading {} failed: {e}", echo.source_path);
            return Some(UploadProgress::of(echo, UploadStatus::Failed(e.to_string())));
        }
    };

    let next = FileUploadRequest::next_chunk(echo, chunk, buffer_size);
    debug!(
        "upload {id}: sending {} bytes ending at {}",
        next.bytes_to_write.len(),
        next.current_position
    );
    if let Err(e) = connection.send(Message::with_correlation(id, next)) {
        connection.callbacks().remove(&id);
        return Some(UploadProgress::of(echo, UploadStatus::Failed(e.to_string())));
    }
    Some(UploadProgress::of(echo, UploadStatus::InProgress))
}

// ── Receiver ──────────────────────────────────────────────────────────────────

/// Destinations of the uploads this side accepted, by correlation id.
#[derive(Debug, Clone, Default)]
pub(crate) struct AcceptedUploads(Arc<Mutex<HashMap<Uuid, PathBuf>>>);

impl AcceptedUploads {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PathBuf>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert(&self, correlation_id: Uuid, destination: PathBuf) {
        self.lock().insert(correlation_id, destination);
    }

    pub(crate) fn destination(&self, correlation_id: &Uuid) -> Option<PathBuf> {
        self.lock().get(correlation_id).cloned()
    }

    pub(crate) fn remove(&self, correlation_id: &Uuid) {
        self.lock().remove(correlation_id);
    }

    /// Forgets every upload; the connection they arrived on is gone.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

/// An incoming upload proposal awaiting the owner's decision.
pub struct UploadInvitation {
    connection: Connection,
    correlation_id: Uuid,
    request: FileUploadRequest,
    files: Arc<dyn FileStore>,
    accepted: AcceptedUploads,
}

impl UploadInvitation {
    pub fn file_name(&self) -> &str {
        &self.request.file_name
    }

    pub fn total_bytes(&self) -> u64 {
        self.request.total_bytes
    }

    /// Creates (or truncates) `destination` and asks the sender to start.
    ///
    /// # Errors
    ///
    /// [`ClientError::File`] if the destination cannot be created; the sender
    /// then receives an error response.
    pub fn accept(self, destination: impl AsRef<Path>) -> Result<(), ClientError> {
        let destination = destination.as_ref();
        if let Err(e) = self.files.create(destination) {
            let reply = Message::with_correlation(
                self.correlation_id,
                FileUploadResponse::echo(&self.request),
            )
            .with_error(format!("could not create {}: {e}", destination.display()));
            let _ = self.connection.send(reply);
            return Err(ClientError::File {
                path: destination.to_path_buf(),
                source: e,
            });
        }

        self.accepted
            .insert(self.correlation_id, destination.to_path_buf());
        let mut request = self.request;
        request.destination_path = destination.display().to_string();
        info!(
            "accepted upload of {} into {}",
            request.file_name, request.destination_path
        );
        if let Err(e) = self.connection.send(Message::with_correlation(
            self.correlation_id,
            FileUploadResponse::echo(&request),
        )) {
            self.accepted.remove(&self.correlation_id);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn refuse(self) -> Result<(), ClientError> {
        info!("refused upload of {}", self.request.file_name);
        let reply = Message::with_correlation(
            self.correlation_id,
            FileUploadResponse::echo(&self.request),
        )
        .with_error(UPLOAD_REFUSED);
        self.connection.send(reply)?;
        Ok(())
    }
}

impl std::fmt::Debug for UploadInvitation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadInvitation")
            .field("correlation_id", &self.correlation_id)
            .field("file_name", &self.request.file_name)
            .field("total_bytes", &self.request.total_bytes)
            .finish()
    }
}

/// Handles one [`FileUploadRequest`] on the receiving side and returns the
/// event to surface, if any.  Chunks are written only for uploads in
/// `accepted`, to the destination recorded there.
pub(crate) fn receive(
    connection: &Connection,
    files: &Arc<dyn FileStore>,
    accepted: &AcceptedUploads,
    correlation_id: Uuid,
    request: FileUploadRequest,
) -> Option<ClientEvent> {
    if request.current_position == 0 {
        return Some(ClientEvent::UploadRequested(UploadInvitation {
            connection: connection.clone(),
            correlation_id,
            request,
            files: Arc::clone(files),
            accepted: accepted.clone(),
        }));
    }

    let mut echo = FileUploadResponse::echo(&request);
    let Some(destination) = accepted.destination(&correlation_id) else {
        warn!("upload {correlation_id}: chunk for an upload that was never accepted, refusing");
        echo.delete_callback_on_receipt = true;
        let reply = Message::with_correlation(correlation_id, echo)
            .with_error(format!("no accepted upload {correlation_id}"));
        if let Err(e) = connection.send(reply) {
            debug!("upload {correlation_id}: {e}");
        }
        return None;
    };

    echo.destination_path = destination.display().to_string();
    let reply = match files.append(&destination, &request.bytes_to_write) {
        Ok(()) => Message::with_correlation(correlation_id, echo.clone()),
        Err(e) => {
            warn!("upload {correlation_id}: writing {} failed: {e}", destination.display());
            echo.delete_callback_on_receipt = true;
            Message::with_correlation(correlation_id, echo.clone())
                .with_error(format!("could not write {}: {e}", destination.display()))
        }
    };
    let failed = reply.error.clone();
    if let Err(e) = connection.send(reply) {
        debug!("upload {correlation_id}: {e}");
    }

    let status = match failed {
        Some(error) => UploadStatus::Failed(error),
        None if echo.is_complete() => UploadStatus::Completed,
        None => UploadStatus::InProgress,
    };
    if status != UploadStatus::InProgress {
        accepted.remove(&correlation_id);
    }
    Some(ClientEvent::UploadProgress(UploadProgress::of(&echo, status)))
}
