//! Per-connection registry of pending continuations.
//!
//! A caller that sends a correlated request registers a continuation under the
//! request's correlation id.  When a response with that id arrives, the inbound
//! worker resolves it here: the continuation runs with the connection and the
//! typed response, and the entry is removed if the response says
//! `delete_callback_on_receipt`.  Streaming exchanges (file uploads, frame
//! pulls) keep their entry until the caller removes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::messages::{Message, ResponseBody};
use crate::transport::connection::Connection;

/// Errors raised when registering a continuation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    /// Another continuation already waits on this correlation id.
    #[error("a continuation is already registered for correlation id {0}")]
    Duplicate(Uuid),

    /// The nil id means "no correlation" and can never be resolved.
    #[error("continuations cannot be registered for the nil correlation id")]
    NilCorrelation,
}

/// A response delivered to a typed continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<R> {
    pub correlation_id: Uuid,
    pub has_error: bool,
    pub error: Option<String>,
    pub body: R,
}

impl<R> Reply<R> {
    pub fn is_ok(&self) -> bool {
        !self.has_error
    }

    /// The error detail, or an empty string.
    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }
}

type Continuation = Box<dyn FnMut(&Connection, Message) + Send>;

// Entries are shared so a continuation can run after the map lock has been
// released; it may then register or remove other entries freely.
type Entry = Arc<Mutex<Continuation>>;

/// Correlation id → pending continuation.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `continuation` for responses of type `R` carrying `id`.
    ///
    /// A response of any other variant arriving under `id` is logged and
    /// dropped without invoking the continuation.
    ///
    /// # Errors
    ///
    /// [`CallbackError::Duplicate`] if `id` is already registered,
    /// [`CallbackError::NilCorrelation`] for the nil id.
    pub fn register<R, F>(&self, id: Uuid, mut continuation: F) -> Result<(), CallbackError>
    where
        R: ResponseBody,
        F: FnMut(&Connection, Reply<R>) + Send + 'static,
    {
        let erased: Continuation = Box::new(move |connection, message| {
            let Message {
                correlation_id,
                has_error,
                error,
                body,
            } = message;
            match R::extract(body) {
                Ok(body) => continuation(
                    connection,
                    Reply {
                        correlation_id,
                        has_error,
                        error,
                        body,
                    },
                ),
                Err(other) => warn!(
                    "continuation {correlation_id} expects {}, dropping {}",
                    R::KIND,
                    other.kind()
                ),
            }
        });
        self.insert(id, erased)
    }

    fn insert(&self, id: Uuid, continuation: Continuation) -> Result<(), CallbackError> {
        if id.is_nil() {
            return Err(CallbackError::NilCorrelation);
        }
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(CallbackError::Duplicate(id));
        }
        entries.insert(id, Arc::new(Mutex::new(continuation)));
        Ok(())
    }

    /// Hands `message` to the continuation registered under its correlation id.
    ///
    /// Returns `false` when nothing was waiting; the message is then dropped.
    /// The registry lock is not held while the continuation runs.
    pub fn resolve(&self, connection: &Connection, message: Message) -> bool {
        let id = message.correlation_id;
        let delete = message.body.delete_callback_on_receipt().unwrap_or(true);

        let entry = {
            let mut entries = self.lock();
            if delete {
                entries.remove(&id)
            } else {
                entries.get(&id).cloned()
            }
        };

        let Some(entry) = entry else {
            debug!("no continuation for {} {id}, dropping", message.kind());
            return false;
        };

        let mut continuation = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        (*continuation)(connection, message);
        true
    }

    /// Removes the continuation for `id`.  Returns `true` if one was present.
    pub fn remove(&self, id: &Uuid) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every pending continuation.  Awaiting callers observe this as
    /// their continuation never running.
    pub fn clear(&self) {
        let drained: Vec<Entry> = self.lock().drain().map(|(_, entry)| entry).collect();
        // Dropped outside the lock: continuations may own senders whose
        // receivers react synchronously.
        drop(drained);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::protocol::messages::{
        EndSessionResponse, FileUploadRequest, FileUploadResponse, ValidationResponse,
    };
    use crate::transport::connection::{ConnectionOptions, NullHandler};

    fn detached_connection() -> Connection {
        let (stream, _peer) = tokio::io::duplex(1024);
        Connection::open(stream, ConnectionOptions::client(), Arc::new(NullHandler))
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (c.clone(), c)
    }

    #[tokio::test]
    async fn test_deleting_response_invokes_exactly_once() {
        let conn = detached_connection();
        let registry = CallbackRegistry::new();
        let id = Uuid::new_v4();
        let (calls, seen) = counter();
        registry
            .register::<ValidationResponse, _>(id, move |_, reply| {
                assert!(reply.body.is_valid);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .expect("register");

        let response = Message::with_correlation(id, ValidationResponse::new(true));
        assert!(registry.resolve(&conn, response.clone()));
        assert!(!registry.resolve(&conn, response), "second delivery must be dropped");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_kept_response_invokes_every_time_until_removed() {
        let conn = detached_connection();
        let registry = CallbackRegistry::new();
        let id = Uuid::new_v4();
        let (calls, seen) = counter();
        registry
            .register::<FileUploadResponse, _>(id, move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .expect("register");

        let echo = FileUploadResponse::echo(&FileUploadRequest::offer("f", "f", 10, 4));
        for _ in 0..3 {
            assert!(registry.resolve(&conn, Message::with_correlation(id, echo.clone())));
        }
        assert!(registry.remove(&id));
        assert!(!registry.resolve(&conn, Message::with_correlation(id, echo)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_correlation_is_silently_dropped() {
        let conn = detached_connection();
        let registry = CallbackRegistry::new();
        let stray = Message::with_correlation(Uuid::new_v4(), EndSessionResponse::default());
        assert!(!registry.resolve(&conn, stray));
    }

    #[tokio::test]
    async fn test_mismatched_variant_does_not_invoke_continuation() {
        let conn = detached_connection();
        let registry = CallbackRegistry::new();
        let id = Uuid::new_v4();
        let (calls, seen) = counter();
        registry
            .register::<ValidationResponse, _>(id, move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .expect("register");

        registry.resolve(&conn, Message::with_correlation(id, EndSessionResponse::default()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = CallbackRegistry::new();
        let id = Uuid::new_v4();
        registry
            .register::<ValidationResponse, _>(id, |_, _| {})
            .expect("first");
        assert_eq!(
            registry.register::<ValidationResponse, _>(id, |_, _| {}),
            Err(CallbackError::Duplicate(id))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_nil_correlation_is_rejected() {
        let registry = CallbackRegistry::new();
        assert_eq!(
            registry.register::<ValidationResponse, _>(Uuid::nil(), |_, _| {}),
            Err(CallbackError::NilCorrelation)
        );
    }

    #[tokio::test]
    async fn test_continuation_may_remove_its_own_entry() {
        let conn = detached_connection();
        let registry = Arc::new(CallbackRegistry::new());
        let id = Uuid::new_v4();
        let inner = registry.clone();
        registry
            .register::<FileUploadResponse, _>(id, move |_, _| {
                inner.remove(&id);
            })
            .expect("register");

        let echo = FileUploadResponse::echo(&FileUploadRequest::offer("f", "f", 10, 4));
        assert!(registry.resolve(&conn, Message::with_correlation(id, echo)));
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_clear_drops_everything() {
        let registry = CallbackRegistry::new();
        for _ in 0..4 {
            registry
                .register::<ValidationResponse, _>(Uuid::new_v4(), |_, _| {})
                .expect("register");
        }
        registry.clear();
        assert!(registry.is_empty());
    }
}
