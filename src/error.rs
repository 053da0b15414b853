//! Error types for the offline write/sync core.

use thiserror::Error;

use crate::ident::LocalId;

/// Result type for sync core operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the store, queue, registry, gate and orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
  /// The durable store has no room left. Fatal for the local action.
  #[error("local storage is full")]
  StorageExhausted,

  /// Any other durable store failure.
  #[error("storage error: {0}")]
  Storage(String),

  /// The remote service could not be reached (offline, DNS, timeout).
  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  /// The remote service answered but refused the request.
  #[error("remote rejected request ({status}): {message}")]
  RemoteRejected { status: u16, message: String },

  /// The remote service answered with something we cannot use.
  #[error("malformed response: {0}")]
  MalformedResponse(String),

  /// A payload still points at a temporary entity that has not synced.
  #[error("dependency not yet synced: {0}")]
  DependencyUnresolved(LocalId),

  /// No queue entry or temporary entity with that id.
  #[error("not found: {0}")]
  NotFound(String),

  /// Another sync pass or single-item sync is running.
  #[error("a sync is already in progress")]
  SyncInProgress,

  /// A server-assigned id collided with the temporary id prefix.
  #[error("identifier {0:?} uses the reserved temporary prefix")]
  ReservedPrefix(String),

  /// Text that does not parse as the expected kind of identifier.
  #[error("invalid identifier: {0:?}")]
  InvalidIdentifier(String),

  /// The configured service URL cannot be used.
  #[error("invalid url: {0}")]
  InvalidUrl(String),

  /// No endpoint is configured for this entity kind.
  #[error("no endpoint configured for kind {0:?}")]
  UnknownKind(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl SyncError {
  /// Whether the error came from talking to the remote service, as opposed
  /// to a local failure that should bubble to the caller.
  pub fn is_remote(&self) -> bool {
    matches!(
      self,
      Self::NetworkUnavailable(_)
        | Self::RemoteRejected { .. }
        | Self::MalformedResponse(_)
        | Self::ReservedPrefix(_)
    )
  }

  /// Local persistence failures. These abort whatever is running instead of
  /// being counted as a failed item.
  pub fn is_storage(&self) -> bool {
    matches!(self, Self::StorageExhausted | Self::Storage(_))
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    match e.sqlite_error_code() {
      Some(rusqlite::ErrorCode::DiskFull) => Self::StorageExhausted,
      _ => Self::Storage(e.to_string()),
    }
  }
}
