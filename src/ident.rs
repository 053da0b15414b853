//! Local and server-assigned identifiers.
//!
//! Temporary ids and real ids are separate types. The reserved textual prefix
//! only matters when parsing user input or validating what the server sends.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// Prefix reserved for temporary identifiers.
pub const TEMP_PREFIX: &str = "TEMP_";

/// Device-local, monotonically increasing sequence number.
///
/// Used directly as the id of queue entries and embedded in temporary ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub u64);

impl SequenceId {
  /// Next id after `last`: the current time in milliseconds, bumped past
  /// `last` when the clock has not advanced (or went backwards).
  pub fn next_after(last: Option<SequenceId>, now_millis: u64) -> Self {
    match last {
      Some(SequenceId(prev)) if now_millis <= prev => SequenceId(prev + 1),
      _ => SequenceId(now_millis),
    }
  }
}

impl fmt::Display for SequenceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Identifier of an entity created offline and not yet known to the server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocalId(String);

impl LocalId {
  pub fn from_sequence(seq: SequenceId) -> Self {
    Self(format!("{}{}", TEMP_PREFIX, seq.0))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl TryFrom<String> for LocalId {
  type Error = SyncError;

  fn try_from(value: String) -> SyncResult<Self> {
    if value.starts_with(TEMP_PREFIX) && value.len() > TEMP_PREFIX.len() {
      Ok(Self(value))
    } else {
      Err(SyncError::InvalidIdentifier(value))
    }
  }
}

impl From<LocalId> for String {
  fn from(id: LocalId) -> Self {
    id.0
  }
}

impl fmt::Display for LocalId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Identifier assigned by the remote service. Never carries the temporary prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
  pub fn new(value: impl Into<String>) -> SyncResult<Self> {
    let value = value.into();
    if value.starts_with(TEMP_PREFIX) {
      return Err(SyncError::ReservedPrefix(value));
    }
    Ok(Self(value))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl TryFrom<String> for RemoteId {
  type Error = SyncError;

  fn try_from(value: String) -> SyncResult<Self> {
    Self::new(value)
  }
}

impl From<RemoteId> for String {
  fn from(id: RemoteId) -> Self {
    id.0
  }
}

impl fmt::Display for RemoteId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Either a temporary id or a real one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Identifier {
  Local(LocalId),
  Remote(RemoteId),
}

impl Identifier {
  /// Parse user-supplied text, routing on the reserved prefix.
  pub fn parse(text: &str) -> SyncResult<Self> {
    if text.starts_with(TEMP_PREFIX) {
      LocalId::try_from(text.to_string()).map(Self::Local)
    } else {
      RemoteId::new(text).map(Self::Remote)
    }
  }

  pub fn as_local(&self) -> Option<&LocalId> {
    match self {
      Self::Local(id) => Some(id),
      Self::Remote(_) => None,
    }
  }
}

impl fmt::Display for Identifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Local(id) => id.fmt(f),
      Self::Remote(id) => id.fmt(f),
    }
  }
}
