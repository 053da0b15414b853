//! Boundary to the school records service.

mod http;
mod scripted;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

use crate::config::EndpointTable;
use crate::error::{SyncError, SyncResult};
use crate::ident::RemoteId;
use crate::payload::{EntityKind, MutationPayload, Operation};

pub use http::HttpRemote;
pub use scripted::{RecordedCall, ScriptedRemote};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Delete => "DELETE",
    })
  }
}

/// Method and path for one remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  pub method: Method,
  pub path: String,
}

impl Route {
  /// Create endpoint for `kind`.
  pub fn create(table: &EndpointTable, kind: &EntityKind) -> SyncResult<Self> {
    Ok(Self {
      method: Method::Post,
      path: table.collection(kind)?.to_string(),
    })
  }

  /// Endpoint for a queued mutation. Fails if the target is still temporary.
  pub fn for_mutation(table: &EndpointTable, payload: &MutationPayload) -> SyncResult<Self> {
    let collection = table.collection(&payload.kind)?;
    let target = payload.remote_target()?;

    let (method, target) = match payload.operation {
      Operation::Create => return Self::create(table, &payload.kind),
      Operation::Update => (Method::Put, target),
      Operation::Delete => (Method::Delete, target),
    };
    let target = target.ok_or_else(|| {
      SyncError::InvalidIdentifier(format!("{} of {} without a target", method, payload.kind))
    })?;

    Ok(Self {
      method,
      path: format!("{}/{}", collection, target),
    })
  }
}

/// Request/response service the sync core talks to.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  /// Idempotent read.
  async fn get(&self, path: &str) -> SyncResult<Value>;

  /// Create, update or delete. `body` is `None` for deletes.
  async fn send(&self, method: Method, path: &str, body: Option<Value>) -> SyncResult<Value>;
}

/// Pull the server-assigned id out of a create response.
pub fn extract_id(response: &Value, id_field: &str) -> SyncResult<RemoteId> {
  match response.get(id_field) {
    Some(Value::String(s)) if !s.is_empty() => RemoteId::new(s.clone()),
    Some(Value::Number(n)) => RemoteId::new(n.to_string()),
    _ => Err(SyncError::MalformedResponse(format!(
      "create response has no usable {:?} field",
      id_field
    ))),
  }
}
