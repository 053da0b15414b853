//! Mutation payloads and their dependent references.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{SyncError, SyncResult};
use crate::ident::{Identifier, LocalId, RemoteId};

/// Entity kind, e.g. `assessment` or `grade`. Keys the endpoint table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKind(String);

impl EntityKind {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

/// A single payload field: a plain JSON value or a reference to another entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
  Value(Value),
  Ref(Identifier),
}

/// Field map shared by queued mutations and temporary entities.
pub type Fields = BTreeMap<String, Field>;

/// A write the user asked for, in a form that can wait for the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationPayload {
  pub kind: EntityKind,
  pub operation: Operation,
  /// Record being updated or deleted. `None` for creates.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target: Option<Identifier>,
  #[serde(default)]
  pub fields: Fields,
}

impl MutationPayload {
  pub fn create(kind: EntityKind) -> Self {
    Self {
      kind,
      operation: Operation::Create,
      target: None,
      fields: Fields::new(),
    }
  }

  pub fn update(kind: EntityKind, target: Identifier) -> Self {
    Self {
      kind,
      operation: Operation::Update,
      target: Some(target),
      fields: Fields::new(),
    }
  }

  pub fn delete(kind: EntityKind, target: Identifier) -> Self {
    Self {
      kind,
      operation: Operation::Delete,
      target: Some(target),
      fields: Fields::new(),
    }
  }

  pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
    self.fields.insert(name.into(), Field::Value(value));
    self
  }

  pub fn with_ref(mut self, name: impl Into<String>, id: Identifier) -> Self {
    self.fields.insert(name.into(), Field::Ref(id));
    self
  }

  /// Temporary ids this payload still depends on, target first.
  pub fn unresolved(&self) -> impl Iterator<Item = &LocalId> {
    self
      .target
      .iter()
      .filter_map(Identifier::as_local)
      .chain(local_refs(&self.fields))
  }

  pub fn first_unresolved(&self) -> Option<&LocalId> {
    self.unresolved().next()
  }

  /// Replace every reference to `old` with `new`. Returns whether anything changed.
  pub fn rewrite(&mut self, old: &LocalId, new: &RemoteId) -> bool {
    let mut changed = false;
    if let Some(target) = self.target.as_mut() {
      changed |= rewrite_identifier(target, old, new);
    }
    changed |= rewrite_fields(&mut self.fields, old, new);
    changed
  }

  /// Server id of the target, failing if the target is still temporary.
  pub fn remote_target(&self) -> SyncResult<Option<&RemoteId>> {
    match &self.target {
      None => Ok(None),
      Some(Identifier::Remote(id)) => Ok(Some(id)),
      Some(Identifier::Local(id)) => Err(SyncError::DependencyUnresolved(id.clone())),
    }
  }

  /// JSON body for the remote service.
  pub fn to_wire(&self) -> SyncResult<Value> {
    fields_to_wire(&self.fields)
  }
}

/// Flatten a field map to a JSON object, refusing unresolved references.
pub fn fields_to_wire(fields: &Fields) -> SyncResult<Value> {
  let mut body = Map::new();
  for (name, field) in fields {
    let value = match field {
      Field::Value(v) => v.clone(),
      Field::Ref(Identifier::Remote(id)) => Value::String(id.as_str().to_string()),
      Field::Ref(Identifier::Local(id)) => return Err(SyncError::DependencyUnresolved(id.clone())),
    };
    body.insert(name.clone(), value);
  }
  Ok(Value::Object(body))
}

/// Temporary ids referenced from `fields`.
pub(crate) fn local_refs(fields: &Fields) -> impl Iterator<Item = &LocalId> {
  fields.values().filter_map(|f| match f {
    Field::Ref(id) => id.as_local(),
    Field::Value(_) => None,
  })
}

pub(crate) fn rewrite_fields(fields: &mut Fields, old: &LocalId, new: &RemoteId) -> bool {
  let mut changed = false;
  for field in fields.values_mut() {
    if let Field::Ref(id) = field {
      changed |= rewrite_identifier(id, old, new);
    }
  }
  changed
}

fn rewrite_identifier(id: &mut Identifier, old: &LocalId, new: &RemoteId) -> bool {
  match id {
    Identifier::Local(local) if local == old => {
      *id = Identifier::Remote(new.clone());
      true
    }
    _ => false,
  }
}
