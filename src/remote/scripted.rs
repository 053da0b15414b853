//! In-process stand-in for the records service.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{Method, RemoteApi};
use crate::connectivity::Reachability;
use crate::error::{SyncError, SyncResult};

/// A call the scripted remote received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
}

type Rule = Box<dyn Fn(&RecordedCall) -> bool + Send + Sync>;

#[derive(Default)]
struct Script {
  calls: Vec<RecordedCall>,
  reads: HashMap<String, Value>,
  rejections: Vec<Rule>,
  offline: bool,
  next_id: u64,
}

/// Remote service double with programmable failures.
///
/// Creates answer `{"id": "R<n>"}` with `n` counting from 1. Every call is
/// recorded, including the ones that fail.
#[derive(Default)]
pub struct ScriptedRemote {
  script: Mutex<Script>,
}

impl ScriptedRemote {
  pub fn new() -> Self {
    Self::default()
  }

  fn script(&self) -> MutexGuard<'_, Script> {
    // A panic while holding the lock only happens inside a failing test.
    self.script.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Fail every call with [`SyncError::NetworkUnavailable`] while set.
  pub fn set_offline(&self, offline: bool) {
    self.script().offline = offline;
  }

  /// Body returned for GET `path`.
  pub fn respond_to(&self, path: &str, value: Value) {
    self.script().reads.insert(path.to_string(), value);
  }

  /// Reject with 422 every call matching `rule`.
  pub fn reject_when(&self, rule: impl Fn(&RecordedCall) -> bool + Send + Sync + 'static) {
    self.script().rejections.push(Box::new(rule));
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.script().calls.clone()
  }

  fn handle(&self, call: RecordedCall) -> SyncResult<Value> {
    let mut script = self.script();
    script.calls.push(call.clone());

    if script.offline {
      return Err(SyncError::NetworkUnavailable("connection refused".into()));
    }
    if script.rejections.iter().any(|rule| rule(&call)) {
      return Err(SyncError::RemoteRejected {
        status: 422,
        message: "rejected by script".into(),
      });
    }

    match call.method {
      Method::Get => script
        .reads
        .get(&call.path)
        .cloned()
        .ok_or_else(|| SyncError::RemoteRejected {
          status: 404,
          message: "Not Found".into(),
        }),
      Method::Post => {
        script.next_id += 1;
        let mut created = call.body.unwrap_or_else(|| json!({}));
        if let Value::Object(map) = &mut created {
          map.insert("id".into(), json!(format!("R{}", script.next_id)));
        }
        Ok(created)
      }
      Method::Put => Ok(call.body.unwrap_or(Value::Null)),
      Method::Delete => Ok(Value::Null),
    }
  }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
  async fn get(&self, path: &str) -> SyncResult<Value> {
    self.handle(RecordedCall {
      method: Method::Get,
      path: path.to_string(),
      body: None,
    })
  }

  async fn send(&self, method: Method, path: &str, body: Option<Value>) -> SyncResult<Value> {
    self.handle(RecordedCall {
      method,
      path: path.to_string(),
      body,
    })
  }
}

#[async_trait]
impl Reachability for ScriptedRemote {
  async fn reachable(&self) -> bool {
    !self.script().offline
  }
}
