use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{Method, RemoteApi};
use crate::config::ApiConfig;
use crate::connectivity::Reachability;
use crate::error::{SyncError, SyncResult};

/// HTTP client for the records service.
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base: Url,
  health_path: String,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(api: &ApiConfig, token: Option<String>) -> SyncResult<Self> {
    let base = Url::parse(&api.url)
      .map_err(|e| SyncError::InvalidUrl(format!("{:?}: {}", api.url, e)))?;

    let client = Client::builder()
      .timeout(api.timeout())
      .build()
      .map_err(|e| SyncError::NetworkUnavailable(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base,
      health_path: api.health_path.clone(),
      token,
    })
  }

  /// Absolute URL for a service path. Paths are appended to the base,
  /// so a base of `/api` keeps its prefix.
  fn url(&self, path: &str) -> SyncResult<Url> {
    let joined = format!(
      "{}/{}",
      self.base.as_str().trim_end_matches('/'),
      path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| SyncError::InvalidUrl(format!("{}: {}", joined, e)))
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = match method {
      Method::Get => self.client.get(url),
      Method::Post => self.client.post(url),
      Method::Put => self.client.put(url),
      Method::Delete => self.client.delete(url),
    };
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn execute(&self, method: Method, path: &str, body: Option<Value>) -> SyncResult<Value> {
    let url = self.url(path)?;
    debug!(%method, %url, "Remote call");

    let mut builder = self.request(method, url);
    if let Some(body) = body {
      builder = builder.json(&body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| SyncError::NetworkUnavailable(e.to_string()))?;

    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| SyncError::NetworkUnavailable(e.to_string()))?;

    if !status.is_success() {
      return Err(rejection(status, &text));
    }

    if text.trim().is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_str(&text)
      .map_err(|e| SyncError::MalformedResponse(format!("{} {}: {}", method, path, e)))
  }
}

#[async_trait]
impl RemoteApi for HttpRemote {
  async fn get(&self, path: &str) -> SyncResult<Value> {
    self.execute(Method::Get, path, None).await
  }

  async fn send(&self, method: Method, path: &str, body: Option<Value>) -> SyncResult<Value> {
    self.execute(method, path, body).await
  }
}

#[async_trait]
impl Reachability for HttpRemote {
  /// Whether the health endpoint answers with a success status.
  async fn reachable(&self) -> bool {
    match self.url(&self.health_path) {
      Ok(url) => matches!(
        self.request(Method::Get, url).send().await,
        Ok(resp) if resp.status().is_success()
      ),
      Err(_) => false,
    }
  }
}

/// Turn an error response into [`SyncError::RemoteRejected`], preferring the
/// server's `message`/`error` field over the raw body.
fn rejection(status: StatusCode, body: &str) -> SyncError {
  let message = serde_json::from_str::<Value>(body)
    .ok()
    .and_then(|v| {
      v.get("message")
        .or_else(|| v.get("error"))
        .and_then(Value::as_str)
        .map(String::from)
    })
    .unwrap_or_else(|| {
      let trimmed = body.trim();
      if trimmed.is_empty() {
        status.canonical_reason().unwrap_or("error").to_string()
      } else {
        trimmed.chars().take(200).collect()
      }
    });

  SyncError::RemoteRejected {
    status: status.as_u16(),
    message,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn api(url: &str) -> ApiConfig {
    ApiConfig {
      url: url.to_string(),
      health_path: "/health".into(),
      timeout_secs: 5,
      id_field: "id".into(),
    }
  }

  #[test]
  fn test_url_keeps_base_path() {
    let remote = HttpRemote::new(&api("https://school.example.org/api/"), None).unwrap();
    assert_eq!(
      remote.url("/grades/3").unwrap().as_str(),
      "https://school.example.org/api/grades/3"
    );
    assert_eq!(
      remote.url("subjects?year=2").unwrap().as_str(),
      "https://school.example.org/api/subjects?year=2"
    );
  }

  #[test]
  fn test_rejection_prefers_message_field() {
    let err = rejection(StatusCode::UNPROCESSABLE_ENTITY, r#"{"message":"score out of range"}"#);
    match err {
      SyncError::RemoteRejected { status, message } => {
        assert_eq!(status, 422);
        assert_eq!(message, "score out of range");
      }
      other => panic!("unexpected: {:?}", other),
    }
  }

  #[test]
  fn test_rejection_empty_body_uses_reason() {
    match rejection(StatusCode::FORBIDDEN, "") {
      SyncError::RemoteRejected { message, .. } => assert_eq!(message, "Forbidden"),
      other => panic!("unexpected: {:?}", other),
    }
  }
}
