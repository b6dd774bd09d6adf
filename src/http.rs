//! HTTP client used for cache misses, outbox replay and health probes.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::config::{ApiConfig, Route};
use crate::error::NetworkError;
use crate::outbox::ApplyRegistry;

/// REST client wrapper
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  base_url: String,
  health_path: String,
}

impl HttpClient {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: config.base_url.trim_end_matches('/').to_string(),
      health_path: config.health_path.clone(),
    })
  }

  /// Resolve `path` against the base URL, keeping any base path prefix.
  fn url(&self, path: &str) -> Result<Url, NetworkError> {
    let joined = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
    Url::parse(&joined).map_err(|e| NetworkError::Request(format!("Invalid URL {}: {}", joined, e)))
  }

  /// GET a JSON document.
  pub async fn get_json(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Value, NetworkError> {
    let mut url = self.url(endpoint)?;
    if !params.is_empty() {
      url.query_pairs_mut().extend_pairs(params);
    }

    let resp = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| NetworkError::Request(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
      let body = resp.text().await.unwrap_or_default();
      return Err(NetworkError::Status {
        status: status.as_u16(),
        body,
      });
    }

    let bytes = resp
      .bytes()
      .await
      .map_err(|e| NetworkError::Request(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| NetworkError::Decode(e.to_string()))
  }

  /// Send a JSON payload as described by `route`. Any non-2xx status is an error.
  pub async fn send(&self, route: &Route, payload: &Value) -> Result<(), NetworkError> {
    let method = Method::from_bytes(route.method.as_bytes())
      .map_err(|_| NetworkError::Request(format!("Invalid HTTP method {}", route.method)))?;
    let url = self.url(&route.path)?;
    let body = serde_json::to_vec(payload).map_err(|e| NetworkError::Request(e.to_string()))?;

    let resp = self
      .client
      .request(method, url)
      .header(CONTENT_TYPE, "application/json")
      .body(body)
      .send()
      .await
      .map_err(|e| NetworkError::Request(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
      let body = resp.text().await.unwrap_or_default();
      return Err(NetworkError::Status {
        status: status.as_u16(),
        body,
      });
    }

    Ok(())
  }

  /// Whether the health endpoint answers with a success status.
  pub async fn is_reachable(&self) -> bool {
    let Ok(url) = self.url(&self.health_path) else {
      return false;
    };
    matches!(self.client.get(url).send().await, Ok(resp) if resp.status().is_success())
  }

  /// Build the outbox apply table from configured routes.
  pub fn apply_registry(&self, routes: &BTreeMap<String, Route>) -> ApplyRegistry {
    let mut registry = ApplyRegistry::new();
    for (op_type, route) in routes {
      let client = self.clone();
      let route = route.clone();
      registry.register(op_type.clone(), move |op| {
        let client = client.clone();
        let route = route.clone();
        async move { client.send(&route, &op.payload).await }
      });
    }
    registry
  }
}
