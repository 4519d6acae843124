//! Registry checkin.
//!
//! After a module's content changed, its directory tree is reported to the
//! mirror registry: a JSON document, zstd-compressed and base64 (URL-safe)
//! encoded, sent as the single string argument of an XML-RPC `checkin`
//! call. Failures are retried with a linear backoff and never fail the run.

use crate::config::{CheckinConfig, Config, ModuleSpec};
use crate::{MirrorError, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

const ZSTD_LEVEL: i32 = 3;

/// Build the checkin document for one module
pub fn build_payload(config: &Config, module: &ModuleSpec, category: &str, dirs: &BTreeSet<String>) -> Value {
    let checkin = &config.checkin;
    let host = module
        .host_override
        .clone()
        .unwrap_or_else(|| config.checkin_host());

    let dirtree: Map<String, Value> = dirs
        .iter()
        .map(|dir| (dir.clone(), Value::Object(Map::new())))
        .collect();

    let mut payload = json!({
        "global": { "enabled": "1", "server": checkin.endpoint },
        "site": {
            "enabled": "1",
            "name": checkin.site.clone().unwrap_or_default(),
            "password": checkin.password.clone().unwrap_or_default(),
        },
        "host": { "enabled": "1", "name": host },
        "stats": {},
    });
    payload[category] = json!({ "enabled": "1", "dirtree": dirtree });
    payload
}

/// JSON -> zstd -> URL-safe base64
pub fn encode_payload(payload: &Value) -> Result<String> {
    let raw = serde_json::to_vec(payload)?;
    let compressed = zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)
        .map_err(|e| MirrorError::Compression(e.to_string()))?;
    Ok(URL_SAFE.encode(compressed))
}

/// Inverse of [`encode_payload`]
pub fn decode_payload(encoded: &str) -> Result<Value> {
    let compressed = URL_SAFE
        .decode(encoded.trim())
        .map_err(|e| MirrorError::Compression(format!("base64: {}", e)))?;
    let raw = zstd::decode_all(compressed.as_slice())
        .map_err(|e| MirrorError::Compression(e.to_string()))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Wrap an encoded payload into an XML-RPC `checkin` call
pub fn wrap_xmlrpc(encoded: &str) -> String {
    // The URL-safe alphabet needs no XML escaping
    format!(
        "<?xml version='1.0'?>\n<methodCall>\n<methodName>checkin</methodName>\n<params>\n<param>\n<value><string>{}</string></value>\n</param>\n</params>\n</methodCall>\n",
        encoded
    )
}

/// Whether the registry response (tags stripped, case-insensitive)
/// contains the success marker
pub fn response_indicates_success(body: &str, marker: &str) -> bool {
    let text = match Regex::new("<[^>]*>") {
        Ok(tags) => tags.replace_all(body, "").into_owned(),
        Err(_) => body.to_string(),
    };
    text.to_lowercase().contains(&marker.to_lowercase())
}

/// Sends checkins with linear backoff
#[derive(Debug, Clone)]
pub struct CheckinClient {
    client: reqwest::Client,
    endpoint: String,
    max_attempts: u32,
    retry_delay: Duration,
    success_marker: String,
}

impl CheckinClient {
    pub fn new(endpoint: String, max_attempts: u32, retry_delay: Duration, timeout: Duration, success_marker: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mirror-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            max_attempts: max_attempts.max(1),
            retry_delay,
            success_marker,
        })
    }

    pub fn from_config(config: &CheckinConfig) -> Result<Self> {
        Self::new(
            config.endpoint.clone(),
            config.max_retries,
            Duration::from_secs(config.retry_delay_secs),
            Duration::from_secs(config.timeout_secs),
            config.success_marker.clone(),
        )
    }

    /// Send one encoded payload; succeeds once the registry acknowledges it
    pub async fn checkin(&self, label: &str, encoded: &str) -> Result<()> {
        let body = wrap_xmlrpc(encoded);
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            debug!("Checkin for {} (attempt {}/{})", label, attempt, self.max_attempts);

            match self
                .client
                .post(&self.endpoint)
                .header(CONTENT_TYPE, "text/xml")
                .body(body.clone())
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    let text = resp.text().await.unwrap_or_default();
                    if response_indicates_success(&text, &self.success_marker) {
                        info!("Checkin for {} accepted", label);
                        return Ok(());
                    }
                    last_error = format!("unexpected response: {}", text.trim());
                }
                Ok(resp) => {
                    last_error = format!("HTTP {}", resp.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_attempts {
                let delay = self.retry_delay.saturating_mul(attempt);
                warn!(
                    "Checkin for {} failed ({}), retrying in {:?}",
                    label, last_error, delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(MirrorError::Checkin(format!(
            "{} after {} attempts: {}",
            label, self.max_attempts, last_error
        )))
    }
}
