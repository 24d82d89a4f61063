//! Client for the remote fingerprint-profile provider.
//!
//! A profile is created from caller-supplied options, started to obtain a
//! connectable browser endpoint, and deleted when the script is done with
//! it. The provider reports failures in-band as `{"status": "ERROR",
//! "value": "..."}`, which surface as [`RunError::Profile`].

use crate::error::RunError;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ProfileClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl ProfileClient {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn with_token(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.query(&[("token", token)]),
            None => req,
        }
    }

    /// Create a profile from the given options; returns the provider's id.
    pub async fn create(&self, options: &Value) -> Result<String, RunError> {
        let url = format!("{}/profile", self.base);
        let req = self.with_token(self.http.post(&url)).json(options);
        let rs = send(req).await?;
        check_status(&rs)?;
        rs.get("uuid")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| RunError::Profile("provider response is missing the profile id".into()))
    }

    /// Start a profile; returns the browser's debugger websocket url.
    pub async fn start(&self, id: &str) -> Result<String, RunError> {
        let url = format!("{}/profile/{id}/start", self.base);
        let req = self.with_token(self.http.get(&url));
        let rs = send(req).await?;
        check_status(&rs)?;
        rs.get("ws")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| RunError::Profile("provider response is missing the ws endpoint".into()))
    }

    /// Delete a profile.
    pub async fn remove(&self, id: &str) -> Result<(), RunError> {
        let url = format!("{}/profile/{id}", self.base);
        let req = self.with_token(self.http.delete(&url));
        let rs = send(req).await?;
        check_status(&rs)?;
        debug!(id = %id, "profile deleted");
        Ok(())
    }
}

async fn send(req: reqwest::RequestBuilder) -> Result<Value, RunError> {
    req.send()
        .await
        .map_err(|e| RunError::Profile(format!("provider unreachable: {e}")))?
        .json::<Value>()
        .await
        .map_err(|e| RunError::Profile(format!("provider returned a non-json body: {e}")))
}

fn check_status(rs: &Value) -> Result<(), RunError> {
    if rs.get("status").and_then(Value::as_str) == Some("ERROR") {
        let detail = rs
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or("unspecified error");
        return Err(RunError::Profile(detail.to_string()));
    }
    Ok(())
}
