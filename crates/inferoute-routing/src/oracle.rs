use std::time::Duration;

use inferoute_types::{RouterError, RouterResult};
use serde::Deserialize;

const ORACLE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct OracleAdvice {
    url: Option<String>,
}

/// Client for the external KV-cache controller oracle.
///
/// The oracle knows which engine most likely holds a warm prefix for a
/// request key and answers with a preferred URL (or none). It sits on the
/// routing hot path, so the call is tightly bounded; any failure maps to
/// `OracleUnavailable` and the caller falls back to consistent hashing.
pub struct OracleClient {
    client: reqwest::Client,
    base_url: String,
}

impl OracleClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Ask for the preferred endpoint for `key` (a prefix digest) on `model`.
    pub async fn advise(&self, model: Option<&str>, key: &str) -> RouterResult<Option<String>> {
        let mut request = self
            .client
            .get(format!(
                "{}/v1/advise",
                self.base_url.trim_end_matches('/')
            ))
            .query(&[("key", key)])
            .timeout(ORACLE_TIMEOUT);
        if let Some(model) = model {
            request = request.query(&[("model", model)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RouterError::oracle_unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RouterError::oracle_unavailable(format!(
                "oracle answered {}",
                response.status()
            )));
        }
        let advice: OracleAdvice = response
            .json()
            .await
            .map_err(|e| RouterError::oracle_unavailable(format!("malformed advice: {e}")))?;
        Ok(advice.url)
    }
}
