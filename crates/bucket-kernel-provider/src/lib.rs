use std::time::Duration;

use bucket_kernel_core::{IdentityProvider, ProviderError};
use serde_json::Value;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Looks up the client's public address from a JSON endpoint answering `{"ip": "..."}`.
#[derive(Clone)]
pub struct HttpIdentityProvider {
    url: String,
    agent: ureq::Agent,
}

impl std::fmt::Debug for HttpIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIdentityProvider").field("url", &self.url).finish_non_exhaustive()
    }
}

impl HttpIdentityProvider {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { url: url.into(), agent }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl IdentityProvider for HttpIdentityProvider {
    fn lookup(&self) -> Result<Option<String>, ProviderError> {
        let response = self
            .agent
            .get(&self.url)
            .set("Accept", "application/json")
            .call()
            .map_err(|err| ProviderError::Lookup(format!("GET {}: {err}", self.url)))?;
        let body: Value = response
            .into_json()
            .map_err(|err| ProviderError::Lookup(format!("invalid JSON from {}: {err}", self.url)))?;

        let ip = extract_ip(&body);
        if ip.is_none() {
            tracing::debug!(url = %self.url, "identity response carried no usable ip field");
        }
        Ok(ip)
    }
}

/// The trimmed `ip` field when it is a non-empty string.
#[must_use]
pub fn extract_ip(body: &Value) -> Option<String> {
    body.get("ip")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}
