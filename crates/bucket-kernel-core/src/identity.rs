use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProviderError {
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
    #[error("identity lookup failed: {0}")]
    Lookup(String),
}

/// Source of the client's network identity (typically its public IP).
pub trait IdentityProvider {
    /// Look up the identity. `Ok(None)` means the provider answered without a usable value.
    ///
    /// # Errors
    /// Returns an error when the provider is missing or the lookup fails.
    fn lookup(&self) -> Result<Option<String>, ProviderError>;
}

/// Source of the client software signature (typically a user-agent string).
pub trait SignatureSource {
    fn signature(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentityProvider;

impl IdentityProvider for NoIdentityProvider {
    fn lookup(&self) -> Result<Option<String>, ProviderError> {
        Err(ProviderError::Unavailable("no identity provider configured".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity(pub String);

impl IdentityProvider for StaticIdentity {
    fn lookup(&self) -> Result<Option<String>, ProviderError> {
        Ok(Some(self.0.clone()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticSignature(pub Option<String>);

impl SignatureSource for StaticSignature {
    fn signature(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    Provider,
    RandomFallback,
}

impl IdentitySource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::RandomFallback => "random_fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKey {
    value: String,
    source: IdentitySource,
}

impl IdentityKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn source(&self) -> IdentitySource {
        self.source
    }

    /// False when the network identity was replaced by a random token.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.source == IdentitySource::Provider
    }
}

#[must_use]
pub fn normalize_identity_key(identity: &str, signature: &str) -> String {
    format!("{identity}|{signature}").trim().to_lowercase()
}

pub struct IdentityKeyBuilder {
    provider: Box<dyn IdentityProvider>,
    signature: Box<dyn SignatureSource>,
}

impl IdentityKeyBuilder {
    #[must_use]
    pub fn new(provider: Box<dyn IdentityProvider>, signature: Box<dyn SignatureSource>) -> Self {
        Self { provider, signature }
    }

    pub fn set_provider(&mut self, provider: Box<dyn IdentityProvider>) {
        self.provider = provider;
    }

    pub fn set_signature_source(&mut self, signature: Box<dyn SignatureSource>) {
        self.signature = signature;
    }

    #[must_use]
    pub fn build(&self) -> IdentityKey {
        let (identity, source) = match self.provider.lookup() {
            Ok(Some(value)) if !value.trim().is_empty() => (value, IdentitySource::Provider),
            Ok(_) => {
                tracing::warn!("identity provider returned an empty value; using random identity");
                (Ulid::new().to_string(), IdentitySource::RandomFallback)
            }
            Err(err) => {
                tracing::warn!(error = %err, "identity lookup unavailable; using random identity");
                (Ulid::new().to_string(), IdentitySource::RandomFallback)
            }
        };
        let signature = self.signature.signature().unwrap_or_default();

        IdentityKey { value: normalize_identity_key(&identity, &signature), source }
    }
}

impl std::fmt::Debug for IdentityKeyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyBuilder").finish_non_exhaustive()
    }
}

impl Default for IdentityKeyBuilder {
    fn default() -> Self {
        Self::new(Box::new(NoIdentityProvider), Box::new(StaticSignature::default()))
    }
}
