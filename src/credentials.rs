use anyhow::Error;
use async_trait::async_trait;

/// Mints per-registry bearer tokens. Modeled as a capability so the engine
/// never has to know how a token was minted — GCP workload identity, a
/// docker credential helper, a static token for tests — matching the
/// teacher's own separation between `HttpCli`'s auth *flow* (challenge/response)
/// and whatever supplies the long-lived credential behind it.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Returns `None` when the registry is public and no `Authorization`
    /// header should be sent at all.
    async fn bearer_token(&self, registry: &str, service_account: Option<&str>) -> Result<Option<String>, Error>;
}

/// No credentials: used for public registries.
pub struct AnonymousCredentialSource;

#[async_trait]
impl CredentialSource for AnonymousCredentialSource {
    async fn bearer_token(&self, _registry: &str, _service_account: Option<&str>) -> Result<Option<String>, Error> {
        Ok(None)
    }
}

/// A fixed token for every registry — used by tests and by simple
/// single-token deployments.
pub struct StaticCredentialSource {
    pub token: String,
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn bearer_token(&self, _registry: &str, _service_account: Option<&str>) -> Result<Option<String>, Error> {
        Ok(Some(self.token.clone()))
    }
}
