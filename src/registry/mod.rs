pub mod http;
pub mod manifest_doc;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;
use bytes::Bytes;

use crate::credentials::CredentialSource;
use crate::manifest::{Digest, RegistryContext, Tag};
use crate::ratelimit::RateLimiter;

pub use manifest_doc::ManifestDoc;

/// One page of the recursive registry listing described in spec §4.2: the
/// tags and digest->tags map observed directly under `path`, plus any child
/// paths to recurse into. Mirrors the extended `tags/list` response shape
/// registries such as GCR/Artifact Registry actually return (`tags`,
/// `manifest`, `child`).
#[derive(Debug, Clone, Default)]
pub struct PathListing {
    pub tags: Vec<Tag>,
    pub digest_tags: BTreeMap<Digest, Vec<Tag>>,
    pub children: Vec<String>,
}

/// The single interface every component (inventory reader, executor, checks)
/// drives a registry through. Kept as one small `async_trait` capability
/// rather than split across several narrower traits, since every method
/// here is used by more than one caller and a finer split would buy nothing
/// extra at this call-site shape.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    fn registry_name(&self) -> &str;

    /// List the tags, digest->tags map, and child paths directly under
    /// `path` (empty string = registry root). Does not recurse; callers
    /// (the inventory reader) drive recursion themselves so that listing
    /// tasks can be scheduled independently across a worker pool.
    async fn list_path(&self, path: &str) -> Result<PathListing, Error>;

    /// Fetch a manifest by tag or digest, returning its bytes and content type.
    async fn fetch_manifest(&self, image_name: &str, reference: &str) -> Result<(Bytes, String), Error>;

    async fn blob_exists(&self, image_name: &str, digest: &Digest) -> Result<bool, Error>;

    /// Instruct this (destination) registry to mount `digest` from
    /// `from_repo` without streaming content through the client. Returns
    /// `true` if the mount succeeded, `false` if the source blob was not
    /// found (a recoverable "lost image" case, not an error).
    async fn mount_blob(&self, dst_image_name: &str, digest: &Digest, from_repo: &str) -> Result<bool, Error>;

    /// Write `manifest_bytes` under `image_name`, optionally also writing a
    /// tag. An empty `tag` means "write by digest only" (spec §9 open
    /// question, resolved that way here).
    async fn put_manifest(
        &self,
        image_name: &str,
        tag: Option<&Tag>,
        manifest_bytes: &[u8],
        media_type: &str,
    ) -> Result<(), Error>;

    async fn delete_tag(&self, image_name: &str, tag: &Tag) -> Result<(), Error>;
}

/// Build a `RegistryClient` for `registry`, authenticating via `credentials`
/// and rate-limiting every request through `limiter`.
pub async fn connect(
    registry: &RegistryContext,
    credentials: Arc<dyn CredentialSource>,
    limiter: Arc<RateLimiter>,
) -> Result<Arc<dyn RegistryClient>, Error> {
    let client = http::HttpRegistryClient::connect(registry, credentials, limiter).await?;
    Ok(Arc::new(client))
}
