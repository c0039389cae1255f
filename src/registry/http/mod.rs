mod auth;
mod request_runner;
mod transport;
mod util;

use std::sync::Arc;

use anyhow::{bail, Context, Error};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use hyper::{Body, Client};
use serde::Deserialize;

use crate::credentials::CredentialSource;
use crate::manifest::{Digest, RegistryContext, Tag};
use crate::ratelimit::{RateLimiter, RetryPolicy};

use self::auth::AuthResponse;
use self::transport::HttpTransport;
use self::util::{dump_body_bytes, dump_body_to_string};

use super::{PathListing, RegistryClient};

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, application/vnd.docker.distribution.manifest.list.v2+json, application/vnd.oci.image.manifest.v1+json, application/vnd.oci.image.index.v1+json";

/// Extended `tags/list` response shape (GCR/Artifact Registry style): a
/// plain Docker v2 registry only returns `name`/`tags`, but every registry
/// the engine targets in practice also returns `manifest` (digest -> tag
/// list) and `child` (sub-paths), which is what makes §4.2's recursive
/// listing possible without one request per image.
#[derive(Debug, Deserialize, Default)]
struct TagsListResponse {
    #[serde(default)]
    #[allow(dead_code)]
    name: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    child: Vec<String>,
    #[serde(default)]
    manifest: std::collections::BTreeMap<String, ManifestTagInfo>,
}

#[derive(Debug, Deserialize, Default)]
struct ManifestTagInfo {
    #[serde(default)]
    tag: Vec<String>,
}

/// Concrete `RegistryClient` talking the Docker Registry v2 HTTP API. Built
/// on `HttpTransport` for the rate-limited/retrying/auth-refreshing request
/// plumbing; this layer only knows how to shape v2 paths and parse the
/// handful of response bodies the engine cares about.
pub struct HttpRegistryClient {
    registry_uri: Uri,
    namespace: String,
    name: String,
    transport: HttpTransport,
}

impl HttpRegistryClient {
    pub async fn connect(
        registry: &RegistryContext,
        credentials: Arc<dyn CredentialSource>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, Error> {
        let (host, namespace) = split_host_and_namespace(&registry.name);

        let mut uri_parts = host.parse::<Uri>()?.into_parts();
        if uri_parts.scheme.is_none() {
            uri_parts.scheme = Some("https".parse()?);
        }
        uri_parts.path_and_query = Some("/".try_into()?);
        let registry_uri = Uri::from_parts(uri_parts)?;

        let tls = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_native_roots()
            .with_no_client_auth();
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();
        let inner_client: Client<_> = Client::builder().build::<_, Body>(https);

        let transport = HttpTransport {
            inner_client,
            auth_info: Arc::new(tokio::sync::Mutex::new(None::<AuthResponse>)),
            credentials,
            registry_name: registry.name.clone(),
            service_account: registry.service_account.clone(),
            limiter,
            retry_policy: RetryPolicy::promotion_default(),
            cancel: tokio_util::sync::CancellationToken::new(),
        };

        let client = HttpRegistryClient {
            registry_uri: registry_uri.clone(),
            namespace,
            name: registry.name.clone(),
            transport,
        };

        let req_uri = client.v2_from_path("/")?;
        let mut resp = tokio::time::timeout(
            std::time::Duration::from_secs(15),
            client.transport.request_simple(&req_uri, Method::HEAD),
        )
        .await
        .with_context(|| format!("timed out connecting to registry {:?}", registry_uri))??;

        if resp
            .headers()
            .get("docker-distribution-api-version")
            .is_none()
        {
            let body = dump_body_to_string(&mut resp).await.unwrap_or_default();
            bail!(
                "registry {:?} did not present a docker-distribution-api-version header, status {:?}, body:\n{}",
                registry_uri,
                resp.status(),
                body
            );
        }

        Ok(client)
    }

    fn v2_from_path(&self, path: &str) -> Result<Uri, Error> {
        let mut parts = self.registry_uri.clone().into_parts();
        if !path.is_empty() && !path.starts_with('/') {
            bail!("invalid path reference, should start with a /");
        }
        parts.path_and_query = Some(format!("/v2{}", path).try_into()?);
        Ok(Uri::from_parts(parts)?)
    }

    fn repository_path(&self, image_name: &str) -> String {
        if self.namespace.is_empty() {
            format!("/{}", image_name)
        } else {
            format!("/{}/{}", self.namespace, image_name)
        }
    }

    fn repository_uri(&self, image_name: &str, suffix: &str) -> Result<Uri, Error> {
        self.v2_from_path(&format!("{}{}", self.repository_path(image_name), suffix))
    }
}

fn split_host_and_namespace(name: &str) -> (String, String) {
    match name.split_once('/') {
        Some((host, rest)) => (host.to_string(), rest.to_string()),
        None => (name.to_string(), String::new()),
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    fn registry_name(&self) -> &str {
        &self.name
    }

    async fn list_path(&self, path: &str) -> Result<PathListing, Error> {
        let full_path = if self.namespace.is_empty() {
            path.to_string()
        } else if path.is_empty() {
            self.namespace.clone()
        } else {
            format!("{}/{}", self.namespace, path)
        };
        let uri = self.v2_from_path(&format!("/{}/tags/list", full_path))?;

        let mut resp = self.transport.request_simple(&uri, Method::GET).await?;

        if resp.status() == StatusCode::NOT_FOUND {
            // A missing subpath means "empty", not an error (§4.2).
            return Ok(PathListing::default());
        }
        if resp.status() != StatusCode::OK {
            let body = dump_body_to_string(&mut resp).await.unwrap_or_default();
            bail!("listing {:?} failed: {:?}, body:\n{}", uri, resp.status(), body);
        }

        let body = dump_body_bytes(&mut resp).await?;
        let parsed: TagsListResponse = serde_json::from_slice(&body)
            .with_context(|| format!("parsing tags/list response from {:?}", uri))?;

        let mut digest_tags = std::collections::BTreeMap::new();
        for (digest_str, info) in parsed.manifest {
            if let Ok(digest) = Digest::parse(digest_str) {
                let tags = info
                    .tag
                    .into_iter()
                    .filter_map(|t| Tag::parse(t).ok())
                    .collect();
                digest_tags.insert(digest, tags);
            }
        }

        Ok(PathListing {
            tags: parsed.tags.into_iter().filter_map(|t| Tag::parse(t).ok()).collect(),
            digest_tags,
            children: parsed.child,
        })
    }

    async fn fetch_manifest(&self, image_name: &str, reference: &str) -> Result<(Bytes, String), Error> {
        let uri = self.repository_uri(image_name, &format!("/manifests/{}", reference))?;
        let mut resp = self
            .transport
            .request(uri.clone(), (), |_, builder| async move {
                builder
                    .method(Method::GET)
                    .header(http::header::ACCEPT, MANIFEST_ACCEPT)
                    .body(Body::from(""))
                    .map_err(|e| e.into())
            })
            .await?;

        if resp.status() != StatusCode::OK {
            let body = dump_body_to_string(&mut resp).await.unwrap_or_default();
            bail!(
                "fetching manifest {:?} failed: {:?}, body:\n{}",
                uri,
                resp.status(),
                body
            );
        }

        let content_type = resp
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = dump_body_bytes(&mut resp).await?;
        Ok((body, content_type))
    }

    async fn blob_exists(&self, image_name: &str, digest: &Digest) -> Result<bool, Error> {
        let uri = self.repository_uri(image_name, &format!("/blobs/{}", digest))?;
        let resp = self.transport.request_simple(&uri, Method::HEAD).await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => bail!("unexpected status {:?} checking blob {:?}", other, uri),
        }
    }

    async fn mount_blob(&self, dst_image_name: &str, digest: &Digest, from_repo: &str) -> Result<bool, Error> {
        let uri = self.repository_uri(
            dst_image_name,
            &format!("/blobs/uploads/?mount={}&from={}", digest, from_repo),
        )?;
        let mut resp = self.transport.request_simple(&uri, Method::POST).await?;
        match resp.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::ACCEPTED => Ok(false),
            other => {
                let body = dump_body_to_string(&mut resp).await.unwrap_or_default();
                bail!("mount of {} from {} failed: {:?}, body:\n{}", digest, from_repo, other, body)
            }
        }
    }

    async fn put_manifest(
        &self,
        image_name: &str,
        tag: Option<&Tag>,
        manifest_bytes: &[u8],
        media_type: &str,
    ) -> Result<(), Error> {
        let reference = match tag {
            Some(t) => t.as_str().to_string(),
            None => bail!("put_manifest requires a tag or digest reference; an empty dstTag means skip the write entirely (§9)"),
        };
        let uri = self.repository_uri(image_name, &format!("/manifests/{}", reference))?;
        let body = Bytes::copy_from_slice(manifest_bytes);
        let media_type = media_type.to_string();
        let mut resp = self
            .transport
            .request(uri.clone(), (body, media_type), |(body, media_type), builder| async move {
                builder
                    .method(Method::PUT)
                    .header(http::header::CONTENT_TYPE, media_type)
                    .body(Body::from(body))
                    .map_err(|e| e.into())
            })
            .await?;

        if resp.status() != StatusCode::CREATED {
            let body = dump_body_to_string(&mut resp).await.unwrap_or_default();
            bail!(
                "manifest PUT to {:?} failed: {:?}, body:\n{}",
                uri,
                resp.status(),
                body
            );
        }
        Ok(())
    }

    async fn delete_tag(&self, image_name: &str, tag: &Tag) -> Result<(), Error> {
        let uri = self.repository_uri(image_name, &format!("/manifests/{}", tag.as_str()))?;
        let mut resp = self.transport.request_simple(&uri, Method::DELETE).await?;
        if resp.status() != StatusCode::ACCEPTED && resp.status() != StatusCode::OK {
            let body = dump_body_to_string(&mut resp).await.unwrap_or_default();
            bail!("delete of tag {} on {:?} failed: {:?}, body:\n{}", tag, uri, resp.status(), body);
        }
        Ok(())
    }
}
