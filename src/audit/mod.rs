use crate::manifest::{Digest, Manifest, Tag};

/// `CIP_AUDIT_*` environment variables (§6), read once into a typed struct
/// rather than scattered `env::var` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEnv {
    pub gcp_project_id: String,
    pub manifest_repo_url: String,
    pub manifest_repo_branch: String,
    pub manifest_repo_manifest_dir: String,
    pub testcase_uuid: Option<String>,
}

impl AuditEnv {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Ok(AuditEnv {
            gcp_project_id: require_env("CIP_AUDIT_GCP_PROJECT_ID")?,
            manifest_repo_url: require_env("CIP_AUDIT_MANIFEST_REPO_URL")?,
            manifest_repo_branch: require_env("CIP_AUDIT_MANIFEST_REPO_BRANCH")?,
            manifest_repo_manifest_dir: require_env("CIP_AUDIT_MANIFEST_REPO_MANIFEST_DIR")?,
            testcase_uuid: std::env::var("CIP_AUDIT_TESTCASE_UUID").ok(),
        })
    }
}

fn require_env(key: &str) -> Result<String, anyhow::Error> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing required environment variable {}", key))
}

/// One registry mutation the audit verifier is asked to authorize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub registry: String,
    pub image_name: String,
    pub digest: Digest,
    pub tag: Option<Tag>,
    pub is_deletion: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Authorized,
    Rejected(String),
    Retryable(String),
}

/// Fetches the manifest tree that authorizes registry mutations, as of some
/// revision. `git2`-backed in production; tests supply a fixed in-memory
/// implementation.
#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    async fn current_manifests(&self) -> Result<Vec<Manifest>, anyhow::Error>;
}

/// Clones (or fetches, if already cloned) `repo_url`@`branch` and parses the
/// thin manifest tree under `manifest_dir`.
pub struct GitManifestSource {
    repo_url: String,
    branch: String,
    manifest_dir: std::path::PathBuf,
    checkout_dir: std::path::PathBuf,
}

impl GitManifestSource {
    pub fn new(env: &AuditEnv, checkout_dir: impl Into<std::path::PathBuf>) -> Self {
        GitManifestSource {
            repo_url: env.manifest_repo_url.clone(),
            branch: env.manifest_repo_branch.clone(),
            manifest_dir: std::path::PathBuf::from(&env.manifest_repo_manifest_dir),
            checkout_dir: checkout_dir.into(),
        }
    }

    fn sync_repo(&self) -> Result<(), anyhow::Error> {
        if self.checkout_dir.join(".git").exists() {
            let repo = git2::Repository::open(&self.checkout_dir)?;
            let mut remote = repo.find_remote("origin")?;
            remote.fetch(&[&self.branch], None, None)?;
            let fetch_head = repo.find_reference("FETCH_HEAD")?;
            let commit = repo.reference_to_annotated_commit(&fetch_head)?;
            repo.set_head_detached(commit.id())?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
        } else {
            std::fs::create_dir_all(&self.checkout_dir)?;
            let mut builder = git2::build::RepoBuilder::new();
            builder.branch(&self.branch);
            builder.clone(&self.repo_url, &self.checkout_dir)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ManifestSource for GitManifestSource {
    async fn current_manifests(&self) -> Result<Vec<Manifest>, anyhow::Error> {
        self.sync_repo()?;
        let root = self.checkout_dir.join(&self.manifest_dir);
        crate::manifest::parse_thin_manifests_from_dir(&root)
    }
}

/// Long-lived event consumer (§4.8): each event is verified independently
/// against the current manifest tree. No cross-event state — at-least-once
/// delivery from the event source is safe because verification is
/// idempotent.
pub struct AuditVerifier<S: ManifestSource> {
    source: S,
}

impl<S: ManifestSource> AuditVerifier<S> {
    pub fn new(source: S) -> Self {
        AuditVerifier { source }
    }

    pub async fn verify(&self, event: &ChangeEvent) -> VerifyOutcome {
        if event.is_deletion {
            return VerifyOutcome::Rejected(format!(
                "deletions are never authorized: {}/{}@{}",
                event.registry, event.image_name, event.digest
            ));
        }

        let manifests = match self.source.current_manifests().await {
            Ok(m) => m,
            Err(e) => return VerifyOutcome::Retryable(format!("failed to fetch manifest tree: {}", e)),
        };

        for manifest in &manifests {
            let authorized = manifest.registries.iter().any(|r| r.name == event.registry)
                && manifest.images.iter().any(|image| {
                    image.name == event.image_name
                        && image.dmap.get(&event.digest).is_some_and(|tags| {
                            match &event.tag {
                                None => true,
                                Some(t) => tags.contains(t),
                            }
                        })
                });
            if authorized {
                return VerifyOutcome::Authorized;
            }
        }

        VerifyOutcome::Rejected(format!(
            "{}/{}@{} (tag {:?}) does not appear in any current manifest",
            event.registry, event.image_name, event.digest, event.tag
        ))
    }
}
