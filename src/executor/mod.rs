use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::edges::{DerivedEdges, PromotionEdge};
use crate::manifest::Digest;
use crate::registry::RegistryClient;

#[derive(Debug, Clone, Serialize)]
pub struct EdgeFailure {
    pub edge: EdgeSummary,
    pub cause: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeSummary {
    pub src_registry: String,
    pub src_image_name: String,
    pub src_digest: String,
    pub dst_registry: String,
    pub dst_image_name: String,
    pub dst_tag: Option<String>,
}

impl From<&PromotionEdge> for EdgeSummary {
    fn from(e: &PromotionEdge) -> Self {
        EdgeSummary {
            src_registry: e.src_registry.clone(),
            src_image_name: e.src_image_name.clone(),
            src_digest: e.src_digest.to_string(),
            dst_registry: e.dst_registry.clone(),
            dst_image_name: e.dst_image_name.clone(),
            dst_tag: e.dst_tag.as_ref().map(|t| t.to_string()),
        }
    }
}

/// Result of running the executor over a batch: which edges ran, and a
/// JSON-serializable summary of any that failed (§7 "Propagation": a
/// `json-log-summary` dump to stderr).
#[derive(Debug, Default, Serialize)]
pub struct ExecutionReport {
    pub succeeded: usize,
    pub failures: Vec<EdgeFailure>,
    pub dry_run: bool,
}

impl ExecutionReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Resolves a `RegistryContext.name` to a connected `RegistryClient`; the
/// executor needs both the source (to name the cross-repo mount's `from`)
/// and destination (to issue it) clients.
pub trait RegistryPool: Send + Sync {
    fn get(&self, registry_name: &str) -> Option<Arc<dyn RegistryClient>>;
}

impl RegistryPool for BTreeMap<String, Arc<dyn RegistryClient>> {
    fn get(&self, registry_name: &str) -> Option<Arc<dyn RegistryClient>> {
        BTreeMap::get(self, registry_name).cloned()
    }
}

/// Drains a derived edge set through a bounded worker pool, honoring the
/// manifest-list dependency DAG (children before parents): a ready/pending
/// queue promotes a manifest-list parent only once every child digest it
/// names has completed.
pub struct PromotionExecutor {
    threads: usize,
    confirm: bool,
}

impl PromotionExecutor {
    pub fn new(threads: usize, confirm: bool) -> Self {
        PromotionExecutor {
            threads: threads.max(1),
            confirm,
        }
    }

    pub async fn execute(
        &self,
        derived: &DerivedEdges,
        registries: &dyn RegistryPool,
    ) -> Result<ExecutionReport, anyhow::Error> {
        if !self.confirm {
            for edge in &derived.edges {
                info!(
                    src = %edge.src_registry, src_image = %edge.src_image_name, digest = %edge.src_digest,
                    dst = %edge.dst_registry, dst_image = %edge.dst_image_name,
                    "dry-run: would promote edge"
                );
            }
            return Ok(ExecutionReport {
                succeeded: derived.edges.len(),
                failures: Vec::new(),
                dry_run: true,
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.threads));
        let completed: Arc<tokio::sync::RwLock<HashSet<usize>>> = Arc::new(tokio::sync::RwLock::new(HashSet::new()));
        let dependencies: BTreeMap<usize, Vec<Digest>> = derived.dependencies.iter().cloned().collect();

        // Indices whose dependencies are all satisfied are ready immediately.
        let dependents_by_child: BTreeMap<Digest, Vec<usize>> = {
            let mut map: BTreeMap<Digest, Vec<usize>> = BTreeMap::new();
            for (idx, children) in &dependencies {
                for child in children {
                    map.entry(child.clone()).or_default().push(*idx);
                }
            }
            map
        };

        let mut ready: Vec<usize> = (0..derived.edges.len())
            .filter(|idx| !dependencies.contains_key(idx))
            .collect();
        let mut pending: HashSet<usize> = dependencies.keys().copied().collect();

        let mut failures = Vec::new();
        let mut succeeded = 0usize;

        while !ready.is_empty() || !pending.is_empty() {
            if ready.is_empty() {
                // Every remaining pending edge is blocked on a child that
                // will never complete (a cycle, or a child that itself
                // failed) — report and stop rather than spin forever.
                for idx in pending.drain() {
                    failures.push(EdgeFailure {
                        edge: EdgeSummary::from(&derived.edges[idx]),
                        cause: "blocked on a manifest-list child that never completed".to_string(),
                        attempts: 0,
                    });
                }
                break;
            }

            let batch = std::mem::take(&mut ready);
            let mut handles = Vec::with_capacity(batch.len());
            for idx in batch {
                let edge = derived.edges[idx].clone();
                let semaphore = semaphore.clone();
                let dst_client = registries.get(&edge.dst_registry);
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = run_edge(&edge, dst_client).await;
                    (idx, edge, result)
                }));
            }

            for handle in handles {
                let (idx, edge, result) = handle.await?;
                match result {
                    Ok(()) => {
                        succeeded += 1;
                        completed.write().await.insert(idx);
                        if let Some(newly_ready) = dependents_by_child.get(&edge.src_digest) {
                            for &dep_idx in newly_ready {
                                if !pending.contains(&dep_idx) {
                                    continue;
                                }
                                let children = &dependencies[&dep_idx];
                                let done = completed.read().await;
                                if children.iter().all(|c| {
                                    derived.edges.iter().enumerate().any(|(i, e)| &e.src_digest == c && done.contains(&i))
                                }) {
                                    drop(done);
                                    pending.remove(&dep_idx);
                                    ready.push(dep_idx);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(src_image = %edge.src_image_name, dst = %edge.dst_registry, error = %e, "edge failed");
                        failures.push(EdgeFailure {
                            edge: EdgeSummary::from(&edge),
                            cause: e.to_string(),
                            attempts: 1,
                        });
                    }
                }
            }
        }

        Ok(ExecutionReport {
            succeeded,
            failures,
            dry_run: false,
        })
    }

    /// Optional post-pass deleting destination entries not named in the
    /// manifest (`deleteExtraTags`); reuses the same worker pool shape as
    /// `execute` with a delete-shaped operation instead of a copy.
    pub async fn garbage_collect(
        &self,
        extras: &[(String, String, crate::manifest::Tag)],
        registries: &dyn RegistryPool,
    ) -> Result<ExecutionReport, anyhow::Error> {
        if !self.confirm {
            return Ok(ExecutionReport {
                succeeded: extras.len(),
                failures: Vec::new(),
                dry_run: true,
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.threads));
        let mut handles = Vec::with_capacity(extras.len());
        for (registry_name, image_name, tag) in extras.iter().cloned() {
            let semaphore = semaphore.clone();
            let client = registries.get(&registry_name);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let Some(client) = client else {
                    return Err(anyhow::anyhow!("no connected client for registry {}", registry_name));
                };
                client.delete_tag(&image_name, &tag).await
            }));
        }

        let mut report = ExecutionReport::default();
        for (handle, (registry_name, image_name, tag)) in handles.into_iter().zip(extras.iter()) {
            match handle.await? {
                Ok(()) => report.succeeded += 1,
                Err(e) => report.failures.push(EdgeFailure {
                    edge: EdgeSummary {
                        src_registry: String::new(),
                        src_image_name: String::new(),
                        src_digest: String::new(),
                        dst_registry: registry_name.clone(),
                        dst_image_name: image_name.clone(),
                        dst_tag: Some(tag.to_string()),
                    },
                    cause: e.to_string(),
                    attempts: 1,
                }),
            }
        }
        Ok(report)
    }
}

/// A single edge becomes one registry-side mount plus, if a tag is
/// specified, a manifest write naming that tag (§4.5 "Per-edge operation").
/// Content is never streamed through this process.
async fn run_edge(edge: &PromotionEdge, dst_client: Option<Arc<dyn RegistryClient>>) -> Result<(), anyhow::Error> {
    let dst_client = dst_client.ok_or_else(|| anyhow::anyhow!("no connected client for registry {}", edge.dst_registry))?;

    let mounted = dst_client
        .mount_blob(&edge.dst_image_name, &edge.src_digest, &edge.src_image_name)
        .await?;
    if !mounted {
        anyhow::bail!(
            "mount of {} from {} failed: source blob not found at destination-visible path",
            edge.src_digest,
            edge.src_image_name
        );
    }

    if let Some(tag) = &edge.dst_tag {
        let (manifest_bytes, media_type) = dst_client
            .fetch_manifest(&edge.dst_image_name, edge.src_digest.as_str())
            .await?;
        dst_client
            .put_manifest(&edge.dst_image_name, Some(tag), &manifest_bytes, &media_type)
            .await?;
    }

    Ok(())
}
