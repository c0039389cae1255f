use std::sync::Arc;

use futures::future::join_all;

use crate::edges::PromotionEdge;
use crate::inventory::RegInvImage;
use crate::registry::RegistryClient;

#[derive(thiserror::Error, Debug)]
pub enum CheckFailure {
    #[error("image-removal check failed: {0} is promoted in the current snapshot but missing from the proposed one")]
    ImageRemoved(String),
    #[error("image-size check failed: {image} at {digest} is {actual_mib} MiB, exceeds the {limit_mib} MiB limit")]
    ImageTooLarge {
        image: String,
        digest: String,
        actual_mib: u64,
        limit_mib: u64,
    },
    #[error("manifest-list check failed: {image}@{digest} references child {child} which is neither present at source nor being promoted")]
    MissingManifestListChild {
        image: String,
        digest: String,
        child: String,
    },
    #[error("vulnerability check failed: {image}@{digest} has a {severity} finding with a known fix")]
    VulnerabilityFound {
        image: String,
        digest: String,
        severity: String,
    },
    #[error("{0}")]
    Custom(String),
}

/// Severity of a single vulnerability-scanner finding, as queried by
/// `PreCheck::Vulnerability`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(raw: &str) -> Result<Self, anyhow::Error> {
        match raw.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(anyhow::anyhow!("unknown vulnerability severity {:?}, expected one of low/medium/high/critical", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VulnerabilityFinding {
    pub severity: Severity,
    pub has_fix: bool,
}

/// Queries a vulnerability scanner by digest; an external collaborator the
/// `Vulnerability` check drives. Kept as a trait so tests can fake scan
/// results the same way `RegistryClient` fakes registry state.
#[async_trait::async_trait]
pub trait VulnerabilityScanner: Send + Sync {
    async fn scan(&self, image: &str, digest: &str) -> Result<Vec<VulnerabilityFinding>, anyhow::Error>;
}

/// `PreCheck` is a capability sum type (§9 "Polymorphism"), not an open
/// trait hierarchy: the four built-ins plus a `Custom` escape hatch for
/// user-supplied checks (§4.4 SUPPLEMENT).
pub enum PreCheck {
    ImageRemoval {
        current: RegInvImage,
        proposed: RegInvImage,
    },
    ImageSize {
        max_mib: u64,
        registry: Arc<dyn RegistryClient>,
    },
    ManifestList {
        list_lookup: std::collections::BTreeMap<crate::manifest::Digest, Vec<crate::manifest::Digest>>,
    },
    Vulnerability {
        threshold: Severity,
        scanner: Arc<dyn VulnerabilityScanner>,
    },
    Custom(Arc<dyn Fn(&[PromotionEdge]) -> Result<(), CheckFailure> + Send + Sync>),
}

impl PreCheck {
    async fn run(&self, edges: &[PromotionEdge]) -> Result<(), CheckFailure> {
        match self {
            PreCheck::ImageRemoval { current, proposed } => check_image_removal(current, proposed),
            PreCheck::ImageSize { max_mib, registry } => check_image_size(edges, *max_mib, registry.as_ref()).await,
            PreCheck::ManifestList { list_lookup } => check_manifest_list(edges, list_lookup),
            PreCheck::Vulnerability { threshold, scanner } => {
                check_vulnerabilities(edges, threshold, scanner.as_ref()).await
            }
            PreCheck::Custom(f) => f(edges),
        }
    }
}

/// Runs every configured check concurrently, but aggregates results before
/// returning (§4.4 "Policy"): checks are pure observers and must not
/// mutate registries.
pub struct CheckRunner {
    checks: Vec<PreCheck>,
}

impl CheckRunner {
    pub fn new(checks: Vec<PreCheck>) -> Self {
        CheckRunner { checks }
    }

    pub async fn run_all(&self, edges: &[PromotionEdge]) -> Result<(), Vec<CheckFailure>> {
        let futures = self.checks.iter().map(|check| check.run(edges));
        let results = join_all(futures).await;
        let failures: Vec<CheckFailure> = results.into_iter().filter_map(|r| r.err()).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}

/// Verifies every `(imageName, digest, tag)` tuple promoted in `current` is
/// still present in `proposed` — not just that the image name survives.
/// A digest with no tags is still a promoted tuple (the digest itself must
/// remain reachable); a digest with tags requires each individual tag to
/// still point at it.
fn check_image_removal(current: &RegInvImage, proposed: &RegInvImage) -> Result<(), CheckFailure> {
    for (image_name, dmap) in &current.0 {
        let proposed_dmap = proposed.0.get(image_name);
        for (digest, tags) in dmap {
            if tags.is_empty() {
                let digest_survives = proposed_dmap.map(|m| m.contains_key(digest)).unwrap_or(false);
                if !digest_survives {
                    return Err(CheckFailure::ImageRemoved(format!("{}@{}", image_name, digest)));
                }
                continue;
            }
            for tag in tags {
                let tag_survives = proposed_dmap
                    .and_then(|m| m.get(digest))
                    .map(|proposed_tags| proposed_tags.contains(tag))
                    .unwrap_or(false);
                if !tag_survives {
                    return Err(CheckFailure::ImageRemoved(format!("{}@{}:{}", image_name, digest, tag)));
                }
            }
        }
    }
    Ok(())
}

async fn check_image_size(
    edges: &[PromotionEdge],
    max_mib: u64,
    registry: &dyn RegistryClient,
) -> Result<(), CheckFailure> {
    for edge in edges {
        let (bytes, _content_type) = registry
            .fetch_manifest(&edge.src_image_name, edge.src_digest.as_str())
            .await
            .map_err(|e| CheckFailure::Custom(format!("image-size check: failed fetching manifest: {}", e)))?;
        let doc = crate::registry::ManifestDoc::parse(&bytes)
            .map_err(|e| CheckFailure::Custom(format!("image-size check: failed parsing manifest: {}", e)))?;
        let actual_mib = doc.total_size() / (1024 * 1024);
        if actual_mib > max_mib {
            return Err(CheckFailure::ImageTooLarge {
                image: edge.src_image_name.clone(),
                digest: edge.src_digest.to_string(),
                actual_mib,
                limit_mib: max_mib,
            });
        }
    }
    Ok(())
}

fn check_manifest_list(
    edges: &[PromotionEdge],
    list_lookup: &std::collections::BTreeMap<crate::manifest::Digest, Vec<crate::manifest::Digest>>,
) -> Result<(), CheckFailure> {
    for edge in edges {
        if let Some(children) = list_lookup.get(&edge.src_digest) {
            for child in children {
                let being_promoted = edges.iter().any(|e| &e.src_digest == child);
                if !being_promoted {
                    return Err(CheckFailure::MissingManifestListChild {
                        image: edge.src_image_name.clone(),
                        digest: edge.src_digest.to_string(),
                        child: child.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

async fn check_vulnerabilities(
    edges: &[PromotionEdge],
    threshold: &Severity,
    scanner: &dyn VulnerabilityScanner,
) -> Result<(), CheckFailure> {
    for edge in edges {
        let findings = scanner
            .scan(&edge.src_image_name, edge.src_digest.as_str())
            .await
            .map_err(|e| CheckFailure::Custom(format!("vulnerability check: scan failed: {}", e)))?;
        for finding in findings {
            if finding.has_fix && finding.severity >= *threshold {
                return Err(CheckFailure::VulnerabilityFound {
                    image: edge.src_image_name.clone(),
                    digest: edge.src_digest.to_string(),
                    severity: format!("{:?}", finding.severity),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn image_removal_check_names_the_missing_image() {
        let mut current = RegInvImage::default();
        current.0.insert("a".to_string(), Default::default());
        current.0.entry("b".to_string()).or_default().insert(
            crate::manifest::Digest::parse(format!("sha256:{}", "1".repeat(64))).unwrap(),
            vec![],
        );
        let mut proposed = RegInvImage::default();
        proposed.0.entry("a".to_string()).or_default().insert(
            crate::manifest::Digest::parse(format!("sha256:{}", "1".repeat(64))).unwrap(),
            vec![],
        );

        let runner = CheckRunner::new(vec![PreCheck::ImageRemoval { current, proposed }]);
        let result = runner.run_all(&[]).await;
        let failures = result.unwrap_err();
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], CheckFailure::ImageRemoved(name) if name.starts_with("b@")));
    }

    #[tokio::test]
    async fn image_removal_check_fails_on_partial_digest_removal_within_same_image() {
        // current = {A: {d1:[v1], d2:[v2]}}, proposed = {A: {d1:[v1]}} —
        // image "A" survives, but d2 silently vanished.
        let d1 = crate::manifest::Digest::parse(format!("sha256:{}", "1".repeat(64))).unwrap();
        let d2 = crate::manifest::Digest::parse(format!("sha256:{}", "2".repeat(64))).unwrap();
        let v1 = crate::manifest::Tag::parse("v1").unwrap();
        let v2 = crate::manifest::Tag::parse("v2").unwrap();

        let mut current = RegInvImage::default();
        let current_dmap = current.0.entry("A".to_string()).or_default();
        current_dmap.insert(d1.clone(), vec![v1.clone()]);
        current_dmap.insert(d2.clone(), vec![v2]);

        let mut proposed = RegInvImage::default();
        proposed.0.entry("A".to_string()).or_default().insert(d1, vec![v1]);

        let runner = CheckRunner::new(vec![PreCheck::ImageRemoval { current, proposed }]);
        let failures = runner.run_all(&[]).await.unwrap_err();
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], CheckFailure::ImageRemoved(name) if name.contains(d2.as_str())));
    }

    #[tokio::test]
    async fn custom_check_participates_in_aggregation() {
        let runner = CheckRunner::new(vec![PreCheck::Custom(Arc::new(|_edges| {
            Err(CheckFailure::Custom("nope".to_string()))
        }))]);
        let result = runner.run_all(&[]).await;
        assert_eq!(result.unwrap_err().len(), 1);
    }
}
