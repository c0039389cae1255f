use std::collections::BTreeSet;

use tracing::warn;

use crate::inventory::MasterInventory;
use crate::manifest::{Digest, Manifest, RegistryContext, Tag};

/// One planned mutation `(src, name, digest) -> (dst, name, tag?)` (§3
/// "Promotion edge"). Equality and ordering are derived from every field so
/// that edge sets deduplicate naturally in a `BTreeSet`/`HashSet`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PromotionEdge {
    pub src_registry: String,
    pub src_image_name: String,
    pub src_digest: Digest,
    pub dst_registry: String,
    pub dst_image_name: String,
    pub dst_tag: Option<Tag>,
}

#[derive(thiserror::Error, Debug)]
pub enum EdgeError {
    #[error("tag collision: {dst_registry}/{dst_image_name}:{tag} already holds {existing}, wanted {wanted}")]
    TagCollision {
        dst_registry: String,
        dst_image_name: String,
        tag: Tag,
        existing: Digest,
        wanted: Digest,
    },
    #[error("manifest list {digest} in {image_name} names child {child} that is neither observed at source nor otherwise being promoted")]
    UnresolvedManifestListChild {
        image_name: String,
        digest: Digest,
        child: Digest,
    },
}

/// The set of edges after filtering, plus any tag-move edges synthesized by
/// `deleteExtraTags`, plus a manifest-list dependency map the executor
/// topologically drains (§4.3 step 5).
#[derive(Debug, Default)]
pub struct DerivedEdges {
    pub edges: Vec<PromotionEdge>,
    /// child index -> digests of manifest-list children that must complete
    /// before the edge at `edges[parent_index]` may run.
    pub dependencies: Vec<(usize, Vec<Digest>)>,
}

/// A lookup of which digests are manifest lists and what children they name,
/// supplied by the caller (populated from fetched manifests during edge
/// derivation, not re-derived here) so this module stays a pure function of
/// its inputs and is easy to unit test.
pub trait ManifestListLookup {
    fn children_of(&self, digest: &Digest) -> Option<&[Digest]>;
}

impl ManifestListLookup for std::collections::BTreeMap<Digest, Vec<Digest>> {
    fn children_of(&self, digest: &Digest) -> Option<&[Digest]> {
        self.get(digest).map(|v| v.as_slice())
    }
}

/// Join desired state (`manifests`) with observed state (`inventory`) into
/// the minimal edge set, applying the five-step filter in §4.3. Returns
/// `(edges, ok)`; `ok=false` on an unresolvable tag collision.
pub fn derive_edges(
    manifests: &[Manifest],
    inventory: &MasterInventory,
    list_lookup: &dyn ManifestListLookup,
    delete_extra_tags: bool,
) -> Result<DerivedEdges, EdgeError> {
    let mut candidates: Vec<PromotionEdge> = Vec::new();

    for manifest in manifests {
        let src = match &manifest.src_registry {
            Some(src) => src,
            None => continue,
        };
        for dst in destination_registries(manifest) {
            for image in &manifest.images {
                let dst_image_name = manifest.rewrite_dst_name(&image.name, &dst.name);
                for (digest, tags) in &image.dmap {
                    // Step 1: candidate construction.
                    if tags.is_empty() {
                        candidates.push(PromotionEdge {
                            src_registry: src.name.clone(),
                            src_image_name: image.name.clone(),
                            src_digest: digest.clone(),
                            dst_registry: dst.name.clone(),
                            dst_image_name: dst_image_name.clone(),
                            dst_tag: None,
                        });
                    }
                    for tag in tags {
                        candidates.push(PromotionEdge {
                            src_registry: src.name.clone(),
                            src_image_name: image.name.clone(),
                            src_digest: digest.clone(),
                            dst_registry: dst.name.clone(),
                            dst_image_name: dst_image_name.clone(),
                            dst_tag: Some(tag.clone()),
                        });
                    }
                }
            }
        }
    }

    let mut filtered = Vec::new();
    let mut seen = BTreeSet::new();

    for edge in candidates {
        // Step 2: already-satisfied edges are dropped.
        if is_satisfied(&edge, inventory) {
            continue;
        }

        // Step 3: unsatisfiable source is a warning, not an abort.
        let src_inv = inventory.0.get(&edge.src_registry);
        let src_has_digest = src_inv
            .map(|inv| inv.contains_digest(&edge.src_image_name, &edge.src_digest))
            .unwrap_or(false);
        if !src_has_digest {
            warn!(
                src_registry = %edge.src_registry,
                image = %edge.src_image_name,
                digest = %edge.src_digest,
                "lost image: source no longer has this digest, dropping edge"
            );
            continue;
        }

        // Step 4: tag collision detection.
        if let Some(tag) = &edge.dst_tag {
            if let Some(dst_inv) = inventory.0.get(&edge.dst_registry) {
                if let Some(existing) = dst_inv.digest_for_tag(&edge.dst_image_name, tag) {
                    if existing != &edge.src_digest {
                        if !delete_extra_tags {
                            return Err(EdgeError::TagCollision {
                                dst_registry: edge.dst_registry.clone(),
                                dst_image_name: edge.dst_image_name.clone(),
                                tag: tag.clone(),
                                existing: existing.clone(),
                                wanted: edge.src_digest.clone(),
                            });
                        }
                        // deleteExtraTags: the write below is itself the
                        // tag-move operation (same PUT, new owner digest).
                    }
                }
            }
        }

        if seen.insert(edge.clone()) {
            filtered.push(edge);
        }
    }

    // Step 5: manifest-list dependency computation.
    let mut dependencies = Vec::new();
    for (idx, edge) in filtered.iter().enumerate() {
        if let Some(children) = list_lookup.children_of(&edge.src_digest) {
            let mut unresolved = Vec::new();
            for child in children {
                let src_inv = inventory.0.get(&edge.src_registry);
                let has_at_source = src_inv
                    .map(|inv| inv.contains_digest(&edge.src_image_name, child))
                    .unwrap_or(false);
                let being_promoted = filtered
                    .iter()
                    .any(|e| e.dst_registry == edge.dst_registry && &e.src_digest == child);
                if !has_at_source && !being_promoted {
                    return Err(EdgeError::UnresolvedManifestListChild {
                        image_name: edge.src_image_name.clone(),
                        digest: edge.src_digest.clone(),
                        child: child.clone(),
                    });
                }
                unresolved.push(child.clone());
            }
            if !unresolved.is_empty() {
                dependencies.push((idx, unresolved));
            }
        }
    }

    Ok(DerivedEdges {
        edges: filtered,
        dependencies,
    })
}

fn is_satisfied(edge: &PromotionEdge, inventory: &MasterInventory) -> bool {
    let Some(dst_inv) = inventory.0.get(&edge.dst_registry) else {
        return false;
    };
    if !dst_inv.contains_digest(&edge.dst_image_name, &edge.src_digest) {
        return false;
    }
    match &edge.dst_tag {
        None => true,
        Some(tag) => dst_inv.digest_for_tag(&edge.dst_image_name, tag) == Some(&edge.src_digest),
    }
}

/// Matching `RegistryContext::src == true`, required by `derive_edges` to
/// key destination registries; kept here rather than duplicated at call
/// sites.
pub fn destination_registries(manifest: &Manifest) -> impl Iterator<Item = &RegistryContext> {
    manifest.registries.iter().filter(|r| !r.src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::RegInvImage;
    use crate::manifest::Image;
    use std::collections::BTreeMap;

    fn digest(n: u8) -> Digest {
        Digest::parse(format!("sha256:{:064x}", n)).unwrap()
    }

    fn tag(s: &str) -> Tag {
        Tag::parse(s).unwrap()
    }

    fn base_manifest(dst_tag: Option<&str>, d: Digest) -> Manifest {
        let src = RegistryContext {
            name: "src.example.io/proj".to_string(),
            service_account: None,
            src: true,
        };
        let dst = RegistryContext {
            name: "dst.example.io/proj".to_string(),
            service_account: None,
            src: false,
        };
        let mut dmap = BTreeMap::new();
        let tags = dst_tag.map(|t| vec![tag(t)]).unwrap_or_default();
        dmap.insert(d, tags);
        Manifest {
            registries: vec![src.clone(), dst],
            images: vec![Image {
                name: "img".to_string(),
                dmap,
            }],
            renames: vec![],
            filepath: None,
            src_registry: Some(src),
        }
    }

    struct NoLists;
    impl ManifestListLookup for NoLists {
        fn children_of(&self, _digest: &Digest) -> Option<&[Digest]> {
            None
        }
    }

    #[test]
    fn absent_image_produces_one_edge() {
        let d = digest(1);
        let manifest = base_manifest(Some("v1"), d.clone());
        let mut inventory = MasterInventory::default();
        let mut src_inv = RegInvImage::default();
        src_inv.0.entry("img".to_string()).or_default().insert(d.clone(), vec![]);
        inventory.0.insert("src.example.io/proj".to_string(), src_inv);

        let derived = derive_edges(&[manifest], &inventory, &NoLists, false).unwrap();
        assert_eq!(derived.edges.len(), 1);
        assert_eq!(derived.edges[0].dst_tag, Some(tag("v1")));
    }

    #[test]
    fn already_present_yields_zero_edges() {
        let d = digest(1);
        let manifest = base_manifest(Some("v1"), d.clone());
        let mut inventory = MasterInventory::default();
        let mut src_inv = RegInvImage::default();
        src_inv.0.entry("img".to_string()).or_default().insert(d.clone(), vec![tag("v1")]);
        inventory.0.insert("src.example.io/proj".to_string(), src_inv.clone());
        inventory.0.insert("dst.example.io/proj".to_string(), src_inv);

        let derived = derive_edges(&[manifest], &inventory, &NoLists, false).unwrap();
        assert!(derived.edges.is_empty());
    }

    #[test]
    fn lost_image_is_dropped_not_fatal() {
        let d = digest(1);
        let manifest = base_manifest(Some("v1"), d);
        let inventory = MasterInventory::default();
        let derived = derive_edges(&[manifest], &inventory, &NoLists, false).unwrap();
        assert!(derived.edges.is_empty());
    }

    #[test]
    fn tag_collision_without_delete_extra_tags_fails() {
        let d = digest(1);
        let other = digest(2);
        let manifest = base_manifest(Some("v1"), d.clone());
        let mut inventory = MasterInventory::default();
        let mut src_inv = RegInvImage::default();
        src_inv.0.entry("img".to_string()).or_default().insert(d.clone(), vec![tag("v1")]);
        inventory.0.insert("src.example.io/proj".to_string(), src_inv);

        let mut dst_inv = RegInvImage::default();
        dst_inv.0.entry("img".to_string()).or_default().insert(other, vec![tag("v1")]);
        inventory.0.insert("dst.example.io/proj".to_string(), dst_inv);

        let result = derive_edges(&[manifest], &inventory, &NoLists, false);
        assert!(matches!(result, Err(EdgeError::TagCollision { .. })));
    }

    #[test]
    fn tag_collision_with_delete_extra_tags_emits_move() {
        let d = digest(1);
        let other = digest(2);
        let manifest = base_manifest(Some("v1"), d.clone());
        let mut inventory = MasterInventory::default();
        let mut src_inv = RegInvImage::default();
        src_inv.0.entry("img".to_string()).or_default().insert(d.clone(), vec![tag("v1")]);
        inventory.0.insert("src.example.io/proj".to_string(), src_inv);

        let mut dst_inv = RegInvImage::default();
        dst_inv.0.entry("img".to_string()).or_default().insert(other, vec![tag("v1")]);
        inventory.0.insert("dst.example.io/proj".to_string(), dst_inv);

        let derived = derive_edges(&[manifest], &inventory, &NoLists, true).unwrap();
        assert_eq!(derived.edges.len(), 1);
    }

    #[test]
    fn manifest_list_dependency_is_recorded() {
        let parent = digest(1);
        let child = digest(2);
        let manifest = base_manifest(None, parent.clone());
        let mut inventory = MasterInventory::default();
        let mut src_inv = RegInvImage::default();
        src_inv.0.entry("img".to_string()).or_default().insert(parent.clone(), vec![]);
        src_inv.0.entry("img".to_string()).or_default().insert(child.clone(), vec![]);
        inventory.0.insert("src.example.io/proj".to_string(), src_inv);

        let mut lookup = BTreeMap::new();
        lookup.insert(parent, vec![child]);

        let derived = derive_edges(&[manifest], &inventory, &lookup, false).unwrap();
        assert_eq!(derived.edges.len(), 1);
        assert_eq!(derived.dependencies.len(), 1);
    }
}
