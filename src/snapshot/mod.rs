use std::collections::BTreeSet;
use std::io::Write;

use serde::Serialize;

use crate::inventory::RegInvImage;
use crate::manifest::{Digest, Tag};

/// One `{name, dmap}` entry in canonical snapshot order: images by name
/// ascending, digests lexicographic, tags lexicographic within a digest —
/// the ordering §4.6 requires for byte-identical output on equal inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotImage {
    pub name: String,
    pub dmap: Vec<SnapshotDigestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotDigestEntry {
    pub digest: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub minimal_snapshot: bool,
    pub snapshot_tag: Option<Tag>,
}

/// Manifest-list child digests reachable from some parent in the same
/// inventory, needed to resolve `minimalSnapshot`'s drop rule (§4.6
/// "Options", §9 open question: ancestor resolution is taken as
/// same-registry-only here, see DESIGN.md).
pub type ManifestListAncestry = std::collections::BTreeSet<Digest>;

pub fn build_snapshot(
    inventory: &RegInvImage,
    options: &SnapshotOptions,
    ancestry: &ManifestListAncestry,
) -> Vec<SnapshotImage> {
    let mut images = Vec::new();

    for (name, dmap) in &inventory.0 {
        let mut entries = Vec::new();
        for (digest, tags) in dmap {
            if options.minimal_snapshot && tags.is_empty() && ancestry.contains(digest) {
                continue;
            }

            let mut tags: Vec<Tag> = tags.clone();
            if let Some(filter_tag) = &options.snapshot_tag {
                if !tags.contains(filter_tag) {
                    continue;
                }
                tags.retain(|t| t == filter_tag);
            }

            let mut sorted_tags: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
            let tags: Vec<String> = sorted_tags.drain().collect();

            entries.push(SnapshotDigestEntry {
                digest: digest.to_string(),
                tags,
            });
        }
        entries.sort_by(|a, b| a.digest.cmp(&b.digest));
        if !entries.is_empty() || options.snapshot_tag.is_none() {
            images.push(SnapshotImage {
                name: name.clone(),
                dmap: entries,
            });
        }
    }

    images.sort_by(|a, b| a.name.cmp(&b.name));
    images
}

pub fn emit_yaml(images: &[SnapshotImage]) -> Result<String, anyhow::Error> {
    Ok(serde_yaml::to_string(images)?)
}

pub fn emit_csv(images: &[SnapshotImage]) -> Result<String, anyhow::Error> {
    let mut writer = csv::WriterBuilder::new().from_writer(vec![]);
    writer.write_record(["name", "digest", "tags"])?;
    for image in images {
        for entry in &image.dmap {
            writer.write_record([&image.name, &entry.digest, &entry.tags.join(";")])?;
        }
        if image.dmap.is_empty() {
            writer.write_record([&image.name, "", ""])?;
        }
    }
    let bytes = writer.into_inner().map_err(|e| anyhow::anyhow!("csv writer error: {}", e))?;
    Ok(String::from_utf8(bytes)?)
}

pub fn write_snapshot(
    images: &[SnapshotImage],
    format: crate::config::OutputFormat,
    out: &mut impl Write,
) -> Result<(), anyhow::Error> {
    let rendered = match format {
        crate::config::OutputFormat::Yaml => emit_yaml(images)?,
        crate::config::OutputFormat::Csv => emit_csv(images)?,
    };
    out.write_all(rendered.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u8) -> Digest {
        Digest::parse(format!("sha256:{:064x}", n)).unwrap()
    }

    fn tag(s: &str) -> Tag {
        Tag::parse(s).unwrap()
    }

    #[test]
    fn snapshot_tag_filters_to_matching_tuples() {
        let mut inv = RegInvImage::default();
        let dmap = inv.0.entry("img".to_string()).or_default();
        dmap.insert(digest(1), vec![tag("t1"), tag("t2")]);
        dmap.insert(digest(2), vec![]);

        let options = SnapshotOptions {
            minimal_snapshot: false,
            snapshot_tag: Some(tag("t1")),
        };
        let snapshot = build_snapshot(&inv, &options, &ManifestListAncestry::default());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].dmap.len(), 1);
        assert_eq!(snapshot[0].dmap[0].tags, vec!["t1".to_string()]);
    }

    #[test]
    fn minimal_snapshot_drops_ancestor_referenced_children() {
        let mut inv = RegInvImage::default();
        let dmap = inv.0.entry("img".to_string()).or_default();
        dmap.insert(digest(1), vec![tag("v1")]);
        dmap.insert(digest(2), vec![]);

        let mut ancestry = ManifestListAncestry::default();
        ancestry.insert(digest(2));

        let options = SnapshotOptions {
            minimal_snapshot: true,
            snapshot_tag: None,
        };
        let snapshot = build_snapshot(&inv, &options, &ancestry);
        assert_eq!(snapshot[0].dmap.len(), 1);
        assert_eq!(snapshot[0].dmap[0].digest, digest(1).to_string());
    }

    #[test]
    fn snapshot_is_deterministic() {
        let mut inv = RegInvImage::default();
        inv.0.entry("b".to_string()).or_default().insert(digest(2), vec![tag("z")]);
        inv.0.entry("a".to_string()).or_default().insert(digest(1), vec![tag("y")]);

        let options = SnapshotOptions::default();
        let first = build_snapshot(&inv, &options, &ManifestListAncestry::default());
        let second = build_snapshot(&inv, &options, &ManifestListAncestry::default());
        assert_eq!(emit_yaml(&first).unwrap(), emit_yaml(&second).unwrap());
        assert_eq!(first[0].name, "a");
    }
}
