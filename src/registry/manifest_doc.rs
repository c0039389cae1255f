use serde::{Deserialize, Serialize};

use crate::manifest::Digest;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlobRef {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestListEntry {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    #[serde(default)]
    pub platform: Option<serde_json::Value>,
}

/// A parsed OCI/Docker v2 manifest, single-arch or list. Both shapes share a
/// `schemaVersion`; which of `config`/`layers` vs. `manifests` is present
/// disambiguates them: manifest flavors are told apart by which fields
/// actually arrive over the wire, not by a separate type per registry API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestDoc {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u16,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Option<BlobRef>,
    #[serde(default)]
    pub layers: Option<Vec<BlobRef>>,
    #[serde(default)]
    pub manifests: Option<Vec<ManifestListEntry>>,
}

impl ManifestDoc {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn is_manifest_list(&self) -> bool {
        self.manifests.is_some()
    }

    pub fn child_digests(&self) -> Vec<Digest> {
        self.manifests
            .iter()
            .flatten()
            .filter_map(|m| Digest::parse(m.digest.clone()).ok())
            .collect()
    }

    /// Total size in bytes: config + layers for a single manifest, or the sum
    /// of child manifest sizes for a manifest list (§4.4 image-size check
    /// needs a single comparable size either way).
    pub fn total_size(&self) -> u64 {
        let mut total = self.config.as_ref().map(|c| c.size).unwrap_or(0);
        total += self.layers.iter().flatten().map(|l| l.size).sum::<u64>();
        total += self.manifests.iter().flatten().map(|m| m.size).sum::<u64>();
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_manifest_is_not_a_list() {
        let doc = ManifestDoc::parse(
            br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"x","size":10,"digest":"sha256:aa"},"layers":[{"mediaType":"x","size":20,"digest":"sha256:bb"}]}"#,
        )
        .unwrap();
        assert!(!doc.is_manifest_list());
        assert_eq!(doc.total_size(), 30);
    }

    #[test]
    fn manifest_list_exposes_children() {
        let doc = ManifestDoc::parse(
            br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[{"mediaType":"x","size":10,"digest":"sha256:0000000000000000000000000000000000000000000000000000000000aa"},{"mediaType":"x","size":20,"digest":"sha256:0000000000000000000000000000000000000000000000000000000000bb"}]}"#,
        )
        .unwrap();
        assert!(doc.is_manifest_list());
        assert_eq!(doc.child_digests().len(), 2);
        assert_eq!(doc.total_size(), 30);
    }
}
