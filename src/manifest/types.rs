use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A content digest of the form `sha256:<64 lowercase hex chars>`.
///
/// Validity is enforced at construction time (`Digest::parse`); once built a
/// `Digest` is known-good and every consumer can skip re-validating it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn parse(raw: impl Into<String>) -> Result<Self, DigestError> {
        let raw = raw.into();
        if !super::parser::DIGEST_RE.is_match(&raw) {
            return Err(DigestError::Malformed(raw));
        }
        Ok(Digest(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Digest::parse(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DigestError {
    #[error("digest {0:?} does not match sha256:<64 hex chars>")]
    Malformed(String),
}

/// A mutable label pointing at a digest; matches `[\w][\w.-]{0,127}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn parse(raw: impl Into<String>) -> Result<Self, TagError> {
        let raw = raw.into();
        if !super::parser::TAG_RE.is_match(&raw) {
            return Err(TagError::Malformed(raw));
        }
        Ok(Tag(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Tag::parse(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TagError {
    #[error("tag {0:?} does not match [\\w][\\w.-]{{0,127}}")]
    Malformed(String),
}

/// `{name, serviceAccount, src}` — one registry a manifest declares over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryContext {
    pub name: String,
    #[serde(rename = "service-account", default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default)]
    pub src: bool,
}

/// `{name, dmap}` — a repository path relative to a registry plus its blessed
/// digest/tag mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Image {
    pub name: String,
    #[serde(default)]
    pub dmap: BTreeMap<Digest, Vec<Tag>>,
}

/// One `renames` entry: an ordered list of fully-qualified paths treated as
/// aliases of each other. The first entry found among a candidate edge's
/// `(registry, name)` pair that isn't the destination registry's own name
/// is rewritten to whichever entry in the group belongs to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenameRule(pub Vec<String>);

/// `{registries, images, filepath?, srcRegistry*}`.
///
/// `filepath` and `src_registry` are populated by `finalize()` and are never
/// read from the wire format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub registries: Vec<RegistryContext>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub renames: Vec<RenameRule>,

    #[serde(skip)]
    pub filepath: Option<PathBuf>,
    #[serde(skip)]
    pub src_registry: Option<RegistryContext>,
}

impl Manifest {
    /// Rewrite an image name for a destination registry per `renames`, if a
    /// rule names both `image_name` and some path under `dst_registry`.
    pub fn rewrite_dst_name(&self, image_name: &str, dst_registry: &str) -> String {
        for rule in &self.renames {
            if rule.0.iter().any(|fqp| fqp.ends_with(image_name)) {
                if let Some(rewritten) = rule
                    .0
                    .iter()
                    .find(|fqp| fqp.starts_with(dst_registry))
                {
                    if let Some(rest) = rewritten.strip_prefix(dst_registry) {
                        return rest.trim_start_matches('/').to_string();
                    }
                }
            }
        }
        image_name.to_string()
    }

    /// Merge a `(digest, tag)` tuple into this manifest's `images`, creating
    /// or extending an `Image` entry. Used by the `manifest grow` collaborator.
    pub fn merge_image(&mut self, name: &str, digest: Digest, tags: Vec<Tag>) {
        if let Some(existing) = self.images.iter_mut().find(|i| i.name == name) {
            let entry = existing.dmap.entry(digest).or_default();
            for t in tags {
                if !entry.contains(&t) {
                    entry.push(t);
                }
            }
        } else {
            let mut dmap = BTreeMap::new();
            dmap.insert(digest, tags);
            self.images.push(Image {
                name: name.to_string(),
                dmap,
            });
        }
    }
}
