use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use regex::Regex;
use std::sync::LazyLock;

use super::types::Manifest;

pub static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sha256:[0-9a-f]{64}$").unwrap());

pub static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").unwrap());

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("manifest at {path:?} declares {count} src=true registries, exactly one is required")]
    SourceRegistryCount { path: Option<PathBuf>, count: usize },
    #[error("manifest at {path:?} has no registries")]
    EmptyRegistries { path: Option<PathBuf> },
}

/// Reject on YAML errors (strict unmarshal: unknown fields fail), validation
/// errors (I1, I2 are enforced by `Digest`/`Tag`/`finalize`), or missing/empty
/// `registries`.
pub fn parse_manifest_from_file(path: impl AsRef<Path>) -> Result<Manifest, Error> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest file {:?}", path))?;
    let mut manifest: Manifest = serde_yaml::from_str(&content)
        .with_context(|| format!("parsing manifest YAML at {:?}", path))?;
    manifest.filepath = Some(path.to_path_buf());
    finalize(&mut manifest)?;
    Ok(manifest)
}

/// Parse a flat manifest from already-loaded `registries`/`images` YAML
/// fragments — used by the thin-manifest composer, which reads the two
/// halves from separate files and stitches them back into one `Manifest`.
pub fn parse_thin_fragment(
    registries_yaml: &str,
    images_yaml: &str,
) -> Result<Manifest, Error> {
    #[derive(serde::Deserialize)]
    #[serde(deny_unknown_fields)]
    struct RegistriesFile {
        registries: Vec<super::types::RegistryContext>,
        #[serde(default)]
        renames: Vec<super::types::RenameRule>,
    }
    #[derive(serde::Deserialize)]
    #[serde(deny_unknown_fields)]
    struct ImagesFile {
        #[serde(default)]
        images: Vec<super::types::Image>,
    }

    let reg: RegistriesFile = serde_yaml::from_str(registries_yaml)
        .context("parsing promoter-manifest.yaml")?;
    let imgs: ImagesFile = serde_yaml::from_str(images_yaml).context("parsing images.yaml")?;

    Ok(Manifest {
        registries: reg.registries,
        images: imgs.images,
        renames: reg.renames,
        filepath: None,
        src_registry: None,
    })
}

/// Walk `root/manifests/` for `<sub>/promoter-manifest.yaml` files at depth
/// exactly 4, pairing each with `root/images/<sub>/images.yaml`.
pub fn parse_thin_manifests_from_dir(root: impl AsRef<Path>) -> Result<Vec<Manifest>, Error> {
    let root = root.as_ref();
    let manifests_dir = root.join("manifests");
    let images_dir = root.join("images");

    if !manifests_dir.is_dir() {
        bail!("thin manifest tree at {:?} has no manifests/ directory", root);
    }
    if !images_dir.is_dir() {
        bail!("thin manifest tree at {:?} has no images/ directory", root);
    }

    let mut out = Vec::new();

    for entry in walkdir::WalkDir::new(&manifests_dir)
        .min_depth(1)
        .max_depth(usize::MAX)
    {
        let entry = entry.with_context(|| format!("walking {:?}", manifests_dir))?;
        if entry.file_name() != "promoter-manifest.yaml" {
            continue;
        }
        // root/manifests/<sub>/promoter-manifest.yaml is depth 3 relative to
        // root (manifests, sub, file); depth is counted from `root`
        // inclusive of `manifests`, i.e. 4 path components after root.
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{:?} not under {:?}", entry.path(), root))?;
        if rel.components().count() != 3 {
            continue;
        }
        let sub = entry
            .path()
            .parent()
            .and_then(|p| p.strip_prefix(&manifests_dir).ok())
            .context("computing thin manifest subdirectory")?;

        let images_file = images_dir.join(sub).join("images.yaml");
        if !images_file.is_file() {
            bail!(
                "thin manifest {:?} has no matching images file at {:?}",
                entry.path(),
                images_file
            );
        }

        let registries_yaml = std::fs::read_to_string(entry.path())
            .with_context(|| format!("reading {:?}", entry.path()))?;
        let images_yaml = std::fs::read_to_string(&images_file)
            .with_context(|| format!("reading {:?}", images_file))?;

        let mut manifest = parse_thin_fragment(&registries_yaml, &images_yaml)
            .with_context(|| format!("composing thin manifest under {:?}", sub))?;
        manifest.filepath = Some(entry.path().to_path_buf());
        finalize(&mut manifest)?;
        out.push(manifest);
    }

    if out.is_empty() {
        bail!("no promoter-manifest.yaml files found under {:?}", manifests_dir);
    }

    Ok(out)
}

/// Populate `src_registry` and run semantic checks (I1). `Digest`/`Tag`
/// parsing already enforced I2 during deserialization.
pub fn finalize(manifest: &mut Manifest) -> Result<(), Error> {
    if manifest.registries.is_empty() {
        return Err(ValidationError::EmptyRegistries {
            path: manifest.filepath.clone(),
        }
        .into());
    }

    let src_candidates: Vec<_> = manifest.registries.iter().filter(|r| r.src).collect();
    if src_candidates.len() != 1 {
        return Err(ValidationError::SourceRegistryCount {
            path: manifest.filepath.clone(),
            count: src_candidates.len(),
        }
        .into());
    }

    manifest.src_registry = Some(src_candidates[0].clone());
    Ok(())
}
