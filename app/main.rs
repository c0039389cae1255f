use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use registry_promoter::config::{OutputFormat, RunConfig};
use registry_promoter::credentials::AnonymousCredentialSource;
use registry_promoter::manifest::{parse_manifest_from_file, parse_thin_manifests_from_dir, Manifest};
use registry_promoter::ratelimit::RateLimiter;

/// Thin CLI wrapper: parses flags, builds a `RunConfig`, and calls straight
/// into the library. It owns no reconciliation logic of its own.
#[derive(Parser, Debug)]
#[clap(name = "promctl")]
struct Opt {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile destination registries against a manifest.
    Run {
        #[clap(long)]
        manifest: Option<PathBuf>,
        #[clap(long)]
        thin_manifest_dir: Option<PathBuf>,
        #[clap(long, default_value_t = 10)]
        threads: usize,
        #[clap(long)]
        confirm: bool,
        #[clap(long)]
        max_image_size: Option<u64>,
        #[clap(long)]
        vuln_severity_threshold: Option<String>,
        #[clap(long)]
        delete_extra_tags: bool,
    },
    /// Emit a snapshot of a registry's observed state.
    Snapshot {
        #[clap(long)]
        registry: String,
        #[clap(long)]
        snapshot_tag: Option<String>,
        #[clap(long)]
        minimal_snapshot: bool,
        #[clap(long, value_enum, default_value = "yaml")]
        output_format: OutputFormatArg,
    },
    /// Run the long-lived audit verifier against a stream of change events.
    Audit,
    /// Grow a manifest with a new digest/tag tuple (`manifest grow`).
    Manifest {
        #[clap(long)]
        manifest: PathBuf,
        #[clap(long)]
        image_name: String,
        #[clap(long)]
        digest: String,
        #[clap(long)]
        tags: Vec<String>,
    },
    /// Verify a digest's signature against the configured policy.
    Sigcheck {
        #[clap(long)]
        digest: String,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum OutputFormatArg {
    Yaml,
    Csv,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(v: OutputFormatArg) -> Self {
        match v {
            OutputFormatArg::Yaml => OutputFormat::Yaml,
            OutputFormatArg::Csv => OutputFormat::Csv,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = Opt::parse();

    match opt.command {
        Command::Run {
            manifest,
            thin_manifest_dir,
            threads,
            confirm,
            max_image_size,
            vuln_severity_threshold,
            delete_extra_tags,
        } => {
            let manifests = load_manifests(manifest.as_deref(), thin_manifest_dir.as_deref())?;
            let config = RunConfig {
                threads,
                confirm,
                max_image_size_mib: max_image_size,
                vuln_severity_threshold,
                delete_extra_tags,
                ..Default::default()
            };
            run_reconciliation(manifests, config).await?;
        }
        Command::Snapshot {
            registry,
            snapshot_tag,
            minimal_snapshot,
            output_format,
        } => {
            emit_snapshot(&registry, snapshot_tag, minimal_snapshot, output_format.into()).await?;
        }
        Command::Audit => {
            bail!("audit mode requires a live event source; not wired into the CLI surface covered here");
        }
        Command::Manifest {
            manifest,
            image_name,
            digest,
            tags,
        } => {
            grow_manifest(&manifest, &image_name, &digest, tags)?;
        }
        Command::Sigcheck { digest } => {
            println!("sigcheck is an external collaborator; no signature policy is wired in for {}", digest);
        }
    }

    Ok(())
}

fn load_manifests(manifest: Option<&std::path::Path>, thin_dir: Option<&std::path::Path>) -> Result<Vec<Manifest>, anyhow::Error> {
    match (manifest, thin_dir) {
        (Some(path), None) => Ok(vec![parse_manifest_from_file(path)?]),
        (None, Some(root)) => parse_thin_manifests_from_dir(root),
        (Some(_), Some(_)) => bail!("pass exactly one of --manifest or --thin-manifest-dir"),
        (None, None) => bail!("one of --manifest or --thin-manifest-dir is required"),
    }
}

async fn run_reconciliation(manifests: Vec<Manifest>, config: RunConfig) -> Result<(), anyhow::Error> {
    use registry_promoter::checks::CheckRunner;
    use registry_promoter::edges::derive_edges;
    use registry_promoter::executor::PromotionExecutor;
    use registry_promoter::inventory::InventoryReader;
    use std::collections::BTreeMap;

    let credentials = Arc::new(AnonymousCredentialSource);
    let limiter = Arc::new(RateLimiter::new(nonzero_ext::nonzero!(10u32), nonzero_ext::nonzero!(20u32)));

    let mut registry_names: Vec<_> = manifests
        .iter()
        .flat_map(|m| m.registries.iter().map(|r| r.name.clone()))
        .collect();
    registry_names.sort();
    registry_names.dedup();

    let mut clients = BTreeMap::new();
    for name in &registry_names {
        let ctx = registry_promoter::manifest::RegistryContext {
            name: name.clone(),
            service_account: None,
            src: false,
        };
        let client = registry_promoter::registry::connect(&ctx, credentials.clone(), limiter.clone())
            .await
            .with_context(|| format!("connecting to registry {}", name))?;
        clients.insert(name.clone(), client);
    }

    let reader = InventoryReader::new(config.threads);
    let to_list: Vec<_> = clients.iter().map(|(n, c)| (n.clone(), c.clone())).collect();
    let inventory = reader.build_master_inventory(to_list).await?;

    let list_lookup = build_list_lookup(&manifests, &clients).await?;
    let derived = derive_edges(&manifests, &inventory, &list_lookup, config.delete_extra_tags)?;

    let mut pre_checks = Vec::new();
    if let Some(max_mib) = config.max_image_size_mib {
        if let Some(src_name) = manifests.iter().find_map(|m| m.src_registry.as_ref().map(|r| r.name.clone())) {
            if let Some(registry) = clients.get(&src_name) {
                pre_checks.push(registry_promoter::checks::PreCheck::ImageSize {
                    max_mib,
                    registry: registry.clone(),
                });
            }
        }
    }
    if !list_lookup.is_empty() {
        pre_checks.push(registry_promoter::checks::PreCheck::ManifestList {
            list_lookup: list_lookup.clone(),
        });
    }
    if let Some(threshold) = &config.vuln_severity_threshold {
        // No vulnerability scanner is wired into this CLI surface; record
        // the intent to enforce a threshold but skip the check rather than
        // fabricate a scanner result.
        let _ = registry_promoter::checks::Severity::parse(threshold)?;
        tracing::warn!(threshold, "vuln-severity-threshold set but no vulnerability scanner is configured; skipping the vulnerability check");
    }

    let checks = CheckRunner::new(pre_checks);
    if let Err(failures) = checks.run_all(&derived.edges).await {
        for failure in &failures {
            eprintln!("check failed: {}", failure);
        }
        bail!("{} pre-check(s) failed", failures.len());
    }

    let executor = PromotionExecutor::new(config.threads, config.confirm);
    let report = executor.execute(&derived, &clients).await?;
    if !report.ok() {
        eprintln!("{}", serde_json::to_string_pretty(&report)?);
        bail!("{} edge(s) failed", report.failures.len());
    }

    println!("promoted {} edge(s) ({})", report.succeeded, if report.dry_run { "dry-run" } else { "confirmed" });
    Ok(())
}

/// Fetches every distinct digest named in `manifests` from its source
/// registry and records which ones are manifest lists, keyed to the
/// children they name, so `derive_edges` can enforce child-before-parent
/// ordering (§4.5) against real registry data instead of an empty map.
async fn build_list_lookup(
    manifests: &[Manifest],
    clients: &std::collections::BTreeMap<String, Arc<dyn registry_promoter::registry::RegistryClient>>,
) -> Result<std::collections::BTreeMap<registry_promoter::manifest::Digest, Vec<registry_promoter::manifest::Digest>>, anyhow::Error> {
    use registry_promoter::registry::ManifestDoc;

    let mut lookup = std::collections::BTreeMap::new();
    for manifest in manifests {
        let Some(src) = &manifest.src_registry else { continue };
        let Some(client) = clients.get(&src.name) else { continue };
        for image in &manifest.images {
            for digest in image.dmap.keys() {
                let (bytes, _content_type) = match client.fetch_manifest(&image.name, digest.as_str()).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(image = %image.name, digest = %digest, error = %e, "manifest-list lookup: failed fetching manifest, skipping");
                        continue;
                    }
                };
                let doc = match ManifestDoc::parse(&bytes) {
                    Ok(doc) => doc,
                    Err(e) => {
                        tracing::warn!(image = %image.name, digest = %digest, error = %e, "manifest-list lookup: failed parsing manifest, skipping");
                        continue;
                    }
                };
                if let Some(entries) = doc.manifests {
                    let children = entries
                        .into_iter()
                        .map(|entry| registry_promoter::manifest::Digest::parse(entry.digest))
                        .collect::<Result<Vec<_>, _>>()?;
                    lookup.insert(digest.clone(), children);
                }
            }
        }
    }
    Ok(lookup)
}

async fn emit_snapshot(
    registry: &str,
    snapshot_tag: Option<String>,
    minimal_snapshot: bool,
    output_format: OutputFormat,
) -> Result<(), anyhow::Error> {
    use registry_promoter::inventory::InventoryReader;
    use registry_promoter::snapshot::{build_snapshot, write_snapshot, ManifestListAncestry, SnapshotOptions};

    let credentials = Arc::new(AnonymousCredentialSource);
    let limiter = Arc::new(RateLimiter::new(nonzero_ext::nonzero!(10u32), nonzero_ext::nonzero!(20u32)));
    let ctx = registry_promoter::manifest::RegistryContext {
        name: registry.to_string(),
        service_account: None,
        src: false,
    };
    let client = registry_promoter::registry::connect(&ctx, credentials, limiter).await?;

    let reader = InventoryReader::new(10);
    let inv = reader.list_registry(client).await?;

    let options = SnapshotOptions {
        minimal_snapshot,
        snapshot_tag: snapshot_tag.map(|t| registry_promoter::manifest::Tag::parse(t)).transpose()?,
    };
    let images = build_snapshot(&inv, &options, &ManifestListAncestry::default());

    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    write_snapshot(&images, output_format, &mut lock)
}

fn grow_manifest(manifest_path: &std::path::Path, image_name: &str, digest: &str, tags: Vec<String>) -> Result<(), anyhow::Error> {
    let mut manifest = parse_manifest_from_file(manifest_path)?;
    let digest = registry_promoter::manifest::Digest::parse(digest.to_string())?;
    let tags = tags
        .into_iter()
        .map(registry_promoter::manifest::Tag::parse)
        .collect::<Result<Vec<_>, _>>()?;
    manifest.merge_image(image_name, digest, tags);

    let yaml = serde_yaml::to_string(&manifest)?;
    std::fs::write(manifest_path, yaml)?;
    Ok(())
}
