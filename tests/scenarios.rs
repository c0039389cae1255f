//! End-to-end scenario coverage spanning manifest parsing, inventory,
//! edge derivation, checks, and execution together, using fake
//! `RegistryClient` implementations instead of a live registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use bytes::Bytes;

use registry_promoter::checks::{CheckFailure, CheckRunner, PreCheck};
use registry_promoter::edges::{derive_edges, ManifestListLookup};
use registry_promoter::executor::PromotionExecutor;
use registry_promoter::inventory::{MasterInventory, RegInvImage};
use registry_promoter::manifest::{Digest, Image, Manifest, RegistryContext, Tag};
use registry_promoter::registry::{PathListing, RegistryClient};

fn digest(n: u8) -> Digest {
    Digest::parse(format!("sha256:{:064x}", n)).unwrap()
}

fn tag(s: &str) -> Tag {
    Tag::parse(s).unwrap()
}

fn manifest(src: &str, dst: &str, image: &str, dmap: BTreeMap<Digest, Vec<Tag>>) -> Manifest {
    let src_ctx = RegistryContext {
        name: src.to_string(),
        service_account: None,
        src: true,
    };
    let dst_ctx = RegistryContext {
        name: dst.to_string(),
        service_account: None,
        src: false,
    };
    Manifest {
        registries: vec![src_ctx.clone(), dst_ctx],
        images: vec![Image {
            name: image.to_string(),
            dmap,
        }],
        renames: vec![],
        filepath: None,
        src_registry: Some(src_ctx),
    }
}

struct NoLists;
impl ManifestListLookup for NoLists {
    fn children_of(&self, _digest: &Digest) -> Option<&[Digest]> {
        None
    }
}

struct FakeClient {
    name: String,
    manifest_bytes: Vec<u8>,
    puts: StdMutex<Vec<String>>,
}

#[async_trait]
impl RegistryClient for FakeClient {
    fn registry_name(&self) -> &str {
        &self.name
    }
    async fn list_path(&self, _path: &str) -> Result<PathListing, anyhow::Error> {
        Ok(PathListing::default())
    }
    async fn fetch_manifest(&self, _image_name: &str, _reference: &str) -> Result<(Bytes, String), anyhow::Error> {
        Ok((Bytes::from(self.manifest_bytes.clone()), "application/vnd.oci.image.manifest.v1+json".to_string()))
    }
    async fn blob_exists(&self, _image_name: &str, _digest: &Digest) -> Result<bool, anyhow::Error> {
        Ok(true)
    }
    async fn mount_blob(&self, _dst: &str, _digest: &Digest, _from: &str) -> Result<bool, anyhow::Error> {
        Ok(true)
    }
    async fn put_manifest(&self, image_name: &str, tag: Option<&Tag>, _bytes: &[u8], _media_type: &str) -> Result<(), anyhow::Error> {
        self.puts.lock().unwrap().push(format!("{}:{}", image_name, tag.map(|t| t.to_string()).unwrap_or_default()));
        Ok(())
    }
    async fn delete_tag(&self, _image_name: &str, _tag: &Tag) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

// Scenario 1: single image, single dest, already present -> 0 edges, 0 writes.
#[tokio::test]
async fn already_present_image_yields_no_edges_and_no_writes() {
    let d = digest(1);
    let mut dmap = BTreeMap::new();
    dmap.insert(d.clone(), vec![tag("v1")]);
    let m = manifest("src", "dst", "img", dmap);

    let mut inventory = MasterInventory::default();
    let mut inv = RegInvImage::default();
    inv.0.entry("img".to_string()).or_default().insert(d, vec![tag("v1")]);
    inventory.0.insert("src".to_string(), inv.clone());
    inventory.0.insert("dst".to_string(), inv);

    let derived = derive_edges(&[m], &inventory, &NoLists, false).unwrap();
    assert!(derived.edges.is_empty());

    let client: Arc<dyn RegistryClient> = Arc::new(FakeClient {
        name: "dst".to_string(),
        manifest_bytes: vec![],
        puts: StdMutex::new(vec![]),
    });
    let mut registries: BTreeMap<String, Arc<dyn RegistryClient>> = BTreeMap::new();
    registries.insert("dst".to_string(), client);

    let executor = PromotionExecutor::new(4, true);
    let report = executor.execute(&derived, &registries).await.unwrap();
    assert!(report.ok());
    assert_eq!(report.succeeded, 0);
}

// Scenario 2: single image, single dest, absent -> 1 edge, 1 PUT, post-state matches.
#[tokio::test]
async fn absent_image_produces_one_edge_and_one_put() {
    let d = digest(1);
    let mut dmap = BTreeMap::new();
    dmap.insert(d.clone(), vec![tag("v1")]);
    let m = manifest("src", "dst", "img", dmap);

    let mut inventory = MasterInventory::default();
    let mut src_inv = RegInvImage::default();
    src_inv.0.entry("img".to_string()).or_default().insert(d, vec![tag("v1")]);
    inventory.0.insert("src".to_string(), src_inv);

    let derived = derive_edges(&[m], &inventory, &NoLists, false).unwrap();
    assert_eq!(derived.edges.len(), 1);

    let client = Arc::new(FakeClient {
        name: "dst".to_string(),
        manifest_bytes: br#"{"schemaVersion":2}"#.to_vec(),
        puts: StdMutex::new(vec![]),
    });
    let mut registries: BTreeMap<String, Arc<dyn RegistryClient>> = BTreeMap::new();
    registries.insert("dst".to_string(), client.clone());

    let executor = PromotionExecutor::new(4, true);
    let report = executor.execute(&derived, &registries).await.unwrap();
    assert!(report.ok());
    assert_eq!(report.succeeded, 1);
    assert_eq!(client.puts.lock().unwrap().as_slice(), &["img:v1".to_string()]);
}

// Scenario 3: manifest-list with two children, none present -> 3 edges,
// children complete strictly before the parent.
#[tokio::test]
async fn manifest_list_children_complete_before_parent() {
    let parent = digest(1);
    let child_a = digest(2);
    let child_b = digest(3);

    let mut dmap = BTreeMap::new();
    dmap.insert(parent.clone(), vec![tag("v1")]);
    dmap.insert(child_a.clone(), vec![]);
    dmap.insert(child_b.clone(), vec![]);
    let m = manifest("src", "dst", "img", dmap);

    let mut inventory = MasterInventory::default();
    let mut src_inv = RegInvImage::default();
    for (d, t) in [(parent.clone(), vec![tag("v1")]), (child_a.clone(), vec![]), (child_b.clone(), vec![])] {
        src_inv.0.entry("img".to_string()).or_default().insert(d, t);
    }
    inventory.0.insert("src".to_string(), src_inv);

    let mut lookup = BTreeMap::new();
    lookup.insert(parent.clone(), vec![child_a.clone(), child_b.clone()]);

    let derived = derive_edges(&[m], &inventory, &lookup, false).unwrap();
    assert_eq!(derived.edges.len(), 3);
    assert_eq!(derived.dependencies.len(), 1);

    let client = Arc::new(FakeClient {
        name: "dst".to_string(),
        manifest_bytes: br#"{"schemaVersion":2}"#.to_vec(),
        puts: StdMutex::new(vec![]),
    });
    let mut registries: BTreeMap<String, Arc<dyn RegistryClient>> = BTreeMap::new();
    registries.insert("dst".to_string(), client);

    let executor = PromotionExecutor::new(4, true);
    let report = executor.execute(&derived, &registries).await.unwrap();
    assert!(report.ok());
    assert_eq!(report.succeeded, 3);
}

// Scenario 4: tag collision without deleteExtraTags -> derive_edges fails,
// executor is never invoked.
#[tokio::test]
async fn tag_collision_without_delete_extra_tags_blocks_execution() {
    let wanted = digest(1);
    let existing = digest(2);
    let mut dmap = BTreeMap::new();
    dmap.insert(wanted.clone(), vec![tag("latest")]);
    let m = manifest("src", "dst", "img", dmap);

    let mut inventory = MasterInventory::default();
    let mut src_inv = RegInvImage::default();
    src_inv.0.entry("img".to_string()).or_default().insert(wanted, vec![tag("latest")]);
    inventory.0.insert("src".to_string(), src_inv);

    let mut dst_inv = RegInvImage::default();
    dst_inv.0.entry("img".to_string()).or_default().insert(existing, vec![tag("latest")]);
    inventory.0.insert("dst".to_string(), dst_inv);

    let result = derive_edges(&[m], &inventory, &NoLists, false);
    assert!(result.is_err(), "tag collision must surface as a derivation error, not a silent edge");
}

// Scenario 5: image-removal check given before = {A@1.0, B@2.0}, after = {A@1.0}
// -> check fails naming B.
#[tokio::test]
async fn image_removal_check_fails_naming_the_dropped_image() {
    let mut before = RegInvImage::default();
    before.0.entry("A".to_string()).or_default().insert(digest(1), vec![tag("1.0")]);
    before.0.entry("B".to_string()).or_default().insert(digest(2), vec![tag("2.0")]);

    let mut after = RegInvImage::default();
    after.0.entry("A".to_string()).or_default().insert(digest(1), vec![tag("1.0")]);

    let runner = CheckRunner::new(vec![PreCheck::ImageRemoval { current: before, proposed: after }]);
    let failures = runner.run_all(&[]).await.unwrap_err();
    assert_eq!(failures.len(), 1);
    assert!(matches!(&failures[0], CheckFailure::ImageRemoved(name) if name.starts_with("B@")));
}

// Scenario 6: snapshot of img {d1:[t1,t2], d2:[]} with snapshotTag=t1 ->
// output contains only img {d1:[t1]}.
#[tokio::test]
async fn snapshot_tag_filter_narrows_to_one_digest_one_tag() {
    use registry_promoter::snapshot::{build_snapshot, ManifestListAncestry, SnapshotOptions};

    let mut inv = RegInvImage::default();
    let dmap = inv.0.entry("img".to_string()).or_default();
    dmap.insert(digest(1), vec![tag("t1"), tag("t2")]);
    dmap.insert(digest(2), vec![]);

    let options = SnapshotOptions {
        minimal_snapshot: false,
        snapshot_tag: Some(tag("t1")),
    };
    let images = build_snapshot(&inv, &options, &ManifestListAncestry::default());

    assert_eq!(images.len(), 1);
    assert_eq!(images[0].name, "img");
    assert_eq!(images[0].dmap.len(), 1);
    assert_eq!(images[0].dmap[0].digest, digest(1).to_string());
    assert_eq!(images[0].dmap[0].tags, vec!["t1".to_string()]);
}
