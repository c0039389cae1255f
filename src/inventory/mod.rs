use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};

use crate::manifest::{Digest, Tag};
use crate::registry::RegistryClient;

/// Observed state of a single registry: `imageName -> {digest -> [tag]}`.
/// Built purely by listing; tags not named in any manifest are still
/// recorded here (§3 "Inventory").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegInvImage(pub BTreeMap<String, BTreeMap<Digest, Vec<Tag>>>);

impl RegInvImage {
    pub fn digest_for_tag(&self, image_name: &str, tag: &Tag) -> Option<&Digest> {
        self.0.get(image_name).and_then(|dmap| {
            dmap.iter()
                .find(|(_, tags)| tags.contains(tag))
                .map(|(d, _)| d)
        })
    }

    pub fn contains_digest(&self, image_name: &str, digest: &Digest) -> bool {
        self.0
            .get(image_name)
            .map(|dmap| dmap.contains_key(digest))
            .unwrap_or(false)
    }

    fn record(&mut self, image_name: &str, digest: Digest, tags: Vec<Tag>) {
        let entry = self.0.entry(image_name.to_string()).or_default();
        entry.insert(digest, tags);
    }
}

/// `RegistryName -> RegInvImage`, the complete observed world the edge
/// derivation step joins against desired state.
#[derive(Debug, Clone, Default)]
pub struct MasterInventory(pub BTreeMap<String, RegInvImage>);

/// Concurrently lists every declared registry into a `MasterInventory`.
/// Performs full catalog + tag-list enumeration, driven by a bounded worker
/// pool over a task queue since the fanout is recursive and not known
/// up front.
pub struct InventoryReader {
    threads: usize,
}

impl InventoryReader {
    pub fn new(threads: usize) -> Self {
        InventoryReader {
            threads: threads.max(1),
        }
    }

    /// List `registry` recursively starting at its root, returning the
    /// accumulated `RegInvImage`. A missing subpath is not an error — it
    /// means "empty" (§4.2). Work fans out over `threads` concurrent
    /// listers draining a shared queue; a listing that yields child paths
    /// enqueues them for any free worker to pick up (bounded recursion).
    pub async fn list_registry(&self, registry: Arc<dyn RegistryClient>) -> Result<RegInvImage, anyhow::Error> {
        let inventory = Arc::new(RwLock::new(RegInvImage::default()));
        let queue = Arc::new(Mutex::new(VecDeque::from([String::new()])));
        let outstanding = Arc::new(AtomicUsize::new(1));
        let notify = Arc::new(Notify::new());
        let failure: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));

        let mut workers = Vec::with_capacity(self.threads);
        for _ in 0..self.threads {
            let registry = registry.clone();
            let inventory = inventory.clone();
            let queue = queue.clone();
            let outstanding = outstanding.clone();
            let notify = notify.clone();
            let failure = failure.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    // Register as a waiter before checking the queue, not
                    // after: `Notify::notify_waiters` only wakes tasks
                    // already registered, so registering first closes the
                    // gap where another worker finishes and notifies between
                    // our queue check and our `.await` — a missed wakeup
                    // that would otherwise hang this worker forever.
                    let mut notified = std::pin::pin!(notify.notified());
                    notified.as_mut().enable();

                    let path = {
                        let mut guard = queue.lock().await;
                        guard.pop_front()
                    };

                    let path = match path {
                        Some(path) => path,
                        None => {
                            if outstanding.load(Ordering::SeqCst) == 0 {
                                notify.notify_waiters();
                                return;
                            }
                            notified.await;
                            continue;
                        }
                    };

                    let result = registry.list_path(&path).await;
                    let listing = match result {
                        Ok(listing) => listing,
                        Err(e) => {
                            warn!(registry = registry.registry_name(), path = %path, error = %e, "listing failed");
                            *failure.lock().await = Some(e);
                            outstanding.fetch_sub(1, Ordering::SeqCst);
                            notify.notify_waiters();
                            return;
                        }
                    };

                    if !listing.digest_tags.is_empty() {
                        let image_name = path.trim_start_matches('/').to_string();
                        let mut guard = inventory.write().await;
                        for (digest, tags) in listing.digest_tags {
                            debug!(registry = registry.registry_name(), image = %image_name, digest = %digest, "recording observed digest");
                            guard.record(&image_name, digest, tags);
                        }
                    }

                    if !listing.children.is_empty() {
                        let mut guard = queue.lock().await;
                        for child in listing.children {
                            let child_path = if path.is_empty() {
                                format!("/{}", child)
                            } else {
                                format!("{}/{}", path, child)
                            };
                            guard.push_back(child_path);
                        }
                        outstanding.fetch_add(listing.children.len(), Ordering::SeqCst);
                    }
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    notify.notify_waiters();
                }
            }));
        }

        for worker in workers {
            worker.await?;
        }

        // A persistently unreachable registry aborts the run (§4.2).
        if let Some(e) = failure.lock().await.take() {
            return Err(e);
        }

        Arc::try_unwrap(inventory)
            .map(|lock| lock.into_inner())
            .map_err(|_| anyhow::anyhow!("inventory reader left outstanding references"))
    }

    /// List every registry named in `registries` (keyed by registry name)
    /// into a single `MasterInventory`. Registries proceed in parallel;
    /// listing tasks within a registry may also overlap.
    pub async fn build_master_inventory(
        &self,
        registries: Vec<(String, Arc<dyn RegistryClient>)>,
    ) -> Result<MasterInventory, anyhow::Error> {
        let mut handles = Vec::with_capacity(registries.len());
        for (name, client) in registries {
            let reader = InventoryReader::new(self.threads);
            handles.push(tokio::spawn(async move {
                let inv = reader.list_registry(client).await?;
                Ok::<_, anyhow::Error>((name, inv))
            }));
        }

        let mut master = MasterInventory::default();
        for handle in handles {
            let (name, inv) = handle.await??;
            master.0.insert(name, inv);
        }
        Ok(master)
    }
}
