//! Metadata mirror: keeps placeholders and etags in step with publishers
//!
//! Every placeholder change (initialize, remove) happens under the dataset's
//! path lock, the same lock the fetch engine holds while installing chunks.

use async_trait::async_trait;
use dshare_core::{ChunkStore, DatasetMeta, DatasetPath, EtagTable, RootTable};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{blocking, unblock};
use crate::client::{InfoResponse, PublisherClient, RootAnnouncement};
use crate::error::{Result, SyncError};
use crate::feed::{DatasetEvent, FeedHandler};
use crate::locks::LockTable;

/// Outcome of one `resync`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub root: String,
    /// 304: local placeholder and chunks kept
    pub unchanged: usize,
    /// New or changed upstream: placeholder re-initialized
    pub refreshed: usize,
    /// No longer listed upstream: placeholder removed
    pub removed: usize,
    /// Listed, then gone before its metadata could be read
    pub skipped: usize,
}

pub struct Mirror {
    store: Arc<ChunkStore>,
    etags: Arc<EtagTable>,
    roots: Arc<RootTable>,
    client: PublisherClient,
    locks: LockTable,
}

impl Mirror {
    pub fn new(
        store: Arc<ChunkStore>,
        etags: Arc<EtagTable>,
        roots: Arc<RootTable>,
        client: PublisherClient,
        locks: LockTable,
    ) -> Self {
        Self {
            store,
            etags,
            roots,
            client,
            locks,
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn etags(&self) -> &EtagTable {
        &self.etags
    }

    pub fn roots(&self) -> &RootTable {
        &self.roots
    }

    pub fn client(&self) -> &PublisherClient {
        &self.client
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Publisher endpoint of a known root
    pub fn endpoint(&self, root: &str) -> Result<String> {
        self.roots
            .get(root)
            .map(|r| r.endpoint)
            .ok_or_else(|| SyncError::UnknownRoot(root.to_string()))
    }

    pub fn is_subscribed(&self, root: &str) -> bool {
        self.roots.get(root).map(|r| r.subscribed).unwrap_or(false)
    }

    /// Record a root and its publisher; returns whether anything changed
    pub fn register_root(&self, name: &str, endpoint: &str) -> Result<bool> {
        let changed = self.roots.upsert(name, endpoint)?;
        if changed {
            tracing::info!("Root {} served by {}", name, endpoint);
        }
        Ok(changed)
    }

    /// Bring every placeholder of `root` up to date with its publisher
    pub async fn resync(&self, root: &str) -> Result<ResyncReport> {
        let endpoint = self.endpoint(root)?;
        let listed = self.client.list(&endpoint, root).await?;
        let mut report = ResyncReport {
            root: root.to_string(),
            ..Default::default()
        };

        for rel in &listed {
            let path = match DatasetPath::new(root, rel) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("Skipping unusable path {:?} in {}: {}", rel, root, e);
                    report.skipped += 1;
                    continue;
                }
            };
            let _guard = self.locks.lock(&path.to_string()).await;
            match self.refresh_locked(&endpoint, &path).await {
                Ok(true) => report.refreshed += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) if e.is_not_found() => {
                    tracing::warn!("{} vanished between listing and info, skipping", path);
                    self.remove_locked(&path).await?;
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let listed: BTreeSet<&str> = listed.iter().map(String::as_str).collect();
        let mut known: BTreeSet<String> = self.etags.paths(root).into_iter().collect();
        known.extend(self.store.list(root)?);
        for rel in known.iter().filter(|rel| !listed.contains(rel.as_str())) {
            let path = DatasetPath::new(root, rel)?;
            let _guard = self.locks.lock(&path.to_string()).await;
            self.remove_locked(&path).await?;
            report.removed += 1;
        }

        tracing::info!(
            "Resynced {}: {} unchanged, {} refreshed, {} removed, {} skipped",
            root,
            report.unchanged,
            report.refreshed,
            report.removed,
            report.skipped
        );
        Ok(report)
    }

    /// Conditionally re-read the metadata of `path`
    ///
    /// Returns whether the placeholder was (re)initialized. The caller must
    /// hold the path lock.
    pub(crate) async fn refresh_locked(&self, endpoint: &str, path: &DatasetPath) -> Result<bool> {
        let stored = self
            .etags
            .get(path.root(), path.rel())
            .filter(|_| self.store.exists(path));
        match self.client.info(endpoint, path, stored.as_deref()).await? {
            InfoResponse::NotModified => {
                tracing::debug!("{} unchanged (etag {:?})", path, stored);
                Ok(false)
            }
            InfoResponse::Modified { meta, etag } => {
                self.initialize_locked(path, meta).await?;
                self.record_etag(path, &etag).await?;
                tracing::debug!("{} initialized at etag {}", path, etag);
                Ok(true)
            }
        }
    }

    /// Apply one root-topic event
    pub async fn apply_event(&self, root: &str, event: DatasetEvent) -> Result<()> {
        let path = DatasetPath::new(root, &event.path)?;
        let _guard = self.locks.lock(&path.to_string()).await;
        match event.metadata {
            None => {
                self.remove_locked(&path).await?;
                tracing::info!("Removed {} (deleted upstream)", path);
            }
            Some(meta) => {
                let current = self.etags.get(root, &event.path);
                if event.etag.is_some() && event.etag == current && self.store.exists(&path) {
                    tracing::debug!("{} already at etag {:?}", path, current);
                    return Ok(());
                }
                self.initialize_locked(&path, meta).await?;
                match &event.etag {
                    Some(etag) => self.record_etag(&path, etag).await?,
                    None => self.forget_etag(&path).await?,
                }
                tracing::info!("Updated {} from feed", path);
            }
        }
        Ok(())
    }

    async fn initialize_locked(&self, path: &DatasetPath, meta: DatasetMeta) -> Result<()> {
        let path = path.clone();
        blocking(&self.store, move |store| store.initialize(&path, &meta)).await
    }

    async fn remove_locked(&self, path: &DatasetPath) -> Result<()> {
        let target = path.clone();
        blocking(&self.store, move |store| store.remove(&target)).await?;
        self.forget_etag(path).await
    }

    async fn record_etag(&self, path: &DatasetPath, etag: &str) -> Result<()> {
        let (etags, path, etag) = (self.etags.clone(), path.clone(), etag.to_string());
        unblock(move || etags.record(path.root(), path.rel(), &etag)).await
    }

    async fn forget_etag(&self, path: &DatasetPath) -> Result<()> {
        let (etags, path) = (self.etags.clone(), path.clone());
        unblock(move || etags.forget(path.root(), path.rel()).map(|_| ())).await
    }
}

/// Applies upsert/delete events of subscribed root topics
pub struct RootEventHandler {
    mirror: Arc<Mirror>,
}

impl RootEventHandler {
    pub fn new(mirror: Arc<Mirror>) -> Self {
        Self { mirror }
    }
}

#[async_trait]
impl FeedHandler for RootEventHandler {
    async fn handle(&self, topic: &str, payload: serde_json::Value) {
        if !self.mirror.is_subscribed(topic) {
            tracing::debug!("Ignoring event for unsubscribed root {}", topic);
            return;
        }
        let event: DatasetEvent = match serde_json::from_value(payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Malformed event on {}: {}", topic, e);
                return;
            }
        };
        if let Err(e) = self.mirror.apply_event(topic, event).await {
            tracing::warn!("Failed to apply event on {}: {}", topic, e);
        }
    }
}

/// Records roots announced on the `@new` topic
pub struct NewRootHandler {
    mirror: Arc<Mirror>,
}

impl NewRootHandler {
    pub fn new(mirror: Arc<Mirror>) -> Self {
        Self { mirror }
    }
}

#[async_trait]
impl FeedHandler for NewRootHandler {
    async fn handle(&self, _topic: &str, payload: serde_json::Value) {
        match serde_json::from_value::<RootAnnouncement>(payload) {
            Ok(root) => {
                if let Err(e) = self.mirror.register_root(&root.name, &root.http) {
                    tracing::warn!("Failed to record root {}: {}", root.name, e);
                }
            }
            Err(e) => tracing::warn!("Malformed root announcement: {}", e),
        }
    }
}
