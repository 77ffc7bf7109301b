//! Subscriber context: owns the cache, the state tables, the clients and the
//! feed connection, and exposes the read path to collaborators.

use dshare_core::{
    ChunkStore, Container, DatasetMeta, DatasetPath, EtagTable, NdArray, Root, RootTable, Slice,
    SliceSpec,
};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::client::{BrokerClient, PublisherClient};
use crate::config::SubscriberConfig;
use crate::error::{Result, SyncError};
use crate::feed::{FeedClient, FeedHandler, NEW_ROOT_TOPIC};
use crate::fetch::{FetchEngine, FetchReport};
use crate::locks::LockTable;
use crate::mirror::{Mirror, NewRootHandler, ResyncReport, RootEventHandler};
use crate::resolve::{ComputableHandle, Resolver};

/// A dataset made readable by `ensure_and_open`
#[derive(Debug)]
pub enum OpenDataset {
    Array(Container),
    ByteStream(Container),
    LazyExpr(ComputableHandle),
}

/// An opened dataset together with the slice it was opened for
#[derive(Debug)]
pub struct OpenedDataset {
    pub path: DatasetPath,
    pub slice: Slice,
    pub dataset: OpenDataset,
    /// Downloads performed to open it (one report per stored dataset)
    pub fetched: Vec<FetchReport>,
}

impl OpenedDataset {
    /// Read the requested slice from local data
    pub fn read(&self) -> Result<NdArray> {
        match &self.dataset {
            OpenDataset::Array(c) | OpenDataset::ByteStream(c) => Ok(c.read_slice(&self.slice)?),
            OpenDataset::LazyExpr(h) => h.evaluate(Some(&self.slice)),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.dataset {
            OpenDataset::Array(_) => "array",
            OpenDataset::ByteStream(_) => "byte_stream",
            OpenDataset::LazyExpr(_) => "lazy_expr",
        }
    }
}

pub struct SubscriberContext {
    config: SubscriberConfig,
    mirror: Arc<Mirror>,
    engine: Arc<FetchEngine>,
    resolver: Resolver,
    broker: Option<BrokerClient>,
    root_handler: Arc<dyn FeedHandler>,
    feed: tokio::sync::RwLock<Option<FeedClient>>,
}

impl SubscriberContext {
    /// Open the cache and state tables; no network activity yet
    pub fn create(config: SubscriberConfig) -> Result<Arc<Self>> {
        let store = Arc::new(ChunkStore::new(&config.cache_dir)?);
        let etags = Arc::new(EtagTable::load(config.etag_file())?);
        let roots = Arc::new(RootTable::load(config.root_file())?);
        let client = PublisherClient::new(&config)?;
        let broker = config
            .broker
            .as_deref()
            .map(|url| BrokerClient::new(url, &config))
            .transpose()?;

        let mirror = Arc::new(Mirror::new(store, etags, roots, client, LockTable::new()));
        let engine = Arc::new(FetchEngine::new(mirror.clone()));
        tracing::info!(
            "Subscriber cache at {:?}, state at {:?}",
            config.cache_dir,
            config.state_dir
        );
        Ok(Arc::new(Self {
            resolver: Resolver::new(engine.clone()),
            root_handler: Arc::new(RootEventHandler::new(mirror.clone())),
            config,
            mirror,
            engine,
            broker,
            feed: tokio::sync::RwLock::new(None),
        }))
    }

    /// Discover roots, connect the feed and resync every subscribed root
    ///
    /// An unreachable broker only degrades to cache-only mode.
    pub async fn start(&self) -> Result<()> {
        match &self.broker {
            Some(broker) => {
                if let Err(e) = self.discover_roots(broker).await {
                    tracing::warn!("Broker unreachable ({}), running from cache only", e);
                }
                match FeedClient::connect(&broker.feed_url()).await {
                    Ok(feed) => self.attach_feed(feed).await?,
                    Err(e) => {
                        tracing::warn!("Feed unavailable ({}), no change events this session", e)
                    }
                }
            }
            None => tracing::info!("No broker configured, running from cache only"),
        }

        for root in self.mirror.roots().subscribed() {
            if let Err(e) = self.mirror.resync(&root.name).await {
                tracing::warn!("Resync of {} failed: {}", root.name, e);
            }
        }
        Ok(())
    }

    /// Route `@new` and every subscribed root topic of `feed` to the mirror
    pub async fn attach_feed(&self, feed: FeedClient) -> Result<()> {
        feed.subscribe(NEW_ROOT_TOPIC, Arc::new(NewRootHandler::new(self.mirror.clone())))
            .await?;
        for root in self.mirror.roots().subscribed() {
            feed.subscribe(&root.name, self.root_handler.clone()).await?;
        }
        *self.feed.write().await = Some(feed);
        Ok(())
    }

    /// Close the feed within the configured bound
    pub async fn shutdown(&self) {
        if let Some(feed) = self.feed.write().await.take() {
            feed.disconnect(self.config.feed_disconnect_timeout()).await;
        }
        tracing::info!("Subscriber stopped");
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        self.mirror.store()
    }

    pub fn mirror(&self) -> &Arc<Mirror> {
        &self.mirror
    }

    pub fn engine(&self) -> &Arc<FetchEngine> {
        &self.engine
    }

    pub fn roots(&self) -> Vec<Root> {
        self.mirror.roots().all()
    }

    /// Record a root's publisher without going through the broker
    pub fn add_root(&self, name: &str, endpoint: &str) -> Result<bool> {
        self.mirror.register_root(name, endpoint)
    }

    /// Subscribe to `name` and bring its placeholders up to date
    pub async fn subscribe_root(&self, name: &str) -> Result<ResyncReport> {
        if self.mirror.roots().get(name).is_none() {
            if let Some(broker) = &self.broker {
                self.discover_roots(broker).await?;
            }
        }
        self.mirror
            .roots()
            .set_subscribed(name, true)
            .map_err(|e| match e {
                dshare_core::Error::NotFound(_) => SyncError::UnknownRoot(name.to_string()),
                other => other.into(),
            })?;
        if let Some(feed) = self.feed.read().await.as_ref() {
            if !feed.topics().iter().any(|t| t == name) {
                feed.subscribe(name, self.root_handler.clone()).await?;
            }
        }
        tracing::info!("Subscribed to {}", name);
        self.mirror.resync(name).await
    }

    /// Stop applying events for `name`; its cache stays readable
    pub fn unsubscribe_root(&self, name: &str) -> Result<()> {
        self.mirror
            .roots()
            .set_subscribed(name, false)
            .map_err(|e| match e {
                dshare_core::Error::NotFound(_) => SyncError::UnknownRoot(name.to_string()),
                other => other.into(),
            })
    }

    pub async fn resync(&self, root: &str) -> Result<ResyncReport> {
        self.mirror.resync(root).await
    }

    /// Fetch whatever `slice` of `path` needs and open it for reading
    pub async fn ensure_and_open(&self, path: &str, slice: Option<&SliceSpec>) -> Result<OpenedDataset> {
        let path = DatasetPath::parse(path)?;
        let placeholder = self.engine.open_placeholder(&path).await?;
        let shape = placeholder.shape();
        let requested = slice.map(|spec| spec.resolve(&shape)).transpose()?;
        let slice = requested.clone().unwrap_or_else(|| Slice::full(&shape));

        let (dataset, fetched) = match placeholder.meta() {
            DatasetMeta::LazyExpr(_) => {
                let handle = self.resolver.resolve(&path, Some(&slice)).await?;
                let fetched = handle.fetch_reports().into_iter().cloned().collect();
                (OpenDataset::LazyExpr(handle), fetched)
            }
            meta => {
                let is_array = matches!(meta, DatasetMeta::Array(_));
                let (container, report) = self.engine.ensure_open(&path, requested.as_ref()).await?;
                let dataset = if is_array {
                    OpenDataset::Array(container)
                } else {
                    OpenDataset::ByteStream(container)
                };
                (dataset, vec![report])
            }
        };
        Ok(OpenedDataset {
            path,
            slice,
            dataset,
            fetched,
        })
    }

    /// Relative paths known under `root`: mirrored or cached, sorted
    pub fn list_known_datasets(&self, root: &str) -> Result<Vec<String>> {
        let mut paths: BTreeSet<String> = self.mirror.etags().paths(root).into_iter().collect();
        paths.extend(self.store().list(root)?);
        Ok(paths.into_iter().collect())
    }

    async fn discover_roots(&self, broker: &BrokerClient) -> Result<()> {
        let roots = broker.list_roots().await?;
        for root in roots.values() {
            self.mirror.register_root(&root.name, &root.http)?;
        }
        tracing::info!("Broker {} lists {} roots", broker.base_url(), roots.len());
        Ok(())
    }
}
