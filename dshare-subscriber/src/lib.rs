//! dshare subscriber
//!
//! Mirrors remote roots into a local chunk cache and fetches chunks on
//! demand:
//! - `client`: publisher and broker HTTP clients
//! - `feed`: websocket change feed
//! - `mirror`: placeholders and etags kept in step with publishers
//! - `fetch`: partial fetch engine
//! - `resolve`: lazy expression resolver
//! - `context`: the `SubscriberContext` tying them together

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod locks;
pub mod mirror;
pub mod resolve;

pub use client::{BrokerClient, InfoResponse, PublisherClient, RootAnnouncement};
pub use config::SubscriberConfig;
pub use context::{OpenDataset, OpenedDataset, SubscriberContext};
pub use error::{Result, SyncError};
pub use feed::{DatasetEvent, FeedClient, FeedFrame, FeedHandler, NEW_ROOT_TOPIC};
pub use fetch::{FetchEngine, FetchReport};
pub use locks::LockTable;
pub use mirror::{Mirror, ResyncReport};
pub use resolve::{ComputableHandle, Resolver};

use dshare_core::ChunkStore;
use std::sync::Arc;

/// Run file work (container reads, table saves) on the blocking pool
pub(crate) async fn unblock<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> dshare_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

/// Run a chunk store operation on the blocking pool
pub(crate) async fn blocking<T, F>(store: &Arc<ChunkStore>, f: F) -> Result<T>
where
    F: FnOnce(&ChunkStore) -> dshare_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    unblock(move || f(&store)).await
}
