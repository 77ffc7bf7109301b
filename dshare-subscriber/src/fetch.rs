//! Partial fetch engine: slice → overlapping chunks → download the missing ones
//!
//! `ensure` holds the dataset's path lock for its whole run, so concurrent
//! ensures of one path download each chunk once while different paths
//! proceed in parallel. Chunks are fetched one at a time in ascending index
//! order. There is no rollback: chunks installed before a failure stay, and
//! a retry downloads only the rest.

use dshare_core::{Container, DatasetPath, Slice};
use serde::Serialize;
use std::sync::Arc;

use crate::{blocking, unblock};
use crate::error::{Result, SyncError};
use crate::mirror::Mirror;

/// Outcome of one `ensure`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub path: String,
    /// Chunks the request needs, ascending
    pub needed: Vec<u64>,
    /// Chunks downloaded by this call, in download order
    pub downloaded: Vec<u64>,
    /// Compressed bytes downloaded
    pub bytes: u64,
}

pub struct FetchEngine {
    mirror: Arc<Mirror>,
}

impl FetchEngine {
    pub fn new(mirror: Arc<Mirror>) -> Self {
        Self { mirror }
    }

    pub fn mirror(&self) -> &Arc<Mirror> {
        &self.mirror
    }

    /// Make every chunk overlapping `slice` (all chunks for `None`) present
    pub async fn ensure(&self, path: &DatasetPath, slice: Option<&Slice>) -> Result<FetchReport> {
        Ok(self.ensure_open(path, slice).await?.1)
    }

    /// `ensure`, also returning the container opened under the path lock
    ///
    /// Reads through the returned handle see the chunks this call made
    /// present, even if the dataset is re-initialized right after.
    pub async fn ensure_open(&self, path: &DatasetPath, slice: Option<&Slice>) -> Result<(Container, FetchReport)> {
        let _guard = self.mirror.locks().lock(&path.to_string()).await;
        let container = self.placeholder_locked(path).await?;
        let mut report = FetchReport {
            path: path.to_string(),
            ..Default::default()
        };
        let Some(grid) = container.meta().grid()? else {
            // lazy expressions hold no chunks of their own
            return Ok((container, report));
        };
        report.needed = match slice {
            Some(slice) => grid.overlapping_chunks(slice)?,
            None => (0..grid.total_chunks()).collect(),
        };

        let missing = {
            let container = container.clone();
            let needed = report.needed.clone();
            unblock(move || missing_among(&container, &needed)).await?
        };
        if missing.is_empty() {
            tracing::debug!("{}: all {} chunks present", path, report.needed.len());
            return Ok((container, report));
        }
        if path.is_scratch() {
            return Err(SyncError::Store(dshare_core::Error::ChunkAbsent {
                path: path.to_string(),
                index: missing[0],
            }));
        }

        let endpoint = self.mirror.endpoint(path.root())?;
        for index in missing {
            let payload = self.mirror.client().download(&endpoint, path, index).await?;
            report.bytes += payload.len() as u64;
            let target = path.clone();
            blocking(self.mirror.store(), move |store| store.install(&target, index, &payload)).await?;
            tracing::debug!("{}: installed chunk {}", path, index);
            report.downloaded.push(index);
        }

        tracing::info!(
            "{}: fetched {} of {} chunks ({} bytes)",
            path,
            report.downloaded.len(),
            report.needed.len(),
            report.bytes
        );
        Ok((container, report))
    }

    /// Open the placeholder for `path`, reading its metadata first if the
    /// subscriber has never seen it
    pub async fn open_placeholder(&self, path: &DatasetPath) -> Result<Container> {
        let _guard = self.mirror.locks().lock(&path.to_string()).await;
        self.placeholder_locked(path).await
    }

    async fn placeholder_locked(&self, path: &DatasetPath) -> Result<Container> {
        let store = self.mirror.store();
        if !store.exists(path) {
            if path.is_scratch() {
                return Err(SyncError::NotFound(path.to_string()));
            }
            let endpoint = self.mirror.endpoint(path.root())?;
            self.mirror.refresh_locked(&endpoint, path).await?;
        }
        let target = path.clone();
        blocking(store, move |store| store.open(&target)).await
    }
}

fn missing_among(container: &Container, needed: &[u64]) -> dshare_core::Result<Vec<u64>> {
    let mut missing = Vec::new();
    for &index in needed {
        if !container.is_present(index)? {
            missing.push(index);
        }
    }
    Ok(missing)
}
