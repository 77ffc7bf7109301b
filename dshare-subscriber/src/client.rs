//! HTTP clients for publishers and the broker.
//!
//! Publisher endpoints:
//! - `GET /api/list`
//! - `GET /api/info/{path}` with `If-None-Match`
//! - `GET /api/download/{path}?nchunk={n}`
//!
//! Broker endpoint:
//! - `GET /api/roots`

use bytes::Bytes;
use dshare_core::{DatasetMeta, DatasetPath};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::SubscriberConfig;
use crate::error::{Result, SyncError};

/// Result of a conditional metadata request
#[derive(Debug, Clone, PartialEq)]
pub enum InfoResponse {
    /// The stored etag is still current (HTTP 304)
    NotModified,
    Modified { meta: DatasetMeta, etag: String },
}

/// A root as announced by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootAnnouncement {
    pub name: String,
    /// Publisher base URL
    pub http: String,
}

fn build_http(config: &SubscriberConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.request_timeout())
        .connect_timeout(config.connect_timeout())
        .build()
        .map_err(|e| SyncError::Config(format!("http client: {}", e)))
}

/// `{base}/api/{api}/{segments...}` with every segment percent-encoded
fn api_url(base: &str, api: &str, rel: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| SyncError::Config(format!("bad endpoint {:?}: {}", base, e)))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| SyncError::Config(format!("bad endpoint {:?}", base)))?;
        segments.pop_if_empty().push("api").push(api);
        if let Some(rel) = rel {
            segments.extend(rel.split('/'));
        }
    }
    Ok(url)
}

async fn send(request: reqwest::RequestBuilder, url: &Url) -> Result<reqwest::Response> {
    request
        .send()
        .await
        .map_err(|source| SyncError::PublisherUnreachable {
            url: url.to_string(),
            source,
        })
}

async fn error_for_status(resp: reqwest::Response, url: &Url, not_found: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(SyncError::NotFound(not_found.to_string()));
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SyncError::Publisher {
        status: status.as_u16(),
        url: url.to_string(),
        body,
    })
}

/// Client for the publisher HTTP API; one instance serves every endpoint
#[derive(Clone)]
pub struct PublisherClient {
    http: reqwest::Client,
}

impl PublisherClient {
    pub fn new(config: &SubscriberConfig) -> Result<Self> {
        Ok(Self {
            http: build_http(config)?,
        })
    }

    /// GET /api/list
    pub async fn list(&self, endpoint: &str, root: &str) -> Result<Vec<String>> {
        let url = api_url(endpoint, "list", None)?;
        let resp = send(self.http.get(url.clone()), &url).await?;
        let resp = error_for_status(resp, &url, root).await?;
        resp.json().await.map_err(|e| SyncError::InvalidResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// GET /api/info/{path}, conditional on `etag` when given
    pub async fn info(&self, endpoint: &str, path: &DatasetPath, etag: Option<&str>) -> Result<InfoResponse> {
        let url = api_url(endpoint, "info", Some(path.rel()))?;
        let mut request = self.http.get(url.clone());
        if let Some(etag) = etag {
            request = request.header("If-None-Match", format!("\"{}\"", etag));
        }
        let resp = send(request, &url).await?;
        let resp = error_for_status(resp, &url, &path.to_string()).await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(InfoResponse::NotModified);
        }

        let etag = resp
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .ok_or_else(|| SyncError::InvalidResponse {
                url: url.to_string(),
                reason: "missing ETag header".into(),
            })?;
        let meta = resp.json().await.map_err(|e| SyncError::InvalidResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(InfoResponse::Modified { meta, etag })
    }

    /// GET /api/download/{path}?nchunk={n}; the whole body is read
    pub async fn download(&self, endpoint: &str, path: &DatasetPath, nchunk: u64) -> Result<Bytes> {
        let mut url = api_url(endpoint, "download", Some(path.rel()))?;
        url.query_pairs_mut().append_pair("nchunk", &nchunk.to_string());
        let resp = send(self.http.get(url.clone()), &url).await?;
        let resp = error_for_status(resp, &url, &path.to_string()).await?;
        resp.bytes()
            .await
            .map_err(|source| SyncError::PublisherUnreachable {
                url: url.to_string(),
                source,
            })
    }
}

/// Client for the broker's root directory
#[derive(Clone)]
pub struct BrokerClient {
    base_url: String,
    http: reqwest::Client,
}

impl BrokerClient {
    pub fn new(base_url: &str, config: &SubscriberConfig) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: build_http(config)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET /api/roots
    pub async fn list_roots(&self) -> Result<BTreeMap<String, RootAnnouncement>> {
        let url = api_url(&self.base_url, "roots", None)?;
        let resp = send(self.http.get(url.clone()), &url).await?;
        let resp = error_for_status(resp, &url, "broker roots").await?;
        resp.json().await.map_err(|e| SyncError::InvalidResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Websocket URL of the broker's pub/sub endpoint (`/pubsub`)
    pub fn feed_url(&self) -> String {
        let ws = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}/pubsub", ws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_encodes_segments() {
        let url = api_url("http://localhost:8002", "info", Some("dir/my data.dsc")).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8002/api/info/dir/my%20data.dsc");

        let url = api_url("http://localhost:8002/", "list", None).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8002/api/list");

        let url = api_url("http://host/prefix/", "list", None).unwrap();
        assert_eq!(url.as_str(), "http://host/prefix/api/list");
    }

    #[test]
    fn test_bad_endpoint() {
        assert!(matches!(api_url("not a url", "list", None), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_feed_url() {
        let config = SubscriberConfig::default();
        let broker = BrokerClient::new("http://localhost:8000/", &config).unwrap();
        assert_eq!(broker.feed_url(), "ws://localhost:8000/pubsub");
        let broker = BrokerClient::new("https://broker.example", &config).unwrap();
        assert_eq!(broker.feed_url(), "wss://broker.example/pubsub");
    }
}
