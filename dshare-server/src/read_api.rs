//! Subscriber read API
//!
//!   GET  /api/roots                    → known roots
//!   POST /api/subscribe/{root}         → subscribe and resync
//!   POST /api/resync/{root}            → resync
//!   GET  /api/list/{root}              → known dataset paths
//!   GET  /api/info/{root}/{path}       → metadata and chunk presence
//!   GET  /api/fetch/{root}/{path}?slice=a:b,c:d
//!                                      → values (JSON), raw bytes for byte streams

use bytes::Bytes;
use dshare_core::{DType, DatasetMeta, DatasetPath, SliceSpec};
use dshare_publish::http_util::{json_error, json_ok, octet_stream, parse_query, urldecode};
use dshare_subscriber::{OpenDataset, SubscriberContext, SyncError};
use http_body_util::Full;
use hyper::{Request, Response};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct DatasetInfo {
    path: String,
    metadata: DatasetMeta,
    etag: Option<String>,
    total_chunks: u64,
    present_chunks: u64,
}

#[derive(Serialize)]
struct Values {
    path: String,
    kind: &'static str,
    slice: String,
    shape: Vec<u64>,
    dtype: DType,
    values: Vec<f64>,
}

/// HTTP status for a subscriber error
pub fn status_of(e: &SyncError) -> u16 {
    match e {
        e if e.is_not_found() => 404,
        SyncError::UnknownRoot(_) => 404,
        SyncError::MissingOperand { .. } => 424,
        SyncError::PublisherUnreachable { .. }
        | SyncError::Publisher { .. }
        | SyncError::InvalidResponse { .. } => 502,
        SyncError::ExpressionCycle(_) => 400,
        SyncError::Store(
            dshare_core::Error::InvalidPath(_)
            | dshare_core::Error::InvalidSlice(_)
            | dshare_core::Error::Expression(_),
        ) => 400,
        _ => 500,
    }
}

pub struct ReadApi {
    ctx: Arc<SubscriberContext>,
}

impl ReadApi {
    pub fn new(ctx: Arc<SubscriberContext>) -> Self {
        Self { ctx }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();

        let result = self.route(&method, &path, &query).await;
        result.unwrap_or_else(|e| {
            let status = status_of(&e);
            if status >= 500 {
                tracing::error!("{} {} failed: {}", method, path, e);
            } else {
                tracing::debug!("{} {} -> {}: {}", method, path, status, e);
            }
            json_error(status, &e.to_string())
        })
    }

    async fn route(&self, method: &str, path: &str, query: &str) -> Result<Response<Full<Bytes>>, SyncError> {
        match method {
            "GET" => {
                if path == "/api/roots" {
                    return Ok(json_ok(&self.ctx.roots()));
                }
                if let Some(root) = path.strip_prefix("/api/list/") {
                    return Ok(json_ok(&self.ctx.list_known_datasets(&urldecode(root))?));
                }
                if let Some(target) = path.strip_prefix("/api/info/") {
                    return self.info(&urldecode(target)).await;
                }
                if let Some(target) = path.strip_prefix("/api/fetch/") {
                    let params = parse_query(query);
                    return self.fetch(&urldecode(target), params.get("slice").map(String::as_str)).await;
                }
            }
            "POST" => {
                if let Some(root) = path.strip_prefix("/api/subscribe/") {
                    return Ok(json_ok(&self.ctx.subscribe_root(&urldecode(root)).await?));
                }
                if let Some(root) = path.strip_prefix("/api/resync/") {
                    return Ok(json_ok(&self.ctx.resync(&urldecode(root)).await?));
                }
            }
            _ => return Ok(json_error(405, "Method Not Allowed")),
        }
        Ok(json_error(404, &format!("no route for {} {}", method, path)))
    }

    async fn info(&self, target: &str) -> Result<Response<Full<Bytes>>, SyncError> {
        let path = DatasetPath::parse(target)?;
        let container = self.ctx.engine().open_placeholder(&path).await?;
        let total = container.total_chunks();
        let missing = {
            let container = container.clone();
            tokio::task::spawn_blocking(move || container.missing_chunks()).await??.len() as u64
        };
        Ok(json_ok(&DatasetInfo {
            path: path.to_string(),
            metadata: container.meta().clone(),
            etag: self.ctx.mirror().etags().get(path.root(), path.rel()),
            total_chunks: total,
            present_chunks: total - missing,
        }))
    }

    async fn fetch(&self, target: &str, slice: Option<&str>) -> Result<Response<Full<Bytes>>, SyncError> {
        let spec: Option<SliceSpec> = slice.map(str::parse).transpose()?;
        let opened = self.ctx.ensure_and_open(target, spec.as_ref()).await?;
        let (opened, data) = tokio::task::spawn_blocking(move || {
            let data = opened.read();
            (opened, data)
        })
        .await?;
        let data = data?;
        if let OpenDataset::ByteStream(_) = opened.dataset {
            return Ok(octet_stream(data.data));
        }
        Ok(json_ok(&Values {
            path: opened.path.to_string(),
            kind: opened.kind_name(),
            slice: spec.map(|s| s.to_string()).unwrap_or_default(),
            shape: data.shape.clone(),
            dtype: data.dtype,
            values: data.to_f64(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dshare_core::ArrayMeta;
    use dshare_core::container::write_array;
    use dshare_subscriber::SubscriberConfig;
    use http_body_util::{BodyExt, Empty};
    use tempfile::TempDir;

    fn context(tmp: &TempDir) -> Arc<SubscriberContext> {
        SubscriberContext::create(SubscriberConfig {
            cache_dir: tmp.path().join("cache"),
            state_dir: tmp.path().join("state"),
            ..Default::default()
        })
        .unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Empty::new())
            .unwrap()
    }

    async fn json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn write_scratch(ctx: &SubscriberContext, rel: &str) {
        let path = DatasetPath::parse(&format!("@scratch/{}", rel)).unwrap();
        let data: Vec<u8> = (0..12).flat_map(|v| (v as f64).to_le_bytes()).collect();
        write_array(
            &ctx.store().file_path(&path),
            ArrayMeta {
                shape: vec![3, 4],
                chunks: vec![2, 2],
                dtype: DType::Float64,
            },
            &data,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_fetch_scratch_values() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        write_scratch(&ctx, "grid.dsc");
        let api = ReadApi::new(ctx);

        let resp = api.handle(request("GET", "/api/fetch/@scratch/grid.dsc?slice=1:3,2")).await;
        assert_eq!(resp.status(), 200);
        let body = json(resp).await;
        assert_eq!(body["shape"], serde_json::json!([2, 1]));
        assert_eq!(body["values"], serde_json::json!([6.0, 10.0]));
        assert_eq!(body["kind"], "array");
    }

    #[tokio::test]
    async fn test_info_and_list() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        write_scratch(&ctx, "grid.dsc");
        let api = ReadApi::new(ctx);

        let body = json(api.handle(request("GET", "/api/info/@scratch/grid.dsc")).await).await;
        assert_eq!(body["total_chunks"], 4);
        assert_eq!(body["present_chunks"], 4);
        assert_eq!(body["metadata"]["kind"], "array");

        let body = json(api.handle(request("GET", "/api/list/@scratch")).await).await;
        assert_eq!(body, serde_json::json!(["grid.dsc"]));
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        write_scratch(&ctx, "grid.dsc");
        let api = ReadApi::new(ctx);

        let status = |uri: &'static str, method: &'static str| {
            let api = &api;
            async move { api.handle(request(method, uri)).await.status().as_u16() }
        };
        assert_eq!(status("/api/fetch/@scratch/none.dsc", "GET").await, 404);
        assert_eq!(status("/api/fetch/nowhere/a.dsc", "GET").await, 404);
        assert_eq!(status("/api/fetch/@scratch/grid.dsc?slice=0:1:2", "GET").await, 400);
        assert_eq!(status("/api/fetch/@scratch/grid.dsc?slice=9", "GET").await, 400);
        assert_eq!(status("/api/subscribe/nowhere", "POST").await, 404);
        assert_eq!(status("/api/roots", "DELETE").await, 405);
        assert_eq!(status("/api/unknown", "GET").await, 404);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(&SyncError::MissingOperand {
                expression: "foo/l".into(),
                operand: "foo/a".into()
            }),
            424
        );
        assert_eq!(
            status_of(&SyncError::Publisher {
                status: 500,
                url: "http://x".into(),
                body: String::new()
            }),
            502
        );
        assert_eq!(
            status_of(&SyncError::Store(dshare_core::Error::Corrupt {
                path: "foo/a".into(),
                reason: "bad magic".into()
            })),
            500
        );
    }
}
