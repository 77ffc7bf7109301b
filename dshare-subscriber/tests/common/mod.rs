//! Shared fixtures: a real publisher on a local port and subscriber contexts
//! over temporary directories.

#![allow(dead_code)]

use dshare_core::container::{write_array, write_container};
use dshare_core::{ArrayMeta, DType, DatasetMeta, LazyExprMeta};
use dshare_publish::http_util::{json_error, json_ok};
use dshare_publish::{PublisherConfig, PublisherHandler};
use dshare_subscriber::{SubscriberConfig, SubscriberContext};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Publisher serving a temporary directory, recording every request
pub struct TestPublisher {
    pub dir: TempDir,
    pub url: String,
    requests: Arc<Mutex<Vec<String>>>,
    ghosts: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<Vec<String>>>,
    server: tokio::task::JoinHandle<()>,
}

impl TestPublisher {
    pub async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(PublisherHandler::new(PublisherConfig {
            name: "foo".into(),
            root_dir: dir.path().to_path_buf(),
            listen: "127.0.0.1:0".into(),
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let ghosts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let failing: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let log = requests.clone();
        let extra = ghosts.clone();
        let broken = failing.clone();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let log = log.clone();
                let extra = extra.clone();
                let broken = broken.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        let log = log.clone();
                        let extra = extra.clone();
                        let broken = broken.clone();
                        async move {
                            let uri = req.uri().to_string();
                            log.lock().unwrap().push(uri.clone());
                            if broken.lock().unwrap().contains(&uri) {
                                return Ok::<_, Infallible>(json_error(500, "disk read failed"));
                            }
                            // listed but never servable: exercises the listing/info race
                            if req.uri().path() == "/api/list" {
                                let mut paths = handler.list().unwrap();
                                paths.extend(extra.lock().unwrap().iter().cloned());
                                paths.sort();
                                return Ok::<_, Infallible>(json_ok(&paths));
                            }
                            Ok::<_, Infallible>(handler.handle(req).await)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            dir,
            url,
            requests,
            ghosts,
            failing,
            server,
        }
    }

    pub fn file(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// float64 array holding `values`
    pub fn write_array(&self, rel: &str, shape: &[u64], chunks: &[u64], values: &[f64]) {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        write_array(
            &self.file(rel),
            ArrayMeta {
                shape: shape.to_vec(),
                chunks: chunks.to_vec(),
                dtype: DType::Float64,
            },
            &data,
        )
        .unwrap();
    }

    /// 1-d float64 array `0, 1, ..., len-1`
    pub fn write_range(&self, rel: &str, len: u64, chunk: u64) {
        let values: Vec<f64> = (0..len).map(|v| v as f64).collect();
        self.write_array(rel, &[len], &[chunk], &values);
    }

    pub fn write_lazy(&self, rel: &str, expression: &str, operands: &[(&str, &str)], shape: &[u64]) {
        let meta = DatasetMeta::LazyExpr(lazy_meta(expression, operands, shape));
        write_container(&self.file(rel), &meta, &[]).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.file(rel)).unwrap();
    }

    /// Make `/api/list` also report a path that does not exist
    pub fn add_ghost(&self, rel: &str) {
        self.ghosts.lock().unwrap().push(rel.to_string());
    }

    /// Answer downloads of chunk `nchunk` of `rel` with 500 until cleared
    pub fn fail_download(&self, rel: &str, nchunk: u64) {
        self.failing
            .lock()
            .unwrap()
            .push(format!("/api/download/{}?nchunk={}", rel, nchunk));
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    /// Chunk indices downloaded for `rel`, in request order
    pub fn downloads(&self, rel: &str) -> Vec<u64> {
        let prefix = format!("/api/download/{}?nchunk=", rel);
        self.requests()
            .iter()
            .filter_map(|r| r.strip_prefix(&prefix))
            .map(|n| n.parse().unwrap())
            .collect()
    }

    pub fn all_downloads(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.starts_with("/api/download/"))
            .count()
    }
}

impl Drop for TestPublisher {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub fn lazy_meta(expression: &str, operands: &[(&str, &str)], shape: &[u64]) -> LazyExprMeta {
    LazyExprMeta {
        expression: expression.to_string(),
        operands: operands
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        shape: shape.to_vec(),
        dtype: DType::Float64,
    }
}

pub fn config(tmp: &TempDir) -> SubscriberConfig {
    SubscriberConfig {
        cache_dir: tmp.path().join("cache"),
        state_dir: tmp.path().join("state"),
        request_timeout_secs: 5,
        connect_timeout_secs: 2,
        feed_disconnect_timeout_secs: 1,
        ..Default::default()
    }
}

/// Subscriber with root `foo` served by `publisher` and already subscribed
pub async fn subscriber(tmp: &TempDir, publisher: &TestPublisher) -> Arc<SubscriberContext> {
    let ctx = SubscriberContext::create(config(tmp)).unwrap();
    ctx.add_root("foo", &publisher.url).unwrap();
    ctx.subscribe_root("foo").await.unwrap();
    ctx
}

/// Poll `check` until it holds or a few seconds pass
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
