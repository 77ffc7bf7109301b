//! Request routing and the three publisher endpoints

use bytes::Bytes;
use dshare_core::container::{Container, compress_chunk};
use dshare_core::model::{ByteStreamMeta, DatasetMeta, validate_relative};
use http_body_util::Full;
use hyper::{Request, Response};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::http_util::{json_error, json_ok, octet_stream, parse_query, urldecode};
use crate::{BYTE_STREAM_CHUNK, PublishError, PublisherConfig, file_etag};

/// Request handler for one published root
pub struct PublisherHandler {
    config: PublisherConfig,
}

impl PublisherHandler {
    pub fn new(config: PublisherConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    /// Handle an HTTP request; the body is ignored
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let if_none_match = req
            .headers()
            .get("If-None-Match")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        tracing::debug!("Publisher request: {} {}", method, path);
        self.route(&method, &path, &query, if_none_match.as_deref())
    }

    /// Route a request by method and path
    pub fn route(
        &self,
        method: &str,
        path: &str,
        query: &str,
        if_none_match: Option<&str>,
    ) -> Response<Full<Bytes>> {
        if method != "GET" {
            return json_error(405, "Method Not Allowed");
        }
        let result = if path == "/api/list" {
            self.list().map(|paths| json_ok(&paths))
        } else if let Some(rel) = path.strip_prefix("/api/info/") {
            self.info(&urldecode(rel), if_none_match)
        } else if let Some(rel) = path.strip_prefix("/api/download/") {
            self.download(&urldecode(rel), query)
        } else {
            Err(PublishError::NotFound(path.to_string()))
        };
        result.unwrap_or_else(|e| {
            let status = e.status();
            if status == 500 {
                tracing::error!("Publisher error on {}: {}", path, e);
            }
            json_error(status, &e.to_string())
        })
    }

    /// Every regular file below the root directory, sorted
    pub fn list(&self) -> Result<Vec<String>, PublishError> {
        let mut out = Vec::new();
        walk(&self.config.root_dir, "", &mut out)?;
        out.sort();
        Ok(out)
    }

    /// Metadata of the dataset at `rel`
    pub fn metadata(&self, rel: &str) -> Result<DatasetMeta, PublishError> {
        let file = self.resolve(rel)?;
        if Container::sniff(&file) {
            return Ok(Container::open(&file, rel)?.meta().clone());
        }
        Ok(DatasetMeta::ByteStream(ByteStreamMeta {
            size: fs::metadata(&file)?.len(),
            chunk_size: BYTE_STREAM_CHUNK,
        }))
    }

    fn info(&self, rel: &str, if_none_match: Option<&str>) -> Result<Response<Full<Bytes>>, PublishError> {
        let file = self.resolve(rel)?;
        let etag = file_etag(&file)?;
        if if_none_match == Some(etag.as_str()) {
            return Ok(Response::builder()
                .status(304)
                .header("ETag", format!("\"{}\"", etag))
                .body(Full::new(Bytes::new()))
                .unwrap());
        }
        let meta = self.metadata(rel)?;
        let body = serde_json::to_vec(&meta).map_err(dshare_core::Error::from)?;
        Ok(Response::builder()
            .status(200)
            .header("Content-Type", "application/json")
            .header("ETag", format!("\"{}\"", etag))
            .body(Full::new(Bytes::from(body)))
            .unwrap())
    }

    fn download(&self, rel: &str, query: &str) -> Result<Response<Full<Bytes>>, PublishError> {
        let params = parse_query(query);
        let nchunk: u64 = params
            .get("nchunk")
            .ok_or_else(|| PublishError::InvalidRequest("missing nchunk".into()))?
            .parse()
            .map_err(|_| PublishError::InvalidRequest("nchunk must be an integer".into()))?;
        let file = self.resolve(rel)?;

        if Container::sniff(&file) {
            let payload = Container::open(&file, rel)?.read_payload(nchunk)?;
            return Ok(octet_stream(payload));
        }

        let size = fs::metadata(&file)?.len();
        let total = size.div_ceil(BYTE_STREAM_CHUNK);
        if nchunk >= total {
            return Err(dshare_core::Error::ChunkOutOfRange {
                path: rel.to_string(),
                index: nchunk,
                total,
            }
            .into());
        }
        let start = nchunk * BYTE_STREAM_CHUNK;
        let len = BYTE_STREAM_CHUNK.min(size - start);
        let mut raw = vec![0u8; len as usize];
        let mut f = fs::File::open(&file)?;
        f.seek(SeekFrom::Start(start))?;
        f.read_exact(&mut raw)?;
        Ok(octet_stream(compress_chunk(&raw)?))
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf, PublishError> {
        validate_relative(rel).map_err(|_| PublishError::InvalidRequest(format!("bad path {:?}", rel)))?;
        let file = self.config.root_dir.join(rel);
        if !file.is_file() {
            return Err(PublishError::NotFound(rel.to_string()));
        }
        Ok(file)
    }
}

fn walk(dir: &Path, prefix: &str, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let kind = entry.file_type()?;
        if kind.is_dir() {
            walk(&entry.path(), &rel, out)?;
        } else if kind.is_file() {
            out.push(rel);
        }
    }
    Ok(())
}
