use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use serde::Deserialize;
use serde_yaml::Value;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::Handler;
use crate::context::RequestCtx;
use crate::error::{FasthttpdError, FasthttpdResult};
use crate::logger::Logger;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FsConfig {
    root: String,
    index_names: Vec<String>,
    compress: bool,
}

/// Serves files from a root directory with optional index resolution and
/// gzip compression.
pub struct FsHandler {
    root: PathBuf,
    index_names: Vec<String>,
    compress: bool,
    logger: Logger,
}

impl std::fmt::Debug for FsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsHandler")
            .field("root", &self.root)
            .field("index_names", &self.index_names)
            .field("compress", &self.compress)
            .field("logger", &self.logger)
            .finish()
    }
}

impl FsHandler {
    pub fn new(cfg: &Value, logger: Logger) -> FasthttpdResult<Self> {
        let config: FsConfig = serde_yaml::from_value(cfg.clone())?;
        if config.root.is_empty() {
            return Err(FasthttpdError::handler(
                "failed to create fs handler: require 'root' entry",
            ));
        }
        Ok(Self {
            root: PathBuf::from(config.root),
            index_names: config.index_names,
            compress: config.compress,
            logger,
        })
    }

    /// Maps a request path onto the root, refusing traversal outside it.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = request_path.trim_start_matches('/');
        let relative = Path::new(relative);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(self.root.join(relative))
    }

    async fn locate(&self, mut path: PathBuf) -> Option<PathBuf> {
        let meta = tokio::fs::metadata(&path).await.ok()?;
        if meta.is_dir() {
            for index in &self.index_names {
                let candidate = path.join(index);
                if tokio::fs::metadata(&candidate)
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false)
                {
                    path = candidate;
                    return Some(path);
                }
            }
            return None;
        }
        Some(path)
    }

    fn accepts_gzip(ctx: &RequestCtx) -> bool {
        ctx.request
            .headers()
            .get(ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Handler for FsHandler {
    async fn handle(&self, ctx: &mut RequestCtx) {
        let path = match self.resolve(ctx.path()) {
            Some(path) => path,
            None => {
                ctx.reset_response();
                ctx.set_status(400);
                return;
            }
        };
        let file = match self.locate(path).await {
            Some(file) => file,
            None => {
                ctx.reset_response();
                ctx.set_status(404);
                return;
            }
        };
        let body = match tokio::fs::read(&file).await {
            Ok(body) => body,
            Err(err) => {
                self.logger
                    .printf(&format!("fs: failed to read {:?}: {}", file, err));
                ctx.reset_response();
                ctx.set_status(if err.kind() == std::io::ErrorKind::PermissionDenied {
                    403
                } else {
                    404
                });
                return;
            }
        };

        ctx.reset_response();
        ctx.set_status(200);
        let mime = mime_guess::from_path(&file).first_or_octet_stream();
        if let Ok(value) = HeaderValue::from_str(mime.essence_str()) {
            ctx.response.headers_mut().insert(CONTENT_TYPE, value);
        }
        if self.compress && Self::accepts_gzip(ctx) && !body.is_empty() {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            if encoder.write_all(&body).is_ok() {
                if let Ok(compressed) = encoder.finish() {
                    ctx.response
                        .headers_mut()
                        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                    ctx.set_body(compressed);
                    return;
                }
            }
        }
        ctx.set_body(body);
    }
}

pub fn new_fs_handler(cfg: &Value, logger: &Logger) -> FasthttpdResult<Arc<dyn Handler>> {
    Ok(Arc::new(FsHandler::new(cfg, logger.clone())?))
}
