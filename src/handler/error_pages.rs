use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use serde_yaml::Value;
use std::collections::HashMap;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use super::fs::FsHandler;
use super::Handler;
use crate::context::RequestCtx;
use crate::error::FasthttpdResult;
use crate::logger::Logger;
use crate::pool::Pool;
use crate::util;

const STATUS_OFFSET: u16 = 400;
const STATUS_UNTIL: u16 = 600;

static BODY_POOL: Pool<Vec<u8>> = Pool::new();

/// Serves custom error pages for statuses in [400, 600).
///
/// The status-to-path map accepts trailing `x` wildcards (`404`, `40x`,
/// `4xx`). Resolution results are memoized per status; an empty memo entry
/// means "definitively no page".
pub struct ErrorPages {
    status_to_path: HashMap<String, String>,
    fs: Option<FsHandler>,
    error_paths: Mutex<Vec<Option<Vec<u8>>>>,
    logger: Logger,
}

impl ErrorPages {
    pub fn new(
        root: &str,
        status_to_path: &HashMap<String, String>,
        logger: Logger,
    ) -> FasthttpdResult<Self> {
        let fs = if root.is_empty() || status_to_path.is_empty() {
            None
        } else {
            let cfg: Value = serde_yaml::from_str(&format!(
                "{{root: {:?}, compress: true}}",
                root
            ))?;
            Some(FsHandler::new(&cfg, logger.clone())?)
        };
        Ok(Self {
            status_to_path: status_to_path.clone(),
            fs,
            error_paths: Mutex::new(vec![None; (STATUS_UNTIL - STATUS_OFFSET) as usize]),
            logger,
        })
    }

    /// Substitutes the response body for an error status. Non-error
    /// statuses pass through untouched.
    pub async fn handle(&self, ctx: &mut RequestCtx) {
        let status = ctx.status();
        if !(STATUS_OFFSET..STATUS_UNTIL).contains(&status) {
            return;
        }
        if self.fs.is_none() {
            send_default_error(ctx);
            return;
        }
        let path = self.resolve(status);
        if path.is_empty() {
            send_default_error(ctx);
            return;
        }
        self.send_error(ctx, &path).await;
    }

    /// Returns the memoized page path for `status`, resolving and
    /// memoizing on first use. Empty means no page.
    fn resolve(&self, status: u16) -> Vec<u8> {
        let slot = (status - STATUS_OFFSET) as usize;
        let mut memo = self.error_paths.lock().expect("error pages lock poisoned");
        if let Some(path) = &memo[slot] {
            return path.clone();
        }
        let mut text = status.to_string().into_bytes();
        for wildcards in 0..text.len() {
            if wildcards > 0 {
                let l = text.len() - wildcards;
                text[l] = b'x';
            }
            let key = std::str::from_utf8(&text).expect("status digits");
            if let Some(page) = self.status_to_path.get(key) {
                if !page.is_empty() {
                    let path = page.as_bytes().to_vec();
                    memo[slot] = Some(path.clone());
                    return path;
                }
            }
        }
        memo[slot] = Some(Vec::new());
        Vec::new()
    }

    fn mark_unavailable(&self, status: u16) {
        let slot = (status - STATUS_OFFSET) as usize;
        self.error_paths.lock().expect("error pages lock poisoned")[slot] = Some(Vec::new());
    }

    /// Runs the filesystem subhandler against the page path with the
    /// request URI swapped out, then restores the URI and the original
    /// status.
    async fn send_error(&self, ctx: &mut RequestCtx, path: &[u8]) {
        let fs = self.fs.as_ref().expect("send_error requires fs");
        let status = ctx.status();
        let reason = ctx.status_reason.take();
        let uri = ctx.request_uri();

        ctx.set_request_uri(path);
        fs.handle(ctx).await;
        let status_fs = ctx.status();

        ctx.set_request_uri(uri.as_bytes());
        ctx.set_status(status);
        ctx.status_reason = reason;

        if status_fs != 200 {
            self.mark_unavailable(status);
            self.logger.printf(&format!(
                "invalid error page status {} on {:?}",
                status_fs,
                String::from_utf8_lossy(path)
            ));
            ctx.set_body(Vec::new());
            send_default_error(ctx);
        }
    }
}

const DEFAULT_ERROR_HTMLS: [&[u8]; 3] = [
    b"<!DOCTYPE html><html><head><title>",
    b"</title><style>h1,p { text-align: center; }</style></head><body><h1>",
    b"</h1></body></html>",
];

/// Writes the built-in `<status> <statusText>` HTML template, unless the
/// response already carries a body.
pub fn send_default_error(ctx: &mut RequestCtx) {
    if ctx.response_content_length() > 0 {
        return;
    }
    let status = ctx.status();
    let reason = match &ctx.status_reason {
        Some(reason) if !reason.is_empty() => reason.clone(),
        _ => util::status_text(status).as_bytes().to_vec(),
    };

    let mut buf = BODY_POOL.acquire();
    for (i, html) in DEFAULT_ERROR_HTMLS.iter().enumerate() {
        if i > 0 {
            let _ = write!(buf, "{} ", status);
            buf.extend_from_slice(&reason);
        }
        buf.extend_from_slice(html);
    }
    ctx.response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    ctx.set_body(buf.clone());
    BODY_POOL.release(buf);
}

/// The `errorPages` handler type: applies the substitution as a terminal
/// handler using its own root and page map.
pub struct ErrorPagesHandler {
    pages: ErrorPages,
}

impl ErrorPagesHandler {
    pub fn new(cfg: &Value, logger: Logger) -> FasthttpdResult<Self> {
        let root = cfg
            .get("root")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut status_to_path = HashMap::new();
        if let Some(Value::Mapping(m)) = cfg.get("pages") {
            for (k, v) in m {
                if let (Some(k), Some(v)) = (yaml_key_string(k), v.as_str()) {
                    status_to_path.insert(k, v.to_string());
                }
            }
        }
        Ok(Self {
            pages: ErrorPages::new(&root, &status_to_path, logger)?,
        })
    }
}

fn yaml_key_string(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Handler for ErrorPagesHandler {
    async fn handle(&self, ctx: &mut RequestCtx) {
        self.pages.handle(ctx).await;
    }
}

pub fn new_error_pages_handler(cfg: &Value, logger: &Logger) -> FasthttpdResult<Arc<dyn Handler>> {
    Ok(Arc::new(ErrorPagesHandler::new(cfg, logger.clone())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_ctx;

    async fn body_string(ctx: RequestCtx) -> String {
        let body = hyper::body::to_bytes(ctx.response.into_body()).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn pages_with(
        root: &str,
        entries: &[(&str, &str)],
    ) -> ErrorPages {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ErrorPages::new(root, &map, Logger::nil()).unwrap()
    }

    #[tokio::test]
    async fn test_non_error_status_passes_through() {
        let pages = pages_with("", &[]);
        let mut ctx = test_ctx("GET", "/");
        ctx.set_status(200);
        pages.handle(&mut ctx).await;
        assert_eq!(ctx.response_content_length(), 0);
    }

    #[tokio::test]
    async fn test_default_template_exact_bytes() {
        let pages = pages_with("", &[]);
        let mut ctx = test_ctx("GET", "/");
        ctx.set_status(400);
        pages.handle(&mut ctx).await;
        assert_eq!(
            ctx.response.headers().get(CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            body_string(ctx).await,
            concat!(
                "<!DOCTYPE html><html><head><title>400 Bad Request</title>",
                "<style>h1,p { text-align: center; }</style></head>",
                "<body><h1>400 Bad Request</h1></body></html>"
            )
        );
    }

    #[tokio::test]
    async fn test_default_template_uses_custom_reason() {
        let pages = pages_with("", &[]);
        let mut ctx = test_ctx("DELETE", "/");
        ctx.set_status(405);
        ctx.status_reason = Some(b"Method not allowed".to_vec());
        pages.handle(&mut ctx).await;
        let body = body_string(ctx).await;
        assert!(body.contains("<title>405 Method not allowed</title>"));
        assert!(body.contains("<h1>405 Method not allowed</h1>"));
    }

    #[tokio::test]
    async fn test_existing_body_is_kept() {
        let pages = pages_with("", &[]);
        let mut ctx = test_ctx("GET", "/");
        ctx.set_status(403);
        ctx.set_body(b"already produced".to_vec());
        pages.handle(&mut ctx).await;
        assert_eq!(body_string(ctx).await, "already produced");
    }

    #[tokio::test]
    async fn test_exact_and_wildcard_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("err")).unwrap();
        std::fs::write(dir.path().join("err/404.html"), "custom 404").unwrap();
        std::fs::write(dir.path().join("err/5xx.html"), "custom 5xx").unwrap();

        let pages = pages_with(
            &dir.path().to_string_lossy(),
            &[("404", "/err/404.html"), ("5xx", "/err/5xx.html")],
        );

        let mut ctx = test_ctx("GET", "/missing");
        ctx.set_status(404);
        pages.handle(&mut ctx).await;
        assert_eq!(ctx.status(), 404);
        assert_eq!(body_string(ctx).await, "custom 404");

        let mut ctx = test_ctx("GET", "/upstream");
        ctx.set_status(502);
        pages.handle(&mut ctx).await;
        assert_eq!(ctx.status(), 502);
        assert_eq!(body_string(ctx).await, "custom 5xx");
    }

    #[tokio::test]
    async fn test_missing_page_memoizes_empty_and_sends_default() {
        let dir = tempfile::tempdir().unwrap();
        let pages = pages_with(
            &dir.path().to_string_lossy(),
            &[("400", "/err/400.html")],
        );

        let mut ctx = test_ctx("GET", "/bad");
        ctx.set_status(400);
        pages.handle(&mut ctx).await;
        assert_eq!(ctx.status(), 400);
        let body = body_string(ctx).await;
        assert!(body.starts_with("<!DOCTYPE html>"));
        assert!(body.contains("400 Bad Request"));

        // The failed lookup is memoized as definitively unavailable.
        assert!(pages.resolve(400).is_empty());

        // Subsequent 400s skip the filesystem and still get the default.
        let mut ctx = test_ctx("GET", "/bad2");
        ctx.set_status(400);
        pages.handle(&mut ctx).await;
        assert!(body_string(ctx).await.contains("400 Bad Request"));
    }

    #[tokio::test]
    async fn test_request_uri_restored_after_substitution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("404.html"), "gone").unwrap();
        let pages = pages_with(&dir.path().to_string_lossy(), &[("404", "/404.html")]);

        let mut ctx = test_ctx("GET", "/original?q=1");
        ctx.set_status(404);
        pages.handle(&mut ctx).await;
        assert_eq!(ctx.request_uri(), "/original?q=1");
        assert_eq!(ctx.status(), 404);
    }

    #[tokio::test]
    async fn test_error_pages_handler_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("404.html"), "typed").unwrap();
        let cfg: Value = serde_yaml::from_str(&format!(
            "{{type: errorPages, root: {:?}, pages: {{404: /404.html}}}}",
            dir.path().to_string_lossy()
        ))
        .unwrap();
        let h = ErrorPagesHandler::new(&cfg, Logger::nil()).unwrap();

        let mut ctx = test_ctx("GET", "/x");
        ctx.set_status(404);
        h.handle(&mut ctx).await;
        assert_eq!(body_string(ctx).await, "typed");
    }
}
