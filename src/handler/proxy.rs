use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::{HeaderValue, CONNECTION, HOST};
use hyper::{Body, Client, Request, Uri};
use serde_yaml::Value;
use std::sync::Arc;

use super::Handler;
use crate::context::RequestCtx;
use crate::error::{FasthttpdError, FasthttpdResult};
use crate::logger::Logger;

pub(super) type UpstreamClient = Client<hyper_rustls::HttpsConnector<HttpConnector>>;

/// A pooled client shared by the proxying handlers of one host.
pub(super) fn upstream_client() -> UpstreamClient {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder().build(https)
}

fn join_paths(base: &str, request: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        request.to_string()
    } else {
        format!("{}{}", base, request)
    }
}

/// Forwards the request on `ctx` to `upstream`, replacing the context's
/// response with the upstream response.
pub(super) async fn forward(
    client: &UpstreamClient,
    upstream: &Uri,
    ctx: &mut RequestCtx,
) -> FasthttpdResult<()> {
    let request_pq = ctx
        .request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = Uri::builder()
        .scheme(upstream.scheme_str().unwrap_or("http"))
        .authority(
            upstream
                .authority()
                .ok_or_else(|| FasthttpdError::handler("upstream URL has no authority"))?
                .as_str(),
        )
        .path_and_query(join_paths(upstream.path(), request_pq))
        .build()?;

    let body = std::mem::replace(ctx.request.body_mut(), Body::empty());
    let mut builder = Request::builder()
        .method(ctx.request.method().clone())
        .uri(target);
    for (name, value) in ctx.request.headers() {
        if name == HOST || name == CONNECTION {
            continue;
        }
        builder = builder.header(name, value);
    }
    let forwarded = match ctx
        .request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{}, {}", prior, ctx.remote_addr.ip()),
        None => ctx.remote_addr.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        builder = builder.header("x-forwarded-for", value);
    }
    let request = builder.body(body)?;

    ctx.response = client.request(request).await?;
    ctx.status_reason = None;
    Ok(())
}

/// Proxies every request to a single backend URL.
#[derive(Debug)]
pub struct ProxyHandler {
    upstream: Uri,
    client: UpstreamClient,
    logger: Logger,
}

impl ProxyHandler {
    pub fn new(cfg: &Value, logger: Logger) -> FasthttpdResult<Self> {
        let url = cfg
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if url.is_empty() {
            return Err(FasthttpdError::handler(
                "failed to create proxy: require 'url' entry",
            ));
        }
        let upstream: Uri = url.parse()?;
        Ok(Self {
            upstream,
            client: upstream_client(),
            logger,
        })
    }
}

#[async_trait]
impl Handler for ProxyHandler {
    async fn handle(&self, ctx: &mut RequestCtx) {
        if let Err(err) = forward(&self.client, &self.upstream, ctx).await {
            self.logger
                .printf(&format!("proxy: upstream {} failed: {}", self.upstream, err));
            ctx.reset_response();
            ctx.set_status(502);
        }
    }
}

pub fn new_proxy_handler(cfg: &Value, logger: &Logger) -> FasthttpdResult<Arc<dyn Handler>> {
    Ok(Arc::new(ProxyHandler::new(cfg, logger.clone())?))
}
