//! Request handlers and the per-host dispatch core.
//!
//! Handler kinds are looked up by their `type` string in a process-wide
//! factory registry. A [`HostHandler`] ties one virtual host's route
//! table, filters, handlers, error pages and log sinks together; a
//! [`VirtualHandler`] demultiplexes several hosts behind one listener.

pub mod balancer;
pub mod content;
pub mod error_pages;
pub mod fs;
pub mod proxy;

use async_trait::async_trait;
use futures::FutureExt;
use once_cell::sync::Lazy;
use serde_yaml::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::context::RequestCtx;
use crate::error::{FasthttpdError, FasthttpdResult};
use crate::filter::{new_filter, Filter};
use crate::logger::accesslog::AccessLog;
use crate::logger::Logger;
use crate::route::{release_result, Routes};

pub use error_pages::{send_default_error, ErrorPages};

/// A named terminal responder.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut RequestCtx);
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Handler").finish()
    }
}

/// A factory producing a handler from its configuration map and the
/// host's logger.
pub type NewHandlerFn = fn(&Value, &Logger) -> FasthttpdResult<Arc<dyn Handler>>;

static HANDLER_TYPES: Lazy<RwLock<HashMap<String, NewHandlerFn>>> = Lazy::new(|| {
    let mut m: HashMap<String, NewHandlerFn> = HashMap::new();
    m.insert("fs".to_string(), fs::new_fs_handler);
    m.insert("content".to_string(), content::new_content_handler);
    m.insert("proxy".to_string(), proxy::new_proxy_handler);
    m.insert("balancer".to_string(), balancer::new_balancer_handler);
    m.insert(
        "errorPages".to_string(),
        error_pages::new_error_pages_handler,
    );
    RwLock::new(m)
});

/// Installs a handler factory under `handler_type`, replacing any previous
/// registration.
pub fn register_handler_type(handler_type: &str, f: NewHandlerFn) {
    HANDLER_TYPES
        .write()
        .expect("handler registry poisoned")
        .insert(handler_type.to_string(), f);
}

/// Removes the factory registered under `handler_type`.
pub fn unregister_handler_type(handler_type: &str) {
    HANDLER_TYPES
        .write()
        .expect("handler registry poisoned")
        .remove(handler_type);
}

/// Creates a handler from a configuration map with a `type` entry.
pub fn new_handler(cfg: &Value, logger: &Logger) -> FasthttpdResult<Arc<dyn Handler>> {
    let t = cfg
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let factory = HANDLER_TYPES
        .read()
        .expect("handler registry poisoned")
        .get(&t)
        .copied();
    match factory {
        Some(f) => f(cfg, logger),
        None => Err(FasthttpdError::handler(format!(
            "unknown handler type: {}",
            t
        ))),
    }
}

/// Errors surfaced by the HTTP engine, mapped onto response statuses by
/// [`HostHandler::handle_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// The request header exceeded the engine's buffer.
    HeaderTooLarge,
    /// A read or write timeout fired.
    Timeout,
    /// Any other request-level engine error.
    BadRequest,
}

/// The routing core of one virtual host.
pub struct HostHandler {
    pub cfg: Config,
    host: String,
    logger: Logger,
    access_log: AccessLog,
    error_pages: ErrorPages,
    filters: HashMap<String, Arc<dyn Filter>>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    routes: Routes,
}

impl HostHandler {
    pub fn new(cfg: Config) -> FasthttpdResult<Self> {
        let logger = Logger::new(&cfg.log)?;
        let access_log = AccessLog::new(&cfg)?;
        let error_pages = ErrorPages::new(&cfg.root, &cfg.error_pages, logger.clone())?;

        let mut filters: HashMap<String, Arc<dyn Filter>> = HashMap::new();
        for (name, filter_cfg) in &cfg.filters {
            filters.insert(name.clone(), new_filter(filter_cfg)?);
        }

        let mut handlers: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        for (name, handler_cfg) in &cfg.handlers {
            let mut handler_cfg = handler_cfg.clone();
            inject_root(&mut handler_cfg, &cfg.root);
            handlers.insert(name.clone(), new_handler(&handler_cfg, &logger)?);
        }

        let routes = Routes::new(&cfg)?;
        Ok(Self {
            host: cfg.host.clone(),
            cfg,
            logger,
            access_log,
            error_pages,
            filters,
            handlers,
            routes,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Handles one request end to end: collect, route, rewrite, filters,
    /// handler or status or redirect, error pages, response filters, log.
    pub async fn handle(&self, ctx: &mut RequestCtx) {
        self.access_log.collect(ctx);
        self.dispatch(ctx).await;
        self.access_log.log(ctx);
    }

    async fn dispatch(&self, ctx: &mut RequestCtx) {
        let mut off = 0usize;
        let mut ran_filters: Vec<String> = Vec::new();
        loop {
            let method = ctx.method_bytes().to_vec();
            let path = ctx.path().as_bytes().to_vec();
            let result = self.routes.cached_route(&method, &path, off);

            let rewrite = result.rewrite_uri_with_query_string(ctx.query().as_bytes());
            if !rewrite.is_empty() {
                ctx.set_request_uri(&rewrite);
            }

            for name in &result.filters {
                if ran_filters.iter().any(|f| f == name) {
                    continue;
                }
                ran_filters.push(name.clone());
                let filter = match self.filters.get(name) {
                    Some(filter) => Arc::clone(filter),
                    None => continue,
                };
                if !filter.request(ctx) {
                    self.error_pages.handle(ctx).await;
                    release_result(result);
                    return;
                }
            }

            let redirect = result.redirect_uri_with_query_string(ctx.query().as_bytes());
            if !redirect.is_empty() {
                ctx.redirect(&redirect, result.status_code);
                release_result(result);
                return;
            }

            if result.status_code > 0 {
                ctx.reset_response();
                ctx.set_status(result.status_code);
                if !result.status_message.is_empty() {
                    ctx.status_reason = Some(result.status_message.clone());
                }
            } else if !result.handler.is_empty() {
                if let Some(handler) = self.handlers.get(&result.handler) {
                    let handler = Arc::clone(handler);
                    if AssertUnwindSafe(handler.handle(ctx))
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        self.logger.printf(&format!(
                            "panic in handler {:?} on {}",
                            result.handler,
                            ctx.path()
                        ));
                        ctx.reset_response();
                        ctx.set_status(500);
                    }
                }
                let index = off + result.route_index;
                if ctx.status() == 404 && self.routes.is_next_if_not_found(index) {
                    off = index + 1;
                    release_result(result);
                    ctx.reset_response();
                    continue;
                }
            } else {
                ctx.reset_response();
                ctx.set_status(404);
            }

            self.error_pages.handle(ctx).await;
            for name in &result.filters {
                let filter = match self.filters.get(name) {
                    Some(filter) => Arc::clone(filter),
                    None => continue,
                };
                if !filter.response(ctx) {
                    break;
                }
            }
            release_result(result);
            return;
        }
    }

    /// Maps an engine-level request error onto a status and hands it to
    /// the error-pages layer.
    pub async fn handle_error(&self, ctx: &mut RequestCtx, err: EngineError) {
        ctx.reset_response();
        ctx.set_status(match err {
            EngineError::HeaderTooLarge => 431,
            EngineError::Timeout => 408,
            EngineError::BadRequest => 400,
        });
        self.error_pages.handle(ctx).await;
    }
}

fn inject_root(handler_cfg: &mut Value, root: &str) {
    if root.is_empty() {
        return;
    }
    if let Value::Mapping(m) = handler_cfg {
        let key = Value::String("root".to_string());
        let missing = m
            .get(&key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .is_empty();
        if missing {
            m.insert(key, Value::String(root.to_string()));
        }
    }
}

/// An ordered set of per-host routing cores behind one listener; the Host
/// header selects the core, the first is the fallback.
pub struct VirtualHandler {
    handlers: Vec<Arc<HostHandler>>,
    loggers: Vec<Logger>,
}

impl VirtualHandler {
    pub fn new(cfgs: Vec<Config>) -> FasthttpdResult<Self> {
        if cfgs.is_empty() {
            return Err(FasthttpdError::config("no configuration documents"));
        }
        let mut handlers = Vec::with_capacity(cfgs.len());
        let mut outputs: Vec<String> = Vec::new();
        let mut loggers = Vec::new();
        for cfg in cfgs {
            let output = cfg.log.output.clone();
            let handler = HostHandler::new(cfg)?;
            if !outputs.contains(&output) {
                outputs.push(output);
                loggers.push(handler.logger().clone());
            }
            handlers.push(Arc::new(handler));
        }
        Ok(Self { handlers, loggers })
    }

    /// The configuration driving engine-level options for this listener.
    pub fn server_config(&self) -> &Config {
        &self.handlers[0].cfg
    }

    /// Writes to every distinct host log.
    pub fn printf(&self, msg: &str) {
        for logger in &self.loggers {
            logger.printf(msg);
        }
    }

    fn select(&self, host: &str) -> &Arc<HostHandler> {
        if self.handlers.len() > 1 {
            for handler in &self.handlers {
                if handler.host().eq_ignore_ascii_case(host) {
                    return handler;
                }
            }
        }
        &self.handlers[0]
    }

    pub async fn handle(&self, ctx: &mut RequestCtx) {
        let host = ctx.host().to_string();
        self.select(&host).handle(ctx).await;
    }

    pub async fn handle_error(&self, ctx: &mut RequestCtx, err: EngineError) {
        let host = ctx.host().to_string();
        self.select(&host).handle_error(ctx, err).await;
    }
}
