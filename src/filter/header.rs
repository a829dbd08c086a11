use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::Filter;
use crate::context::RequestCtx;
use crate::error::{FasthttpdError, FasthttpdResult};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HeaderFilterConfig {
    request: HeaderOpsConfig,
    response: HeaderOpsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HeaderOpsConfig {
    set: BTreeMap<String, String>,
    add: BTreeMap<String, String>,
    del: Vec<String>,
}

/// Mutates request and/or response headers: sets, then adds, then
/// deletions.
pub struct HeaderFilter {
    request: HeaderOps,
    response: HeaderOps,
}

struct HeaderOps {
    set: Vec<(HeaderName, HeaderValue)>,
    add: Vec<(HeaderName, HeaderValue)>,
    del: Vec<HeaderName>,
}

impl HeaderOps {
    fn new(cfg: HeaderOpsConfig) -> FasthttpdResult<Self> {
        let parse_pairs = |m: BTreeMap<String, String>| -> FasthttpdResult<Vec<(HeaderName, HeaderValue)>> {
            m.into_iter()
                .map(|(k, v)| {
                    let name = HeaderName::try_from(k.as_str()).map_err(|e| {
                        FasthttpdError::filter(format!("invalid header name {:?}: {}", k, e))
                    })?;
                    let value = HeaderValue::try_from(v.as_str()).map_err(|e| {
                        FasthttpdError::filter(format!("invalid header value {:?}: {}", v, e))
                    })?;
                    Ok((name, value))
                })
                .collect()
        };
        Ok(Self {
            set: parse_pairs(cfg.set)?,
            add: parse_pairs(cfg.add)?,
            del: cfg
                .del
                .into_iter()
                .map(|k| {
                    HeaderName::try_from(k.as_str()).map_err(|e| {
                        FasthttpdError::filter(format!("invalid header name {:?}: {}", k, e))
                    })
                })
                .collect::<FasthttpdResult<_>>()?,
        })
    }

    fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.add {
            headers.append(name.clone(), value.clone());
        }
        for name in &self.del {
            headers.remove(name);
        }
    }
}

impl HeaderFilter {
    pub fn new(cfg: &Value) -> FasthttpdResult<Self> {
        let config: HeaderFilterConfig = serde_yaml::from_value(cfg.clone())?;
        Ok(Self {
            request: HeaderOps::new(config.request)?,
            response: HeaderOps::new(config.response)?,
        })
    }
}

impl Filter for HeaderFilter {
    fn request(&self, ctx: &mut RequestCtx) -> bool {
        self.request.apply(ctx.request.headers_mut());
        true
    }

    fn response(&self, ctx: &mut RequestCtx) -> bool {
        self.response.apply(ctx.response.headers_mut());
        true
    }
}

pub fn new_header_filter(cfg: &Value) -> FasthttpdResult<Arc<dyn Filter>> {
    Ok(Arc::new(HeaderFilter::new(cfg)?))
}
