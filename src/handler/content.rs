use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue};
use rand::Rng;
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::Handler;
use crate::context::RequestCtx;
use crate::error::{FasthttpdError, FasthttpdResult};
use crate::logger::Logger;

type RandomPercentage = Box<dyn Fn() -> i64 + Send + Sync>;

/// Serves an inline body with optional conditional variants. The first
/// matching condition wins; otherwise the default output is sent.
pub struct ContentHandler {
    default_output: Output,
    conditions: Vec<Condition>,
    random_percentage: RandomPercentage,
}

struct Condition {
    kind: ConditionKind,
    output: Output,
}

enum ConditionKind {
    /// Request path equals the configured path.
    PathEqual(String),
    /// Every configured key/value pair is present in the query string.
    QueryStringContains(Vec<(String, String)>),
    /// A uniform draw in [0,100) is at most the configured value.
    Percentage(i64),
}

#[derive(Default)]
struct Output {
    body: Vec<u8>,
    headers: Vec<(HeaderName, HeaderValue)>,
    status: Option<u16>,
}

impl Output {
    /// Reads `body`, `headers` and `status` from a configuration map;
    /// missing headers fall back to `default_headers`. Headers accept a
    /// map, or a list of maps or `Name: value` strings.
    fn new(cfg: &Value, fallback_headers: Option<&Value>) -> FasthttpdResult<Self> {
        let headers_cfg = match cfg.get("headers") {
            Some(h) => Some(h),
            None => fallback_headers,
        };
        let mut headers = Vec::new();
        if let Some(h) = headers_cfg {
            collect_headers(h, &mut headers)?;
        }
        Ok(Self {
            body: cfg
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .as_bytes()
                .to_vec(),
            headers,
            status: cfg
                .get("status")
                .and_then(Value::as_u64)
                .map(|s| s as u16),
        })
    }

    fn send(&self, ctx: &mut RequestCtx) {
        for (name, value) in &self.headers {
            ctx.response.headers_mut().insert(name.clone(), value.clone());
        }
        ctx.set_body(self.body.clone());
        if let Some(status) = self.status {
            ctx.set_status(status);
        }
    }
}

fn collect_headers(
    cfg: &Value,
    out: &mut Vec<(HeaderName, HeaderValue)>,
) -> FasthttpdResult<()> {
    let mut push = |k: &str, v: &str| -> FasthttpdResult<()> {
        let name = HeaderName::try_from(k)
            .map_err(|e| FasthttpdError::handler(format!("invalid header name {:?}: {}", k, e)))?;
        let value = HeaderValue::try_from(v)
            .map_err(|e| FasthttpdError::handler(format!("invalid header value {:?}: {}", v, e)))?;
        out.push((name, value));
        Ok(())
    };
    match cfg {
        Value::Mapping(m) => {
            for (k, v) in m {
                if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                    push(k, v)?;
                }
            }
        }
        Value::Sequence(seq) => {
            for item in seq {
                match item {
                    Value::String(s) => {
                        if let Some((k, v)) = s.split_once(": ") {
                            push(k, v)?;
                        }
                    }
                    Value::Mapping(m) => {
                        for (k, v) in m {
                            if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                                push(k, v)?;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_query_pairs(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

impl ContentHandler {
    pub fn new(cfg: &Value) -> FasthttpdResult<Self> {
        Self::with_random(cfg, Box::new(|| rand::thread_rng().gen_range(0..100)))
    }

    /// Constructor with an injectable percentage source for deterministic
    /// tests.
    pub fn with_random(cfg: &Value, random_percentage: RandomPercentage) -> FasthttpdResult<Self> {
        let fallback_headers = cfg.get("headers");
        let mut conditions = Vec::new();
        if let Some(Value::Sequence(seq)) = cfg.get("conditions") {
            for cond_cfg in seq {
                let kind = if let Some(path) = cond_cfg.get("path").and_then(Value::as_str) {
                    ConditionKind::PathEqual(path.to_string())
                } else if let Some(qs) = cond_cfg
                    .get("queryStringContains")
                    .and_then(Value::as_str)
                {
                    ConditionKind::QueryStringContains(parse_query_pairs(qs))
                } else if let Some(p) = cond_cfg.get("percentage").and_then(Value::as_i64) {
                    ConditionKind::Percentage(p)
                } else {
                    return Err(FasthttpdError::handler(
                        "content condition requires 'path', 'queryStringContains' or 'percentage'",
                    ));
                };
                conditions.push(Condition {
                    kind,
                    output: Output::new(cond_cfg, fallback_headers)?,
                });
            }
        }
        Ok(Self {
            default_output: Output::new(cfg, None)?,
            conditions,
            random_percentage,
        })
    }

    fn matches(&self, kind: &ConditionKind, ctx: &RequestCtx) -> bool {
        match kind {
            ConditionKind::PathEqual(path) => ctx.path() == path,
            ConditionKind::QueryStringContains(pairs) => {
                let args: HashMap<String, String> = parse_query_pairs(ctx.query())
                    .into_iter()
                    .rev()
                    .collect();
                pairs
                    .iter()
                    .all(|(k, v)| args.get(k).map(String::as_str) == Some(v.as_str()))
            }
            ConditionKind::Percentage(p) => *p > 0 && (self.random_percentage)() <= *p,
        }
    }
}

#[async_trait]
impl Handler for ContentHandler {
    async fn handle(&self, ctx: &mut RequestCtx) {
        for condition in &self.conditions {
            if self.matches(&condition.kind, ctx) {
                condition.output.send(ctx);
                return;
            }
        }
        self.default_output.send(ctx);
    }
}

pub fn new_content_handler(cfg: &Value, _logger: &Logger) -> FasthttpdResult<Arc<dyn Handler>> {
    Ok(Arc::new(ContentHandler::new(cfg)?))
}
