//! Named request/response interceptors.
//!
//! A filter exposes a pre-dispatch `request` phase and a post-dispatch
//! `response` phase; returning `false` from either short-circuits that
//! phase. Filter kinds are looked up by their `type` string in a
//! process-wide factory registry with an explicit install/remove API.

pub mod basic_auth;
pub mod header;

use once_cell::sync::Lazy;
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::RequestCtx;
use crate::error::{FasthttpdError, FasthttpdResult};

/// A named interceptor with pre-handler and post-handler phases.
pub trait Filter: Send + Sync {
    /// Runs before the handler. Returning `false` stops the request phase:
    /// the handler is skipped and control jumps to the error-page phase.
    fn request(&self, _ctx: &mut RequestCtx) -> bool {
        true
    }

    /// Runs after the handler and error pages. Returning `false` stops the
    /// response phase; the response produced so far is kept.
    fn response(&self, _ctx: &mut RequestCtx) -> bool {
        true
    }
}

impl std::fmt::Debug for dyn Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Filter").finish()
    }
}

/// A factory producing a filter from its configuration map.
pub type NewFilterFn = fn(&Value) -> FasthttpdResult<Arc<dyn Filter>>;

static FILTER_TYPES: Lazy<RwLock<HashMap<String, NewFilterFn>>> = Lazy::new(|| {
    let mut m: HashMap<String, NewFilterFn> = HashMap::new();
    m.insert("basicAuth".to_string(), basic_auth::new_basic_auth_filter);
    m.insert("header".to_string(), header::new_header_filter);
    RwLock::new(m)
});

/// Installs a filter factory under `filter_type`, replacing any previous
/// registration.
pub fn register_filter_type(filter_type: &str, f: NewFilterFn) {
    FILTER_TYPES
        .write()
        .expect("filter registry poisoned")
        .insert(filter_type.to_string(), f);
}

/// Removes the factory registered under `filter_type`.
pub fn unregister_filter_type(filter_type: &str) {
    FILTER_TYPES
        .write()
        .expect("filter registry poisoned")
        .remove(filter_type);
}

/// Creates a filter from a configuration map with a `type` entry.
pub fn new_filter(cfg: &Value) -> FasthttpdResult<Arc<dyn Filter>> {
    let t = cfg
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let factory = FILTER_TYPES
        .read()
        .expect("filter registry poisoned")
        .get(&t)
        .copied();
    match factory {
        Some(f) => f(cfg),
        None => Err(FasthttpdError::filter(format!("unknown filter type: {}", t))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopFilter;
    impl Filter for NopFilter {}

    fn new_nop(_cfg: &Value) -> FasthttpdResult<Arc<dyn Filter>> {
        Ok(Arc::new(NopFilter))
    }

    #[test]
    fn test_unknown_filter_type() {
        let cfg: Value = serde_yaml::from_str("type: bogus").unwrap();
        let err = new_filter(&cfg).unwrap_err();
        assert_eq!(err.to_string(), "Filter error: unknown filter type: bogus");
    }

    #[test]
    fn test_register_and_unregister() {
        register_filter_type("nop", new_nop);
        let cfg: Value = serde_yaml::from_str("type: nop").unwrap();
        assert!(new_filter(&cfg).is_ok());

        unregister_filter_type("nop");
        assert!(new_filter(&cfg).is_err());
    }

    #[test]
    fn test_builtins_registered() {
        let cfg: Value = serde_yaml::from_str("type: header").unwrap();
        assert!(new_filter(&cfg).is_ok());

        let cfg: Value = serde_yaml::from_str("{type: basicAuth, realm: R}").unwrap();
        assert!(new_filter(&cfg).is_ok());
    }
}
