//! The ordered route table: per-route predicates on (method, path) with
//! rewrite/redirect projection, and a read-through result cache.

pub mod result;

use regex::bytes::Regex;
use std::sync::Arc;

use crate::cache::{cache_key_bytes, ExpireCache};
use crate::config::{Config, RouteConfig, MATCH_EQUAL, MATCH_PREFIX, MATCH_REGEXP};
use crate::error::{FasthttpdError, FasthttpdResult};
use crate::util;

pub use result::{acquire_result, release_result, RouteResult};

#[derive(Debug)]
enum PathMatcher {
    Equal(Vec<u8>),
    Prefix(Vec<u8>),
    Regexp(Regex),
}

/// A route settings entry that can be matched against requested URLs.
/// Immutable after construction.
#[derive(Debug)]
pub struct Route {
    methods: Vec<Vec<u8>>,
    filters: Vec<String>,
    rewrite_uri: Vec<u8>,
    rewrite_append_query_string: bool,
    handler: String,
    status_code: u16,
    status_message: Vec<u8>,
    matcher: PathMatcher,
    next_if_not_found: bool,
}

impl Route {
    /// Creates a new Route from the provided configuration entry.
    pub fn new(rcfg: &RouteConfig) -> FasthttpdResult<Self> {
        let status_message = if !rcfg.status_message.is_empty() {
            rcfg.status_message.as_bytes().to_vec()
        } else if rcfg.status > 0 {
            util::status_text(rcfg.status).as_bytes().to_vec()
        } else {
            Vec::new()
        };
        Ok(Self {
            methods: rcfg
                .methods
                .iter()
                .map(|m| m.to_uppercase().into_bytes())
                .collect(),
            filters: rcfg.filters.clone(),
            rewrite_uri: rcfg.rewrite.as_bytes().to_vec(),
            rewrite_append_query_string: rcfg.rewrite_append_query_string,
            handler: rcfg.handler.clone(),
            status_code: rcfg.status,
            status_message,
            matcher: Self::new_matcher(&rcfg.match_mode, &rcfg.path)?,
            next_if_not_found: rcfg.next_if_not_found,
        })
    }

    fn new_matcher(cfg_match: &str, cfg_path: &str) -> FasthttpdResult<PathMatcher> {
        let mode = if cfg_match.is_empty() {
            MATCH_PREFIX
        } else {
            cfg_match
        };
        let path = if cfg_path.is_empty() { "/" } else { cfg_path };
        match mode {
            MATCH_EQUAL => Ok(PathMatcher::Equal(path.as_bytes().to_vec())),
            MATCH_PREFIX => Ok(PathMatcher::Prefix(path.as_bytes().to_vec())),
            MATCH_REGEXP => Ok(PathMatcher::Regexp(Regex::new(path)?)),
            _ => Err(FasthttpdError::route(format!("unknown match: {}", mode))),
        }
    }

    /// Matches the provided method and path.
    pub fn matches(&self, method: &[u8], path: &[u8]) -> bool {
        self.match_methods(method) && self.match_path(path)
    }

    fn match_methods(&self, method: &[u8]) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method)
    }

    fn match_path(&self, path: &[u8]) -> bool {
        match &self.matcher {
            PathMatcher::Equal(eq) => path == &eq[..],
            PathMatcher::Prefix(prefix) => path.starts_with(prefix),
            PathMatcher::Regexp(pattern) => pattern.is_match(path),
        }
    }

    /// Returns the rewrite projection of `path`: the template verbatim, or
    /// the regex substitution of `$N` capture references for a regexp route.
    fn rewrite(&self, path: &[u8]) -> Vec<u8> {
        if !self.rewrite_uri.is_empty() {
            if let PathMatcher::Regexp(pattern) = &self.matcher {
                return pattern.replace_all(path, &self.rewrite_uri[..]).into_owned();
            }
        }
        self.rewrite_uri.clone()
    }
}

type CachedResult = Arc<RouteResult>;

/// An ordered list of routes that can be matched against requested URLs,
/// with an optional read-through result cache.
pub struct Routes {
    routes: Vec<Route>,
    cache: Option<ExpireCache<CachedResult>>,
}

impl std::fmt::Debug for Routes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routes")
            .field("routes", &self.routes)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl Routes {
    /// Creates a new route table from the provided configuration,
    /// validating filter and handler references against the declared sets.
    pub fn new(cfg: &Config) -> FasthttpdResult<Self> {
        let mut routes = Vec::with_capacity(cfg.routes.len());
        for rcfg in &cfg.routes {
            for f in &rcfg.filters {
                if !cfg.filters.contains_key(f) {
                    return Err(FasthttpdError::route(format!("unknown filter: {}", f)));
                }
            }
            if !rcfg.handler.is_empty() && !cfg.handlers.contains_key(&rcfg.handler) {
                return Err(FasthttpdError::route(format!(
                    "unknown handler: {}",
                    rcfg.handler
                )));
            }
            routes.push(Route::new(rcfg)?);
        }
        let cache = if cfg.routes_cache.enable {
            let cache: ExpireCache<CachedResult> =
                ExpireCache::with_interval(cfg.routes_cache.expire, cfg.routes_cache.interval);
            cache.on_release(|_, value| {
                // The cache held the last reference in the common case;
                // recover the allocation for the pool.
                if let Ok(result) = Arc::try_unwrap(value) {
                    release_result(result);
                }
            });
            Some(cache)
        } else {
            None
        };
        Ok(Self { routes, cache })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Reports whether the route at absolute index `i` falls through to the
    /// next route when its handler signals not-found.
    pub fn is_next_if_not_found(&self, i: usize) -> bool {
        self.routes.get(i).map_or(false, |r| r.next_if_not_found)
    }

    /// Scans routes starting at `off` and returns the first terminal
    /// resolution as a pooled result. Exhaustion yields 404.
    pub fn route(&self, method: &[u8], path: &[u8], off: usize) -> RouteResult {
        let mut result = acquire_result();
        if off >= self.routes.len() {
            result.status_code = 404;
            return result;
        }
        let mut current: Vec<u8> = path.to_vec();
        for (i, r) in self.routes[off..].iter().enumerate() {
            if !r.matches(method, &current) {
                continue;
            }
            if !r.filters.is_empty() {
                util::append_unique(&mut result.filters, &r.filters);
            }
            result.route_index = i;
            result.status_code = r.status_code;
            result.status_message.clear();
            result.status_message.extend_from_slice(&r.status_message);
            result.handler.clear();
            result.handler.push_str(&r.handler);

            let rewrite_uri = r.rewrite(&current);
            if !rewrite_uri.is_empty() {
                result.append_query_string = r.rewrite_append_query_string;
                if util::is_http_or_https(&rewrite_uri)
                    || util::is_http_status_redirect(result.status_code)
                {
                    result.redirect_uri.extend_from_slice(&rewrite_uri);
                    return result;
                }
                result.rewrite_uri.clear();
                result.rewrite_uri.extend_from_slice(&rewrite_uri);
                let (p, _) = util::split_request_uri(&rewrite_uri);
                current = p.to_vec();
            }
            if result.status_code > 0 || !result.handler.is_empty() {
                return result;
            }
        }
        result.status_code = 404;
        result
    }

    /// Read-through caching wrapper around [`Routes::route`]. The cached
    /// entry stays owned by the cache; the caller always receives a pooled
    /// copy it must release.
    pub fn cached_route(&self, method: &[u8], path: &[u8], off: usize) -> RouteResult {
        let cache = match &self.cache {
            Some(cache) => cache,
            None => return self.route(method, path, off),
        };

        let off_bytes = (off as u32).to_le_bytes();
        let key = cache_key_bytes(&[&off_bytes, method, &[0], path]);

        if let Some(cached) = cache.get(key) {
            let mut copy = acquire_result();
            cached.copy_to(&mut copy);
            return copy;
        }
        let result = self.route(method, path, off);
        let mut copy = acquire_result();
        result.copy_to(&mut copy);
        cache.set(key, Arc::new(result));
        copy
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::unmarshal_yaml;

    fn route_cfg(yaml: &str) -> RouteConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_match() {
        struct Case {
            cfg: &'static str,
            method: &'static str,
            path: &'static str,
            want: bool,
        }
        let tests = [
            Case {
                cfg: "{}",
                method: "GET",
                path: "/",
                want: true,
            },
            Case {
                cfg: "{path: /, methods: [PUT, DELETE]}",
                method: "DELETE",
                path: "/",
                want: true,
            },
            Case {
                cfg: r#"{path: '.*\.(js|css|jpg|png|gif)$', methods: [GET, HEAD], match: regexp}"#,
                method: "GET",
                path: "/mg/test.png",
                want: true,
            },
            Case {
                cfg: r#"{path: '.*\.(js|css|jpg|png|gif)$', methods: [GET, HEAD], match: regexp}"#,
                method: "OPTIONS",
                path: "/img/test.png",
                want: false,
            },
            Case {
                cfg: "{path: '^/view/(.+)', match: regexp, rewrite: '/view?id=$1'}",
                method: "GET",
                path: "/view/1",
                want: true,
            },
        ];
        for (i, test) in tests.iter().enumerate() {
            let r = Route::new(&route_cfg(test.cfg)).unwrap();
            let got = r.matches(test.method.as_bytes(), test.path.as_bytes());
            assert_eq!(got, test.want, "tests[{}]", i);
        }
    }

    #[test]
    fn test_new_route_errors() {
        let err = Route::new(&route_cfg("{path: /, match: invalid-match}")).unwrap_err();
        assert_eq!(err.to_string(), "Route error: unknown match: invalid-match");

        let err = Route::new(&route_cfg("{path: '(invalid regexp', match: regexp}")).unwrap_err();
        assert!(matches!(err, FasthttpdError::Route { .. }));
    }

    #[test]
    fn test_new_routes_validates_references() {
        let cfgs = unmarshal_yaml("routes:\n  - filters: [test]\n").unwrap();
        let err = Routes::new(&cfgs[0]).unwrap_err();
        assert_eq!(err.to_string(), "Route error: unknown filter: test");

        let cfgs = unmarshal_yaml("routes:\n  - handler: test\n").unwrap();
        let err = Routes::new(&cfgs[0]).unwrap_err();
        assert_eq!(err.to_string(), "Route error: unknown handler: test");
    }

    const FULL_YAML: &str = r#"
filters:
  auth: {type: basicAuth}
  cache: {type: header}
handlers:
  static: {type: fs}
  backend: {type: proxy, url: 'http://localhost:9000'}
routes:
  - methods: [PUT, DELETE]
    status: 405
    statusMessage: Method not allowed
  - path: /
    match: equal
    handler: static
  - path: '.*\.(js|css|jpg|png|gif)$'
    match: regexp
    filters: [cache]
    handler: static
  - path: '^/view/(.+)'
    match: regexp
    rewrite: '/view?id=$1'
  - path: /redirect-external
    match: equal
    rewrite: 'http://example.com/'
    status: 302
  - path: /redirect-internal
    match: equal
    rewrite: '/internal?foo=bar'
    rewriteAppendQueryString: true
    status: 302
  - filters: [auth]
    handler: backend
routesCache:
  enable: true
"#;

    struct Want {
        status_code: u16,
        status_message: &'static [u8],
        rewrite_uri: &'static [u8],
        redirect_uri: &'static [u8],
        append_query_string: bool,
        handler: &'static str,
        filters: &'static [&'static str],
    }

    impl Want {
        fn assert_matches(&self, got: &RouteResult, i: usize) {
            assert_eq!(got.status_code, self.status_code, "tests[{}] status", i);
            assert_eq!(
                got.status_message, self.status_message,
                "tests[{}] message",
                i
            );
            assert_eq!(got.rewrite_uri, self.rewrite_uri, "tests[{}] rewrite", i);
            assert_eq!(got.redirect_uri, self.redirect_uri, "tests[{}] redirect", i);
            assert_eq!(
                got.append_query_string, self.append_query_string,
                "tests[{}] aqs",
                i
            );
            assert_eq!(got.handler, self.handler, "tests[{}] handler", i);
            assert_eq!(got.filters, self.filters, "tests[{}] filters", i);
        }
    }

    fn run_routes_cases(rs: &Routes) {
        let tests: [(&str, &str, Want); 7] = [
            (
                "DELETE",
                "/",
                Want {
                    status_code: 405,
                    status_message: b"Method not allowed",
                    rewrite_uri: b"",
                    redirect_uri: b"",
                    append_query_string: false,
                    handler: "",
                    filters: &[],
                },
            ),
            (
                "GET",
                "/",
                Want {
                    status_code: 0,
                    status_message: b"",
                    rewrite_uri: b"",
                    redirect_uri: b"",
                    append_query_string: false,
                    handler: "static",
                    filters: &[],
                },
            ),
            (
                "GET",
                "/img/test.png",
                Want {
                    status_code: 0,
                    status_message: b"",
                    rewrite_uri: b"",
                    redirect_uri: b"",
                    append_query_string: false,
                    handler: "static",
                    filters: &["cache"],
                },
            ),
            (
                "GET",
                "/view/1",
                Want {
                    status_code: 0,
                    status_message: b"",
                    rewrite_uri: b"/view?id=1",
                    redirect_uri: b"",
                    append_query_string: false,
                    handler: "backend",
                    filters: &["auth"],
                },
            ),
            (
                "GET",
                "/redirect-external",
                Want {
                    status_code: 302,
                    status_message: b"Found",
                    rewrite_uri: b"",
                    redirect_uri: b"http://example.com/",
                    append_query_string: false,
                    handler: "",
                    filters: &[],
                },
            ),
            (
                "GET",
                "/redirect-internal",
                Want {
                    status_code: 302,
                    status_message: b"Found",
                    rewrite_uri: b"",
                    redirect_uri: b"/internal?foo=bar",
                    append_query_string: true,
                    handler: "",
                    filters: &[],
                },
            ),
            (
                "GET",
                "/route/to/backend",
                Want {
                    status_code: 0,
                    status_message: b"",
                    rewrite_uri: b"",
                    redirect_uri: b"",
                    append_query_string: false,
                    handler: "backend",
                    filters: &["auth"],
                },
            ),
        ];
        for (i, (method, path, want)) in tests.iter().enumerate() {
            let got = rs.cached_route(method.as_bytes(), path.as_bytes(), 0);
            want.assert_matches(&got, i);
            release_result(got);

            // A second call answers from the cache and must agree.
            let got2 = rs.cached_route(method.as_bytes(), path.as_bytes(), 0);
            want.assert_matches(&got2, i);
            release_result(got2);
        }
    }

    #[tokio::test]
    async fn test_routes_cached_and_uncached_agree() {
        let cfgs = unmarshal_yaml(FULL_YAML).unwrap();
        let rs = Routes::new(&cfgs[0]).unwrap();
        assert!(rs.cache.is_some());
        run_routes_cases(&rs);
        assert!(rs.cache_len() > 0);

        let uncached = Routes {
            routes: rs.routes,
            cache: None,
        };
        run_routes_cases(&uncached);
    }

    #[tokio::test]
    async fn test_cache_agreement_property() {
        let cfgs = unmarshal_yaml(FULL_YAML).unwrap();
        let rs = Routes::new(&cfgs[0]).unwrap();
        for (method, path) in [
            ("GET", "/view/42"),
            ("HEAD", "/img/a.png"),
            ("POST", "/api/x"),
            ("DELETE", "/anything"),
        ] {
            for off in 0..rs.len() + 1 {
                let direct = rs.route(method.as_bytes(), path.as_bytes(), off);
                let cached = rs.cached_route(method.as_bytes(), path.as_bytes(), off);
                assert!(
                    direct.equal(&cached),
                    "divergence at {} {} off={}",
                    method,
                    path,
                    off
                );
                release_result(direct);
                release_result(cached);
            }
        }
    }

    #[test]
    fn test_route_not_found() {
        let cfgs = unmarshal_yaml("{}").unwrap();
        let rs = Routes::new(&cfgs[0]).unwrap();
        let got = rs.route(b"GET", b"/", 0);
        assert_eq!(got.status_code, 404);
        assert!(got.handler.is_empty());
        release_result(got);
    }

    #[test]
    fn test_route_offset_past_end_is_not_found() {
        let cfgs = unmarshal_yaml(FULL_YAML).unwrap();
        let rs = Routes::new(&cfgs[0]).unwrap();
        let got = rs.route(b"GET", b"/", 100);
        assert_eq!(got.status_code, 404);
        release_result(got);
    }

    #[test]
    fn test_route_offset_skips_earlier_entries() {
        let cfgs = unmarshal_yaml(FULL_YAML).unwrap();
        let rs = Routes::new(&cfgs[0]).unwrap();
        // Offset 2 skips the 405 guard and the equal match, so "/" falls
        // to the trailing catch-all.
        let got = rs.route(b"DELETE", b"/", 2);
        assert_eq!(got.status_code, 0);
        assert_eq!(got.handler, "backend");
        release_result(got);
    }

    #[test]
    fn test_next_if_not_found_flag() {
        let yaml = r#"
handlers:
  static-a: {type: fs}
  static-b: {type: fs}
routes:
  - path: '.*\.png$'
    match: regexp
    handler: static-a
    nextIfNotFound: true
  - handler: static-b
"#;
        let cfgs = unmarshal_yaml(yaml).unwrap();
        let rs = Routes::new(&cfgs[0]).unwrap();
        assert!(rs.is_next_if_not_found(0));
        assert!(!rs.is_next_if_not_found(1));
        assert!(!rs.is_next_if_not_found(99));

        let got = rs.route(b"GET", b"/img/x.png", 0);
        assert_eq!(got.handler, "static-a");
        assert_eq!(got.route_index, 0);
        release_result(got);

        let got = rs.route(b"GET", b"/img/x.png", 1);
        assert_eq!(got.handler, "static-b");
        assert_eq!(got.route_index, 0);
        release_result(got);
    }

    #[test]
    fn test_filter_dedup_across_stacked_routes() {
        let yaml = r#"
filters:
  auth: {type: basicAuth}
  headers: {type: header}
handlers:
  backend: {type: proxy}
routes:
  - path: /api
    filters: [auth, headers]
  - path: /api/v1
    filters: [headers, auth]
    handler: backend
"#;
        let cfgs = unmarshal_yaml(yaml).unwrap();
        let rs = Routes::new(&cfgs[0]).unwrap();
        let got = rs.route(b"GET", b"/api/v1/users", 0);
        assert_eq!(got.filters, vec!["auth", "headers"]);
        assert_eq!(got.handler, "backend");
        assert_eq!(got.route_index, 1);
        release_result(got);
    }

    #[test]
    fn test_rewrite_indices_strictly_increase() {
        let cfgs = unmarshal_yaml(FULL_YAML).unwrap();
        let rs = Routes::new(&cfgs[0]).unwrap();

        let first = rs.route(b"GET", b"/view/1", 0);
        assert_eq!(first.rewrite_uri, b"/view?id=1");
        let first_index = first.route_index;

        // Routing the rewritten path from the next offset lands strictly
        // deeper in the table.
        let (path, _) = util::split_request_uri(&first.rewrite_uri);
        let second = rs.route(b"GET", path, first_index + 1);
        assert!(second.route_index + first_index + 1 > first_index);
        release_result(first);
        release_result(second);
    }

    #[test]
    fn test_determinism() {
        let cfgs = unmarshal_yaml(FULL_YAML).unwrap();
        let rs = Routes::new(&cfgs[0]).unwrap();
        let a = rs.route(b"GET", b"/view/9", 0);
        let b = rs.route(b"GET", b"/view/9", 0);
        assert!(a.equal(&b));
        release_result(a);
        release_result(b);
    }
}
