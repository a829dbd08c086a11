//! Configuration loading for fasthttpd.
//!
//! A configuration file is a multi-document YAML stream; each document
//! describes one virtual host. Documents that share a `listen` address are
//! bundled behind a single listener and demultiplexed by the Host header.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{FasthttpdError, FasthttpdResult};

/// Default values.
pub const DEFAULT_LISTEN: &str = ":8080";
pub const DEFAULT_SERVER_NAME: &str = "fasthttpd";

/// Supported `routes[].match` values.
pub const MATCH_PREFIX: &str = "prefix";
pub const MATCH_EQUAL: &str = "equal";
pub const MATCH_REGEXP: &str = "regexp";

/// `server` keys holding duration strings that are normalized to an
/// integer nanosecond count at load time.
const SERVER_DURATION_NAMES: &[&str] = &[
    "readTimeout",
    "writeTimeout",
    "idleTimeout",
    "maxKeepaliveDuration",
    "maxIdleWorkerDuration",
    "tcpKeepalivePeriod",
    "sleepWhenConcurrencyLimitsExceeded",
];

/// Configuration root of one virtual host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub host: String,
    pub listen: String,
    pub ssl: Ssl,
    pub root: String,
    /// Passthrough tuning map handed to the HTTP engine (timeouts, buffer
    /// sizes, server name).
    pub server: Mapping,
    pub log: Log,
    pub access_log: AccessLog,
    /// Maps a status text (wildcards allowed, eg. `40x`) to an error page path.
    pub error_pages: HashMap<String, String>,
    pub filters: HashMap<String, Value>,
    pub handlers: HashMap<String, Value>,
    pub routes: Vec<RouteConfig>,
    pub routes_cache: RoutesCache,
}

impl Default for Config {
    fn default() -> Self {
        let mut server = Mapping::new();
        server.insert(
            Value::String("name".into()),
            Value::String(DEFAULT_SERVER_NAME.into()),
        );
        Self {
            host: String::new(),
            listen: DEFAULT_LISTEN.to_string(),
            ssl: Ssl::default(),
            root: String::new(),
            server,
            log: Log::default(),
            access_log: AccessLog::default(),
            error_pages: HashMap::new(),
            filters: HashMap::new(),
            handlers: HashMap::new(),
            routes: Vec::new(),
            routes_cache: RoutesCache::default(),
        }
    }
}

impl Config {
    /// Normalizes values: duration strings in `server` become nanosecond
    /// numbers, the SSL section resolves its defaults.
    pub fn normalize(mut self) -> FasthttpdResult<Self> {
        for name in SERVER_DURATION_NAMES {
            let key = Value::String((*name).to_string());
            if let Some(Value::String(s)) = self.server.get(&key) {
                let nanos = parse_duration_nanos(s)?;
                self.server.insert(key, Value::Number(nanos.into()));
            }
        }
        self.ssl = self.ssl.normalize()?;
        Ok(self)
    }

    /// Returns a `server` entry interpreted as a nanosecond count.
    pub fn server_nanos(&self, name: &str) -> Option<i64> {
        self.server.get(name).and_then(Value::as_i64)
    }

    /// Returns a `server` entry interpreted as a string.
    pub fn server_str(&self, name: &str) -> Option<&str> {
        self.server.get(name).and_then(Value::as_str)
    }

    /// Returns a `server` entry interpreted as an integer.
    pub fn server_int(&self, name: &str) -> Option<i64> {
        self.server.get(name).and_then(Value::as_i64)
    }

    /// Returns a `server` entry interpreted as a bool.
    pub fn server_bool(&self, name: &str) -> Option<bool> {
        self.server.get(name).and_then(Value::as_bool)
    }
}

/// SSL section. If `auto_cert` is set, `cert_file`/`key_file` are ignored
/// and key-pairs are served from the auto-cert cache directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Ssl {
    pub cert_file: String,
    pub key_file: String,
    pub auto_cert: bool,
    pub auto_cert_cache_dir: String,
}

impl Ssl {
    pub fn normalize(mut self) -> FasthttpdResult<Self> {
        if self.auto_cert && self.auto_cert_cache_dir.is_empty() {
            self.auto_cert_cache_dir = default_cert_cache_dir()?
                .to_string_lossy()
                .into_owned();
        }
        Ok(self)
    }

    pub fn is_configured(&self) -> bool {
        self.auto_cert || (!self.cert_file.is_empty() && !self.key_file.is_empty())
    }
}

fn default_cert_cache_dir() -> FasthttpdResult<PathBuf> {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
        .ok_or_else(|| FasthttpdError::config("cannot resolve user cache directory"))?;
    Ok(base.join("fasthttpd").join("cert"))
}

/// Log rotation sub-block shared by `log` and `accessLog`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Rotation {
    /// Megabytes before the current file is rotated out.
    pub max_size: u64,
    pub max_backups: usize,
    /// Days a rotated backup is kept.
    pub max_age: i64,
    pub compress: bool,
    pub local_time: bool,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_backups: 14,
            max_age: 28,
            compress: true,
            local_time: true,
        }
    }
}

/// Error-log section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Log {
    /// `stdout`, `stderr` or a file path. Empty discards.
    pub output: String,
    pub prefix: String,
    /// Subset of `date`, `time`, `microsecond`, `utc`, `msgprefix`.
    pub flags: Vec<String>,
    pub rotation: Rotation,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            output: String::new(),
            prefix: String::new(),
            flags: vec!["date".to_string(), "time".to_string()],
            rotation: Rotation::default(),
        }
    }
}

/// Access-log section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccessLog {
    pub output: String,
    /// Percent-directive format string; empty means the common log format.
    pub format: String,
    pub rotation: Rotation,
}

/// One entry of the ordered route table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteConfig {
    pub path: String,
    /// `prefix` (default), `equal` or `regexp`.
    #[serde(rename = "match")]
    pub match_mode: String,
    pub methods: Vec<String>,
    pub filters: Vec<String>,
    pub rewrite: String,
    pub rewrite_append_query_string: bool,
    pub handler: String,
    pub status: u16,
    pub status_message: String,
    pub next_if_not_found: bool,
}

/// Route cache section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutesCache {
    pub enable: bool,
    /// Entry expiry in milliseconds.
    pub expire: i64,
    /// Sweep interval in milliseconds.
    pub interval: i64,
}

/// Decodes `path` as a multi-document Config YAML file.
pub fn unmarshal_yaml_path<P: AsRef<Path>>(path: P) -> FasthttpdResult<Vec<Config>> {
    let data = std::fs::read_to_string(path.as_ref())?;
    unmarshal_yaml(&data)
}

/// Decodes `data` as multiple Config YAML documents.
pub fn unmarshal_yaml(data: &str) -> FasthttpdResult<Vec<Config>> {
    let mut cfgs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let cfg = Config::deserialize(document)?;
        cfgs.push(cfg.normalize()?);
    }
    Ok(cfgs)
}

/// The configuration used when no file is given: a static file server on
/// `./public` logging to stderr.
pub fn minimal_config() -> Config {
    let mut fs_handler = Mapping::new();
    fs_handler.insert(Value::String("type".into()), Value::String("fs".into()));
    fs_handler.insert(
        Value::String("indexNames".into()),
        Value::Sequence(vec![Value::String("index.html".into())]),
    );
    Config {
        host: "localhost".to_string(),
        root: "./public".to_string(),
        log: Log {
            output: "stderr".to_string(),
            ..Log::default()
        },
        handlers: HashMap::from([("static".to_string(), Value::Mapping(fs_handler))]),
        routes: vec![RouteConfig {
            handler: "static".to_string(),
            ..RouteConfig::default()
        }],
        ..Config::default()
    }
}

/// Applies `-e KEY=VALUE` edit expressions to every document. Keys are
/// dotted paths (array steps are numeric, eg. `routes.0.handler`); values
/// are parsed as bool or number when they look like one, strings otherwise.
pub fn apply_edit_exprs(cfgs: Vec<Config>, exprs: &[String]) -> FasthttpdResult<Vec<Config>> {
    if exprs.is_empty() {
        return Ok(cfgs);
    }
    let mut docs: Vec<Value> = cfgs
        .into_iter()
        .map(|c| serde_yaml::to_value(&c).map_err(FasthttpdError::from))
        .collect::<FasthttpdResult<_>>()?;
    for expr in exprs {
        let (path, raw) = expr
            .split_once('=')
            .ok_or_else(|| FasthttpdError::config(format!("invalid edit expression: {}", expr)))?;
        let value = parse_edit_value(raw);
        for doc in &mut docs {
            set_path(doc, path, value.clone())?;
        }
    }
    docs.into_iter()
        .map(|doc| {
            let cfg: Config = serde_yaml::from_value(doc)?;
            cfg.normalize()
        })
        .collect()
}

fn parse_edit_value(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

fn set_path(doc: &mut Value, path: &str, value: Value) -> FasthttpdResult<()> {
    let mut cursor = doc;
    let segments: Vec<&str> = path.trim_start_matches('.').split('.').collect();
    for (i, seg) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        if let Ok(index) = seg.parse::<usize>() {
            let seq = cursor.as_sequence_mut().ok_or_else(|| {
                FasthttpdError::config(format!("edit path {} is not an array at {}", path, seg))
            })?;
            if index >= seq.len() {
                return Err(FasthttpdError::config(format!(
                    "edit path {} index {} out of range",
                    path, index
                )));
            }
            if last {
                seq[index] = value;
                return Ok(());
            }
            cursor = &mut seq[index];
        } else {
            let map = cursor.as_mapping_mut().ok_or_else(|| {
                FasthttpdError::config(format!("edit path {} is not a map at {}", path, seg))
            })?;
            let key = Value::String((*seg).to_string());
            if last {
                map.insert(key, value);
                return Ok(());
            }
            if !map.contains_key(&key) {
                map.insert(key.clone(), Value::Mapping(Mapping::new()));
            }
            cursor = map.get_mut(&key).expect("key inserted above");
        }
    }
    Ok(())
}

/// Bundles configurations by their `listen` address, preserving document
/// order within each bundle.
pub fn bundle_by_listen(cfgs: Vec<Config>) -> Vec<(String, Vec<Config>)> {
    let mut order: Vec<String> = Vec::new();
    let mut bundles: HashMap<String, Vec<Config>> = HashMap::new();
    for cfg in cfgs {
        if !bundles.contains_key(&cfg.listen) {
            order.push(cfg.listen.clone());
        }
        bundles.entry(cfg.listen.clone()).or_default().push(cfg);
    }
    order
        .into_iter()
        .map(|listen| {
            let cfgs = bundles.remove(&listen).expect("bundle recorded in order");
            (listen, cfgs)
        })
        .collect()
}

/// Parses a duration string of the form `10s`, `1m30s`, `500ms`, `1h` into
/// nanoseconds.
pub fn parse_duration_nanos(s: &str) -> FasthttpdResult<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FasthttpdError::config("empty duration"));
    }
    let mut total: i64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| FasthttpdError::config(format!("missing unit in duration: {}", s)))?;
        let (num, tail) = rest.split_at(digits_end);
        let value: f64 = num
            .parse()
            .map_err(|_| FasthttpdError::config(format!("invalid duration: {}", s)))?;
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);
        let scale: f64 = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60.0 * 1_000_000_000.0,
            "h" => 3600.0 * 1_000_000_000.0,
            _ => {
                return Err(FasthttpdError::config(format!(
                    "unknown duration unit {:?} in {}",
                    unit, s
                )))
            }
        };
        total += (value * scale) as i64;
        rest = next;
    }
    Ok(total)
}
