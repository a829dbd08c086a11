//! NCSA/Apache-style access logging.
//!
//! The format string is compiled once into a sequence of append functions;
//! `collect` runs before routing to capture pre-rewrite state and `log`
//! builds the line into a pooled buffer, dispatching the write to a
//! background task so request latency is not gated on log I/O.

use chrono::{DateTime, Local, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write as _;
use std::sync::Arc;

use crate::cache::{cache_key_str, ExpireCache};
use crate::config::Config;
use crate::context::RequestCtx;
use crate::error::FasthttpdResult;
use crate::logger::rotator::{shared_rotator, Rotator};
use crate::logger::strftime::Strftime;
use crate::pool::Pool;

pub const FORMAT_COMMON: &str = r#"%h %l %u %t "%r" %>s %b"#;
pub const FORMAT_COMBINED: &str = r#"%h %l %u %t "%r" %>s %b "%{Referer}i" "%{User-agent}i""#;

static LINE_POOL: Pool<Vec<u8>> = Pool::new();

type AppendFn = Box<dyn Fn(&mut Vec<u8>, &RequestCtx) + Send + Sync>;

/// An access log bound to one virtual host.
pub struct AccessLog {
    out: Option<Arc<dyn Rotator>>,
    append_fns: Vec<AppendFn>,
    collect_request_uri: bool,
}

static FORMAT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(%(>|\{(.+?)\})?([a-zA-Z%])|([^%]+))").expect("static pattern"));

impl AccessLog {
    /// Creates the access log for `cfg`. An empty output disables logging
    /// entirely.
    pub fn new(cfg: &Config) -> FasthttpdResult<Self> {
        if cfg.access_log.output.is_empty() {
            return Ok(Self::nil());
        }
        let out = shared_rotator(&cfg.access_log.output, &cfg.access_log.rotation)?;
        let format = if cfg.access_log.format.is_empty() {
            FORMAT_COMMON
        } else {
            &cfg.access_log.format
        };

        let mut append_fns: Vec<AppendFn> = Vec::new();
        let mut collect_request_uri = false;
        let port_cache: ExpireCache<Arc<Vec<u8>>> = ExpireCache::new(0);

        for caps in FORMAT_PATTERN.captures_iter(format) {
            let directive = caps.get(4).map(|m| m.as_str()).unwrap_or("");
            let arg = caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default();
            match directive {
                "" => {
                    let literal = caps[0].as_bytes().to_vec();
                    append_fns.push(Box::new(move |dst, _| dst.extend_from_slice(&literal)));
                }
                "C" => append_fns.push(append_cookie(arg)),
                "e" => append_fns.push(append_env(arg)),
                "i" => append_fns.push(append_request_header(arg)),
                "o" => append_fns.push(append_response_header(arg)),
                "p" => {
                    let remote = arg == "remote";
                    let cache = port_cache.clone();
                    append_fns.push(Box::new(move |dst, ctx| {
                        let addr = if remote {
                            ctx.remote_addr
                        } else {
                            ctx.local_addr
                        };
                        append_port(dst, &cache, addr);
                    }));
                }
                "t" if !arg.is_empty() => {
                    let strftime = Strftime::new(&arg);
                    append_fns.push(Box::new(move |dst, ctx| {
                        let mut s = String::new();
                        strftime.append(&mut s, &ctx.started());
                        dst.extend_from_slice(s.as_bytes());
                    }));
                }
                "v" => {
                    if cfg.host.is_empty() {
                        append_fns.push(Box::new(|dst, _| dst.push(b'-')));
                    } else {
                        let host = cfg.host.clone().into_bytes();
                        append_fns.push(Box::new(move |dst, _| dst.extend_from_slice(&host)));
                    }
                }
                "V" => {
                    let canonical = hostname::get()?.to_string_lossy().into_owned().into_bytes();
                    append_fns.push(Box::new(move |dst, _| dst.extend_from_slice(&canonical)));
                }
                _ => {
                    if directive == "r" {
                        collect_request_uri = true;
                    }
                    match directive_fn(directive) {
                        Some(f) => append_fns.push(f),
                        None => {
                            let literal = format!("%{}", directive).into_bytes();
                            append_fns
                                .push(Box::new(move |dst, _| dst.extend_from_slice(&literal)));
                        }
                    }
                }
            }
        }

        Ok(Self {
            out: Some(out),
            append_fns,
            collect_request_uri,
        })
    }

    /// An access log that does nothing.
    pub fn nil() -> Self {
        Self {
            out: None,
            append_fns: Vec::new(),
            collect_request_uri: false,
        }
    }

    /// Captures pre-routing state on the context; called before the route
    /// table may rewrite the request URI.
    pub fn collect(&self, ctx: &mut RequestCtx) {
        if self.collect_request_uri {
            ctx.original_request_uri = Some(ctx.request_uri());
        }
    }

    /// Builds the line and hands the write to a background task. Each
    /// record is a single line-terminated write.
    pub fn log(&self, ctx: &RequestCtx) {
        let out = match &self.out {
            Some(out) => Arc::clone(out),
            None => return,
        };
        let mut buf = LINE_POOL.acquire();
        for f in &self.append_fns {
            f(&mut buf, ctx);
        }
        buf.push(b'\n');
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = out.write(&buf);
                    LINE_POOL.release(buf);
                });
            }
            Err(_) => {
                let _ = out.write(&buf);
                LINE_POOL.release(buf);
            }
        }
    }

    #[cfg(test)]
    fn render(&self, ctx: &RequestCtx) -> Vec<u8> {
        let mut buf = Vec::new();
        for f in &self.append_fns {
            f(&mut buf, ctx);
        }
        buf
    }
}

fn append_nil(dst: &mut Vec<u8>) {
    dst.push(b'-');
}

/// Looks up the port for `addr` through the cache so repeated addresses
/// are not re-parsed.
fn append_port(dst: &mut Vec<u8>, cache: &ExpireCache<Arc<Vec<u8>>>, addr: std::net::SocketAddr) {
    let addr_str = addr.to_string();
    let key = cache_key_str(&addr_str);
    let port = match cache.get(key) {
        Some(port) => port,
        None => {
            let port = if addr.port() == 0 {
                Arc::new(Vec::new())
            } else {
                Arc::new(addr.port().to_string().into_bytes())
            };
            cache.set(key, Arc::clone(&port));
            port
        }
    };
    if port.is_empty() {
        append_nil(dst);
    } else {
        dst.extend_from_slice(&port);
    }
}

fn append_cookie(name: String) -> AppendFn {
    Box::new(move |dst, ctx| {
        let cookie = ctx
            .request
            .headers()
            .get(hyper::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| {
                raw.split(';')
                    .map(str::trim)
                    .find_map(|pair| pair.strip_prefix(&format!("{}=", name)).map(str::to_string))
            });
        match cookie {
            Some(v) if !v.is_empty() => dst.extend_from_slice(v.as_bytes()),
            _ => append_nil(dst),
        }
    })
}

fn append_env(name: String) -> AppendFn {
    Box::new(move |dst, _| match std::env::var(&name) {
        Ok(v) => dst.extend_from_slice(v.as_bytes()),
        Err(_) => append_nil(dst),
    })
}

fn append_request_header(name: String) -> AppendFn {
    Box::new(move |dst, ctx| match ctx.request.headers().get(&name) {
        Some(v) if !v.is_empty() => dst.extend_from_slice(v.as_bytes()),
        _ => append_nil(dst),
    })
}

fn append_response_header(name: String) -> AppendFn {
    Box::new(move |dst, ctx| match ctx.response.headers().get(&name) {
        Some(v) if !v.is_empty() => dst.extend_from_slice(v.as_bytes()),
        _ => append_nil(dst),
    })
}

const NCSA_MONTHS: &[u8; 36] = b"JanFebMarAprMayJunJulAugSepOctNovDec";

/// Appends the NCSA common date `[dd/MMM/yyyy:HH:MM:SS +zzzz]` (28 bytes).
fn append_ncsa_date(dst: &mut Vec<u8>, date: &DateTime<Local>) {
    use chrono::{Datelike, Offset};
    let m = (date.month0() as usize) * 3;
    let mut off = date.offset().fix().local_minus_utc();
    let sign = if off < 0 {
        off = -off;
        b'-'
    } else {
        b'+'
    };
    let _ = write!(
        dst,
        "[{:02}/{}/{:04}:{:02}:{:02}:{:02} {}{:02}{:02}]",
        date.day(),
        std::str::from_utf8(&NCSA_MONTHS[m..m + 3]).expect("static months"),
        date.year(),
        date.hour(),
        date.minute(),
        date.second(),
        sign as char,
        off / 3600,
        (off % 3600) / 60,
    );
}

/// Appends the request line with `"` and `\` escaped in the URI.
fn append_ncsa_request(dst: &mut Vec<u8>, method: &[u8], uri: &[u8], protocol: &[u8]) {
    dst.extend_from_slice(method);
    dst.push(b' ');
    for &b in uri {
        if b == b'"' || b == b'\\' {
            dst.push(b'\\');
        }
        dst.push(b);
    }
    dst.push(b' ');
    dst.extend_from_slice(protocol);
}

/// The canonical mod_log_config directive set.
fn directive_fn(directive: &str) -> Option<AppendFn> {
    let f: AppendFn = match directive {
        "%" => Box::new(|dst, _| dst.push(b'%')),
        // Client address of the request.
        "a" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.remote_addr);
        }),
        // Local address of the connection.
        "A" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.local_addr);
        }),
        // Response body size; %b is CLF (`-` instead of 0).
        "B" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.response_content_length());
        }),
        "b" => Box::new(|dst, ctx| {
            let n = ctx.response_content_length();
            if n > 0 {
                let _ = write!(dst, "{}", n);
            } else {
                append_nil(dst);
            }
        }),
        // Time taken to serve the request, in microseconds.
        "D" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.elapsed().as_micros());
        }),
        "f" => Box::new(|dst, ctx| dst.extend_from_slice(ctx.path().as_bytes())),
        "h" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.remote_addr.ip());
        }),
        "H" => Box::new(|dst, ctx| dst.extend_from_slice(ctx.protocol().as_bytes())),
        // Keepalive requests handled on this connection.
        "k" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.conn_request_num);
        }),
        "l" => Box::new(|dst, _| append_nil(dst)),
        "L" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.request_id);
        }),
        "m" => Box::new(|dst, ctx| dst.extend_from_slice(ctx.method_bytes())),
        "P" => Box::new(|dst, _| {
            let _ = write!(dst, "{}", std::process::id());
        }),
        // `?` + query string, or `-` when empty.
        "q" => Box::new(|dst, ctx| {
            let q = ctx.query();
            if q.is_empty() {
                append_nil(dst);
            } else {
                dst.push(b'?');
                dst.extend_from_slice(q.as_bytes());
            }
        }),
        "r" => Box::new(|dst, ctx| {
            let uri = ctx
                .original_request_uri
                .clone()
                .unwrap_or_else(|| ctx.request_uri());
            append_ncsa_request(
                dst,
                ctx.method_bytes(),
                uri.as_bytes(),
                ctx.protocol().as_bytes(),
            );
        }),
        "R" => Box::new(|dst, _| append_nil(dst)),
        "s" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.status());
        }),
        "t" => Box::new(|dst, ctx| append_ncsa_date(dst, &ctx.started())),
        "T" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.elapsed().as_secs());
        }),
        "u" => Box::new(|dst, ctx| match &ctx.username {
            Some(u) if !u.is_empty() => dst.extend_from_slice(u.as_bytes()),
            _ => append_nil(dst),
        }),
        "U" => Box::new(|dst, ctx| dst.extend_from_slice(ctx.path().as_bytes())),
        // `+` when the connection may be kept alive after the response.
        "X" => Box::new(|dst, ctx| {
            dst.push(if ctx.keep_alive() { b'+' } else { b'-' });
        }),
        "I" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.request_bytes());
        }),
        "O" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.response_bytes());
        }),
        "S" => Box::new(|dst, ctx| {
            let _ = write!(dst, "{}", ctx.request_bytes() + ctx.response_bytes());
        }),
        _ => return None,
    };
    Some(f)
}
