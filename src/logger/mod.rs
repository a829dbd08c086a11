//! Per-virtual-host log sinks: the error log, the access log, and the
//! shared file rotators behind both.

pub mod accesslog;
pub mod rotator;
pub mod strftime;

use chrono::{DateTime, Local, Utc};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::config::Log;
use crate::error::{FasthttpdError, FasthttpdResult};
pub use rotator::{nil_rotator, rotate_shared, shared_rotator, Rotator};

const FLAG_DATE: u8 = 1 << 0;
const FLAG_TIME: u8 = 1 << 1;
const FLAG_MICROSECOND: u8 = 1 << 2;
const FLAG_UTC: u8 = 1 << 3;
const FLAG_MSGPREFIX: u8 = 1 << 4;

/// A line-oriented error log bound to a rotator sink.
///
/// Cheap to clone; clones share the sink.
#[derive(Clone, Debug)]
pub struct Logger {
    out: Option<Arc<dyn Rotator>>,
    prefix: String,
    flags: u8,
}

impl Logger {
    /// Creates a logger for the provided configuration. An empty output
    /// discards everything.
    pub fn new(cfg: &Log) -> FasthttpdResult<Self> {
        let mut flags = 0u8;
        for flag in &cfg.flags {
            flags |= match flag.as_str() {
                "date" => FLAG_DATE,
                "time" => FLAG_TIME,
                "microsecond" => FLAG_MICROSECOND,
                "utc" => FLAG_UTC,
                "msgprefix" => FLAG_MSGPREFIX,
                _ => {
                    return Err(FasthttpdError::config(format!("unknown flag: {}", flag)));
                }
            };
        }
        let out = if cfg.output.is_empty() {
            None
        } else {
            Some(shared_rotator(&cfg.output, &cfg.rotation)?)
        };
        Ok(Self {
            out,
            prefix: cfg.prefix.clone(),
            flags,
        })
    }

    /// A logger that discards everything.
    pub fn nil() -> Self {
        Self {
            out: None,
            prefix: String::new(),
            flags: 0,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.out.is_none()
    }

    /// Writes one formatted line. Write failures are swallowed; logging
    /// must never fail a request.
    pub fn printf(&self, msg: &str) {
        let out = match &self.out {
            Some(out) => out,
            None => return,
        };
        let mut line = String::with_capacity(self.prefix.len() + 24 + msg.len() + 1);
        if self.flags & FLAG_MSGPREFIX == 0 {
            line.push_str(&self.prefix);
        }
        self.append_timestamp(&mut line);
        if self.flags & FLAG_MSGPREFIX != 0 {
            line.push_str(&self.prefix);
        }
        line.push_str(msg);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let _ = out.write(line.as_bytes());
    }

    pub fn rotate(&self) -> FasthttpdResult<()> {
        if let Some(out) = &self.out {
            out.rotate()?;
        }
        Ok(())
    }

    fn append_timestamp(&self, line: &mut String) {
        if self.flags & (FLAG_DATE | FLAG_TIME | FLAG_MICROSECOND) == 0 {
            return;
        }
        if self.flags & FLAG_UTC != 0 {
            self.append_timestamp_parts(line, Utc::now());
        } else {
            self.append_timestamp_parts(line, Local::now());
        }
    }

    fn append_timestamp_parts<Tz: chrono::TimeZone>(&self, line: &mut String, now: DateTime<Tz>)
    where
        Tz::Offset: std::fmt::Display,
    {
        if self.flags & FLAG_DATE != 0 {
            let _ = write!(line, "{} ", now.format("%Y/%m/%d"));
        }
        if self.flags & (FLAG_TIME | FLAG_MICROSECOND) != 0 {
            if self.flags & FLAG_MICROSECOND != 0 {
                let _ = write!(line, "{} ", now.format("%H:%M:%S%.6f"));
            } else {
                let _ = write!(line, "{} ", now.format("%H:%M:%S"));
            }
        }
    }
}
