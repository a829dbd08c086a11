//! A strftime formatter for `%{format}t` access-log directives.
//!
//! The format is compiled once into segments; unknown conversions emit the
//! conversion character itself.

use chrono::{DateTime, TimeZone};

enum Segment {
    Literal(String),
    /// A chrono format specification for one conversion.
    Spec(&'static str),
}

/// A compiled strftime format.
pub struct Strftime {
    segments: Vec<Segment>,
}

impl Strftime {
    pub fn new(format: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = format.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            let conv = match chars.next() {
                Some(conv) => conv,
                None => break,
            };
            match spec_for(conv) {
                Conversion::Spec(spec) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Spec(spec));
                }
                Conversion::Literal(s) => literal.push_str(s),
                Conversion::Unknown => literal.push(conv),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Self { segments }
    }

    pub fn format<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        let mut out = String::new();
        self.append(&mut out, t);
        out
    }

    pub fn append<Tz: TimeZone>(&self, dst: &mut String, t: &DateTime<Tz>)
    where
        Tz::Offset: std::fmt::Display,
    {
        use std::fmt::Write as _;
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => dst.push_str(s),
                Segment::Spec(spec) => {
                    let _ = write!(dst, "{}", t.format(spec));
                }
            }
        }
    }
}

enum Conversion {
    Spec(&'static str),
    Literal(&'static str),
    Unknown,
}

fn spec_for(conv: char) -> Conversion {
    use Conversion::*;
    match conv {
        'a' => Spec("%a"),
        'A' => Spec("%A"),
        'b' | 'h' => Spec("%b"),
        'B' => Spec("%B"),
        'c' => Spec("%a %b %e %H:%M:%S %Y"),
        'C' => Spec("%C"),
        'd' => Spec("%d"),
        'D' | 'x' => Spec("%m/%d/%y"),
        'e' => Spec("%e"),
        'F' => Spec("%Y-%m-%d"),
        'g' => Spec("%g"),
        'G' => Spec("%G"),
        'H' => Spec("%H"),
        'I' => Spec("%I"),
        'j' => Spec("%j"),
        'k' => Spec("%k"),
        'l' => Spec("%l"),
        'm' => Spec("%m"),
        'M' => Spec("%M"),
        'n' => Literal("\n"),
        // %p emits lowercase and %P uppercase; chrono has them the
        // other way around.
        'p' => Spec("%P"),
        'P' => Spec("%p"),
        'r' => Spec("%I:%M:%S %P"),
        'R' => Spec("%H:%M"),
        's' => Spec("%s"),
        'S' => Spec("%S"),
        't' => Literal("\t"),
        'T' | 'X' => Spec("%H:%M:%S"),
        'u' => Spec("%u"),
        'U' => Spec("%U"),
        'V' => Spec("%V"),
        'w' => Spec("%w"),
        'W' => Spec("%W"),
        'y' => Spec("%y"),
        'Y' => Spec("%Y"),
        'z' => Spec("%z"),
        'Z' => Spec("%Z"),
        '%' => Literal("%"),
        _ => Unknown,
    }
}
