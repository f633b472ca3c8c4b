//! Vector selectors: `metric{label="value", ...}` parsing, rendering and
//! per-shard rewriting.

#![forbid(unsafe_code)]

use std::fmt::{self, Write as _};
use std::str::FromStr;

use regex::Regex;
use shardq_core::{ResultItem, ShardLabelError};

mod parser;
mod shard;

pub use parser::parse;
pub use shard::sharded_selectors;

const METRIC_NAME_LABEL: &str = "__name__";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("{msg} at position {pos}")]
    Syntax { pos: usize, msg: String },
    #[error("expected a vector selector, found {0}")]
    NotVectorSelector(String),
    #[error("invalid regular expression {value:?} for label {name}: {reason}")]
    Regex { name: String, value: String, reason: String },
    #[error("vector selector must contain at least one non-empty matcher")]
    EmptyMatchers,
    #[error("metric name must not be set twice: {0:?} or {1:?}")]
    DuplicateName(String, String),
    #[error(transparent)]
    ShardLabel(#[from] ShardLabelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    Equal,
    NotEqual,
    Regexp,
    NotRegexp,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::Regexp => "=~",
            MatchType::NotRegexp => "!~",
        })
    }
}

/// A single label matcher. Regex matchers are anchored on both ends.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub kind: MatchType,
    pub name: String,
    pub value: String,
    re: Option<Regex>,
}

impl Matcher {
    pub fn new(kind: MatchType, name: impl Into<String>, value: impl Into<String>) -> Result<Self, SelectorError> {
        let name = name.into();
        let value = value.into();
        let re = match kind {
            MatchType::Regexp | MatchType::NotRegexp => Some(
                Regex::new(&format!("^(?s:{value})$")).map_err(|e| SelectorError::Regex {
                    name: name.clone(),
                    value: value.clone(),
                    reason: e.to_string(),
                })?,
            ),
            MatchType::Equal | MatchType::NotEqual => None,
        };
        Ok(Self { kind, name, value, re })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { kind: MatchType::Equal, name: name.into(), value: value.into(), re: None }
    }

    pub fn matches(&self, s: &str) -> bool {
        match (self.kind, &self.re) {
            (MatchType::Equal, _) => s == self.value,
            (MatchType::NotEqual, _) => s != self.value,
            (MatchType::Regexp, Some(re)) => re.is_match(s),
            (MatchType::NotRegexp, Some(re)) => !re.is_match(s),
            // regex kinds always carry a compiled regex
            (MatchType::Regexp | MatchType::NotRegexp, None) => false,
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name && self.value == other.value
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.kind)?;
        write_quoted(f, &self.value)
    }
}

/// Parsed `metric{matchers}` expression. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorSelector {
    name: Option<String>,
    matchers: Vec<Matcher>,
}

impl VectorSelector {
    /// Validate and build a selector. `matchers` must not repeat the metric
    /// name with any `__name__` matcher when `name` is set.
    pub fn new(name: Option<String>, matchers: Vec<Matcher>) -> Result<Self, SelectorError> {
        if let Some(n) = &name {
            if let Some(m) = matchers.iter().find(|m| m.name == METRIC_NAME_LABEL) {
                return Err(SelectorError::DuplicateName(n.clone(), m.value.clone()));
            }
        } else if matchers.iter().all(|m| m.matches("")) {
            return Err(SelectorError::EmptyMatchers);
        }
        Ok(Self { name, matchers })
    }

    pub fn name(&self) -> Option<&str> { self.name.as_deref() }
    pub fn matchers(&self) -> &[Matcher] { &self.matchers }

    /// Whether a series (given as its label set) is selected. Missing labels
    /// compare as the empty string.
    pub fn matches(&self, series: &ResultItem) -> bool {
        if let Some(name) = &self.name {
            if series.get(METRIC_NAME_LABEL) != Some(name.as_str()) {
                return false;
            }
        }
        self.matchers.iter().all(|m| m.matches(series.get(&m.name).unwrap_or("")))
    }
}

impl FromStr for VectorSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> { parse(s) }
}

impl fmt::Display for VectorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            f.write_str(name)?;
            if self.matchers.is_empty() {
                return Ok(());
            }
        }
        f.write_char('{')?;
        for (i, m) in self.matchers.iter().enumerate() {
            if i > 0 {
                f.write_char(',')?;
            }
            write!(f, "{m}")?;
        }
        f.write_char('}')
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            '\x07' => f.write_str("\\a")?,
            '\x08' => f.write_str("\\b")?,
            '\x0b' => f.write_str("\\v")?,
            '\x0c' => f.write_str("\\f")?,
            c if c.is_control() && (c as u32) < 0x80 => write!(f, "\\x{:02x}", c as u32)?,
            c if c.is_control() => write!(f, "\\u{:04x}", c as u32)?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}
