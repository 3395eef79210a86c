//! Label selectors: `key=value`, `key==value` and `key!=value`, ANDed.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorOp {
    Equals,
    NotEquals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub key: String,
    pub op: SelectorOp,
    pub value: String,
}

impl Selector {
    /// Whether `labels` satisfies this selector. A missing label never
    /// equals anything, so it satisfies every `!=`.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let actual = labels.get(&self.key).map(String::as_str);
        match self.op {
            SelectorOp::Equals => actual == Some(self.value.as_str()),
            SelectorOp::NotEquals => actual != Some(self.value.as_str()),
        }
    }

    /// Parse a list of selector arguments, each of which may itself be a
    /// comma-separated list (`-l a=b,c!=d -l e=f`).
    pub fn parse_all<S: AsRef<str>>(args: &[S]) -> CoreResult<Vec<Selector>> {
        args.iter()
            .flat_map(|arg| arg.as_ref().split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

/// All selectors must match (an empty list matches everything).
pub fn matches_all(selectors: &[Selector], labels: &HashMap<String, String>) -> bool {
    selectors.iter().all(|s| s.matches(labels))
}

impl FromStr for Selector {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let invalid = || CoreError::InvalidSelector(s.to_string());
        let (key, op, value) = if let Some((k, v)) = s.split_once("!=") {
            (k, SelectorOp::NotEquals, v)
        } else if let Some((k, v)) = s.split_once("==") {
            (k, SelectorOp::Equals, v)
        } else if let Some((k, v)) = s.split_once('=') {
            (k, SelectorOp::Equals, v)
        } else {
            return Err(invalid());
        };
        let key = key.trim();
        if key.is_empty() || value.contains('=') {
            return Err(invalid());
        }
        Ok(Selector {
            key: key.to_string(),
            op,
            value: value.trim().to_string(),
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            SelectorOp::Equals => "=",
            SelectorOp::NotEquals => "!=",
        };
        write!(f, "{}{}{}", self.key, op, self.value)
    }
}
