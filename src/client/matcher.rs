//! Request matchers compiled from an intercept's header rules.
//!
//! A rule map holds header names mapped to regular expressions, plus the
//! pseudo keys [`PATH_EQUAL`], [`PATH_PREFIX`] and [`PATH_REGEX`] that
//! constrain the request path. A request matches when the path rule (if
//! any) accepts its path and every header rule accepts at least one value
//! of its header.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

use axum::http::HeaderMap;
use regex::Regex;

use crate::{AppError, Result};

/// Path must equal the value.
pub const PATH_EQUAL: &str = ":path-equal:";
/// Path must start with the value.
pub const PATH_PREFIX: &str = ":path-prefix:";
/// Path must match the value as an anchored regular expression.
pub const PATH_REGEX: &str = ":path-regex:";

#[derive(Debug, Clone)]
enum PathRule {
    Equal(String),
    Prefix(String),
    Regex(Regex),
}

impl PathRule {
    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Equal(p) => path == p,
            Self::Prefix(p) => path.starts_with(p.as_str()),
            Self::Regex(rx) => rx.is_match(path),
        }
    }
}

/// Compiled matcher for one intercept.
#[derive(Debug, Clone)]
pub struct RequestMatcher {
    path: Option<PathRule>,
    headers: BTreeMap<String, Regex>,
}

impl RequestMatcher {
    /// Compile a rule map.
    ///
    /// # Errors
    ///
    /// Returns `AppError::User` when more than one path rule is given or a
    /// regular expression does not compile.
    pub fn from_map(rules: &HashMap<String, String>) -> Result<Self> {
        let mut path = None;
        let mut headers = BTreeMap::new();
        for (key, value) in rules {
            let rule = match key.as_str() {
                PATH_EQUAL => Some(PathRule::Equal(value.clone())),
                PATH_PREFIX => Some(PathRule::Prefix(value.clone())),
                PATH_REGEX => Some(PathRule::Regex(anchored(key, value)?)),
                _ => {
                    headers.insert(key.to_ascii_lowercase(), anchored(key, value)?);
                    None
                }
            };
            if let Some(rule) = rule {
                if path.replace(rule).is_some() {
                    return Err(AppError::User(
                        "only one of :path-equal:, :path-prefix: and :path-regex: may be given".into(),
                    ));
                }
            }
        }
        Ok(Self { path, headers })
    }

    /// Whether a request with `path` and `headers` is intercepted.
    #[must_use]
    pub fn matches(&self, path: &str, headers: &HeaderMap) -> bool {
        if let Some(rule) = &self.path {
            if !rule.matches(path) {
                return false;
            }
        }
        self.headers.iter().all(|(name, rx)| {
            headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| rx.is_match(v))
        })
    }
}

impl Display for RequestMatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        match &self.path {
            Some(PathRule::Equal(p)) => parts.push(format!("path = {p}")),
            Some(PathRule::Prefix(p)) => parts.push(format!("path prefix {p}")),
            Some(PathRule::Regex(rx)) => parts.push(format!("path ~ {rx}")),
            None => {}
        }
        for (name, rx) in &self.headers {
            parts.push(format!("{name} ~ {rx}"));
        }
        if parts.is_empty() {
            f.write_str("all requests")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

fn anchored(key: &str, value: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{value})$"))
        .map_err(|err| AppError::User(format!("invalid regular expression for {key}: {err}")))
}
