//! Route patterns with `:name` captures.
//!
//! A pattern like `/users/:id/posts` compiles to an anchored regex with one
//! capture group per `:name` segment. Matching a concrete path yields both
//! named params (for handlers) and the positional capture vector (which is
//! what subscription filtering compares — parameter *names* never matter for
//! matching).

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

/// Characters allowed in a concrete route a client may send.
const ROUTE_CHARSET: &str = "a-zA-Z0-9_/-";

/// A problem compiling or validating a route.
#[derive(Debug, Error)]
pub enum PatternError {
    /// A client route contained the pattern-capture marker.
    #[error("Route '{route}' must not contain ':'; colon captures are reserved for patterns")]
    ColonInRoute {
        /// The offending route.
        route: String,
    },

    /// A client route contained characters outside the allowed set.
    #[error("Route '{route}' contains invalid characters (allowed: [{ROUTE_CHARSET}])")]
    InvalidRoute {
        /// The offending route.
        route: String,
    },

    /// The pattern did not compile to a regex.
    #[error("invalid route pattern '{pattern}'")]
    Compile {
        /// The offending pattern.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },
}

/// A compiled route pattern.
#[derive(Clone, Debug)]
pub struct RoutePattern {
    raw: String,
    regex: Regex,
    param_names: Vec<String>,
}

/// A successful match of a concrete path against a [`RoutePattern`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteMatch {
    /// Captures keyed by parameter name.
    pub params: HashMap<String, String>,
    /// Captures in pattern order; the unit of subscription equality.
    pub values: Vec<String>,
}

impl RoutePattern {
    /// Compile a pattern, turning each `:name` segment into a capture group.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let mut parts = Vec::new();
        let mut param_names = Vec::new();
        for segment in pattern.split('/') {
            if let Some(name) = segment.strip_prefix(':') {
                param_names.push(name.to_owned());
                parts.push("([^/]+)".to_owned());
            } else {
                parts.push(regex::escape(segment));
            }
        }
        let expr = format!("^{}$", parts.join("/"));
        let regex = Regex::new(&expr).map_err(|source| PatternError::Compile {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(Self {
            raw: pattern.to_owned(),
            regex,
            param_names,
        })
    }

    /// Match a concrete path, yielding captures on success.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<RouteMatch> {
        let caps = self.regex.captures(path)?;
        let values: Vec<String> = caps
            .iter()
            .skip(1)
            .flatten()
            .map(|m| m.as_str().to_owned())
            .collect();
        let params = self
            .param_names
            .iter()
            .cloned()
            .zip(values.iter().cloned())
            .collect();
        Some(RouteMatch { params, values })
    }

    /// The pattern as registered.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Parameter names in pattern order.
    #[must_use]
    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }
}

/// Validate a concrete route a client wants to send.
///
/// Colons are rejected with a dedicated message; everything else must stay
/// within `[a-zA-Z0-9_/-]`.
pub fn validate_client_route(route: &str) -> Result<(), PatternError> {
    if route.contains(':') {
        return Err(PatternError::ColonInRoute {
            route: route.to_owned(),
        });
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '-');
    if route.is_empty() || !route.chars().all(allowed) {
        return Err(PatternError::InvalidRoute {
            route: route.to_owned(),
        });
    }
    Ok(())
}
