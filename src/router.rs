//! Maps HTTP method + path to the handler configured for the route.

use crate::config::RouteConfig;
use crate::error::{EmulatorError, EmulatorResult};
use crate::lambda::{Handler, Resolver};
use hyper::Method;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

/// Matches `<name>`, `<name:filter>` and `{name}` placeholders in URL patterns.
static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();

/// A route from the config file with its handler resolved.
pub struct RouteBinding {
    pub method: Method,
    /// The URL pattern as written in the config, e.g. `/users/<id>`
    pub pattern: String,
    regex: Regex,
    pub handler: Arc<dyn Handler>,
}

impl RouteBinding {
    pub fn new(method: Method, pattern: &str, handler: Arc<dyn Handler>) -> EmulatorResult<Self> {
        Ok(Self {
            method,
            pattern: pattern.to_owned(),
            regex: compile_pattern(pattern)?,
            handler,
        })
    }

    /// Returns the decoded path parameters if the request matches this route.
    pub fn matches(&self, method: &Method, path: &str) -> Option<HashMap<String, String>> {
        if method != self.method {
            return None;
        }

        let captures = self.regex.captures(path)?;

        let params = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                let value = captures.name(name)?.as_str();
                Some((name.to_owned(), percent_decode_str(value).decode_utf8_lossy().to_string()))
            })
            .collect();

        Some(params)
    }
}

/// Converts a URL pattern into an anchored regex with a named group per placeholder.
/// Supported filters: `int`, `float`, `path` (may contain slashes) and `string` (the default).
pub fn compile_pattern(pattern: &str) -> EmulatorResult<Regex> {
    let placeholder = PLACEHOLDER_REGEX.get_or_init(|| {
        Regex::new(r"<([A-Za-z_][A-Za-z0-9_]*)(?::([A-Za-z]+))?>|\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .expect("Invalid placeholder regex. It's a bug.")
    });

    let mut re = String::from("^");
    let mut last = 0;

    for caps in placeholder.captures_iter(pattern) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        re.push_str(&regex::escape(&pattern[last..whole.start()]));

        let name = caps.get(1).or_else(|| caps.get(3)).map(|m| m.as_str()).unwrap_or_default();
        let filter = match caps.get(2).map(|m| m.as_str()) {
            None | Some("string") => "[^/]+",
            Some("int") => r"-?\d+",
            Some("float") => r"-?\d+(?:\.\d+)?",
            Some("path") => ".+",
            Some(other) => {
                return Err(EmulatorError::Configuration(format!(
                    "unknown filter `{other}` in route {pattern}"
                )))
            }
        };

        re.push_str(&["(?P<", name, ">", filter, ")"].concat());
        last = whole.end();
    }

    re.push_str(&regex::escape(&pattern[last..]));
    re.push('$');

    Regex::new(&re).map_err(|e| EmulatorError::Configuration(format!("invalid route {pattern}: {e}")))
}

/// Resolves the handlers for all routes. A route that cannot be bound is logged and skipped.
pub fn bind_routes(routes: &[RouteConfig], resolver: &dyn Resolver) -> Vec<RouteBinding> {
    let mut bindings = Vec::with_capacity(routes.len());

    for route in routes {
        let method = match Method::from_str(&route.method.to_ascii_uppercase()) {
            Ok(v) => v,
            Err(e) => {
                error!("Invalid method {} for {}: {e}", route.method, route.url);
                continue;
            }
        };

        let binding = resolver
            .resolve(&route.handler)
            .and_then(|handler| RouteBinding::new(method.clone(), &route.url, handler));

        match binding {
            Ok(v) => {
                info!("Mapped {method} {} to {}", route.url, route.handler.display_name());
                bindings.push(v);
            }
            Err(e) => error!("Failed to map {method} {}: {e}", route.url),
        }
    }

    bindings
}

/// Returns the first route matching the request, in config order.
pub fn find_route<'a>(
    routes: &'a [RouteBinding],
    method: &Method,
    path: &str,
) -> Option<(&'a RouteBinding, HashMap<String, String>)> {
    routes
        .iter()
        .find_map(|route| route.matches(method, path).map(|params| (route, params)))
}
