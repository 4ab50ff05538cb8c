//! Route classification
//!
//! Partitions request paths into excluded, optional and required tiers.
//! Paths are normalized before matching; anything not listed is required.

use dashmap::DashSet;
use std::collections::HashSet;

use crate::core::config::AuthConfig;

/// Authentication tier of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// No authentication attempted
    Excluded,
    /// Authentication attempted, failures swallowed
    Optional,
    /// Authentication demanded
    Required,
}

/// Exact-match route table
#[derive(Debug)]
pub struct RouteTable {
    prefix: String,
    excluded: HashSet<String>,
    optional: DashSet<String>,
}

impl RouteTable {
    pub fn new<E, O>(prefix: &str, excluded: E, optional: O) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        O: IntoIterator,
        O::Item: AsRef<str>,
    {
        let prefix = trim_trailing_slashes(prefix).to_string();
        let excluded: HashSet<String> = excluded
            .into_iter()
            .map(|p| normalize_path(&prefix, p.as_ref()))
            .collect();

        let optional_set = DashSet::new();
        for route in optional {
            let route = normalize_path(&prefix, route.as_ref());
            if excluded.contains(&route) {
                tracing::warn!(route = %route, "Route listed as excluded and optional; keeping excluded");
                continue;
            }
            optional_set.insert(route);
        }

        Self {
            prefix,
            excluded,
            optional: optional_set,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            &config.service_prefix,
            &config.excluded_routes,
            &config.optional_routes,
        )
    }

    /// Service prefix without trailing slash; empty when unset
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Strip the service prefix and trailing slashes; empty becomes `/`
    pub fn normalize(&self, path: &str) -> String {
        normalize_path(&self.prefix, path)
    }

    pub fn classify(&self, path: &str) -> RouteClass {
        let path = self.normalize(path);
        if self.excluded.contains(&path) {
            RouteClass::Excluded
        } else if self.optional.contains(&path) {
            RouteClass::Optional
        } else {
            RouteClass::Required
        }
    }

    /// Move a required path into the optional tier.
    /// Excluded paths stay excluded; returns whether the path is now optional.
    pub fn register_optional(&self, path: &str) -> bool {
        let path = self.normalize(path);
        if self.excluded.contains(&path) {
            return false;
        }
        if self.optional.insert(path.clone()) {
            tracing::debug!(route = %path, "Registered optional route");
        }
        true
    }
}

fn trim_trailing_slashes(path: &str) -> &str {
    path.trim_end_matches('/')
}

fn normalize_path(prefix: &str, path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();

    let stripped = if prefix.is_empty() {
        path
    } else {
        match path.strip_prefix(prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => path,
        }
    };

    let trimmed = trim_trailing_slashes(stripped);
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
