// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Webhook path routing.
//!
//! A pure lookup table from URL path to method name, rebuilt on every
//! reload. The HTTP front door translates `POST /webhook/<path>` into a
//! `command` request using this mapping; the router itself holds no
//! runtime state.

use std::collections::HashMap;

use photon_core::{MethodDescriptor, WebhookSpec};
use thiserror::Error;

/// Routing table construction errors; these fail photon load.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook path {path:?} claimed by both {first:?} and {second:?}")]
    Collision {
        path: String,
        first: String,
        second: String,
    },
}

/// Path → method mapping for one generation.
#[derive(Debug, Default)]
pub struct WebhookRouter {
    routes: HashMap<String, String>,
}

impl WebhookRouter {
    /// Build the table from a generation's method descriptors.
    ///
    /// - `handleGithubPush` auto-binds to `github-push`
    /// - `webhook: "stripe/payments"` binds to exactly that path
    /// - a bare `webhook: true` binds to the method's own name
    ///
    /// An explicit annotation overrides the `handle*` auto-binding for
    /// that method. Two methods claiming one path is a load failure.
    pub fn build(methods: &[MethodDescriptor]) -> Result<Self, WebhookError> {
        let mut routes: HashMap<String, String> = HashMap::new();

        for method in methods {
            let path = match &method.webhook {
                Some(WebhookSpec::Path(path)) => Some(path.trim_matches('/').to_string()),
                Some(WebhookSpec::Flag(true)) => Some(method.name.clone()),
                Some(WebhookSpec::Flag(false)) => None,
                None => method
                    .name
                    .strip_prefix("handle")
                    .filter(|rest| !rest.is_empty())
                    .map(kebab_case),
            };

            let Some(path) = path else { continue };
            if let Some(first) = routes.get(&path) {
                return Err(WebhookError::Collision {
                    path,
                    first: first.clone(),
                    second: method.name.clone(),
                });
            }
            routes.insert(path, method.name.clone());
        }

        Ok(Self { routes })
    }

    /// Method bound to `path`, if any. Leading/trailing slashes ignored.
    pub fn route(&self, path: &str) -> Option<&str> {
        self.routes.get(path.trim_matches('/')).map(String::as_str)
    }

    /// All bound `(path, method)` pairs, sorted by path.
    pub fn routes(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .routes
            .iter()
            .map(|(p, m)| (p.as_str(), m.as_str()))
            .collect();
        out.sort();
        out
    }
}

/// `GithubPush` → `github-push`
fn kebab_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
#[path = "webhook_tests.rs"]
mod tests;
