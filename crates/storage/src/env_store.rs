// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Env store for constructor parameter resolution.
//!
//! Primitive constructor parameters without defaults resolve from
//! `~/.photon/env/<P>.json`, then the process environment (exact name,
//! then SCREAMING_SNAKE). Resolution order is fixed; the instance host
//! rejects a load when a required parameter resolves nowhere.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use crate::state::StateError;

/// Values from one photon's env file.
#[derive(Debug, Default, Clone)]
pub struct EnvStore {
    values: HashMap<String, String>,
}

impl EnvStore {
    /// Load the env file for a photon. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let parsed: HashMap<String, Value> = serde_json::from_str(&raw)?;
        let values = parsed
            .into_iter()
            .map(|(k, v)| (k, stringify(v)))
            .collect();
        Ok(Self { values })
    }

    /// In-memory store for tests and embedded hosts.
    pub fn from_values(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Resolve a parameter: env file, process env exact name, process env
    /// SCREAMING_SNAKE.
    pub fn resolve(&self, param: &str) -> Option<String> {
        if let Some(v) = self.values.get(param) {
            return Some(v.clone());
        }
        if let Ok(v) = std::env::var(param) {
            return Some(v);
        }
        std::env::var(screaming_snake(param)).ok()
    }
}

/// Env file values may be strings, numbers, or booleans; everything is
/// handed to constructors as a string, matching process-env semantics.
fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn screaming_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

#[cfg(test)]
#[path = "env_store_tests.rs"]
mod tests;
