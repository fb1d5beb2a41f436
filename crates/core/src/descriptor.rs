// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Photon and method descriptors.
//!
//! Descriptors arrive from the external extractor as JSON and are immutable
//! within one generation; a reload produces a fresh descriptor set.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cron::{CronError, CronExpr};

/// Validation errors raised when a descriptor set is loaded.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("invalid photon name {0:?}: expected lowercase kebab-case")]
    InvalidName(String),

    #[error("duplicate method {0:?}")]
    DuplicateMethod(String),

    #[error("scheduled method {method:?} must accept an empty argument map")]
    ScheduledTakesArgs { method: String },

    #[error("method {method:?} has invalid cron expression: {source}")]
    Cron {
        method: String,
        #[source]
        source: CronError,
    },
}

/// Identity and surface of one photon, for one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotonDescriptor {
    /// Lowercase kebab name, unique per working directory.
    pub name: String,
    pub source_path: PathBuf,
    #[serde(default)]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
}

impl PhotonDescriptor {
    pub fn new(name: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
            working_dir: PathBuf::new(),
            stateful: false,
            methods: Vec::new(),
        }
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Check the descriptor invariants: kebab-case name, unique method
    /// names, scheduled methods callable with no arguments.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if !is_kebab(&self.name) {
            return Err(DescriptorError::InvalidName(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for method in &self.methods {
            if !seen.insert(method.name.as_str()) {
                return Err(DescriptorError::DuplicateMethod(method.name.clone()));
            }
            if method.scheduled.is_some() && method.params.iter().any(|p| p.is_required()) {
                return Err(DescriptorError::ScheduledTakesArgs {
                    method: method.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// One invokable method, as reported by the extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDescriptor {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<LockSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<CronExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            locked: None,
            scheduled: None,
            webhook: None,
            format: None,
        }
    }

    /// Name of the lease this method holds while executing, if any.
    ///
    /// `locked: true` leases under the method's own name; `locked: "x"`
    /// leases under `x`. Unlocked methods serialize on the instance-wide
    /// domain and hold no lease.
    pub fn lock_name(&self) -> Option<&str> {
        match &self.locked {
            Some(LockSpec::Named(name)) => Some(name),
            Some(LockSpec::Flag(true)) => Some(&self.name),
            _ => None,
        }
    }
}

/// `locked` annotation: bare flag or explicit lease name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LockSpec {
    Named(String),
    Flag(bool),
}

/// `webhook` annotation: bare flag or explicit path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WebhookSpec {
    Path(String),
    Flag(bool),
}

/// One constructor/method parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamDescriptor {
    /// Required with no default: the caller must supply it.
    pub fn is_required(&self) -> bool {
        self.required && self.default.is_none()
    }
}

/// Primitive type tags from the extractor schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    pub fn is_primitive(&self) -> bool {
        matches!(self, ParamType::String | ParamType::Number | ParamType::Boolean)
    }
}

fn is_kebab(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
#[path = "descriptor_tests.rs"]
mod tests;
