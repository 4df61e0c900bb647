// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Namespaced resource name parsing.
//!
//! Resource references in CMMC specs accept either `name` (defaulted to the
//! referring resource's namespace) or `namespace/name`. This module provides
//! the [`NamespacedName`] type that canonicalizes both forms and renders back
//! as `namespace/name`.

use kube::ResourceExt;
use std::fmt;

const SEPARATOR: char = '/';

/// Errors produced while parsing a resource reference.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NameError {
    /// The reference was empty.
    #[error("name is empty")]
    EmptyName,

    /// The reference had no namespace and no default namespace was available.
    #[error("default namespace is empty")]
    EmptyNamespace,

    /// The reference contained more than one separator.
    #[error("{0} is not a valid resource name")]
    InvalidName(String),
}

/// A fully qualified `namespace/name` resource identifier.
///
/// Field order matters: deriving `Ord` on (namespace, name) gives the stable
/// ordering used when concatenating source outputs.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    /// Construct from known parts.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse a resource reference, qualifying it with `default_namespace`
    /// when the reference does not carry its own.
    ///
    /// # Errors
    ///
    /// Returns [`NameError`] for an empty reference, a reference with more
    /// than one separator, or an unqualified reference with no default
    /// namespace to fall back to.
    pub fn parse(name: &str, default_namespace: &str) -> Result<Self, NameError> {
        if name.is_empty() {
            return Err(NameError::EmptyName);
        }

        let parts: Vec<&str> = name.split(SEPARATOR).collect();
        match parts.as_slice() {
            [name] => {
                if default_namespace.is_empty() {
                    return Err(NameError::EmptyNamespace);
                }
                Ok(Self::new(default_namespace, name))
            }
            [namespace, name] => Ok(Self::new(namespace, name)),
            _ => Err(NameError::InvalidName(name.to_string())),
        }
    }

    /// The `namespace/name` identity of a Kubernetes object.
    #[must_use]
    pub fn from_object(o: &impl ResourceExt) -> Self {
        Self {
            namespace: o.namespace().unwrap_or_default(),
            name: o.name_any(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, SEPARATOR, self.name)
    }
}

#[cfg(test)]
#[path = "names_tests.rs"]
mod names_tests;
