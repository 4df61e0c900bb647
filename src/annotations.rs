// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Ownership annotations on ConfigMaps.
//!
//! CMMC records its obligations out-of-band as annotations on the ConfigMaps
//! it touches: the watched-by annotation carries a comma-separated *set* of
//! MergeSource references, the managed-by annotation a single MergeTarget
//! reference. The list operations here are idempotent and order-insensitive;
//! duplicates and empty entries are dropped on every mutation, and removing
//! the last entry removes the annotation key entirely.

use crate::constants::{MANAGED_BY_ANNOTATION, WATCHED_BY_ANNOTATION};
use crate::names::NamespacedName;
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;

const LIST_SEPARATOR: char = ',';

/// The watched-by annotation, maintained by the MergeSource reconciler.
pub const WATCHED_BY_MERGE_SOURCE: Annotation = Annotation(WATCHED_BY_ANNOTATION);

/// The managed-by annotation, maintained by the MergeTarget reconciler.
pub const MANAGED_BY_MERGE_TARGET: Annotation = Annotation(MANAGED_BY_ANNOTATION);

/// A named annotation with typed accessors and update closures.
///
/// The update methods return closures over the annotation map so callers can
/// hand them to [`apply`] (read-modify-write against the API) or run them on
/// an object they are about to write anyway.
#[derive(Clone, Copy, Debug)]
pub struct Annotation(pub &'static str);

impl Annotation {
    /// The annotation key.
    #[must_use]
    pub fn key(self) -> &'static str {
        self.0
    }

    /// Read the raw annotation value off an object.
    #[must_use]
    pub fn get(self, o: &impl ResourceExt) -> Option<&str> {
        o.annotations().get(self.0).map(String::as_str)
    }

    /// Parse the first reference in the annotation value.
    ///
    /// References in ownership annotations are always fully qualified, so no
    /// default namespace applies; malformed entries parse as `None`.
    #[must_use]
    pub fn parse_object_name(self, o: &impl ResourceExt) -> Option<NamespacedName> {
        self.get(o)
            .map(list_entries)
            .and_then(|entries| entries.first().map(|e| NamespacedName::parse(e, "")))
            .and_then(Result::ok)
    }

    /// Parse every reference in the annotation value, dropping malformed
    /// entries.
    #[must_use]
    pub fn parse_object_names(self, o: &impl ResourceExt) -> Vec<NamespacedName> {
        self.get(o)
            .map(list_entries)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| NamespacedName::parse(e, "").ok())
            .collect()
    }

    /// Set the annotation to a single value.
    pub fn set(self, value: String) -> impl FnOnce(&mut BTreeMap<String, String>) {
        move |annotations| {
            annotations.insert(self.0.to_string(), value);
        }
    }

    /// Add a value to the comma-separated list, creating the annotation if
    /// missing. Adding an empty value or a value already present is a no-op.
    pub fn add_to_list(self, value: String) -> impl FnOnce(&mut BTreeMap<String, String>) {
        move |annotations| {
            if value.is_empty() {
                return;
            }
            let next = match annotations.get(self.0) {
                Some(current) => list_add(current, &value),
                None => value,
            };
            annotations.insert(self.0.to_string(), next);
        }
    }

    /// Remove a value from the comma-separated list. When the remaining list
    /// is empty the annotation key is removed entirely.
    pub fn remove_from_list(self, value: String) -> impl FnOnce(&mut BTreeMap<String, String>) {
        move |annotations| {
            match annotations.get(self.0).map(|c| list_remove(c, &value)) {
                Some(Some(next)) => {
                    annotations.insert(self.0.to_string(), next);
                }
                _ => {
                    annotations.remove(self.0);
                }
            };
        }
    }

    /// Remove the annotation key.
    pub fn remove(self) -> impl FnOnce(&mut BTreeMap<String, String>) {
        move |annotations| {
            annotations.remove(self.0);
        }
    }
}

/// Split a list annotation value, dropping empty entries.
#[must_use]
pub fn list_entries(value: &str) -> Vec<&str> {
    value
        .split(LIST_SEPARATOR)
        .filter(|e| !e.is_empty())
        .collect()
}

fn list_add(current: &str, value: &str) -> String {
    let mut entries: Vec<&str> = Vec::new();
    for entry in list_entries(current) {
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }
    if !entries.contains(&value) {
        entries.push(value);
    }
    entries.join(",")
}

fn list_remove(current: &str, value: &str) -> Option<String> {
    let entries: Vec<&str> = list_entries(current)
        .into_iter()
        .filter(|e| *e != value)
        .collect();
    if entries.is_empty() {
        None
    } else {
        Some(entries.join(","))
    }
}

/// Apply an annotation update to a ConfigMap with read-modify-write.
///
/// The ConfigMap is re-fetched so the update lands on the latest version; the
/// replace carries that resourceVersion, so a concurrent writer surfaces as a
/// conflict error and the caller requeues. A ConfigMap deleted since the
/// caller listed it is treated as success.
pub async fn apply(
    client: &Client,
    cm: &ConfigMap,
    update: impl FnOnce(&mut BTreeMap<String, String>),
) -> Result<()> {
    let namespace = cm.namespace().unwrap_or_default();
    let name = cm.name_any();
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);

    let mut fresh = match api.get(&name).await {
        Ok(cm) => cm,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| {
                format!("error fetching ConfigMap {namespace}/{name} for annotation update")
            })
        }
    };

    let mut annotations = fresh.metadata.annotations.take().unwrap_or_default();
    update(&mut annotations);
    fresh.metadata.annotations = if annotations.is_empty() {
        None
    } else {
        Some(annotations)
    };

    api.replace(&name, &PostParams::default(), &fresh)
        .await
        .with_context(|| format!("error updating annotations on ConfigMap {namespace}/{name}"))?;
    Ok(())
}

#[cfg(test)]
#[path = "annotations_tests.rs"]
mod annotations_tests;
