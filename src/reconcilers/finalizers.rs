// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Finalizer management for CMMC resources.
//!
//! Both custom resources block deletion behind a finalizer so the controller
//! can undo its out-of-band writes (watched-by annotations, managed target
//! keys) before the object disappears. [`execute`] drives the whole gate: it
//! attaches the marker to live objects, and on deletion runs the cleanup
//! callback exactly once before removing the marker.

use anyhow::Result;
use futures::Future;
use kube::api::{Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::info;

/// True when the resource carries the named finalizer.
#[must_use]
pub fn has_finalizer<T: ResourceExt>(resource: &T, finalizer: &str) -> bool {
    resource.finalizers().iter().any(|f| f == finalizer)
}

/// True when the resource has a deletion timestamp.
#[must_use]
pub fn is_being_deleted<T: ResourceExt>(resource: &T) -> bool {
    resource.meta().deletion_timestamp.is_some()
}

/// Run the finalizer gate for one reconcile.
///
/// Returns `true` when the resource is being deleted; the caller must stop
/// reconciling it. Cleanup runs only while the marker is still present, so a
/// redelivery after the marker was removed does not run it again.
///
/// # Errors
///
/// Returns an error when the cleanup callback fails (the marker stays in
/// place and deletion is retried) or a finalizer patch fails.
pub async fn execute<T, F, Fut>(
    client: &Client,
    resource: &T,
    finalizer: &str,
    cleanup: F,
) -> Result<bool>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ResourceExt
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if !is_being_deleted(resource) {
        ensure_finalizer(client, resource, finalizer).await?;
        return Ok(false);
    }

    if !has_finalizer(resource, finalizer) {
        return Ok(true);
    }

    info!(
        "Running cleanup for {} {}/{}",
        T::kind(&()),
        resource.namespace().unwrap_or_default(),
        resource.name_any()
    );
    cleanup().await?;
    remove_finalizer(client, resource, finalizer).await?;

    Ok(true)
}

/// Add a finalizer to a live resource if not already present.
///
/// Idempotent; never touches a resource that is already being deleted.
///
/// # Errors
///
/// Returns an error if the API patch operation fails.
pub async fn ensure_finalizer<T>(client: &Client, resource: &T, finalizer: &str) -> Result<()>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ResourceExt
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    if is_being_deleted(resource) || has_finalizer(resource, finalizer) {
        return Ok(());
    }

    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();

    info!(
        "Adding finalizer {} to {} {}/{}",
        finalizer,
        T::kind(&()),
        namespace,
        name
    );

    let mut finalizers = resource.finalizers().to_vec();
    finalizers.push(finalizer.to_string());

    let api: Api<T> = Api::namespaced(client.clone(), &namespace);
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}

/// Remove a finalizer from a resource.
///
/// Idempotent.
///
/// # Errors
///
/// Returns an error if the API patch operation fails.
pub async fn remove_finalizer<T>(client: &Client, resource: &T, finalizer: &str) -> Result<()>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ResourceExt
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    if !has_finalizer(resource, finalizer) {
        return Ok(());
    }

    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();

    info!(
        "Removing finalizer {} from {} {}/{}",
        finalizer,
        T::kind(&()),
        namespace,
        name
    );

    let finalizers: Vec<String> = resource
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();

    let api: Api<T> = Api::namespaced(client.clone(), &namespace);
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}

#[cfg(test)]
#[path = "finalizers_tests.rs"]
mod finalizers_tests;
