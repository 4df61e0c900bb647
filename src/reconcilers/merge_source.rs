// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! MergeSource reconciliation.
//!
//! A MergeSource selects source ConfigMaps by labels (optionally restricted
//! to namespaces matching `spec.namespaceSelector`), tags each selected
//! ConfigMap with the watched-by annotation, concatenates the configured data
//! key from every selection into `status.output`, and publishes a Ready
//! condition. The MergeTarget reconciler picks the output up from there.
//!
//! ConfigMap events fan out through [`watched_by_merge_sources`]: every
//! MergeSource named in the ConfigMap's watched-by annotation is enqueued.
//! ConfigMaps that drop out of a selection (label change, selector change)
//! are found by scanning the ConfigMap store for stale watched-by entries
//! during the owning MergeSource's reconcile.

use crate::annotations::{self, WATCHED_BY_MERGE_SOURCE};
use crate::conditions::{merge_source_ready, set_condition};
use crate::constants::{KIND_MERGE_SOURCE, MERGE_SOURCE_FINALIZER, RESYNC_DURATION_SECS};
use crate::context::Context;
use crate::crd::MergeSource;
use crate::metrics;
use crate::names::NamespacedName;
use crate::reconcilers::finalizers;
use anyhow::{Context as _, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, ResourceExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Watch mapper for ConfigMap events: enqueue every MergeSource named in the
/// ConfigMap's watched-by annotation. ConfigMaps without the annotation are
/// irrelevant and trigger nothing.
#[must_use]
pub fn watched_by_merge_sources(cm: ConfigMap) -> Vec<ObjectRef<MergeSource>> {
    WATCHED_BY_MERGE_SOURCE
        .parse_object_names(&cm)
        .into_iter()
        .map(|n| ObjectRef::new(&n.name).within(&n.namespace))
        .collect()
}

/// Reconcile one MergeSource.
///
/// # Errors
///
/// Transient API errors bubble up so the controller requeues with backoff.
pub async fn reconcile_merge_source(source: Arc<MergeSource>, ctx: Arc<Context>) -> Result<Action> {
    let name = NamespacedName::from_object(source.as_ref());
    debug!(source = %name, "reconciling MergeSource");

    let deleting = finalizers::execute(
        &ctx.client,
        source.as_ref(),
        MERGE_SOURCE_FINALIZER,
        || async { cleanup_merge_source(&ctx, &source, &name).await },
    )
    .await?;
    if deleting {
        info!(source = %name, "MergeSource deleted, watched-by annotations cleaned up");
        return Ok(Action::await_change());
    }

    // A bare target reference never resolves; the output would feed nothing.
    if source.namespaced_target_name().is_err() {
        warn!(
            source = %name,
            target = %source.spec.target.name,
            "spec.target.name is not a fully qualified namespace/name reference; no MergeTarget will consume this source"
        );
    }

    let selection = selected_config_maps(&ctx.client, &source).await?;
    metrics::record_num_sources(
        KIND_MERGE_SOURCE,
        &name.namespace,
        &name.name,
        selection.len(),
    );

    let mut output = String::new();
    for cm in &selection {
        annotations::apply(
            &ctx.client,
            cm,
            WATCHED_BY_MERGE_SOURCE.add_to_list(name.to_string()),
        )
        .await
        .context("error updating watched-by annotation on ConfigMap")?;

        // Absent keys contribute nothing.
        if let Some(value) = cm
            .data
            .as_ref()
            .and_then(|data| data.get(&source.spec.source.data))
        {
            output.push_str(value);
        }
    }

    remove_stale_watched_by(&ctx, &name, &selection).await?;

    publish_status(&ctx.client, &name, output, selection.len()).await?;
    info!(source = %name, num_sources = selection.len(), "updated status");

    Ok(Action::requeue(Duration::from_secs(RESYNC_DURATION_SECS)))
}

/// Resolve the selection: ConfigMaps matching `spec.selector` cluster-wide,
/// intersected with namespaces matching `spec.namespaceSelector` when one is
/// set. An empty selector selects nothing.
async fn selected_config_maps(client: &Client, source: &MergeSource) -> Result<Vec<ConfigMap>> {
    // An empty selector selects nothing, not every ConfigMap in the cluster.
    if source.spec.selector.is_empty() {
        return Ok(Vec::new());
    }

    let api: Api<ConfigMap> = Api::all(client.clone());
    let params = ListParams::default().labels(&label_selector(&source.spec.selector));
    let config_maps = api
        .list(&params)
        .await
        .context("error listing source ConfigMaps")?
        .items;

    if config_maps.is_empty() || source.spec.namespace_selector.is_empty() {
        return Ok(config_maps);
    }

    let namespaces: Api<Namespace> = Api::all(client.clone());
    let selected = namespaces
        .list(&ListParams::default().labels(&label_selector(&source.spec.namespace_selector)))
        .await
        .context("error listing namespaces")?
        .items;

    if selected.is_empty() {
        // Almost certainly operator error, but not fatal.
        warn!(
            selector = ?source.spec.namespace_selector,
            "no namespaces match namespaceSelector, filtering all source ConfigMaps"
        );
        return Ok(Vec::new());
    }

    let allowed: HashSet<String> = selected.iter().map(ResourceExt::name_any).collect();
    Ok(config_maps
        .into_iter()
        .filter(|cm| cm.namespace().is_some_and(|ns| allowed.contains(&ns)))
        .collect())
}

/// Strip this MergeSource from the watched-by list of every ConfigMap that
/// still carries it but is no longer selected.
async fn remove_stale_watched_by(
    ctx: &Context,
    name: &NamespacedName,
    selection: &[ConfigMap],
) -> Result<()> {
    let selected: HashSet<NamespacedName> =
        selection.iter().map(NamespacedName::from_object).collect();

    for cm in ctx.stores.config_maps_watched_by(name) {
        let cm_name = NamespacedName::from_object(cm.as_ref());
        if selected.contains(&cm_name) {
            continue;
        }
        info!(source = %name, config_map = %cm_name, "removing stale watched-by annotation");
        annotations::apply(
            &ctx.client,
            cm.as_ref(),
            WATCHED_BY_MERGE_SOURCE.remove_from_list(name.to_string()),
        )
        .await?;
    }

    Ok(())
}

/// Re-fetch the MergeSource and publish `status.output` plus the Ready
/// condition. A MergeSource deleted in the meantime is fine.
async fn publish_status(
    client: &Client,
    name: &NamespacedName,
    output: String,
    num_sources: usize,
) -> Result<()> {
    let api: Api<MergeSource> = Api::namespaced(client.clone(), &name.namespace);
    let mut latest = match api.get(&name.name).await {
        Ok(source) => source,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("error retrieving MergeSource {name} for status update"))
        }
    };

    let mut status = latest.status.take().unwrap_or_default();
    status.output = output;
    set_condition(&mut status.conditions, merge_source_ready(num_sources));

    api.patch_status(
        &name.name,
        &PatchParams::default(),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await
    .context("failed updating status after accumulating watched ConfigMaps")?;

    metrics::record_ready_condition(
        KIND_MERGE_SOURCE,
        &name.namespace,
        &name.name,
        &status.conditions,
    );
    Ok(())
}

/// Remove this MergeSource from every ConfigMap it ever tagged.
async fn cleanup_merge_source(
    ctx: &Context,
    source: &MergeSource,
    name: &NamespacedName,
) -> Result<()> {
    let mut seen = HashSet::new();

    for cm in selected_config_maps(&ctx.client, source).await? {
        seen.insert(NamespacedName::from_object(&cm));
        annotations::apply(
            &ctx.client,
            &cm,
            WATCHED_BY_MERGE_SOURCE.remove_from_list(name.to_string()),
        )
        .await?;
    }

    // ConfigMaps that fell out of the selection may still carry the
    // annotation; sweep those too.
    for cm in ctx.stores.config_maps_watched_by(name) {
        if seen.insert(NamespacedName::from_object(cm.as_ref())) {
            annotations::apply(
                &ctx.client,
                cm.as_ref(),
                WATCHED_BY_MERGE_SOURCE.remove_from_list(name.to_string()),
            )
            .await?;
        }
    }

    metrics::clear_resource(KIND_MERGE_SOURCE, &name.namespace, &name.name);
    Ok(())
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
#[path = "merge_source_tests.rs"]
mod merge_source_tests;
