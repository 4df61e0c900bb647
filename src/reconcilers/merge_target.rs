// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! MergeTarget reconciliation.
//!
//! A MergeTarget assembles one ConfigMap out of the outputs of every
//! MergeSource pointing at it. Each reconcile:
//!
//! 1. resolves `spec.target` and ensures the ConfigMap exists, recording
//!    whether the controller created it (`status.newlyCreated`),
//! 2. claims exclusive ownership through the managed-by annotation,
//! 3. snapshots per-key initial state so keys can be reverted later,
//! 4. reduces the sorted MergeSource outputs into the managed keys,
//!    validating each key against its schema,
//! 5. writes the ConfigMap and publishes Ready + cmmc/Validation conditions.
//!
//! A validation failure is localized to its key; other keys still update.
//! A ConfigMap owned by a different MergeTarget is a fatal misconfiguration:
//! nothing is mutated and the error policy backs off slowly.

use crate::annotations::{self, MANAGED_BY_MERGE_TARGET, WATCHED_BY_MERGE_SOURCE};
use crate::conditions::{self, set_condition};
use crate::constants::{KIND_MERGE_TARGET, MERGE_TARGET_FINALIZER, RESYNC_DURATION_SECS};
use crate::context::Context;
use crate::crd::{
    Condition, MergeSource, MergeTarget, MergeTargetStatus, NEWLY_CREATED_NO, NEWLY_CREATED_YES,
};
use crate::metrics;
use crate::names::NamespacedName;
use crate::reconcilers::finalizers;
use anyhow::{Context as _, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Fatal misconfiguration: the target ConfigMap is owned by another
/// MergeTarget. Never reconciled, only surfaced.
#[derive(Debug, thiserror::Error)]
#[error("ConfigMap {config_map} is managed by another MergeTarget ({owner})")]
pub struct MisconfiguredTargetError {
    pub config_map: NamespacedName,
    pub owner: NamespacedName,
}

/// Watch mapper for ConfigMap events: enqueue the MergeTarget named in the
/// managed-by annotation, if any.
#[must_use]
pub fn managed_by_merge_target(cm: ConfigMap) -> Vec<ObjectRef<MergeTarget>> {
    MANAGED_BY_MERGE_TARGET
        .parse_object_name(&cm)
        .into_iter()
        .map(|n| ObjectRef::new(&n.name).within(&n.namespace))
        .collect()
}

/// Watch mapper for MergeSource events: enqueue the MergeTarget the source
/// feeds, so output changes propagate to the target ConfigMap.
#[must_use]
pub fn merge_source_target(source: MergeSource) -> Vec<ObjectRef<MergeTarget>> {
    source
        .namespaced_target_name()
        .ok()
        .into_iter()
        .map(|n| ObjectRef::new(&n.name).within(&n.namespace))
        .collect()
}

/// Reconcile one MergeTarget.
///
/// # Errors
///
/// Transient API errors bubble up for backoff requeue;
/// [`MisconfiguredTargetError`] marks the fatal ownership conflict, which the
/// error policy requeues on a slow cadence.
pub async fn reconcile_merge_target(target: Arc<MergeTarget>, ctx: Arc<Context>) -> Result<Action> {
    let name = NamespacedName::from_object(target.as_ref());
    let api: Api<MergeTarget> = Api::namespaced(ctx.client.clone(), &name.namespace);
    debug!(target = %name, "reconciling MergeTarget");

    // Work on the latest version; the queued object may be stale.
    let mut target = match api.get(&name.name).await {
        Ok(target) => target,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(Action::await_change()),
        Err(e) => {
            return Err(e).with_context(|| format!("error fetching MergeTarget {name}"))
        }
    };

    let target_name = match target.namespaced_target_name() {
        Ok(target_name) => target_name,
        Err(err) => {
            publish_condition(
                &api,
                &name,
                &mut target,
                conditions::merge_target_invalid_target(&err),
            )
            .await?;
            return Ok(Action::requeue(Duration::from_secs(RESYNC_DURATION_SECS)));
        }
    };

    let deleting = finalizers::execute(&ctx.client, &target, MERGE_TARGET_FINALIZER, || async {
        finalize_deletion(&ctx.client, &target, &target_name).await?;
        metrics::clear_resource(KIND_MERGE_TARGET, &name.namespace, &name.name);
        Ok(())
    })
    .await?;
    if deleting {
        info!(target = %name, "MergeTarget deleted, target ConfigMap finalized");
        return Ok(Action::await_change());
    }

    // Find or create the target ConfigMap. Whether we created it gates
    // destructive cleanup, so the flag is latched before anything else.
    let cm_api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &target_name.namespace);
    let config_map = match cm_api.get(&target_name.name).await {
        Ok(cm) => {
            maybe_set_newly_created(&api, &name, &mut target, NEWLY_CREATED_NO).await?;
            cm
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            maybe_set_newly_created(&api, &name, &mut target, NEWLY_CREATED_YES).await?;
            let created = cm_api
                .create(&PostParams::default(), &empty_config_map(&target_name))
                .await
                .context("failed to create target ConfigMap")?;
            info!(target = %name, config_map = %target_name, "created target ConfigMap");
            created
        }
        Err(e) => {
            return Err(e).with_context(|| format!("error fetching target ConfigMap {target_name}"))
        }
    };

    match MANAGED_BY_MERGE_TARGET.parse_object_name(&config_map) {
        None => {
            annotations::apply(
                &ctx.client,
                &config_map,
                MANAGED_BY_MERGE_TARGET.set(name.to_string()),
            )
            .await
            .context("error setting managed-by annotation on target ConfigMap")?;
            // The annotation write re-enqueues this target through the watch.
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        Some(owner) if owner == name => {}
        Some(owner) => {
            publish_condition(
                &api,
                &name,
                &mut target,
                conditions::merge_target_misconfigured(&owner),
            )
            .await?;
            return Err(MisconfiguredTargetError {
                config_map: target_name,
                owner,
            }
            .into());
        }
    }

    // A target that is also a source would overwrite its own input.
    if WATCHED_BY_MERGE_SOURCE.get(&config_map).is_some() {
        publish_condition(
            &api,
            &name,
            &mut target,
            conditions::merge_target_self_referential(&target_name),
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(RESYNC_DURATION_SECS)));
    }

    // Snapshot per-key initial state before reducing. Persisted immediately
    // so a crash between stages cannot lose the revert information.
    let mut status = target.status.take().unwrap_or_default();
    let empty = BTreeMap::new();
    status.update_data_status(&target.spec.data, config_map.data.as_ref().unwrap_or(&empty));
    patch_status(
        &api,
        &name,
        json!({ "newlyCreated": status.newly_created, "data": status.data }),
    )
    .await
    .context("failed updating MergeTarget data status")?;

    let sources = ctx.stores.merge_sources_targeting(&name);
    let mut data = config_map.data.clone().unwrap_or_default();
    let outcome = status.reduce_data_state(&target.spec.data, &sources, &mut data);

    metrics::record_num_sources(KIND_MERGE_TARGET, &name.namespace, &name.name, sources.len());
    info!(
        target = %name,
        num_merge_sources = sources.len(),
        num_updated_keys = outcome.updated_keys,
        errors_on_fields = outcome.validation_errors.len(),
        "found and merged sources"
    );

    let validation = conditions::merge_target_validation(&outcome.validation_errors, sources.len());
    metrics::record_condition(KIND_MERGE_TARGET, &name.namespace, &name.name, &validation);
    set_condition(&mut status.conditions, validation);
    patch_status(&api, &name, json!({ "conditions": status.conditions })).await?;

    if outcome.updated_keys > 0 {
        let mut updated = config_map.clone();
        updated.data = Some(data);
        if let Err(err) = cm_api
            .replace(&target_name.name, &PostParams::default(), &updated)
            .await
        {
            set_condition(
                &mut status.conditions,
                conditions::merge_target_error_updating(&err, outcome.updated_keys),
            );
            patch_status(&api, &name, json!({ "conditions": status.conditions })).await?;
            metrics::record_ready_condition(
                KIND_MERGE_TARGET,
                &name.namespace,
                &name.name,
                &status.conditions,
            );
            return Err(err).context("failed updating target ConfigMap");
        }
    }

    // Retired keys are pruned only once the write landed; pruning earlier
    // would lose the revert state on a failed write.
    if !outcome.retired_keys.is_empty() {
        status.remove_data_status_keys(&outcome.retired_keys);
        let mut pruned = serde_json::Map::new();
        for key in &outcome.retired_keys {
            pruned.insert(key.clone(), Value::Null);
        }
        patch_status(&api, &name, json!({ "data": pruned })).await?;
    }

    set_condition(
        &mut status.conditions,
        conditions::merge_target_ready(!outcome.validation_errors.is_empty()),
    );
    patch_status(&api, &name, json!({ "conditions": status.conditions })).await?;
    metrics::record_ready_condition(
        KIND_MERGE_TARGET,
        &name.namespace,
        &name.name,
        &status.conditions,
    );

    Ok(Action::requeue(Duration::from_secs(RESYNC_DURATION_SECS)))
}

/// Latch `status.newlyCreated`: set once, never overwritten.
async fn maybe_set_newly_created(
    api: &Api<MergeTarget>,
    name: &NamespacedName,
    target: &mut MergeTarget,
    to: &str,
) -> Result<()> {
    let status = target.status.get_or_insert_with(MergeTargetStatus::default);
    if !status.newly_created.is_empty() {
        return Ok(());
    }
    status.newly_created = to.to_string();
    patch_status(api, name, json!({ "newlyCreated": to }))
        .await
        .context("failed recording newlyCreated status")
}

/// Set one condition on the local copy and persist the condition list.
async fn publish_condition(
    api: &Api<MergeTarget>,
    name: &NamespacedName,
    target: &mut MergeTarget,
    condition: Condition,
) -> Result<()> {
    metrics::record_condition(KIND_MERGE_TARGET, &name.namespace, &name.name, &condition);
    let status = target.status.get_or_insert_with(MergeTargetStatus::default);
    set_condition(&mut status.conditions, condition);
    patch_status(api, name, json!({ "conditions": status.conditions })).await
}

/// Merge-patch the status subresource.
async fn patch_status(api: &Api<MergeTarget>, name: &NamespacedName, status: Value) -> Result<()> {
    api.patch_status(
        &name.name,
        &PatchParams::default(),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await
    .with_context(|| format!("error updating status of MergeTarget {name}"))?;
    Ok(())
}

/// Undo management of the target ConfigMap.
///
/// A ConfigMap the controller created is deleted outright. A pre-existing
/// one gets every managed key restored to its recorded init (or removed when
/// the controller introduced the key) and the managed-by annotation cleared.
async fn finalize_deletion(
    client: &Client,
    target: &MergeTarget,
    target_name: &NamespacedName,
) -> Result<()> {
    let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), &target_name.namespace);
    let mut cm = match cm_api.get(&target_name.name).await {
        Ok(cm) => cm,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => return Err(e).context("error fetching target ConfigMap during deletion"),
    };

    if target.is_newly_created() {
        cm_api
            .delete(&target_name.name, &DeleteParams::default())
            .await
            .context("error deleting target ConfigMap")?;
        info!(config_map = %target_name, "deleted controller-created target ConfigMap");
        return Ok(());
    }

    let status = target.status.clone().unwrap_or_default();
    let mut data = cm.data.take().unwrap_or_default();
    for (key, state) in &status.data {
        if state.is_newly_created() {
            data.remove(key);
        } else {
            data.insert(key.clone(), state.init.clone());
        }
    }
    cm.data = Some(data);

    let mut annotations_map = cm.metadata.annotations.take().unwrap_or_default();
    MANAGED_BY_MERGE_TARGET.remove()(&mut annotations_map);
    cm.metadata.annotations = if annotations_map.is_empty() {
        None
    } else {
        Some(annotations_map)
    };

    cm_api
        .replace(&target_name.name, &PostParams::default(), &cm)
        .await
        .with_context(|| format!("error reverting fields of target ConfigMap {target_name}"))?;
    info!(config_map = %target_name, "reverted managed keys on pre-existing target ConfigMap");
    Ok(())
}

fn empty_config_map(name: &NamespacedName) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.name.clone()),
            namespace: Some(name.namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
#[path = "merge_target_tests.rs"]
mod merge_target_tests;
