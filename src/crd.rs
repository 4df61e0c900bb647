// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Custom Resource Definitions for the ConfigMap Merge Controller.
//!
//! Two resources drive everything:
//!
//! - [`MergeSource`] declares *what to read* (a data key from ConfigMaps
//!   matched by label selectors) and *where to send* the accumulated
//!   fragment (a `MergeTarget` key).
//! - [`MergeTarget`] declares *which ConfigMap* to assemble, which data keys
//!   it manages, their initial values and optional JSON Schemas.
//!
//! Besides the schemas, this module carries the pure state machine of the
//! merge: snapshotting per-key initial state ([`MergeTargetStatus::update_data_status`])
//! and reducing source outputs into the target's data
//! ([`MergeTargetStatus::reduce_data_state`]). Both are plain functions over
//! maps so the takeover, revert, and validation behavior is testable without
//! a cluster.

use crate::names::{NameError, NamespacedName};
use crate::validator;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `status.newlyCreated` value marking an object or key the controller
/// introduced itself; cleanup deletes it.
pub const NEWLY_CREATED_YES: &str = "YES";

/// `status.newlyCreated` value marking an object or key that pre-existed;
/// cleanup restores the recorded initial value.
pub const NEWLY_CREATED_NO: &str = "NO";

/// Condition represents an observation of a resource's current state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// The aspect of the resource being reported, e.g. "Ready".
    pub r#type: String,

    /// "True", "False", or "Unknown".
    pub status: String,

    /// Programmatic identifier explaining the status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable explanation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339 timestamp of the last status change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

// ============================================================================
// MergeSource
// ============================================================================

/// Which data key to read from each matched source ConfigMap.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergeSourceSourceSpec {
    /// The data key observed on every selected ConfigMap.
    #[serde(default)]
    pub data: String,
}

/// Where the accumulated output of a `MergeSource` flows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergeSourceTargetSpec {
    /// The `MergeTarget` to feed. Must be a fully qualified
    /// "namespace/name" reference; the reference is cross-namespace and is
    /// never defaulted to the source's own namespace.
    #[serde(default)]
    pub name: String,

    /// The data key on the `MergeTarget` this source contributes to. The key
    /// must also be present in the target's `spec.data`.
    #[serde(default)]
    pub data: String,
}

/// MergeSourceSpec selects source ConfigMaps, names the data key to
/// aggregate from them, and names the `MergeTarget` key to write to.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "config.cmmc.k8s.cash.app",
    version = "v1beta1",
    kind = "MergeSource",
    namespaced,
    status = "MergeSourceStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MergeSourceSpec {
    /// Labels a source ConfigMap must carry to be selected, cluster-wide.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    /// Labels the source ConfigMap's *namespace* must carry, if non-empty.
    /// Omitted means ConfigMaps from all namespaces are eligible.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_selector: BTreeMap<String, String>,

    /// Which data key to observe on selected ConfigMaps.
    #[serde(default)]
    pub source: MergeSourceSourceSpec,

    /// Where the accumulated data is written.
    #[serde(default)]
    pub target: MergeSourceTargetSpec,
}

/// Observed state of a `MergeSource`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergeSourceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// The concatenation this source currently publishes.
    ///
    /// Always serialized: status writes go out as merge patches, and an
    /// omitted field would leave a stale non-empty output in place.
    #[serde(default)]
    pub output: String,
}

impl MergeSource {
    /// The fully qualified identity of the `MergeTarget` this source feeds.
    ///
    /// The reference is cross-namespace, so no default namespace applies: a
    /// bare name is rejected rather than resolved against the source's own
    /// namespace.
    ///
    /// # Errors
    ///
    /// Returns [`NameError`] when `spec.target.name` is empty, unqualified,
    /// or malformed.
    pub fn namespaced_target_name(&self) -> Result<NamespacedName, NameError> {
        NamespacedName::parse(&self.spec.target.name, "")
    }
}

// ============================================================================
// MergeTarget
// ============================================================================

/// Per-key configuration on a `MergeTarget`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergeTargetDataSpec {
    /// Value the key starts from (and is restored to on cleanup when the
    /// controller introduced the key).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub init: String,

    /// Optional JSON Schema the merged value must conform to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub json_schema: String,
}

/// Recorded per-key state on a `MergeTarget`, written before the controller
/// starts managing the key so cleanup can revert it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergeTargetDataStatus {
    /// The value that existed before the controller began managing the key,
    /// or the configured init if the controller created it. Always
    /// serialized so merge patches can clear it.
    #[serde(default)]
    pub init: String,

    /// "YES" when the controller introduced the key, "NO" when it took over
    /// a pre-existing one.
    #[serde(default)]
    pub newly_created: String,
}

impl MergeTargetDataStatus {
    /// Initial state for a key the controller introduces itself.
    #[must_use]
    pub fn newly_created(init: &str) -> Self {
        Self {
            init: init.to_string(),
            newly_created: NEWLY_CREATED_YES.to_string(),
        }
    }

    /// True when the controller introduced this key.
    #[must_use]
    pub fn is_newly_created(&self) -> bool {
        self.newly_created == NEWLY_CREATED_YES
    }

    /// Copy of this state with `init` refreshed to the currently configured
    /// value. Only keys the controller created track the configured init;
    /// taken-over keys keep the snapshot of what they are restored to.
    #[must_use]
    pub fn with_maybe_updated_init(&self, init: &str) -> Self {
        let mut next = self.clone();
        if self.is_newly_created() && self.init != init {
            next.init = init.to_string();
        }
        next
    }
}

/// MergeTargetSpec names the ConfigMap to assemble and the data keys to
/// manage on it.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "config.cmmc.k8s.cash.app",
    version = "v1beta1",
    kind = "MergeTarget",
    namespaced,
    status = "MergeTargetStatus",
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Validation","type":"string","jsonPath":".status.conditions[?(@.type==\"cmmc/Validation\")].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MergeTargetSpec {
    /// The ConfigMap this target assembles, as "name" (same namespace) or
    /// "namespace/name".
    #[serde(default)]
    pub target: String,

    /// The data keys managed on the target ConfigMap.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, MergeTargetDataSpec>,
}

/// Observed state of a `MergeTarget`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergeTargetStatus {
    /// Whether the controller created the target ConfigMap itself.
    ///
    /// - empty: never resolved the target ConfigMap yet
    /// - "YES": the controller created it (cleanup deletes it)
    /// - "NO": the ConfigMap pre-existed (cleanup reverts managed keys)
    ///
    /// Set once, never overwritten.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub newly_created: String,

    /// Recorded state of every managed data key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, MergeTargetDataStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Counters and per-key errors from one reduction pass.
#[derive(Debug, Default)]
pub struct ReduceOutcome {
    /// Number of target data keys whose value actually changed.
    pub updated_keys: usize,

    /// Keys no longer in the spec whose revert was staged; their status
    /// entries are pruned only once the ConfigMap write succeeds.
    pub retired_keys: Vec<String>,

    /// Per-key validation error messages, each prefixed with the key name.
    pub validation_errors: Vec<String>,
}

impl MergeTarget {
    /// The fully qualified identity of the target ConfigMap.
    ///
    /// # Errors
    ///
    /// Returns [`NameError`] when `spec.target` is empty or malformed.
    pub fn namespaced_target_name(&self) -> Result<NamespacedName, NameError> {
        NamespacedName::parse(&self.spec.target, &self.namespace().unwrap_or_default())
    }

    /// True when the controller created the target ConfigMap itself, which
    /// makes it safe to delete during cleanup.
    #[must_use]
    pub fn is_newly_created(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.newly_created == NEWLY_CREATED_YES)
    }
}

impl MergeTargetStatus {
    /// Snapshot per-key state for every key in the spec.
    ///
    /// For each managed key: an existing status entry is kept (refreshing
    /// `init` for controller-created keys whose configured init changed); a
    /// key already present on the ConfigMap is taken over with its current
    /// value recorded as `init`; anything else is marked newly created.
    ///
    /// This must run before reduction so the target can be deterministically
    /// reverted on key removal or deletion.
    pub fn update_data_status(
        &mut self,
        spec_data: &BTreeMap<String, MergeTargetDataSpec>,
        config_map_data: &BTreeMap<String, String>,
    ) {
        for (key, spec) in spec_data {
            let next = match (self.data.get(key), config_map_data.get(key)) {
                (Some(state), _) => state.with_maybe_updated_init(&spec.init),
                (None, Some(existing)) => MergeTargetDataStatus {
                    init: existing.clone(),
                    newly_created: NEWLY_CREATED_NO.to_string(),
                },
                (None, None) => MergeTargetDataStatus::newly_created(&spec.init),
            };
            self.data.insert(key.clone(), next);
        }
    }

    /// Reduce the outputs of `sources` into `data`, mutating it in place.
    ///
    /// Keys that left the spec are reverted: removed when the controller
    /// created them, otherwise restored to the recorded `init`. Active keys
    /// accumulate `init` followed by the output of every source feeding that
    /// key, in the order given. A key whose accumulated value fails its
    /// schema is left untouched and reported; other keys still update.
    ///
    /// `sources` must already be restricted to this target and sorted by
    /// (namespace, name).
    pub fn reduce_data_state(
        &self,
        spec_data: &BTreeMap<String, MergeTargetDataSpec>,
        sources: &[Arc<MergeSource>],
        data: &mut BTreeMap<String, String>,
    ) -> ReduceOutcome {
        let mut outcome = ReduceOutcome::default();

        for (key, state) in &self.data {
            let Some(spec) = spec_data.get(key) else {
                // Key retired from the spec: stage the revert. The status
                // entry survives until the ConfigMap write succeeds.
                if state.is_newly_created() {
                    if data.remove(key).is_some() {
                        outcome.updated_keys += 1;
                    }
                } else if data.get(key) != Some(&state.init) {
                    data.insert(key.clone(), state.init.clone());
                    outcome.updated_keys += 1;
                }
                outcome.retired_keys.push(key.clone());
                continue;
            };

            let mut value = state.init.clone();
            for source in sources {
                if source.spec.target.data == *key {
                    if let Some(status) = &source.status {
                        value.push_str(&status.output);
                    }
                }
            }

            // N.B. empty values are allowed through without validation.
            if !spec.json_schema.is_empty() && !value.is_empty() {
                if let Err(err) = validator::validate(&spec.json_schema, &value) {
                    outcome.validation_errors.push(format!("{key}: {err}"));
                    continue;
                }
            }

            if data.get(key) != Some(&value) {
                data.insert(key.clone(), value);
                outcome.updated_keys += 1;
            }
        }

        outcome
    }

    /// Drop status entries for retired keys once their revert is persisted.
    pub fn remove_data_status_keys(&mut self, keys: &[String]) {
        for key in keys {
            self.data.remove(key);
        }
    }
}

#[cfg(test)]
#[path = "crd_tests.rs"]
mod crd_tests;
