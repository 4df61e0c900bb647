// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Canonical status conditions for CMMC resources.
//!
//! Every condition the controller publishes is constructed here so the
//! `reason` vocabulary stays stable:
//!
//! | Resource    | Type            | Status  | Reason               |
//! |-------------|-----------------|---------|----------------------|
//! | MergeSource | Ready           | True    | `outputAccumulated`  |
//! | MergeTarget | Ready           | False   | `invalidTarget`      |
//! | MergeTarget | Ready           | False   | `misconfiguredTarget`|
//! | MergeTarget | Ready           | False   | `errorUpdating`      |
//! | MergeTarget | Ready           | Unknown | `partialUpdate`      |
//! | MergeTarget | Ready           | True    | `targetUpdated`      |
//! | MergeTarget | cmmc/Validation | True    | `noValidationErrors` |
//! | MergeTarget | cmmc/Validation | False   | `validationErrors`   |

use crate::crd::Condition;
use crate::names::NamespacedName;
use chrono::Utc;
use std::fmt;

/// Primary condition type for both resources.
pub const CONDITION_TYPE_READY: &str = "Ready";

/// Condition type carrying per-key schema validation results.
pub const CONDITION_TYPE_VALIDATION: &str = "cmmc/Validation";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

pub const REASON_OUTPUT_ACCUMULATED: &str = "outputAccumulated";
pub const REASON_INVALID_TARGET: &str = "invalidTarget";
pub const REASON_MISCONFIGURED_TARGET: &str = "misconfiguredTarget";
pub const REASON_ERROR_UPDATING: &str = "errorUpdating";
pub const REASON_PARTIAL_UPDATE: &str = "partialUpdate";
pub const REASON_TARGET_UPDATED: &str = "targetUpdated";
pub const REASON_VALIDATION_ERRORS: &str = "validationErrors";
pub const REASON_NO_VALIDATION_ERRORS: &str = "noValidationErrors";

fn new_condition(r#type: &str, status: &str, reason: &str, message: String) -> Condition {
    Condition {
        r#type: r#type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message),
        last_transition_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Ready condition after a MergeSource accumulated its output.
#[must_use]
pub fn merge_source_ready(num_sources: usize) -> Condition {
    new_condition(
        CONDITION_TYPE_READY,
        STATUS_TRUE,
        REASON_OUTPUT_ACCUMULATED,
        format!("Data from {num_sources} ConfigMap(s) accumulated."),
    )
}

/// Ready condition when `spec.target` does not parse.
#[must_use]
pub fn merge_target_invalid_target(err: &dyn fmt::Display) -> Condition {
    new_condition(
        CONDITION_TYPE_READY,
        STATUS_FALSE,
        REASON_INVALID_TARGET,
        format!("Invalid spec.target: {err}"),
    )
}

/// Ready condition when the target ConfigMap is owned by another MergeTarget.
#[must_use]
pub fn merge_target_misconfigured(owner: &NamespacedName) -> Condition {
    new_condition(
        CONDITION_TYPE_READY,
        STATUS_FALSE,
        REASON_MISCONFIGURED_TARGET,
        format!("Target ConfigMap is already managed by {owner}."),
    )
}

/// Ready condition when writing the target ConfigMap failed.
#[must_use]
pub fn merge_target_error_updating(err: &dyn fmt::Display, num_updated_keys: usize) -> Condition {
    new_condition(
        CONDITION_TYPE_READY,
        STATUS_FALSE,
        REASON_ERROR_UPDATING,
        format!("Failed to update {num_updated_keys} keys in target ConfigMap: {err}"),
    )
}

/// Ready condition when the write landed but some keys failed validation.
#[must_use]
pub fn merge_target_partial_update() -> Condition {
    new_condition(
        CONDITION_TYPE_READY,
        STATUS_UNKNOWN,
        REASON_PARTIAL_UPDATE,
        "Target possibly partially updated. See validation condition for errors.".to_string(),
    )
}

/// Ready condition when the target ConfigMap is fully up to date.
#[must_use]
pub fn merge_target_updated() -> Condition {
    new_condition(
        CONDITION_TYPE_READY,
        STATUS_TRUE,
        REASON_TARGET_UPDATED,
        "Target ConfigMap up to date.".to_string(),
    )
}

/// Ready condition after reduction: `targetUpdated` or `partialUpdate`.
#[must_use]
pub fn merge_target_ready(has_errors: bool) -> Condition {
    if has_errors {
        merge_target_partial_update()
    } else {
        merge_target_updated()
    }
}

/// Validation condition summarizing a reduction pass.
#[must_use]
pub fn merge_target_validation(errors: &[String], num_sources: usize) -> Condition {
    if errors.is_empty() {
        new_condition(
            CONDITION_TYPE_VALIDATION,
            STATUS_TRUE,
            REASON_NO_VALIDATION_ERRORS,
            format!("{num_sources} MergeSources reporting valid data."),
        )
    } else {
        new_condition(
            CONDITION_TYPE_VALIDATION,
            STATUS_FALSE,
            REASON_VALIDATION_ERRORS,
            format!(
                "{num_sources} MergeSources reporting validation errors: [{}]",
                errors.join("; ")
            ),
        )
    }
}

/// Validation condition when the target ConfigMap is itself a merge source.
///
/// Writing the target would overwrite the controller's own input, so the
/// reduction refuses to run instead of converging to garbage.
#[must_use]
pub fn merge_target_self_referential(target: &NamespacedName) -> Condition {
    new_condition(
        CONDITION_TYPE_VALIDATION,
        STATUS_FALSE,
        REASON_VALIDATION_ERRORS,
        format!("Target ConfigMap {target} is itself watched as a merge source; refusing to merge."),
    )
}

/// Upsert a condition by type.
///
/// The transition timestamp is preserved when the status value did not
/// change, so `lastTransitionTime` reflects actual transitions rather than
/// reconcile cadence.
pub fn set_condition(conditions: &mut Vec<Condition>, mut next: Condition) {
    match conditions.iter_mut().find(|c| c.r#type == next.r#type) {
        Some(existing) => {
            if existing.status == next.status {
                next.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = next;
        }
        None => conditions.push(next),
    }
}

/// Find a condition by type.
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

#[cfg(test)]
#[path = "conditions_tests.rs"]
mod conditions_tests;
