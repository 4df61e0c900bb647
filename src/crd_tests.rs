// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Unit tests for the merge state machine on the CRD types.

use super::*;

fn data_spec(init: &str, json_schema: &str) -> MergeTargetDataSpec {
    MergeTargetDataSpec {
        init: init.to_string(),
        json_schema: json_schema.to_string(),
    }
}

fn spec_data(entries: &[(&str, MergeTargetDataSpec)]) -> BTreeMap<String, MergeTargetDataSpec> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn config_map_data(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn source(namespace: &str, name: &str, target_key: &str, output: &str) -> Arc<MergeSource> {
    let mut ms = MergeSource::new(
        name,
        MergeSourceSpec {
            target: MergeSourceTargetSpec {
                name: "default/target".to_string(),
                data: target_key.to_string(),
            },
            ..Default::default()
        },
    );
    ms.metadata.namespace = Some(namespace.to_string());
    ms.status = Some(MergeSourceStatus {
        output: output.to_string(),
        ..Default::default()
    });
    Arc::new(ms)
}

// ============================================================================
// update_data_status
// ============================================================================

#[test]
fn test_update_data_status_new_key_is_newly_created() {
    let mut status = MergeTargetStatus::default();
    status.update_data_status(
        &spec_data(&[("mapRoles", data_spec("", ""))]),
        &BTreeMap::new(),
    );

    assert_eq!(
        status.data.get("mapRoles").unwrap(),
        &MergeTargetDataStatus::newly_created("")
    );
}

#[test]
fn test_update_data_status_takes_over_existing_key() {
    let mut status = MergeTargetStatus::default();
    status.update_data_status(
        &spec_data(&[("k", data_spec("", ""))]),
        &config_map_data(&[("k", "pre")]),
    );

    let state = status.data.get("k").unwrap();
    assert_eq!(state.init, "pre");
    assert_eq!(state.newly_created, NEWLY_CREATED_NO);
    assert!(!state.is_newly_created());
}

#[test]
fn test_update_data_status_keeps_existing_state_over_data() {
    let mut status = MergeTargetStatus::default();
    status.data.insert(
        "k".to_string(),
        MergeTargetDataStatus {
            init: "pre".to_string(),
            newly_created: NEWLY_CREATED_NO.to_string(),
        },
    );

    // The current ConfigMap value is merged output, not the original value;
    // the recorded snapshot must win.
    status.update_data_status(
        &spec_data(&[("k", data_spec("", ""))]),
        &config_map_data(&[("k", "pre-and-merged")]),
    );

    assert_eq!(status.data.get("k").unwrap().init, "pre");
}

#[test]
fn test_update_data_status_refreshes_init_for_created_keys() {
    let mut status = MergeTargetStatus::default();
    status
        .data
        .insert("k".to_string(), MergeTargetDataStatus::newly_created("old"));

    status.update_data_status(
        &spec_data(&[("k", data_spec("new", ""))]),
        &config_map_data(&[("k", "old")]),
    );

    assert_eq!(status.data.get("k").unwrap().init, "new");
}

#[test]
fn test_update_data_status_does_not_refresh_init_for_taken_over_keys() {
    let mut status = MergeTargetStatus::default();
    status.data.insert(
        "k".to_string(),
        MergeTargetDataStatus {
            init: "pre".to_string(),
            newly_created: NEWLY_CREATED_NO.to_string(),
        },
    );

    status.update_data_status(
        &spec_data(&[("k", data_spec("configured", ""))]),
        &config_map_data(&[("k", "pre")]),
    );

    assert_eq!(status.data.get("k").unwrap().init, "pre");
}

// ============================================================================
// reduce_data_state
// ============================================================================

#[test]
fn test_reduce_accumulates_sources_in_given_order() {
    let mut status = MergeTargetStatus::default();
    let spec = spec_data(&[("k", data_spec("init:", ""))]);
    status.update_data_status(&spec, &BTreeMap::new());

    let sources = vec![
        source("a", "one", "k", "A"),
        source("b", "two", "k", "B"),
    ];

    let mut data = BTreeMap::new();
    let outcome = status.reduce_data_state(&spec, &sources, &mut data);

    assert_eq!(data.get("k").unwrap(), "init:AB");
    assert_eq!(outcome.updated_keys, 1);
    assert!(outcome.validation_errors.is_empty());
    assert!(outcome.retired_keys.is_empty());
}

#[test]
fn test_reduce_ignores_sources_for_other_keys() {
    let mut status = MergeTargetStatus::default();
    let spec = spec_data(&[("mapRoles", data_spec("", "")), ("mapUsers", data_spec("", ""))]);
    status.update_data_status(&spec, &BTreeMap::new());

    let sources = vec![
        source("default", "map-roles-source", "mapRoles", "A"),
        source("default", "map-users-source", "mapUsers", "B"),
    ];

    let mut data = BTreeMap::new();
    status.reduce_data_state(&spec, &sources, &mut data);

    assert_eq!(data.get("mapRoles").unwrap(), "A");
    assert_eq!(data.get("mapUsers").unwrap(), "B");
}

#[test]
fn test_reduce_unchanged_value_counts_no_update() {
    let mut status = MergeTargetStatus::default();
    let spec = spec_data(&[("k", data_spec("", ""))]);
    status.update_data_status(&spec, &BTreeMap::new());

    let sources = vec![source("default", "s", "k", "A")];
    let mut data = config_map_data(&[("k", "A")]);
    let outcome = status.reduce_data_state(&spec, &sources, &mut data);

    assert_eq!(outcome.updated_keys, 0);
}

#[test]
fn test_reduce_is_idempotent() {
    let mut status = MergeTargetStatus::default();
    let spec = spec_data(&[("k", data_spec("init:", ""))]);
    status.update_data_status(&spec, &BTreeMap::new());

    let sources = vec![source("default", "s", "k", "A")];
    let mut data = BTreeMap::new();

    let first = status.reduce_data_state(&spec, &sources, &mut data);
    let after_first = data.clone();
    let second = status.reduce_data_state(&spec, &sources, &mut data);

    assert_eq!(first.updated_keys, 1);
    assert_eq!(second.updated_keys, 0);
    assert_eq!(data, after_first);
}

#[test]
fn test_reduce_retired_created_key_is_removed() {
    let mut status = MergeTargetStatus::default();
    status
        .data
        .insert("gone".to_string(), MergeTargetDataStatus::newly_created(""));

    let mut data = config_map_data(&[("gone", "merged")]);
    let outcome = status.reduce_data_state(&BTreeMap::new(), &[], &mut data);

    assert!(!data.contains_key("gone"));
    assert_eq!(outcome.updated_keys, 1);
    assert_eq!(outcome.retired_keys, vec!["gone".to_string()]);
    // Pruning the status entry is the caller's job, after the write lands.
    assert!(status.data.contains_key("gone"));
}

#[test]
fn test_reduce_retired_taken_over_key_restores_init() {
    let mut status = MergeTargetStatus::default();
    status.data.insert(
        "k".to_string(),
        MergeTargetDataStatus {
            init: "pre".to_string(),
            newly_created: NEWLY_CREATED_NO.to_string(),
        },
    );

    let mut data = config_map_data(&[("k", "merged")]);
    let outcome = status.reduce_data_state(&BTreeMap::new(), &[], &mut data);

    assert_eq!(data.get("k").unwrap(), "pre");
    assert_eq!(outcome.updated_keys, 1);
    assert_eq!(outcome.retired_keys, vec!["k".to_string()]);
}

#[test]
fn test_reduce_retired_key_already_reverted_counts_no_update() {
    let mut status = MergeTargetStatus::default();
    status
        .data
        .insert("gone".to_string(), MergeTargetDataStatus::newly_created(""));

    let mut data = BTreeMap::new();
    let outcome = status.reduce_data_state(&BTreeMap::new(), &[], &mut data);

    assert_eq!(outcome.updated_keys, 0);
    assert_eq!(outcome.retired_keys, vec!["gone".to_string()]);
}

#[test]
fn test_reduce_validation_failure_isolates_one_key() {
    let schema = r#"{"type":"array","items":{"type":"object","properties":{"rolearn":{"type":"string","pattern":"^arn:aws:iam::\\d+:role/.+"}},"required":["rolearn"]}}"#;

    let mut status = MergeTargetStatus::default();
    let spec = spec_data(&[
        ("mapRoles", data_spec("", schema)),
        ("mapUsers", data_spec("", "")),
    ]);
    status.update_data_status(&spec, &BTreeMap::new());

    let sources = vec![
        source(
            "default",
            "bad",
            "mapRoles",
            "- rolearn: banana\n  username: x\n  groups: [g]\n",
        ),
        source("default", "good", "mapUsers", "- userarn: x\n"),
    ];

    let mut data = config_map_data(&[("mapRoles", "untouched")]);
    let outcome = status.reduce_data_state(&spec, &sources, &mut data);

    assert_eq!(outcome.validation_errors.len(), 1);
    assert!(outcome.validation_errors[0].starts_with("mapRoles: "));
    // The failing key keeps its prior value; the other key still updates.
    assert_eq!(data.get("mapRoles").unwrap(), "untouched");
    assert_eq!(data.get("mapUsers").unwrap(), "- userarn: x\n");
    assert_eq!(outcome.updated_keys, 1);
}

#[test]
fn test_reduce_empty_value_skips_validation() {
    let schema = r#"{"type":"array"}"#;

    let mut status = MergeTargetStatus::default();
    let spec = spec_data(&[("k", data_spec("", schema))]);
    status.update_data_status(&spec, &BTreeMap::new());

    let mut data = BTreeMap::new();
    let outcome = status.reduce_data_state(&spec, &[], &mut data);

    assert!(outcome.validation_errors.is_empty());
    assert_eq!(data.get("k").unwrap(), "");
}

#[test]
fn test_remove_data_status_keys() {
    let mut status = MergeTargetStatus::default();
    status
        .data
        .insert("a".to_string(), MergeTargetDataStatus::newly_created(""));
    status
        .data
        .insert("b".to_string(), MergeTargetDataStatus::newly_created(""));

    status.remove_data_status_keys(&["a".to_string()]);

    assert!(!status.data.contains_key("a"));
    assert!(status.data.contains_key("b"));
}

// ============================================================================
// name resolution
// ============================================================================

#[test]
fn test_merge_target_namespaced_target_name_defaults_to_own_namespace() {
    let mut mt = MergeTarget::new(
        "target",
        MergeTargetSpec {
            target: "merge-me".to_string(),
            ..Default::default()
        },
    );
    mt.metadata.namespace = Some("default".to_string());

    assert_eq!(
        mt.namespaced_target_name().unwrap(),
        NamespacedName::new("default", "merge-me")
    );
}

#[test]
fn test_merge_target_invalid_target_name() {
    let mut mt = MergeTarget::new(
        "target",
        MergeTargetSpec {
            target: "a/b/c".to_string(),
            ..Default::default()
        },
    );
    mt.metadata.namespace = Some("default".to_string());

    assert!(mt.namespaced_target_name().is_err());
}

#[test]
fn test_merge_source_target_name_is_cross_namespace() {
    let mut ms = MergeSource::new(
        "src",
        MergeSourceSpec {
            target: MergeSourceTargetSpec {
                name: "other/target".to_string(),
                data: "k".to_string(),
            },
            ..Default::default()
        },
    );
    ms.metadata.namespace = Some("default".to_string());

    assert_eq!(
        ms.namespaced_target_name().unwrap(),
        NamespacedName::new("other", "target")
    );
}

#[test]
fn test_merge_source_target_name_must_be_fully_qualified() {
    // The source's own namespace never qualifies the reference.
    let mut ms = MergeSource::new(
        "src",
        MergeSourceSpec {
            target: MergeSourceTargetSpec {
                name: "target".to_string(),
                data: "k".to_string(),
            },
            ..Default::default()
        },
    );
    ms.metadata.namespace = Some("default".to_string());

    assert_eq!(
        ms.namespaced_target_name(),
        Err(crate::names::NameError::EmptyNamespace)
    );
}

#[test]
fn test_newly_created_flags() {
    let mut mt = MergeTarget::new("target", MergeTargetSpec::default());
    assert!(!mt.is_newly_created());

    mt.status = Some(MergeTargetStatus {
        newly_created: NEWLY_CREATED_YES.to_string(),
        ..Default::default()
    });
    assert!(mt.is_newly_created());
}
