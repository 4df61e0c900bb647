// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Unit tests for the MergeSource watch mapper and selector helpers.

use super::*;
use crate::constants::WATCHED_BY_ANNOTATION;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn config_map(namespace: &str, name: &str, watched_by: Option<&str>) -> ConfigMap {
    let annotations = watched_by.map(|value| {
        [(WATCHED_BY_ANNOTATION.to_string(), value.to_string())]
            .into_iter()
            .collect()
    });
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn test_mapper_enqueues_every_watching_merge_source() {
    let cm = config_map(
        "default",
        "test-cm-1",
        Some("default/map-roles-source,default/map-users-source"),
    );

    let refs = watched_by_merge_sources(cm);
    assert_eq!(refs.len(), 2);
    assert_eq!(refs[0], ObjectRef::new("map-roles-source").within("default"));
    assert_eq!(refs[1], ObjectRef::new("map-users-source").within("default"));
}

#[test]
fn test_mapper_ignores_unannotated_config_map() {
    let cm = config_map("default", "irrelevant", None);
    assert!(watched_by_merge_sources(cm).is_empty());
}

#[test]
fn test_mapper_skips_malformed_entries() {
    let cm = config_map("default", "cm", Some("not-qualified,default/good"));
    let refs = watched_by_merge_sources(cm);
    assert_eq!(refs, vec![ObjectRef::new("good").within("default")]);
}

#[tokio::test]
async fn test_empty_selector_selects_no_config_maps() {
    // An empty selector must yield an empty selection, not a cluster-wide
    // list. The guard returns before any API call, so a client pointing at
    // nothing is fine.
    let config = kube::Config::new("http://127.0.0.1:8080".parse().unwrap());
    let client = Client::try_from(config).unwrap();

    let mut source = MergeSource::new("src", crate::crd::MergeSourceSpec::default());
    source.metadata.namespace = Some("default".to_string());

    let selection = selected_config_maps(&client, &source).await.unwrap();
    assert!(selection.is_empty());
}

#[test]
fn test_label_selector_renders_sorted_pairs() {
    let labels: BTreeMap<String, String> = [
        ("test-label".to_string(), "for-this-source".to_string()),
        ("app".to_string(), "aws-auth".to_string()),
    ]
    .into_iter()
    .collect();

    assert_eq!(
        label_selector(&labels),
        "app=aws-auth,test-label=for-this-source"
    );
}

#[test]
fn test_label_selector_single_pair() {
    let labels: BTreeMap<String, String> =
        [("test-label".to_string(), "for-this-source".to_string())]
            .into_iter()
            .collect();
    assert_eq!(label_selector(&labels), "test-label=for-this-source");
}
