// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Unit tests for the reflector store lookups.

use super::*;
use crate::constants::WATCHED_BY_ANNOTATION;
use crate::crd::{MergeSourceSpec, MergeSourceTargetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector;
use kube::runtime::watcher::Event;

fn merge_source(namespace: &str, name: &str, target: &str) -> MergeSource {
    let mut ms = MergeSource::new(
        name,
        MergeSourceSpec {
            target: MergeSourceTargetSpec {
                name: target.to_string(),
                data: "k".to_string(),
            },
            ..Default::default()
        },
    );
    ms.metadata.namespace = Some(namespace.to_string());
    ms
}

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

fn stores(sources: Vec<MergeSource>, config_maps: Vec<ConfigMap>) -> Stores {
    let (source_reader, mut source_writer) = reflector::store();
    for source in sources {
        source_writer.apply_watcher_event(&Event::Apply(source));
    }

    let (cm_reader, mut cm_writer) = reflector::store();
    for cm in config_maps {
        cm_writer.apply_watcher_event(&Event::Apply(cm));
    }

    Stores {
        config_maps: cm_reader,
        merge_sources: source_reader,
    }
}

#[test]
fn test_merge_sources_targeting_filters_by_resolved_target() {
    let stores = stores(
        vec![
            merge_source("default", "a", "default/target"),
            merge_source("default", "b", "other/target"),
            merge_source("tenant", "c", "default/target"),
            // Unqualified references never resolve, even from the target's
            // own namespace.
            merge_source("default", "d", "target"),
        ],
        vec![],
    );

    let target = NamespacedName::new("default", "target");
    let matched = stores.merge_sources_targeting(&target);

    let names: Vec<NamespacedName> = matched
        .iter()
        .map(|s| NamespacedName::from_object(s.as_ref()))
        .collect();
    assert_eq!(
        names,
        vec![
            NamespacedName::new("default", "a"),
            NamespacedName::new("tenant", "c"),
        ]
    );
}

#[test]
fn test_merge_sources_targeting_sorts_by_namespace_then_name() {
    let stores = stores(
        vec![
            merge_source("zeta", "a", "default/target"),
            merge_source("alpha", "z", "default/target"),
            merge_source("alpha", "a", "default/target"),
        ],
        vec![],
    );

    let matched = stores.merge_sources_targeting(&NamespacedName::new("default", "target"));
    let names: Vec<NamespacedName> = matched
        .iter()
        .map(|s| NamespacedName::from_object(s.as_ref()))
        .collect();
    assert_eq!(
        names,
        vec![
            NamespacedName::new("alpha", "a"),
            NamespacedName::new("alpha", "z"),
            NamespacedName::new("zeta", "a"),
        ]
    );
}

#[test]
fn test_merge_sources_targeting_skips_unresolvable_targets() {
    let stores = stores(vec![merge_source("default", "broken", "a/b/c")], vec![]);
    let matched = stores.merge_sources_targeting(&NamespacedName::new("default", "target"));
    assert!(matched.is_empty());
}

#[test]
fn test_config_maps_watched_by_matches_list_membership() {
    let stores = stores(
        vec![],
        vec![
            config_map("default", "cm-1", Some("default/src-a,default/src-b")),
            config_map("default", "cm-2", Some("default/src-b")),
            config_map("default", "cm-3", None),
        ],
    );

    let watched = stores.config_maps_watched_by(&NamespacedName::new("default", "src-a"));
    assert_eq!(watched.len(), 1);
    assert_eq!(
        NamespacedName::from_object(watched[0].as_ref()),
        NamespacedName::new("default", "cm-1")
    );

    let watched = stores.config_maps_watched_by(&NamespacedName::new("default", "src-b"));
    assert_eq!(watched.len(), 2);
}
