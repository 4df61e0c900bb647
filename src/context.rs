// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Shared reconciler context with reflector stores.
//!
//! Both controllers receive an `Arc<Context>` carrying the Kubernetes client
//! and reflector stores. The stores serve the two reverse lookups the
//! reconcilers need without extra API round-trips: which MergeSources feed a
//! given MergeTarget, and which ConfigMaps still carry a given MergeSource in
//! their watched-by annotation.

use crate::annotations::WATCHED_BY_MERGE_SOURCE;
use crate::crd::MergeSource;
use crate::names::NamespacedName;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::Store;
use kube::Client;
use std::sync::Arc;

/// Shared context passed to both controllers.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client for API operations
    pub client: Client,

    /// Reflector stores for cross-resource lookups
    pub stores: Stores,
}

/// Reflector stores populated by dedicated watcher tasks.
#[derive(Clone)]
pub struct Stores {
    pub config_maps: Store<ConfigMap>,
    pub merge_sources: Store<MergeSource>,
}

impl Stores {
    /// Every MergeSource whose resolved `spec.target.name` is `target`,
    /// sorted by (namespace, name) so output concatenation is stable across
    /// runs.
    #[must_use]
    pub fn merge_sources_targeting(&self, target: &NamespacedName) -> Vec<Arc<MergeSource>> {
        let mut sources: Vec<Arc<MergeSource>> = self
            .merge_sources
            .state()
            .into_iter()
            .filter(|source| {
                source
                    .namespaced_target_name()
                    .is_ok_and(|name| &name == target)
            })
            .collect();
        sources.sort_by_key(|source| NamespacedName::from_object(source.as_ref()));
        sources
    }

    /// Every ConfigMap whose watched-by annotation still names `source`.
    ///
    /// Used to strip stale annotations from ConfigMaps that fell out of the
    /// selection (label change) or whose MergeSource is going away.
    #[must_use]
    pub fn config_maps_watched_by(&self, source: &NamespacedName) -> Vec<Arc<ConfigMap>> {
        self.config_maps
            .state()
            .into_iter()
            .filter(|cm| {
                WATCHED_BY_MERGE_SOURCE
                    .parse_object_names(cm.as_ref())
                    .contains(source)
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
