// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics for the CMMC controller.
//!
//! Two gauge families, both keyed by (kind, namespace, name):
//!
//! - `cmmc_resource_sources` - number of sources feeding a resource
//! - `cmmc_resource_condition` - one series per (type, status) with the
//!   matching status set to 1
//!
//! Metrics are exposed via the `/metrics` endpoint using [`gather_metrics`].

use crate::conditions::{CONDITION_TYPE_READY, STATUS_FALSE, STATUS_TRUE, STATUS_UNKNOWN};
use crate::crd::Condition;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::LazyLock;

/// Global Prometheus metrics registry.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Number of sources per resource.
///
/// For a MergeSource this is the number of selected ConfigMaps, for a
/// MergeTarget the number of MergeSources feeding it.
static RESOURCE_SOURCES: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("cmmc_resource_sources", "Number of sources per resource.");
    let gauge = GaugeVec::new(opts, &["kind", "namespace", "name"]).unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// The current condition of a CMMC resource.
///
/// For each observed condition three series are written (True, False,
/// Unknown), with the matching one set to 1.
static RESOURCE_CONDITION: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "cmmc_resource_condition",
        "The current condition of the CMMC resource.",
    );
    let gauge = GaugeVec::new(opts, &["kind", "namespace", "name", "type", "status"]).unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Record the number of sources feeding a resource.
pub fn record_num_sources(kind: &str, namespace: &str, name: &str, count: usize) {
    #[allow(clippy::cast_precision_loss)]
    RESOURCE_SOURCES
        .with_label_values(&[kind, namespace, name])
        .set(count as f64);
}

/// Record a condition as three (type, status) series.
pub fn record_condition(kind: &str, namespace: &str, name: &str, condition: &Condition) {
    for status in [STATUS_TRUE, STATUS_FALSE, STATUS_UNKNOWN] {
        let value = if condition.status == status { 1.0 } else { 0.0 };
        RESOURCE_CONDITION
            .with_label_values(&[kind, namespace, name, &condition.r#type, status])
            .set(value);
    }
}

/// Record the Ready condition from a resource's condition list.
///
/// A resource with no Ready condition yet reports Unknown.
pub fn record_ready_condition(kind: &str, namespace: &str, name: &str, conditions: &[Condition]) {
    let ready = conditions
        .iter()
        .find(|c| c.r#type == CONDITION_TYPE_READY)
        .cloned()
        .unwrap_or(Condition {
            r#type: CONDITION_TYPE_READY.to_string(),
            status: STATUS_UNKNOWN.to_string(),
            ..Default::default()
        });
    record_condition(kind, namespace, name, &ready);
}

/// Zero out every series for a resource being deleted.
pub fn clear_resource(kind: &str, namespace: &str, name: &str) {
    record_num_sources(kind, namespace, name, 0);
    record_condition(
        kind,
        namespace,
        name,
        &Condition {
            r#type: CONDITION_TYPE_READY.to_string(),
            ..Default::default()
        },
    );
}

/// Gather and encode all metrics in Prometheus text format.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("UTF-8 error: {e}")))
}
