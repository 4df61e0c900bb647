// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! # CMMC - ConfigMap Merge Controller
//!
//! CMMC aggregates fragments of textual configuration scattered across many
//! ConfigMaps in many namespaces into a single, validated target ConfigMap.
//! Platform teams hand out narrow write permissions to tenants - each tenant
//! owns a source ConfigMap carrying only its fragment - while a single,
//! cluster-critical ConfigMap (e.g. `aws-auth`) remains centrally assembled.
//!
//! ## Overview
//!
//! Two custom resources drive everything:
//!
//! - [`crd::MergeSource`] selects source ConfigMaps by labels, reads one data
//!   key from each, and publishes the concatenation on its status.
//! - [`crd::MergeTarget`] owns one target ConfigMap, reduces all MergeSource
//!   outputs into its managed data keys, validates each key against an
//!   optional JSON Schema, and can revert everything on deletion.
//!
//! Data flows one way at steady state: source ConfigMap change -> MergeSource
//! reconcile -> `status.output` updated -> MergeTarget reconcile -> target
//! ConfigMap updated. Control flows the other way via watches.
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definitions and the pure merge state machine
//! - [`reconcilers`] - Reconciliation logic for both resources
//! - [`annotations`] - Ownership annotations on ConfigMaps
//! - [`conditions`] - Canonical status conditions with stable reasons
//! - [`validator`] - YAML-to-JSON Schema validation
//! - [`metrics`] - Prometheus gauges for sources and conditions
//! - [`context`] - Shared client + reflector stores

pub mod annotations;
pub mod conditions;
pub mod constants;
pub mod context;
pub mod crd;
pub mod metrics;
pub mod names;
pub mod reconcilers;
pub mod validator;
