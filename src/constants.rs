// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Global constants for the CMMC controller.
//!
//! This module contains the API identifiers, annotation and finalizer strings,
//! and timing constants used throughout the codebase.

// ============================================================================
// API Constants
// ============================================================================

/// API group for the CMMC CRDs
pub const API_GROUP: &str = "config.cmmc.k8s.cash.app";

/// API version for the CMMC CRDs
pub const API_VERSION: &str = "v1beta1";

/// Fully qualified API version (group/version)
pub const API_GROUP_VERSION: &str = "config.cmmc.k8s.cash.app/v1beta1";

/// Kind name for the `MergeSource` resource
pub const KIND_MERGE_SOURCE: &str = "MergeSource";

/// Kind name for the `MergeTarget` resource
pub const KIND_MERGE_TARGET: &str = "MergeTarget";

// ============================================================================
// Annotations
// ============================================================================

/// Annotation on a source ConfigMap holding the comma-separated list of
/// `MergeSource` references ("ns/name,...") currently watching it.
pub const WATCHED_BY_ANNOTATION: &str = "config.cmmc.k8s.cash.app/watched-by-merge-source";

/// Annotation on a target ConfigMap holding the single `MergeTarget` reference
/// that owns it. Ownership is exclusive; a mismatch is a fatal misconfiguration.
pub const MANAGED_BY_ANNOTATION: &str = "config.cmmc.k8s.cash.app/managed-by-merge-target";

// ============================================================================
// Finalizers
// ============================================================================

/// Finalizer for `MergeSource` resources
pub const MERGE_SOURCE_FINALIZER: &str = "config.cmmc.k8s.cash.app/merge-source-finalizer";

/// Finalizer for `MergeTarget` resources
pub const MERGE_TARGET_FINALIZER: &str = "config.cmmc.k8s.cash.app/merge-target-finalizer";

// ============================================================================
// Reconcile Timing
// ============================================================================

/// Steady-state resync interval for both reconcilers (60 seconds)
pub const RESYNC_DURATION_SECS: u64 = 60;

/// Requeue duration for transient reconcile errors (30 seconds)
pub const ERROR_REQUEUE_DURATION_SECS: u64 = 30;

/// Requeue duration after a managed-by ownership conflict. Deliberately slow
/// so a misconfigured target does not hot-loop.
pub const MISCONFIGURED_REQUEUE_DURATION_SECS: u64 = 300;

// ============================================================================
// Server Defaults
// ============================================================================

/// Default bind address for the Prometheus metrics endpoint
pub const DEFAULT_METRICS_BIND_ADDRESS: &str = ":8080";

/// Default bind address for the health probe endpoints
pub const DEFAULT_HEALTH_PROBE_BIND_ADDRESS: &str = ":8081";

/// Path for the Prometheus metrics endpoint
pub const METRICS_SERVER_PATH: &str = "/metrics";

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of worker threads for the Tokio runtime
pub const TOKIO_WORKER_THREADS: usize = 4;

// ============================================================================
// Leader Election Constants
// ============================================================================

/// Lease name used for leader election
pub const LEASE_NAME: &str = "cmmc-leader";

/// Fallback lease namespace when `POD_NAMESPACE` is not set
pub const DEFAULT_LEASE_NAMESPACE: &str = "cmmc-system";

/// Leader election lease duration (15 seconds)
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 15;

/// Leader election lease grace period (5 seconds)
pub const DEFAULT_LEASE_GRACE_SECS: u64 = 5;
