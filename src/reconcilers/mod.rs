// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation logic for the CMMC custom resources.

pub mod finalizers;
pub mod merge_source;
pub mod merge_target;

pub use merge_source::reconcile_merge_source;
pub use merge_target::reconcile_merge_target;
