// Copyright (c) 2025 Square, Inc
// SPDX-License-Identifier: Apache-2.0

//! CRD YAML Generator
//!
//! Generates the Kubernetes CRD YAML manifests from the Rust types defined in
//! src/crd.rs, so the files in deploy/crds/ are always in sync with the code.
//!
//! Usage:
//!   cargo run --bin crdgen

use cmmc::crd::{MergeSource, MergeTarget};
use kube::CustomResourceExt;
use std::fs;
use std::path::Path;

const HEADER: &str = "# Copyright (c) 2025 Square, Inc
# SPDX-License-Identifier: Apache-2.0
#
# This file is AUTO-GENERATED from src/crd.rs
# DO NOT EDIT MANUALLY - Run `cargo run --bin crdgen` to regenerate
#
";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = Path::new("deploy/crds");
    fs::create_dir_all(output_dir)?;

    println!("Generating CRD YAML files from src/crd.rs...");

    generate_crd::<MergeSource>("mergesources.crd.yaml", output_dir)?;
    generate_crd::<MergeTarget>("mergetargets.crd.yaml", output_dir)?;

    println!("Generated CRD YAML files in deploy/crds/");
    println!("Deploy with: kubectl apply -f deploy/crds/");

    Ok(())
}

fn generate_crd<T>(filename: &str, output_dir: &Path) -> Result<(), Box<dyn std::error::Error>>
where
    T: CustomResourceExt,
{
    let crd = T::crd();
    let yaml = serde_yaml::to_string(&crd)?;

    let output_path = output_dir.join(filename);
    fs::write(&output_path, format!("{HEADER}{yaml}"))?;

    println!("  wrote {filename}");
    Ok(())
}
