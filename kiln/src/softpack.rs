// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Concretized-lockfile digest and its softpack-YAML rendering
//!
//! The build leaves behind a concretized lockfile; the catalog wants a small
//! YAML document listing the description and the resolved root packages.
//! The YAML literal shape is part of the wire contract, so it is assembled
//! by hand rather than through a serializer.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

/// Parsed shape of a concretized lockfile
#[derive(Debug, Deserialize)]
pub struct Lock {
    pub roots: Vec<Root>,
    pub concrete_specs: HashMap<String, ConcreteSpec>,
}

#[derive(Debug, Deserialize)]
pub struct Root {
    pub hash: String,
    pub spec: String,
}

#[derive(Debug, Deserialize)]
pub struct ConcreteSpec {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl Lock {
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Render the softpack YAML document for a lock and its request description
///
/// Packages are listed in the lock's root order; every root hash must
/// resolve in the concrete-specs table.
pub fn render(lock: &Lock, description: &str) -> Result<String, Error> {
    let mut packages = Vec::with_capacity(lock.roots.len());

    for root in &lock.roots {
        let spec = lock.concrete_specs.get(&root.hash).ok_or_else(|| Error::UnresolvedRoot {
            hash: root.hash.clone(),
            spec: root.spec.clone(),
        })?;

        packages.push(if spec.version.is_empty() {
            spec.name.clone()
        } else {
            format!("{}@{}", spec.name, spec.version)
        });
    }

    let mut out = String::from("description: |\n");
    for line in description.lines() {
        out.push_str("  ");
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("packages:\n");
    for package in &packages {
        out.push_str("  - ");
        out.push_str(package);
        out.push('\n');
    }

    Ok(out)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed lockfile")]
    Json(#[from] serde_json::Error),
    #[error("root {spec:?} ({hash}) has no concrete spec")]
    UnresolvedRoot { hash: String, spec: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCK: &str = r#"{
        "roots": [
            {"hash": "aaa", "spec": "xxhash@0.8.1"},
            {"hash": "bbb", "spec": "py-anndata@3.14"},
            {"hash": "ccc", "spec": "r-seurat@4"}
        ],
        "concrete_specs": {
            "bbb": {"name": "py-anndata", "version": "3.14"},
            "ccc": {"name": "r-seurat", "version": "4.1.3"},
            "aaa": {"name": "xxhash", "version": "0.8.1"},
            "ddd": {"name": "zlib", "version": "1.2.13"}
        }
    }"#;

    #[test]
    fn packages_follow_root_order() {
        let lock = Lock::parse(LOCK.as_bytes()).unwrap();
        let yaml = render(&lock, "some help text").unwrap();

        assert_eq!(
            yaml,
            "description: |\n  some help text\npackages:\n  - xxhash@0.8.1\n  - py-anndata@3.14\n  - r-seurat@4.1.3\n"
        );
    }

    #[test]
    fn multiline_description_is_indented() {
        let lock = Lock::parse(LOCK.as_bytes()).unwrap();
        let yaml = render(&lock, "line one\nline two").unwrap();

        assert!(yaml.starts_with("description: |\n  line one\n  line two\npackages:\n"));
    }

    #[test]
    fn versionless_spec_has_no_at() {
        let lock = Lock::parse(
            br#"{
                "roots": [{"hash": "aaa", "spec": "xxhash"}],
                "concrete_specs": {"aaa": {"name": "xxhash"}}
            }"#,
        )
        .unwrap();

        let yaml = render(&lock, "").unwrap();

        assert_eq!(yaml, "description: |\npackages:\n  - xxhash\n");
    }

    #[test]
    fn unresolved_root_is_rejected() {
        let lock = Lock::parse(
            br#"{
                "roots": [{"hash": "zzz", "spec": "ghost@1"}],
                "concrete_specs": {}
            }"#,
        )
        .unwrap();

        assert!(matches!(
            render(&lock, "whatever"),
            Err(Error::UnresolvedRoot { hash, .. }) if hash == "zzz"
        ));
    }

    #[test]
    fn garbage_is_rejected_at_parse() {
        assert!(matches!(Lock::parse(b"not json"), Err(Error::Json(_))));
        assert!(matches!(Lock::parse(br#"{"roots": 3}"#), Err(Error::Json(_))));
    }
}
