// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Container recipe generation
//!
//! The recipe is produced by substituting the request and static
//! configuration into a fixed multi-stage definition. Given the same inputs
//! the output is byte-stable, so its digest doubles as a fingerprint for
//! backend-side job deduplication.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{config::RecipeSettings, environment::Definition};

const TEMPLATE: &str = include_str!("../templates/singularity.def");

/// Expand the recipe template for the given definition
pub fn generate(definition: &Definition, settings: &RecipeSettings) -> Result<String, Error> {
    let required = [
        ("recipe.binary_cache", &settings.binary_cache),
        ("recipe.repo_url", &settings.repo_url),
        ("recipe.repo_ref", &settings.repo_ref),
        ("recipe.processor_target", &settings.processor_target),
        ("recipe.build_image", &settings.build_image),
        ("recipe.final_image", &settings.final_image),
    ];
    if let Some((field, _)) = required.iter().find(|(_, value)| value.is_empty()) {
        return Err(Error::EmptyField(field));
    }

    let packages = definition
        .packages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");

    Ok(TEMPLATE
        .replace("@build_image@", &settings.build_image)
        .replace("@final_image@", &settings.final_image)
        .replace("@repo_url@", &settings.repo_url)
        .replace("@repo_ref@", &settings.repo_ref)
        .replace("@binary_cache@", &settings.binary_cache)
        .replace("@processor_target@", &settings.processor_target)
        .replace("@packages@", &packages))
}

/// Uppercase hex SHA-256 of the rendered recipe
pub fn fingerprint(recipe: &str) -> String {
    hex::encode_upper(Sha256::digest(recipe.as_bytes()))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("config field {0} is empty")]
    EmptyField(&'static str),
}
