// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The environment request data model
//!
//! A [`Definition`] is the validated form of an incoming build request. Two
//! keys are derived from it: the storage key (`<path>/<name>/<version>`),
//! used as the object-store prefix and for in-flight deduplication, and the
//! catalog key (`<path>/<name>-<version>`), the directory convention used
//! when addressing the artifact-catalog service.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A requested package, by name with an optional version constraint
///
/// An empty version means "latest the solver picks".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl Package {
    pub fn new(name: impl ToString, version: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    /// Parse `name[@version]`
    pub fn parse(input: &str) -> Self {
        match input.split_once('@') {
            Some((name, version)) => Self::new(name, version),
            None => Self::new(input, ""),
        }
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}@{}", self.name, self.version)
        }
    }
}

/// Wire form of a build request as accepted over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Environment name including its path prefix, e.g. `groups/hgi/tools`
    pub name: String,
    pub version: String,
    pub model: Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub packages: Vec<Package>,
}

/// A validated environment definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    /// Path prefix grouping the environment, without leading or trailing slash
    pub path: String,
    pub name: String,
    pub version: String,
    /// Free-text description, possibly multi-line
    pub description: String,
    /// Ordered list of requested packages
    pub packages: Vec<Package>,
}

impl Definition {
    pub fn new(
        full_name: &str,
        version: impl ToString,
        description: impl ToString,
        packages: Vec<Package>,
    ) -> Result<Self, Error> {
        let (path, name) = split_name(full_name)?;

        let definition = Self {
            path,
            name,
            version: version.to_string(),
            description: description.to_string(),
            packages,
        };
        definition.validate()?;

        Ok(definition)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::EmptyName);
        }
        if self.version.is_empty() {
            return Err(Error::EmptyVersion);
        }
        if self.packages.is_empty() {
            return Err(Error::NoPackages);
        }
        if self.packages.iter().any(|package| package.name.is_empty()) {
            return Err(Error::UnnamedPackage);
        }
        Ok(())
    }

    /// Environment name including its path prefix
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.path, self.name)
    }

    /// Object-store prefix and in-flight deduplication key
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.path, self.name, self.version)
    }

    /// Directory convention used by the artifact-catalog service
    pub fn catalog_key(&self) -> String {
        format!("{}/{}-{}", self.path, self.name, self.version)
    }
}

impl TryFrom<Request> for Definition {
    type Error = Error;

    fn try_from(request: Request) -> Result<Self, Error> {
        Definition::new(
            &request.name,
            request.version,
            request.model.description,
            request.model.packages,
        )
    }
}

impl From<&Definition> for Request {
    fn from(definition: &Definition) -> Self {
        Request {
            name: definition.full_name(),
            version: definition.version.clone(),
            model: Model {
                description: definition.description.clone(),
                packages: definition.packages.clone(),
            },
        }
    }
}

/// Split `groups/hgi/tools` into its path prefix and environment name,
/// tolerating stray leading or trailing slashes
pub fn split_name(full_name: &str) -> Result<(String, String), Error> {
    let trimmed = full_name.trim_matches('/');
    let (path, name) = trimmed.rsplit_once('/').ok_or(Error::MissingPath)?;

    if path.is_empty() {
        return Err(Error::MissingPath);
    }

    Ok((path.to_owned(), name.to_owned()))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("environment name is empty")]
    EmptyName,
    #[error("environment name must include a path prefix")]
    MissingPath,
    #[error("environment version is empty")]
    EmptyVersion,
    #[error("environment requests no packages")]
    NoPackages,
    #[error("request contains a package with no name")]
    UnnamedPackage,
}
