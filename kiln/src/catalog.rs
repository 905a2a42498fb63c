// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Client for the artifact-catalog service
//!
//! Two channels: a streaming multipart upload publishing build artifacts
//! under a catalog key, and a set of JSON lifecycle endpoints. Large
//! artifacts (build logs) are streamed so memory use stays bounded.

use std::sync::OnceLock;

use reqwest::{Body, StatusCode, multipart};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::{environment::Definition, store::Blob};

// Fixed basenames of the published artifact set
pub const RECIPE_BASENAME: &str = "singularity.def";
pub const LOCK_BASENAME: &str = "spack.lock";
pub const SOFTPACK_BASENAME: &str = "softpack.yml";
pub const LOG_BASENAME: &str = "builder.out";
pub const MODULE_BASENAME: &str = "module";
pub const README_BASENAME: &str = "README.md";
pub const IMAGE_BASENAME: &str = "singularity.sif";
pub const EXECUTABLES_BASENAME: &str = "executables";

/// Shared client for tcp socket reuse
static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn client() -> &'static reqwest::Client {
    CLIENT.get_or_init(|| {
        reqwest::ClientBuilder::new()
            .referer(false)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("build reqwest client")
    })
}

/// One artifact part of a publish request
pub struct Artifact {
    name: &'static str,
    body: ArtifactBody,
}

enum ArtifactBody {
    Text(String),
    Bytes(Vec<u8>),
    Stream(Blob),
}

impl Artifact {
    pub fn text(name: &'static str, body: String) -> Self {
        Self {
            name,
            body: ArtifactBody::Text(body),
        }
    }

    pub fn bytes(name: &'static str, body: Vec<u8>) -> Self {
        Self {
            name,
            body: ArtifactBody::Bytes(body),
        }
    }

    pub fn stream(name: &'static str, body: Blob) -> Self {
        Self {
            name,
            body: ArtifactBody::Stream(body),
        }
    }

    fn into_part(self) -> multipart::Part {
        match self.body {
            ArtifactBody::Text(text) => multipart::Part::text(text),
            ArtifactBody::Bytes(bytes) => multipart::Part::bytes(bytes),
            ArtifactBody::Stream(blob) => multipart::Part::stream(Body::wrap_stream(ReaderStream::new(blob))),
        }
        .file_name(self.name)
    }
}

pub struct Catalog {
    base: Url,
}

impl Catalog {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    fn endpoint(&self, segment: &str) -> Result<Url, Error> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::CannotBeABase(self.base.clone()))?
            .pop_if_empty()
            .push(segment);
        Ok(url)
    }

    /// Publish artifacts under a catalog key
    ///
    /// Each part is named `file` with the artifact's fixed basename; the
    /// query string carries the url-escaped catalog key.
    pub async fn publish(&self, catalog_key: &str, artifacts: Vec<Artifact>) -> Result<(), Error> {
        let mut url = self.endpoint("upload")?;
        let escaped = url::form_urlencoded::byte_serialize(catalog_key.as_bytes()).collect::<String>();
        url.set_query(Some(&escaped));

        let mut form = multipart::Form::new();
        for artifact in artifacts {
            form = form.part("file", artifact.into_part());
        }

        let response = client()
            .post(url.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|error| Error::Request(url.clone(), error))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(url, status));
        }

        Ok(())
    }

    /// Register an environment with the catalog
    pub async fn create_environment(&self, definition: &Definition) -> Result<(), Error> {
        let body = EnvironmentBody {
            name: &definition.name,
            path: &definition.path,
            description: Some(&definition.description),
            packages: Some(definition.packages.iter().map(ToString::to_string).collect()),
        };

        self.post_lifecycle("create-environment", &body).await
    }

    /// Remove an environment from the catalog
    pub async fn delete_environment(&self, name: &str, path: &str) -> Result<(), Error> {
        let body = EnvironmentBody {
            name,
            path,
            description: None,
            packages: None,
        };

        self.post_lifecycle("delete-environment", &body).await
    }

    /// Ask the catalog to resend every build still queued on its side.
    /// Returns the number of builds resent.
    pub async fn resend_pending_builds(&self) -> Result<u64, Error> {
        let url = self.endpoint("resend-pending-builds")?;

        let response = client()
            .post(url.clone())
            .send()
            .await
            .map_err(|error| Error::Request(url.clone(), error))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(url.clone(), status));
        }

        let resend: ResendReply = response.json().await.map_err(|error| Error::Request(url, error))?;
        if resend.failures > 0 {
            return Err(Error::PartialResend {
                successes: resend.successes,
                failures: resend.failures,
            });
        }

        Ok(resend.successes)
    }

    async fn post_lifecycle(&self, segment: &str, body: &EnvironmentBody<'_>) -> Result<(), Error> {
        let url = self.endpoint(segment)?;

        let response = client()
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|error| Error::Request(url.clone(), error))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(url, status));
        }

        let reply: Reply = response.json().await.map_err(|error| Error::Request(url, error))?;
        if !reply.error.is_empty() {
            return Err(Error::Remote(reply.error));
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct EnvironmentBody<'a> {
    name: &'a str,
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    packages: Option<Vec<String>>,
}

/// Lifecycle replies carry `{message}` or `{error}`; only a non-empty
/// error is meaningful here
#[derive(Deserialize, Default)]
#[serde(default)]
struct Reply {
    error: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ResendReply {
    successes: u64,
    failures: u64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("catalog url {0} cannot be a base")]
    CannotBeABase(Url),
    #[error("request to {0} failed")]
    Request(Url, #[source] reqwest::Error),
    #[error("{0} returned {1}")]
    Status(Url, StatusCode),
    #[error("catalog error: {0}")]
    Remote(String),
    #[error("catalog resent {successes} builds but {failures} failed")]
    PartialResend { successes: u64, failures: u64 },
}
