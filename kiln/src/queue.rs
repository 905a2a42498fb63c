// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Job backend adapter
//!
//! Builds run on an external batch scheduler, reached through its command
//! line client. The adapter submits a [`JobSpec`] describing a shell command
//! and a bucket mount, then polls the job through to the running and
//! terminal states. Identical job specs are deduplicated by the backend to
//! the same id; the recipe fingerprint embedded in the command string is
//! what makes a changed definition a genuinely new job.

use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command, time};
use tracing::warn;

use crate::config::QueueSettings;

/// Shell command run by the scheduler for one build.
///
/// The working directory is the bucket mount, so everything the script
/// leaves behind (image, lockfile, executables list, log) lands under the
/// request's storage key. The exact shell text is external data.
const BUILD_COMMAND: &str = concat!(
    "echo doing build with hash @hash@; ",
    "sudo singularity build singularity.sif singularity.def 2>&1 | tee builder.out; ",
    "status=${PIPESTATUS[0]}; ",
    "if [ \"$status\" -eq 0 ]; then ",
    "sudo singularity exec singularity.sif cat /opt/spack-environment/spack.lock > spack.lock && ",
    "sudo singularity exec singularity.sif cat /opt/spack-environment/executables > executables ",
    "|| status=$?; ",
    "fi; ",
    "exit \"$status\"",
);

/// Wire form of a job handed to the batch scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    pub cmd: String,
    pub retries: u8,
    pub rep_grp: String,
    pub limit_grps: Vec<String>,
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    #[serde(rename = "Targets")]
    pub targets: Vec<MountTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountTarget {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Write")]
    pub write: bool,
    #[serde(rename = "Cache")]
    pub cache: bool,
}

impl JobSpec {
    /// Compose the build job for a storage key and recipe fingerprint
    pub fn build(storage_key: &str, recipe_hash: &str) -> Self {
        Self {
            cmd: BUILD_COMMAND.replace("@hash@", recipe_hash),
            retries: 0,
            rep_grp: format!("singularity_build-{storage_key}"),
            limit_grps: vec!["s3cache".to_owned()],
            mounts: vec![Mount {
                targets: vec![MountTarget {
                    path: storage_key.to_owned(),
                    write: true,
                    cache: true,
                }],
            }],
        }
    }
}

/// Scheduler-reported state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Deserialize)]
#[serde(from = "String")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Complete,
    /// The scheduler gave up on the job
    Buried,
    /// The scheduler does not know the job
    Invalid,
}

impl From<String> for JobState {
    fn from(state: String) -> Self {
        match state.as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "complete" => Self::Complete,
            "buried" => Self::Buried,
            _ => Self::Invalid,
        }
    }
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Buried | JobState::Invalid)
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a job, returning the backend's id for it
    async fn add(&self, job: &JobSpec) -> Result<String, Error>;

    /// Point-in-time state query
    async fn status(&self, id: &str) -> Result<JobState, Error>;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Block until the job has started or exited. Returns immediately if the
    /// job is already terminal. An unreachable backend is retried on the
    /// poll interval.
    async fn wait_for_running(&self, id: &str) -> Result<JobState, Error> {
        loop {
            match self.status(id).await {
                Ok(state) if state == JobState::Running || state.is_terminal() => return Ok(state),
                Ok(_) => {}
                Err(Error::Unreachable(error)) => {
                    warn!(job = id, "job queue unreachable, retrying: {error}");
                }
                Err(error) => return Err(error),
            }

            time::sleep(self.poll_interval()).await;
        }
    }

    /// Block until the job reaches a terminal state
    async fn wait(&self, id: &str) -> Result<JobState, Error> {
        loop {
            match self.status(id).await {
                Ok(state) if state.is_terminal() => return Ok(state),
                Ok(_) => {}
                Err(Error::Unreachable(error)) => {
                    warn!(job = id, "job queue unreachable, retrying: {error}");
                }
                Err(error) => return Err(error),
            }

            time::sleep(self.poll_interval()).await;
        }
    }
}

/// Adapter over the scheduler's command line client
pub struct CliQueue {
    executable: String,
    deployment: String,
    poll: Duration,
}

impl CliQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            executable: settings.executable.clone(),
            deployment: settings.deployment.clone(),
            poll: settings.poll_interval(),
        }
    }
}

#[async_trait]
impl Queue for CliQueue {
    async fn add(&self, job: &JobSpec) -> Result<String, Error> {
        let mut child = Command::new(&self.executable)
            .args(["add", "--deployment", self.deployment.as_str(), "--json"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::Unreachable)?;

        let payload = serde_json::to_vec(job)?;
        let mut stdin = child.stdin.take().expect("piped stdin");
        stdin.write_all(&payload).await.map_err(Error::Unreachable)?;
        stdin.write_all(b"\n").await.map_err(Error::Unreachable)?;
        drop(stdin);

        let output = child.wait_with_output().await.map_err(Error::Unreachable)?;
        if !output.status.success() {
            return Err(Error::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }

        #[derive(Deserialize)]
        struct Added {
            id: String,
        }

        let added: Added = serde_json::from_slice(&output.stdout)
            .map_err(|_| Error::Response(String::from_utf8_lossy(&output.stdout).trim().to_owned()))?;

        Ok(added.id)
    }

    async fn status(&self, id: &str) -> Result<JobState, Error> {
        let output = Command::new(&self.executable)
            .args(["status", "--deployment", self.deployment.as_str(), "--json", id])
            .output()
            .await
            .map_err(Error::Unreachable)?;

        if !output.status.success() {
            return Err(Error::Unreachable(io::Error::other(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            )));
        }

        #[derive(Deserialize)]
        struct Reported {
            state: JobState,
        }

        let reported: Reported = serde_json::from_slice(&output.stdout)
            .map_err(|_| Error::Response(String::from_utf8_lossy(&output.stdout).trim().to_owned()))?;

        Ok(reported.state)
    }

    fn poll_interval(&self) -> Duration {
        self.poll
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("job queue rejected submission: {0}")]
    Rejected(String),
    #[error("job queue unreachable")]
    Unreachable(#[source] io::Error),
    #[error("unexpected scheduler response {0:?}")]
    Response(String),
    #[error("encode job spec")]
    Encode(#[from] serde_json::Error),
}
