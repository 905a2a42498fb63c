// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The build coordinator
//!
//! One [`Builder`] owns every in-flight build. A request is processed in two
//! phases: a synchronous phase that generates and uploads the recipe and
//! submits the backend job, surfacing any error to the caller, and an
//! asynchronous phase that follows the job to completion, publishes the
//! artifact set, installs the module locally and finally fires the
//! post-build callback.
//!
//! At most one build may be live per storage key. The in-flight table is
//! the only shared mutable state on the hot path; its lock is held across
//! membership checks only, never across I/O.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use crate::{
    catalog::{
        self, Artifact, Catalog, EXECUTABLES_BASENAME, IMAGE_BASENAME, LOCK_BASENAME, LOG_BASENAME, MODULE_BASENAME,
        README_BASENAME, RECIPE_BASENAME, SOFTPACK_BASENAME,
    },
    config::{ModuleSettings, RecipeSettings},
    environment::Definition,
    install::{self, Installer},
    module,
    queue::{self, JobSpec, JobState, Queue},
    recipe, softpack,
    store::{self, Store},
};

/// Lifecycle states of one build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    Submitting,
    Queued,
    Running,
    Publishing,
    Installing,
    Done,
    Failed,
}

/// Per-request state kept for the duration of one build and retained for
/// status queries until process restart
#[derive(Debug)]
pub struct Record {
    pub definition: Definition,
    pub recipe: String,
    pub recipe_hash: String,
    pub job_id: Option<String>,
    pub status: Status,
    pub requested: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

type Shared = Arc<Mutex<Record>>;

/// Point-in-time view of a [`Record`] as reported by `/environments/status`
#[derive(Debug, Clone, Serialize)]
pub struct BuildStatus {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Requested")]
    pub requested: DateTime<Utc>,
    #[serde(rename = "BuildStart", skip_serializing_if = "Option::is_none")]
    pub build_start: Option<DateTime<Utc>>,
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "LastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Default)]
struct State {
    in_flight: HashMap<String, Shared>,
    history: Vec<Shared>,
}

type PostBuild = dyn Fn() + Send + Sync;

pub struct Builder {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    catalog: Arc<Catalog>,
    installer: Installer,
    recipe_settings: RecipeSettings,
    module_settings: ModuleSettings,
    state: Mutex<State>,
    post_build: Mutex<Option<Arc<PostBuild>>>,
}

impl Builder {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        catalog: Arc<Catalog>,
        installer: Installer,
        recipe_settings: RecipeSettings,
        module_settings: ModuleSettings,
    ) -> Self {
        Self {
            store,
            queue,
            catalog,
            installer,
            recipe_settings,
            module_settings,
            state: Mutex::default(),
            post_build: Mutex::new(None),
        }
    }

    /// Register the callback fired once per accepted build, after its
    /// asynchronous phase finishes
    pub fn on_build_finished(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.post_build.lock().expect("post-build lock") = Some(Arc::new(callback));
    }

    /// Accept a build request
    ///
    /// Returns once the recipe is uploaded and the backend job submitted;
    /// the rest of the build continues in the background. A second request
    /// for the same storage key while one is live is refused without side
    /// effects.
    pub async fn build(self: &Arc<Self>, definition: Definition) -> Result<(), Error> {
        let key = definition.storage_key();

        let record = {
            let mut state = self.state.lock().expect("builder state lock");
            if state.in_flight.contains_key(&key) {
                return Err(Error::AlreadyBuilding(key));
            }

            let record = Arc::new(Mutex::new(Record {
                definition: definition.clone(),
                recipe: String::new(),
                recipe_hash: String::new(),
                job_id: None,
                status: Status::Submitting,
                requested: Utc::now(),
                started: None,
                last_error: None,
            }));
            state.in_flight.insert(key.clone(), record.clone());
            state.history.push(record.clone());
            record
        };

        match self.submit(&definition, &key, &record).await {
            Ok(job_id) => {
                update(&record, |record| {
                    record.status = Status::Queued;
                    record.job_id = Some(job_id.clone());
                });
                info!(%key, job = %job_id, "build queued");

                let builder = Arc::clone(self);
                tokio::spawn(async move {
                    builder.finish(definition, key, job_id, record).await;
                });

                Ok(())
            }
            Err(error) => {
                // not accepted: forget the request entirely
                let mut state = self.state.lock().expect("builder state lock");
                state.in_flight.remove(&key);
                state.history.retain(|entry| !Arc::ptr_eq(entry, &record));
                Err(error)
            }
        }
    }

    /// Every record this coordinator has ever owned, in catalog-key order
    pub fn statuses(&self) -> Vec<BuildStatus> {
        let state = self.state.lock().expect("builder state lock");

        let mut statuses = state
            .history
            .iter()
            .map(|entry| {
                let record = entry.lock().expect("record lock");
                BuildStatus {
                    name: record.definition.catalog_key(),
                    requested: record.requested,
                    build_start: record.started,
                    status: record.status,
                    last_error: record.last_error.clone(),
                }
            })
            .collect::<Vec<_>>();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));

        statuses
    }

    /// Synchronous phase: recipe generation, upload, job submission
    async fn submit(&self, definition: &Definition, key: &str, record: &Shared) -> Result<String, Error> {
        let recipe = recipe::generate(definition, &self.recipe_settings)?;
        let hash = recipe::fingerprint(&recipe);
        update(record, |record| {
            record.recipe = recipe.clone();
            record.recipe_hash = hash.clone();
        });

        self.store
            .upload(
                Box::new(std::io::Cursor::new(recipe.into_bytes())),
                &format!("{key}/{RECIPE_BASENAME}"),
            )
            .await?;

        let job = JobSpec::build(key, &hash);
        let job_id = self.queue.add(&job).await?;

        Ok(job_id)
    }

    /// Asynchronous phase: follow the job, publish, install, then fire the
    /// post-build callback and release the in-flight key
    async fn finish(self: Arc<Self>, definition: Definition, key: String, job_id: String, record: Shared) {
        if let Err(error) = self.watch_and_publish(&definition, &key, &job_id, &record).await {
            error!(%key, "build failed: {}", chain(&error));
            update(&record, |record| {
                record.status = Status::Failed;
                record.last_error = Some(chain(&error));
            });

            // failures still surface their log to the catalog
            self.publish_failure(&definition, &key).await;
        } else {
            update(&record, |record| record.status = Status::Done);
            info!(%key, "build finished");
        }

        self.run_post_build();

        self.state
            .lock()
            .expect("builder state lock")
            .in_flight
            .remove(&key);
    }

    async fn watch_and_publish(
        &self,
        definition: &Definition,
        key: &str,
        job_id: &str,
        record: &Shared,
    ) -> Result<(), Error> {
        let state = self.queue.wait_for_running(job_id).await?;
        if state == JobState::Running {
            update(record, |record| {
                record.status = Status::Running;
                record.started = Some(Utc::now());
            });
        }

        let terminal = self.queue.wait(job_id).await?;
        if terminal != JobState::Complete {
            return Err(Error::BuildFailed(terminal));
        }

        update(record, |record| record.status = Status::Publishing);

        let lock_bytes = self.read_all(&format!("{key}/{LOCK_BASENAME}")).await?;
        let lock = softpack::Lock::parse(&lock_bytes)?;
        let softpack_yaml = softpack::render(&lock, &definition.description)?;

        let executables = String::from_utf8_lossy(&self.read_all(&format!("{key}/{EXECUTABLES_BASENAME}")).await?)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();

        let module_text = module::render_module(definition, &executables, &self.module_settings);
        let readme = module::render_readme(definition, &executables, &self.module_settings);
        let recipe_text = record.lock().expect("record lock").recipe.clone();

        let publish = async {
            let log = self.store.open(&format!("{key}/{LOG_BASENAME}")).await?;
            self.catalog
                .publish(
                    &definition.catalog_key(),
                    vec![
                        Artifact::text(RECIPE_BASENAME, recipe_text),
                        Artifact::bytes(LOCK_BASENAME, lock_bytes),
                        Artifact::text(SOFTPACK_BASENAME, softpack_yaml),
                        Artifact::stream(LOG_BASENAME, log),
                        Artifact::text(MODULE_BASENAME, module_text.clone()),
                        Artifact::text(README_BASENAME, readme),
                    ],
                )
                .await?;
            Ok::<_, Error>(())
        };
        if let Err(error) = publish.await {
            error!(%key, stage = "publish", "continuing after publish failure: {}", chain(&error));
            update(record, |record| record.last_error = Some(chain(&error)));
        }

        update(record, |record| record.status = Status::Installing);

        if let Err(error) = self.install(definition, key, &module_text, executables).await {
            error!(%key, stage = "install", "continuing after install failure: {}", chain(&error));
            update(record, |record| record.last_error = Some(chain(&error)));
        }

        Ok(())
    }

    /// Download the image and materialize the local install
    async fn install(
        &self,
        definition: &Definition,
        key: &str,
        module_text: &str,
        executables: Vec<String>,
    ) -> Result<(), Error> {
        let staging = tempfile::tempdir()?;
        let image = staging.path().join(IMAGE_BASENAME);
        self.store.download(&format!("{key}/{IMAGE_BASENAME}"), &image).await?;

        let installer = self.installer.clone();
        let definition = definition.clone();
        let module_text = module_text.to_owned();

        tokio::task::spawn_blocking(move || {
            installer.install(
                &definition.path,
                &definition.name,
                &definition.version,
                &module_text,
                &image,
                &executables,
            )
        })
        .await
        .expect("join install task")?;

        Ok(())
    }

    /// Publish only the build log, so failures are still visible to users
    async fn publish_failure(&self, definition: &Definition, key: &str) {
        let publish = async {
            let log = self.store.open(&format!("{key}/{LOG_BASENAME}")).await?;
            self.catalog
                .publish(&definition.catalog_key(), vec![Artifact::stream(LOG_BASENAME, log)])
                .await?;
            Ok::<_, Error>(())
        };

        if let Err(error) = publish.await {
            error!(%key, stage = "publish-log", "failed to publish build log: {}", chain(&error));
        }
    }

    async fn read_all(&self, key: &str) -> Result<Vec<u8>, Error> {
        let mut blob = self.store.open(key).await?;
        let mut bytes = Vec::new();
        blob.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }

    fn run_post_build(&self) {
        let callback = self.post_build.lock().expect("post-build lock").clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

fn update(record: &Shared, f: impl FnOnce(&mut Record)) {
    f(&mut record.lock().expect("record lock"));
}

/// Join an error with its source chain for the log
fn chain(error: &Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = std::error::Error::source(error);
    while let Some(error) = source.take() {
        parts.push(error.to_string());
        source = error.source();
    }
    parts.join(": ")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("environment {0} is already building")]
    AlreadyBuilding(String),
    #[error("generate recipe")]
    Recipe(#[from] recipe::Error),
    #[error("artifact store")]
    Store(#[from] store::Error),
    #[error("job queue")]
    Queue(#[from] queue::Error),
    #[error("build job ended {0}")]
    BuildFailed(JobState),
    #[error("transform lockfile")]
    Lock(#[from] softpack::Error),
    #[error("publish to catalog")]
    Catalog(#[from] catalog::Error),
    #[error("install")]
    Install(#[from] install::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for coordinator and server tests

    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use url::Url;
    use wiremock::MockServer;

    use super::*;
    use crate::{environment::Package, store::memory::MemoryStore};

    /// Queue whose status replies follow a script; the final state repeats
    pub struct ScriptedQueue {
        pub states: Mutex<VecDeque<JobState>>,
        pub adds: AtomicUsize,
        pub reject_add: bool,
    }

    impl ScriptedQueue {
        pub fn new(states: impl IntoIterator<Item = JobState>) -> Self {
            Self {
                states: Mutex::new(states.into_iter().collect()),
                adds: AtomicUsize::new(0),
                reject_add: false,
            }
        }

        pub fn rejecting() -> Self {
            Self {
                states: Mutex::new(VecDeque::new()),
                adds: AtomicUsize::new(0),
                reject_add: true,
            }
        }
    }

    #[async_trait]
    impl Queue for ScriptedQueue {
        async fn add(&self, _job: &JobSpec) -> Result<String, queue::Error> {
            if self.reject_add {
                return Err(queue::Error::Rejected("no room".to_owned()));
            }
            self.adds.fetch_add(1, Ordering::SeqCst);
            Ok("job-1".to_owned())
        }

        async fn status(&self, _id: &str) -> Result<JobState, queue::Error> {
            let mut states = self.states.lock().expect("states lock");
            if states.len() > 1 {
                Ok(states.pop_front().expect("non-empty"))
            } else {
                states.front().copied().ok_or_else(|| queue::Error::Response("no script".to_owned()))
            }
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(5)
        }
    }

    pub struct Fixture {
        pub builder: Arc<Builder>,
        pub store: Arc<MemoryStore>,
        pub server: MockServer,
        pub callbacks: Arc<AtomicUsize>,
        pub module_root: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    pub fn definition() -> Definition {
        Definition::new(
            "groups/hgi/xxhash",
            "0.8.1",
            "some help text",
            vec![
                Package::new("xxhash", "0.8.1"),
                Package::new("r-seurat", "4"),
                Package::new("py-anndata", "3.14"),
            ],
        )
        .unwrap()
    }

    pub const KEY: &str = "groups/hgi/xxhash/0.8.1";

    pub const LOCKFILE: &str = r#"{
        "roots": [
            {"hash": "aaa", "spec": "xxhash@0.8.1"},
            {"hash": "bbb", "spec": "py-anndata@3.14"},
            {"hash": "ccc", "spec": "r-seurat@4"}
        ],
        "concrete_specs": {
            "aaa": {"name": "xxhash", "version": "0.8.1"},
            "bbb": {"name": "py-anndata", "version": "3.14"},
            "ccc": {"name": "r-seurat", "version": "4.1.3"}
        }
    }"#;

    /// Seed every artifact a completed backend job would leave behind
    pub fn seed_success(store: &MemoryStore) {
        store.seed(&format!("{KEY}/{LOCK_BASENAME}"), LOCKFILE);
        store.seed(&format!("{KEY}/{EXECUTABLES_BASENAME}"), "xxhsum\nR\n");
        store.seed(&format!("{KEY}/{LOG_BASENAME}"), "build ok\n");
        store.seed(&format!("{KEY}/{IMAGE_BASENAME}"), "image bytes");
    }

    pub async fn fixture(queue: Arc<dyn Queue>) -> Fixture {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        let module_settings = ModuleSettings {
            module_root: dir.path().join("modules"),
            scripts_root: dir.path().join("scripts"),
            wrapper_script: dir.path().join("wrapper.sh"),
            load_path: "HGI/common".to_owned(),
            dependencies: vec!["singularity/3.10".to_owned()],
        };
        std::fs::create_dir(&module_settings.module_root).unwrap();
        std::fs::create_dir(&module_settings.scripts_root).unwrap();
        std::fs::write(&module_settings.wrapper_script, "#!/bin/sh\n").unwrap();

        let recipe_settings = RecipeSettings {
            binary_cache: "https://binaries.internal/spack".to_owned(),
            repo_url: "https://git.internal/custom-repo".to_owned(),
            repo_ref: "9f2a1c0".to_owned(),
            processor_target: "x86_64_v3".to_owned(),
            build_image: "spack/ubuntu-jammy:latest".to_owned(),
            final_image: "ubuntu:22.04".to_owned(),
        };

        let store = Arc::new(MemoryStore::default());
        let catalog = Arc::new(Catalog::new(Url::parse(&server.uri()).unwrap()));
        let installer = Installer::new(&module_settings);

        let builder = Arc::new(Builder::new(
            store.clone(),
            queue,
            catalog,
            installer,
            recipe_settings,
            module_settings.clone(),
        ));

        let callbacks = Arc::new(AtomicUsize::new(0));
        {
            let callbacks = callbacks.clone();
            builder.on_build_finished(move || {
                callbacks.fetch_add(1, Ordering::SeqCst);
            });
        }

        Fixture {
            builder,
            store,
            server,
            callbacks,
            module_root: module_settings.module_root,
            _dir: dir,
        }
    }

    /// Poll until the single build reaches a settled status
    pub async fn wait_settled(builder: &Builder) -> BuildStatus {
        for _ in 0..1000 {
            if let Some(status) = builder
                .statuses()
                .into_iter()
                .find(|status| matches!(status.status, Status::Done | Status::Failed))
            {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("build never settled: {:?}", builder.statuses());
    }
}
