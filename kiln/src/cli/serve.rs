// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, str::FromStr, sync::Arc};

use clap::Parser;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kiln::{
    Builder, Config,
    catalog::Catalog,
    config,
    install::Installer,
    queue::CliQueue,
    reindex::Scheduler,
    server::{self, Service},
    store::DiskStore,
};

use super::Global;

#[derive(Debug, Default, Parser)]
#[command(about = "Run the build service")]
pub struct Command {}

pub fn handle(_command: Command, global: Global) -> Result<(), Error> {
    init_logging(&global.log)?;

    let config = Config::load(global.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Error> {
    let store = Arc::new(DiskStore::new(config.store.root.clone()));
    let queue = Arc::new(CliQueue::new(&config.queue));
    let catalog = Arc::new(Catalog::new(config.catalog.url.clone()));
    let installer = Installer::new(&config.module);

    let builder = Arc::new(Builder::new(
        store,
        queue,
        catalog.clone(),
        installer,
        config.recipe.clone(),
        config.module.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        config.reindex.period(),
        Scheduler::update_index_command(&config.reindex.spack_executable, &config.recipe.binary_cache),
    ));
    {
        let scheduler = Arc::clone(&scheduler);
        builder.on_build_finished(move || scheduler.signal());
    }
    scheduler.start();

    let service = Arc::new(Service { builder, catalog });
    server::serve(service, config.listen, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    scheduler.stop();

    Ok(())
}

/// Stderr logging with the noisy HTTP internals clamped to INFO
fn init_logging(level: &str) -> Result<(), Error> {
    let level = LevelFilter::from_str(level).map_err(|_| Error::LogLevel(level.to_owned()))?;

    let filter = Targets::new()
        .with_default(level)
        .with_target("h2", LevelFilter::INFO)
        .with_target("hyper", LevelFilter::INFO)
        .with_target("hyper_util", LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log level {0:?}")]
    LogLevel(String),
    #[error("config")]
    Config(#[from] config::Error),
    #[error("server")]
    Server(#[from] server::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
