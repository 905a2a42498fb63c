// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use thiserror::Error;
use tracing::warn;

use kiln::{
    Config,
    catalog::Catalog,
    config, environment,
    install::{self, Installer},
    runtime,
    store::{DiskStore, Store},
};

use super::Global;

#[derive(Debug, Parser)]
#[command(about = "Remove an environment: catalog entry, local install and stored artifacts")]
pub struct Command {
    #[arg(help = "Environment name including its path prefix, e.g. groups/hgi/tools")]
    name: String,
    #[arg(short, long)]
    version: String,
}

pub fn handle(command: Command, global: Global) -> Result<(), Error> {
    let config = Config::load(global.config.as_deref())?;
    let (path, name) = environment::split_name(&command.name)?;
    let version = &command.version;

    let installer = Installer::new(&config.module);

    // refuse up front rather than leave a half-removed environment behind
    installer.ensure_writable(&path, &name, version)?;

    let catalog = Catalog::new(config.catalog.url.clone());
    let store = DiskStore::new(config.store.root.clone());
    let storage_key = format!("{path}/{name}/{version}");

    let mut failures = Vec::new();

    runtime::block_on(async {
        if let Err(error) = catalog.delete_environment(&name, &path).await {
            warn!("catalog removal failed: {error}");
            failures.push(format!("catalog: {error}"));
        }

        if let Err(error) = store.remove(&storage_key).await {
            warn!("artifact removal failed: {error}");
            failures.push(format!("store: {error}"));
        }
    });

    if let Err(error) = installer.uninstall(&path, &name, version) {
        warn!("local removal failed: {error}");
        failures.push(format!("install: {error}"));
    }

    if failures.is_empty() {
        println!("removed environment {}@{version}", command.name);
        Ok(())
    } else {
        Err(Error::Partial(failures.join("; ")))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("config")]
    Config(#[from] config::Error),
    #[error("environment name")]
    Name(#[from] environment::Error),
    #[error("install root")]
    Install(#[from] install::Error),
    #[error("removal incomplete: {0}")]
    Partial(String),
}
