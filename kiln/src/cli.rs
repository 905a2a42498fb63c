// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

mod build;
mod remove;
mod serve;

#[derive(Debug, Parser)]
#[command(name = "kiln", about = "Build orchestration for scientific software environments")]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    #[command(subcommand)]
    pub subcommand: Option<Subcommand>,
}

#[derive(Debug, clap::Args)]
pub struct Global {
    #[arg(long, global = true, help = "Path to the service configuration file")]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        default_value = "info",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    pub log: String,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Serve(serve::Command),
    Build(build::Command),
    Remove(remove::Command),
}

pub fn process() -> Result<(), Error> {
    let Command { global, subcommand } = Command::parse();

    match subcommand {
        // serve is the default verb
        None => serve::handle(serve::Command::default(), global)?,
        Some(Subcommand::Serve(command)) => serve::handle(command, global)?,
        Some(Subcommand::Build(command)) => build::handle(command, global)?,
        Some(Subcommand::Remove(command)) => remove::handle(command, global)?,
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("serve")]
    Serve(#[from] serve::Error),
    #[error("build")]
    Build(#[from] build::Error),
    #[error("remove")]
    Remove(#[from] remove::Error),
}
