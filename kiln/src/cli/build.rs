// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use kiln::{
    Config, config,
    environment::{Model, Package, Request},
    runtime,
};

use super::Global;

#[derive(Debug, Parser)]
#[command(about = "Submit an environment build to a running service")]
pub struct Command {
    #[arg(help = "Environment name including its path prefix, e.g. groups/hgi/tools")]
    name: String,
    #[arg(short, long)]
    version: String,
    #[arg(short, long, default_value = "")]
    description: String,
    #[arg(long, help = "Service URL, defaults to the configured listen address")]
    server: Option<Url>,
    #[arg(required = true, value_name = "PACKAGE[@VERSION]")]
    packages: Vec<String>,
}

pub fn handle(command: Command, global: Global) -> Result<(), Error> {
    let request = Request {
        name: command.name,
        version: command.version,
        model: Model {
            description: command.description,
            packages: command.packages.iter().map(|spec| Package::parse(spec)).collect(),
        },
    };

    let server = match command.server {
        Some(url) => url,
        None => {
            let config = Config::load(global.config.as_deref())?;
            Url::parse(&format!("http://{}", config.listen))?
        }
    };
    let url = server.join("environments/build")?;

    runtime::block_on(submit(url, request))
}

async fn submit(url: Url, request: Request) -> Result<(), Error> {
    let response = reqwest::Client::new().post(url).json(&request).send().await?;

    let status = response.status();
    if status.is_success() {
        println!("build of {}@{} queued", request.name, request.version);
        return Ok(());
    }

    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct Failure {
        error: String,
    }

    let failure: Failure = response.json().await.unwrap_or_default();

    Err(Error::Refused {
        status,
        reason: failure.error,
    })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("config")]
    Config(#[from] config::Error),
    #[error("service url")]
    Url(#[from] url::ParseError),
    #[error("request")]
    Request(#[from] reqwest::Error),
    #[error("service refused the build ({status}): {reason}")]
    Refused { status: StatusCode, reason: String },
}
