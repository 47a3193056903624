// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The frontend server: hosts the backplane, the instance scheduler, and any workers the
//! config co-locates in this process.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use buildfarm::{Farm, FarmConfig};
use task_executor::Executor;

#[derive(Parser)]
#[command(name = "buildfarm-frontend")]
struct Opt {
    /// Path to the farm config file.
    #[arg(long)]
    config: PathBuf,

    /// Overrides the config's port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let opt = Opt::parse();

    let mut config = match FarmConfig::load(&opt.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = opt.port {
        config.port = port;
    }

    let executor = Executor::new();
    let farm = match Farm::build(&config, executor, true).await {
        Ok(farm) => farm,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = farm.start().await {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    log::info!(
        "Frontend up on port {} with {} co-located worker(s)",
        config.port,
        farm.workers.len()
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to wait for shutdown: {e}");
        return ExitCode::FAILURE;
    }
    log::info!("Shutting down");
    farm.stop().await;
    ExitCode::SUCCESS
}
