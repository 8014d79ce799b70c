// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use cli::Cli;
use tracing::error;
use tracing_subscriber::{fmt::writer::MakeWriterExt, EnvFilter};

mod ami;
mod autoscale_utils;
mod aws_fleet;
mod capacity;
mod cli;
mod config;
mod deploy;
mod duration;
mod ec2_utils;
mod elb_utils;
mod error;
mod fleet;
mod outcome;
mod pipeline;
mod ssm_utils;
mod state;
mod strategy;

fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if debug { "debug" } else { "info" };
        EnvFilter::new(format!(
            "{},aws_config=warn,aws_smithy_http=warn,aws_smithy_client=warn,hyper=warn",
            level
        ))
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // The guard flushes the file writer and has to live until exit.
    let guard = match &cli.log_dir {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, "asiaq-deploy.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(cli.debug))
                .with_writer(std::io::stderr.and(non_blocking))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(cli.debug))
                .with_writer(std::io::stderr)
                .init();
            None
        }
    };

    let code = match cli.run().await {
        Ok(code) => code,
        Err(err) if err.is_hard_rollout_error() => {
            error!("rollout stopped: {}", err);
            1
        }
        Err(err) => {
            error!("{}", err);
            1
        }
    };
    drop(guard);
    std::process::exit(code);
}
