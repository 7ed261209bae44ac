mod args;
mod output;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use gpulog_collector::history::{days_between, user_usage, users_on};
use gpulog_collector::{Collector, ManagementClient, NetdataClient};

use crate::args::{select_nodes, Args, Command};
use crate::output::{print_day_result, print_user_usage, print_users};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let provider = gpulog_common::telemetry::init_tracing(
        "gpulog",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "gpulog failed");
            ExitCode::FAILURE
        }
    };

    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush spans: {e}");
        }
    }
    code
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = args.collector_config().context("invalid configuration")?;
    let node_names: Vec<String> = config.nodes.iter().map(|n| n.name.clone()).collect();

    match args.command {
        Command::Collect { date, nodes } => {
            let day = date.unwrap_or_else(|| config.time.today());
            let selected = select_nodes(&config, &nodes)?;

            let netdata = NetdataClient::new(config.request_timeout, config.points_per_day)
                .context("failed to build telemetry client")?;
            let management = ManagementClient::new(
                config.management.clone(),
                config.time,
                config.request_timeout,
            )
            .context("failed to build management client")?;

            let collector = Collector::new(Arc::new(config), netdata, management);
            let result = collector.run_day(day, &selected).await;
            print_day_result(&result);

            if result.summary.nodes_written() == 0 {
                tracing::error!(%day, "no node-day written");
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Usage { user, from, to } => {
            let to = to.unwrap_or(from);
            if to < from {
                bail!("end date {to} is before start date {from}");
            }
            let report = user_usage(&config.data_dir, &user, &days_between(from, to), &node_names);
            print_user_usage(&report, from, to);
        }
        Command::Users { date } => {
            let users = users_on(&config.data_dir, date, &node_names);
            print_users(date, &users);
        }
    }
    Ok(ExitCode::SUCCESS)
}
