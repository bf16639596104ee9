//! cellup deploys a set of interdependent upgradeable contracts and keeps a
//! per-network record of what is live.

mod cli;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use cellup_deploy::{Config, Credentials, Deployer, RunOptions};
use cli::{Cli, Command, DeployArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let deployer = Deployer::new(Config::load(&config_path)?);

    match cli.command {
        Command::Deploy(args) => deploy(&deployer, args).await,
        Command::Status { network } => {
            println!("{}", deployer.status(&network)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Plan { network, units } => {
            for (position, (unit, status)) in deployer.plan(&network, &units)?.iter().enumerate() {
                println!("{:>3}. {unit} ({status})", position + 1);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn deploy(deployer: &Deployer, args: DeployArgs) -> Result<ExitCode> {
    let network = args.network;
    let credentials = Credentials {
        private_key: args.private_key,
        rpc_url: args.rpc_url,
        verification_key: args.verification_key,
    };
    let options = RunOptions {
        units: args.units,
        force: args.force,
        keep_going: args.keep_going,
    };

    let report = deployer.deploy(&network, credentials, options).await?;
    println!("{}", report.render());

    if !report.succeeded() {
        for failure in report.failures() {
            tracing::error!(network = %network, "{failure}");
        }
        if let Some(reason) = &report.halted_by {
            tracing::error!(network = %network, reason = %reason, "Run halted");
        }
        return Ok(ExitCode::FAILURE);
    }

    println!("{}", deployer.status(&network)?);
    tracing::info!(
        network = %network,
        transactions = report.transactions,
        "Deployment complete"
    );
    Ok(ExitCode::SUCCESS)
}
