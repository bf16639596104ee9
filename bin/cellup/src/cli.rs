use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use url::Url;

use cellup_deploy::CONFIG_FILENAME;

#[derive(Parser)]
#[command(name = "cellup")]
#[command(
    author,
    version,
    about = "Deploy and wire upgradeable contracts, once per network"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "CELLUP_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file, or to the directory containing it.
    #[arg(short, long, env = "CELLUP_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy every unit (or the requested ones and their dependencies) and run
    /// the wiring that becomes possible.
    Deploy(DeployArgs),

    /// Print the recorded name to address table. Sends nothing.
    Status {
        /// The network to inspect.
        #[arg(short, long, env = "CELLUP_NETWORK")]
        network: String,
    },

    /// Print the execution order and what is already recorded. Sends nothing.
    Plan {
        #[arg(short, long, env = "CELLUP_NETWORK")]
        network: String,

        /// Restrict the plan to these units and their dependencies.
        #[arg(short, long = "unit")]
        units: Vec<String>,
    },
}

#[derive(Args)]
pub struct DeployArgs {
    /// The network to deploy to, as named in the configuration file.
    #[arg(short, long, env = "CELLUP_NETWORK")]
    pub network: String,

    /// Deploy only these units and their dependencies. May be repeated.
    #[arg(short, long = "unit")]
    pub units: Vec<String>,

    /// Redeploy units whose configuration changed since they were recorded.
    #[arg(long, env = "CELLUP_FORCE", default_value_t = false)]
    pub force: bool,

    /// Keep deploying units that do not depend on a failed one.
    ///
    /// By default the first permanent failure halts the run.
    #[arg(long, env = "CELLUP_KEEP_GOING", default_value_t = false)]
    pub keep_going: bool,

    /// Private key of the deploying account.
    #[arg(long, env = "DEPLOYER_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Override the network's RPC endpoint.
    #[arg(long, env = "CELLUP_RPC_URL")]
    pub rpc_url: Option<Url>,

    /// API key of the block explorer verification service. Passed through only.
    #[arg(long, env = "ETHERSCAN_KEY", hide_env_values = true)]
    pub verification_key: Option<String>,
}
