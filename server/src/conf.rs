use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerConfig;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Conf {
    pub id: String,
    /// The log format to use - "json" or "full" (default)
    pub log_format: String,

    pub database_url: String,
    pub database_name: String,

    pub rest_server_port: u16,
    pub rest_server_max_body_size: usize,

    /// Endpoint of the identity collaborator that verifies bearer tokens.
    pub auth_verify_url: String,

    /// Wallet collecting the platform service fee on deployed escrows.
    pub service_fee_wallet: String,

    pub chain: ChainConfig,
    pub bridge: BridgeConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Empty means no chain client; the deadline scheduler stays disabled.
    pub rpc_url: String,
    pub backend_wallet_private_key: String,
    /// Empty means deal creation skips contract deployment.
    pub deployer_private_key: String,
    pub network: String,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub aggregator_url: String,
}

impl Conf {
    pub fn new(config_files: Vec<String>) -> Result<Self, anyhow::Error> {
        let mut s = Config::builder().add_source(File::from_str(
            include_str!("conf_defaults.toml"),
            config::FileFormat::Toml,
        ));
        // Priority order: config file, then environment variables
        for config_file in config_files {
            s = s.add_source(File::with_name(&config_file).required(false));
        }
        let conf: Self = s
            .add_source(
                Environment::with_prefix("escrow")
                    .separator("__")
                    .prefix_separator("_")
                    .list_separator(","),
            )
            .build()?
            .try_deserialize()?;
        Ok(conf)
    }
}
