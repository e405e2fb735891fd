use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::provision::{DEFAULT_POD_VRF_INDEX, DEFAULT_PUNT_TABLE_ID, ProvisionConfig};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Agent(AgentArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Pod state snapshot, rewritten on every pod change
    #[arg(long, env = "VRF_CNI_STATE_FILE", default_value = "/var/lib/vrf-cni/state")]
    pub state_file: PathBuf,

    /// Socket the pod API listens on
    #[arg(
        long,
        env = "VRF_CNI_API_SOCKET",
        default_value = "/var/run/vrf-cni/agent.sock"
    )]
    pub api_socket_path: PathBuf,

    /// Metrics listener for agent
    #[arg(long, env = "VRF_CNI_METRICS_ADDRESS", default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// YAML list of secondary network definitions
    #[arg(long, env = "VRF_CNI_NETWORKS_CONFIG")]
    pub networks_config: Option<PathBuf>,

    /// Table pod VRFs of single-network pods fall through to
    #[arg(long, env = "VRF_CNI_POD_VRF_INDEX", default_value_t = DEFAULT_POD_VRF_INDEX)]
    pub pod_vrf_index: u32,

    /// Table receiving punted traffic
    #[arg(long, env = "VRF_CNI_PUNT_TABLE_ID", default_value_t = DEFAULT_PUNT_TABLE_ID)]
    pub punt_table_id: u32,

    /// Enable strict reverse path filtering on every pod
    #[arg(long, env = "VRF_CNI_STRICT_RPF")]
    pub strict_rpf: bool,

    /// Create memif interfaces for pods that ask for them
    #[arg(long, env = "VRF_CNI_MEMIF_ENABLED")]
    pub memif_enabled: bool,
}

impl AgentArgs {
    pub fn provision_config(&self) -> ProvisionConfig {
        ProvisionConfig {
            pod_vrf_index: self.pod_vrf_index,
            punt_table_id: self.punt_table_id,
            strict_rpf: self.strict_rpf,
            memif_enabled: self.memif_enabled,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["vrf-cni", "agent"]).unwrap();
        let Commands::Agent(args) = cli.command;
        assert_eq!(args.provision_config(), ProvisionConfig::default());
        assert!(args.networks_config.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "vrf-cni",
            "agent",
            "--state-file",
            "/tmp/state",
            "--pod-vrf-index",
            "7",
            "--strict-rpf",
        ])
        .unwrap();
        let Commands::Agent(args) = cli.command;
        assert_eq!(args.state_file, PathBuf::from("/tmp/state"));
        let config = args.provision_config();
        assert_eq!(config.pod_vrf_index, 7);
        assert!(config.strict_rpf);
        assert!(!config.memif_enabled);
    }
}
