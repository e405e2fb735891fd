use std::path::PathBuf;

use clap::{Parser, Subcommand};

const DEFAULT_STATE_FILE: &str = "/var/lib/vrf-cni/state";

#[derive(Debug, Parser)]
#[command(version, about = "A cli for inspecting vrf-cni agent state", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Used to inspect the persisted pod state
    #[command(subcommand)]
    State(StateCommands),
}

#[derive(Clone, Subcommand, Debug)]
pub enum StateCommands {
    /// List the pods and their dataplane handles
    List {
        #[arg(long, env = "VRF_CNI_STATE_FILE", default_value = DEFAULT_STATE_FILE)]
        path: PathBuf,
    },
    /// Print every field of a single pod
    Show {
        #[arg(long, env = "VRF_CNI_STATE_FILE", default_value = DEFAULT_STATE_FILE)]
        path: PathBuf,

        /// Pod key, as printed by `state list`
        #[arg(long)]
        key: String,
    },
}
