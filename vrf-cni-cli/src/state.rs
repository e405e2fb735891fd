use std::path::Path;

use anyhow::{Context, anyhow};
use tabled::{Table, Tabled, settings::Style};
use tracing::debug;
use vrf_cni::dataplane::INVALID_ID;
use vrf_cni::pod::PodNetworkSpec;
use vrf_cni::storage;

use crate::cli::StateCommands;

pub(crate) fn run(cmd: StateCommands) -> anyhow::Result<()> {
    match cmd {
        StateCommands::List { path } => list(&path)?,
        StateCommands::Show { path, key } => show(&path, &key)?,
    }
    Ok(())
}

#[derive(Tabled)]
struct PodRow {
    #[tabled(rename = "KEY")]
    key: String,
    #[tabled(rename = "ADDRESSES")]
    addresses: String,
    #[tabled(rename = "VRF")]
    vrf: String,
    #[tabled(rename = "RPF VRF")]
    rpf_vrf: String,
    #[tabled(rename = "TUN")]
    tun: String,
    #[tabled(rename = "NETWORK")]
    network: String,
}

impl From<&PodNetworkSpec> for PodRow {
    fn from(spec: &PodNetworkSpec) -> Self {
        let addresses = spec
            .container_ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            key: spec.key(),
            addresses,
            vrf: format!("{}/{}", handle(spec.v4_vrf_id), handle(spec.v6_vrf_id)),
            rpf_vrf: format!(
                "{}/{}",
                handle(spec.v4_rpf_vrf_id),
                handle(spec.v6_rpf_vrf_id)
            ),
            tun: handle(spec.tun_tap_sw_if_index),
            network: spec.network_name.clone().unwrap_or_default(),
        }
    }
}

fn handle(id: u32) -> String {
    if id == INVALID_ID {
        "-".to_string()
    } else {
        id.to_string()
    }
}

fn load(path: &Path) -> anyhow::Result<Vec<PodNetworkSpec>> {
    let specs = storage::load(path)
        .with_context(|| format!("failed to load state from {}", path.display()))?;
    debug!("loaded {} pods from {}", specs.len(), path.display());
    Ok(specs)
}

fn list(path: &Path) -> anyhow::Result<()> {
    let rows: Vec<PodRow> = load(path)?.iter().map(PodRow::from).collect();
    let table = Table::new(rows).with(Style::empty()).to_string();
    println!("{table}");
    Ok(())
}

fn show(path: &Path, key: &str) -> anyhow::Result<()> {
    let specs = load(path)?;
    let spec = specs
        .iter()
        .find(|s| s.key() == key)
        .ok_or_else(|| anyhow!("no pod with key {key}"))?;
    println!("{}", spec.full_string());
    Ok(())
}
