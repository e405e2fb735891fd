use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Result;
use crate::dataplane::IpFamily;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfTables {
    pub v4: Option<u32>,
    pub v6: Option<u32>,
}

impl VrfTables {
    pub fn table(&self, family: IpFamily) -> Option<u32> {
        match family {
            IpFamily::V4 => self.v4,
            IpFamily::V6 => self.v6,
        }
    }
}

/// A secondary pod network. `vrf` holds the network's own tables, `pod_vrf`
/// the tables pod VRFs of this network fall through to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub name: String,
    #[serde(default)]
    pub vrf: VrfTables,
    #[serde(default)]
    pub pod_vrf: VrfTables,
    #[serde(default)]
    pub range: Option<IpNetwork>,
}

/// Network definitions by name, shared between whoever maintains them and the
/// provisioner.
#[derive(Debug, Default)]
pub struct NetworkRegistry {
    networks: DashMap<String, Arc<NetworkDefinition>>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<NetworkDefinition>> {
        self.networks.get(name).map(|n| n.clone())
    }

    pub fn insert(&self, network: NetworkDefinition) -> Option<Arc<NetworkDefinition>> {
        self.networks
            .insert(network.name.clone(), Arc::new(network))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<NetworkDefinition>> {
        self.networks.remove(name).map(|(_, n)| n)
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Adds every definition of a YAML list, replacing definitions with the
    /// same name.
    pub fn load_str(&self, yaml: &str) -> Result<usize> {
        let networks: Vec<NetworkDefinition> = serde_yaml::from_str(yaml)?;
        let count = networks.len();
        for network in networks {
            info!(name = %network.name, "loaded network definition");
            self.insert(network);
        }
        Ok(count)
    }

    pub async fn load_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let yaml = tokio::fs::read_to_string(path).await?;
        self.load_str(&yaml)
    }
}
