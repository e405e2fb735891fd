use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentArgs;
use crate::dataplane::{Dataplane, MemoryDataplane};
use crate::http;
use crate::metrics::PodMetrics;
use crate::network::NetworkRegistry;
use crate::pod::PodNetworkSpec;
use crate::provision::Provisioner;
use crate::{Error, Result, storage};

/// Owns the live pods of the node. Every change goes through the provisioner
/// and is then written to the state file, one change at a time.
pub struct PodServer<D> {
    provisioner: Provisioner<D>,
    state_path: PathBuf,
    pods: Mutex<BTreeMap<String, PodNetworkSpec>>,
    metrics: PodMetrics,
}

impl<D: Dataplane> PodServer<D> {
    pub fn new(provisioner: Provisioner<D>, state_path: PathBuf, metrics: PodMetrics) -> Self {
        Self {
            provisioner,
            state_path,
            pods: Mutex::new(BTreeMap::new()),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, PodNetworkSpec>> {
        self.pods.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, pods: &BTreeMap<String, PodNetworkSpec>) -> Result<()> {
        self.metrics.active_pods.set(pods.len() as i64);
        storage::save(pods.values(), &self.state_path)
    }

    /// Rewires the pods of the state file into the dataplane, which starts
    /// empty. Saved handles belong to the previous process and are discarded;
    /// pods that cannot be provisioned again are dropped from the state.
    pub fn restore(&self) -> Result<usize> {
        let specs = storage::load(&self.state_path)?;
        let mut pods = self.lock();
        for mut spec in specs {
            spec.clear_handles();
            match self.provisioner.provision_pod(&mut spec) {
                Ok(()) => {
                    info!("restored pod {spec}");
                    pods.insert(spec.key(), spec);
                }
                Err(e) => {
                    warn!(%e, "dropping restored pod {spec}");
                }
            }
        }
        self.save(&pods)?;
        Ok(pods.len())
    }

    /// Wires the pod, replacing an existing pod with the same key.
    pub fn add_pod(&self, mut spec: PodNetworkSpec) -> Result<PodNetworkSpec> {
        let mut pods = self.lock();
        let key = spec.key();
        if let Some(mut old) = pods.remove(&key) {
            info!("pod(add) {key} already present, replacing");
            self.provisioner.deprovision_pod(&mut old);
        }

        spec.clear_handles();
        if let Err(e) = self.provisioner.provision_pod(&mut spec) {
            self.metrics.pod_add_failures.inc();
            if let Err(save_err) = self.save(&pods) {
                error!(%save_err, "failed to save pod state");
            }
            return Err(e);
        }

        self.metrics.pod_adds.inc();
        pods.insert(key, spec.clone());
        self.save(&pods)?;
        Ok(spec)
    }

    /// Removes the pod. Unknown keys succeed with `None`.
    pub fn del_pod(&self, key: &str) -> Result<Option<PodNetworkSpec>> {
        let mut pods = self.lock();
        let Some(mut spec) = pods.remove(key) else {
            info!("pod(del) {key} not found, nothing to do");
            return Ok(None);
        };
        self.provisioner.deprovision_pod(&mut spec);
        self.metrics.pod_dels.inc();
        self.save(&pods)?;
        Ok(Some(spec))
    }

    pub fn list_pods(&self) -> Vec<PodNetworkSpec> {
        self.lock().values().cloned().collect()
    }
}

pub async fn start(args: AgentArgs, cancel: CancellationToken) -> Result<()> {
    let networks = Arc::new(NetworkRegistry::new());
    if let Some(path) = &args.networks_config {
        let count = networks.load_file(path).await?;
        info!("loaded {count} network definitions from {}", path.display());
    }

    let dp = Arc::new(MemoryDataplane::new());
    dp.ensure_table(args.punt_table_id, "punt");
    dp.ensure_table(args.pod_vrf_index, "pod-vrf");

    let provisioner = Provisioner::new(dp, networks, args.provision_config());
    let server = Arc::new(PodServer::new(
        provisioner,
        args.state_file.clone(),
        PodMetrics::global(),
    ));

    // the api only opens once the previous state is back
    let restoring = server.clone();
    let restored = tokio::task::spawn_blocking(move || restoring.restore())
        .await
        .map_err(|e| Error::Task(e.to_string()))??;
    info!("restored {restored} pods from {}", args.state_file.display());

    http::serve_api(args.api_socket_path, server, cancel).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataplane::IpFamily;
    use crate::provision::ProvisionConfig;
    use crate::provision::test::{dataplane, l3_pod};

    fn server(path: PathBuf) -> (Arc<MemoryDataplane>, PodServer<MemoryDataplane>) {
        let dp = dataplane();
        let provisioner = Provisioner::new(
            dp.clone(),
            Arc::new(NetworkRegistry::new()),
            ProvisionConfig::default(),
        );
        (dp, PodServer::new(provisioner, path, PodMetrics::default()))
    }

    #[test]
    fn add_and_delete_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let (dp, server) = server(path.clone());

        let added = server.add_pod(l3_pod()).unwrap();
        assert!(added.is_provisioned());
        assert_eq!(storage::load(&path).unwrap(), vec![added.clone()]);
        assert_eq!(server.metrics.active_pods.get(), 1);

        let removed = server.del_pod(&added.key()).unwrap().unwrap();
        assert_eq!(removed.key(), added.key());
        assert!(storage::load(&path).unwrap().is_empty());
        assert_eq!(dp.snapshot().route_count(), 0);
        assert_eq!(server.metrics.pod_dels.get(), 1);
    }

    #[test]
    fn delete_of_unknown_pod_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (dp, server) = server(dir.path().join("state"));
        assert!(server.del_pod("netns:/nope,if:eth0").unwrap().is_none());
        assert!(dp.calls().is_empty());
    }

    #[test]
    fn re_adding_replaces_previous_resources() {
        let dir = tempfile::tempdir().unwrap();
        let (dp, server) = server(dir.path().join("state"));
        let first = server.add_pod(l3_pod()).unwrap();
        let mut changed = l3_pod();
        changed.container_ips = vec!["10.1.2.9".parse().unwrap()];
        let second = server.add_pod(changed).unwrap();

        assert_eq!(server.list_pods(), vec![second.clone()]);
        let state = dp.snapshot();
        assert!(!state.interfaces.contains_key(&first.tun_tap_sw_if_index));
        assert!(state.route(0, &"10.1.2.3/32".parse().unwrap()).is_none());
        assert!(state.route(0, &"10.1.2.9/32".parse().unwrap()).is_some());
    }

    #[test]
    fn failed_add_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let (dp, server) = server(path.clone());
        let initial = dp.snapshot();
        dp.fail_create_at(5);

        assert!(server.add_pod(l3_pod()).is_err());
        assert!(server.list_pods().is_empty());
        assert!(storage::load(&path).unwrap().is_empty());
        assert_eq!(dp.snapshot(), initial);
        assert_eq!(server.metrics.pod_add_failures.get(), 1);
    }

    #[test]
    fn restore_rewires_saved_pods() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let (_, first) = server(path.clone());
        let added = first.add_pod(l3_pod()).unwrap();

        let (dp, second) = server(path.clone());
        assert_eq!(second.restore().unwrap(), 1);
        let restored = second.list_pods();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].key(), added.key());
        assert!(restored[0].is_provisioned());
        assert!(
            dp.snapshot()
                .interfaces
                .contains_key(&restored[0].tun_tap_sw_if_index)
        );
        assert_eq!(storage::load(&path).unwrap(), restored);
    }

    #[test]
    fn deleting_restored_pod_keeps_pods_added_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let (_, first) = server(path.clone());
        let restored = first.add_pod(l3_pod()).unwrap();

        let (dp, second) = server(path);
        second.restore().unwrap();
        let mut other = PodNetworkSpec::new("eth0", "/var/run/netns/cni-2");
        other.container_ips = vec!["10.1.2.4".parse().unwrap()];
        let other = second.add_pod(other).unwrap();
        let before = dp.snapshot();

        second.del_pod(&restored.key()).unwrap().unwrap();

        let state = dp.snapshot();
        assert!(state.interfaces.contains_key(&other.tun_tap_sw_if_index));
        for family in IpFamily::ALL {
            let key = (family, other.vrf_id(family));
            assert_eq!(state.tables[&key], before.tables[&key]);
        }
        let dst = "10.1.2.4/32".parse().unwrap();
        assert!(state.route(0, &dst).is_some());
        assert!(state.route(other.v4_vrf_id, &dst).is_some());
        assert_eq!(second.list_pods(), vec![other]);
    }

    #[test]
    fn restore_drops_pods_that_cannot_be_rewired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let mut orphan = l3_pod();
        orphan.network_name = Some("gone".into());
        storage::save([&orphan], &path).unwrap();

        let (dp, server) = server(path.clone());
        assert_eq!(server.restore().unwrap(), 0);
        assert!(server.list_pods().is_empty());
        assert!(storage::load(&path).unwrap().is_empty());
        assert_eq!(dp.snapshot().route_count(), 0);
    }

    #[test]
    fn restore_refuses_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, [0, 0, 0, 99, 0, 0, 0, 0]).unwrap();
        let (_, server) = server(path);
        assert!(matches!(
            server.restore(),
            Err(Error::UnsupportedStateVersion { found: 99, .. })
        ));
    }
}
