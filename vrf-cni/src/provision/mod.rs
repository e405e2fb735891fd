//! Turns a [`PodNetworkSpec`] into router state.
//!
//! Forward operations push one [`Undo`] per successful dataplane call and
//! return at the first failure. Teardown operations log failures and keep
//! going, so they can run against partially present state.

mod routes;
mod rpf;
mod vrf;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cleanup::{CleanupStack, Undo};
use crate::dataplane::{Dataplane, INVALID_ID, IpFamily};
use crate::network::NetworkRegistry;
use crate::pod::PodNetworkSpec;
use crate::{Error, Result};

pub const DEFAULT_POD_VRF_INDEX: u32 = 2;
pub const DEFAULT_PUNT_TABLE_ID: u32 = 1;
const DEFAULT_MEMIF_SOCKET_ID: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Table single-network pod VRFs fall through to.
    pub pod_vrf_index: u32,
    /// Table holding routes for traffic punted to the host.
    pub punt_table_id: u32,
    /// Enable strict reverse path filtering on every pod.
    pub strict_rpf: bool,
    pub memif_enabled: bool,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            pod_vrf_index: DEFAULT_POD_VRF_INDEX,
            punt_table_id: DEFAULT_PUNT_TABLE_ID,
            strict_rpf: false,
            memif_enabled: false,
        }
    }
}

pub struct Provisioner<D> {
    dp: Arc<D>,
    networks: Arc<NetworkRegistry>,
    config: ProvisionConfig,
}

impl<D: Dataplane> Provisioner<D> {
    pub fn new(dp: Arc<D>, networks: Arc<NetworkRegistry>, config: ProvisionConfig) -> Self {
        Self {
            dp,
            networks,
            config,
        }
    }

    pub fn dataplane(&self) -> &D {
        &self.dp
    }

    /// Wires the whole pod. On failure every resource created by this call is
    /// removed again and all handles of `spec` are unset.
    pub fn provision_pod(&self, spec: &mut PodNetworkSpec) -> Result<()> {
        if !spec.handles_unset() {
            debug!("pod(add) {spec} discarding stale handles");
            spec.clear_handles();
        }
        let mut stack = CleanupStack::new();
        match self.provision_steps(spec, &mut stack) {
            Ok(()) => {
                info!("pod(add) {spec} done, {} resources", stack.len());
                Ok(())
            }
            Err(e) => {
                error!(%e, "pod(add) {spec} failed, rolling back {} steps", stack.len());
                let failed = stack.unwind(self.dataplane());
                if failed > 0 {
                    warn!("pod(add) {spec} rollback left {failed} resources behind");
                }
                spec.clear_handles();
                Err(e)
            }
        }
    }

    fn provision_steps(&self, spec: &mut PodNetworkSpec, stack: &mut CleanupStack) -> Result<()> {
        self.allocate_pod_vrfs(spec, stack)
            .map_err(|e| Error::provision("pod vrf", e))?;

        let tag = spec.interface_tag("tun");
        info!("pod(add) tun/tap {tag}");
        let tun = self
            .dp
            .create_tun_tap(&tag, spec.mtu)
            .map_err(|e| Error::provision("tun/tap interface", e))?;
        stack.push(Undo::InterfaceDel(tun));
        spec.tun_tap_sw_if_index = tun;

        if self.config.memif_enabled && spec.enable_memif && !spec.is_multi_network() {
            let tag = spec.interface_tag("memif");
            info!("pod(add) memif {tag}");
            let memif = self
                .dp
                .create_memif(&tag, DEFAULT_MEMIF_SOCKET_ID)
                .map_err(|e| Error::provision("memif interface", e))?;
            stack.push(Undo::InterfaceDel(memif));
            spec.memif_sw_if_index = memif;
            spec.memif_socket_id = DEFAULT_MEMIF_SOCKET_ID;
        }

        let (sw_if_index, is_l3) =
            spec.params_for_if_type(spec.default_if_type, self.config.memif_enabled);
        if sw_if_index != INVALID_ID {
            self.route_container_to_interface(spec, stack, sw_if_index, is_l3, true)
                .map_err(|e| Error::provision("pod interface routes", e))?;
        } else {
            info!("pod(add) {spec} has no default interface");
        }

        self.route_punt_table(spec, stack, tun)
            .map_err(|e| Error::provision("punt routes", e))?;

        if !spec.if_port_configs.is_empty() {
            let (sw_if_index, is_l3) =
                spec.params_for_if_type(spec.port_filtered_if_type, self.config.memif_enabled);
            if sw_if_index != INVALID_ID {
                self.route_port_filtered_interface(spec, stack, sw_if_index, is_l3)
                    .map_err(|e| Error::provision("port filtered routes", e))?;
            } else {
                warn!(
                    "pod(add) {spec} port ranges set but {} interface unavailable",
                    spec.port_filtered_if_type
                );
            }
        }

        self.route_main_table_to_pod_vrf(spec, stack)
            .map_err(|e| Error::provision("main table routes", e))?;

        if self.wants_strict_rpf(spec) {
            self.activate_strict_rpf(spec, stack)
                .map_err(|e| Error::provision("strict rpf", e))?;
        }
        Ok(())
    }

    fn wants_strict_rpf(&self, spec: &PodNetworkSpec) -> bool {
        self.config.strict_rpf || !spec.allowed_spoofing_prefixes.trim().is_empty()
    }

    /// Removes everything [`Provisioner::provision_pod`] may have created.
    /// Missing resources are logged and skipped.
    pub fn deprovision_pod(&self, spec: &mut PodNetworkSpec) {
        info!("pod(del) {spec}");
        if IpFamily::ALL
            .iter()
            .any(|f| spec.rpf_vrf_id(*f) != INVALID_ID)
        {
            self.deactivate_strict_rpf(spec);
        }

        self.delete_main_table_routes(spec);

        if !spec.port_filter_indexes.is_empty() {
            let (sw_if_index, is_l3) =
                spec.params_for_if_type(spec.port_filtered_if_type, self.config.memif_enabled);
            self.unroute_port_filtered_interface(spec, sw_if_index, is_l3);
        }

        if spec.tun_tap_sw_if_index != INVALID_ID {
            self.remove_punt_routes(spec, spec.tun_tap_sw_if_index);
        }

        let (sw_if_index, is_l3) =
            spec.params_for_if_type(spec.default_if_type, self.config.memif_enabled);
        if sw_if_index != INVALID_ID {
            self.unroute_container_from_interface(spec, sw_if_index, is_l3, true);
        }

        for sw_if_index in [spec.memif_sw_if_index, spec.tun_tap_sw_if_index] {
            if sw_if_index == INVALID_ID {
                continue;
            }
            info!("pod(del) interface if[{sw_if_index}]");
            if let Err(e) = self.dp.delete_interface(sw_if_index) {
                warn!(%e, "pod(del) failed to delete interface if[{sw_if_index}]");
            }
        }

        self.delete_pod_vrfs(spec);
        spec.clear_handles();
    }
}
