use tracing::{debug, error, info, warn};

use super::Provisioner;
use crate::cleanup::{CleanupStack, Undo};
use crate::dataplane::{Dataplane, INVALID_ID, IpFamily, Route, RoutePath};
use crate::pod::PodNetworkSpec;
use crate::{Error, Result};

impl<D: Dataplane> Provisioner<D> {
    /// Records the tables the pod routes through: the table its VRFs fall
    /// through to and, for multi-network pods, the network's own table.
    /// Teardown uses the recorded values, so a definition removed later does
    /// not change what gets deleted.
    fn resolve_network_tables(&self, spec: &mut PodNetworkSpec) -> Result<()> {
        let Some(name) = spec.network_name.clone() else {
            for family in IpFamily::ALL {
                spec.set_upstream_vrf_id(self.config.pod_vrf_index, family);
            }
            return Ok(());
        };
        let network = self
            .networks
            .get(&name)
            .ok_or_else(|| Error::NetworkNotFound(name.clone()))?;
        for family in IpFamily::ALL {
            let upstream = network.pod_vrf.table(family).unwrap_or_else(|| {
                warn!("network {name} has no {family} pod vrf table, using table 0");
                0
            });
            let vrf = network.vrf.table(family).unwrap_or_else(|| {
                warn!("network {name} has no {family} vrf table, using table 0");
                0
            });
            spec.set_upstream_vrf_id(upstream, family);
            spec.set_network_vrf_id(vrf, family);
        }
        Ok(())
    }

    /// Allocates one VRF per family and points its default unicast and
    /// multicast routes at the upstream table.
    pub fn allocate_pod_vrfs(
        &self,
        spec: &mut PodNetworkSpec,
        stack: &mut CleanupStack,
    ) -> Result<()> {
        self.resolve_network_tables(spec)?;
        for family in IpFamily::ALL {
            let vrf_id = self.dp.allocate_vrf(family, &spec.vrf_tag(family, ""))?;
            debug!("allocated {family} vrf {vrf_id}");
            stack.push(Undo::VrfDel { vrf_id, family });
            spec.set_vrf_id(vrf_id, family);
        }

        for family in IpFamily::ALL {
            let vrf_id = spec.vrf_id(family);
            let via = spec.upstream_vrf_id(family);
            info!("pod(add) vrf {vrf_id} {family} default route via vrf {via}");
            self.dp.add_default_route_via_table(vrf_id, via, family)?;
            stack.push(Undo::DefaultRouteDel {
                vrf_id,
                via,
                family,
            });
            self.dp.add_default_mroute_via_table(vrf_id, via, family)?;
            stack.push(Undo::DefaultMrouteDel {
                vrf_id,
                via,
                family,
            });
        }
        Ok(())
    }

    pub fn delete_pod_vrfs(&self, spec: &mut PodNetworkSpec) {
        for family in IpFamily::ALL {
            let vrf_id = spec.vrf_id(family);
            if vrf_id == INVALID_ID {
                continue;
            }
            let via = spec.upstream_vrf_id(family);
            if via == INVALID_ID {
                warn!("pod(del) vrf {vrf_id} {family} has no recorded upstream table");
                continue;
            }
            info!("pod(del) vrf {vrf_id} {family} default route via vrf {via}");
            if let Err(e) = self.dp.del_default_route_via_table(vrf_id, via, family) {
                error!(%e, "pod(del) failed to delete vrf {vrf_id} {family} default route");
            }
            if let Err(e) = self.dp.del_default_mroute_via_table(vrf_id, via, family) {
                error!(%e, "pod(del) failed to delete vrf {vrf_id} {family} default mroute");
            }
        }

        for family in IpFamily::ALL {
            let vrf_id = spec.vrf_id(family);
            if vrf_id == INVALID_ID {
                continue;
            }
            info!("pod(del) vrf {vrf_id} {family}");
            if let Err(e) = self.dp.delete_vrf(vrf_id, family) {
                error!(%e, "pod(del) failed to delete vrf {vrf_id} {family}");
            }
            spec.set_vrf_id(INVALID_ID, family);
        }
    }

    fn main_table_routes(spec: &PodNetworkSpec) -> impl Iterator<Item = Route> + '_ {
        spec.container_networks().into_iter().map(move |dst| Route {
            dst,
            paths: vec![RoutePath::via_table(
                spec.vrf_id(IpFamily::from_network(&dst)),
            )],
            table: 0,
        })
    }

    /// Sends traffic for the container addresses from the main table into the
    /// pod VRF.
    pub fn route_main_table_to_pod_vrf(
        &self,
        spec: &PodNetworkSpec,
        stack: &mut CleanupStack,
    ) -> Result<()> {
        for route in Self::main_table_routes(spec) {
            info!("pod(add) route [mainVRF->podVRF] {route}");
            self.dp.route_add(&route)?;
            stack.push(Undo::RouteDel(route));
        }
        Ok(())
    }

    pub fn delete_main_table_routes(&self, spec: &PodNetworkSpec) {
        for route in Self::main_table_routes(spec) {
            info!("pod(del) route [mainVRF->podVRF] {route}");
            if let Err(e) = self.dp.route_del(&route) {
                error!(%e, "pod(del) failed to delete route {route}");
            }
        }
    }
}
