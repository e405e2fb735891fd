use std::net::IpAddr;

use tracing::{error, info, warn};

use super::Provisioner;
use crate::Result;
use crate::cleanup::{CleanupStack, Undo};
use crate::dataplane::{
    CONTAINER_SIDE_MAC, Dataplane, INVALID_ID, IpFamily, Neighbor, PortFilterClient, Route,
    RoutePath,
};
use crate::pod::PodNetworkSpec;

fn container_neighbor(sw_if_index: u32, ip: IpAddr) -> Neighbor {
    Neighbor {
        sw_if_index,
        ip,
        hardware_addr: CONTAINER_SIDE_MAC,
        is_static: true,
    }
}

impl<D: Dataplane> Provisioner<D> {
    /// Table holding the route towards the pod interface. Multi-network pods
    /// use the network table recorded at provisioning; a network that was
    /// never resolved falls back to the main table.
    fn container_table(&self, spec: &PodNetworkSpec, family: IpFamily, in_pod_vrf: bool) -> u32 {
        if let Some(name) = &spec.network_name {
            let recorded = spec.network_vrf_id(family);
            if recorded != INVALID_ID {
                return recorded;
            }
            let Some(network) = self.networks.get(name) else {
                error!("network not found {name}");
                return 0;
            };
            return network.vrf.table(family).unwrap_or_else(|| {
                warn!("network {name} has no {family} vrf table, using table 0");
                0
            });
        }
        if in_pod_vrf { spec.vrf_id(family) } else { 0 }
    }

    fn interface_routes(
        &self,
        spec: &PodNetworkSpec,
        sw_if_index: u32,
        in_pod_vrf: bool,
    ) -> Vec<Route> {
        spec.container_networks()
            .into_iter()
            .map(|dst| Route {
                dst,
                paths: vec![RoutePath::via_interface(sw_if_index)],
                table: self.container_table(spec, IpFamily::from_network(&dst), in_pod_vrf),
            })
            .collect()
    }

    /// Routes every container address to `sw_if_index`. Layer-2 interfaces
    /// also get a static neighbor entry per address.
    pub fn route_container_to_interface(
        &self,
        spec: &PodNetworkSpec,
        stack: &mut CleanupStack,
        sw_if_index: u32,
        is_l3: bool,
        in_pod_vrf: bool,
    ) -> Result<()> {
        for route in self.interface_routes(spec, sw_if_index, in_pod_vrf) {
            info!("pod(add) route [podVRF->mainIF] {route}");
            self.dp.route_add(&route)?;
            let ip = route.dst.ip();
            stack.push(Undo::RouteDel(route));

            if !is_l3 {
                let neighbor = container_neighbor(sw_if_index, ip);
                info!("pod(add) neighbor {neighbor}");
                self.dp.add_neighbor(&neighbor)?;
                stack.push(Undo::NeighborDel(neighbor));
            }
        }
        Ok(())
    }

    pub fn unroute_container_from_interface(
        &self,
        spec: &PodNetworkSpec,
        sw_if_index: u32,
        is_l3: bool,
        in_pod_vrf: bool,
    ) {
        for route in self.interface_routes(spec, sw_if_index, in_pod_vrf) {
            if !is_l3 {
                let neighbor = container_neighbor(sw_if_index, route.dst.ip());
                info!("pod(del) neighbor {neighbor}");
                if let Err(e) = self.dp.del_neighbor(&neighbor) {
                    warn!(%e, "pod(del) failed to delete neighbor {neighbor}");
                }
            }
            info!("pod(del) route [podVRF->mainIF] {route}");
            if let Err(e) = self.dp.route_del(&route) {
                warn!(%e, "pod(del) failed to delete route {route}");
            }
        }
    }

    /// Installs one port-filter client per container address so traffic in
    /// the pod's port ranges reaches `sw_if_index` instead of the default
    /// interface.
    pub fn route_port_filtered_interface(
        &self,
        spec: &mut PodNetworkSpec,
        stack: &mut CleanupStack,
        sw_if_index: u32,
        is_l3: bool,
    ) -> Result<()> {
        for ip in spec.container_ips.clone() {
            let family = IpFamily::from_ip(&ip);
            let path = if is_l3 {
                RoutePath::via_interface(sw_if_index)
            } else {
                RoutePath::via_gateway(sw_if_index, ip)
            };
            let table_id = if spec.enable_vcl {
                self.config.punt_table_id
            } else {
                spec.vrf_id(family)
            };
            let client = PortFilterClient {
                table_id,
                addr: ip,
                path,
                port_ranges: spec.if_port_configs.clone(),
            };

            info!("pod(add) port filter client for {ip} vrf {table_id}");
            let index = self.dp.add_port_filter_client(&client)?;
            stack.push(Undo::PortFilterClientDel(index));
            spec.port_filter_indexes.push(index);

            if !is_l3 {
                let neighbor = container_neighbor(sw_if_index, ip);
                info!("pod(add) neighbor {neighbor}");
                self.dp.add_neighbor(&neighbor)?;
                stack.push(Undo::NeighborDel(neighbor));
            }
        }
        Ok(())
    }

    pub fn unroute_port_filtered_interface(
        &self,
        spec: &mut PodNetworkSpec,
        sw_if_index: u32,
        is_l3: bool,
    ) {
        for index in spec.port_filter_indexes.drain(..) {
            info!("pod(del) port filter client[{index}]");
            if let Err(e) = self.dp.del_port_filter_client(index) {
                warn!(%e, "pod(del) failed to delete port filter client {index}");
            }
        }
        if is_l3 || sw_if_index == INVALID_ID {
            return;
        }
        for ip in &spec.container_ips {
            let neighbor = container_neighbor(sw_if_index, *ip);
            info!("pod(del) neighbor {neighbor}");
            if let Err(e) = self.dp.del_neighbor(&neighbor) {
                warn!(%e, "pod(del) failed to delete neighbor {neighbor}");
            }
        }
    }

    fn punt_routes(&self, spec: &PodNetworkSpec, sw_if_index: u32) -> Vec<Route> {
        spec.container_networks()
            .into_iter()
            .map(|dst| Route {
                dst,
                paths: vec![RoutePath::via_interface(sw_if_index)],
                table: self.config.punt_table_id,
            })
            .collect()
    }

    /// Routes the container addresses to `sw_if_index` in the punt table,
    /// where punted traffic ends up.
    pub fn route_punt_table(
        &self,
        spec: &PodNetworkSpec,
        stack: &mut CleanupStack,
        sw_if_index: u32,
    ) -> Result<()> {
        for route in self.punt_routes(spec, sw_if_index) {
            info!("pod(add) route [puntVRF->puntIF] {route}");
            self.dp.route_add(&route)?;
            stack.push(Undo::RouteDel(route));
        }
        Ok(())
    }

    pub fn remove_punt_routes(&self, spec: &PodNetworkSpec, sw_if_index: u32) {
        for route in self.punt_routes(spec, sw_if_index) {
            info!("pod(del) route [puntVRF->puntIF] {route}");
            if let Err(e) = self.dp.route_del(&route) {
                error!(%e, "pod(del) failed to delete route {route}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataplane::{IpProto, PortRange};
    use crate::provision::test::{dataplane, l3_pod, provisioner};
    use crate::provision::{DEFAULT_PUNT_TABLE_ID, ProvisionConfig};

    #[test]
    fn layer2_interface_gets_static_neighbors() {
        let dp = dataplane();
        let p = provisioner(dp.clone(), ProvisionConfig::default());
        let spec = l3_pod();
        let tun = dp.create_tun_tap("tun", 1500).unwrap();
        let mut stack = CleanupStack::new();

        p.route_container_to_interface(&spec, &mut stack, tun, false, false)
            .unwrap();
        let state = dp.snapshot();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(state.neighbors[&(tun, ip)], CONTAINER_SIDE_MAC);
        // outside the pod vrf the route lands in the main table
        assert!(state.route(0, &"10.1.2.3/32".parse().unwrap()).is_some());
        assert_eq!(stack.len(), 2);

        p.unroute_container_from_interface(&spec, tun, false, false);
        let state = dp.snapshot();
        assert!(state.neighbors.is_empty());
        assert_eq!(state.route_count(), 0);
    }

    #[test]
    fn vcl_port_filter_clients_use_punt_table() {
        let dp = dataplane();
        let p = provisioner(dp.clone(), ProvisionConfig::default());
        let mut spec = l3_pod();
        spec.enable_vcl = true;
        spec.if_port_configs = vec![PortRange {
            start: 53,
            end: 53,
            proto: IpProto::Udp,
        }];
        let tun = dp.create_tun_tap("tun", 1500).unwrap();
        let mut stack = CleanupStack::new();

        p.route_port_filtered_interface(&mut spec, &mut stack, tun, true)
            .unwrap();
        assert_eq!(spec.port_filter_indexes.len(), 1);
        let state = dp.snapshot();
        let client = &state.port_filter_clients[&spec.port_filter_indexes[0]];
        assert_eq!(client.table_id, DEFAULT_PUNT_TABLE_ID);
        assert_eq!(client.path, RoutePath::via_interface(tun));
        assert_eq!(client.port_ranges, spec.if_port_configs);

        p.unroute_port_filtered_interface(&mut spec, tun, true);
        assert!(spec.port_filter_indexes.is_empty());
        assert!(dp.snapshot().port_filter_clients.is_empty());
    }

    #[test]
    fn punt_routes_follow_config() {
        let dp = dataplane();
        dp.ensure_table(9, "punt");
        let p = provisioner(
            dp.clone(),
            ProvisionConfig {
                punt_table_id: 9,
                ..Default::default()
            },
        );
        let spec = l3_pod();
        let tun = dp.create_tun_tap("tun", 1500).unwrap();
        let mut stack = CleanupStack::new();
        p.route_punt_table(&spec, &mut stack, tun).unwrap();
        assert!(dp.snapshot().route(9, &"10.1.2.3/32".parse().unwrap()).is_some());

        assert_eq!(stack.unwind(p.dataplane()), 0);
        assert_eq!(dp.snapshot().route_count(), 0);
    }
}
