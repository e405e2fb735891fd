use ahash::HashSet;
use tracing::{error, info, warn};

use super::Provisioner;
use crate::Result;
use crate::cleanup::{CleanupStack, Undo};
use crate::dataplane::{Dataplane, INVALID_ID, IpFamily, Route, RoutePath};
use crate::pod::{PodNetworkSpec, parse_spoof_prefixes};

/// Routes that make up the RPF VRFs of a pod: every container address, plus
/// every recorded spoofing prefix of the same family, reached through the
/// first container address of that family.
fn rpf_routes(spec: &PodNetworkSpec) -> Vec<Route> {
    let mut seen = HashSet::default();
    let mut routes = Vec::new();
    for dst in spec.container_networks() {
        let family = IpFamily::from_network(&dst);
        let table = spec.rpf_vrf_id(family);
        let gw = dst.ip();
        let mut paths = vec![RoutePath::via_gateway(spec.tun_tap_sw_if_index, gw)];
        if spec.memif_sw_if_index != INVALID_ID {
            paths.push(RoutePath::via_gateway(spec.memif_sw_if_index, gw));
        }

        let prefixes = spec
            .rpf_spoof_prefixes
            .iter()
            .filter(|p| IpFamily::from_network(p) == family);
        for dst in std::iter::once(&dst).chain(prefixes) {
            if seen.insert((table, *dst)) {
                routes.push(Route {
                    dst: *dst,
                    paths: paths.clone(),
                    table,
                });
            }
        }
    }
    routes
}

impl<D: Dataplane> Provisioner<D> {
    /// Creates RPF VRFs holding the sources the pod may use and turns on
    /// strict reverse path filtering against them on the tun/tap interface.
    pub fn activate_strict_rpf(
        &self,
        spec: &mut PodNetworkSpec,
        stack: &mut CleanupStack,
    ) -> Result<()> {
        let allowed = parse_spoof_prefixes(&spec.allowed_spoofing_prefixes)?;

        info!("pod(add) create pod rpf vrf");
        for family in IpFamily::ALL {
            let vrf_id = self.dp.allocate_vrf(family, &spec.vrf_tag(family, "RPF"))?;
            stack.push(Undo::VrfDel { vrf_id, family });
            spec.set_rpf_vrf_id(vrf_id, family);
        }
        spec.rpf_spoof_prefixes = allowed;

        info!("pod(add) add routes for rpf vrf");
        for route in rpf_routes(spec) {
            info!("pod(add) route [rpfVRF] {route}");
            self.dp.route_add(&route)?;
            stack.push(Undo::RouteDel(route));
        }

        info!("pod(add) set custom-vrf urpf");
        self.dp
            .set_custom_urpf(spec.tun_tap_sw_if_index, spec.v4_rpf_vrf_id)?;
        stack.push(Undo::UrpfUnset(spec.tun_tap_sw_if_index));
        Ok(())
    }

    /// Removes the RPF VRFs and their routes. Works from the prefixes recorded
    /// at activation, so a changed annotation does not leak routes.
    pub fn deactivate_strict_rpf(&self, spec: &mut PodNetworkSpec) {
        if spec.tun_tap_sw_if_index != INVALID_ID {
            info!("pod(del) unset urpf on if[{}]", spec.tun_tap_sw_if_index);
            if let Err(e) = self.dp.unset_urpf(spec.tun_tap_sw_if_index) {
                warn!(%e, "pod(del) failed to unset urpf");
            }
        }

        for route in rpf_routes(spec) {
            if route.table == INVALID_ID {
                continue;
            }
            info!("pod(del) route [rpfVRF] {route}");
            if let Err(e) = self.dp.route_del(&route) {
                error!(%e, "pod(del) failed to delete rpf route {route}");
            }
        }

        for family in IpFamily::ALL {
            let vrf_id = spec.rpf_vrf_id(family);
            if vrf_id == INVALID_ID {
                continue;
            }
            info!("pod(del) rpf vrf {vrf_id} {family}");
            if let Err(e) = self.dp.delete_vrf(vrf_id, family) {
                error!(%e, "pod(del) failed to delete rpf vrf {vrf_id} {family}");
            }
            spec.set_rpf_vrf_id(INVALID_ID, family);
        }
        spec.rpf_spoof_prefixes.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;
    use crate::provision::ProvisionConfig;
    use crate::provision::test::{dataplane, l3_pod, provisioner};

    #[test]
    fn rpf_vrf_allows_annotated_prefix() {
        let dp = dataplane();
        let p = provisioner(dp.clone(), ProvisionConfig::default());
        let mut spec = l3_pod();
        spec.allowed_spoofing_prefixes = r#"["10.2.0.0/16"]"#.into();
        p.provision_pod(&mut spec).unwrap();

        let rpf = spec.v4_rpf_vrf_id;
        assert_ne!(rpf, INVALID_ID);
        assert_ne!(spec.v6_rpf_vrf_id, INVALID_ID);
        let state = dp.snapshot();
        let via_tun = vec![RoutePath::via_gateway(
            spec.tun_tap_sw_if_index,
            "10.1.2.3".parse().unwrap(),
        )];
        assert_eq!(state.route(rpf, &"10.1.2.3/32".parse().unwrap()), Some(&via_tun));
        assert_eq!(state.route(rpf, &"10.2.0.0/16".parse().unwrap()), Some(&via_tun));
        assert_eq!(
            state.interfaces[&spec.tun_tap_sw_if_index].urpf_table,
            Some(rpf)
        );
        let tag = &state.tables[&(IpFamily::V4, rpf)].tag;
        assert!(tag.contains("-4-eth0RPF-"));

        p.deactivate_strict_rpf(&mut spec);
        let state = dp.snapshot();
        assert_eq!(state.interfaces[&spec.tun_tap_sw_if_index].urpf_table, None);
        assert!(!state.tables.contains_key(&(IpFamily::V4, rpf)));
        assert_eq!(spec.v4_rpf_vrf_id, INVALID_ID);
        assert!(spec.rpf_spoof_prefixes.is_empty());
    }

    #[test]
    fn teardown_ignores_annotation_changed_after_activation() {
        let dp = dataplane();
        let initial = dp.snapshot();
        let p = provisioner(dp.clone(), ProvisionConfig::default());
        let mut spec = l3_pod();
        spec.allowed_spoofing_prefixes = "10.2.0.0/16".into();
        p.provision_pod(&mut spec).unwrap();
        assert_eq!(
            spec.rpf_spoof_prefixes,
            vec!["10.2.0.0/16".parse::<ipnetwork::IpNetwork>().unwrap()]
        );

        spec.allowed_spoofing_prefixes = "10.2.0.0/16;".into();
        assert!(parse_spoof_prefixes(&spec.allowed_spoofing_prefixes).is_err());
        p.deprovision_pod(&mut spec);

        assert_eq!(dp.snapshot(), initial);
        assert!(spec.handles_unset());
    }

    #[test]
    fn config_enables_rpf_without_annotation() {
        let dp = dataplane();
        let p = provisioner(
            dp.clone(),
            ProvisionConfig {
                strict_rpf: true,
                ..Default::default()
            },
        );
        let mut spec = l3_pod();
        p.provision_pod(&mut spec).unwrap();
        let state = dp.snapshot();
        assert_eq!(state.tables[&(IpFamily::V4, spec.v4_rpf_vrf_id)].routes.len(), 1);
        assert!(state.tables[&(IpFamily::V6, spec.v6_rpf_vrf_id)].routes.is_empty());
    }

    #[test]
    fn bad_annotation_fails_activation_and_rolls_back() {
        let dp = dataplane();
        let initial = dp.snapshot();
        let p = provisioner(dp.clone(), ProvisionConfig::default());
        let mut spec = l3_pod();
        spec.allowed_spoofing_prefixes = "10.2.0.0/99".into();

        let err = p.provision_pod(&mut spec).unwrap_err();
        let Error::Provision { step, source } = err else {
            panic!("unexpected error");
        };
        assert_eq!(step, "strict rpf");
        assert!(matches!(*source, Error::InvalidAnnotation(_)));
        assert_eq!(dp.snapshot(), initial);
    }

    #[test]
    fn shared_prefix_is_added_once() {
        let mut spec = l3_pod();
        spec.container_ips.push("10.1.2.4".parse().unwrap());
        spec.tun_tap_sw_if_index = 1;
        spec.v4_rpf_vrf_id = 1000;
        spec.rpf_spoof_prefixes = parse_spoof_prefixes("10.2.0.0/16, fd00::/64").unwrap();
        let routes = rpf_routes(&spec);
        let dsts: Vec<String> = routes.iter().map(|r| r.dst.to_string()).collect();
        assert_eq!(dsts, ["10.1.2.3/32", "10.2.0.0/16", "10.1.2.4/32"]);
    }
}
