mod annotation;
mod tag;

pub use annotation::parse_spoof_prefixes;

use std::fmt::{self, Write as _};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::dataplane::{INVALID_ID, IpFamily, IpProto, PortRange};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum InterfaceType {
    #[default]
    Unknown = 0,
    TunTap = 1,
    Memif = 2,
    Vcl = 3,
}

impl TryFrom<u8> for InterfaceType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(InterfaceType::Unknown),
            1 => Ok(InterfaceType::TunTap),
            2 => Ok(InterfaceType::Memif),
            3 => Ok(InterfaceType::Vcl),
            _ => Err(Error::StateDecode(format!("unknown interface type {value}"))),
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterfaceType::Unknown => "Unknown",
            InterfaceType::TunTap => "TunTap",
            InterfaceType::Memif => "Memif",
            InterfaceType::Vcl => "VCL",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSpec {
    pub rx_queues: u32,
    pub tx_queues: u32,
    pub rx_queue_size: u32,
    pub tx_queue_size: u32,
    pub is_l3: bool,
}

impl Default for InterfaceSpec {
    fn default() -> Self {
        Self {
            rx_queues: 1,
            tx_queues: 1,
            rx_queue_size: 0,
            tx_queue_size: 0,
            is_l3: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPortBinding {
    pub host_port: u16,
    pub host_ip4: Option<Ipv4Addr>,
    pub host_ip6: Option<Ipv6Addr>,
    pub container_port: u16,
    pub entry_id: u32,
    pub protocol: IpProto,
}

impl fmt::Display for HostPortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.protocol)?;
        if let Some(ip) = self.host_ip4 {
            write!(f, " {ip}")?;
        }
        if let Some(ip) = self.host_ip6 {
            write!(f, " {ip}")?;
        }
        write!(
            f,
            ":{} cport={} id={}",
            self.host_port, self.container_port, self.entry_id
        )
    }
}

/// Everything needed to wire one pod interface into the router, plus the
/// handles of what was created for it.
///
/// Identity fields are fixed at creation. Handle fields are written only by
/// the provisioner and hold [`INVALID_ID`] until the resource exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodNetworkSpec {
    pub interface_name: String,
    pub netns_name: String,
    pub allow_ip_forwarding: bool,
    pub routes: Vec<IpNetwork>,
    pub container_ips: Vec<IpAddr>,
    pub mtu: u32,

    pub orchestrator_id: String,
    pub workload_id: String,
    pub endpoint_id: String,
    pub host_ports: Vec<HostPortBinding>,

    pub if_port_configs: Vec<PortRange>,
    /// Carries traffic matching `if_port_configs`.
    pub port_filtered_if_type: InterfaceType,
    /// Carries everything else.
    pub default_if_type: InterfaceType,
    pub enable_vcl: bool,
    pub enable_memif: bool,

    pub if_spec: InterfaceSpec,
    pub memif_spec: InterfaceSpec,

    pub memif_socket_id: u32,
    pub tun_tap_sw_if_index: u32,
    pub memif_sw_if_index: u32,
    pub loopback_sw_if_index: u32,
    pub port_filter_indexes: Vec<u32>,

    pub v4_vrf_id: u32,
    pub v6_vrf_id: u32,
    pub needs_snat: bool,

    pub network_name: Option<String>,
    /// Raw allowed-spoofing annotation, see [`parse_spoof_prefixes`].
    pub allowed_spoofing_prefixes: String,

    pub v4_rpf_vrf_id: u32,
    pub v6_rpf_vrf_id: u32,
    /// Spoofing prefixes installed in the RPF VRFs. Teardown works from this
    /// record, never from the annotation.
    pub rpf_spoof_prefixes: Vec<IpNetwork>,

    /// Tables the pod VRFs fall through to, resolved when provisioned.
    pub v4_upstream_vrf_id: u32,
    pub v6_upstream_vrf_id: u32,
    /// Network tables holding the container routes of a multi-network pod,
    /// resolved when provisioned.
    pub v4_network_vrf_id: u32,
    pub v6_network_vrf_id: u32,
}

impl Default for PodNetworkSpec {
    fn default() -> Self {
        Self {
            interface_name: String::new(),
            netns_name: String::new(),
            allow_ip_forwarding: false,
            routes: Vec::new(),
            container_ips: Vec::new(),
            mtu: 0,
            orchestrator_id: String::new(),
            workload_id: String::new(),
            endpoint_id: String::new(),
            host_ports: Vec::new(),
            if_port_configs: Vec::new(),
            port_filtered_if_type: InterfaceType::Unknown,
            default_if_type: InterfaceType::TunTap,
            enable_vcl: false,
            enable_memif: false,
            if_spec: InterfaceSpec::default(),
            memif_spec: InterfaceSpec {
                is_l3: false,
                ..Default::default()
            },
            memif_socket_id: INVALID_ID,
            tun_tap_sw_if_index: INVALID_ID,
            memif_sw_if_index: INVALID_ID,
            loopback_sw_if_index: INVALID_ID,
            port_filter_indexes: Vec::new(),
            v4_vrf_id: INVALID_ID,
            v6_vrf_id: INVALID_ID,
            needs_snat: false,
            network_name: None,
            allowed_spoofing_prefixes: String::new(),
            v4_rpf_vrf_id: INVALID_ID,
            v6_rpf_vrf_id: INVALID_ID,
            rpf_spoof_prefixes: Vec::new(),
            v4_upstream_vrf_id: INVALID_ID,
            v6_upstream_vrf_id: INVALID_ID,
            v4_network_vrf_id: INVALID_ID,
            v6_network_vrf_id: INVALID_ID,
        }
    }
}

impl PodNetworkSpec {
    pub fn new(interface_name: impl Into<String>, netns_name: impl Into<String>) -> Self {
        Self {
            interface_name: interface_name.into(),
            netns_name: netns_name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> String {
        key(&self.netns_name, &self.interface_name)
    }

    /// Container addresses as host prefixes (/32 or /128).
    pub fn container_networks(&self) -> Vec<IpNetwork> {
        self.container_ips
            .iter()
            .map(|ip| IpNetwork::from(*ip))
            .collect()
    }

    pub fn has_v4_v6(&self) -> (bool, bool) {
        let has_v4 = self.container_ips.iter().any(|ip| ip.is_ipv4());
        let has_v6 = self.container_ips.iter().any(|ip| ip.is_ipv6());
        (has_v4, has_v6)
    }

    pub fn has_family(&self, family: IpFamily) -> bool {
        let (v4, v6) = self.has_v4_v6();
        match family {
            IpFamily::V4 => v4,
            IpFamily::V6 => v6,
        }
    }

    pub fn vrf_id(&self, family: IpFamily) -> u32 {
        match family {
            IpFamily::V4 => self.v4_vrf_id,
            IpFamily::V6 => self.v6_vrf_id,
        }
    }

    pub fn rpf_vrf_id(&self, family: IpFamily) -> u32 {
        match family {
            IpFamily::V4 => self.v4_rpf_vrf_id,
            IpFamily::V6 => self.v6_rpf_vrf_id,
        }
    }

    pub fn set_vrf_id(&mut self, id: u32, family: IpFamily) {
        match family {
            IpFamily::V4 => self.v4_vrf_id = id,
            IpFamily::V6 => self.v6_vrf_id = id,
        }
    }

    pub fn set_rpf_vrf_id(&mut self, id: u32, family: IpFamily) {
        match family {
            IpFamily::V4 => self.v4_rpf_vrf_id = id,
            IpFamily::V6 => self.v6_rpf_vrf_id = id,
        }
    }

    pub fn upstream_vrf_id(&self, family: IpFamily) -> u32 {
        match family {
            IpFamily::V4 => self.v4_upstream_vrf_id,
            IpFamily::V6 => self.v6_upstream_vrf_id,
        }
    }

    pub fn set_upstream_vrf_id(&mut self, id: u32, family: IpFamily) {
        match family {
            IpFamily::V4 => self.v4_upstream_vrf_id = id,
            IpFamily::V6 => self.v6_upstream_vrf_id = id,
        }
    }

    pub fn network_vrf_id(&self, family: IpFamily) -> u32 {
        match family {
            IpFamily::V4 => self.v4_network_vrf_id,
            IpFamily::V6 => self.v6_network_vrf_id,
        }
    }

    pub fn set_network_vrf_id(&mut self, id: u32, family: IpFamily) {
        match family {
            IpFamily::V4 => self.v4_network_vrf_id = id,
            IpFamily::V6 => self.v6_network_vrf_id = id,
        }
    }

    pub fn is_multi_network(&self) -> bool {
        self.network_name.is_some()
    }

    /// Interface index and layer-3 flag for the given interface type. Memif
    /// falls back to an unset layer-3 handle when the feature is disabled.
    pub fn params_for_if_type(&self, if_type: InterfaceType, memif_enabled: bool) -> (u32, bool) {
        match if_type {
            InterfaceType::TunTap => (self.tun_tap_sw_if_index, self.if_spec.is_l3),
            InterfaceType::Memif if memif_enabled => {
                (self.memif_sw_if_index, self.memif_spec.is_l3)
            }
            _ => (INVALID_ID, true),
        }
    }

    pub fn clear_handles(&mut self) {
        self.memif_socket_id = INVALID_ID;
        self.tun_tap_sw_if_index = INVALID_ID;
        self.memif_sw_if_index = INVALID_ID;
        self.loopback_sw_if_index = INVALID_ID;
        self.port_filter_indexes.clear();
        self.v4_vrf_id = INVALID_ID;
        self.v6_vrf_id = INVALID_ID;
        self.v4_rpf_vrf_id = INVALID_ID;
        self.v6_rpf_vrf_id = INVALID_ID;
        self.rpf_spoof_prefixes.clear();
        self.v4_upstream_vrf_id = INVALID_ID;
        self.v6_upstream_vrf_id = INVALID_ID;
        self.v4_network_vrf_id = INVALID_ID;
        self.v6_network_vrf_id = INVALID_ID;
    }

    pub fn handles_unset(&self) -> bool {
        [
            self.memif_socket_id,
            self.tun_tap_sw_if_index,
            self.memif_sw_if_index,
            self.loopback_sw_if_index,
            self.v4_vrf_id,
            self.v6_vrf_id,
            self.v4_rpf_vrf_id,
            self.v6_rpf_vrf_id,
            self.v4_upstream_vrf_id,
            self.v6_upstream_vrf_id,
            self.v4_network_vrf_id,
            self.v6_network_vrf_id,
        ]
        .iter()
        .all(|h| *h == INVALID_ID)
            && self.port_filter_indexes.is_empty()
            && self.rpf_spoof_prefixes.is_empty()
    }

    /// True once the interface exists and every address family in use has its
    /// pod VRF.
    pub fn is_provisioned(&self) -> bool {
        self.tun_tap_sw_if_index != INVALID_ID
            && IpFamily::ALL
                .iter()
                .filter(|f| self.has_family(**f))
                .all(|f| self.vrf_id(*f) != INVALID_ID)
    }

    pub fn full_string(&self) -> String {
        let join = |items: Vec<String>| items.join(", ");
        let routes = join(self.routes.iter().map(ToString::to_string).collect());
        let ips = join(self.container_ips.iter().map(ToString::to_string).collect());
        let host_ports = join(self.host_ports.iter().map(ToString::to_string).collect());
        let port_configs = join(self.if_port_configs.iter().map(ToString::to_string).collect());
        let spoof = join(self.rpf_spoof_prefixes.iter().map(ToString::to_string).collect());
        let indexes = join(
            self.port_filter_indexes
                .iter()
                .map(ToString::to_string)
                .collect(),
        );

        let mut s = String::new();
        let mut line = |name: &str, value: &dyn fmt::Display| {
            let _ = writeln!(s, "{:<20}{value}", format!("{name}:"));
        };
        line("InterfaceName", &self.interface_name);
        line("NetnsName", &self.netns_name);
        line("AllowIpForwarding", &self.allow_ip_forwarding);
        line("Routes", &routes);
        line("ContainerIps", &ips);
        line("Mtu", &self.mtu);
        line("OrchestratorId", &self.orchestrator_id);
        line("WorkloadId", &self.workload_id);
        line("EndpointId", &self.endpoint_id);
        line("HostPorts", &host_ports);
        line("IfPortConfigs", &port_configs);
        line("PortFilteredIfType", &self.port_filtered_if_type);
        line("DefaultIfType", &self.default_if_type);
        line("EnableVcl", &self.enable_vcl);
        line("EnableMemif", &self.enable_memif);
        line("IsL3", &self.if_spec.is_l3);
        line("MemifSocketId", &self.memif_socket_id);
        line("TunTapSwIfIndex", &self.tun_tap_sw_if_index);
        line("MemifSwIfIndex", &self.memif_sw_if_index);
        line("LoopbackSwIfIndex", &self.loopback_sw_if_index);
        line("PortFilterIndexes", &indexes);
        line("V4VrfId", &self.v4_vrf_id);
        line("V6VrfId", &self.v6_vrf_id);
        line("V4RpfVrfId", &self.v4_rpf_vrf_id);
        line("V6RpfVrfId", &self.v6_rpf_vrf_id);
        line("RpfSpoofPrefixes", &spoof);
        line("V4UpstreamVrfId", &self.v4_upstream_vrf_id);
        line("V6UpstreamVrfId", &self.v6_upstream_vrf_id);
        line("V4NetworkVrfId", &self.v4_network_vrf_id);
        line("V6NetworkVrfId", &self.v6_network_vrf_id);
        line("NeedsSnat", &self.needs_snat);
        line("NetworkName", &self.network_name.as_deref().unwrap_or(""));
        line("AllowedSpoofing", &self.allowed_spoofing_prefixes);
        s
    }
}

pub fn key(netns_name: &str, interface_name: &str) -> String {
    format!("netns:{netns_name},if:{interface_name}")
}

impl fmt::Display for PodNetworkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ips: Vec<String> = self.container_ips.iter().map(ToString::to_string).collect();
        write!(f, "{} [{}]", self.key(), ips.join(", "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec() -> PodNetworkSpec {
        let mut spec = PodNetworkSpec::new("eth0", "/var/run/netns/cni-1234");
        spec.container_ips = vec!["10.1.2.3".parse().unwrap(), "fd00::3".parse().unwrap()];
        spec
    }

    #[test]
    fn new_spec_has_no_handles() {
        let spec = spec();
        assert!(spec.handles_unset());
        assert!(!spec.is_provisioned());
    }

    #[test]
    fn key_and_display() {
        let spec = spec();
        assert_eq!(spec.key(), "netns:/var/run/netns/cni-1234,if:eth0");
        assert_eq!(
            spec.to_string(),
            "netns:/var/run/netns/cni-1234,if:eth0 [10.1.2.3, fd00::3]"
        );
    }

    #[test]
    fn container_networks_are_host_prefixes() {
        let nets = spec().container_networks();
        assert_eq!(nets[0].to_string(), "10.1.2.3/32");
        assert_eq!(nets[1].to_string(), "fd00::3/128");
        assert_eq!(spec().has_v4_v6(), (true, true));
    }

    #[test]
    fn memif_params_follow_feature_flag() {
        let mut spec = spec();
        spec.memif_sw_if_index = 4;
        spec.tun_tap_sw_if_index = 3;
        assert_eq!(spec.params_for_if_type(InterfaceType::Memif, false), (INVALID_ID, true));
        assert_eq!(spec.params_for_if_type(InterfaceType::Memif, true), (4, false));
        assert_eq!(spec.params_for_if_type(InterfaceType::TunTap, false), (3, true));
        assert_eq!(spec.params_for_if_type(InterfaceType::Vcl, true), (INVALID_ID, true));
    }

    #[test]
    fn clear_handles_resets_everything() {
        let mut spec = spec();
        spec.tun_tap_sw_if_index = 1;
        spec.set_vrf_id(1000, IpFamily::V4);
        spec.set_vrf_id(1001, IpFamily::V6);
        spec.set_rpf_vrf_id(1002, IpFamily::V4);
        spec.port_filter_indexes = vec![0, 1];
        spec.rpf_spoof_prefixes = vec!["10.2.0.0/16".parse().unwrap()];
        spec.set_upstream_vrf_id(2, IpFamily::V4);
        spec.set_network_vrf_id(10, IpFamily::V6);
        assert!(spec.is_provisioned());
        spec.clear_handles();
        assert!(spec.handles_unset());
    }

    #[test]
    fn json_without_handles_starts_unset() {
        let spec: PodNetworkSpec = serde_json::from_str(
            r#"{"interface_name":"eth0","netns_name":"/run/netns/a","container_ips":["10.0.0.1"]}"#,
        )
        .unwrap();
        assert!(spec.handles_unset());
        assert_eq!(spec.default_if_type, InterfaceType::TunTap);
    }

    #[test]
    fn full_string_lists_handles() {
        let s = spec().full_string();
        assert!(s.contains("InterfaceName:      eth0\n"));
        assert!(s.contains(&format!("V4VrfId:            {INVALID_ID}\n")));
    }
}
