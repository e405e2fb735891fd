//! Contract with the software router.
//!
//! Every mutating call either applies fully or fails with no effect, so the
//! provisioning engine only has to undo the calls that returned `Ok`.

mod memory;

pub use memory::{Call, DataplaneState, Interface, InterfaceKind, MemoryDataplane, Table};

use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Sentinel for interface indexes, VRF ids and client indexes that are not set.
pub const INVALID_ID: u32 = u32::MAX;

/// Dataplane API tags are limited to 64 bytes including the terminator.
pub const MAX_API_TAG_LEN: usize = 63;

/// Hardware address installed for container peers, which have no real link
/// layer presence on the router side.
pub const CONTAINER_SIDE_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub const ALL: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];

    pub fn from_ip(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    pub fn from_network(net: &IpNetwork) -> Self {
        match net {
            IpNetwork::V4(_) => IpFamily::V4,
            IpNetwork::V6(_) => IpFamily::V6,
        }
    }

    pub fn short_str(&self) -> &'static str {
        match self {
            IpFamily::V4 => "4",
            IpFamily::V6 => "6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IP4"),
            IpFamily::V6 => write!(f, "IP6"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum IpProto {
    #[default]
    Tcp = 6,
    Udp = 17,
    Sctp = 132,
    Icmp = 1,
    Icmp6 = 58,
}

impl TryFrom<u8> for IpProto {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        let proto = match value {
            6 => IpProto::Tcp,
            17 => IpProto::Udp,
            132 => IpProto::Sctp,
            1 => IpProto::Icmp,
            58 => IpProto::Icmp6,
            _ => return Err(Error::StateDecode(format!("unknown ip protocol {value}"))),
        };
        Ok(proto)
    }
}

impl fmt::Display for IpProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IpProto::Tcp => "TCP",
            IpProto::Udp => "UDP",
            IpProto::Sctp => "SCTP",
            IpProto::Icmp => "ICMP",
            IpProto::Icmp6 => "ICMP6",
        };
        write!(f, "{s}")
    }
}

/// One next hop of a route. A path without an interface redirects the lookup
/// into `table`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoutePath {
    pub sw_if_index: u32,
    pub gw: Option<IpAddr>,
    pub table: Option<u32>,
}

impl RoutePath {
    pub fn via_interface(sw_if_index: u32) -> Self {
        Self {
            sw_if_index,
            gw: None,
            table: None,
        }
    }

    pub fn via_gateway(sw_if_index: u32, gw: IpAddr) -> Self {
        Self {
            sw_if_index,
            gw: Some(gw),
            table: None,
        }
    }

    pub fn via_table(table: u32) -> Self {
        Self {
            sw_if_index: INVALID_ID,
            gw: None,
            table: Some(table),
        }
    }
}

impl fmt::Display for RoutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(table) = self.table {
            write!(f, "tbl:{table}")?;
        }
        if self.sw_if_index != INVALID_ID {
            write!(f, "if[{}]", self.sw_if_index)?;
        }
        if let Some(gw) = self.gw {
            write!(f, " gw:{gw}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    pub dst: IpNetwork,
    pub paths: Vec<RoutePath>,
    pub table: u32,
}

impl Route {
    pub fn family(&self) -> IpFamily {
        IpFamily::from_network(&self.dst)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[vrf:{}] {} ->", self.table, self.dst)?;
        for path in &self.paths {
            write!(f, " [{path}]")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Neighbor {
    pub sw_if_index: u32,
    pub ip: IpAddr,
    pub hardware_addr: MacAddr,
    pub is_static: bool,
}

impl fmt::Display for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if[{}] {} {}", self.sw_if_index, self.ip, self.hardware_addr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
    pub proto: IpProto,
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}-{}", self.proto, self.start, self.end)
    }
}

/// Redirects traffic for `addr` matching `port_ranges` to `path`, looked up in
/// `table_id`, independently of the address's regular route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortFilterClient {
    pub table_id: u32,
    pub addr: IpAddr,
    pub path: RoutePath,
    pub port_ranges: Vec<PortRange>,
}

pub trait Dataplane: Send + Sync {
    fn route_add(&self, route: &Route) -> Result<()>;
    fn route_del(&self, route: &Route) -> Result<()>;

    fn allocate_vrf(&self, family: IpFamily, tag: &str) -> Result<u32>;
    fn delete_vrf(&self, vrf_id: u32, family: IpFamily) -> Result<()>;

    fn add_neighbor(&self, neighbor: &Neighbor) -> Result<()>;
    fn del_neighbor(&self, neighbor: &Neighbor) -> Result<()>;

    fn add_port_filter_client(&self, client: &PortFilterClient) -> Result<u32>;
    fn del_port_filter_client(&self, index: u32) -> Result<()>;

    /// Enables strict reverse path filtering on the interface, with source
    /// lookups done in `table_id`.
    fn set_custom_urpf(&self, sw_if_index: u32, table_id: u32) -> Result<()>;
    fn unset_urpf(&self, sw_if_index: u32) -> Result<()>;

    fn add_default_route_via_table(&self, vrf_id: u32, via: u32, family: IpFamily) -> Result<()>;
    fn del_default_route_via_table(&self, vrf_id: u32, via: u32, family: IpFamily) -> Result<()>;
    fn add_default_mroute_via_table(&self, vrf_id: u32, via: u32, family: IpFamily)
    -> Result<()>;
    fn del_default_mroute_via_table(&self, vrf_id: u32, via: u32, family: IpFamily)
    -> Result<()>;

    fn create_tun_tap(&self, tag: &str, mtu: u32) -> Result<u32>;
    fn create_memif(&self, tag: &str, socket_id: u32) -> Result<u32>;
    fn delete_interface(&self, sw_if_index: u32) -> Result<()>;
}
