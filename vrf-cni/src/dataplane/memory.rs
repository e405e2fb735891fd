use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ahash::HashMap;
use tracing::debug;

use super::{
    Dataplane, INVALID_ID, IpFamily, MAX_API_TAG_LEN, MacAddr, Neighbor, PortFilterClient, Route,
    RoutePath,
};
use crate::{Error, Result};

const FIRST_DYNAMIC_VRF_ID: u32 = 1000;
const FIRST_SW_IF_INDEX: u32 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Table {
    pub tag: String,
    pub routes: HashMap<(IpAddr, u8), Vec<RoutePath>>,
    pub default_via: Option<u32>,
    pub default_mroute_via: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceKind {
    TunTap { mtu: u32 },
    Memif { socket_id: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    pub tag: String,
    pub kind: InterfaceKind,
    pub urpf_table: Option<u32>,
}

/// Everything the router would hold, minus allocation counters, so two
/// snapshots compare equal when the same resources exist.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataplaneState {
    pub tables: HashMap<(IpFamily, u32), Table>,
    pub neighbors: HashMap<(u32, IpAddr), MacAddr>,
    pub port_filter_clients: HashMap<u32, PortFilterClient>,
    pub interfaces: HashMap<u32, Interface>,
}

impl DataplaneState {
    pub fn route(&self, table: u32, dst: &ipnetwork::IpNetwork) -> Option<&Vec<RoutePath>> {
        let family = IpFamily::from_network(dst);
        self.tables
            .get(&(family, table))
            .and_then(|t| t.routes.get(&(dst.network(), dst.prefix())))
    }

    pub fn route_count(&self) -> usize {
        self.tables.values().map(|t| t.routes.len()).sum()
    }
}

/// A dataplane call as seen by the router, recorded whether or not it
/// succeeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    RouteAdd(Route),
    RouteDel(Route),
    AllocateVrf { family: IpFamily, tag: String },
    DeleteVrf { vrf_id: u32, family: IpFamily },
    AddNeighbor(Neighbor),
    DelNeighbor(Neighbor),
    AddPortFilterClient(PortFilterClient),
    DelPortFilterClient(u32),
    SetUrpf { sw_if_index: u32, table_id: u32 },
    UnsetUrpf(u32),
    AddDefaultRoute { vrf_id: u32, via: u32, family: IpFamily },
    DelDefaultRoute { vrf_id: u32, via: u32, family: IpFamily },
    AddDefaultMroute { vrf_id: u32, via: u32, family: IpFamily },
    DelDefaultMroute { vrf_id: u32, via: u32, family: IpFamily },
    CreateTunTap { tag: String, mtu: u32 },
    CreateMemif { tag: String, socket_id: u32 },
    DeleteInterface(u32),
}

impl Call {
    /// Calls that create router state. Failure injection counts only these.
    pub fn is_create(&self) -> bool {
        matches!(
            self,
            Call::RouteAdd(_)
                | Call::AllocateVrf { .. }
                | Call::AddNeighbor(_)
                | Call::AddPortFilterClient(_)
                | Call::SetUrpf { .. }
                | Call::AddDefaultRoute { .. }
                | Call::AddDefaultMroute { .. }
                | Call::CreateTunTap { .. }
                | Call::CreateMemif { .. }
        )
    }
}

#[derive(Debug)]
struct Inner {
    state: DataplaneState,
    next_vrf_id: u32,
    next_sw_if_index: u32,
    next_client_index: u32,
    calls: Vec<Call>,
    creates: usize,
    fail_create_at: Option<usize>,
}

impl Inner {
    fn record(&mut self, call: Call) -> Result<()> {
        debug!(?call, "dataplane call");
        let is_create = call.is_create();
        self.calls.push(call);
        if !is_create {
            return Ok(());
        }
        let n = self.creates;
        self.creates += 1;
        if self.fail_create_at == Some(n) {
            return Err(Error::Dataplane(format!("injected failure on create call {n}")));
        }
        Ok(())
    }

    fn table_mut(&mut self, family: IpFamily, id: u32) -> Result<&mut Table> {
        self.state
            .tables
            .get_mut(&(family, id))
            .ok_or_else(|| Error::NotFound(format!("{family} table {id}")))
    }
}

/// Router tables kept in process memory.
///
/// Adds of an existing resource and deletes of an absent one fail, the same
/// way the real router API rejects them. Table 0 exists for both families from
/// the start; other static tables are created with [`MemoryDataplane::ensure_table`].
#[derive(Debug)]
pub struct MemoryDataplane {
    inner: Mutex<Inner>,
}

impl Default for MemoryDataplane {
    fn default() -> Self {
        let mut state = DataplaneState::default();
        for family in IpFamily::ALL {
            state.tables.insert((family, 0), Table::default());
        }
        Self {
            inner: Mutex::new(Inner {
                state,
                next_vrf_id: FIRST_DYNAMIC_VRF_ID,
                next_sw_if_index: FIRST_SW_IF_INDEX,
                next_client_index: 0,
                calls: Vec::new(),
                creates: 0,
                fail_create_at: None,
            }),
        }
    }
}

impl MemoryDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a statically numbered table in both families if missing.
    pub fn ensure_table(&self, id: u32, tag: &str) {
        let mut inner = self.lock();
        for family in IpFamily::ALL {
            inner.state.tables.entry((family, id)).or_insert_with(|| Table {
                tag: tag.to_string(),
                ..Default::default()
            });
        }
    }

    /// Makes the `n`th create call from now on (zero based) fail without
    /// effect.
    pub fn fail_create_at(&self, n: usize) {
        let mut inner = self.lock();
        inner.fail_create_at = Some(inner.creates + n);
    }

    pub fn snapshot(&self) -> DataplaneState {
        self.lock().state.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn create_count(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.is_create()).count()
    }
}

fn check_tag(tag: &str) -> Result<()> {
    if tag.len() > MAX_API_TAG_LEN {
        return Err(Error::Dataplane(format!(
            "tag {tag} is {} bytes, limit is {MAX_API_TAG_LEN}",
            tag.len()
        )));
    }
    Ok(())
}

fn check_paths(inner: &Inner, route: &Route) -> Result<()> {
    if route.paths.is_empty() {
        return Err(Error::Dataplane(format!("route {route} has no paths")));
    }
    for path in &route.paths {
        if path.sw_if_index != INVALID_ID && !inner.state.interfaces.contains_key(&path.sw_if_index)
        {
            return Err(Error::NotFound(format!("interface {}", path.sw_if_index)));
        }
        if let Some(table) = path.table
            && !inner.state.tables.contains_key(&(route.family(), table))
        {
            return Err(Error::NotFound(format!("{} table {table}", route.family())));
        }
    }
    Ok(())
}

impl Dataplane for MemoryDataplane {
    fn route_add(&self, route: &Route) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::RouteAdd(route.clone()))?;
        check_paths(&inner, route)?;
        let key = (route.dst.network(), route.dst.prefix());
        let table = inner.table_mut(route.family(), route.table)?;
        if table.routes.contains_key(&key) {
            return Err(Error::Dataplane(format!("route {route} already exists")));
        }
        table.routes.insert(key, route.paths.clone());
        Ok(())
    }

    fn route_del(&self, route: &Route) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::RouteDel(route.clone()))?;
        let key = (route.dst.network(), route.dst.prefix());
        let table = inner.table_mut(route.family(), route.table)?;
        match table.routes.get(&key) {
            Some(paths) if *paths == route.paths => {
                table.routes.remove(&key);
                Ok(())
            }
            _ => Err(Error::NotFound(format!("route {route}"))),
        }
    }

    fn allocate_vrf(&self, family: IpFamily, tag: &str) -> Result<u32> {
        let mut inner = self.lock();
        inner.record(Call::AllocateVrf {
            family,
            tag: tag.to_string(),
        })?;
        check_tag(tag)?;
        let id = inner.next_vrf_id;
        inner.next_vrf_id += 1;
        inner.state.tables.insert(
            (family, id),
            Table {
                tag: tag.to_string(),
                ..Default::default()
            },
        );
        Ok(id)
    }

    fn delete_vrf(&self, vrf_id: u32, family: IpFamily) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::DeleteVrf { vrf_id, family })?;
        let table = inner.table_mut(family, vrf_id)?;
        if !table.routes.is_empty()
            || table.default_via.is_some()
            || table.default_mroute_via.is_some()
        {
            return Err(Error::Dataplane(format!(
                "{family} vrf {vrf_id} still holds routes"
            )));
        }
        inner.state.tables.remove(&(family, vrf_id));
        Ok(())
    }

    fn add_neighbor(&self, neighbor: &Neighbor) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::AddNeighbor(neighbor.clone()))?;
        if !inner.state.interfaces.contains_key(&neighbor.sw_if_index) {
            return Err(Error::NotFound(format!("interface {}", neighbor.sw_if_index)));
        }
        let key = (neighbor.sw_if_index, neighbor.ip);
        if inner.state.neighbors.contains_key(&key) {
            return Err(Error::Dataplane(format!("neighbor {neighbor} already exists")));
        }
        inner.state.neighbors.insert(key, neighbor.hardware_addr);
        Ok(())
    }

    fn del_neighbor(&self, neighbor: &Neighbor) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::DelNeighbor(neighbor.clone()))?;
        inner
            .state
            .neighbors
            .remove(&(neighbor.sw_if_index, neighbor.ip))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("neighbor {neighbor}")))
    }

    fn add_port_filter_client(&self, client: &PortFilterClient) -> Result<u32> {
        let mut inner = self.lock();
        inner.record(Call::AddPortFilterClient(client.clone()))?;
        if !inner
            .state
            .tables
            .contains_key(&(IpFamily::from_ip(&client.addr), client.table_id))
        {
            return Err(Error::NotFound(format!("table {}", client.table_id)));
        }
        if inner
            .state
            .port_filter_clients
            .values()
            .any(|c| c.table_id == client.table_id && c.addr == client.addr)
        {
            return Err(Error::Dataplane(format!(
                "port filter client for {} in table {} already exists",
                client.addr, client.table_id
            )));
        }
        let index = inner.next_client_index;
        inner.next_client_index += 1;
        inner.state.port_filter_clients.insert(index, client.clone());
        Ok(index)
    }

    fn del_port_filter_client(&self, index: u32) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::DelPortFilterClient(index))?;
        inner
            .state
            .port_filter_clients
            .remove(&index)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("port filter client {index}")))
    }

    fn set_custom_urpf(&self, sw_if_index: u32, table_id: u32) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::SetUrpf {
            sw_if_index,
            table_id,
        })?;
        let iface = inner
            .state
            .interfaces
            .get_mut(&sw_if_index)
            .ok_or_else(|| Error::NotFound(format!("interface {sw_if_index}")))?;
        if iface.urpf_table.is_some() {
            return Err(Error::Dataplane(format!(
                "urpf already enabled on interface {sw_if_index}"
            )));
        }
        iface.urpf_table = Some(table_id);
        Ok(())
    }

    fn unset_urpf(&self, sw_if_index: u32) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::UnsetUrpf(sw_if_index))?;
        let iface = inner
            .state
            .interfaces
            .get_mut(&sw_if_index)
            .ok_or_else(|| Error::NotFound(format!("interface {sw_if_index}")))?;
        iface
            .urpf_table
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("urpf on interface {sw_if_index}")))
    }

    fn add_default_route_via_table(&self, vrf_id: u32, via: u32, family: IpFamily) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::AddDefaultRoute {
            vrf_id,
            via,
            family,
        })?;
        if !inner.state.tables.contains_key(&(family, via)) {
            return Err(Error::NotFound(format!("{family} table {via}")));
        }
        let table = inner.table_mut(family, vrf_id)?;
        if table.default_via.is_some() {
            return Err(Error::Dataplane(format!(
                "{family} vrf {vrf_id} already has a default route"
            )));
        }
        table.default_via = Some(via);
        Ok(())
    }

    fn del_default_route_via_table(&self, vrf_id: u32, via: u32, family: IpFamily) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::DelDefaultRoute {
            vrf_id,
            via,
            family,
        })?;
        let table = inner.table_mut(family, vrf_id)?;
        if table.default_via != Some(via) {
            return Err(Error::NotFound(format!(
                "{family} default route in vrf {vrf_id} via {via}"
            )));
        }
        table.default_via = None;
        Ok(())
    }

    fn add_default_mroute_via_table(
        &self,
        vrf_id: u32,
        via: u32,
        family: IpFamily,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::AddDefaultMroute {
            vrf_id,
            via,
            family,
        })?;
        if !inner.state.tables.contains_key(&(family, via)) {
            return Err(Error::NotFound(format!("{family} table {via}")));
        }
        let table = inner.table_mut(family, vrf_id)?;
        if table.default_mroute_via.is_some() {
            return Err(Error::Dataplane(format!(
                "{family} vrf {vrf_id} already has a default mroute"
            )));
        }
        table.default_mroute_via = Some(via);
        Ok(())
    }

    fn del_default_mroute_via_table(
        &self,
        vrf_id: u32,
        via: u32,
        family: IpFamily,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::DelDefaultMroute {
            vrf_id,
            via,
            family,
        })?;
        let table = inner.table_mut(family, vrf_id)?;
        if table.default_mroute_via != Some(via) {
            return Err(Error::NotFound(format!(
                "{family} default mroute in vrf {vrf_id} via {via}"
            )));
        }
        table.default_mroute_via = None;
        Ok(())
    }

    fn create_tun_tap(&self, tag: &str, mtu: u32) -> Result<u32> {
        let mut inner = self.lock();
        inner.record(Call::CreateTunTap {
            tag: tag.to_string(),
            mtu,
        })?;
        check_tag(tag)?;
        let idx = inner.next_sw_if_index;
        inner.next_sw_if_index += 1;
        inner.state.interfaces.insert(
            idx,
            Interface {
                tag: tag.to_string(),
                kind: InterfaceKind::TunTap { mtu },
                urpf_table: None,
            },
        );
        Ok(idx)
    }

    fn create_memif(&self, tag: &str, socket_id: u32) -> Result<u32> {
        let mut inner = self.lock();
        inner.record(Call::CreateMemif {
            tag: tag.to_string(),
            socket_id,
        })?;
        check_tag(tag)?;
        let idx = inner.next_sw_if_index;
        inner.next_sw_if_index += 1;
        inner.state.interfaces.insert(
            idx,
            Interface {
                tag: tag.to_string(),
                kind: InterfaceKind::Memif { socket_id },
                urpf_table: None,
            },
        );
        Ok(idx)
    }

    fn delete_interface(&self, sw_if_index: u32) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::DeleteInterface(sw_if_index))?;
        inner
            .state
            .interfaces
            .remove(&sw_if_index)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("interface {sw_if_index}")))?;
        inner.state.neighbors.retain(|(idx, _), _| *idx != sw_if_index);
        Ok(())
    }
}
