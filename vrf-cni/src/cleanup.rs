use std::fmt;

use tracing::{info, warn};

use crate::Result;
use crate::dataplane::{Dataplane, IpFamily, Neighbor, Route};

/// Reverses exactly one successful forward step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Undo {
    RouteDel(Route),
    VrfDel { vrf_id: u32, family: IpFamily },
    NeighborDel(Neighbor),
    PortFilterClientDel(u32),
    UrpfUnset(u32),
    DefaultRouteDel { vrf_id: u32, via: u32, family: IpFamily },
    DefaultMrouteDel { vrf_id: u32, via: u32, family: IpFamily },
    InterfaceDel(u32),
}

impl Undo {
    pub fn apply<D: Dataplane + ?Sized>(&self, dp: &D) -> Result<()> {
        match self {
            Undo::RouteDel(route) => dp.route_del(route),
            Undo::VrfDel { vrf_id, family } => dp.delete_vrf(*vrf_id, *family),
            Undo::NeighborDel(neighbor) => dp.del_neighbor(neighbor),
            Undo::PortFilterClientDel(index) => dp.del_port_filter_client(*index),
            Undo::UrpfUnset(sw_if_index) => dp.unset_urpf(*sw_if_index),
            Undo::DefaultRouteDel {
                vrf_id,
                via,
                family,
            } => dp.del_default_route_via_table(*vrf_id, *via, *family),
            Undo::DefaultMrouteDel {
                vrf_id,
                via,
                family,
            } => dp.del_default_mroute_via_table(*vrf_id, *via, *family),
            Undo::InterfaceDel(sw_if_index) => dp.delete_interface(*sw_if_index),
        }
    }
}

impl fmt::Display for Undo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Undo::RouteDel(route) => write!(f, "delete route {route}"),
            Undo::VrfDel { vrf_id, family } => write!(f, "delete {family} vrf {vrf_id}"),
            Undo::NeighborDel(neighbor) => write!(f, "delete neighbor {neighbor}"),
            Undo::PortFilterClientDel(index) => write!(f, "delete port filter client {index}"),
            Undo::UrpfUnset(sw_if_index) => write!(f, "unset urpf on if[{sw_if_index}]"),
            Undo::DefaultRouteDel {
                vrf_id,
                via,
                family,
            } => write!(f, "delete {family} default route vrf {vrf_id} -> {via}"),
            Undo::DefaultMrouteDel {
                vrf_id,
                via,
                family,
            } => write!(f, "delete {family} default mroute vrf {vrf_id} -> {via}"),
            Undo::InterfaceDel(sw_if_index) => write!(f, "delete interface if[{sw_if_index}]"),
        }
    }
}

/// Undo records of one provisioning attempt, most recent last.
///
/// Dropping the stack without calling [`CleanupStack::unwind`] keeps
/// everything that was created.
#[derive(Debug, Default)]
pub struct CleanupStack {
    steps: Vec<Undo>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, undo: Undo) {
        self.steps.push(undo);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Applies every record newest first and returns how many of them failed.
    /// A failing record does not stop the ones after it.
    pub fn unwind<D: Dataplane + ?Sized>(self, dp: &D) -> usize {
        let mut failures = 0;
        for undo in self.steps.into_iter().rev() {
            match undo.apply(dp) {
                Ok(()) => info!("pod(add) rollback: {undo}"),
                Err(e) => {
                    failures += 1;
                    warn!(%e, "pod(add) rollback failed: {undo}");
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataplane::{Call, MemoryDataplane};

    #[test]
    fn unwind_runs_newest_first() {
        let dp = MemoryDataplane::new();
        let mut stack = CleanupStack::new();
        let vrf = dp.allocate_vrf(IpFamily::V4, "a").unwrap();
        stack.push(Undo::VrfDel {
            vrf_id: vrf,
            family: IpFamily::V4,
        });
        dp.add_default_route_via_table(vrf, 0, IpFamily::V4).unwrap();
        stack.push(Undo::DefaultRouteDel {
            vrf_id: vrf,
            via: 0,
            family: IpFamily::V4,
        });

        // the vrf can only go once its default route is gone
        assert_eq!(stack.unwind(&dp), 0);
        let calls = dp.calls();
        assert_eq!(
            &calls[2..],
            &[
                Call::DelDefaultRoute {
                    vrf_id: vrf,
                    via: 0,
                    family: IpFamily::V4
                },
                Call::DeleteVrf {
                    vrf_id: vrf,
                    family: IpFamily::V4
                },
            ]
        );
    }

    #[test]
    fn unwind_continues_past_failures() {
        let dp = MemoryDataplane::new();
        let mut stack = CleanupStack::new();
        let vrf = dp.allocate_vrf(IpFamily::V6, "b").unwrap();
        stack.push(Undo::VrfDel {
            vrf_id: vrf,
            family: IpFamily::V6,
        });
        stack.push(Undo::InterfaceDel(42));
        stack.push(Undo::PortFilterClientDel(7));

        assert_eq!(stack.unwind(&dp), 2);
        assert!(!dp.snapshot().tables.contains_key(&(IpFamily::V6, vrf)));
    }
}
