//! Transforms that fold neighbor cache changes into the switch state.
//!
//! Each function here is evaluated by the state updater against the
//! snapshot that is current when the transform is applied, which may be
//! many versions after the one the caller saw. Every precondition is
//! therefore checked again, and `None` is returned whenever the change has
//! become moot: the VLAN was deleted, the address left the interface's
//! subnets, or the tree already holds exactly the requested binding.

use sonic_switch_state::{
    LocalSubnets, NeighborEntryFields, NeighborTableKind, SwitchState, VlanId,
};
use std::sync::Arc;
use tracing::debug;

/// Checks that the VLAN still exists and the address is still on a locally
/// attached subnet of the entry's interface.
fn check_vlan_and_intf<T: NeighborTableKind>(
    state: &SwitchState,
    fields: &NeighborEntryFields<T::Addr>,
    vlan_id: VlanId,
) -> bool {
    if state.get_vlan_if(vlan_id).is_none() {
        debug!(
            vlan = %vlan_id,
            entry = %fields,
            "VLAN deleted before neighbor entry could be updated"
        );
        return false;
    }

    if !state.is_locally_attached(fields.ip.into(), fields.interface_id) {
        debug!(
            interface = %fields.interface_id,
            entry = %fields,
            "Interface subnets changed before neighbor entry could be updated"
        );
        return false;
    }

    true
}

/// Adds or updates a resolved binding.
pub(crate) fn program_entry<T: NeighborTableKind>(
    state: &Arc<SwitchState>,
    vlan_id: VlanId,
    fields: &NeighborEntryFields<T::Addr>,
) -> Option<SwitchState> {
    if !check_vlan_and_intf::<T>(state, fields, vlan_id) {
        return None;
    }

    let vlan = state.get_vlan_if(vlan_id)?;
    let existing = T::table(vlan).get_node_if(&fields.ip);
    if existing == Some(fields) {
        // Another update reached the same binding while this one was queued.
        return None;
    }

    let mut next = (**state).clone();
    let table = next.modify_neighbor_table::<T>(vlan_id)?;
    match existing {
        None => {
            debug!(proto = T::NAME, entry = %fields, "Adding neighbor entry");
            table.add_entry(fields.clone());
        }
        Some(_) => {
            debug!(proto = T::NAME, entry = %fields, "Updating neighbor entry");
            table.update_entry(fields.clone());
        }
    }
    Some(next)
}

/// Adds a pending binding.
///
/// An existing node is only replaced when `force` is set, so a resolved
/// binding is never downgraded by a stray resolution request.
pub(crate) fn program_pending_entry<T: NeighborTableKind>(
    state: &Arc<SwitchState>,
    vlan_id: VlanId,
    fields: &NeighborEntryFields<T::Addr>,
    force: bool,
) -> Option<SwitchState> {
    if !check_vlan_and_intf::<T>(state, fields, vlan_id) {
        return None;
    }

    let vlan = state.get_vlan_if(vlan_id)?;
    let existing = T::table(vlan).get_node_if(&fields.ip);
    match existing {
        Some(node) if !force => {
            debug!(
                proto = T::NAME,
                entry = %node,
                "Not replacing existing neighbor node with a pending one"
            );
            return None;
        }
        Some(node) if node == fields => return None,
        _ => {}
    }

    let mut next = (**state).clone();
    let table = next.modify_neighbor_table::<T>(vlan_id)?;
    if existing.is_some() {
        table.remove_node(&fields.ip);
    }
    table.add_pending_entry(fields.ip, fields.interface_id);
    debug!(
        proto = T::NAME,
        ip = %fields.ip,
        interface = %fields.interface_id,
        "Adding pending neighbor entry"
    );
    Some(next)
}

/// Removes the node for `ip`, if the VLAN and node still exist.
pub(crate) fn flush_entry<T: NeighborTableKind>(
    state: &Arc<SwitchState>,
    vlan_id: VlanId,
    ip: T::Addr,
) -> Option<SwitchState> {
    let Some(vlan) = state.get_vlan_if(vlan_id) else {
        debug!(vlan = %vlan_id, %ip, "VLAN deleted before neighbor entry could be flushed");
        return None;
    };
    T::table(vlan).get_node_if(&ip)?;

    let mut next = (**state).clone();
    next.modify_neighbor_table::<T>(vlan_id)?.remove_node(&ip);
    debug!(proto = T::NAME, %ip, "Flushed neighbor entry");
    Some(next)
}
