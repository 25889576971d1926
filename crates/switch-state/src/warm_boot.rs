//! Warm-boot persistence of the switch state tree.
//!
//! The tree is dumped as JSON before a planned restart and read back on the
//! next start, after which the neighbor caches are repopulated from it.

use crate::error::{Result, StateUpdateError};
use crate::state::{Interface, SwitchState, Vlan};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct WarmBootDump {
    generation: u64,
    vlans: Vec<Vlan>,
    interfaces: Vec<Interface>,
}

/// Serializes `state` to a JSON string.
pub fn to_json(state: &SwitchState) -> Result<String> {
    let dump = WarmBootDump {
        generation: state.generation(),
        vlans: state.vlans().map(|vlan| (**vlan).clone()).collect(),
        interfaces: state.interfaces().map(|intf| (**intf).clone()).collect(),
    };
    Ok(serde_json::to_string_pretty(&dump)?)
}

/// Rebuilds a state tree from [`to_json`] output.
pub fn from_json(json: &str) -> Result<SwitchState> {
    let dump: WarmBootDump = serde_json::from_str(json)?;
    let mut state = SwitchState::new();
    state.set_generation(dump.generation);
    for vlan in dump.vlans {
        state.add_vlan(vlan);
    }
    for intf in dump.interfaces {
        state.add_interface(intf);
    }
    Ok(state)
}

pub fn save(state: &SwitchState, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let json = to_json(state)?;
    std::fs::write(path, json).map_err(|source| StateUpdateError::WarmBootIo {
        path: path.display().to_string(),
        source,
    })?;
    info!(path = %path.display(), generation = state.generation(), "Saved warm boot state");
    Ok(())
}

pub fn load(path: impl AsRef<Path>) -> Result<SwitchState> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| StateUpdateError::WarmBootIo {
        path: path.display().to_string(),
        source,
    })?;
    let state = from_json(&json)?;
    info!(path = %path.display(), generation = state.generation(), "Loaded warm boot state");
    Ok(state)
}
