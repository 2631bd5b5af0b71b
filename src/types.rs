//! Desired-state data model.
//!
//! These types are deserialised from the control plane's
//! `{"result": [...]}` envelopes.  A [`DesiredState`] is built once per
//! successful fetch and never mutated afterwards; the reconciler swaps
//! whole snapshots.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A bridge network declared by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    /// CIDR range, e.g. `10.0.0.0/24`.  Optional on the wire; a network
    /// without a range cannot be created.
    #[serde(default)]
    pub range: Option<String>,
}

/// A virtual desktop session ("cubicle") declared by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    pub image: String,
    pub owner: String,
    pub network: String,
    /// Host port for the display companion.  Kept raw because the control
    /// plane sends it either as a number or as a numeric string.
    #[serde(default)]
    pub novnc_port: Option<Value>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("novnc_port is missing")]
    Missing,
    #[error("novnc_port {0} is not a valid port number")]
    Invalid(String),
}

impl MachineSpec {
    /// The display export port, coerced to an integer.
    pub fn novnc_port(&self) -> Result<u16, PortError> {
        let value = self.novnc_port.as_ref().ok_or(PortError::Missing)?;
        let port = match value {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.trim().parse::<u16>().ok(),
            Value::Null => return Err(PortError::Missing),
            _ => None,
        };
        match port {
            Some(port) if port != 0 => Ok(port),
            _ => Err(PortError::Invalid(value.to_string())),
        }
    }
}

/// Records keyed by their `name` field.
pub trait Named {
    fn name(&self) -> &str;
}

impl Named for NetworkSpec {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for MachineSpec {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Result of re-keying a record list by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Indexed<T> {
    pub entries: BTreeMap<String, T>,
    /// Names of records that carried a name but failed to parse.
    pub quarantined: BTreeSet<String>,
}

impl<T> Default for Indexed<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            quarantined: BTreeSet::new(),
        }
    }
}

/// Parse each record on its own and key it by name.
///
/// A malformed record never poisons its siblings.  If it still has a
/// readable `name` it is reported in `quarantined`; otherwise it is dropped.
/// Later duplicates replace earlier ones.
pub fn index_records<T>(kind: &str, records: Vec<Value>) -> Indexed<T>
where
    T: DeserializeOwned + Named,
{
    let mut indexed = Indexed::default();
    for record in records {
        let name = record
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        match serde_json::from_value::<T>(record) {
            Ok(entry) if !entry.name().is_empty() => {
                indexed.quarantined.remove(entry.name());
                indexed.entries.insert(entry.name().to_string(), entry);
            }
            Ok(_) => warn!("Dropping {} record with empty name", kind),
            Err(e) => match name {
                Some(name) => {
                    warn!("Quarantining malformed {} record {}: {}", kind, name, e);
                    indexed.entries.remove(&name);
                    indexed.quarantined.insert(name);
                }
                None => warn!("Dropping {} record without a name: {}", kind, e),
            },
        }
    }
    indexed
}

/// A point-in-time view of what the control plane wants on this node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredState {
    pub networks: BTreeMap<String, NetworkSpec>,
    pub machines: BTreeMap<String, MachineSpec>,
    /// Machines the control plane declared but sent in a form we could not
    /// parse.  They are neither created nor torn down.
    pub quarantined: BTreeSet<String>,
}

impl DesiredState {
    pub fn new(networks: Indexed<NetworkSpec>, machines: Indexed<MachineSpec>) -> Self {
        Self {
            networks: networks.entries,
            machines: machines.entries,
            quarantined: machines.quarantined,
        }
    }

    /// True if a container called `name` belongs to this snapshot.
    pub fn expects(&self, name: &str) -> bool {
        self.machines.contains_key(name) || self.quarantined.contains(name)
    }
}
