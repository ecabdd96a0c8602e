//! Desired ip set state, as published by the policy engine in a JSON file.
//!
//! ```json
//! { "sets": [ { "id": "s1", "type": "hash:ip", "maxSize": 1024,
//!               "members": ["10.0.0.1", "fd00::1"] } ] }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use mesh_cni_ipset::{IpSetId, IpSetMetadata, IpSetType};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSpec {
    pub id: IpSetId,
    #[serde(rename = "type")]
    pub set_type: IpSetType,
    pub max_size: u32,
    #[serde(default)]
    pub members: BTreeSet<String>,
}

impl SetSpec {
    pub fn metadata(&self) -> IpSetMetadata {
        IpSetMetadata {
            id: self.id.clone(),
            set_type: self.set_type,
            max_size: self.max_size,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    sets: Vec<SetSpec>,
}

/// How one set has to change to get from the previous desired state to the
/// current one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// New set, or its type or size changed.
    Replace(SetSpec),
    Members {
        id: IpSetId,
        added: Vec<String>,
        removed: Vec<String>,
    },
    Remove(IpSetId),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredState {
    sets: BTreeMap<IpSetId, SetSpec>,
}

impl DesiredState {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReadState {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents).map_err(|source| Error::ParseState {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(contents: &str) -> serde_json::Result<Self> {
        let file: StateFile = serde_json::from_str(contents)?;
        Ok(file.sets.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn get(&self, id: &IpSetId) -> Option<&SetSpec> {
        self.sets.get(id)
    }

    /// Changes that turn `previous` into `self`, replacements and member
    /// updates first, removals last.
    pub fn changes_since(&self, previous: &DesiredState) -> Vec<Change> {
        let mut changes = Vec::new();
        for (id, spec) in &self.sets {
            match previous.sets.get(id) {
                Some(old) if old.set_type == spec.set_type && old.max_size == spec.max_size => {
                    let added: Vec<String> =
                        spec.members.difference(&old.members).cloned().collect();
                    let removed: Vec<String> =
                        old.members.difference(&spec.members).cloned().collect();
                    if !added.is_empty() || !removed.is_empty() {
                        changes.push(Change::Members {
                            id: id.clone(),
                            added,
                            removed,
                        });
                    }
                }
                _ => changes.push(Change::Replace(spec.clone())),
            }
        }
        changes.extend(
            previous
                .sets
                .keys()
                .filter(|id| !self.sets.contains_key(*id))
                .cloned()
                .map(Change::Remove),
        );
        changes
    }
}

impl FromIterator<SetSpec> for DesiredState {
    fn from_iter<T: IntoIterator<Item = SetSpec>>(iter: T) -> Self {
        let mut sets = BTreeMap::new();
        for spec in iter {
            if let Some(old) = sets.insert(spec.id.clone(), spec) {
                warn!(set_id = %old.id, "duplicate ip set in desired state, keeping the last one");
            }
        }
        Self { sets }
    }
}
