//! Immutable, versioned snapshot of the identity database.

use crate::descriptor::Descriptor;
use std::collections::BTreeMap;

/// A named person with one descriptor per accepted reference photo.
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    descriptors: Vec<Descriptor>,
}

impl Identity {
    /// Returns `None` when `descriptors` is empty: an identity without a
    /// usable reference photo is never stored.
    pub fn new(name: impl Into<String>, descriptors: Vec<Descriptor>) -> Option<Self> {
        if descriptors.is_empty() {
            return None;
        }
        Some(Self {
            name: name.into(),
            descriptors,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }
}

/// Snapshot of every known identity, keyed and enumerated by name.
///
/// Never mutated after construction; a reload builds a new store with a
/// higher version.
#[derive(Debug, Clone, Default)]
pub struct IdentityStore {
    version: u64,
    identities: BTreeMap<String, Identity>,
}

impl IdentityStore {
    pub fn new(version: u64, identities: impl IntoIterator<Item = Identity>) -> Self {
        let identities = identities
            .into_iter()
            .map(|identity| (identity.name.clone(), identity))
            .collect();
        Self {
            version,
            identities,
        }
    }

    pub fn empty(version: u64) -> Self {
        Self {
            version,
            identities: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn descriptor_count(&self) -> usize {
        self.identities.values().map(|i| i.descriptors.len()).sum()
    }

    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.identities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.identities.contains_key(name)
    }

    /// Identities in lexicographic name order.
    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.identities.keys().map(String::as_str)
    }
}
