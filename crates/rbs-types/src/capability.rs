use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Capability URIs understood by `rbs` stores.
///
/// The vocabulary is open: stores may advertise URIs not listed here, and a
/// caller that does not recognise a URI simply treats the capability as absent.
pub mod capabilities {
    /// The store can enlist connections in a distributed transaction.
    pub const TXN: &str = "urn:rbs:capability:transactions";
    /// The store can generate blob ids when the caller supplies none.
    pub const GENERATE_ID: &str = "urn:rbs:capability:generate-id";
    /// The store honours caller-supplied blob ids.
    pub const ACCEPT_APP_ID: &str = "urn:rbs:capability:accept-app-id";
}

/// Set of capability URIs advertised by a store.
///
/// Ordered so that two sets with the same members compare and serialize
/// identically on both sides of the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the capability is advertised. Unknown URIs are absent.
    pub fn supports(&self, uri: &str) -> bool {
        self.0.contains(uri)
    }

    pub fn insert(&mut self, uri: impl Into<String>) -> bool {
        self.0.insert(uri.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}
