// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cluster membership types.
//!
//! A [`MembershipSnapshot`] is the set of node addresses that may currently
//! receive traffic. Snapshots are produced fresh on every poll and replaced
//! wholesale; they are never mutated in place.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

/// Error returned when an annotation value is not `address[/prefix]`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid node address {value:?}: {reason}")]
pub struct AddressParseError {
    /// The raw annotation value.
    pub value: String,
    /// Why parsing failed.
    pub reason: String,
}

/// The traffic-serving address of one cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress(IpAddr);

impl NodeAddress {
    /// Parses an annotation value of the form `address[/prefix]`.
    ///
    /// Only the address portion is kept. The prefix is discarded without
    /// validation, so `10.0.0.1/99` still yields `10.0.0.1`.
    pub fn parse_annotation(value: &str) -> Result<Self, AddressParseError> {
        let value = value.trim();
        let address = value.split_once('/').map_or(value, |(address, _)| address);
        IpAddr::from_str(address)
            .map(Self)
            .map_err(|e| AddressParseError {
                value: value.to_string(),
                reason: e.to_string(),
            })
    }

    /// Returns the underlying IP address.
    pub fn ip(&self) -> IpAddr {
        self.0
    }
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_annotation(s)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The set of node addresses eligible to receive traffic.
///
/// Addresses keep their discovery order, which determines the order of
/// generated rules and server lines. Duplicates are dropped on insertion
/// (first occurrence wins), so a snapshot is always a set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    addresses: Vec<NodeAddress>,
}

impl MembershipSnapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an address, returning `false` if it was already present.
    pub fn insert(&mut self, address: NodeAddress) -> bool {
        if self.contains(&address) {
            return false;
        }
        self.addresses.push(address);
        true
    }

    /// Returns true if the snapshot holds `address`.
    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.addresses.iter().any(|a| a == address)
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Returns true if there are no addresses.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Iterates over the addresses in discovery order.
    pub fn iter(&self) -> std::slice::Iter<'_, NodeAddress> {
        self.addresses.iter()
    }
}

impl FromIterator<NodeAddress> for MembershipSnapshot {
    fn from_iter<I: IntoIterator<Item = NodeAddress>>(iter: I) -> Self {
        let mut snapshot = Self::new();
        for address in iter {
            snapshot.insert(address);
        }
        snapshot
    }
}

impl<'a> IntoIterator for &'a MembershipSnapshot {
    type Item = &'a NodeAddress;
    type IntoIter = std::slice::Iter<'a, NodeAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for MembershipSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, address) in self.addresses.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", address)?;
        }
        f.write_str("]")
    }
}

/// Reports whether two snapshots hold different memberships.
///
/// Order is irrelevant: two snapshots are equal when they have the same
/// cardinality and every address in `previous` has an exact match in
/// `current`.
pub fn differs(previous: &MembershipSnapshot, current: &MembershipSnapshot) -> bool {
    if previous.len() != current.len() {
        tracing::debug!(
            previous = previous.len(),
            current = current.len(),
            "node count changed"
        );
        return true;
    }

    let matches = previous
        .iter()
        .filter(|address| current.contains(address))
        .count();

    if matches != current.len() {
        tracing::debug!(
            matches,
            records = previous.len(),
            "node addresses changed"
        );
        return true;
    }

    false
}
