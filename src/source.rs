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

//! Node membership discovery.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use thiserror::Error;

use crate::membership::{AddressParseError, MembershipSnapshot, NodeAddress};

/// Annotation Calico sets to the node's IPv4 address and prefix.
pub const DEFAULT_ADDRESS_ANNOTATION: &str = "projectcalico.org/IPv4Address";

/// Errors that can occur while discovering membership.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("node listing unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("node {node} has an unreadable address annotation: {source}")]
    PartialRead {
        node: String,
        #[source]
        source: AddressParseError,
    },

    #[error("node listing timed out after {0:?}")]
    Timeout(Duration),
}

/// Queries the control plane for the current set of traffic-eligible nodes.
#[async_trait]
pub trait MemberSource: Send + Sync + 'static {
    /// Returns the current membership.
    ///
    /// Individual nodes with a malformed annotation are skipped; only a
    /// failure to list nodes at all is an error.
    async fn fetch(&self) -> Result<MembershipSnapshot, SourceError>;
}

/// Lists [`Node`] objects through the Kubernetes API.
#[derive(Clone)]
pub struct KubeNodeSource {
    api: Api<Node>,
    annotation_key: String,
}

impl KubeNodeSource {
    /// Creates a source reading `annotation_key` from every node.
    pub fn new(client: Client, annotation_key: impl Into<String>) -> Self {
        Self {
            api: Api::all(client),
            annotation_key: annotation_key.into(),
        }
    }
}

#[async_trait]
impl MemberSource for KubeNodeSource {
    async fn fetch(&self) -> Result<MembershipSnapshot, SourceError> {
        tracing::debug!("querying kubernetes for node list");

        let nodes = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| SourceError::Unavailable(Box::new(e)))?;

        Ok(snapshot_from_nodes(&nodes.items, &self.annotation_key))
    }
}

/// Reads the address annotation of one node.
///
/// Returns `Ok(None)` when the node carries no such annotation.
pub fn node_address(node: &Node, annotation_key: &str) -> Result<Option<NodeAddress>, SourceError> {
    let Some(value) = node.annotations().get(annotation_key) else {
        return Ok(None);
    };

    NodeAddress::parse_annotation(value)
        .map(Some)
        .map_err(|source| SourceError::PartialRead {
            node: node.name_any(),
            source,
        })
}

/// Builds a snapshot from listed nodes, skipping nodes without a usable
/// annotation.
pub fn snapshot_from_nodes(nodes: &[Node], annotation_key: &str) -> MembershipSnapshot {
    let mut snapshot = MembershipSnapshot::new();

    for node in nodes {
        match node_address(node, annotation_key) {
            Ok(Some(address)) => {
                tracing::info!(node = %node.name_any(), %address, "found node");
                if !snapshot.insert(address) {
                    tracing::warn!(
                        node = %node.name_any(),
                        %address,
                        "address already reported by another node, ignoring duplicate"
                    );
                }
            }
            Ok(None) => {
                tracing::debug!(
                    node = %node.name_any(),
                    annotation = annotation_key,
                    "node has no address annotation"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "skipping node");
            }
        }
    }

    tracing::info!(
        "there are {} nodes in the cluster, of which {} are available",
        nodes.len(),
        snapshot.len()
    );

    snapshot
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;

    use super::*;

    fn node(name: &str, annotation: Option<&str>) -> Node {
        let annotations = annotation.map(|value| {
            BTreeMap::from([(DEFAULT_ADDRESS_ANNOTATION.to_string(), value.to_string())])
        });
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_node_address_present() {
        let n = node("worker-1", Some("10.0.0.1/24"));
        let address = node_address(&n, DEFAULT_ADDRESS_ANNOTATION).unwrap();
        assert_eq!(address.unwrap().to_string(), "10.0.0.1");
    }

    #[test]
    fn test_node_address_missing_is_not_an_error() {
        let n = node("control-plane", None);
        assert!(node_address(&n, DEFAULT_ADDRESS_ANNOTATION).unwrap().is_none());
    }

    #[test]
    fn test_node_address_malformed() {
        let n = node("worker-2", Some("garbage"));
        let err = node_address(&n, DEFAULT_ADDRESS_ANNOTATION).unwrap_err();
        match err {
            SourceError::PartialRead { node, .. } => assert_eq!(node, "worker-2"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_snapshot_excludes_unannotated_and_malformed() {
        let nodes = vec![
            node("worker-1", Some("10.0.0.1/24")),
            node("control-plane", None),
            node("worker-2", Some("not-an-address")),
            node("worker-3", Some("10.0.0.3/24")),
        ];
        let snapshot = snapshot_from_nodes(&nodes, DEFAULT_ADDRESS_ANNOTATION);
        assert_eq!(snapshot.to_string(), "[10.0.0.1, 10.0.0.3]");
    }

    #[test]
    fn test_snapshot_deduplicates_shared_address() {
        let nodes = vec![
            node("worker-1", Some("10.0.0.1/24")),
            node("worker-1-dup", Some("10.0.0.1/16")),
        ];
        let snapshot = snapshot_from_nodes(&nodes, DEFAULT_ADDRESS_ANNOTATION);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_snapshot_respects_custom_annotation_key() {
        let nodes = vec![node("worker-1", Some("10.0.0.1/24"))];
        let snapshot = snapshot_from_nodes(&nodes, "example.com/address");
        assert!(snapshot.is_empty());
    }
}
