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

//! kube-node-sync - keeps host network configuration in step with cluster membership
//!
//! This library provides the pieces of a small reconciliation daemon:
//! - Membership snapshots and change detection
//! - Node discovery through the Kubernetes API
//! - Appliers for a packet-filter chain and for nginx upstreams
//! - The fixed-rate reconciliation loop
//! - Configuration and health checks

#![warn(clippy::all)]

pub mod applier;
pub mod command;
pub mod config;
pub mod health;
pub mod membership;
pub mod reconciler;
pub mod source;

// Re-export commonly used types
pub use applier::{ApplyError, FirewallChainApplier, ReverseProxyApplier, RuleApplier};
pub use config::SyncConfig;
pub use membership::{differs, MembershipSnapshot, NodeAddress};
pub use reconciler::{CycleOutcome, Reconciler};
pub use source::{KubeNodeSource, MemberSource, SourceError};
