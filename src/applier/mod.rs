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

//! Downstream artifact appliers.
//!
//! An applier turns a [`MembershipSnapshot`] into an external artifact and
//! commits it. The artifact is regenerated from scratch on every call, so
//! applying the same snapshot twice leaves the external system unchanged.

pub mod firewall;
pub mod proxy;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::command::CommandError;
use crate::membership::MembershipSnapshot;

pub use firewall::{
    ChainError, ChainOp, FirewallChainApplier, FirewallRule, IptablesPacketFilter, PacketFilter,
};
pub use proxy::{ReverseProxyApplier, ServiceReloader, UpstreamTarget};

/// Errors that can occur when applying a snapshot.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to reload {service}: {source}")]
    Reload {
        service: String,
        #[source]
        source: CommandError,
    },

    #[error("apply timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for apply operations.
pub type Result<T> = std::result::Result<T, ApplyError>;

/// Converges an external system to match a membership snapshot.
#[async_trait]
pub trait RuleApplier: Send + Sync + 'static {
    /// Returns a short name for logging.
    fn name(&self) -> &str;

    /// Commits the artifact generated from `current`.
    ///
    /// Must be safe to retry: a second call with the same snapshot produces
    /// the same end state.
    async fn apply(&self, current: &MembershipSnapshot) -> Result<()>;
}
