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

//! Configuration structures for kube-node-sync.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::applier::UpstreamTarget;
use crate::source::DEFAULT_ADDRESS_ANNOTATION;

/// Main configuration for kube-node-sync.
///
/// Only the section matching the selected applier is used at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Settings shared by every applier.
    #[serde(default)]
    pub generic: GenericSyncConfig,

    /// Packet-filter chain settings.
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Reverse-proxy upstream settings.
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Settings shared by every applier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericSyncConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Node annotation holding the traffic-serving address.
    #[serde(default = "default_address_annotation")]
    pub address_annotation: String,

    /// Time between reconciliation cycles.
    #[serde(default = "default_sync_period", with = "humantime_serde")]
    pub sync_period: Duration,

    /// Upper bound on a single node listing.
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Upper bound on a single apply.
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub apply_timeout: Duration,

    /// Whether to serve health endpoints.
    #[serde(default = "default_enable_healthz")]
    pub enable_healthz: bool,

    /// The address to serve health endpoints on.
    #[serde(default = "default_bind_address")]
    pub healthz_bind_address: String,

    /// Port for the health check server.
    #[serde(default = "default_healthz_port")]
    pub healthz_bind_port: u16,
}

impl Default for GenericSyncConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            address_annotation: default_address_annotation(),
            sync_period: default_sync_period(),
            fetch_timeout: default_call_timeout(),
            apply_timeout: default_call_timeout(),
            enable_healthz: default_enable_healthz(),
            healthz_bind_address: default_bind_address(),
            healthz_bind_port: default_healthz_port(),
        }
    }
}

fn default_address_annotation() -> String {
    DEFAULT_ADDRESS_ANNOTATION.to_string()
}

fn default_sync_period() -> Duration {
    Duration::from_secs(5)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_enable_healthz() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_port() -> u16 {
    10258
}

/// Packet-filter chain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallConfig {
    /// Table holding the chain.
    #[serde(default = "default_table")]
    pub table: String,

    /// Chain managed by this process.
    #[serde(default = "default_chain")]
    pub chain: String,

    /// Protocol matched by each rule.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Destination port matched by each rule.
    #[serde(default = "default_firewall_port")]
    pub port: u16,

    /// Path to `iptables`.
    #[serde(default = "default_iptables")]
    pub iptables: String,

    /// Path to `iptables-restore`.
    #[serde(default = "default_iptables_restore")]
    pub iptables_restore: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            chain: default_chain(),
            protocol: default_protocol(),
            port: default_firewall_port(),
            iptables: default_iptables(),
            iptables_restore: default_iptables_restore(),
        }
    }
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_chain() -> String {
    "mongodb".to_string()
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_firewall_port() -> u16 {
    27017
}

fn default_iptables() -> String {
    "iptables".to_string()
}

fn default_iptables_restore() -> String {
    "iptables-restore".to_string()
}

/// Reverse-proxy upstream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Upstream file rewritten on every change.
    #[serde(default = "default_upstream_file")]
    pub upstream_file: PathBuf,

    /// systemctl executable.
    #[serde(default = "default_systemctl")]
    pub systemctl: String,

    /// Unit reloaded after the file is written.
    #[serde(default = "default_service")]
    pub service: String,

    /// Upstream blocks, emitted in this order.
    #[serde(default = "default_upstreams")]
    pub upstreams: Vec<UpstreamTarget>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_file: default_upstream_file(),
            systemctl: default_systemctl(),
            service: default_service(),
            upstreams: default_upstreams(),
        }
    }
}

fn default_upstream_file() -> PathBuf {
    PathBuf::from("/etc/nginx/upstreams/upstreams.conf")
}

fn default_systemctl() -> String {
    "/bin/systemctl".to_string()
}

fn default_service() -> String {
    "nginx".to_string()
}

fn default_upstreams() -> Vec<UpstreamTarget> {
    vec![
        UpstreamTarget::new("diy", 32016),
        UpstreamTarget::new("dockerui", 32018),
        UpstreamTarget::new("tryingadventure", 32020),
        UpstreamTarget::new("monitor", 32699),
    ]
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
