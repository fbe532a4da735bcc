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

//! Packet-filter chain applier.
//!
//! Maintains one named chain holding an accept rule per member address.
//! The chain is never deleted: it is created when missing and emptied when
//! present, so an empty membership yields an empty chain rather than no
//! chain. Linking the chain into `INPUT` (and any default policy) is left
//! to the host's firewall setup.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::applier::{RuleApplier, Result};
use crate::command::{BoxedRunner, CommandError, Invocation};
use crate::config::FirewallConfig;
use crate::membership::{MembershipSnapshot, NodeAddress};

/// A single packet-filter chain operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOp {
    /// Check whether the chain exists.
    Exists,
    /// Remove all rules from the chain.
    Clear,
    /// Create the chain.
    Create,
    /// Append a rule.
    Append,
    /// List the chain's rules.
    List,
    /// Replace the chain's content in one transaction.
    Replace,
}

impl fmt::Display for ChainOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            ChainOp::Exists => "exists check",
            ChainOp::Clear => "clear",
            ChainOp::Create => "create",
            ChainOp::Append => "append",
            ChainOp::List => "list",
            ChainOp::Replace => "replace",
        };
        f.write_str(op)
    }
}

/// A failed chain operation.
#[derive(Error, Debug)]
#[error("{op} on chain {table}/{chain} failed: {source}")]
pub struct ChainError {
    /// The operation that failed.
    pub op: ChainOp,
    /// Table name.
    pub table: String,
    /// Chain name.
    pub chain: String,
    /// Underlying command failure.
    #[source]
    pub source: CommandError,
}

impl ChainError {
    fn new(op: ChainOp, table: &str, chain: &str, source: CommandError) -> Self {
        Self {
            op,
            table: table.to_string(),
            chain: chain.to_string(),
            source,
        }
    }
}

/// An accept rule for traffic from one member address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// Source address.
    pub source: NodeAddress,
    /// Protocol, e.g. `tcp`.
    pub protocol: String,
    /// Destination port.
    pub port: u16,
}

impl FirewallRule {
    /// Returns the rule specification as iptables arguments.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "-s".to_string(),
            self.source.to_string(),
            "-p".to_string(),
            self.protocol.clone(),
            "-m".to_string(),
            self.protocol.clone(),
            "--dport".to_string(),
            self.port.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_args().join(" "))
    }
}

/// Result of a single packet-filter operation.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Management interface of a packet filter.
#[async_trait]
pub trait PacketFilter: Send + Sync + 'static {
    /// Returns true if `chain` exists in `table`.
    async fn chain_exists(&self, table: &str, chain: &str) -> ChainResult<bool>;

    /// Removes every rule from `chain`.
    async fn clear_chain(&self, table: &str, chain: &str) -> ChainResult<()>;

    /// Creates `chain`.
    async fn new_chain(&self, table: &str, chain: &str) -> ChainResult<()>;

    /// Appends `rule` to the end of `chain`.
    async fn append_rule(&self, table: &str, chain: &str, rule: &FirewallRule) -> ChainResult<()>;

    /// Lists the rules of `chain` in the filter's textual form.
    async fn list_rules(&self, table: &str, chain: &str) -> ChainResult<Vec<String>>;

    /// Makes `chain` hold exactly `rules`, in order.
    ///
    /// The default implementation clears (or creates) the chain and appends
    /// the rules one by one, stopping at the first failure. That leaves the
    /// chain partially populated until the next successful call; backends
    /// with a transactional interface should override it.
    async fn replace_chain(
        &self,
        table: &str,
        chain: &str,
        rules: &[FirewallRule],
    ) -> ChainResult<()> {
        if self.chain_exists(table, chain).await? {
            self.clear_chain(table, chain).await?;
        } else {
            self.new_chain(table, chain).await?;
        }

        for rule in rules {
            self.append_rule(table, chain, rule).await?;
        }

        Ok(())
    }
}

/// Messages iptables prints when a chain is missing.
const NO_CHAIN_MESSAGES: [&str; 2] = ["No chain/target/match by that name", "does not exist"];

/// [`PacketFilter`] backed by the `iptables` command line tools.
pub struct IptablesPacketFilter {
    runner: BoxedRunner,
    iptables: String,
    iptables_restore: String,
}

impl IptablesPacketFilter {
    /// Creates a filter invoking the given `iptables` and `iptables-restore`
    /// binaries.
    pub fn new(
        runner: BoxedRunner,
        iptables: impl Into<String>,
        iptables_restore: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            iptables: iptables.into(),
            iptables_restore: iptables_restore.into(),
        }
    }

    fn iptables(&self, table: &str) -> Invocation {
        Invocation::new(&self.iptables).args(["--wait", "-t", table])
    }

    async fn run(
        &self,
        op: ChainOp,
        table: &str,
        chain: &str,
        invocation: Invocation,
    ) -> ChainResult<String> {
        self.runner
            .run(&invocation)
            .await
            .map(|output| output.stdout)
            .map_err(|e| ChainError::new(op, table, chain, e))
    }
}

/// Renders an `iptables-restore` payload that replaces `chain` with `rules`.
///
/// Declaring the chain flushes it (creating it if needed); with
/// `--noflush` every other chain in the table is left alone.
pub fn restore_payload(table: &str, chain: &str, rules: &[FirewallRule]) -> String {
    let mut payload = format!("*{}\n:{} - [0:0]\n", table, chain);
    for rule in rules {
        payload.push_str(&format!("-A {} {}\n", chain, rule));
    }
    payload.push_str("COMMIT\n");
    payload
}

#[async_trait]
impl PacketFilter for IptablesPacketFilter {
    async fn chain_exists(&self, table: &str, chain: &str) -> ChainResult<bool> {
        let invocation = self.iptables(table).args(["-S", chain]);
        match self.runner.run(&invocation).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let missing = e
                    .stderr()
                    .map(|stderr| NO_CHAIN_MESSAGES.iter().any(|m| stderr.contains(*m)))
                    .unwrap_or(false);
                if missing {
                    Ok(false)
                } else {
                    Err(ChainError::new(ChainOp::Exists, table, chain, e))
                }
            }
        }
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> ChainResult<()> {
        let invocation = self.iptables(table).args(["-F", chain]);
        self.run(ChainOp::Clear, table, chain, invocation).await.map(|_| ())
    }

    async fn new_chain(&self, table: &str, chain: &str) -> ChainResult<()> {
        let invocation = self.iptables(table).args(["-N", chain]);
        self.run(ChainOp::Create, table, chain, invocation).await.map(|_| ())
    }

    async fn append_rule(&self, table: &str, chain: &str, rule: &FirewallRule) -> ChainResult<()> {
        let invocation = self.iptables(table).args(["-A", chain]).args(rule.to_args());
        self.run(ChainOp::Append, table, chain, invocation).await.map(|_| ())
    }

    async fn list_rules(&self, table: &str, chain: &str) -> ChainResult<Vec<String>> {
        let invocation = self.iptables(table).args(["-S", chain]);
        let stdout = self.run(ChainOp::List, table, chain, invocation).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn replace_chain(
        &self,
        table: &str,
        chain: &str,
        rules: &[FirewallRule],
    ) -> ChainResult<()> {
        let invocation = Invocation::new(&self.iptables_restore)
            .args(["--wait", "--noflush"])
            .stdin(restore_payload(table, chain, rules));
        self.run(ChainOp::Replace, table, chain, invocation).await.map(|_| ())
    }
}

/// Applies membership as accept rules in a packet-filter chain.
pub struct FirewallChainApplier {
    filter: Arc<dyn PacketFilter>,
    table: String,
    chain: String,
    protocol: String,
    port: u16,
}

impl FirewallChainApplier {
    /// Creates an applier for the chain described by `config`.
    pub fn new(filter: Arc<dyn PacketFilter>, config: &FirewallConfig) -> Self {
        Self {
            filter,
            table: config.table.clone(),
            chain: config.chain.clone(),
            protocol: config.protocol.clone(),
            port: config.port,
        }
    }

    /// Renders the rules for `current`, one per address in snapshot order.
    pub fn render_rules(&self, current: &MembershipSnapshot) -> Vec<FirewallRule> {
        current
            .iter()
            .map(|address| FirewallRule {
                source: *address,
                protocol: self.protocol.clone(),
                port: self.port,
            })
            .collect()
    }
}

#[async_trait]
impl RuleApplier for FirewallChainApplier {
    fn name(&self) -> &str {
        "firewall"
    }

    async fn apply(&self, current: &MembershipSnapshot) -> Result<()> {
        let rules = self.render_rules(current);
        tracing::info!(
            table = %self.table,
            chain = %self.chain,
            rules = rules.len(),
            "building firewall chain"
        );

        self.filter.replace_chain(&self.table, &self.chain, &rules).await?;

        match self.filter.list_rules(&self.table, &self.chain).await {
            Ok(configured) => {
                for rule in configured {
                    tracing::info!(chain = %self.chain, %rule, "configured rule");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to list chain after update"),
        }

        Ok(())
    }
}
