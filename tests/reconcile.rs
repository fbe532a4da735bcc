//! End-to-end reconciliation scenarios
//!
//! These tests drive the reconciler through the public API with an in-memory
//! node source, an in-memory packet filter and a recording command runner.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::ObjectMeta;

use kube_node_sync::applier::{ChainError, FirewallRule, PacketFilter, ReverseProxyApplier};
use kube_node_sync::command::{CommandError, CommandOutput, CommandRunner, Invocation};
use kube_node_sync::config::{FirewallConfig, ProxyConfig};
use kube_node_sync::source::{snapshot_from_nodes, DEFAULT_ADDRESS_ANNOTATION};
use kube_node_sync::{
    CycleOutcome, FirewallChainApplier, MemberSource, MembershipSnapshot, Reconciler, SourceError,
};

fn node(name: &str, annotation: Option<&str>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: annotation.map(|value| {
                BTreeMap::from([(DEFAULT_ADDRESS_ANNOTATION.to_string(), value.to_string())])
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Serves node lists as if they came from the apiserver.
#[derive(Default)]
struct FakeCluster {
    lists: Mutex<VecDeque<Result<Vec<Node>, String>>>,
}

impl FakeCluster {
    fn push_nodes(&self, nodes: Vec<Node>) {
        self.lists.lock().unwrap().push_back(Ok(nodes));
    }

    fn push_outage(&self) {
        self.lists.lock().unwrap().push_back(Err("apiserver unreachable".to_string()));
    }
}

#[async_trait]
impl MemberSource for FakeCluster {
    async fn fetch(&self) -> Result<MembershipSnapshot, SourceError> {
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(Ok(nodes)) => Ok(snapshot_from_nodes(&nodes, DEFAULT_ADDRESS_ANNOTATION)),
            Some(Err(e)) => Err(SourceError::Unavailable(e.into())),
            None => panic!("no node list queued"),
        }
    }
}

/// Packet filter keeping chains in memory and counting replacements.
#[derive(Default)]
struct MemoryFilter {
    chains: Mutex<HashMap<String, Vec<String>>>,
    replacements: AtomicUsize,
}

impl MemoryFilter {
    fn chain(&self, chain: &str) -> Option<Vec<String>> {
        self.chains.lock().unwrap().get(chain).cloned()
    }
}

#[async_trait]
impl PacketFilter for MemoryFilter {
    async fn chain_exists(&self, _table: &str, chain: &str) -> Result<bool, ChainError> {
        Ok(self.chains.lock().unwrap().contains_key(chain))
    }

    async fn clear_chain(&self, _table: &str, chain: &str) -> Result<(), ChainError> {
        if let Some(rules) = self.chains.lock().unwrap().get_mut(chain) {
            rules.clear();
        }
        Ok(())
    }

    async fn new_chain(&self, _table: &str, chain: &str) -> Result<(), ChainError> {
        self.chains.lock().unwrap().insert(chain.to_string(), Vec::new());
        Ok(())
    }

    async fn append_rule(
        &self,
        _table: &str,
        chain: &str,
        rule: &FirewallRule,
    ) -> Result<(), ChainError> {
        self.chains
            .lock()
            .unwrap()
            .entry(chain.to_string())
            .or_default()
            .push(rule.to_string());
        Ok(())
    }

    async fn list_rules(&self, _table: &str, chain: &str) -> Result<Vec<String>, ChainError> {
        Ok(self.chain(chain).unwrap_or_default())
    }

    async fn replace_chain(
        &self,
        _table: &str,
        chain: &str,
        rules: &[FirewallRule],
    ) -> Result<(), ChainError> {
        self.replacements.fetch_add(1, Ordering::SeqCst);
        self.chains
            .lock()
            .unwrap()
            .insert(chain.to_string(), rules.iter().map(|r| r.to_string()).collect());
        Ok(())
    }
}

/// Records commands; fails the next `fail` invocations.
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    fail: AtomicUsize,
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(invocation.to_string());
        let failing = self
            .fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CommandError::Failed {
                command: invocation.to_string(),
                status: "1".to_string(),
                stdout: String::new(),
                stderr: "Job for nginx.service failed".to_string(),
            });
        }
        Ok(CommandOutput::default())
    }
}

#[tokio::test]
async fn test_firewall_scale_up_adds_one_rule_per_node() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.push_nodes(vec![node("worker-1", Some("10.0.0.1/24"))]);
    cluster.push_nodes(vec![
        node("worker-1", Some("10.0.0.1/24")),
        node("worker-2", Some("10.0.0.2/24")),
    ]);
    let filter = Arc::new(MemoryFilter::default());
    let applier = Arc::new(FirewallChainApplier::new(filter.clone(), &FirewallConfig::default()));
    let mut reconciler = Reconciler::new(cluster, applier);

    assert_eq!(reconciler.run_once().await, CycleOutcome::Applied { members: 1 });
    assert_eq!(reconciler.run_once().await, CycleOutcome::Applied { members: 2 });

    assert_eq!(
        filter.chain("mongodb").unwrap(),
        vec![
            "-s 10.0.0.1 -p tcp -m tcp --dport 27017 -j ACCEPT",
            "-s 10.0.0.2 -p tcp -m tcp --dport 27017 -j ACCEPT",
        ]
    );
}

#[tokio::test]
async fn test_firewall_reordered_nodes_do_not_reapply() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.push_nodes(vec![
        node("worker-1", Some("10.0.0.1/24")),
        node("worker-2", Some("10.0.0.2/24")),
    ]);
    cluster.push_nodes(vec![
        node("worker-2", Some("10.0.0.2/24")),
        node("worker-1", Some("10.0.0.1/24")),
    ]);
    let filter = Arc::new(MemoryFilter::default());
    let applier = Arc::new(FirewallChainApplier::new(filter.clone(), &FirewallConfig::default()));
    let mut reconciler = Reconciler::new(cluster, applier);

    reconciler.run_once().await;
    assert_eq!(reconciler.run_once().await, CycleOutcome::Unchanged);
    assert_eq!(filter.replacements.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_firewall_unannotated_node_is_ignored() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.push_nodes(vec![
        node("control-plane", None),
        node("worker-1", Some("10.0.0.1/24")),
    ]);
    let filter = Arc::new(MemoryFilter::default());
    let applier = Arc::new(FirewallChainApplier::new(filter.clone(), &FirewallConfig::default()));
    let mut reconciler = Reconciler::new(cluster, applier);

    assert_eq!(reconciler.run_once().await, CycleOutcome::Applied { members: 1 });
    assert_eq!(filter.chain("mongodb").unwrap().len(), 1);
}

#[tokio::test]
async fn test_firewall_all_annotations_lost_empties_chain() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.push_nodes(vec![node("worker-1", Some("10.0.0.1/24"))]);
    cluster.push_nodes(vec![node("worker-1", None)]);
    let filter = Arc::new(MemoryFilter::default());
    let applier = Arc::new(FirewallChainApplier::new(filter.clone(), &FirewallConfig::default()));
    let mut reconciler = Reconciler::new(cluster, applier);

    reconciler.run_once().await;
    assert_eq!(reconciler.run_once().await, CycleOutcome::Applied { members: 0 });
    assert_eq!(filter.chain("mongodb"), Some(Vec::new()));
}

#[tokio::test]
async fn test_outage_does_not_clear_chain() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.push_nodes(vec![node("worker-1", Some("10.0.0.1/24"))]);
    cluster.push_outage();
    cluster.push_nodes(vec![node("worker-1", Some("10.0.0.1/24"))]);
    let filter = Arc::new(MemoryFilter::default());
    let applier = Arc::new(FirewallChainApplier::new(filter.clone(), &FirewallConfig::default()));
    let mut reconciler = Reconciler::new(cluster, applier);

    reconciler.run_once().await;
    assert_eq!(reconciler.run_once().await, CycleOutcome::FetchFailed);
    assert_eq!(filter.chain("mongodb").unwrap().len(), 1);
    assert_eq!(reconciler.run_once().await, CycleOutcome::Unchanged);
    assert_eq!(filter.replacements.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_proxy_reload_failure_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
        upstream_file: dir.path().join("upstreams.conf"),
        ..ProxyConfig::default()
    };
    let cluster = Arc::new(FakeCluster::default());
    let nodes = vec![
        node("worker-1", Some("10.0.0.1/24")),
        node("worker-2", Some("10.0.0.2/24")),
    ];
    cluster.push_nodes(nodes.clone());
    cluster.push_nodes(nodes);

    let runner = Arc::new(RecordingRunner::default());
    runner.fail.store(1, Ordering::SeqCst);
    let applier = Arc::new(ReverseProxyApplier::new(runner.clone(), &config));
    let mut reconciler = Reconciler::new(cluster, applier);

    assert_eq!(reconciler.run_once().await, CycleOutcome::ApplyFailed);
    assert!(reconciler.held().is_empty());
    assert_eq!(reconciler.run_once().await, CycleOutcome::Applied { members: 2 });

    assert_eq!(
        *runner.calls.lock().unwrap(),
        vec!["/bin/systemctl reload nginx", "/bin/systemctl reload nginx"]
    );

    let content = std::fs::read_to_string(&config.upstream_file).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 4 * (2 + 2));
    assert_eq!(lines[0], "upstream diy {");
    assert_eq!(lines[1], "server 10.0.0.1:32016 weight=100;");
    assert_eq!(lines[2], "server 10.0.0.2:32016 weight=100;");
    assert_eq!(lines[3], "}");
    assert_eq!(lines[12], "upstream monitor {");
}
