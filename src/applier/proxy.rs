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

//! Reverse-proxy upstream applier.
//!
//! Renders one nginx `upstream` block per configured target, writes the
//! file into place and asks the service manager to reload nginx.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::applier::{ApplyError, Result, RuleApplier};
use crate::command::{BoxedRunner, CommandOutput, Invocation};
use crate::config::ProxyConfig;
use crate::membership::MembershipSnapshot;

/// A statically configured backend group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamTarget {
    /// Upstream block name.
    pub name: String,

    /// Service port every member serves this upstream on.
    pub port: u16,

    /// Server weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl UpstreamTarget {
    /// Creates a target with the default weight.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            weight: default_weight(),
        }
    }
}

fn default_weight() -> u32 {
    100
}

/// Renders the upstream configuration for `current`.
///
/// Targets appear in declaration order, each with one server line per
/// member in snapshot order.
pub fn render_upstreams(targets: &[UpstreamTarget], current: &MembershipSnapshot) -> Vec<String> {
    let mut lines = Vec::with_capacity(targets.len() * (current.len() + 2));

    for target in targets {
        lines.push(format!("upstream {} {{", target.name));
        for address in current {
            let host = match address.ip() {
                std::net::IpAddr::V4(ip) => ip.to_string(),
                std::net::IpAddr::V6(ip) => format!("[{}]", ip),
            };
            lines.push(format!("server {}:{} weight={};", host, target.port, target.weight));
        }
        lines.push("}".to_string());
    }

    lines
}

/// Replaces `path` with `lines` via a temporary file in the same directory,
/// so readers see either the old or the new content.
pub fn write_config(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = std::io::BufWriter::new(file.as_file_mut());
        for line in lines {
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
    }
    file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644))?;
    }

    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Asks the service manager to reload a unit.
pub struct ServiceReloader {
    runner: BoxedRunner,
    systemctl: String,
    service: String,
}

impl ServiceReloader {
    /// Creates a reloader running `<systemctl> reload <service>`.
    pub fn new(
        runner: BoxedRunner,
        systemctl: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            systemctl: systemctl.into(),
            service: service.into(),
        }
    }

    /// Runs the reload. The output is only logged.
    pub async fn reload(&self) -> Result<CommandOutput> {
        let invocation = Invocation::new(&self.systemctl).args(["reload", self.service.as_str()]);
        tracing::info!(command = %invocation, "reloading service");

        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|source| ApplyError::Reload {
                service: self.service.clone(),
                source,
            })?;

        tracing::info!(
            service = %self.service,
            stdout = %output.stdout.trim(),
            stderr = %output.stderr.trim(),
            "reload completed"
        );
        Ok(output)
    }
}

/// Applies membership as nginx upstream blocks.
pub struct ReverseProxyApplier {
    targets: Vec<UpstreamTarget>,
    config_path: PathBuf,
    reloader: ServiceReloader,
}

impl ReverseProxyApplier {
    /// Creates an applier from `config`, reloading through `runner`.
    pub fn new(runner: BoxedRunner, config: &ProxyConfig) -> Self {
        Self {
            targets: config.upstreams.clone(),
            config_path: config.upstream_file.clone(),
            reloader: ServiceReloader::new(
                runner,
                config.systemctl.clone(),
                config.service.clone(),
            ),
        }
    }
}

#[async_trait]
impl RuleApplier for ReverseProxyApplier {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn apply(&self, current: &MembershipSnapshot) -> Result<()> {
        tracing::info!(
            path = %self.config_path.display(),
            upstreams = self.targets.len(),
            members = current.len(),
            "building upstream file"
        );

        let lines = render_upstreams(&self.targets, current);
        let path = self.config_path.clone();
        let write_path = path.clone();

        tokio::task::spawn_blocking(move || write_config(&write_path, &lines))
            .await
            .map_err(std::io::Error::other)
            .and_then(|written| written)
            .map_err(|source| ApplyError::Write { path, source })?;

        self.reloader.reload().await?;
        Ok(())
    }
}
