// SPDX-License-Identifier: AGPL-3.0-or-later
//! Primary host collaborators: packages, repository checkout, service manager

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::process::{self, CommandSpec};
use crate::settings::Settings;

/// Debian package that provides each tool the provisioner shells out to
pub fn package_for(tool: &str) -> &str {
    match tool {
        "ssh" => "openssh-client",
        "dig" => "dnsutils",
        other => other,
    }
}

/// Everything the orchestrator asks of the primary host
#[async_trait]
pub trait PrimaryHost: Send + Sync {
    /// Tools from `required` that are not on `PATH`
    async fn missing_dependencies(&self, required: &[&str]) -> Vec<String>;

    async fn install_packages(&self, packages: &[String]) -> Result<()>;

    async fn repository_present(&self) -> bool;

    async fn acquire_repository(&self) -> Result<()>;

    /// Enable and restart the service unit
    async fn restart_service(&self) -> Result<()>;
}

/// The real host: `apt-get`, `git`, `systemctl`
#[derive(Debug, Clone)]
pub struct SystemPrimary {
    install_dir: PathBuf,
    repository_url: String,
    branch: String,
    service: String,
    timeout: Duration,
}

impl SystemPrimary {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            install_dir: settings.paths.install_dir.clone(),
            repository_url: settings.repository.url.clone(),
            branch: settings.repository.branch.clone(),
            service: settings.service.name.clone(),
            // package installs and clones outlast a single SSH command
            timeout: settings.command_timeout() * 10,
        }
    }
}

#[async_trait]
impl PrimaryHost for SystemPrimary {
    async fn missing_dependencies(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|tool| process::which(tool).is_none())
            .map(|tool| tool.to_string())
            .collect()
    }

    async fn install_packages(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        info!(packages = ?packages, "Installing packages");
        let update = CommandSpec::new("apt-get")
            .arg("update")
            .env("DEBIAN_FRONTEND", "noninteractive");
        process::run_checked(&update, self.timeout).await?;

        let install = CommandSpec::new("apt-get")
            .args(["install", "-y", "--no-install-recommends"])
            .args(packages.iter().cloned())
            .env("DEBIAN_FRONTEND", "noninteractive");
        process::run_checked(&install, self.timeout).await?;
        Ok(())
    }

    async fn repository_present(&self) -> bool {
        self.install_dir.join(".git").is_dir()
    }

    async fn acquire_repository(&self) -> Result<()> {
        if self.repository_url.trim().is_empty() {
            return Err(ProvisionError::InvalidSettings {
                message: "repository.url is required to acquire the service checkout".to_string(),
            });
        }
        if let Some(parent) = self.install_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!(
            url = %self.repository_url,
            branch = %self.branch,
            dir = %self.install_dir.display(),
            "Cloning service repository"
        );
        let clone = CommandSpec::new("git")
            .args(["clone", "--depth", "1", "--branch"])
            .arg(self.branch.as_str())
            .arg(self.repository_url.as_str())
            .arg(self.install_dir.display().to_string());
        process::run_checked(&clone, self.timeout).await?;
        Ok(())
    }

    async fn restart_service(&self) -> Result<()> {
        let unit = format!("{}.service", self.service);
        for action in ["daemon-reload", "enable", "restart"] {
            let mut spec = CommandSpec::new("systemctl").arg(action);
            if action != "daemon-reload" {
                spec = spec.arg(unit.as_str());
            }
            process::run_checked(&spec, self.timeout).await?;
        }
        info!(unit = %unit, "Service restarted");
        Ok(())
    }
}
