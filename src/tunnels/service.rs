use std::collections::HashSet;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::privileged::HelperOptions;
use crate::privileged_api::HelperCommand;
use crate::privileged_client::HelperClient;
use crate::tunnel_name::TunnelName;
use crate::wireguard::config::{empty_config_template, parse_config_meta, ConfigMeta};
use crate::wireguard::dump::{apply_allowed_ips, parse_allowed_ips_map, parse_dump, InterfaceStatus};
use crate::wireguard::exec::run_lenient;
use crate::wireguard::wg_show::parse_interfaces;
use crate::wireguard::ToolPaths;

pub const NO_ACTIVE_INTERFACES: &str = "No WireGuard interfaces are active.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRecord {
    pub name: TunnelName,
    pub path: PathBuf,
    pub active: bool,
    pub address: String,
    pub has_private_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub app_version: String,
    pub wg_version: String,
    pub config_dir: PathBuf,
}

/// Tunnel operations, with every privileged step routed through `C`.
pub struct TunnelService<C> {
    client: C,
    config_dir: PathBuf,
    tools: ToolPaths,
    app_version: String,
}

impl<C: HelperClient> TunnelService<C> {
    pub fn new(client: C, options: &HelperOptions) -> Self {
        Self {
            client,
            config_dir: options.config_dir.clone(),
            tools: options.tools.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    #[must_use]
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    fn config_path(&self, name: &TunnelName) -> PathBuf {
        self.config_dir.join(name.config_file_name())
    }

    async fn call(
        &self,
        command: HelperCommand,
        name: Option<&TunnelName>,
        content: &str,
    ) -> Result<Value> {
        self.client.call(command, name, content).await
    }

    async fn call_text(&self, command: HelperCommand, name: Option<&TunnelName>) -> Result<String> {
        let value = self.call(command, name, "").await?;
        expect_text(command, value)
    }

    async fn tunnel_names(&self) -> Result<Vec<TunnelName>> {
        let value = self.call(HelperCommand::List, None, "").await?;
        let raw: Vec<String> = serde_json::from_value(value)
            .map_err(|e| AppError::Protocol(format!("list reply: {}", e)))?;
        Ok(raw
            .iter()
            .filter_map(|n| TunnelName::normalize(n).ok())
            .collect())
    }

    async fn exists(&self, name: &TunnelName) -> Result<bool> {
        Ok(self.tunnel_names().await?.contains(name))
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>> {
        let (names, interfaces) = tokio::join!(
            self.tunnel_names(),
            self.call_text(HelperCommand::WgShowInterfaces, None)
        );
        let names = names?;
        let active: HashSet<String> = parse_interfaces(&interfaces?).into_iter().collect();

        let metas = join_all(names.iter().map(|name| async move {
            match self.read_config(name).await {
                Ok(content) => parse_config_meta(&content),
                Err(e) => {
                    debug!( name = ?name.as_str(), error = ?e.to_string(), "tunnel_config_unreadable");
                    ConfigMeta::default()
                }
            }
        }))
        .await;

        let mut records: Vec<TunnelRecord> = names
            .iter()
            .zip(metas)
            .map(|(name, meta)| TunnelRecord {
                name: name.clone(),
                path: self.config_path(name),
                active: active.contains(name.as_str()),
                address: meta.address,
                has_private_key: meta.has_private_key,
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    pub async fn status(&self, name: &TunnelName) -> Result<InterfaceStatus> {
        let dump = self.call_text(HelperCommand::WgShowDump, Some(name)).await?;
        if dump.trim().is_empty() {
            return Ok(InterfaceStatus::inactive(name.as_str()));
        }
        let Some(mut status) = parse_dump(&dump) else {
            return Ok(InterfaceStatus::inactive(name.as_str()));
        };
        if status.interface_name.is_empty() {
            status.interface_name = name.to_string();
        }

        let allowed = self
            .call_text(HelperCommand::WgShowAllowedIps, Some(name))
            .await?;
        let map = parse_allowed_ips_map(&allowed);
        if !map.is_empty() {
            apply_allowed_ips(&mut status, &map);
        }
        Ok(status)
    }

    pub async fn up(&self, name: &TunnelName) -> Result<()> {
        self.call(HelperCommand::WgUp, Some(name), "").await?;
        info!( name = ?name.as_str(), "tunnel_up");
        Ok(())
    }

    pub async fn down(&self, name: &TunnelName) -> Result<()> {
        self.call(HelperCommand::WgDown, Some(name), "").await?;
        info!( name = ?name.as_str(), "tunnel_down");
        Ok(())
    }

    pub async fn restart(&self, name: &TunnelName) -> Result<()> {
        self.call(HelperCommand::WgRestart, Some(name), "").await?;
        info!( name = ?name.as_str(), "tunnel_restarted");
        Ok(())
    }

    /// Write the empty template for a new tunnel.
    pub async fn create(&self, name: &TunnelName) -> Result<()> {
        if self.exists(name).await? {
            return Err(already_exists(name));
        }
        self.write_config(name, &empty_config_template(name)).await
    }

    /// Copy a `.conf` from anywhere the user can read into the config
    /// directory. The tunnel name defaults to the file stem.
    pub async fn import(
        &self,
        source: &Path,
        name: Option<&str>,
        overwrite: bool,
    ) -> Result<TunnelName> {
        let raw = match name {
            Some(name) => name.to_string(),
            None => source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let name = TunnelName::normalize(&raw)?;
        let content = tokio::fs::read_to_string(source).await?;

        if !overwrite && self.exists(&name).await? {
            return Err(already_exists(&name));
        }
        self.write_config(&name, &content).await?;
        info!(
            name = ?name.as_str(),
            source = ?source.display().to_string(), "tunnel_imported");
        Ok(name)
    }

    /// Save a tunnel's config to `dest`, readable by the owner only.
    pub async fn export(&self, name: &TunnelName, dest: &Path) -> Result<()> {
        let content = self.read_config(name).await?;
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&dest)?;
            file.write_all(content.as_bytes())
        })
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    pub async fn read_config(&self, name: &TunnelName) -> Result<String> {
        self.call_text(HelperCommand::Read, Some(name)).await
    }

    pub async fn write_config(&self, name: &TunnelName, content: &str) -> Result<()> {
        self.call(HelperCommand::Write, Some(name), content).await?;
        Ok(())
    }

    /// Take the interface down (failure tolerated), then remove its config.
    pub async fn delete(&self, name: &TunnelName) -> Result<()> {
        self.call(HelperCommand::WgDown, Some(name), "").await?;
        self.call(HelperCommand::Delete, Some(name), "").await?;
        info!( name = ?name.as_str(), "tunnel_deleted");
        Ok(())
    }

    pub async fn log(&self) -> Result<String> {
        let output = self.call_text(HelperCommand::WgShowAll, None).await?;
        let output = output.trim();
        if output.is_empty() {
            return Ok(NO_ACTIVE_INTERFACES.to_string());
        }
        Ok(output.to_string())
    }

    pub async fn info(&self) -> AppInfo {
        let wg_version = run_lenient(&self.tools.wg, &["--version"]).await;
        AppInfo {
            app_version: self.app_version.clone(),
            wg_version: wg_version.trim().to_string(),
            config_dir: self.config_dir.clone(),
        }
    }
}

fn already_exists(name: &TunnelName) -> AppError {
    AppError::AlreadyExists(format!("Tunnel {} already exists.", name))
}

fn expect_text(command: HelperCommand, value: Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(text),
        Value::Null => Ok(String::new()),
        other => Err(AppError::Protocol(format!(
            "{} reply: expected text, got {}",
            command, other
        ))),
    }
}
