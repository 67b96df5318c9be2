use std::path::Path;

use anyhow::Context;

use crate::cli::TopCommand;
use crate::privileged_client::HelperClient;
use crate::tunnel_name::TunnelName;
use crate::wireguard::dump::InterfaceStatus;

use super::service::TunnelService;

pub async fn dispatch<C: HelperClient>(
    command: TopCommand,
    service: &TunnelService<C>,
) -> anyhow::Result<()> {
    match command {
        TopCommand::List { json } => cmd_list(service, json).await,
        TopCommand::Status { name, json } => cmd_status(service, &name, json).await,
        TopCommand::Up { name } => {
            let name = TunnelName::normalize(&name)?;
            println!("Bringing up {}...", name);
            service.up(&name).await?;
            println!("Tunnel {} is up.", name);
            Ok(())
        }
        TopCommand::Down { name } => {
            let name = TunnelName::normalize(&name)?;
            service.down(&name).await?;
            println!("Tunnel {} is down.", name);
            Ok(())
        }
        TopCommand::Restart { name } => {
            let name = TunnelName::normalize(&name)?;
            service.restart(&name).await?;
            println!("Tunnel {} restarted.", name);
            Ok(())
        }
        TopCommand::Create { name } => {
            let name = TunnelName::normalize(&name)?;
            service.create(&name).await?;
            println!("Created tunnel {}. Fill in its keys with `wgpanel edit`.", name);
            Ok(())
        }
        TopCommand::Delete { name } => {
            let name = TunnelName::normalize(&name)?;
            service.delete(&name).await?;
            println!("Deleted tunnel {}.", name);
            Ok(())
        }
        TopCommand::Import { file, name, force } => {
            let imported = service.import(&file, name.as_deref(), force).await?;
            println!("Imported {} as {}.", file.display(), imported);
            Ok(())
        }
        TopCommand::Export { name, dest } => {
            let name = TunnelName::normalize(&name)?;
            service.export(&name, &dest).await?;
            println!("Exported {} to {}.", name, dest.display());
            Ok(())
        }
        TopCommand::Show { name } => {
            let name = TunnelName::normalize(&name)?;
            print!("{}", service.read_config(&name).await?);
            Ok(())
        }
        TopCommand::Edit { name, file } => cmd_edit(service, &name, &file).await,
        TopCommand::Log => {
            println!("{}", service.log().await?);
            Ok(())
        }
        TopCommand::Info => {
            let info = service.info().await;
            println!("wgpanel     {}", info.app_version);
            let wg_version = if info.wg_version.is_empty() {
                "not found"
            } else {
                info.wg_version.as_str()
            };
            println!("wireguard   {}", wg_version);
            println!("config dir  {}", info.config_dir.display());
            Ok(())
        }
        TopCommand::Helper { .. } => anyhow::bail!("helper mode is handled before dispatch"),
    }
}

async fn cmd_list<C: HelperClient>(service: &TunnelService<C>, json: bool) -> anyhow::Result<()> {
    let tunnels = service.list_tunnels().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tunnels)?);
        return Ok(());
    }
    if tunnels.is_empty() {
        println!("No tunnels found.");
        return Ok(());
    }

    println!("{:<20} {:<8} {:<20} Key", "Name", "State", "Address");
    for t in &tunnels {
        let state = if t.active { "active" } else { "down" };
        let key = if t.has_private_key { "yes" } else { "missing" };
        let address = if t.address.is_empty() { "-" } else { t.address.as_str() };
        println!("{:<20} {:<8} {:<20} {}", t.name, state, address, key);
    }
    Ok(())
}

async fn cmd_status<C: HelperClient>(
    service: &TunnelService<C>,
    name: &str,
    json: bool,
) -> anyhow::Result<()> {
    let name = TunnelName::normalize(name)?;
    let status = service.status(&name).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    print_status(&status);
    Ok(())
}

fn print_status(status: &InterfaceStatus) {
    if !status.active {
        println!("{}: inactive", status.interface_name);
        return;
    }

    println!("interface: {}", status.interface_name);
    println!("  public key:  {}", status.public_key);
    println!("  listen port: {}", status.listen_port);
    for peer in &status.peers {
        println!();
        println!("peer: {}", peer.public_key);
        if !peer.endpoint.is_empty() && peer.endpoint != "(none)" {
            println!("  endpoint:    {}", peer.endpoint);
        }
        println!("  allowed ips: {}", peer.allowed_ips);
        if peer.latest_handshake_at == 0 {
            println!("  handshake:   never");
        } else {
            println!("  handshake:   {}", peer.latest_handshake_at);
        }
        println!(
            "  transfer:    {} received, {} sent",
            peer.transfer_rx(),
            peer.transfer_tx()
        );
        if peer.keepalive_seconds > 0 {
            println!("  keepalive:   every {} seconds", peer.keepalive_seconds);
        }
    }
}

async fn cmd_edit<C: HelperClient>(
    service: &TunnelService<C>,
    name: &str,
    file: &Path,
) -> anyhow::Result<()> {
    let name = TunnelName::normalize(name)?;
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    service.write_config(&name, &content).await?;
    println!("Saved {}.", name);
    Ok(())
}
