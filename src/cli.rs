use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "wgpanel",
    about = "Manage WireGuard tunnels without running as root",
    version = env!("WGPANEL_BUILD_VERSION")
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (default: ~/.config/wgpanel/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// List tunnels in the WireGuard config directory
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show live interface and peer status
    Status {
        name: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Bring a tunnel up with wg-quick
    Up { name: String },

    /// Bring a tunnel down with wg-quick
    Down { name: String },

    /// Bring a tunnel down and up again
    Restart { name: String },

    /// Create a tunnel from an empty template
    Create { name: String },

    /// Bring a tunnel down and remove its config
    Delete { name: String },

    /// Import a .conf file into the config directory
    Import {
        file: PathBuf,
        /// Tunnel name (default: file name without .conf)
        #[arg(long)]
        name: Option<String>,
        /// Replace an existing tunnel of the same name
        #[arg(long)]
        force: bool,
    },

    /// Export a tunnel's config to a file
    Export { name: String, dest: PathBuf },

    /// Print a tunnel's config
    Show { name: String },

    /// Replace a tunnel's config with the contents of a file
    Edit { name: String, file: PathBuf },

    /// Print `wg show all`
    Log,

    /// Show version and config directory
    Info,

    /// Internal: privileged helper speaking JSON lines on stdio (hidden)
    #[command(hide = true)]
    Helper {
        #[arg(long)]
        config_dir: PathBuf,
        #[arg(long)]
        wg_bin: PathBuf,
        #[arg(long)]
        wg_quick_bin: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_flags_parse() {
        let cli = Cli::try_parse_from([
            "wgpanel", "-v", "import", "/tmp/office.conf", "--name", "work", "--force",
        ])
        .expect("parse");
        assert!(cli.verbose);
        match cli.command {
            TopCommand::Import { file, name, force } => {
                assert_eq!(file, PathBuf::from("/tmp/office.conf"));
                assert_eq!(name.as_deref(), Some("work"));
                assert!(force);
            }
            _ => panic!("expected import"),
        }
    }

    #[test]
    fn helper_requires_all_paths() {
        assert!(Cli::try_parse_from(["wgpanel", "helper", "--config-dir", "/etc/wireguard"]).is_err());
        let cli = Cli::try_parse_from([
            "wgpanel",
            "helper",
            "--config-dir",
            "/etc/wireguard",
            "--wg-bin",
            "/usr/bin/wg",
            "--wg-quick-bin",
            "/usr/bin/wg-quick",
        ])
        .expect("parse");
        assert!(matches!(cli.command, TopCommand::Helper { .. }));
    }
}
