use clap::Parser;
use tracing::error;

use wgpanel::cli::{Cli, TopCommand};
use wgpanel::config;
use wgpanel::logging;
use wgpanel::privileged::{self, HelperOptions};
use wgpanel::privileged_client::Backend;
use wgpanel::tunnels::{handlers, TunnelService};
use wgpanel::wireguard::ToolPaths;

fn main() {
    let cli = Cli::parse();

    match cli.command {
        // Elevated helper. stdout carries protocol frames only.
        TopCommand::Helper {
            config_dir,
            wg_bin,
            wg_quick_bin,
        } => {
            logging::init_helper(cli.verbose);
            let options = HelperOptions {
                config_dir,
                tools: ToolPaths {
                    wg: wg_bin,
                    wg_quick: wg_quick_bin,
                },
            };
            if let Err(e) = run_helper(options) {
                eprintln!("privileged helper error: {}", e);
                std::process::exit(1);
            }
        }

        other => {
            logging::init_terminal(cli.verbose);
            if let Err(e) = run_command(other, cli.config.as_deref()) {
                error!( error = ?e.to_string(), "command_failed");
                eprintln!("error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run_helper(options: HelperOptions) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    rt.block_on(privileged::serve_stdio(options))
}

fn run_command(command: TopCommand, config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = config::load_config(config_path)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let backend = Backend::from_config(&config)?;
        let service = TunnelService::new(backend.clone(), &config.helper_options())
            .with_app_version(env!("WGPANEL_BUILD_VERSION"));
        let result = handlers::dispatch(command, &service).await;
        backend.shutdown();
        result
    })
}
