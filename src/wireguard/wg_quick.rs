use std::path::Path;

use tracing::{info, warn};

use super::exec::{run_checked, ToolPaths};
use crate::error::Result;

/// Bring the interface up from its config file. Failures carry wg-quick's stderr.
pub async fn up(tools: &ToolPaths, config_path: &Path) -> Result<()> {
    run_wg_quick(tools, "up", config_path).await?;
    info!( config = ?config_path.display().to_string(), "wg_quick_up_succeeded");
    Ok(())
}

/// Bring the interface down. "Already inactive" is not an error.
pub async fn down(tools: &ToolPaths, config_path: &Path) {
    match run_wg_quick(tools, "down", config_path).await {
        Ok(()) => info!( config = ?config_path.display().to_string(), "wg_quick_down_succeeded"),
        Err(e) => warn!(
            config = ?config_path.display().to_string(),
            error = ?e.to_string(), "wg_quick_down_failure_tolerated"),
    }
}

pub async fn restart(tools: &ToolPaths, config_path: &Path) -> Result<()> {
    down(tools, config_path).await;
    up(tools, config_path).await
}

async fn run_wg_quick(tools: &ToolPaths, action: &str, config_path: &Path) -> Result<()> {
    let path = config_path.to_string_lossy();
    run_checked(&tools.wg_quick, &[action, path.as_ref()]).await?;
    Ok(())
}
