//! Best-effort `wg show` queries. An idle system is a normal state, so tool
//! failures come back as empty output instead of errors.

use super::exec::{run_lenient, ToolPaths};
use crate::tunnel_name::TunnelName;

pub async fn dump(tools: &ToolPaths, name: &TunnelName) -> String {
    run_lenient(&tools.wg, &["show", name.as_str(), "dump"]).await
}

pub async fn allowed_ips(tools: &ToolPaths, name: &TunnelName) -> String {
    run_lenient(&tools.wg, &["show", name.as_str(), "allowed-ips"]).await
}

pub async fn interfaces(tools: &ToolPaths) -> String {
    run_lenient(&tools.wg, &["show", "interfaces"]).await
}

pub async fn all(tools: &ToolPaths) -> String {
    run_lenient(&tools.wg, &["show", "all"]).await
}

/// Split `wg show interfaces` output into interface names.
#[must_use]
pub fn parse_interfaces(output: &str) -> Vec<String> {
    output.split_whitespace().map(str::to_string).collect()
}
