use serde::Serialize;

use crate::tunnel_name::TunnelName;

/// The few fields the list view needs from a tunnel's `.conf` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMeta {
    pub address: String,
    pub has_private_key: bool,
}

/// Extract the first `Address` (case-insensitive key) and whether a
/// `PrivateKey` line is present. Comment lines are skipped.
#[must_use]
pub fn parse_config_meta(content: &str) -> ConfigMeta {
    let mut meta = ConfigMeta::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim_end();
        if key.eq_ignore_ascii_case("Address") && meta.address.is_empty() {
            meta.address = value.trim().to_string();
        }
        if key == "PrivateKey" {
            meta.has_private_key = true;
        }
    }
    meta
}

/// Skeleton written by `create`.
#[must_use]
pub fn empty_config_template(name: &TunnelName) -> String {
    format!(
        "[Interface]\n\
         # {name}\n\
         PrivateKey = \n\
         Address = \n\
         \n\
         [Peer]\n\
         PublicKey = \n\
         AllowedIPs = 0.0.0.0/0\n\
         Endpoint = \n"
    )
}
