//! Parsers for `wg show <iface> dump` and `wg show <iface> allowed-ips`.
//!
//! Numeric fields that fail to parse read as 0, so malformed output cannot be
//! told apart from a real zero.

use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    pub active: bool,
    pub interface_name: String,
    pub public_key: String,
    pub listen_port: String,
    pub peers: Vec<PeerStatus>,
}

impl InterfaceStatus {
    #[must_use]
    pub fn inactive(interface_name: &str) -> Self {
        Self {
            interface_name: interface_name.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn primary_peer(&self) -> Option<&PeerStatus> {
        self.peers.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    /// Unix seconds, 0 = never.
    pub latest_handshake_at: u64,
    pub transfer_rx_bytes: u64,
    pub transfer_tx_bytes: u64,
    /// 0 = disabled.
    pub keepalive_seconds: u32,
}

impl PeerStatus {
    #[must_use]
    pub fn transfer_rx(&self) -> String {
        format_bytes(self.transfer_rx_bytes)
    }

    #[must_use]
    pub fn transfer_tx(&self) -> String {
        format_bytes(self.transfer_tx_bytes)
    }
}

/// How a peer row was split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PeerFields {
    /// Tab-delimited: the columns are taken as-is.
    Strict(Vec<String>),
    /// Whitespace-delimited with at least 8 fields: the allowed-IP list may
    /// have been split into several fields and is joined back together.
    Reconstructed(Vec<String>),
    /// Whitespace-delimited and too short to reconstruct.
    Short(Vec<String>),
}

impl PeerFields {
    pub(crate) fn classify(line: &str) -> Self {
        let tab_parts: Vec<&str> = line.split('\t').collect();
        if tab_parts.len() > 1 {
            return Self::Strict(tab_parts.into_iter().map(str::to_string).collect());
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            return Self::Short(parts.into_iter().map(str::to_string).collect());
        }

        let n = parts.len();
        Self::Reconstructed(vec![
            parts[0].to_string(),
            parts[1].to_string(),
            parts[2].to_string(),
            parts[3..n - 4].join(" "),
            parts[n - 4].to_string(),
            parts[n - 3].to_string(),
            parts[n - 2].to_string(),
            parts[n - 1].to_string(),
        ])
    }

    fn fields(&self) -> &[String] {
        match self {
            Self::Strict(f) | Self::Reconstructed(f) | Self::Short(f) => f,
        }
    }

    fn get(&self, index: usize) -> &str {
        self.fields().get(index).map(String::as_str).unwrap_or("")
    }

    fn to_peer(&self) -> PeerStatus {
        PeerStatus {
            public_key: self.get(0).to_string(),
            endpoint: self.get(2).to_string(),
            allowed_ips: self.get(3).to_string(),
            latest_handshake_at: parse_counter(self.get(4)),
            transfer_rx_bytes: parse_counter(self.get(5)),
            transfer_tx_bytes: parse_counter(self.get(6)),
            keepalive_seconds: parse_keepalive(self.get(7)),
        }
    }
}

fn split_fields(line: &str) -> Vec<&str> {
    let tab_parts: Vec<&str> = line.split('\t').collect();
    if tab_parts.len() > 1 {
        return tab_parts;
    }
    line.split_whitespace().collect()
}

/// Parse `wg show <iface> dump` (or a single interface block of `wg show all dump`).
#[must_use]
pub fn parse_dump(text: &str) -> Option<InterfaceStatus> {
    let mut lines = text.trim().lines().filter(|l| !l.trim().is_empty());
    let summary = split_fields(lines.next()?);
    let field = |i: usize| summary.get(i).copied().unwrap_or("").to_string();

    // `wg show all dump` prefixes every row with the interface name. The
    // per-interface form starts with the private key, which is never copied.
    let (interface_name, public_key, listen_port) = if summary.len() >= 5 {
        (field(0), field(2), field(3))
    } else {
        (String::new(), field(1), field(2))
    };

    let peers = lines
        .map(|line| PeerFields::classify(line).to_peer())
        .collect();

    Some(InterfaceStatus {
        active: true,
        interface_name,
        public_key,
        listen_port,
        peers,
    })
}

/// Parse `wg show <iface> allowed-ips`: `<public key> <allowed ips...>` per line.
#[must_use]
pub fn parse_allowed_ips_map(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, rest) = line.trim().split_once(char::is_whitespace)?;
            let value = rest.trim();
            if value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Overwrite each peer's allowed IPs with the entry from `map`, when present.
pub fn apply_allowed_ips(status: &mut InterfaceStatus, map: &HashMap<String, String>) {
    for peer in &mut status.peers {
        if let Some(allowed) = map.get(&peer.public_key) {
            peer.allowed_ips = allowed.clone();
        }
    }
}

/// `off` and anything unparseable read as 0 (disabled).
#[must_use]
pub fn parse_keepalive(value: &str) -> u32 {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "off" {
        return 0;
    }
    trimmed.parse().unwrap_or(0)
}

fn parse_counter(value: &str) -> u64 {
    value.trim().parse().unwrap_or(0)
}

#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut current = bytes as f64;
    let mut unit = 0;
    current /= 1024.0;
    while current >= 1024.0 && unit < UNITS.len() - 1 {
        current /= 1024.0;
        unit += 1;
    }
    if current >= 10.0 {
        format!("{:.1} {}", current, UNITS[unit])
    } else {
        format!("{:.2} {}", current, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IFACE_PRIV: &str = "cHJpdmF0ZS1rZXktcGxhY2Vob2xkZXItMDAwMDAwMDA=";
    const IFACE_PUB: &str = "aW50ZXJmYWNlLXB1YmxpYy1rZXktMDAwMDAwMDAwMDA=";
    const PEER_PUB: &str = "cGVlci1wdWJsaWMta2V5LTAwMDAwMDAwMDAwMDAwMDA=";

    #[test]
    fn blank_dump_is_none() {
        assert_eq!(parse_dump(""), None);
        assert_eq!(parse_dump("   \n"), None);
    }

    #[test]
    fn tab_dump_reproduces_fields() {
        let dump = format!(
            "{IFACE_PRIV}\t{IFACE_PUB}\t51820\toff\n\
             {PEER_PUB}\t(none)\t198.51.100.7:51820\t10.0.0.2/32,fd00::2/128\t1700000123\t5000\t123456789\t25\n"
        );
        let status = parse_dump(&dump).expect("parsed");
        assert!(status.active);
        assert_eq!(status.interface_name, "");
        assert_eq!(status.public_key, IFACE_PUB);
        assert_eq!(status.listen_port, "51820");
        assert_eq!(
            status.peers,
            vec![PeerStatus {
                public_key: PEER_PUB.into(),
                endpoint: "198.51.100.7:51820".into(),
                allowed_ips: "10.0.0.2/32,fd00::2/128".into(),
                latest_handshake_at: 1_700_000_123,
                transfer_rx_bytes: 5000,
                transfer_tx_bytes: 123_456_789,
                keepalive_seconds: 25,
            }]
        );
    }

    #[test]
    fn all_dump_rows_shift_summary_fields() {
        let dump = format!("wg0\t{IFACE_PRIV}\t{IFACE_PUB}\t51820\toff\n");
        let status = parse_dump(&dump).expect("parsed");
        assert_eq!(status.interface_name, "wg0");
        assert_eq!(status.public_key, IFACE_PUB);
        assert_eq!(status.listen_port, "51820");
        assert!(status.peers.is_empty());
    }

    #[test]
    fn legacy_space_row_is_reconstructed() {
        let line = "pubkey endpoint endpoint2 10.0.0.2/32 1700000000 2048 4096 25";
        let fields = PeerFields::classify(line);
        assert!(matches!(fields, PeerFields::Reconstructed(_)));

        let dump = format!("{IFACE_PRIV} {IFACE_PUB} 51820 off\n{line}\n");
        let status = parse_dump(&dump).expect("parsed");
        let peer = &status.peers[0];
        assert_eq!(peer.public_key, "pubkey");
        assert_eq!(peer.endpoint, "endpoint2");
        assert_eq!(peer.allowed_ips, "10.0.0.2/32");
        assert_eq!(peer.latest_handshake_at, 1_700_000_000);
        assert_eq!(peer.transfer_rx(), "2.00 KB");
        assert_eq!(peer.transfer_tx(), "4.00 KB");
        assert_eq!(peer.keepalive_seconds, 25);
    }

    #[test]
    fn legacy_row_joins_split_allowed_ips() {
        let line = "pk psk 203.0.113.1:51820 10.0.0.2/32, 10.0.1.0/24 0 0 0 off";
        let PeerFields::Reconstructed(fields) = PeerFields::classify(line) else {
            panic!("expected reconstructed row");
        };
        assert_eq!(fields[3], "10.0.0.2/32, 10.0.1.0/24");
        assert_eq!(fields[7], "off");
    }

    #[test]
    fn short_rows_degrade_to_defaults() {
        let fields = PeerFields::classify("pk psk endpoint");
        assert!(matches!(fields, PeerFields::Short(_)));
        let peer = fields.to_peer();
        assert_eq!(peer.endpoint, "endpoint");
        assert_eq!(peer.allowed_ips, "");
        assert_eq!(peer.latest_handshake_at, 0);
        assert_eq!(peer.keepalive_seconds, 0);
    }

    #[test]
    fn keepalive_parsing_is_lenient() {
        assert_eq!(parse_keepalive("off"), 0);
        assert_eq!(parse_keepalive("not-a-number"), 0);
        assert_eq!(parse_keepalive("25"), 25);
        assert_eq!(parse_keepalive(""), 0);
    }

    #[test]
    fn byte_formatting_uses_binary_steps() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(10240), "10.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024u64.pow(4)), "3.00 TB");
        assert_eq!(format_bytes(2048 * 1024u64.pow(4)), "2048.0 TB");
    }

    #[test]
    fn allowed_ips_map_splits_on_first_whitespace() {
        let text = "keyA\t10.0.0.2/32 10.0.0.3/32\nkeyB\t(none)\n\nlonely\n";
        let map = parse_allowed_ips_map(text);
        assert_eq!(map.len(), 2);
        assert_eq!(map["keyA"], "10.0.0.2/32 10.0.0.3/32");
        assert_eq!(map["keyB"], "(none)");
    }

    #[test]
    fn allowed_ips_patch_only_touches_known_peers() {
        let mut status = InterfaceStatus {
            active: true,
            peers: vec![
                PeerStatus {
                    public_key: "keyA".into(),
                    allowed_ips: "10.0.0.2/32".into(),
                    ..PeerStatus::default()
                },
                PeerStatus {
                    public_key: "keyC".into(),
                    allowed_ips: "10.9.0.0/16".into(),
                    ..PeerStatus::default()
                },
            ],
            ..InterfaceStatus::default()
        };
        let map = parse_allowed_ips_map("keyA\t10.0.0.2/32 10.0.0.3/32\n");
        apply_allowed_ips(&mut status, &map);
        assert_eq!(status.peers[0].allowed_ips, "10.0.0.2/32 10.0.0.3/32");
        assert_eq!(status.peers[1].allowed_ips, "10.9.0.0/16");
    }
}
