use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub const MAX_NAME_LEN: usize = 32;

const INVALID_NAME: &str =
    "Tunnel name must be 1-32 chars: letters, numbers, '=', '+', '-', '.', or '_'.";

/// A tunnel identifier that passed [`TunnelName::normalize`].
///
/// Config paths and `wg`/`wg-quick` arguments are only ever built from this
/// type. Deserialization runs the same check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TunnelName(String);

impl TunnelName {
    pub fn normalize(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AppError::InvalidName("Tunnel name is required.".into()));
        }
        if !is_valid_name(trimmed) {
            return Err(AppError::InvalidName(INVALID_NAME.into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the tunnel's config: `<name>.conf`.
    #[must_use]
    pub fn config_file_name(&self) -> String {
        format!("{}.conf", self.0)
    }
}

#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    (1..=MAX_NAME_LEN).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'))
}

impl fmt::Display for TunnelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl AsRef<str> for TunnelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TunnelName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::normalize(s)
    }
}

impl TryFrom<String> for TunnelName {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::normalize(&value)
    }
}

impl From<TunnelName> for String {
    fn from(name: TunnelName) -> Self {
        name.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grammar_names_roundtrip_modulo_trim() {
        let longest = "x".repeat(MAX_NAME_LEN);
        for name in ["wg0", "home-office", "a", "A.b_c=d+e-f", longest.as_str()] {
            assert_eq!(TunnelName::normalize(name).expect("valid").as_str(), name);
        }
        assert_eq!(
            TunnelName::normalize("  vpn.work \n").expect("trimmed").as_str(),
            "vpn.work"
        );
    }

    #[test]
    fn rejects_names_outside_grammar() {
        let too_long = "x".repeat(MAX_NAME_LEN + 1);
        for bad in [
            "",
            "   ",
            "../etc/passwd",
            "bad/name",
            "with space",
            "semi;colon",
            "uni\u{e9}",
            too_long.as_str(),
        ] {
            let err = TunnelName::normalize(bad).expect_err(bad);
            assert!(matches!(err, AppError::InvalidName(_)), "{bad:?}");
        }
    }

    #[test]
    fn deserialization_runs_validator() {
        let ok: TunnelName = serde_json::from_str("\"wg0\"").expect("valid json name");
        assert_eq!(ok.config_file_name(), "wg0.conf");
        assert!(serde_json::from_str::<TunnelName>("\"../x\"").is_err());
    }

    #[test]
    fn display_honours_width_for_table_columns() {
        let name = TunnelName::normalize("wg0").expect("valid");
        assert_eq!(format!("{:<6}|", name), "wg0   |");
        assert_eq!(serde_json::to_string(&name).expect("json"), "\"wg0\"");
    }
}
