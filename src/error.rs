use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidName(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    UnsupportedCommand(String),

    #[error("privilege tool missing: {0}")]
    PrivilegeToolMissing(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("privileged helper terminated")]
    HelperTerminated,

    #[error("{0}")]
    Helper(String),

    #[error("{0}")]
    Tool(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl AppError {
    /// Stable error class carried in the `code` field of helper error frames.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "InvalidName",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::UnsupportedCommand(_) => "UnsupportedCommand",
            Self::Tool(_) => "Tool",
            Self::Io(_) => "Io",
            _ => "Other",
        }
    }

    /// Rebuild a typed error from a helper error frame.
    #[must_use]
    pub fn from_wire(code: Option<&str>, message: String) -> Self {
        match code {
            Some("InvalidName") => Self::InvalidName(message),
            Some("NotFound") => Self::NotFound(message),
            Some("AlreadyExists") => Self::AlreadyExists(message),
            Some("UnsupportedCommand") => Self::UnsupportedCommand(message),
            Some("Tool") => Self::Tool(message),
            _ => Self::Helper(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
