pub mod handlers;
pub mod service;

pub use service::{AppInfo, TunnelRecord, TunnelService};
