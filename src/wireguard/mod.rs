pub mod config;
pub mod dump;
pub mod exec;
pub mod wg_quick;
pub mod wg_show;

pub use exec::ToolPaths;
