// wgpanel library crate
//
// The binary in main.rs is a thin front end over these modules; the
// integration tests drive them directly.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod tunnel_name;

pub mod wireguard;

// Line protocol, the elevated helper and the broker that supervises it
pub mod privileged;
pub mod privileged_api;
pub mod privileged_client;

pub mod tunnels;
