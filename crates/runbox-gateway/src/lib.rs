//! runbox-gateway — HTTP control surface for runbox
//!
//! Exposes the control plane as JSON tool endpoints for agents and scripts.

pub mod auth;
pub mod error;
pub mod protocol;
pub mod server;

pub use server::{GatewayServer, create_router};
