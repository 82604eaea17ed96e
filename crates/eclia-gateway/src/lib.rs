//! HTTP gateway: session CRUD, streaming chat (SSE), artifact serving, and
//! approval decisions over the local/LAN API (spec §6).

pub mod artifacts;
pub mod auth;
pub mod server;

pub use auth::ResolvedAuth;
pub use server::{start_gateway, ExtendedConfig};
