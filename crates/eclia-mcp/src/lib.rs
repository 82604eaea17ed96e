//! eclia-mcp — MCP stdio client for the exec tool host (§4.4).

pub mod client;
pub mod protocol;

pub use client::McpStdioClient;
