//! Turn orchestration: resolves a route key to an upstream provider, drives
//! the stream-then-tool loop (spec §4.7), and persists transcript state
//! through a session store shared with the rest of the gateway.

pub mod events;
pub mod fallback;
pub mod orchestrator;
pub mod route;
pub mod system;

pub use events::{ApprovalInfo, ChatEvent, ChatRequest, ToolCallSummary};
pub use orchestrator::ChatOrchestrator;
pub use route::{RouteResolver, UpstreamSelection};
pub use system::{build_system_instruction, StaticSystemPart, SystemInstructionSource};
