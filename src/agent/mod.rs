//! The agent process: context, run loop, rotation trigger and state directory.

pub mod context;
pub mod orchestrator;
pub mod state_dir;
pub mod telemetry;
pub mod trigger;

pub use context::AgentContext;
pub use orchestrator::{build_source, transport_settings, Agent};
