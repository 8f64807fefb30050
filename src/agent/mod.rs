pub mod cli;
pub mod events;
pub mod mock;
pub mod session;

pub use events::{AssistantMessage, ContextUsage, EngineEvent, StopReason};
pub use session::{AgentSession, SessionStore};
