//! Administrative command surface and conversation state

pub mod console;
pub mod session;

pub use console::{AdjustDirection, AdminConsole, AdminStats, FlowReply};
pub use session::{AdminSessions, FlowKind, FlowState, TaskDraft};
