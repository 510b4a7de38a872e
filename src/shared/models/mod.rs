pub mod chart;
pub mod conversation;
pub mod tool;

pub use chart::{ChartCommand, ChartCommandKind, ChartOptions, ChartPayload, ChartType};
pub use conversation::{ConversationRequest, FinalResponse, Termination, TurnRecord};
pub use tool::{ErrorKind, ToolCallRequest, ToolInvocation, ToolResult, FAILURE_MARKER};
