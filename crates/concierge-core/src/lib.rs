//! concierge-core - orchestration layer of the concierge assistant
//!
//! This crate provides:
//! - Intent analysis that classifies a message and decomposes multi-goal
//!   requests into dependency-linked sub-tasks
//! - A topological leveler that orders sub-tasks into parallel-executable
//!   levels and detects dependency cycles
//! - Transcript repair that normalizes chat histories before every
//!   completion call
//! - A layered (global/agent/tenant) tool policy filter
//! - A message hub that shares a conversation and key/value context across
//!   agents, with sequential and parallel multi-agent execution
//!
//! Domain agents, credential lifecycles, and persistence are external
//! collaborators reached through the contracts in [`agent`] and [`api`].

pub mod agent;
pub mod api;
pub mod executor;
pub mod hub;
pub mod intent;
pub mod policy;
pub mod schedule;
pub mod transcript;
pub mod types;

// Re-export main types for convenience
pub use agent::{
    AgentMetrics, AgentProtocol, AgentRegistry, AgentReply, AgentRequest, CompletionAgent,
    LoggingAgent, MetricsAgent,
};
pub use api::{Completion, CompletionClient, CompletionConfig, HttpCompletionClient, PromptMessage};
pub use executor::{ExecutionReport, ExecutorConfig, TaskExecutor};
pub use hub::{
    AgentOutcome, Broadcast, ExecuteOptions, HubConfig, HubError, HubExecutionResult, HubMessage,
    HubMessageType, HubObserver, HubRole, MessageHub, MessageQuery, ParticipantInfo, SharedContext,
    VisibilityMode,
};
pub use intent::{IntentAnalyzer, IntentConfig};
pub use policy::{AgentToolPolicy, ToolPolicyFilter, tool_name};
pub use schedule::{ScheduleError, level};
pub use transcript::{
    ChatMessage, ChatRole, RepairStats, SYNTHETIC_TOOL_RESULT, StopReason, ToolCall,
    pair_tool_results, repair_transcript, validate_tool_calls,
};
pub use types::{
    Domain, ExecutionStatus, IntentAnalysis, IntentType, SubTask, SubTaskResult, TaskStatus,
};
