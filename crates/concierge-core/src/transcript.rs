//! Transcript repair
//!
//! Normalizes a chat history so every tool call has exactly one matching
//! tool result before the history is handed to a completion call. Providers
//! reject transcripts with dangling calls, duplicated results, or orphaned
//! results; interrupted runs produce all three.
//!
//! Two sequential phases:
//! - tool-call input validation drops calls whose arguments are missing or
//!   empty (and assistant messages left with no calls at all);
//! - tool/result pairing re-seats each call's first result directly after
//!   its assistant message, synthesizes placeholders for missing results,
//!   and drops duplicates and orphans.
//!
//! Repair is pure and idempotent, and returns the original slice untouched
//! (borrowed) when nothing needed fixing.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Content of a synthesized placeholder for a tool call that never got a
/// recorded result
pub const SYNTHETIC_TOOL_RESULT: &str = "[no output was recorded for this tool call]";

/// Role of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Why an assistant turn ended abnormally. Messages carrying one of these
/// are exempt from pairing repair; their calls never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Error,
    Aborted,
}

/// A model-issued request to invoke a named function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments; absent or empty means the call is unusable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: Some(arguments.into()),
        }
    }
}

/// One transcript element in the canonical chat-history wire format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    /// Assistant message carrying tool calls
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::plain(ChatRole::Assistant, content)
        }
    }

    /// Tool result for a given call id
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(ChatRole::Tool, content)
        }
    }

    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            stop_reason: None,
        }
    }

    fn is_exempt_assistant(&self) -> bool {
        self.role == ChatRole::Assistant
            && matches!(self.stop_reason, Some(StopReason::Error) | Some(StopReason::Aborted))
    }

    /// Tool calls subject to repair: present, non-empty, on a non-exempt
    /// assistant message
    fn live_tool_calls(&self) -> Option<&[ToolCall]> {
        if self.role != ChatRole::Assistant || self.is_exempt_assistant() {
            return None;
        }
        match &self.tool_calls {
            Some(calls) if !calls.is_empty() => Some(calls),
            _ => None,
        }
    }
}

/// Aggregate counts of what repair changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairStats {
    /// Tool calls dropped for missing/empty arguments
    pub calls_dropped: usize,
    /// Assistant messages dropped because all of their calls were dropped
    pub messages_dropped: usize,
    /// Results found elsewhere in the transcript and re-seated
    pub results_moved: usize,
    /// Placeholders synthesized for calls with no result anywhere
    pub results_synthesized: usize,
    /// Surplus results for an already-answered call id
    pub duplicates_dropped: usize,
    /// Results no live call claims
    pub orphans_dropped: usize,
}

impl RepairStats {
    /// True when repair changed nothing
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }

    fn merge(&mut self, other: &RepairStats) {
        self.calls_dropped += other.calls_dropped;
        self.messages_dropped += other.messages_dropped;
        self.results_moved += other.results_moved;
        self.results_synthesized += other.results_synthesized;
        self.duplicates_dropped += other.duplicates_dropped;
        self.orphans_dropped += other.orphans_dropped;
    }
}

fn call_is_invalid(call: &ToolCall) -> bool {
    match &call.arguments {
        None => true,
        Some(args) => args.trim().is_empty(),
    }
}

/// Phase one: drop tool calls with missing or empty arguments. An assistant
/// message whose calls are all dropped is dropped entirely, since its
/// content without the calls is meaningless for this message shape.
pub fn validate_tool_calls(messages: &[ChatMessage]) -> (Cow<'_, [ChatMessage]>, RepairStats) {
    let mut stats = RepairStats::default();

    let needs_repair = messages.iter().any(|m| {
        m.role == ChatRole::Assistant
            && m.tool_calls
                .as_ref()
                .is_some_and(|calls| calls.iter().any(call_is_invalid))
    });
    if !needs_repair {
        return (Cow::Borrowed(messages), stats);
    }

    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        let Some(calls) = msg.tool_calls.as_ref().filter(|_| msg.role == ChatRole::Assistant)
        else {
            out.push(msg.clone());
            continue;
        };

        let kept: Vec<ToolCall> = calls.iter().filter(|c| !call_is_invalid(c)).cloned().collect();
        let dropped = calls.len() - kept.len();
        if dropped == 0 {
            out.push(msg.clone());
            continue;
        }

        stats.calls_dropped += dropped;
        if kept.is_empty() {
            debug!("Dropping assistant message whose tool calls were all invalid");
            stats.messages_dropped += 1;
            continue;
        }

        let mut repaired = msg.clone();
        repaired.tool_calls = Some(kept);
        out.push(repaired);
    }

    (Cow::Owned(out), stats)
}

/// Phase two: re-seat each live tool call's first result directly after its
/// assistant message, synthesize placeholders for missing results, and drop
/// duplicate and orphaned results.
pub fn pair_tool_results(messages: &[ChatMessage]) -> (Cow<'_, [ChatMessage]>, RepairStats) {
    let mut stats = RepairStats::default();

    // Ids claimed by live (non-exempt) assistant tool calls
    let mut expected: HashSet<&str> = HashSet::new();
    for msg in messages {
        if let Some(calls) = msg.live_tool_calls() {
            for call in calls {
                expected.insert(call.id.as_str());
            }
        }
    }

    // Pool of tool results by call id, in transcript order. Results with no
    // call id at all are orphans by definition.
    let mut pool: HashMap<&str, VecDeque<usize>> = HashMap::new();
    for (index, msg) in messages.iter().enumerate() {
        if msg.role != ChatRole::Tool {
            continue;
        }
        match &msg.tool_call_id {
            Some(id) => pool.entry(id.as_str()).or_default().push_back(index),
            None => stats.orphans_dropped += 1,
        }
    }

    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for (index, msg) in messages.iter().enumerate() {
        if msg.role == ChatRole::Tool {
            // Emitted adjacent to the claiming call, or dropped below
            continue;
        }

        let Some(calls) = msg.live_tool_calls() else {
            out.push(msg.clone());
            continue;
        };

        out.push(msg.clone());
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut emitted = 0usize;
        for call in calls {
            // Duplicate ids within one message coalesce to the first occurrence
            if !seen_ids.insert(call.id.as_str()) {
                continue;
            }
            emitted += 1;

            match pool.get_mut(call.id.as_str()).and_then(|q| q.pop_front()) {
                Some(original_index) => {
                    // Position heuristic: the result belongs right after the
                    // assistant message, offset by how many results this
                    // message has already consumed. Counts only; interleaved
                    // duplicates may blur exact positions.
                    if original_index != index + emitted {
                        stats.results_moved += 1;
                    }
                    out.push(messages[original_index].clone());
                }
                None => {
                    stats.results_synthesized += 1;
                    out.push(ChatMessage::tool(call.id.clone(), SYNTHETIC_TOOL_RESULT));
                }
            }
        }
    }

    // Whatever is left in the pool was never consumed: surplus results for
    // answered ids are duplicates, the rest are orphans.
    for (id, leftovers) in &pool {
        if leftovers.is_empty() {
            continue;
        }
        if expected.contains(id) {
            stats.duplicates_dropped += leftovers.len();
        } else {
            stats.orphans_dropped += leftovers.len();
        }
    }

    if stats.is_clean() {
        (Cow::Borrowed(messages), stats)
    } else {
        (Cow::Owned(out), stats)
    }
}

/// Run both repair phases and log what changed. The single entry point
/// callers use before every completion request.
///
/// Returns the original slice (borrowed) when no change was needed, so
/// callers can cheaply detect an untouched transcript.
pub fn repair_transcript(messages: &[ChatMessage]) -> (Cow<'_, [ChatMessage]>, RepairStats) {
    let (validated, mut stats) = validate_tool_calls(messages);
    let (paired, pairing_stats) = pair_tool_results(validated.as_ref());
    stats.merge(&pairing_stats);

    if stats.is_clean() {
        debug!("Transcript of {} messages needed no repair", messages.len());
        return (Cow::Borrowed(messages), stats);
    }

    info!(
        "Repaired transcript: {} calls dropped, {} messages dropped, {} results moved, \
         {} synthesized, {} duplicates dropped, {} orphans dropped",
        stats.calls_dropped,
        stats.messages_dropped,
        stats.results_moved,
        stats.results_synthesized,
        stats.duplicates_dropped,
        stats.orphans_dropped,
    );
    (Cow::Owned(paired.into_owned()), stats)
}
