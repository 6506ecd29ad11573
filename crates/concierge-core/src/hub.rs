//! Shared-context message hub
//!
//! Lets several agents share one conversation and a key/value context with
//! configurable per-participant visibility, and drives sequential or
//! parallel multi-agent execution over that shared state.
//!
//! A hub is `Open` until `close()` is called, then terminally `Closed`:
//! joining or broadcasting on a closed hub is a sequencing mistake and
//! fails with [`HubError::Closed`]. Everything else degrades gracefully.
//! A failing agent is captured in the execution result, and a failing
//! observer is logged and ignored.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentProtocol, AgentReply, AgentRequest};
use crate::types::{ExecutionStatus, TaskStatus};

/// Caller-facing hub misuse: operating on a closed hub
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub '{hub_id}' is closed")]
    Closed { hub_id: String },
}

/// Role of a hub message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubRole {
    User,
    Agent,
    System,
}

impl std::fmt::Display for HubRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::System => write!(f, "system"),
        }
    }
}

/// What kind of payload a hub message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubMessageType {
    Text,
    Data,
    Action,
    Result,
}

/// One message in a hub's conversation, append-only once broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubMessage {
    pub id: String,
    pub role: HubRole,
    pub content: String,
    pub sender_id: String,
    pub sender_type: String,
    pub message_type: HubMessageType,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Outbound message handed to [`MessageHub::broadcast`]
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub content: String,
    pub sender_id: String,
    pub role: HubRole,
    pub message_type: HubMessageType,
    pub data: HashMap<String, Value>,
    pub reply_to: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl Broadcast {
    pub fn new(
        content: impl Into<String>,
        sender_id: impl Into<String>,
        role: HubRole,
        message_type: HubMessageType,
    ) -> Self {
        Self {
            content: content.into(),
            sender_id: sender_id.into(),
            role,
            message_type,
            data: HashMap::new(),
            reply_to: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_data(mut self, data: HashMap<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

/// A participant's record. Deactivated on removal, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub agent_id: String,
    pub agent_type: String,
    /// Messages already in the hub when this participant joined
    pub joined_at_message_count: usize,
    /// Position in the join sequence, used by sequential visibility
    pub join_order: usize,
    pub is_active: bool,
    pub last_seen_message_id: Option<String>,
    pub messages_sent: usize,
    pub can_see_all: bool,
    /// Roles visible under selective visibility
    pub visible_roles: HashSet<HubRole>,
}

/// Shared key/value context, last-writer-wins, no versioning
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    pub values: HashMap<String, Value>,
    pub last_updated: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

impl SharedContext {
    fn set(&mut self, key: impl Into<String>, value: Value, updated_by: &str) {
        self.values.insert(key.into(), value);
        self.last_updated = Some(Utc::now());
        self.updated_by = Some(updated_by.to_string());
    }
}

/// Which subset of hub messages a participant may read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityMode {
    /// Full history for `can_see_all` participants, join-onward otherwise
    #[default]
    All,
    /// User/system messages plus agent messages from earlier joiners
    Sequential,
    /// Only messages whose role is in the participant's visible set
    Selective,
}

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// FIFO cap on retained messages; the single oldest message is evicted
    /// before each append once the cap is reached
    pub max_messages: usize,
    pub visibility_mode: VisibilityMode,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_messages: 500,
            visibility_mode: VisibilityMode::All,
        }
    }
}

/// Message read filter. Visibility is applied first, then `since`/`role`,
/// then the most recent `limit` messages are kept.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub participant_id: Option<String>,
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub role: Option<HubRole>,
}

/// Per-invocation execution options for [`MessageHub::execute`]
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Broadcast the input as a user message before invoking the agent
    pub broadcast_input: bool,
    /// Broadcast the agent's reply as a result message
    pub broadcast_output: bool,
    /// Keys to lift from the reply's data into shared context
    pub update_context_keys: Option<Vec<String>>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            broadcast_input: true,
            broadcast_output: true,
            update_context_keys: None,
        }
    }
}

/// Outcome of one agent within a multi-agent run
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub agent_id: String,
    pub response: Option<String>,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Aggregate result of a sequential or parallel hub run
#[derive(Debug, Clone, PartialEq)]
pub struct HubExecutionResult {
    pub hub_id: String,
    pub status: ExecutionStatus,
    pub outcomes: Vec<AgentOutcome>,
    pub failed_agents: usize,
}

/// Observer notified after every broadcast. Failures are logged and
/// swallowed, so a single bad observer cannot break the hub. Each
/// notification runs as its own task and never delays the ordering of
/// subsequent broadcasts.
#[async_trait]
pub trait HubObserver: Send + Sync {
    async fn on_message(&self, message: HubMessage) -> Result<()>;
}

struct HubState {
    messages: VecDeque<HubMessage>,
    /// Lifetime append count; `total_appended - messages.len()` is the
    /// absolute index of the oldest retained message after evictions
    total_appended: usize,
    participants: HashMap<String, ParticipantInfo>,
    join_counter: usize,
    context: SharedContext,
    is_active: bool,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

struct HubShared {
    hub_id: String,
    config: HubConfig,
    state: RwLock<HubState>,
    observers: std::sync::RwLock<Vec<Arc<dyn HubObserver>>>,
}

/// The shared-context mediator. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MessageHub {
    inner: Arc<HubShared>,
}

impl MessageHub {
    pub fn new(config: HubConfig) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), config)
    }

    pub fn with_id(hub_id: impl Into<String>, config: HubConfig) -> Self {
        let hub_id = hub_id.into();
        info!(
            "Opened hub '{}' (visibility: {:?}, cap: {})",
            hub_id, config.visibility_mode, config.max_messages
        );
        Self {
            inner: Arc::new(HubShared {
                hub_id,
                config,
                state: RwLock::new(HubState {
                    messages: VecDeque::new(),
                    total_appended: 0,
                    participants: HashMap::new(),
                    join_counter: 0,
                    context: SharedContext::default(),
                    is_active: true,
                    created_at: Utc::now(),
                    closed_at: None,
                }),
                observers: std::sync::RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn hub_id(&self) -> &str {
        &self.inner.hub_id
    }

    pub async fn is_active(&self) -> bool {
        self.inner.state.read().await.is_active
    }

    pub async fn created_at(&self) -> DateTime<Utc> {
        self.inner.state.read().await.created_at
    }

    pub async fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().await.closed_at
    }

    pub async fn message_count(&self) -> usize {
        self.inner.state.read().await.messages.len()
    }

    pub async fn participant(&self, agent_id: &str) -> Option<ParticipantInfo> {
        self.inner.state.read().await.participants.get(agent_id).cloned()
    }

    pub async fn participant_count(&self) -> usize {
        self.inner.state.read().await.participants.len()
    }

    /// Register an observer notified after every broadcast
    pub fn subscribe(&self, observer: Arc<dyn HubObserver>) {
        self.inner
            .observers
            .write()
            .expect("observer lock poisoned")
            .push(observer);
    }

    /// Join a participant. Fails on a closed hub. Rejoining an existing
    /// participant reactivates its retained record.
    pub async fn add_participant(
        &self,
        agent_id: &str,
        agent_type: &str,
        can_see_all: bool,
        visible_roles: Option<HashSet<HubRole>>,
    ) -> Result<ParticipantInfo, HubError> {
        let mut state = self.inner.state.write().await;
        if !state.is_active {
            return Err(HubError::Closed {
                hub_id: self.inner.hub_id.clone(),
            });
        }

        if let Some(existing) = state.participants.get_mut(agent_id) {
            existing.is_active = true;
            debug!("Participant '{}' rejoined hub '{}'", agent_id, self.inner.hub_id);
            return Ok(existing.clone());
        }

        let info = ParticipantInfo {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            joined_at_message_count: state.messages.len(),
            join_order: state.join_counter,
            is_active: true,
            last_seen_message_id: None,
            messages_sent: 0,
            can_see_all,
            visible_roles: visible_roles.unwrap_or_else(|| {
                [HubRole::User, HubRole::Agent, HubRole::System].into_iter().collect()
            }),
        };
        state.join_counter += 1;
        state.participants.insert(agent_id.to_string(), info.clone());
        info!(
            "Participant '{}' ({}) joined hub '{}' at message {}",
            agent_id, agent_type, self.inner.hub_id, info.joined_at_message_count
        );
        Ok(info)
    }

    /// Deactivate a participant; its record is retained
    pub async fn remove_participant(&self, agent_id: &str) -> bool {
        let mut state = self.inner.state.write().await;
        match state.participants.get_mut(agent_id) {
            Some(info) => {
                info.is_active = false;
                true
            }
            None => false,
        }
    }

    /// Append a message to the conversation. The append position (and any
    /// eviction) is decided atomically under the write lock, so ordering is
    /// total even under concurrent broadcasts.
    pub async fn broadcast(&self, outbound: Broadcast) -> Result<HubMessage, HubError> {
        let message = {
            let mut state = self.inner.state.write().await;
            if !state.is_active {
                return Err(HubError::Closed {
                    hub_id: self.inner.hub_id.clone(),
                });
            }

            if state.messages.len() >= self.inner.config.max_messages {
                if let Some(evicted) = state.messages.pop_front() {
                    debug!(
                        "Hub '{}' at capacity, evicted oldest message {}",
                        self.inner.hub_id, evicted.id
                    );
                }
            }

            let sender_type = match state.participants.get(&outbound.sender_id) {
                Some(participant) => participant.agent_type.clone(),
                None => match outbound.role {
                    HubRole::User => "user".to_string(),
                    HubRole::System => "system".to_string(),
                    HubRole::Agent => "external".to_string(),
                },
            };

            let message = HubMessage {
                id: Uuid::new_v4().to_string(),
                role: outbound.role,
                content: outbound.content,
                sender_id: outbound.sender_id,
                sender_type,
                message_type: outbound.message_type,
                data: outbound.data,
                timestamp: Utc::now(),
                reply_to: outbound.reply_to,
                metadata: outbound.metadata,
            };

            state.messages.push_back(message.clone());
            state.total_appended += 1;
            if let Some(sender) = state.participants.get_mut(&message.sender_id) {
                sender.messages_sent += 1;
            }
            message
        };

        self.notify_observers(&message);
        Ok(message)
    }

    fn notify_observers(&self, message: &HubMessage) {
        let observers = self
            .inner
            .observers
            .read()
            .expect("observer lock poisoned")
            .clone();
        for observer in observers {
            let message = message.clone();
            let hub_id = self.inner.hub_id.clone();
            tokio::spawn(async move {
                if let Err(e) = observer.on_message(message).await {
                    warn!("Hub '{}' observer failed: {:#}", hub_id, e);
                }
            });
        }
    }

    /// Read messages through a participant's visibility, then apply
    /// `since`/`role` filters and keep the most recent `limit`.
    pub async fn get_messages(&self, query: &MessageQuery) -> Vec<HubMessage> {
        let state = self.inner.state.read().await;
        let base_index = state.total_appended - state.messages.len();

        let viewer = match &query.participant_id {
            Some(id) => match state.participants.get(id) {
                Some(participant) => Some(participant),
                None => {
                    warn!(
                        "Unknown participant '{}' queried hub '{}'",
                        id, self.inner.hub_id
                    );
                    return Vec::new();
                }
            },
            None => None,
        };

        let mut visible: Vec<HubMessage> = state
            .messages
            .iter()
            .enumerate()
            .filter(|(position, message)| match viewer {
                None => true,
                Some(participant) => self.is_visible(
                    participant,
                    message,
                    base_index + position,
                    &state.participants,
                ),
            })
            .map(|(_, message)| message.clone())
            .collect();

        if let Some(since) = query.since {
            visible.retain(|m| m.timestamp > since);
        }
        if let Some(role) = query.role {
            visible.retain(|m| m.role == role);
        }
        if let Some(limit) = query.limit {
            if visible.len() > limit {
                visible.drain(..visible.len() - limit);
            }
        }
        visible
    }

    fn is_visible(
        &self,
        viewer: &ParticipantInfo,
        message: &HubMessage,
        absolute_index: usize,
        participants: &HashMap<String, ParticipantInfo>,
    ) -> bool {
        match self.inner.config.visibility_mode {
            VisibilityMode::All => {
                viewer.can_see_all || absolute_index >= viewer.joined_at_message_count
            }
            VisibilityMode::Sequential => match message.role {
                HubRole::User | HubRole::System => true,
                // Agent messages flow forward only: visible when the sender
                // joined strictly before the viewer
                HubRole::Agent => participants
                    .get(&message.sender_id)
                    .is_some_and(|sender| sender.join_order < viewer.join_order),
            },
            VisibilityMode::Selective => viewer.visible_roles.contains(&message.role),
        }
    }

    /// Set one shared-context key, attributed to `updated_by`
    pub async fn set_context(&self, key: impl Into<String>, value: Value, updated_by: &str) {
        let mut state = self.inner.state.write().await;
        state.context.set(key, value, updated_by);
    }

    pub async fn get_context(&self, key: &str) -> Option<Value> {
        self.inner.state.read().await.context.values.get(key).cloned()
    }

    pub async fn context_snapshot(&self) -> HashMap<String, Value> {
        self.inner.state.read().await.context.values.clone()
    }

    pub async fn context(&self) -> SharedContext {
        self.inner.state.read().await.context.clone()
    }

    /// Run one agent against the hub: auto-join, optional input broadcast,
    /// inject visible history and shared context, invoke, optionally lift
    /// named keys from the reply into shared context, optionally broadcast
    /// the reply, and advance the participant's last-seen pointer.
    pub async fn execute(
        &self,
        agent: &Arc<dyn AgentProtocol>,
        message: &str,
        options: &ExecuteOptions,
    ) -> Result<AgentReply> {
        self.ensure_participant(agent.as_ref()).await?;

        if options.broadcast_input {
            self.broadcast(Broadcast::new(
                message,
                "user",
                HubRole::User,
                HubMessageType::Text,
            ))
            .await?;
        }

        let history = self
            .get_messages(&MessageQuery {
                participant_id: Some(agent.agent_id().to_string()),
                ..Default::default()
            })
            .await;
        let context = self.context_snapshot().await;

        let request = AgentRequest {
            message: message.to_string(),
            history,
            context,
        };
        let reply = agent.execute(request).await?;

        if let Some(keys) = &options.update_context_keys {
            for key in keys {
                if let Some(value) = reply.data.get(key) {
                    self.set_context(key.clone(), value.clone(), agent.agent_id()).await;
                }
            }
        }

        if options.broadcast_output {
            self.broadcast(
                Broadcast::new(
                    reply.raw_message.clone(),
                    agent.agent_id(),
                    HubRole::Agent,
                    HubMessageType::Result,
                )
                .with_data(reply.data.clone()),
            )
            .await?;
        }

        self.touch_last_seen(agent.agent_id()).await;
        Ok(reply)
    }

    /// Run agents one after another, piping each reply's text into the next
    /// agent's input. A failing agent is captured and the chain continues.
    pub async fn execute_sequential(
        &self,
        agents: &[Arc<dyn AgentProtocol>],
        initial_message: &str,
    ) -> Result<HubExecutionResult, HubError> {
        self.check_open().await?;

        let mut outcomes: Vec<AgentOutcome> = Vec::with_capacity(agents.len());
        let mut current = initial_message.to_string();
        let mut failed = 0usize;

        for (index, agent) in agents.iter().enumerate() {
            let options = ExecuteOptions {
                broadcast_input: index == 0,
                broadcast_output: true,
                update_context_keys: None,
            };
            let started = Instant::now();
            match self.execute(agent, &current, &options).await {
                Ok(reply) => {
                    current = reply.raw_message.clone();
                    outcomes.push(AgentOutcome {
                        agent_id: agent.agent_id().to_string(),
                        response: Some(reply.raw_message),
                        status: TaskStatus::Completed,
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => {
                    warn!(
                        "Agent '{}' failed in sequential run, continuing: {:#}",
                        agent.agent_id(),
                        e
                    );
                    failed += 1;
                    outcomes.push(AgentOutcome {
                        agent_id: agent.agent_id().to_string(),
                        response: None,
                        status: TaskStatus::Error,
                        error: Some(format!("{e:#}")),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        Ok(HubExecutionResult {
            hub_id: self.inner.hub_id.clone(),
            status: ExecutionStatus::from_counts(agents.len() - failed, failed),
            outcomes,
            failed_agents: failed,
        })
    }

    /// Broadcast the input once, then run all agents concurrently against
    /// it. One agent's failure neither cancels nor delays the others.
    pub async fn execute_parallel(
        &self,
        agents: &[Arc<dyn AgentProtocol>],
        message: &str,
    ) -> Result<HubExecutionResult, HubError> {
        self.check_open().await?;

        // Join in list order so sequential-visibility precedence is stable
        for agent in agents {
            self.ensure_participant(agent.as_ref()).await?;
        }
        self.broadcast(Broadcast::new(
            message,
            "user",
            HubRole::User,
            HubMessageType::Text,
        ))
        .await?;

        let mut handles = Vec::with_capacity(agents.len());
        for agent in agents {
            let hub = self.clone();
            let agent = agent.clone();
            let message = message.to_string();
            handles.push(tokio::spawn(async move {
                let options = ExecuteOptions {
                    broadcast_input: false,
                    broadcast_output: true,
                    update_context_keys: None,
                };
                let started = Instant::now();
                let result = hub.execute(&agent, &message, &options).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                match result {
                    Ok(reply) => AgentOutcome {
                        agent_id: agent.agent_id().to_string(),
                        response: Some(reply.raw_message),
                        status: TaskStatus::Completed,
                        error: None,
                        duration_ms,
                    },
                    Err(e) => AgentOutcome {
                        agent_id: agent.agent_id().to_string(),
                        response: None,
                        status: TaskStatus::Error,
                        error: Some(format!("{e:#}")),
                        duration_ms,
                    },
                }
            }));
        }

        let mut outcomes: Vec<AgentOutcome> = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(AgentOutcome {
                    agent_id: "unknown".to_string(),
                    response: None,
                    status: TaskStatus::Error,
                    error: Some(format!("agent task panicked: {e}")),
                    duration_ms: 0,
                }),
            }
        }

        let failed = outcomes.iter().filter(|o| o.status == TaskStatus::Error).count();
        Ok(HubExecutionResult {
            hub_id: self.inner.hub_id.clone(),
            status: ExecutionStatus::from_counts(outcomes.len() - failed, failed),
            outcomes,
            failed_agents: failed,
        })
    }

    /// Close the hub: no further joins, broadcasts, or executions. All
    /// participants are marked inactive. Idempotent.
    pub async fn close(&self) {
        let mut state = self.inner.state.write().await;
        if !state.is_active {
            return;
        }
        state.is_active = false;
        state.closed_at = Some(Utc::now());
        for participant in state.participants.values_mut() {
            participant.is_active = false;
        }
        info!(
            "Closed hub '{}' ({} messages, {} participants)",
            self.inner.hub_id,
            state.messages.len(),
            state.participants.len()
        );
    }

    async fn check_open(&self) -> Result<(), HubError> {
        if self.inner.state.read().await.is_active {
            Ok(())
        } else {
            Err(HubError::Closed {
                hub_id: self.inner.hub_id.clone(),
            })
        }
    }

    async fn ensure_participant(&self, agent: &dyn AgentProtocol) -> Result<(), HubError> {
        {
            let state = self.inner.state.read().await;
            if !state.is_active {
                return Err(HubError::Closed {
                    hub_id: self.inner.hub_id.clone(),
                });
            }
            if state
                .participants
                .get(agent.agent_id())
                .is_some_and(|p| p.is_active)
            {
                return Ok(());
            }
        }
        self.add_participant(agent.agent_id(), agent.agent_type(), false, None)
            .await
            .map(|_| ())
    }

    async fn touch_last_seen(&self, agent_id: &str) {
        let mut state = self.inner.state.write().await;
        let newest = state.messages.back().map(|m| m.id.clone());
        if let Some(participant) = state.participants.get_mut(agent_id) {
            participant.last_seen_message_id = newest;
        }
    }
}
