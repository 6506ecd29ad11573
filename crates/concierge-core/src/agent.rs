//! Agent execution contract, middleware layers, and registry
//!
//! Domain agents live outside the core; the core only requires the
//! `AgentProtocol` contract. Cross-cutting concerns (logging, metrics) are
//! explicit layers implementing the same trait and delegating inward,
//! composed at construction time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{CompletionClient, CompletionConfig, PromptMessage};
use crate::hub::HubMessage;
use crate::types::{Domain, TaskStatus};

/// Input handed to an agent for one execution. When the agent runs through
/// a hub, `history` carries the messages currently visible to it and
/// `context` a snapshot of the shared key/value context.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub message: String,
    pub history: Vec<HubMessage>,
    pub context: HashMap<String, Value>,
}

impl AgentRequest {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// An agent's reply
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub raw_message: String,
    pub status: TaskStatus,
    /// Structured output; hubs may lift named keys into shared context
    pub data: HashMap<String, Value>,
}

impl AgentReply {
    pub fn completed(raw_message: impl Into<String>) -> Self {
        Self {
            raw_message: raw_message.into(),
            status: TaskStatus::Completed,
            data: HashMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// The contract every domain agent implements. Adapters wrap anything that
/// does not implement it natively.
#[async_trait]
pub trait AgentProtocol: Send + Sync {
    /// Stable identifier of this agent instance
    fn agent_id(&self) -> &str;
    /// Agent type, used for policy lookups and participant records
    fn agent_type(&self) -> &str;
    /// Execute one request. The only suspension point besides the
    /// completion call itself; callers apply timeouts here.
    async fn execute(&self, request: AgentRequest) -> Result<AgentReply>;
}

/// Logging layer: delegates to the inner agent and traces every call
pub struct LoggingAgent {
    inner: Arc<dyn AgentProtocol>,
}

impl LoggingAgent {
    pub fn new(inner: Arc<dyn AgentProtocol>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AgentProtocol for LoggingAgent {
    fn agent_id(&self) -> &str {
        self.inner.agent_id()
    }

    fn agent_type(&self) -> &str {
        self.inner.agent_type()
    }

    async fn execute(&self, request: AgentRequest) -> Result<AgentReply> {
        let started = Instant::now();
        info!(
            "Agent '{}' executing ({} chars, {} history messages)",
            self.inner.agent_id(),
            request.message.len(),
            request.history.len()
        );
        let result = self.inner.execute(request).await;
        let elapsed_ms = started.elapsed().as_millis();
        match &result {
            Ok(reply) => info!(
                "Agent '{}' finished with status {} in {}ms",
                self.inner.agent_id(),
                reply.status,
                elapsed_ms
            ),
            Err(e) => warn!(
                "Agent '{}' failed after {}ms: {}",
                self.inner.agent_id(),
                elapsed_ms,
                e
            ),
        }
        result
    }
}

/// Point-in-time counters collected by [`MetricsAgent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

/// Metrics layer: counts calls, failures, and cumulative execution time
pub struct MetricsAgent {
    inner: Arc<dyn AgentProtocol>,
    calls: AtomicU64,
    failures: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl MetricsAgent {
    pub fn new(inner: Arc<dyn AgentProtocol>) -> Self {
        Self {
            inner,
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> AgentMetrics {
        AgentMetrics {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl AgentProtocol for MetricsAgent {
    fn agent_id(&self) -> &str {
        self.inner.agent_id()
    }

    fn agent_type(&self) -> &str {
        self.inner.agent_type()
    }

    async fn execute(&self, request: AgentRequest) -> Result<AgentReply> {
        let started = Instant::now();
        self.calls.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.execute(request).await;
        self.total_duration_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// Explicit registration table mapping domains to agents, built once at
/// startup and passed by reference. Registering twice for the same domain
/// is a configuration error, not a silent overwrite.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<Domain, Arc<dyn AgentProtocol>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the agent responsible for a domain
    pub fn register(&mut self, domain: Domain, agent: Arc<dyn AgentProtocol>) -> Result<()> {
        if self.agents.contains_key(&domain) {
            bail!("an agent is already registered for domain '{domain}'");
        }
        info!("Registered agent '{}' for domain {}", agent.agent_id(), domain);
        self.agents.insert(domain, agent);
        Ok(())
    }

    pub fn get(&self, domain: Domain) -> Option<Arc<dyn AgentProtocol>> {
        self.agents.get(&domain).cloned()
    }

    /// Look up an agent for a domain, falling back to the general agent
    pub fn resolve(&self, domain: Domain) -> Option<Arc<dyn AgentProtocol>> {
        self.get(domain).or_else(|| {
            debug!("No agent for domain {}, falling back to general", domain);
            self.get(Domain::General)
        })
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Domains with a registered agent, in taxonomy order
    pub fn domains(&self) -> Vec<Domain> {
        Domain::ALL
            .into_iter()
            .filter(|d| self.agents.contains_key(d))
            .collect()
    }
}

/// Generalist agent backed by a completion call. The default executor for
/// domains without a dedicated agent.
pub struct CompletionAgent {
    id: String,
    agent_type: String,
    client: Arc<dyn CompletionClient>,
    config: CompletionConfig,
}

impl CompletionAgent {
    pub fn new(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        client: Arc<dyn CompletionClient>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            client,
            config: CompletionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CompletionConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl AgentProtocol for CompletionAgent {
    fn agent_id(&self) -> &str {
        &self.id
    }

    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    async fn execute(&self, request: AgentRequest) -> Result<AgentReply> {
        let mut system = String::from(
            "You are a focused assistant working on a specific task. \
             Respond with your result directly. Be concise.",
        );
        if !request.context.is_empty() {
            system.push_str("\n\nShared context:\n");
            for (key, value) in &request.context {
                system.push_str(&format!("- {}: {}\n", key, value));
            }
        }

        let mut messages = vec![PromptMessage::system(system)];
        for entry in &request.history {
            let role = match entry.role {
                crate::hub::HubRole::User => "user",
                crate::hub::HubRole::System => "system",
                crate::hub::HubRole::Agent => "assistant",
            };
            messages.push(PromptMessage {
                role: role.to_string(),
                content: entry.content.clone(),
            });
        }
        messages.push(PromptMessage::user(&request.message));

        let completion = self.client.complete(&messages, &self.config).await?;
        Ok(AgentReply::completed(completion.content))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;

    /// Scripted agent used across the crate's test modules
    pub(crate) struct ScriptedAgent {
        pub id: String,
        pub kind: String,
        pub reply: String,
        pub fail: bool,
    }

    impl ScriptedAgent {
        pub fn new(id: &str, reply: &str) -> Self {
            Self {
                id: id.to_string(),
                kind: "scripted".to_string(),
                reply: reply.to_string(),
                fail: false,
            }
        }

        pub fn failing(id: &str) -> Self {
            Self {
                id: id.to_string(),
                kind: "scripted".to_string(),
                reply: String::new(),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl AgentProtocol for ScriptedAgent {
        fn agent_id(&self) -> &str {
            &self.id
        }

        fn agent_type(&self) -> &str {
            &self.kind
        }

        async fn execute(&self, request: AgentRequest) -> Result<AgentReply> {
            if self.fail {
                return Err(anyhow!("agent '{}' is scripted to fail", self.id));
            }
            Ok(AgentReply::completed(format!("{}: {}", self.reply, request.message)))
        }
    }

    #[tokio::test]
    async fn test_logging_layer_delegates() {
        let inner: Arc<dyn AgentProtocol> = Arc::new(ScriptedAgent::new("echo", "ok"));
        let layered = LoggingAgent::new(inner);

        assert_eq!(layered.agent_id(), "echo");
        assert_eq!(layered.agent_type(), "scripted");
        let reply = layered
            .execute(AgentRequest::from_message("ping"))
            .await
            .unwrap();
        assert_eq!(reply.raw_message, "ok: ping");
    }

    #[tokio::test]
    async fn test_metrics_layer_counts() {
        let ok: Arc<dyn AgentProtocol> = Arc::new(ScriptedAgent::new("a", "done"));
        let metrics = MetricsAgent::new(ok);

        metrics.execute(AgentRequest::from_message("1")).await.unwrap();
        metrics.execute(AgentRequest::from_message("2")).await.unwrap();

        let snapshot = metrics.metrics();
        assert_eq!(snapshot.calls, 2);
        assert_eq!(snapshot.failures, 0);
    }

    #[tokio::test]
    async fn test_metrics_layer_counts_failures() {
        let bad: Arc<dyn AgentProtocol> = Arc::new(ScriptedAgent::failing("b"));
        let metrics = MetricsAgent::new(bad);

        assert!(metrics.execute(AgentRequest::from_message("x")).await.is_err());
        let snapshot = metrics.metrics();
        assert_eq!(snapshot.calls, 1);
        assert_eq!(snapshot.failures, 1);
    }

    #[tokio::test]
    async fn test_layers_compose() {
        // metrics(logging(agent)) — composed explicitly at construction
        let inner: Arc<dyn AgentProtocol> = Arc::new(ScriptedAgent::new("c", "done"));
        let logged: Arc<dyn AgentProtocol> = Arc::new(LoggingAgent::new(inner));
        let metrics = MetricsAgent::new(logged);

        let reply = metrics.execute(AgentRequest::from_message("go")).await.unwrap();
        assert_eq!(reply.status, TaskStatus::Completed);
        assert_eq!(metrics.metrics().calls, 1);
    }

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Domain::Travel, Arc::new(ScriptedAgent::new("trips", "ok")))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get(Domain::Travel).is_some());
        assert!(registry.get(Domain::Lifestyle).is_none());
        assert_eq!(registry.domains(), vec![Domain::Travel]);
    }

    #[test]
    fn test_registry_duplicate_is_configuration_error() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Domain::Travel, Arc::new(ScriptedAgent::new("a", "ok")))
            .unwrap();
        let err = registry
            .register(Domain::Travel, Arc::new(ScriptedAgent::new("b", "ok")))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        // the original registration is untouched
        assert_eq!(registry.get(Domain::Travel).unwrap().agent_id(), "a");
    }

    #[test]
    fn test_registry_resolve_falls_back_to_general() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Domain::General, Arc::new(ScriptedAgent::new("gen", "ok")))
            .unwrap();

        let resolved = registry.resolve(Domain::Travel).unwrap();
        assert_eq!(resolved.agent_id(), "gen");
    }

    #[test]
    fn test_registry_resolve_none_without_general() {
        let registry = AgentRegistry::new();
        assert!(registry.resolve(Domain::Travel).is_none());
    }

    #[tokio::test]
    async fn test_completion_agent_executes() {
        use crate::api::Completion;

        struct Canned;

        #[async_trait]
        impl CompletionClient for Canned {
            async fn complete(
                &self,
                messages: &[PromptMessage],
                _config: &CompletionConfig,
            ) -> Result<Completion> {
                assert_eq!(messages.first().unwrap().role, "system");
                assert_eq!(messages.last().unwrap().content, "book a table");
                Ok(Completion {
                    content: "booked".to_string(),
                })
            }
        }

        let agent = CompletionAgent::new("generalist", "general", Arc::new(Canned));
        let reply = agent
            .execute(AgentRequest::from_message("book a table"))
            .await
            .unwrap();
        assert_eq!(reply.raw_message, "booked");
        assert_eq!(reply.status, TaskStatus::Completed);
    }
}
