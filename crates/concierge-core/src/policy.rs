//! Layered tool authorization filter
//!
//! Trims the tool list offered to a completion call through three layers of
//! allow/deny configuration: global, per-agent-type, per-tenant. Each layer
//! can only narrow the set, never widen it. A policy decision is not an
//! error; it is a deterministic filtering outcome, optionally explainable
//! for audit logging.
//!
//! Configuration is expected at setup/administration time, not per request;
//! reads run concurrently with occasional writes behind a `RwLock`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde_json::Value;
use tracing::{debug, info};

/// Per-agent-type override: an optional allow-list and a deny set
#[derive(Debug, Clone, Default)]
pub struct AgentToolPolicy {
    pub agent_type: String,
    /// When set, only listed tools are available to this agent type
    pub allow: Option<HashSet<String>>,
    pub deny: HashSet<String>,
}

impl AgentToolPolicy {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            ..Default::default()
        }
    }

    pub fn allow(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn deny(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.deny = names.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Default)]
struct PolicyState {
    global_deny: HashSet<String>,
    global_allow: Option<HashSet<String>>,
    agent_policies: HashMap<String, AgentToolPolicy>,
    tenant_deny: HashMap<String, HashSet<String>>,
}

/// Process-wide tool policy filter
#[derive(Debug, Default)]
pub struct ToolPolicyFilter {
    state: RwLock<PolicyState>,
}

/// Extract the tool name from an OpenAI-style function schema
/// `{type: "function", function: {name, description, parameters}}`.
pub fn tool_name(schema: &Value) -> Option<&str> {
    schema.get("function")?.get("name")?.as_str()
}

impl ToolPolicyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the global deny set
    pub fn set_global_deny(&self, names: impl IntoIterator<Item = impl Into<String>>) {
        let deny: HashSet<String> = names.into_iter().map(Into::into).collect();
        info!("Tool policy: global deny set to {} entries", deny.len());
        self.state.write().expect("policy lock poisoned").global_deny = deny;
    }

    /// Replace the global allow-list; `None` removes the restriction
    pub fn set_global_allow(&self, names: Option<HashSet<String>>) {
        info!(
            "Tool policy: global allow list {}",
            match &names {
                Some(n) => format!("set to {} entries", n.len()),
                None => "cleared".to_string(),
            }
        );
        self.state.write().expect("policy lock poisoned").global_allow = names;
    }

    /// Install or replace the policy for one agent type
    pub fn set_agent_policy(&self, policy: AgentToolPolicy) {
        info!(
            "Tool policy: agent '{}' policy set (allow: {:?}, deny: {})",
            policy.agent_type,
            policy.allow.as_ref().map(|a| a.len()),
            policy.deny.len()
        );
        self.state
            .write()
            .expect("policy lock poisoned")
            .agent_policies
            .insert(policy.agent_type.clone(), policy);
    }

    /// Replace the deny set for one tenant
    pub fn set_tenant_deny(
        &self,
        tenant_id: impl Into<String>,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) {
        let tenant_id = tenant_id.into();
        let deny: HashSet<String> = names.into_iter().map(Into::into).collect();
        info!(
            "Tool policy: tenant '{}' deny set to {} entries",
            tenant_id,
            deny.len()
        );
        self.state
            .write()
            .expect("policy lock poisoned")
            .tenant_deny
            .insert(tenant_id, deny);
    }

    /// Remove a tenant's deny set entirely
    pub fn clear_tenant_deny(&self, tenant_id: &str) {
        info!("Tool policy: tenant '{}' deny cleared", tenant_id);
        self.state
            .write()
            .expect("policy lock poisoned")
            .tenant_deny
            .remove(tenant_id);
    }

    /// Filter a list of tool schemas for an agent/tenant pair. Schemas whose
    /// tool name cannot be parsed pass through unfiltered: availability
    /// wins over strict filtering of malformed input.
    pub fn filter(
        &self,
        tool_schemas: &[Value],
        agent_type: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Vec<Value> {
        let state = self.state.read().expect("policy lock poisoned");
        let kept: Vec<Value> = tool_schemas
            .iter()
            .filter(|schema| match tool_name(schema) {
                Some(name) => block_reason(&state, name, agent_type, tenant_id).is_none(),
                None => true,
            })
            .cloned()
            .collect();
        if kept.len() != tool_schemas.len() {
            debug!(
                "Tool policy filtered {} of {} schemas (agent: {:?}, tenant: {:?})",
                tool_schemas.len() - kept.len(),
                tool_schemas.len(),
                agent_type,
                tenant_id
            );
        }
        kept
    }

    /// Whether a tool name passes every layer
    pub fn is_allowed(&self, name: &str, agent_type: Option<&str>, tenant_id: Option<&str>) -> bool {
        let state = self.state.read().expect("policy lock poisoned");
        block_reason(&state, name, agent_type, tenant_id).is_none()
    }

    /// Why a tool is blocked, for audit logging. `None` when allowed.
    pub fn reason(
        &self,
        name: &str,
        agent_type: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Option<String> {
        let state = self.state.read().expect("policy lock poisoned");
        block_reason(&state, name, agent_type, tenant_id)
    }
}

/// Layered evaluation, first match wins: global deny, global allow-list,
/// agent deny, agent allow-list, tenant deny.
fn block_reason(
    state: &PolicyState,
    name: &str,
    agent_type: Option<&str>,
    tenant_id: Option<&str>,
) -> Option<String> {
    if state.global_deny.contains(name) {
        return Some("blocked by global deny".to_string());
    }
    if let Some(allow) = &state.global_allow {
        if !allow.contains(name) {
            return Some("not in global allow list".to_string());
        }
    }
    if let Some(agent_type) = agent_type {
        if let Some(policy) = state.agent_policies.get(agent_type) {
            if policy.deny.contains(name) {
                return Some(format!("blocked by deny policy for agent type '{agent_type}'"));
            }
            if let Some(allow) = &policy.allow {
                if !allow.contains(name) {
                    return Some(format!("not in allow list for agent type '{agent_type}'"));
                }
            }
        }
    }
    if let Some(tenant_id) = tenant_id {
        if let Some(deny) = state.tenant_deny.get(tenant_id) {
            if deny.contains(name) {
                return Some(format!("blocked by deny policy for tenant '{tenant_id}'"));
            }
        }
    }
    None
}
