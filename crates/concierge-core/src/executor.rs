//! Level-wise sub-task execution
//!
//! Consumes the leveler's ordering: tasks within one level run concurrently
//! (bounded by a semaphore), and a level starts only after the previous one
//! has fully settled, successes and failures alike. A failing or timed-out
//! task is captured into its result; siblings and subsequent independent
//! work continue, and only the aggregate status is downgraded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::agent::{AgentProtocol, AgentRegistry, AgentRequest};
use crate::schedule::{self, ScheduleError};
use crate::types::{ExecutionStatus, SubTask, SubTaskResult, TaskStatus};

/// Configuration for the task executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrency bound within one level
    pub max_concurrent: usize,
    /// Timeout applied at the agent boundary, per task
    pub task_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            task_timeout_secs: 120,
        }
    }
}

/// Aggregate outcome of one scheduled batch
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub results: Vec<SubTaskResult>,
    pub status: ExecutionStatus,
}

impl ExecutionReport {
    /// Format results into a readable markdown string
    pub fn format_summary(&self) -> String {
        let mut output = String::from("## Results\n\n");
        for result in &self.results {
            output.push_str(&format!(
                "### Task {} ({})\n",
                result.sub_task_id, result.status
            ));
            output.push_str(&result.response);
            output.push_str("\n\n");
        }
        output
    }
}

/// Runs dependency-leveled sub-tasks against registered domain agents
pub struct TaskExecutor {
    registry: Arc<AgentRegistry>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(registry: Arc<AgentRegistry>, config: ExecutorConfig) -> Self {
        Self { registry, config }
    }

    /// Level the sub-tasks and execute them. A dependency cycle aborts the
    /// whole batch before anything runs; per-task failures do not.
    pub async fn run(&self, sub_tasks: &[SubTask]) -> Result<ExecutionReport, ScheduleError> {
        let levels = schedule::level(sub_tasks)?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        let mut results: Vec<SubTaskResult> = Vec::with_capacity(sub_tasks.len());
        for (index, level) in levels.into_iter().enumerate() {
            debug!("Executing level {} with {} tasks", index, level.len());

            let mut handles = Vec::with_capacity(level.len());
            for task in level {
                let agent = self.registry.resolve(task.domain);
                let semaphore = semaphore.clone();
                let timeout_secs = self.config.task_timeout_secs;
                let task_id = task.id;
                let description = task.description.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    run_sub_task(agent, task, timeout_secs).await
                });
                handles.push((task_id, description, handle));
            }

            // The level settles fully before the next one starts
            for (task_id, description, handle) in handles {
                match handle.await {
                    Ok(result) => results.push(result),
                    Err(e) => results.push(SubTaskResult {
                        sub_task_id: task_id,
                        description,
                        response: format!("Task panicked: {e}"),
                        status: TaskStatus::Error,
                        duration_ms: 0,
                        token_usage: HashMap::new(),
                    }),
                }
            }
        }

        let failed = results.iter().filter(|r| r.status == TaskStatus::Error).count();
        let status = ExecutionStatus::from_counts(results.len() - failed, failed);
        info!(
            "Executed {} sub-tasks: {} ({} failed)",
            results.len(),
            status,
            failed
        );
        Ok(ExecutionReport { results, status })
    }
}

/// Execute a single sub-task in isolation, converting timeout and agent
/// failure into an error result
async fn run_sub_task(
    agent: Option<Arc<dyn AgentProtocol>>,
    task: SubTask,
    timeout_secs: u64,
) -> SubTaskResult {
    let started = Instant::now();

    let Some(agent) = agent else {
        warn!("No agent registered for domain {}", task.domain);
        return SubTaskResult {
            sub_task_id: task.id,
            description: task.description,
            response: format!("No agent registered for domain '{}'", task.domain),
            status: TaskStatus::Error,
            duration_ms: started.elapsed().as_millis() as u64,
            token_usage: HashMap::new(),
        };
    };

    let request = AgentRequest::from_message(task.description.clone());
    let outcome = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        agent.execute(request),
    )
    .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(reply)) => SubTaskResult {
            sub_task_id: task.id,
            description: task.description,
            response: reply.raw_message,
            status: TaskStatus::Completed,
            duration_ms,
            token_usage: token_usage_from(&reply.data),
        },
        Ok(Err(e)) => {
            warn!("Sub-task {} failed: {:#}", task.id, e);
            SubTaskResult {
                sub_task_id: task.id,
                description: task.description,
                response: format!("Error: {e:#}"),
                status: TaskStatus::Error,
                duration_ms,
                token_usage: HashMap::new(),
            }
        }
        Err(_) => SubTaskResult {
            sub_task_id: task.id,
            description: task.description,
            response: format!("Sub-task timed out after {timeout_secs}s"),
            status: TaskStatus::Error,
            duration_ms,
            token_usage: HashMap::new(),
        },
    }
}

/// Lift numeric token counters from a reply's structured data
fn token_usage_from(data: &HashMap<String, Value>) -> HashMap<String, u64> {
    data.get("token_usage")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(key, value)| value.as_u64().map(|n| (key.clone(), n)))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::agent::AgentReply;
    use crate::types::Domain;

    /// Agent that records the order in which tasks reach it
    struct RecordingAgent {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AgentProtocol for RecordingAgent {
        fn agent_id(&self) -> &str {
            "recorder"
        }
        fn agent_type(&self) -> &str {
            "general"
        }
        async fn execute(&self, request: AgentRequest) -> Result<AgentReply> {
            self.log.lock().unwrap().push(request.message.clone());
            Ok(AgentReply::completed(format!("did: {}", request.message)))
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl AgentProtocol for FailingAgent {
        fn agent_id(&self) -> &str {
            "broken"
        }
        fn agent_type(&self) -> &str {
            "general"
        }
        async fn execute(&self, _request: AgentRequest) -> Result<AgentReply> {
            Err(anyhow!("provider unavailable"))
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl AgentProtocol for SlowAgent {
        fn agent_id(&self) -> &str {
            "slow"
        }
        fn agent_type(&self) -> &str {
            "general"
        }
        async fn execute(&self, _request: AgentRequest) -> Result<AgentReply> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(AgentReply::completed("too late"))
        }
    }

    fn task(id: u32, domain: Domain, deps: &[u32]) -> SubTask {
        let mut t = SubTask::new(id, format!("task {}", id), domain);
        for d in deps {
            t = t.depends_on(*d);
        }
        t
    }

    fn registry_with(agent: Arc<dyn AgentProtocol>, domain: Domain) -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        registry.register(domain, agent).unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_run_respects_level_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(
            Arc::new(RecordingAgent { log: log.clone() }),
            Domain::General,
        );
        let executor = TaskExecutor::new(registry, ExecutorConfig::default());

        let tasks = vec![
            task(1, Domain::General, &[]),
            task(2, Domain::General, &[1]),
            task(3, Domain::General, &[1]),
            task(4, Domain::General, &[2, 3]),
        ];
        let report = executor.run(&tasks).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.results.len(), 4);

        let order = log.lock().unwrap().clone();
        let position = |name: &str| order.iter().position(|m| m == name).unwrap();
        assert!(position("task 1") < position("task 2"));
        assert!(position("task 1") < position("task 3"));
        assert!(position("task 2") < position("task 4"));
        assert!(position("task 3") < position("task 4"));
    }

    #[tokio::test]
    async fn test_run_results_are_ordered_and_complete() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(Arc::new(RecordingAgent { log }), Domain::General);
        let executor = TaskExecutor::new(registry, ExecutorConfig::default());

        let tasks = vec![
            task(1, Domain::General, &[]),
            task(2, Domain::General, &[1]),
            task(3, Domain::General, &[1]),
        ];
        let report = executor.run(&tasks).await.unwrap();

        let ids: Vec<u32> = report.results.iter().map(|r| r.sub_task_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(report.results.iter().all(|r| r.status == TaskStatus::Completed));
        assert_eq!(report.results[0].response, "did: task 1");
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_execution() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(
            Arc::new(RecordingAgent { log: log.clone() }),
            Domain::General,
        );
        let executor = TaskExecutor::new(registry, ExecutorConfig::default());

        let tasks = vec![task(1, Domain::General, &[2]), task(2, Domain::General, &[1])];
        let err = executor.run(&tasks).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Cycle { .. }));
        // nothing ran
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings_or_later_levels() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = AgentRegistry::new();
        registry
            .register(Domain::Communication, Arc::new(FailingAgent))
            .unwrap();
        registry
            .register(Domain::General, Arc::new(RecordingAgent { log: log.clone() }))
            .unwrap();
        let executor = TaskExecutor::new(Arc::new(registry), ExecutorConfig::default());

        let tasks = vec![
            task(1, Domain::Communication, &[]),
            task(2, Domain::General, &[]),
            task(3, Domain::General, &[1]),
        ];
        let report = executor.run(&tasks).await.unwrap();

        assert_eq!(report.status, ExecutionStatus::Partial);
        assert_eq!(report.results[0].status, TaskStatus::Error);
        assert!(report.results[0].response.contains("provider unavailable"));
        // sibling and dependent both ran despite the failure
        assert_eq!(report.results[1].status, TaskStatus::Completed);
        assert_eq!(report.results[2].status, TaskStatus::Completed);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_all_failures_is_failed() {
        let registry = registry_with(Arc::new(FailingAgent), Domain::General);
        let executor = TaskExecutor::new(registry, ExecutorConfig::default());

        let tasks = vec![task(1, Domain::General, &[]), task(2, Domain::General, &[])];
        let report = executor.run(&tasks).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_agent_yields_error_result() {
        // no general agent to fall back to
        let registry = registry_with(
            Arc::new(RecordingAgent {
                log: Arc::new(Mutex::new(Vec::new())),
            }),
            Domain::Travel,
        );
        let executor = TaskExecutor::new(registry, ExecutorConfig::default());

        let tasks = vec![task(1, Domain::Communication, &[])];
        let report = executor.run(&tasks).await.unwrap();
        assert_eq!(report.results[0].status, TaskStatus::Error);
        assert!(report.results[0].response.contains("No agent registered"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_error_result() {
        let registry = registry_with(Arc::new(SlowAgent), Domain::General);
        let config = ExecutorConfig {
            task_timeout_secs: 1,
            ..Default::default()
        };
        let executor = TaskExecutor::new(registry, config);

        let tasks = vec![task(1, Domain::General, &[])];
        let report = executor.run(&tasks).await.unwrap();
        assert_eq!(report.results[0].status, TaskStatus::Error);
        assert!(report.results[0].response.contains("timed out"));
        assert_eq!(report.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_token_usage_lifted_from_reply_data() {
        struct UsageAgent;

        #[async_trait]
        impl AgentProtocol for UsageAgent {
            fn agent_id(&self) -> &str {
                "usage"
            }
            fn agent_type(&self) -> &str {
                "general"
            }
            async fn execute(&self, _request: AgentRequest) -> Result<AgentReply> {
                Ok(AgentReply::completed("ok").with_data(
                    "token_usage",
                    serde_json::json!({"input_tokens": 120, "output_tokens": 45}),
                ))
            }
        }

        let registry = registry_with(Arc::new(UsageAgent), Domain::General);
        let executor = TaskExecutor::new(registry, ExecutorConfig::default());

        let tasks = vec![task(1, Domain::General, &[])];
        let report = executor.run(&tasks).await.unwrap();
        assert_eq!(report.results[0].token_usage.get("input_tokens"), Some(&120));
        assert_eq!(report.results[0].token_usage.get("output_tokens"), Some(&45));
    }

    #[tokio::test]
    async fn test_format_summary() {
        let report = ExecutionReport {
            results: vec![
                SubTaskResult {
                    sub_task_id: 1,
                    description: "look up flights".to_string(),
                    response: "Found 3 options".to_string(),
                    status: TaskStatus::Completed,
                    duration_ms: 12,
                    token_usage: HashMap::new(),
                },
                SubTaskResult {
                    sub_task_id: 2,
                    description: "email Alice".to_string(),
                    response: "Error: timeout".to_string(),
                    status: TaskStatus::Error,
                    duration_ms: 30_000,
                    token_usage: HashMap::new(),
                },
            ],
            status: ExecutionStatus::Partial,
        };
        let formatted = report.format_summary();
        assert!(formatted.contains("### Task 1 (completed)"));
        assert!(formatted.contains("Found 3 options"));
        assert!(formatted.contains("### Task 2 (error)"));
    }
}
