//! `Orchestrator` — the single entry point the API and CLI talk to.
//!
//! Ties together the workflow catalog, the handoff catalog, the agent
//! registry, the scheduler and the metrics reader over one storage handle.

use std::sync::Arc;

use agents::{Agent, AgentRegistration, AgentRegistry};
use db::{models::WorkflowStatus, Page, Storage};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    catalog::WorkflowCatalog,
    config::EngineConfig,
    execution::{ExecuteOptions, Execution, ExecutionResult},
    handoff::HandoffCatalog,
    metrics::{self, ExecutionMetrics, TimeRange},
    models::{HandoffDefinition, HandoffDraft, WorkflowDefinition, WorkflowDraft, WorkflowPatch},
    scheduler::Scheduler,
    EngineError,
};

#[derive(Clone)]
pub struct Orchestrator {
    catalog: WorkflowCatalog,
    handoffs: HandoffCatalog,
    scheduler: Scheduler,
    registry: Arc<AgentRegistry>,
    storage: Storage,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(storage: Storage, registry: Arc<AgentRegistry>, config: EngineConfig) -> Self {
        let pool = storage.pool().clone();
        let handoffs = HandoffCatalog::new(pool.clone());
        let scheduler = Scheduler::new(storage.clone(), registry.clone(), handoffs.clone(), config.clone());
        Self {
            catalog: WorkflowCatalog::new(pool),
            handoffs,
            scheduler,
            registry,
            storage,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn limit(&self, limit: Option<i64>) -> i64 {
        limit.unwrap_or(self.config.default_list_limit)
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    pub async fn create_workflow(&self, draft: WorkflowDraft) -> Result<WorkflowDefinition, EngineError> {
        self.catalog.create(draft).await
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<WorkflowDefinition, EngineError> {
        self.catalog.get(id).await
    }

    pub async fn get_workflow_version(&self, id: Uuid, version: u32) -> Result<WorkflowDefinition, EngineError> {
        self.catalog.get_version(id, version).await
    }

    pub async fn update_workflow(&self, id: Uuid, patch: WorkflowPatch) -> Result<WorkflowDefinition, EngineError> {
        self.catalog.update(id, patch).await
    }

    pub async fn list_workflows(
        &self,
        tag: Option<&str>,
        status: WorkflowStatus,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Page<WorkflowDefinition>, EngineError> {
        self.catalog.list(tag, status, cursor, self.limit(limit)).await
    }

    pub async fn delete_workflow(&self, id: Uuid) -> Result<(), EngineError> {
        self.catalog.delete(id).await
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Run the latest version of `workflow_id` against `input`.
    pub async fn execute(
        &self,
        workflow_id: Uuid,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<Execution, EngineError> {
        let workflow = self.catalog.get(workflow_id).await?;
        self.scheduler.execute(workflow, input, options).await
    }

    pub async fn get_status(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.scheduler.get_status(execution_id).await
    }

    pub async fn cancel(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.scheduler.cancel(execution_id).await
    }

    pub async fn get_result(&self, execution_id: Uuid) -> Result<ExecutionResult, EngineError> {
        self.scheduler.get_result(execution_id).await
    }

    pub async fn wait(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.scheduler.wait(execution_id).await
    }

    pub async fn list_executions(
        &self,
        workflow_id: Uuid,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Page<Execution>, EngineError> {
        self.scheduler
            .list_executions(workflow_id, cursor, self.limit(limit))
            .await
    }

    // -----------------------------------------------------------------------
    // Handoffs
    // -----------------------------------------------------------------------

    pub async fn register_handoff(&self, draft: HandoffDraft) -> Result<HandoffDefinition, EngineError> {
        self.handoffs.register(draft).await
    }

    pub async fn get_handoff(&self, id: Uuid) -> Result<HandoffDefinition, EngineError> {
        self.handoffs.get(id).await
    }

    pub async fn list_handoffs(
        &self,
        source_agent_id: Option<&str>,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Page<HandoffDefinition>, EngineError> {
        self.handoffs.list(source_agent_id, cursor, self.limit(limit)).await
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub fn register_agent(&self, registration: AgentRegistration, handler: Arc<dyn Agent>) -> Option<AgentRegistration> {
        self.registry.register_agent(registration, handler)
    }

    pub fn list_agents(&self) -> Vec<AgentRegistration> {
        self.registry.list()
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    pub async fn metrics(&self, range: TimeRange, workflow_id: Option<Uuid>) -> Result<ExecutionMetrics, EngineError> {
        metrics::collect(self.storage.pool(), range, workflow_id).await
    }
}
