//! Workflow definition store.
//!
//! Wraps the `workflows` / `workflow_versions` repositories with
//! validation and versioning rules:
//! - `create` validates the step graph and publishes version 1.
//! - `update` publishes version N+1; version N stays readable.
//! - `delete` tombstones, refused while executions are still live.

use chrono::Utc;
use db::{
    models::{NewWorkflowVersion, WorkflowRecord, WorkflowStatus},
    repository::{executions as exec_repo, workflows as wf_repo},
    DbError, DbPool, Page,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    condition,
    dag::validate_steps,
    models::{WorkflowDefinition, WorkflowDraft, WorkflowPatch},
    EngineError,
};

#[derive(Clone)]
pub struct WorkflowCatalog {
    pool: DbPool,
}

impl WorkflowCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Validate and publish a new workflow at version 1.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub async fn create(&self, draft: WorkflowDraft) -> Result<WorkflowDefinition, EngineError> {
        validate_draft(&draft)?;

        let now = Utc::now();
        let definition = WorkflowDefinition {
            id: Uuid::new_v4(),
            name: draft.name,
            description: draft.description,
            version: 1,
            tags: draft.tags,
            metadata: draft.metadata,
            required_inputs: draft.required_inputs,
            steps: draft.steps,
            created_at: now,
            updated_at: now,
        };

        let id = definition.id.to_string();
        let record = wf_repo::create_workflow(&self.pool, &new_version(&id, &definition)?).await?;

        info!("workflow '{}' created ({} steps)", definition.id, definition.steps.len());
        decode(&record)
    }

    /// Latest version of a live workflow.
    pub async fn get(&self, id: Uuid) -> Result<WorkflowDefinition, EngineError> {
        let record = self.live_record(id).await?;
        decode(&record)
    }

    /// A specific revision of a live workflow.
    pub async fn get_version(&self, id: Uuid, version: u32) -> Result<WorkflowDefinition, EngineError> {
        self.live_record(id).await?;
        match wf_repo::get_workflow_version(&self.pool, &id.to_string(), i64::from(version)).await {
            Ok(row) => Ok(serde_json::from_str(&row.definition)?),
            Err(DbError::NotFound) => Err(EngineError::not_found("workflow version", format!("{id}@{version}"))),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `patch` and publish the result as the next version.
    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: Uuid, patch: WorkflowPatch) -> Result<WorkflowDefinition, EngineError> {
        let current = self.get(id).await?;
        let draft = patch.apply(&current);
        validate_draft(&draft)?;

        let definition = WorkflowDefinition {
            id,
            name: draft.name,
            description: draft.description,
            version: current.version + 1,
            tags: draft.tags,
            metadata: draft.metadata,
            required_inputs: draft.required_inputs,
            steps: draft.steps,
            created_at: current.created_at,
            updated_at: Utc::now(),
        };

        let id_str = id.to_string();
        let record = wf_repo::append_version(
            &self.pool,
            i64::from(current.version),
            &new_version(&id_str, &definition)?,
        )
        .await
        .map_err(|e| match e {
            DbError::NotFound => EngineError::not_found("workflow", id),
            other => other.into(),
        })?;

        info!("workflow '{}' updated to version {}", id, definition.version);
        decode(&record)
    }

    /// Page through workflows in creation order.
    pub async fn list(
        &self,
        tag: Option<&str>,
        status: WorkflowStatus,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Page<WorkflowDefinition>, EngineError> {
        let page = wf_repo::list_workflows(&self.pool, tag, status, cursor, limit).await?;
        let items = page.items.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, next_cursor: page.next_cursor })
    }

    /// Tombstone a workflow that has no pending or running executions.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        self.live_record(id).await?;

        let id_str = id.to_string();
        let active = exec_repo::count_active_for_workflow(&self.pool, &id_str).await?;
        if active > 0 {
            return Err(EngineError::Conflict(format!(
                "workflow '{id}' has {active} active execution(s)"
            )));
        }

        wf_repo::soft_delete_workflow(&self.pool, &id_str, Utc::now())
            .await
            .map_err(|e| match e {
                DbError::NotFound => EngineError::not_found("workflow", id),
                other => other.into(),
            })?;

        info!("workflow '{}' deleted", id);
        Ok(())
    }

    async fn live_record(&self, id: Uuid) -> Result<WorkflowRecord, EngineError> {
        match wf_repo::get_workflow(&self.pool, &id.to_string()).await {
            Ok(record) if record.status == WorkflowStatus::Active.to_string() => Ok(record),
            Ok(_) | Err(DbError::NotFound) => Err(EngineError::not_found("workflow", id)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Full validation of a draft, as run by `create` and `update`. Returns the
/// dispatch order of the steps.
pub fn validate_draft(draft: &WorkflowDraft) -> Result<Vec<String>, EngineError> {
    if draft.name.trim().is_empty() {
        return Err(EngineError::InvalidInput("workflow name must not be empty".into()));
    }
    let order = validate_steps(&draft.steps)?;
    for step in &draft.steps {
        if let Some(expr) = &step.condition {
            condition::validate(expr)
                .map_err(|e| EngineError::InvalidInput(format!("step '{}' condition: {e}", step.id)))?;
        }
    }
    Ok(order)
}

fn new_version<'a>(id: &'a str, def: &'a WorkflowDefinition) -> Result<NewWorkflowVersion<'a>, EngineError> {
    Ok(NewWorkflowVersion {
        id,
        version: i64::from(def.version),
        name: &def.name,
        description: &def.description,
        tags: serde_json::to_string(&def.tags)?,
        definition: serde_json::to_string(def)?,
        created_at: def.updated_at,
    })
}

fn decode(record: &WorkflowRecord) -> Result<WorkflowDefinition, EngineError> {
    Ok(serde_json::from_str(&record.definition)?)
}
