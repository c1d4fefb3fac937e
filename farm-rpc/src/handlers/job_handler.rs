// Job Handler
// Authorizes job lifecycle requests and forwards them to the scheduling core

use std::sync::Arc;

use farm_service::{
    AgentId, Batch, BatchError, BatchUpdate, CreateJobOptions, InvalidReason, Job, JobFilter,
    JobId, JobService, JobUpdate, LeaseId, ServiceError, SessionId, Step, StepLocation,
    StepUpdate, StreamId, SubResourceId, TemplateId,
};

use crate::auth::{CallerContext, Permission};
use crate::error::{RpcError, RpcResult};

/// Batch and step ids travel as four-digit hex strings
fn parse_sub_resource_id(text: &str) -> RpcResult<SubResourceId> {
    SubResourceId::parse(text).ok_or_else(|| {
        ServiceError::invalid(
            InvalidReason::MalformedId,
            format!("'{}' is not a valid batch or step id", text),
        )
        .into()
    })
}

pub struct JobHandler {
    service: Arc<JobService>,
}

impl JobHandler {
    pub fn new(service: Arc<JobService>) -> Self {
        Self { service }
    }

    /// Start a job from a template. The caller becomes the starting user
    /// unless the request names one explicitly.
    pub async fn create_job(
        &self,
        caller: &CallerContext,
        stream_id: &StreamId,
        template_id: &TemplateId,
        mut options: CreateJobOptions,
    ) -> RpcResult<Job> {
        caller.require(Permission::Execute)?;
        if options.started_by.is_none() {
            options.started_by = caller.user_id().cloned();
        }
        Ok(self.service.create_job(stream_id, template_id, options).await?)
    }

    pub async fn get_job(&self, caller: &CallerContext, job_id: &JobId) -> RpcResult<Job> {
        caller.require(Permission::View)?;
        Ok(self.service.get_job(job_id).await?)
    }

    pub async fn find_jobs(
        &self,
        caller: &CallerContext,
        filter: &JobFilter,
    ) -> RpcResult<Vec<Job>> {
        caller.require(Permission::View)?;
        Ok(self.service.find_jobs(filter).await)
    }

    pub async fn delete_job(&self, caller: &CallerContext, job_id: &JobId) -> RpcResult<()> {
        caller.require(Permission::Update)?;
        Ok(self.service.delete_job(job_id).await?)
    }

    /// Partial update of job fields. The caller's identity is recorded as
    /// the aborting user when the update amounts to an abort request.
    pub async fn update_job(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
        update: &JobUpdate,
    ) -> RpcResult<Job> {
        caller.require(Permission::Update)?;
        let updated_by = caller.user_id().cloned().ok_or_else(|| {
            RpcError::InvalidRequest("job updates require a user identity".to_string())
        })?;
        Ok(self.service.update_job(job_id, update, &updated_by).await?)
    }

    /// Batch updates come from the agent executing the batch; the caller
    /// must hold the session claim the batch is bound to
    pub async fn update_batch(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
        batch_id: &str,
        updates: &[BatchUpdate],
    ) -> RpcResult<Job> {
        let batch_id = parse_sub_resource_id(batch_id)?;
        let job = self.service.get_job(job_id).await?;
        let batch = job
            .batch(batch_id)
            .ok_or_else(|| RpcError::NotFound(format!("batch {} in job {}", batch_id, job_id)))?;
        caller.require_session(batch.session_id.as_ref())?;
        Ok(self.service.update_batch(job_id, batch_id, updates).await?)
    }

    /// Step updates carry mixed authority: execution progress comes from
    /// the bound agent session, retry and priority changes need the retry
    /// permission, and abort requests and property edits need the update
    /// permission. On a retry request the returned location names the
    /// freshly materialized occurrence of the step's node.
    pub async fn update_step(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
        batch_id: &str,
        step_id: &str,
        updates: &[StepUpdate],
    ) -> RpcResult<(Job, Option<StepLocation>)> {
        let batch_id = parse_sub_resource_id(batch_id)?;
        let step_id = parse_sub_resource_id(step_id)?;

        let job = self.service.get_job(job_id).await?;
        let batch = job
            .batch(batch_id)
            .ok_or_else(|| RpcError::NotFound(format!("batch {} in job {}", batch_id, job_id)))?;
        for update in updates {
            match update {
                StepUpdate::State(_) | StepUpdate::Outcome(_) | StepUpdate::Log(_) => {
                    caller.require_session(batch.session_id.as_ref())?;
                }
                StepUpdate::Retry { .. } | StepUpdate::Priority(_) => {
                    caller.require(Permission::Retry)?;
                }
                StepUpdate::AbortRequested { .. } | StepUpdate::Properties(_) => {
                    caller.require(Permission::Update)?;
                }
            }
        }
        Ok(self
            .service
            .update_step(job_id, batch_id, step_id, updates)
            .await?)
    }

    pub async fn get_step(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
        batch_id: &str,
        step_id: &str,
    ) -> RpcResult<Step> {
        caller.require(Permission::View)?;
        let batch_id = parse_sub_resource_id(batch_id)?;
        let step_id = parse_sub_resource_id(step_id)?;
        Ok(self.service.get_step(job_id, batch_id, step_id).await?)
    }

    /// Batches waiting for an agent, for the external assignment scheduler
    pub async fn eligible_batches(&self, caller: &CallerContext) -> RpcResult<Vec<(JobId, Batch)>> {
        caller.require(Permission::View)?;
        Ok(self.service.eligible_batches().await)
    }

    pub async fn assign_batch(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
        batch_id: &str,
        agent_id: &AgentId,
        session_id: &SessionId,
        lease_id: &LeaseId,
    ) -> RpcResult<Job> {
        caller.require(Permission::Execute)?;
        let batch_id = parse_sub_resource_id(batch_id)?;
        Ok(self
            .service
            .assign_batch(job_id, batch_id, agent_id, session_id, lease_id)
            .await?)
    }

    pub async fn cancel_batch_lease(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
        batch_id: &str,
    ) -> RpcResult<Job> {
        caller.require(Permission::Execute)?;
        let batch_id = parse_sub_resource_id(batch_id)?;
        Ok(self.service.cancel_batch_lease(job_id, batch_id).await?)
    }

    pub async fn request_cancel_lease(
        &self,
        caller: &CallerContext,
        lease_id: &LeaseId,
    ) -> RpcResult<()> {
        caller.require(Permission::Update)?;
        Ok(self
            .service
            .request_cancel_lease(lease_id, caller.user_id())
            .await?)
    }

    /// Resolve a batch whose agent stopped responding
    pub async fn fail_batch(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
        batch_id: &str,
        error: BatchError,
    ) -> RpcResult<Job> {
        caller.require(Permission::Execute)?;
        let batch_id = parse_sub_resource_id(batch_id)?;
        Ok(self.service.fail_batch(job_id, batch_id, error).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farm_service::{
        BatchState, GroupDefinition, InMemoryChangeService, InMemoryGraphRegistry,
        InMemoryJobStore, InMemoryTemplateRegistry, NodeDefinition, Priority, StepOutcome,
        StepState, TemplateDocument, TemplateRegistry, UserId,
    };

    fn make_template() -> TemplateDocument {
        TemplateDocument {
            id: "incremental".to_string(),
            name: "Incremental Build".to_string(),
            allow_preflights: true,
            priority: Priority::Normal,
            arguments: Vec::new(),
            groups: vec![GroupDefinition::new(
                "win64",
                vec![
                    NodeDefinition::new("Compile"),
                    NodeDefinition::new("Cook").with_inputs(vec!["Compile".to_string()]),
                ],
            )],
            aggregates: Vec::new(),
            labels: Vec::new(),
        }
    }

    async fn make_handler() -> JobHandler {
        let templates = Arc::new(InMemoryTemplateRegistry::new());
        templates.add(make_template()).await.unwrap();
        let changes = Arc::new(InMemoryChangeService::new());
        changes.set_latest(StreamId::new("ue5-main"), 1000).await;

        let service = Arc::new(JobService::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryGraphRegistry::new()),
            templates,
            changes,
        ));
        JobHandler::new(service)
    }

    fn starter() -> CallerContext {
        CallerContext::user(UserId::new("jorge"), [Permission::View, Permission::Execute])
    }

    async fn create_job(handler: &JobHandler) -> Job {
        handler
            .create_job(
                &starter(),
                &StreamId::new("ue5-main"),
                &TemplateId::new("incremental"),
                CreateJobOptions::default(),
            )
            .await
            .unwrap()
    }

    /// Bind a session and report the batch running, as an agent would
    async fn start_batch(handler: &JobHandler, job: &Job) -> CallerContext {
        let batch_id = job.batches[0].id.to_string();
        handler
            .assign_batch(
                &starter(),
                &job.id,
                &batch_id,
                &AgentId::new("agent-7"),
                &SessionId::new("session-1"),
                &LeaseId::new("lease-1"),
            )
            .await
            .unwrap();
        let agent = CallerContext::agent(SessionId::new("session-1"));
        handler
            .update_batch(&agent, &job.id, &batch_id, &[BatchUpdate::State(BatchState::Running)])
            .await
            .unwrap();
        agent
    }

    #[tokio::test]
    async fn test_create_job_requires_execute_permission() {
        let handler = make_handler().await;
        let viewer = CallerContext::user(UserId::new("jorge"), [Permission::View]);
        let err = handler
            .create_job(
                &viewer,
                &StreamId::new("ue5-main"),
                &TemplateId::new("incremental"),
                CreateJobOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Forbidden(_)));

        let job = create_job(&handler).await;
        assert_eq!(job.started_by, Some(UserId::new("jorge")));
    }

    #[tokio::test]
    async fn test_step_progress_requires_bound_session() {
        let handler = make_handler().await;
        let job = create_job(&handler).await;
        let batch_id = job.batches[0].id.to_string();
        let step_id = job.batches[0].steps[0].id.to_string();

        let agent = start_batch(&handler, &job).await;
        handler
            .update_step(&agent, &job.id, &batch_id, &step_id, &[StepUpdate::State(StepState::Running)])
            .await
            .unwrap();

        // An agent holding a different session claim is turned away
        let intruder = CallerContext::agent(SessionId::new("session-2"));
        let err = handler
            .update_step(
                &intruder,
                &job.id,
                &batch_id,
                &step_id,
                &[StepUpdate::State(StepState::Completed)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Forbidden(_)));

        // So is a user, no matter their permissions
        let user = CallerContext::user(UserId::new("jorge"), [Permission::Update]);
        let err = handler
            .update_step(
                &user,
                &job.id,
                &batch_id,
                &step_id,
                &[StepUpdate::State(StepState::Completed)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_retry_requires_retry_permission() {
        let handler = make_handler().await;
        let job = create_job(&handler).await;
        let batch_id = job.batches[0].id.to_string();
        let step_id = job.batches[0].steps[0].id.to_string();

        let agent = start_batch(&handler, &job).await;
        handler
            .update_step(&agent, &job.id, &batch_id, &step_id, &[StepUpdate::State(StepState::Running)])
            .await
            .unwrap();
        handler
            .update_step(
                &agent,
                &job.id,
                &batch_id,
                &step_id,
                &[
                    StepUpdate::State(StepState::Completed),
                    StepUpdate::Outcome(StepOutcome::Failure),
                ],
            )
            .await
            .unwrap();

        let retry = [StepUpdate::Retry {
            by: UserId::new("jorge"),
        }];
        let plain = CallerContext::user(UserId::new("jorge"), [Permission::Update]);
        let err = handler
            .update_step(&plain, &job.id, &batch_id, &step_id, &retry)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Forbidden(_)));

        let retrier = CallerContext::user(UserId::new("jorge"), [Permission::Retry]);
        let (updated, location) = handler
            .update_step(&retrier, &job.id, &batch_id, &step_id, &retry)
            .await
            .unwrap();
        let location = location.unwrap();
        assert_eq!(updated.batches.len(), 2);
        assert_eq!(location.batch_id, updated.batches[1].id);
    }

    #[tokio::test]
    async fn test_property_updates_require_update_permission() {
        let handler = make_handler().await;
        let job = create_job(&handler).await;
        let batch_id = job.batches[0].id.to_string();
        let step_id = job.batches[0].steps[0].id.to_string();
        let agent = start_batch(&handler, &job).await;

        let mut properties = std::collections::HashMap::new();
        properties.insert("diagnostics".to_string(), Some("enabled".to_string()));
        let updates = [StepUpdate::Properties(properties)];

        // The agent session alone does not grant property edits
        let err = handler
            .update_step(&agent, &job.id, &batch_id, &step_id, &updates)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Forbidden(_)));

        let user = CallerContext::user(UserId::new("jorge"), [Permission::Update]);
        let (updated, _) = handler
            .update_step(&user, &job.id, &batch_id, &step_id, &updates)
            .await
            .unwrap();
        let step = updated.batch(job.batches[0].id).unwrap().steps[0].clone();
        assert_eq!(step.properties.get("diagnostics"), Some(&"enabled".to_string()));
    }

    #[tokio::test]
    async fn test_malformed_sub_resource_id() {
        let handler = make_handler().await;
        let job = create_job(&handler).await;

        let err = handler
            .update_step(
                &starter(),
                &job.id,
                "not-hex",
                "0000",
                &[StepUpdate::State(StepState::Running)],
            )
            .await
            .unwrap_err();
        match err {
            RpcError::InvalidRequest(message) => assert!(message.contains("malformed-id")),
            other => panic!("expected InvalidRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eligible_batches_and_lease_release() {
        let handler = make_handler().await;
        let job = create_job(&handler).await;
        let batch_id = job.batches[0].id.to_string();

        let eligible = handler.eligible_batches(&starter()).await.unwrap();
        assert_eq!(eligible.len(), 1);

        handler
            .assign_batch(
                &starter(),
                &job.id,
                &batch_id,
                &AgentId::new("agent-7"),
                &SessionId::new("session-1"),
                &LeaseId::new("lease-1"),
            )
            .await
            .unwrap();
        assert!(handler.eligible_batches(&starter()).await.unwrap().is_empty());

        handler
            .cancel_batch_lease(&starter(), &job.id, &batch_id)
            .await
            .unwrap();
        assert_eq!(handler.eligible_batches(&starter()).await.unwrap().len(), 1);
    }
}
