// Job Service
// Orchestrates the job lifecycle: creation from templates, step and batch
// updates under optimistic concurrency, graph growth, and lease binding

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::changes::{validate_shelf, ChangeService};
use crate::error::{InvalidReason, ServiceError, ServiceResult};
use crate::events::{EventSender, JobEvent, JobEventSender};
use crate::graph::{
    AggregateDefinition, Graph, GraphRegistry, GroupDefinition, LabelDefinition, Priority,
};
use crate::leases::{InMemoryLeaseRegistry, Lease, LeasePayload, LeaseRegistry, LeaseState};
use crate::templates::TemplateRegistry;

use super::job::{Batch, Job, Step};
use super::labels::{default_label_state, label_states, LabelStatus};
use super::retry::{locate_retried_step, StepLocation};
use super::scheduler;
use super::store::JobStore;
use super::timing::{compute_job_timing, JobTiming, NullTimingEstimator, StepEstimate, TimingEstimator};
use super::types::{
    AgentId, BatchError, BatchState, JobId, JobState, LeaseId, SessionId, StreamId, SubResourceId,
    TemplateId, UserId,
};
use super::update::{apply_batch_updates, apply_step_updates, BatchUpdate, StepUpdate};

/// Number of times a conditional write is retried before the conflict is
/// reported as an internal fault
const MAX_UPDATE_ATTEMPTS: usize = 10;

/// Number of historical samples requested per node when projecting timing
const TIMING_SAMPLE_COUNT: usize = 10;

/// Optional settings for a new job. Fields left unset fall back to the
/// template's defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateJobOptions {
    /// Display name; defaults to the template name
    pub name: Option<String>,
    /// Change to build; defaults to the latest change in the stream
    pub change: Option<u32>,
    /// Shelved change to apply on top of the base change
    pub preflight_change: Option<u32>,
    pub priority: Option<Priority>,
    pub arguments: Option<Vec<String>>,
    pub started_by: Option<UserId>,
}

/// Partial update of job-level fields
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub priority: Option<Priority>,
    /// Request the whole job to stop
    pub abort: bool,
    /// Replacement argument list; an empty list is an abort request
    pub arguments: Option<Vec<String>>,
}

/// Filter for job queries
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub stream_id: Option<StreamId>,
    pub template_id: Option<TemplateId>,
    pub state: Option<JobState>,
}

/// The scheduling core.
///
/// All mutations go through a read-compute-conditional-write loop against the
/// job store: the job is re-read and the change recomputed whenever another
/// writer got in first, so callers never block each other and never observe
/// half-applied updates. Validation failures abort the loop immediately and
/// are returned as-is.
pub struct JobService {
    store: Arc<dyn JobStore>,
    graphs: Arc<dyn GraphRegistry>,
    templates: Arc<dyn TemplateRegistry>,
    changes: Arc<dyn ChangeService>,
    leases: Arc<dyn LeaseRegistry>,
    timing: Arc<dyn TimingEstimator>,
    events: Option<JobEventSender>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        graphs: Arc<dyn GraphRegistry>,
        templates: Arc<dyn TemplateRegistry>,
        changes: Arc<dyn ChangeService>,
    ) -> Self {
        Self {
            store,
            graphs,
            templates,
            changes,
            leases: Arc::new(InMemoryLeaseRegistry::new()),
            timing: Arc::new(NullTimingEstimator),
            events: None,
        }
    }

    /// Use the given lease registry instead of a private in-memory one
    pub fn with_lease_registry(mut self, leases: Arc<dyn LeaseRegistry>) -> Self {
        self.leases = leases;
        self
    }

    /// Use the given timing estimator for job timing projections
    pub fn with_timing_estimator(mut self, timing: Arc<dyn TimingEstimator>) -> Self {
        self.timing = timing;
        self
    }

    /// Emit lifecycle events on the given channel
    pub fn with_events(mut self, events: JobEventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Create a job from a template.
    ///
    /// The template's graph is registered (or found, if an identical graph
    /// already exists) and the initial batches are derived from it before the
    /// job becomes visible to other callers.
    pub async fn create_job(
        &self,
        stream_id: &StreamId,
        template_id: &TemplateId,
        options: CreateJobOptions,
    ) -> ServiceResult<Job> {
        let template = self.templates.get(template_id).await?;

        if let Some(preflight_change) = options.preflight_change {
            if !template.allow_preflights {
                return Err(ServiceError::invalid(
                    InvalidReason::PreflightNotAllowed,
                    format!("template '{}' does not allow preflights", template.id),
                ));
            }
            let details = self
                .changes
                .shelf_details(preflight_change)
                .await?
                .ok_or_else(|| {
                    ServiceError::invalid(
                        InvalidReason::UnknownChange,
                        format!("change {} does not exist or has no shelf", preflight_change),
                    )
                })?;
            validate_shelf(stream_id, &details)?;
        }

        let change = match options.change {
            Some(change) => change,
            None => self
                .changes
                .latest_change(stream_id)
                .await?
                .ok_or_else(|| {
                    ServiceError::invalid(
                        InvalidReason::UnknownChange,
                        format!("stream {} has no submitted changes", stream_id),
                    )
                })?,
        };

        let graph_hash = self.graphs.add(template.build_graph()?).await?;
        let graph = self.graphs.get(&graph_hash).await?;

        let mut job = Job::new(
            JobId::generate(),
            stream_id.clone(),
            template_id.clone(),
            graph_hash,
            options.name.unwrap_or_else(|| template.name.clone()),
            change,
        )
        .with_priority(options.priority.unwrap_or(template.priority))
        .with_arguments(options.arguments.unwrap_or_else(|| template.arguments.clone()));
        if let Some(preflight_change) = options.preflight_change {
            job = job.with_preflight_change(preflight_change);
        }
        if let Some(user_id) = options.started_by {
            job = job.with_started_by(user_id);
        }

        scheduler::create_batches(&mut job, &graph)?;
        let job = self.store.insert(job).await?;

        info!(
            job_id = %job.id,
            stream_id = %stream_id,
            template_id = %template_id,
            change,
            "created job"
        );
        self.events.send_event(JobEvent::job_created(
            job.id.clone(),
            stream_id.clone(),
            change,
        ));
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &JobId) -> ServiceResult<Job> {
        self.store.get(job_id).await
    }

    /// Jobs matching the filter, newest first
    pub async fn find_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .store
            .list()
            .await
            .into_iter()
            .filter(|job| {
                filter
                    .stream_id
                    .as_ref()
                    .map_or(true, |stream_id| &job.stream_id == stream_id)
            })
            .filter(|job| {
                filter
                    .template_id
                    .as_ref()
                    .map_or(true, |template_id| &job.template_id == template_id)
            })
            .filter(|job| filter.state.map_or(true, |state| job.state() == state))
            .collect();
        jobs.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        jobs
    }

    pub async fn delete_job(&self, job_id: &JobId) -> ServiceResult<()> {
        self.store.remove(job_id).await?;
        info!(job_id = %job_id, "deleted job");
        Ok(())
    }

    /// Apply a partial update to job-level fields. Clearing the argument
    /// list leaves nothing to run and is treated as an abort request.
    pub async fn update_job(
        &self,
        job_id: &JobId,
        update: &JobUpdate,
        updated_by: &UserId,
    ) -> ServiceResult<Job> {
        let (job, aborted_now) = self
            .update_job_with(job_id, |job, graph| {
                if let Some(name) = &update.name {
                    job.name = name.clone();
                }

                let mut rebuild = false;
                if let Some(priority) = update.priority {
                    if job.priority != priority {
                        job.priority = priority;
                        rebuild = true;
                    }
                }
                if let Some(arguments) = &update.arguments {
                    if &job.arguments != arguments {
                        job.arguments = arguments.clone();
                        rebuild = true;
                    }
                }

                let abort = update.abort
                    || update
                        .arguments
                        .as_ref()
                        .map_or(false, |arguments| arguments.is_empty());
                let mut aborted_now = false;
                if abort && job.aborted_by.is_none() {
                    job.aborted_by = Some(updated_by.clone());
                    aborted_now = true;
                    rebuild = true;
                }

                if rebuild {
                    scheduler::update_batches(job, graph)?;
                }
                Ok(aborted_now)
            })
            .await?;

        if aborted_now {
            info!(job_id = %job.id, aborted_by = %updated_by, "job aborted");
            self.events.send_event(JobEvent::JobAborted {
                job_id: job.id.clone(),
                aborted_by: job.aborted_by.clone(),
            });
        }
        Ok(job)
    }

    /// Apply update commands to one batch.
    ///
    /// An agent reporting `Complete` must have resolved every step first
    /// unless the batch carries an error; an `Incomplete` error re-queues
    /// whatever the agent never ran.
    pub async fn update_batch(
        &self,
        job_id: &JobId,
        batch_id: SubResourceId,
        updates: &[BatchUpdate],
    ) -> ServiceResult<Job> {
        let (job, state_change) = self
            .update_job_with(job_id, |job, graph| {
                let previous = job.batch(batch_id).map(|batch| batch.state);
                let effects = apply_batch_updates(job, batch_id, updates)?;
                if effects.rebuild {
                    scheduler::update_batches(job, graph)?;
                } else if effects.refresh {
                    scheduler::refresh_dependent_steps(job, graph);
                    scheduler::refresh_job_priority(job);
                }
                let current = job.batch(batch_id).map(|batch| batch.state);
                Ok(if current != previous { current } else { None })
            })
            .await?;

        if let Some(state) = state_change {
            self.events.send_event(JobEvent::BatchStateChanged {
                job_id: job.id.clone(),
                batch_id,
                state,
            });
        }
        Ok(job)
    }

    /// Apply update commands to one step.
    ///
    /// When the commands include a retry request, the returned location is
    /// the freshly materialized occurrence of the step's node.
    pub async fn update_step(
        &self,
        job_id: &JobId,
        batch_id: SubResourceId,
        step_id: SubResourceId,
        updates: &[StepUpdate],
    ) -> ServiceResult<(Job, Option<StepLocation>)> {
        let retried_by = updates.iter().find_map(|update| match update {
            StepUpdate::Retry { by } => Some(by.clone()),
            _ => None,
        });

        let (job, state_change) = self
            .update_job_with(job_id, |job, graph| {
                let previous = job
                    .step(batch_id, step_id)
                    .map(|step| (step.state, step.outcome));
                let effects = apply_step_updates(job, graph, batch_id, step_id, updates)?;
                if effects.rebuild {
                    scheduler::update_batches(job, graph)?;
                } else if effects.refresh {
                    scheduler::refresh_dependent_steps(job, graph);
                    scheduler::refresh_job_priority(job);
                }
                let current = job
                    .step(batch_id, step_id)
                    .map(|step| (step.state, step.outcome));
                Ok(if current != previous { current } else { None })
            })
            .await?;

        if let Some((state, outcome)) = state_change {
            self.events.send_event(JobEvent::step_state_changed(
                job.id.clone(),
                batch_id,
                step_id,
                state,
                outcome,
            ));
        }

        let location = match retried_by {
            Some(by) => {
                info!(job_id = %job.id, batch_id = %batch_id, step_id = %step_id, retried_by = %by, "step retried");
                self.events
                    .send_event(JobEvent::step_retried(job.id.clone(), batch_id, step_id, by));
                locate_retried_step(&job, batch_id, step_id)?
            }
            None => None,
        };
        Ok((job, location))
    }

    pub async fn get_step(
        &self,
        job_id: &JobId,
        batch_id: SubResourceId,
        step_id: SubResourceId,
    ) -> ServiceResult<Step> {
        let job = self.store.get(job_id).await?;
        job.step(batch_id, step_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("step {} in batch {}", step_id, batch_id)))
    }

    /// Complete a batch whose agent stopped responding
    pub async fn fail_batch(
        &self,
        job_id: &JobId,
        batch_id: SubResourceId,
        error: BatchError,
    ) -> ServiceResult<Job> {
        let (job, _) = self
            .update_job_with(job_id, |job, graph| {
                if !scheduler::fail_batch(job, graph, batch_id, error) {
                    return Err(ServiceError::not_found(format!(
                        "batch {} in job {}",
                        batch_id, job_id
                    )));
                }
                Ok(())
            })
            .await?;

        warn!(job_id = %job_id, batch_id = %batch_id, error = %error, "batch failed");
        self.events.send_event(JobEvent::BatchStateChanged {
            job_id: job.id.clone(),
            batch_id,
            state: BatchState::Complete,
        });
        Ok(job)
    }

    /// Extend the job's graph with new groups, labels, and aggregates.
    ///
    /// The current graph is never modified; a new graph sharing it as a
    /// structural prefix is registered and the job's reference advanced to
    /// it, with trailing batches created for the new groups.
    pub async fn append_groups(
        &self,
        job_id: &JobId,
        groups: Vec<GroupDefinition>,
        aggregates: Vec<AggregateDefinition>,
        labels: Vec<LabelDefinition>,
    ) -> ServiceResult<Job> {
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let mut job = self.store.get(job_id).await?;
            let previous_state = job.state();
            let graph_hash = self
                .graphs
                .append(&job.graph_hash, groups.clone(), aggregates.clone(), labels.clone())
                .await?;
            let graph = self.graphs.get(&graph_hash).await?;
            job.graph_hash = graph_hash.clone();
            scheduler::update_batches(&mut job, &graph)?;

            match self.store.try_replace(job).await? {
                Some(job) => {
                    info!(
                        job_id = %job_id,
                        graph_hash = %graph_hash,
                        groups = groups.len(),
                        "extended job graph"
                    );
                    self.events.send_event(JobEvent::GroupsAppended {
                        job_id: job.id.clone(),
                        graph_hash,
                    });
                    let state = job.state();
                    if state != previous_state {
                        self.events
                            .send_event(JobEvent::job_state_changed(job.id.clone(), state));
                    }
                    return Ok(job);
                }
                None => {
                    warn!(job_id = %job_id, attempt = attempt + 1, "graph extension lost a write race, retrying");
                }
            }
        }
        error!(job_id = %job_id, attempts = MAX_UPDATE_ATTEMPTS, "giving up on graph extension");
        Err(ServiceError::internal(format!(
            "extending job {} kept losing write races",
            job_id
        )))
    }

    /// Bind an agent lease to a ready batch. A batch holds at most one
    /// lease at a time; the external scheduler must cancel or complete the
    /// bound one before offering the batch to another agent.
    pub async fn assign_batch(
        &self,
        job_id: &JobId,
        batch_id: SubResourceId,
        agent_id: &AgentId,
        session_id: &SessionId,
        lease_id: &LeaseId,
    ) -> ServiceResult<Job> {
        let (job, _) = self
            .update_job_with(job_id, |job, _graph| {
                let batch = job.batch_mut(batch_id).ok_or_else(|| {
                    ServiceError::not_found(format!("batch {} in job {}", batch_id, job_id))
                })?;
                if batch.session_id.is_some() || batch.lease_id.is_some() {
                    return Err(ServiceError::invalid(
                        InvalidReason::LeaseAlreadyBound,
                        format!("batch {} already has a bound lease", batch_id),
                    ));
                }
                if batch.state != BatchState::Ready {
                    return Err(ServiceError::invalid(
                        InvalidReason::IllegalTransition,
                        format!("batch {} is not waiting for an agent", batch_id),
                    ));
                }
                batch.agent_id = Some(agent_id.clone());
                batch.session_id = Some(session_id.clone());
                batch.lease_id = Some(lease_id.clone());
                Ok(())
            })
            .await?;

        self.leases
            .register(Lease::new(
                lease_id.clone(),
                agent_id.clone(),
                session_id.clone(),
                LeasePayload::ExecuteBatch {
                    job_id: job_id.clone(),
                    batch_id,
                },
            ))
            .await?;
        info!(
            job_id = %job_id,
            batch_id = %batch_id,
            agent_id = %agent_id,
            lease_id = %lease_id,
            "bound lease to batch"
        );
        Ok(job)
    }

    /// Release a lease from a batch the agent never started, returning the
    /// batch to the eligible pool
    pub async fn cancel_batch_lease(
        &self,
        job_id: &JobId,
        batch_id: SubResourceId,
    ) -> ServiceResult<Job> {
        let (job, lease_id) = self
            .update_job_with(job_id, |job, _graph| {
                let batch = job.batch_mut(batch_id).ok_or_else(|| {
                    ServiceError::not_found(format!("batch {} in job {}", batch_id, job_id))
                })?;
                if batch.lease_id.is_none() {
                    return Err(ServiceError::not_found(format!(
                        "lease on batch {}",
                        batch_id
                    )));
                }
                if batch.state > BatchState::Ready {
                    return Err(ServiceError::invalid(
                        InvalidReason::IllegalTransition,
                        format!("batch {} has already started", batch_id),
                    ));
                }
                let lease_id = batch.lease_id.take();
                batch.agent_id = None;
                batch.session_id = None;
                Ok(lease_id)
            })
            .await?;

        if let Some(lease_id) = lease_id {
            self.leases.set_state(&lease_id, LeaseState::Cancelled).await?;
            info!(job_id = %job_id, batch_id = %batch_id, lease_id = %lease_id, "released lease from batch");
        }
        Ok(job)
    }

    /// Ask for the work under a lease to stop.
    ///
    /// Conformance leases are cancelled directly. Batch execution is only
    /// ever stopped cooperatively: the pending steps are resolved and the
    /// running one is flagged for the agent to observe on its next report.
    pub async fn request_cancel_lease(
        &self,
        lease_id: &LeaseId,
        by: Option<&UserId>,
    ) -> ServiceResult<()> {
        let lease = self.leases.get(lease_id).await?;
        match lease.payload {
            LeasePayload::Conform => {
                self.leases.set_state(lease_id, LeaseState::Cancelled).await?;
                info!(lease_id = %lease_id, "cancelled conform lease");
                Ok(())
            }
            LeasePayload::ExecuteBatch { job_id, batch_id } => {
                self.update_job_with(&job_id, |job, graph| {
                    let step_ids: Vec<SubResourceId> = job
                        .batch(batch_id)
                        .ok_or_else(|| {
                            ServiceError::not_found(format!(
                                "batch {} in job {}",
                                batch_id, job_id
                            ))
                        })?
                        .steps
                        .iter()
                        .filter(|step| step.state.is_pending())
                        .map(|step| step.id)
                        .collect();
                    for step_id in step_ids {
                        apply_step_updates(
                            job,
                            graph,
                            batch_id,
                            step_id,
                            &[StepUpdate::AbortRequested { by: by.cloned() }],
                        )?;
                    }
                    scheduler::refresh_dependent_steps(job, graph);
                    scheduler::refresh_job_priority(job);
                    Ok(())
                })
                .await?;
                info!(lease_id = %lease_id, job_id = %job_id, batch_id = %batch_id, "requested batch abort");
                Ok(())
            }
        }
    }

    /// Batches waiting for an agent across all jobs, most urgent first
    pub async fn eligible_batches(&self) -> Vec<(JobId, Batch)> {
        let mut eligible = Vec::new();
        for job in self.store.list().await {
            for batch in &job.batches {
                if batch.state == BatchState::Ready && batch.session_id.is_none() {
                    eligible.push((job.id.clone(), batch.clone()));
                }
            }
        }
        eligible.sort_by(|a, b| b.1.schedule_priority.cmp(&a.1.schedule_priority));
        eligible
    }

    /// The graph the job is currently executing
    pub async fn get_job_graph(&self, job_id: &JobId) -> ServiceResult<Arc<Graph>> {
        let job = self.store.get(job_id).await?;
        self.graphs.get(&job.graph_hash).await
    }

    /// Aggregate state of every label in the job's graph, in graph order
    pub async fn get_label_states(&self, job_id: &JobId) -> ServiceResult<Vec<LabelStatus>> {
        let job = self.store.get(job_id).await?;
        let graph = self.graphs.get(&job.graph_hash).await?;
        Ok(label_states(&job, &graph))
    }

    /// Aggregate state over the nodes no label covers, with their names
    pub async fn get_default_label_state(
        &self,
        job_id: &JobId,
    ) -> ServiceResult<(LabelStatus, Vec<String>)> {
        let job = self.store.get(job_id).await?;
        let graph = self.graphs.get(&job.graph_hash).await?;
        Ok(default_label_state(&job, &graph))
    }

    /// Expected timing for every step and label, from historical estimates
    pub async fn get_job_timing(&self, job_id: &JobId) -> ServiceResult<JobTiming> {
        let job = self.store.get(job_id).await?;
        let graph = self.graphs.get(&job.graph_hash).await?;

        let mut estimates: HashMap<String, StepEstimate> = HashMap::new();
        for group in &graph.groups {
            for node in &group.nodes {
                if estimates.contains_key(&node.name) {
                    continue;
                }
                if let Some(estimate) = self
                    .timing
                    .estimate(&job.stream_id, &node.name, TIMING_SAMPLE_COUNT)
                    .await
                {
                    estimates.insert(node.name.clone(), estimate);
                }
            }
        }
        Ok(compute_job_timing(&job, &graph, &estimates))
    }

    /// Run `mutate` against a fresh snapshot of the job and write the result
    /// back conditionally, repeating the whole computation whenever another
    /// writer got in first. Validation errors abort the loop immediately.
    async fn update_job_with<T, F>(&self, job_id: &JobId, mut mutate: F) -> ServiceResult<(Job, T)>
    where
        F: FnMut(&mut Job, &Graph) -> ServiceResult<T>,
    {
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let mut job = self.store.get(job_id).await?;
            let previous_state = job.state();
            let graph = self.graphs.get(&job.graph_hash).await?;
            let value = mutate(&mut job, &graph)?;

            match self.store.try_replace(job).await? {
                Some(job) => {
                    let state = job.state();
                    if state != previous_state {
                        self.events
                            .send_event(JobEvent::job_state_changed(job.id.clone(), state));
                    }
                    return Ok((job, value));
                }
                None => {
                    warn!(job_id = %job_id, attempt = attempt + 1, "job update lost a write race, retrying");
                }
            }
        }
        error!(job_id = %job_id, attempts = MAX_UPDATE_ATTEMPTS, "giving up on job update");
        Err(ServiceError::internal(format!(
            "update of job {} kept losing write races",
            job_id
        )))
    }
}
