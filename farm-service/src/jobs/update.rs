// Step and Batch Updates
// Tagged update commands applied through a single validating entry point,
// so transition legality is checked in one place

use std::collections::HashMap;
use std::time::SystemTime;

use crate::error::{InvalidReason, ServiceError, ServiceResult};
use crate::graph::{Graph, NodeRef, Priority};

use super::job::{Job, RetriedNode};
use super::scheduler;
use super::types::{
    BatchError, BatchState, LogId, StepOutcome, StepState, SubResourceId, UserId,
};

/// A single requested change to a step
#[derive(Debug, Clone)]
pub enum StepUpdate {
    /// Move the step to a new state
    State(StepState),
    /// Record the outcome of the execution
    Outcome(StepOutcome),
    /// Ask for the step to be aborted
    AbortRequested { by: Option<UserId> },
    /// Attach the log produced for this step
    Log(LogId),
    /// Queue another attempt at the step's node
    Retry { by: UserId },
    /// Override the scheduling priority of the step's node
    Priority(Priority),
    /// Merge reported properties; a `None` value removes the key
    Properties(HashMap<String, Option<String>>),
}

/// A single requested change to a batch
#[derive(Debug, Clone)]
pub enum BatchUpdate {
    /// Attach the setup/teardown log
    Log(LogId),
    /// Move the batch to a new state
    State(BatchState),
    /// Record an abnormal stop
    Error(BatchError),
}

/// Follow-up work the caller owes after applying updates
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateEffects {
    /// The batch list must be rebuilt against the graph
    pub rebuild: bool,
    /// Dependent step states and the job priority must be recomputed
    pub refresh: bool,
}

fn is_legal_step_transition(from: StepState, to: StepState) -> bool {
    matches!(
        (from, to),
        (StepState::Waiting, StepState::Ready)
            | (StepState::Waiting, StepState::Skipped)
            | (StepState::Ready, StepState::Running)
            | (StepState::Ready, StepState::Skipped)
            | (StepState::Running, StepState::Completed)
            | (StepState::Running, StepState::Aborted)
    )
}

/// Apply a sequence of update commands to one step.
///
/// Commands are validated and applied in order; the first rejected command
/// fails the whole call, and the caller is expected to discard the job
/// snapshot. State changes are only accepted while the owning batch is
/// running.
pub fn apply_step_updates(
    job: &mut Job,
    graph: &Graph,
    batch_id: SubResourceId,
    step_id: SubResourceId,
    updates: &[StepUpdate],
) -> ServiceResult<UpdateEffects> {
    let job_id = job.id.clone();
    let batch = job
        .batch_mut(batch_id)
        .ok_or_else(|| ServiceError::not_found(format!("batch {} in job {}", batch_id, job_id)))?;
    let batch_state = batch.state;
    let group_idx = batch.group_idx;
    let step = batch
        .step_mut(step_id)
        .ok_or_else(|| ServiceError::not_found(format!("step {} in batch {}", step_id, batch_id)))?;
    let node_ref = NodeRef::new(group_idx, step.node_idx);

    let mut effects = UpdateEffects::default();
    for update in updates {
        match update {
            StepUpdate::State(new_state) => {
                if *new_state == step.state {
                    continue;
                }
                if batch_state != BatchState::Running {
                    return Err(ServiceError::invalid(
                        InvalidReason::IllegalTransition,
                        format!("batch {} is not running", batch_id),
                    ));
                }
                if !is_legal_step_transition(step.state, *new_state) {
                    return Err(ServiceError::invalid(
                        InvalidReason::IllegalTransition,
                        format!(
                            "step {} cannot move from {} to {}",
                            step_id, step.state, new_state
                        ),
                    ));
                }
                step.state = *new_state;
                match step.state {
                    StepState::Running => step.start_time = Some(SystemTime::now()),
                    StepState::Completed | StepState::Aborted => {
                        step.finish_time = Some(SystemTime::now())
                    }
                    _ => {}
                }
                effects.refresh = true;
            }
            StepUpdate::Outcome(new_outcome) => {
                if step.outcome != *new_outcome {
                    step.outcome = *new_outcome;
                    effects.refresh = true;
                }
            }
            StepUpdate::AbortRequested { by } => {
                if !step.abort_requested {
                    step.abort_requested = true;
                    effects.refresh = true;
                }
                if step.aborted_by.is_none() {
                    step.aborted_by = by.clone();
                }
                // A step no agent is executing has nobody to observe the
                // flag, so resolve it on the spot
                if step.state == StepState::Waiting || step.state == StepState::Ready {
                    step.state = StepState::Skipped;
                    step.outcome = StepOutcome::Failure;
                    effects.refresh = true;
                }
            }
            StepUpdate::Log(log_id) => {
                if step.log_id.as_ref() != Some(log_id) {
                    step.log_id = Some(log_id.clone());
                    effects.refresh = true;
                }
            }
            StepUpdate::Retry { by } => {
                if !step.state.is_terminal() {
                    return Err(ServiceError::invalid(
                        InvalidReason::IllegalTransition,
                        format!("step {} has not finished", step_id),
                    ));
                }
                if step.retried_by.is_some() {
                    let node_name = graph
                        .node(node_ref)
                        .map(|node| node.name.clone())
                        .unwrap_or_else(|| node_ref.to_string());
                    return Err(ServiceError::RetryNotAllowed(node_name));
                }
                step.retried_by = Some(by.clone());
                effects.rebuild = true;
            }
            StepUpdate::Priority(priority) => {
                if step.priority != Some(*priority) {
                    step.priority = Some(*priority);
                    effects.rebuild = true;
                }
            }
            StepUpdate::Properties(properties) => {
                for (key, value) in properties {
                    match value {
                        Some(value) => {
                            step.properties.insert(key.clone(), value.clone());
                        }
                        None => {
                            step.properties.remove(key);
                        }
                    }
                }
            }
        }
    }
    Ok(effects)
}

/// Apply a sequence of update commands to one batch.
///
/// Completion with pending steps is rejected unless the batch carries an
/// error; an `Incomplete` error requeues unstarted steps up to the per-node
/// limit and skips the rest.
pub fn apply_batch_updates(
    job: &mut Job,
    batch_id: SubResourceId,
    updates: &[BatchUpdate],
) -> ServiceResult<UpdateEffects> {
    let job_id = job.id.clone();
    let batch_idx = job
        .batches
        .iter()
        .position(|batch| batch.id == batch_id)
        .ok_or_else(|| ServiceError::not_found(format!("batch {} in job {}", batch_id, job_id)))?;

    let mut effects = UpdateEffects::default();
    for update in updates {
        let batch = &mut job.batches[batch_idx];
        match update {
            BatchUpdate::Log(log_id) => {
                if batch.log_id.as_ref() != Some(log_id) {
                    batch.log_id = Some(log_id.clone());
                }
            }
            BatchUpdate::State(new_state) => {
                if *new_state == batch.state {
                    continue;
                }
                if *new_state < batch.state {
                    return Err(ServiceError::invalid(
                        InvalidReason::IllegalTransition,
                        format!(
                            "batch {} cannot move from {} back to {}",
                            batch_id, batch.state, new_state
                        ),
                    ));
                }
                if *new_state == BatchState::Complete
                    && batch.error == BatchError::None
                    && batch.steps.iter().any(|step| step.state.is_pending())
                {
                    return Err(ServiceError::invalid(
                        InvalidReason::StepsStillActive,
                        format!("batch {} still has unfinished steps", batch_id),
                    ));
                }
                batch.state = *new_state;
                if batch.start_time.is_none() && batch.state >= BatchState::Starting {
                    batch.start_time = Some(SystemTime::now());
                }
                if batch.state == BatchState::Complete {
                    batch.finish_time = Some(SystemTime::now());
                }
                effects.refresh = true;
            }
            BatchUpdate::Error(new_error) => {
                if batch.error != *new_error {
                    batch.error = *new_error;
                    effects.refresh = true;
                }

                // An agent that gave the batch up leaves unstarted steps
                // behind; put their nodes back in the queue while the
                // per-node limit allows, and skip them once it does not
                if *new_error == BatchError::Incomplete {
                    let group_idx = batch.group_idx;
                    let requeued: Vec<RetriedNode> = batch
                        .steps
                        .iter()
                        .filter(|step| {
                            matches!(step.state, StepState::Waiting | StepState::Ready)
                        })
                        .map(|step| RetriedNode {
                            group_idx,
                            node_idx: step.node_idx,
                        })
                        .collect();
                    if !requeued.is_empty() {
                        effects.rebuild = true;
                    }
                    for retried in requeued {
                        if scheduler::can_retry_node(job, retried.node_ref()) {
                            job.retried_nodes.push(retried);
                        } else if let Some(step) =
                            job.batches[batch_idx].steps.iter_mut().find(|step| {
                                step.node_idx == retried.node_idx
                                    && matches!(step.state, StepState::Waiting | StepState::Ready)
                            })
                        {
                            step.state = StepState::Skipped;
                            step.outcome = StepOutcome::Failure;
                        }
                    }
                }
            }
        }
    }
    Ok(effects)
}
