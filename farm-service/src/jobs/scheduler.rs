// Batch Scheduler
// Derives the batch and step layout of a job from its graph and keeps
// dependent steps and batch states up to date as work completes

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};
use crate::graph::{Graph, NodeRef, Priority};

use super::job::{Batch, Job, RetriedNode, Step};
use super::types::{BatchError, BatchState, StepOutcome, StepState, SubResourceId};

/// Argument prefix selecting the nodes a job should run
pub const TARGET_ARGUMENT_PREFIX: &str = "-Target=";

/// Number of times a node may be put back in the queue automatically
/// after its batch stopped without running it
pub const MAX_NODE_RETRIES: usize = 2;

/// Populate the batches of a newly created job
pub fn create_batches(job: &mut Job, graph: &Graph) -> ServiceResult<()> {
    update_batches(job, graph)
}

/// Rebuild the batch list to match the work the job still has to do, then
/// bring dependent step states and the job priority up to date
pub fn update_batches(job: &mut Job, graph: &Graph) -> ServiceResult<()> {
    create_or_update_batches(job, graph)?;
    refresh_dependent_steps(job, graph);
    refresh_job_priority(job);
    Ok(())
}

/// Whether the given node may be requeued again after its batch gave it up
pub fn can_retry_node(job: &Job, node_ref: NodeRef) -> bool {
    job.retried_node_count(node_ref) < MAX_NODE_RETRIES
}

/// Rebuild the batch list. Preserves executed steps, drops pending work that
/// is no longer wanted, and creates fresh steps for everything that still has
/// to run, appending to unstarted batches where step ordering allows it.
fn create_or_update_batches(job: &mut Job, graph: &Graph) -> ServiceResult<()> {
    // Find the priority of each node, incorporating per-step overrides.
    // Overrides are kept separately so steps recreated below inherit them.
    let mut node_priorities: HashMap<NodeRef, Priority> = HashMap::new();
    for (group_idx, group) in graph.groups.iter().enumerate() {
        for (node_idx, node) in group.nodes.iter().enumerate() {
            node_priorities.insert(NodeRef::new(group_idx, node_idx), node.priority);
        }
    }
    let mut step_overrides: HashMap<NodeRef, Priority> = HashMap::new();
    for batch in &job.batches {
        for step in &batch.steps {
            if let Some(priority) = step.priority {
                let node_ref = NodeRef::new(batch.group_idx, step.node_idx);
                node_priorities.insert(node_ref, priority);
                step_overrides.insert(node_ref, priority);
            }
        }
    }

    // Remove any steps that have not started yet
    for batch in &mut job.batches {
        batch
            .steps
            .retain(|step| step.state != StepState::Waiting && step.state != StepState::Ready);
    }

    // Work out which nodes count as failed, and drop skipped steps whose
    // skipped state is no longer justified. A step marked for retry clears
    // its node, which in turn revives anything skipped because of it.
    let retried_nodes = job.retried_nodes.clone();
    let mut failed_nodes: HashSet<NodeRef> = HashSet::new();
    for batch in &mut job.batches {
        let group_idx = batch.group_idx;
        for step in &batch.steps {
            let node_ref = NodeRef::new(group_idx, step.node_idx);
            if step.retried_by.is_some() {
                failed_nodes.remove(&node_ref);
            } else if step.state == StepState::Skipped {
                let dependency_failed = graph
                    .node(node_ref)
                    .map(|node| {
                        node.input_dependencies
                            .iter()
                            .any(|dependency| failed_nodes.contains(dependency))
                    })
                    .unwrap_or(false);
                let requeue_exhausted = retry_count(&retried_nodes, node_ref) >= MAX_NODE_RETRIES;
                if dependency_failed || requeue_exhausted {
                    failed_nodes.insert(node_ref);
                } else {
                    failed_nodes.remove(&node_ref);
                }
            } else if step.outcome == StepOutcome::Failure {
                failed_nodes.insert(node_ref);
            } else {
                failed_nodes.remove(&node_ref);
            }
        }
        batch.steps.retain(|step| {
            step.state != StepState::Skipped
                || failed_nodes.contains(&NodeRef::new(group_idx, step.node_idx))
        });
    }

    // Remove any batches which are now empty
    job.batches
        .retain(|batch| !batch.steps.is_empty() || batch.error != BatchError::None);

    // Work out the set of nodes the job should execute. An aborted job
    // executes nothing; a job without explicit targets executes everything.
    let mut new_nodes: HashSet<NodeRef> = HashSet::new();
    if job.aborted_by.is_none() {
        let mut targets: HashSet<String> = HashSet::new();
        for argument in &job.arguments {
            // Compare the prefix on bytes; arguments are free-form and a
            // byte-indexed str slice would panic inside a multi-byte char.
            // A matched prefix is pure ASCII, so slicing past it is safe.
            if argument
                .as_bytes()
                .get(..TARGET_ARGUMENT_PREFIX.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(TARGET_ARGUMENT_PREFIX.as_bytes()))
            {
                targets.extend(
                    argument[TARGET_ARGUMENT_PREFIX.len()..]
                        .split(';')
                        .filter(|name| !name.is_empty())
                        .map(|name| name.to_lowercase()),
                );
            }
        }

        if targets.is_empty() {
            for (group_idx, group) in graph.groups.iter().enumerate() {
                for node_idx in 0..group.nodes.len() {
                    new_nodes.insert(NodeRef::new(group_idx, node_idx));
                }
            }
        } else {
            for aggregate in &graph.aggregates {
                if targets.contains(&aggregate.name.to_lowercase()) {
                    new_nodes.extend(aggregate.nodes.iter().copied());
                }
            }
            for (group_idx, group) in graph.groups.iter().enumerate() {
                for (node_idx, node) in group.nodes.iter().enumerate() {
                    if targets.contains(&node.name.to_lowercase()) {
                        new_nodes.insert(NodeRef::new(group_idx, node_idx));
                    }
                }
            }
        }
    }

    // Pull in the dependencies of everything selected. Dependencies always
    // point at earlier nodes, so one reverse pass closes the set.
    for group_idx in (0..graph.groups.len()).rev() {
        for node_idx in (0..graph.groups[group_idx].nodes.len()).rev() {
            let node_ref = NodeRef::new(group_idx, node_idx);
            if new_nodes.contains(&node_ref) {
                if let Some(node) = graph.node(node_ref) {
                    new_nodes.extend(node.input_dependencies.iter().copied());
                }
            }
        }
    }

    // Cancel batches which have been picked up but are no longer required
    for batch in &mut job.batches {
        if batch.state == BatchState::Starting || batch.state == BatchState::Running {
            let group_idx = batch.group_idx;
            let still_needed = batch
                .steps
                .iter()
                .any(|step| new_nodes.contains(&NodeRef::new(group_idx, step.node_idx)));
            if !still_needed {
                batch.error = BatchError::Cancelled;
            }
        }
    }

    // Remove the nodes which already have a surviving execution
    for batch in &job.batches {
        for step in &batch.steps {
            let executed = match step.state {
                StepState::Running | StepState::Completed | StepState::Aborted => {
                    step.retried_by.is_none()
                }
                StepState::Skipped => true,
                _ => false,
            };
            if executed {
                new_nodes.remove(&NodeRef::new(batch.group_idx, step.node_idx));
            }
        }
    }

    // Nodes with dependencies in their own group need those dependencies to
    // run on the same agent, so re-add them even if they ran before
    for group_idx in (0..graph.groups.len()).rev() {
        for node_idx in (0..graph.groups[group_idx].nodes.len()).rev() {
            let node_ref = NodeRef::new(group_idx, node_idx);
            if new_nodes.contains(&node_ref) {
                if let Some(node) = graph.node(node_ref) {
                    for dependency in &node.input_dependencies {
                        if dependency.group_idx == group_idx {
                            new_nodes.insert(*dependency);
                        }
                    }
                }
            }
        }
    }

    // Nodes which still have a step in some batch
    let mut existing_nodes: HashSet<NodeRef> = HashSet::new();
    for batch in &job.batches {
        for step in &batch.steps {
            existing_nodes.insert(NodeRef::new(batch.group_idx, step.node_idx));
        }
    }

    // Figure out the batch each group can still append to
    let mut append_to_batches: Vec<Option<usize>> = vec![None; graph.groups.len()];
    for (batch_idx, batch) in job.batches.iter().enumerate() {
        if batch.can_be_appended_to() {
            append_to_batches[batch.group_idx] = Some(batch_idx);
        }
    }

    // Invalidate groups where a new node would land before the batch's last
    // step; step order within a batch must follow node order
    for group_idx in 0..graph.groups.len() {
        for node_idx in 0..graph.groups[group_idx].nodes.len() {
            let node_ref = NodeRef::new(group_idx, node_idx);
            if new_nodes.contains(&node_ref) && !existing_nodes.contains(&node_ref) {
                if let Some(batch_idx) = append_to_batches[group_idx] {
                    if let Some(last_step) = job.batches[batch_idx].steps.last() {
                        if node_idx < last_step.node_idx {
                            append_to_batches[group_idx] = None;
                        }
                    }
                }
            }
        }
    }

    // Create the new steps
    for group_idx in 0..graph.groups.len() {
        for node_idx in 0..graph.groups[group_idx].nodes.len() {
            let node_ref = NodeRef::new(group_idx, node_idx);
            if !new_nodes.contains(&node_ref) {
                continue;
            }
            let batch_idx = match append_to_batches[group_idx] {
                Some(batch_idx) => batch_idx,
                None => {
                    let batch_id = job.allocate_sub_resource_id();
                    job.batches.push(Batch::new(batch_id, group_idx));
                    let batch_idx = job.batches.len() - 1;
                    append_to_batches[group_idx] = Some(batch_idx);
                    batch_idx
                }
            };
            let needs_step = match job.batches[batch_idx].steps.last() {
                Some(last_step) => node_idx > last_step.node_idx,
                None => true,
            };
            if needs_step {
                let step_id = job.allocate_sub_resource_id();
                let mut step = Step::new(step_id, node_idx);
                step.priority = step_overrides.get(&node_ref).copied();
                job.batches[batch_idx].steps.push(step);
            }
        }
    }

    // Propagate priorities onto dependencies so urgent work does not sit
    // behind low priority prerequisites
    for group_idx in (0..graph.groups.len()).rev() {
        for node_idx in (0..graph.groups[group_idx].nodes.len()).rev() {
            let node_ref = NodeRef::new(group_idx, node_idx);
            let node_priority = match node_priorities.get(&node_ref) {
                Some(priority) => *priority,
                None => continue,
            };
            if let Some(node) = graph.node(node_ref) {
                for dependency in &node.order_dependencies {
                    if let Some(dependency_priority) = node_priorities.get_mut(dependency) {
                        if *dependency_priority < node_priority {
                            *dependency_priority = node_priority;
                        }
                    }
                }
            }
        }
    }
    for batch in &mut job.batches {
        if !batch.steps.is_empty() {
            let group_idx = batch.group_idx;
            let node_priority = batch
                .steps
                .iter()
                .filter_map(|step| node_priorities.get(&NodeRef::new(group_idx, step.node_idx)))
                .max()
                .copied()
                .unwrap_or_default();
            // Reserve zero for batches with nothing to schedule
            batch.schedule_priority = job.priority.weight() * 10 + node_priority.weight() + 1;
        }
    }

    // A node that forbids retries must never end up with two steps
    let mut execution_counts: HashMap<NodeRef, usize> = HashMap::new();
    for batch in &job.batches {
        for step in &batch.steps {
            let node_ref = NodeRef::new(batch.group_idx, step.node_idx);
            let count = execution_counts.entry(node_ref).or_insert(0);
            if *count > 0 {
                if let Some(node) = graph.node(node_ref) {
                    if !node.allow_retry {
                        return Err(ServiceError::RetryNotAllowed(node.name.clone()));
                    }
                }
            }
            *count += 1;
        }
    }

    Ok(())
}

fn retry_count(retried_nodes: &[RetriedNode], node_ref: NodeRef) -> usize {
    retried_nodes
        .iter()
        .filter(|retried| retried.node_ref() == node_ref)
        .count()
}

/// Snapshot of a step used while evaluating dependencies
#[derive(Clone, Copy)]
struct StepSnapshot {
    state: StepState,
    outcome: StepOutcome,
    finish_time: Option<SystemTime>,
}

impl StepSnapshot {
    fn is_failed_or_skipped(&self) -> bool {
        self.state == StepState::Skipped || self.outcome == StepOutcome::Failure
    }
}

/// Move steps out of the waiting state once their dependencies resolve, skip
/// them when a dependency failed, and recompute pending batch states
pub fn refresh_dependent_steps(job: &mut Job, graph: &Graph) {
    let job_id = job.id.clone();
    let create_time = job.create_time;

    let mut step_for_node: HashMap<NodeRef, StepSnapshot> = HashMap::new();
    for batch_idx in 0..job.batches.len() {
        let batch_id = job.batches[batch_idx].id;
        let group_idx = job.batches[batch_idx].group_idx;

        for step_idx in 0..job.batches[batch_idx].steps.len() {
            let node_ref = NodeRef::new(group_idx, job.batches[batch_idx].steps[step_idx].node_idx);

            let (step_id, state, outcome) = {
                let step = &job.batches[batch_idx].steps[step_idx];
                (step.id, step.state, step.outcome)
            };

            let mut new_state = state;
            let mut new_outcome = outcome;
            if state == StepState::Waiting {
                if let Some(node) = graph.node(node_ref) {
                    let dependencies: Vec<StepSnapshot> = node
                        .order_dependencies
                        .iter()
                        .filter_map(|dependency| step_for_node.get(dependency).copied())
                        .collect();
                    if dependencies
                        .iter()
                        .any(|snapshot| snapshot.is_failed_or_skipped())
                    {
                        new_state = StepState::Skipped;
                        new_outcome = StepOutcome::Failure;
                    } else if !dependencies
                        .iter()
                        .any(|snapshot| snapshot.state.is_pending())
                    {
                        debug!(
                            job_id = %job_id,
                            batch_id = %batch_id,
                            step_id = %step_id,
                            "step dependencies satisfied, transitioning to ready"
                        );
                        new_state = StepState::Ready;
                    }
                }
            }

            let step = &mut job.batches[batch_idx].steps[step_idx];
            step.state = new_state;
            step.outcome = new_outcome;
            step_for_node.insert(
                node_ref,
                StepSnapshot {
                    state: step.state,
                    outcome: step.outcome,
                    finish_time: step.finish_time,
                },
            );
        }

        let batch_state = job.batches[batch_idx].state;
        if batch_state == BatchState::Waiting || batch_state == BatchState::Ready {
            let (new_state, new_ready_time) = {
                let batch = &job.batches[batch_idx];
                next_batch_state(create_time, graph, batch, &step_for_node)
            };
            let batch = &mut job.batches[batch_idx];
            batch.state = new_state;
            batch.ready_time = new_ready_time;
        }
    }
}

/// Compute the state of a batch that has not been picked up yet
fn next_batch_state(
    create_time: SystemTime,
    graph: &Graph,
    batch: &Batch,
    step_for_node: &HashMap<NodeRef, StepSnapshot>,
) -> (BatchState, Option<SystemTime>) {
    if batch.steps.iter().all(|step| step.state.is_terminal()) {
        return (BatchState::Complete, batch.ready_time);
    }

    // Dependencies on nodes that are not scheduled do not hold the batch up
    let mut ready_time = create_time;
    for dependency in batch.start_dependencies(graph) {
        if let Some(snapshot) = step_for_node.get(&dependency) {
            if !snapshot.state.is_terminal() {
                return (BatchState::Waiting, None);
            }
            if let Some(finish_time) = snapshot.finish_time {
                if finish_time > ready_time {
                    ready_time = finish_time;
                }
            }
        }
    }
    (BatchState::Ready, Some(ready_time))
}

/// Highest schedule priority across batches waiting for an agent
pub fn schedule_priority(job: &Job) -> i32 {
    job.batches
        .iter()
        .filter(|batch| batch.state == BatchState::Ready)
        .map(|batch| batch.schedule_priority)
        .max()
        .unwrap_or(0)
}

/// Update the job's weighted priority from its ready batches
pub fn refresh_job_priority(job: &mut Job) {
    job.schedule_priority = schedule_priority(job);
}

/// Complete a batch whose agent stopped responding. Running steps are
/// aborted, anything that never started is skipped.
pub fn fail_batch(job: &mut Job, graph: &Graph, batch_id: SubResourceId, error: BatchError) -> bool {
    let batch = match job.batch_mut(batch_id) {
        Some(batch) => batch,
        None => return false,
    };

    if batch.state != BatchState::Complete {
        batch.state = BatchState::Complete;
        batch.error = error;
        batch.finish_time = Some(SystemTime::now());
    }

    for step in &mut batch.steps {
        match step.state {
            StepState::Running => {
                step.state = StepState::Aborted;
                step.outcome = StepOutcome::Failure;
                step.finish_time = Some(SystemTime::now());
            }
            StepState::Ready | StepState::Waiting => {
                step.state = StepState::Skipped;
                step.outcome = StepOutcome::Failure;
            }
            _ => {}
        }
    }

    refresh_dependent_steps(job, graph);
    refresh_job_priority(job);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{build_graph, GraphHash, GroupDefinition, NodeDefinition};
    use crate::jobs::types::{JobId, StreamId, TemplateId, UserId};

    fn make_graph() -> Graph {
        build_graph(
            vec![
                GroupDefinition::new(
                    "win64",
                    vec![
                        NodeDefinition::new("Compile"),
                        NodeDefinition::new("Cook").with_inputs(vec!["Compile".to_string()]),
                        NodeDefinition::new("Stage"),
                    ],
                ),
                GroupDefinition::new(
                    "tester",
                    vec![NodeDefinition::new("Test").with_inputs(vec!["Cook".to_string()])],
                ),
            ],
            vec![],
            vec![],
        )
        .unwrap()
    }

    fn make_job(graph: &Graph) -> Job {
        let mut job = Job::new(
            JobId::new("job-1"),
            StreamId::new("ue5-main"),
            TemplateId::new("incremental"),
            GraphHash::new("abc123"),
            "Test Job",
            1000,
        );
        create_batches(&mut job, graph).unwrap();
        job
    }

    fn step_states(job: &Job, batch_idx: usize) -> Vec<StepState> {
        job.batches[batch_idx]
            .steps
            .iter()
            .map(|step| step.state)
            .collect()
    }

    #[test]
    fn test_create_batches_one_per_group() {
        let graph = make_graph();
        let job = make_job(&graph);

        assert_eq!(job.batches.len(), 2);
        assert_eq!(job.batches[0].group_idx, 0);
        assert_eq!(job.batches[0].steps.len(), 3);
        assert_eq!(job.batches[1].group_idx, 1);
        assert_eq!(job.batches[1].steps.len(), 1);

        // Steps follow node order within each batch
        let node_indices: Vec<usize> =
            job.batches[0].steps.iter().map(|step| step.node_idx).collect();
        assert_eq!(node_indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_first_batch_is_ready() {
        let graph = make_graph();
        let job = make_job(&graph);

        // Group 0 has no external dependencies; group 1 waits on Cook
        assert_eq!(job.batches[0].state, BatchState::Ready);
        assert!(job.batches[0].ready_time.is_some());
        assert_eq!(job.batches[1].state, BatchState::Waiting);
        assert_eq!(job.batches[1].ready_time, None);

        // Compile and Stage can run immediately, Cook waits on Compile
        assert_eq!(
            step_states(&job, 0),
            vec![StepState::Ready, StepState::Waiting, StepState::Ready]
        );
        assert_eq!(step_states(&job, 1), vec![StepState::Waiting]);
    }

    #[test]
    fn test_targets_select_dependency_closure() {
        let graph = make_graph();
        let mut job = Job::new(
            JobId::new("job-1"),
            StreamId::new("ue5-main"),
            TemplateId::new("incremental"),
            GraphHash::new("abc123"),
            "Test Job",
            1000,
        )
        .with_arguments(vec!["-Target=Cook".to_string()]);
        create_batches(&mut job, &graph).unwrap();

        // Cook plus its Compile dependency; Stage and Test are not wanted
        assert_eq!(job.batches.len(), 1);
        let node_indices: Vec<usize> =
            job.batches[0].steps.iter().map(|step| step.node_idx).collect();
        assert_eq!(node_indices, vec![0, 1]);
    }

    #[test]
    fn test_non_ascii_argument_is_not_a_target() {
        let graph = make_graph();
        let mut job = Job::new(
            JobId::new("job-1"),
            StreamId::new("ue5-main"),
            TemplateId::new("incremental"),
            GraphHash::new("abc123"),
            "Test Job",
            1000,
        )
        // A multi-byte char straddles the prefix length; the compare must
        // not slice into it
        .with_arguments(vec!["1234567π".to_string()]);
        create_batches(&mut job, &graph).unwrap();

        // Not a target selector, so the whole graph is scheduled
        assert_eq!(job.batches.len(), 2);
        assert_eq!(job.batches[0].steps.len(), 3);
        assert_eq!(job.batches[1].steps.len(), 1);
    }

    #[test]
    fn test_step_failure_skips_dependents() {
        let graph = make_graph();
        let mut job = make_job(&graph);

        job.batches[0].state = BatchState::Running;
        let step = &mut job.batches[0].steps[0];
        step.state = StepState::Completed;
        step.outcome = StepOutcome::Failure;
        step.finish_time = Some(SystemTime::now());
        refresh_dependent_steps(&mut job, &graph);

        // Cook is skipped because Compile failed, and Test follows suit
        assert_eq!(job.batches[0].steps[1].state, StepState::Skipped);
        assert_eq!(job.batches[0].steps[1].outcome, StepOutcome::Failure);
        assert_eq!(job.batches[1].steps[0].state, StepState::Skipped);

        // Stage has no dependency on Compile and stays runnable
        assert_eq!(job.batches[0].steps[2].state, StepState::Ready);
    }

    #[test]
    fn test_retry_requeues_skipped_dependents() {
        let graph = make_graph();
        let mut job = make_job(&graph);

        // Compile fails, Cook and Test get skipped, the batch completes
        job.batches[0].state = BatchState::Running;
        for step in &mut job.batches[0].steps {
            step.state = StepState::Completed;
            step.outcome = StepOutcome::Success;
            step.finish_time = Some(SystemTime::now());
        }
        job.batches[0].steps[0].outcome = StepOutcome::Failure;
        job.batches[0].steps[1].state = StepState::Skipped;
        job.batches[0].steps[1].outcome = StepOutcome::Failure;
        job.batches[0].state = BatchState::Complete;
        refresh_dependent_steps(&mut job, &graph);
        assert_eq!(job.batches[1].steps[0].state, StepState::Skipped);
        job.batches[1].state = BatchState::Complete;

        let original_compile_id = job.batches[0].steps[0].id;

        // Retrying Compile produces a new batch with fresh Compile and Cook
        // steps, and Test gets a new batch as well. The emptied original
        // Test batch disappears.
        job.batches[0].steps[0].retried_by = Some(UserId::new("bob"));
        update_batches(&mut job, &graph).unwrap();

        assert_eq!(job.batches.len(), 3);
        let retry_batch = &job.batches[1];
        assert_eq!(retry_batch.group_idx, 0);
        let node_indices: Vec<usize> =
            retry_batch.steps.iter().map(|step| step.node_idx).collect();
        assert_eq!(node_indices, vec![0, 1]);
        assert_ne!(retry_batch.steps[0].id, original_compile_id);
        assert_eq!(retry_batch.steps[0].state, StepState::Ready);
        assert_eq!(retry_batch.steps[1].state, StepState::Waiting);
        assert_eq!(job.batches[2].group_idx, 1);
        assert_eq!(job.batches[2].steps[0].state, StepState::Waiting);
    }

    #[test]
    fn test_retry_not_allowed_for_single_run_nodes() {
        let graph = build_graph(
            vec![GroupDefinition::new(
                "win64",
                vec![NodeDefinition::new("Publish").with_allow_retry(false)],
            )],
            vec![],
            vec![],
        )
        .unwrap();
        let mut job = make_job(&graph);

        job.batches[0].state = BatchState::Running;
        let step = &mut job.batches[0].steps[0];
        step.state = StepState::Completed;
        step.outcome = StepOutcome::Failure;
        job.batches[0].state = BatchState::Complete;

        job.batches[0].steps[0].retried_by = Some(UserId::new("bob"));
        let result = update_batches(&mut job, &graph);
        assert!(matches!(result, Err(ServiceError::RetryNotAllowed(name)) if name == "Publish"));
    }

    #[test]
    fn test_abort_discards_pending_work() {
        let graph = make_graph();
        let mut job = make_job(&graph);

        // The first batch is mid-execution when the job is aborted
        job.batches[0].state = BatchState::Running;
        job.batches[0].steps[0].state = StepState::Running;

        job.aborted_by = Some(UserId::new("bob"));
        update_batches(&mut job, &graph).unwrap();

        // Pending batches disappear, the running batch is flagged for cancel
        assert_eq!(job.batches.len(), 1);
        assert_eq!(job.batches[0].error, BatchError::Cancelled);
    }

    #[test]
    fn test_schedule_priority_follows_ready_batches() {
        let graph = make_graph();
        let mut job = make_job(&graph);

        // job priority Normal (3), max node priority Normal (3)
        assert_eq!(job.batches[0].schedule_priority, 34);
        assert_eq!(job.schedule_priority, 34);

        // Once nothing is ready the job drops out of the queue
        job.batches[0].state = BatchState::Running;
        refresh_job_priority(&mut job);
        assert_eq!(job.schedule_priority, 0);
    }

    #[test]
    fn test_priority_override_propagates_to_dependencies() {
        let graph = make_graph();
        let mut job = make_job(&graph);

        // Bump Test to highest; its whole dependency chain should follow
        job.batches[1].steps[0].priority = Some(Priority::Highest);
        update_batches(&mut job, &graph).unwrap();

        // Batch 0 contains Compile and Cook, both pulled up to Highest
        assert_eq!(job.batches[0].schedule_priority, 3 * 10 + 5 + 1);
        assert_eq!(job.batches[1].schedule_priority, 3 * 10 + 5 + 1);

        // The override survives the rebuild, so a later one computes the same
        assert_eq!(job.batches[1].steps[0].priority, Some(Priority::Highest));
        update_batches(&mut job, &graph).unwrap();
        assert_eq!(job.batches[0].schedule_priority, 3 * 10 + 5 + 1);
    }

    #[test]
    fn test_fail_batch_aborts_running_steps() {
        let graph = make_graph();
        let mut job = make_job(&graph);

        job.batches[0].state = BatchState::Running;
        job.batches[0].steps[0].state = StepState::Running;

        let batch_id = job.batches[0].id;
        assert!(fail_batch(&mut job, &graph, batch_id, BatchError::LostConnection));

        let batch = &job.batches[0];
        assert_eq!(batch.state, BatchState::Complete);
        assert_eq!(batch.error, BatchError::LostConnection);
        assert_eq!(batch.steps[0].state, StepState::Aborted);
        assert_eq!(batch.steps[0].outcome, StepOutcome::Failure);
        assert_eq!(batch.steps[1].state, StepState::Skipped);
        assert_eq!(batch.steps[2].state, StepState::Skipped);

        // The downstream batch is skipped through the usual dependency pass
        assert_eq!(job.batches[1].steps[0].state, StepState::Skipped);
    }
}
