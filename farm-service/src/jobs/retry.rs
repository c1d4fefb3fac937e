// Retry Resolution
// Finds where the next attempt at a step's node ended up after a retry,
// without any stored pointer between the two attempts

use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

use super::job::Job;
use super::types::SubResourceId;

/// Position of a step within a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLocation {
    /// Batch containing the step
    pub batch_id: SubResourceId,
    /// The step itself
    pub step_id: SubResourceId,
}

/// Locate the step that superseded the given one after a retry.
///
/// Batches are scanned in creation order starting just past the batch
/// holding the original step. Any later batch for the same group is a
/// continuation, and the first continuation step with the original's node
/// index is the retried occurrence. Returns `None` while the retry has been
/// requested but the replacement has not been materialized yet.
pub fn locate_retried_step(
    job: &Job,
    batch_id: SubResourceId,
    step_id: SubResourceId,
) -> ServiceResult<Option<StepLocation>> {
    let batch_idx = job
        .batches
        .iter()
        .position(|batch| batch.id == batch_id)
        .ok_or_else(|| ServiceError::not_found(format!("batch {} in job {}", batch_id, job.id)))?;
    let batch = &job.batches[batch_idx];
    let step = batch
        .step(step_id)
        .ok_or_else(|| ServiceError::not_found(format!("step {} in batch {}", step_id, batch_id)))?;

    let group_idx = batch.group_idx;
    let node_idx = step.node_idx;
    for later in &job.batches[batch_idx + 1..] {
        if later.group_idx != group_idx {
            continue;
        }
        if let Some(found) = later.steps.iter().find(|step| step.node_idx == node_idx) {
            return Ok(Some(StepLocation {
                batch_id: later.id,
                step_id: found.id,
            }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{build_graph, Graph, GraphHash, GroupDefinition, NodeDefinition};
    use crate::jobs::scheduler;
    use crate::jobs::types::{
        BatchState, JobId, StepOutcome, StepState, StreamId, TemplateId, UserId,
    };

    fn make_graph() -> Graph {
        build_graph(
            vec![GroupDefinition::new(
                "win64",
                vec![NodeDefinition::new("Compile"), NodeDefinition::new("Link")],
            )],
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
        scheduler::create_batches(&mut job, graph).unwrap();
        job
    }

    fn finish_batch(job: &mut Job, batch_idx: usize) {
        job.batches[batch_idx].state = BatchState::Complete;
        for step in &mut job.batches[batch_idx].steps {
            step.state = StepState::Completed;
            step.outcome = StepOutcome::Success;
        }
    }

    #[test]
    fn test_locate_finds_step_in_later_batch() {
        let graph = make_graph();
        let mut job = make_job(&graph);
        finish_batch(&mut job, 0);
        job.batches[0].steps[1].outcome = StepOutcome::Failure;

        let original_batch_id = job.batches[0].id;
        let original_step_id = job.batches[0].steps[1].id;

        job.batches[0].steps[1].retried_by = Some(UserId::new("bob"));
        scheduler::update_batches(&mut job, &graph).unwrap();

        let location = locate_retried_step(&job, original_batch_id, original_step_id)
            .unwrap()
            .unwrap();
        assert_eq!(location.batch_id, job.batches[1].id);
        assert_eq!(location.step_id, job.batches[1].steps[0].id);
        assert_ne!(location.step_id, original_step_id);
        assert_eq!(job.batches[1].steps[0].node_idx, 1);
    }

    #[test]
    fn test_locate_before_materialization_is_none() {
        let graph = make_graph();
        let mut job = make_job(&graph);
        finish_batch(&mut job, 0);

        let original_batch_id = job.batches[0].id;
        let original_step_id = job.batches[0].steps[1].id;
        job.batches[0].steps[1].retried_by = Some(UserId::new("bob"));

        // The retry has been recorded but the batch list not rebuilt yet
        let location = locate_retried_step(&job, original_batch_id, original_step_id).unwrap();
        assert_eq!(location, None);
    }

    #[test]
    fn test_locate_chains_past_continuations_without_the_node() {
        let graph = make_graph();
        let mut job = make_job(&graph);
        finish_batch(&mut job, 0);
        job.batches[0].steps[1].outcome = StepOutcome::Failure;

        let original_batch_id = job.batches[0].id;
        let compile_step_id = job.batches[0].steps[0].id;
        let link_step_id = job.batches[0].steps[1].id;

        // First retry spawns a continuation batch holding only Link, and an
        // agent starts running it
        job.batches[0].steps[1].retried_by = Some(UserId::new("bob"));
        scheduler::update_batches(&mut job, &graph).unwrap();
        job.batches[1].state = BatchState::Running;
        job.batches[1].steps[0].state = StepState::Running;

        // Retrying Compile cannot append behind Link, so it lands in a
        // second continuation batch
        job.batches[0].steps[0].retried_by = Some(UserId::new("bob"));
        scheduler::update_batches(&mut job, &graph).unwrap();
        assert_eq!(job.batches.len(), 3);

        // The Link retry resolves to the first continuation, the Compile
        // retry has to chain past it to the second
        let link_location = locate_retried_step(&job, original_batch_id, link_step_id)
            .unwrap()
            .unwrap();
        assert_eq!(link_location.batch_id, job.batches[1].id);

        let compile_location = locate_retried_step(&job, original_batch_id, compile_step_id)
            .unwrap()
            .unwrap();
        assert_eq!(compile_location.batch_id, job.batches[2].id);
        assert_eq!(job.batches[2].steps[0].node_idx, 0);
    }

    #[test]
    fn test_locate_rejects_unknown_ids() {
        let graph = make_graph();
        let job = make_job(&graph);

        let result = locate_retried_step(&job, SubResourceId(0x9999), SubResourceId(0x0001));
        assert!(matches!(result, Err(ServiceError::NotFound(_))));

        let result = locate_retried_step(&job, job.batches[0].id, SubResourceId(0x9999));
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }
}
