// Label Aggregation
// Rolls per-node step results up into the published label states

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::graph::{Graph, NodeRef};

use super::job::Job;
use super::types::{LabelOutcome, LabelState, StepOutcome};

/// Aggregate state of one label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelStatus {
    pub state: LabelState,
    pub outcome: LabelOutcome,
}

impl LabelStatus {
    fn unspecified() -> Self {
        Self {
            state: LabelState::Unspecified,
            outcome: LabelOutcome::Unspecified,
        }
    }
}

fn to_label_outcome(outcome: StepOutcome) -> LabelOutcome {
    match outcome {
        StepOutcome::Failure => LabelOutcome::Failure,
        StepOutcome::Warnings => LabelOutcome::Warnings,
        StepOutcome::Success | StepOutcome::Unspecified => LabelOutcome::Success,
    }
}

/// Compute the aggregate state of every label in the graph.
///
/// Each included node contributes its latest step. A label with none of its
/// required nodes scheduled is unspecified; one whose included nodes are all
/// finished reports the worst outcome among them, and until then it reports
/// running with no final outcome.
pub fn label_states(job: &Job, graph: &Graph) -> Vec<LabelStatus> {
    // Latest step per node; later batches supersede earlier attempts
    let mut node_steps: HashMap<NodeRef, (bool, StepOutcome)> = HashMap::new();
    for batch in &job.batches {
        for step in &batch.steps {
            node_steps.insert(
                NodeRef::new(batch.group_idx, step.node_idx),
                (step.state.is_terminal(), step.outcome),
            );
        }
    }

    graph
        .labels
        .iter()
        .map(|label| {
            let scheduled = label
                .required_nodes
                .iter()
                .any(|node_ref| node_steps.contains_key(node_ref));
            if !scheduled {
                return LabelStatus::unspecified();
            }

            let mut outcome = StepOutcome::Success;
            let mut complete = true;
            for node_ref in &label.included_nodes {
                if let Some((terminal, step_outcome)) = node_steps.get(node_ref) {
                    if *terminal {
                        outcome = outcome.worst(*step_outcome);
                    } else {
                        complete = false;
                    }
                }
            }

            if complete {
                LabelStatus {
                    state: LabelState::Complete,
                    outcome: to_label_outcome(outcome),
                }
            } else {
                LabelStatus {
                    state: LabelState::Running,
                    outcome: LabelOutcome::Unspecified,
                }
            }
        })
        .collect()
}

/// Aggregate state over every node that no label claims, so jobs without
/// full label coverage still report an overall status
pub fn default_label_state(job: &Job, graph: &Graph) -> (LabelStatus, Vec<String>) {
    let mut labelled: Vec<NodeRef> = Vec::new();
    for label in &graph.labels {
        labelled.extend(label.included_nodes.iter().copied());
    }

    let mut node_steps: HashMap<NodeRef, (bool, StepOutcome)> = HashMap::new();
    for batch in &job.batches {
        for step in &batch.steps {
            node_steps.insert(
                NodeRef::new(batch.group_idx, step.node_idx),
                (step.state.is_terminal(), step.outcome),
            );
        }
    }

    let mut names = Vec::new();
    let mut outcome = StepOutcome::Success;
    let mut complete = true;
    let mut any = false;
    for (group_idx, group) in graph.groups.iter().enumerate() {
        for (node_idx, node) in group.nodes.iter().enumerate() {
            let node_ref = NodeRef::new(group_idx, node_idx);
            if labelled.contains(&node_ref) {
                continue;
            }
            if let Some((terminal, step_outcome)) = node_steps.get(&node_ref) {
                any = true;
                names.push(node.name.clone());
                if *terminal {
                    outcome = outcome.worst(*step_outcome);
                } else {
                    complete = false;
                }
            }
        }
    }

    let status = if !any {
        LabelStatus::unspecified()
    } else if complete {
        LabelStatus {
            state: LabelState::Complete,
            outcome: to_label_outcome(outcome),
        }
    } else {
        LabelStatus {
            state: LabelState::Running,
            outcome: LabelOutcome::Unspecified,
        }
    };
    (status, names)
}
