// Timing Estimation
// Projects expected per-step and per-label completion times from
// historical estimates supplied by an external collaborator

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::graph::{Graph, NodeRef};

use super::job::Job;
use super::types::{StreamId, SubResourceId};

/// Historical averages for one node, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEstimate {
    /// Average time the containing batch waited for an agent
    pub average_wait_time: f32,
    /// Average workspace setup time before the step ran
    pub average_init_time: f32,
    /// Average execution time
    pub average_duration: f32,
}

/// Expected cumulative timing at one point in the job.
///
/// A `None` component means the value cannot be predicted because some
/// step on the path to this point has no history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingInfo {
    /// Wait time on the critical path
    pub total_wait_time: Option<f32>,
    /// Setup time on the critical path
    pub total_init_time: Option<f32>,
    /// Expected elapsed time until this point completes
    pub total_time_to_complete: Option<f32>,
}

fn max_option(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

impl TimingInfo {
    /// Starting point for accumulation along a batch
    pub fn zero() -> Self {
        Self {
            total_wait_time: Some(0.0),
            total_init_time: Some(0.0),
            total_time_to_complete: Some(0.0),
        }
    }

    /// Take the later of this point and another, component by component.
    /// A step cannot finish before its slowest dependency.
    pub fn wait_for(&mut self, other: &TimingInfo) {
        self.total_wait_time = max_option(self.total_wait_time, other.total_wait_time);
        self.total_init_time = max_option(self.total_init_time, other.total_init_time);
        self.total_time_to_complete =
            max_option(self.total_time_to_complete, other.total_time_to_complete);
    }

    /// Push this point past one more step's expected cost
    pub fn add_step(&mut self, estimate: Option<&StepEstimate>) {
        match estimate {
            Some(estimate) => {
                self.total_wait_time =
                    self.total_wait_time.map(|value| value + estimate.average_wait_time);
                self.total_init_time =
                    self.total_init_time.map(|value| value + estimate.average_init_time);
                self.total_time_to_complete = self
                    .total_time_to_complete
                    .map(|value| value + estimate.average_duration);
            }
            None => {
                self.total_wait_time = None;
                self.total_init_time = None;
                self.total_time_to_complete = None;
            }
        }
    }
}

/// Expected timing for a whole job
#[derive(Debug, Clone, Default)]
pub struct JobTiming {
    /// Cumulative timing at each step
    pub steps: HashMap<SubResourceId, TimingInfo>,
    /// Aggregate timing per label, in graph label order
    pub labels: Vec<TimingInfo>,
}

/// Supplies historical timing for nodes in a stream. The implementation
/// lives outside this crate; estimates are consumed as opaque averages.
#[async_trait]
pub trait TimingEstimator: Send + Sync {
    async fn estimate(
        &self,
        stream_id: &StreamId,
        node_name: &str,
        sample_count: usize,
    ) -> Option<StepEstimate>;
}

/// Estimator with no history at all
pub struct NullTimingEstimator;

#[async_trait]
impl TimingEstimator for NullTimingEstimator {
    async fn estimate(&self, _: &StreamId, _: &str, _: usize) -> Option<StepEstimate> {
        None
    }
}

/// Estimator backed by a fixed table, keyed by node name
#[derive(Default)]
pub struct FixedTimingEstimator {
    estimates: HashMap<String, StepEstimate>,
}

impl FixedTimingEstimator {
    pub fn new(estimates: HashMap<String, StepEstimate>) -> Self {
        Self { estimates }
    }
}

#[async_trait]
impl TimingEstimator for FixedTimingEstimator {
    async fn estimate(&self, _: &StreamId, node_name: &str, _: usize) -> Option<StepEstimate> {
        self.estimates.get(node_name).copied()
    }
}

/// Compute expected timing for every step and label of a job.
///
/// Steps within a batch run back to back on one agent, so their costs
/// accumulate; across batches a step starts no earlier than its slowest
/// dependency. Labels finish with the latest of their included nodes.
pub fn compute_job_timing(
    job: &Job,
    graph: &Graph,
    estimates: &HashMap<String, StepEstimate>,
) -> JobTiming {
    let mut node_timings: HashMap<NodeRef, TimingInfo> = HashMap::new();
    let mut step_timings: HashMap<SubResourceId, TimingInfo> = HashMap::new();

    for batch in &job.batches {
        let mut current = TimingInfo::zero();
        for step in &batch.steps {
            let node_ref = NodeRef::new(batch.group_idx, step.node_idx);
            if let Some(node) = graph.node(node_ref) {
                for dependency in &node.order_dependencies {
                    if let Some(timing) = node_timings.get(dependency) {
                        current.wait_for(timing);
                    }
                }
                current.add_step(estimates.get(&node.name));
            }
            step_timings.insert(step.id, current);
            node_timings.insert(node_ref, current);
        }
    }

    let labels = graph
        .labels
        .iter()
        .map(|label| {
            let mut any = false;
            let mut timing = TimingInfo::zero();
            for node_ref in &label.included_nodes {
                if let Some(node_timing) = node_timings.get(node_ref) {
                    timing.wait_for(node_timing);
                    any = true;
                }
            }
            if any {
                timing
            } else {
                TimingInfo::default()
            }
        })
        .collect();

    JobTiming {
        steps: step_timings,
        labels,
    }
}
