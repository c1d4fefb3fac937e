// Job Documents
// Jobs and their batches and steps, with runtime bookkeeping

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use crate::graph::{Graph, GraphHash, NodeRef, Priority};

use super::types::{
    AgentId, BatchError, BatchState, JobId, JobState, LeaseId, LogId, SessionId, StepOutcome,
    StepState, StreamId, SubResourceId, TemplateId, UserId,
};

/// A single node execution within a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Identifier of the step, unique within the job
    pub id: SubResourceId,
    /// Index of the node in the batch's group
    pub node_idx: usize,
    /// Current execution state
    pub state: StepState,
    /// Outcome of the execution
    pub outcome: StepOutcome,
    /// Log produced by the agent while running this step
    #[serde(default)]
    pub log_id: Option<LogId>,
    /// Time at which the step started executing
    #[serde(default)]
    pub start_time: Option<SystemTime>,
    /// Time at which the step finished executing
    #[serde(default)]
    pub finish_time: Option<SystemTime>,
    /// Whether a user has asked for this step to be aborted
    #[serde(default)]
    pub abort_requested: bool,
    /// User that requested the abort
    #[serde(default)]
    pub aborted_by: Option<UserId>,
    /// User that requested this step be retried, if any
    #[serde(default)]
    pub retried_by: Option<UserId>,
    /// Overrides the node's priority when set
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Arbitrary key/value annotations reported by the agent
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Step {
    pub fn new(id: SubResourceId, node_idx: usize) -> Self {
        Self {
            id,
            node_idx,
            state: StepState::Waiting,
            outcome: StepOutcome::Unspecified,
            log_id: None,
            start_time: None,
            finish_time: None,
            abort_requested: false,
            aborted_by: None,
            retried_by: None,
            priority: None,
            properties: HashMap::new(),
        }
    }

    /// Whether the step still counts towards the work of its batch
    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }
}

/// A group of steps executed together on a single agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// Identifier of the batch, unique within the job
    pub id: SubResourceId,
    /// Index of the node group this batch executes from
    pub group_idx: usize,
    /// Current state
    pub state: BatchState,
    /// Error condition, if the batch stopped abnormally
    #[serde(default)]
    pub error: BatchError,
    /// Steps in execution order
    pub steps: Vec<Step>,
    /// Effective priority used when matching the batch to agents
    #[serde(default)]
    pub schedule_priority: i32,
    /// Pool of agents the batch was assigned to
    #[serde(default)]
    pub pool: Option<String>,
    /// Agent executing the batch
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    /// Session of the executing agent
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Lease under which the batch is executing
    #[serde(default)]
    pub lease_id: Option<LeaseId>,
    /// Log for batch setup and teardown
    #[serde(default)]
    pub log_id: Option<LogId>,
    /// Time at which the batch's dependencies were satisfied
    #[serde(default)]
    pub ready_time: Option<SystemTime>,
    /// Time at which an agent started the batch
    #[serde(default)]
    pub start_time: Option<SystemTime>,
    /// Time at which the batch finished
    #[serde(default)]
    pub finish_time: Option<SystemTime>,
}

impl Batch {
    pub fn new(id: SubResourceId, group_idx: usize) -> Self {
        Self {
            id,
            group_idx,
            state: BatchState::Waiting,
            error: BatchError::None,
            steps: Vec::new(),
            schedule_priority: 0,
            pool: None,
            agent_id: None,
            session_id: None,
            lease_id: None,
            log_id: None,
            ready_time: None,
            start_time: None,
            finish_time: None,
        }
    }

    /// Whether new steps may still be added to this batch. Once an agent has
    /// picked the batch up, later work for the group goes in a new batch.
    pub fn can_be_appended_to(&self) -> bool {
        self.state <= BatchState::Ready && self.error == BatchError::None
    }

    /// Look up a step by id
    pub fn step(&self, step_id: SubResourceId) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// Look up a step by id for modification
    pub fn step_mut(&mut self, step_id: SubResourceId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|step| step.id == step_id)
    }

    /// Nodes outside this batch that must finish before the batch can start.
    /// Nodes flagged to run early do not contribute their dependencies.
    pub fn start_dependencies(&self, graph: &Graph) -> HashSet<NodeRef> {
        let mut dependencies = HashSet::new();
        for step in &self.steps {
            let node_ref = NodeRef::new(self.group_idx, step.node_idx);
            if let Some(node) = graph.node(node_ref) {
                if !node.run_early {
                    dependencies.extend(node.order_dependencies.iter().copied());
                }
            }
        }
        for step in &self.steps {
            dependencies.remove(&NodeRef::new(self.group_idx, step.node_idx));
        }
        dependencies
    }
}

/// Record of a node whose step was put back in the queue for another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetriedNode {
    pub group_idx: usize,
    pub node_idx: usize,
}

impl RetriedNode {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.group_idx, self.node_idx)
    }
}

/// A scheduled execution of a graph against a stream change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique identifier
    pub id: JobId,
    /// Stream the job was started in
    pub stream_id: StreamId,
    /// Template the job was created from
    pub template_id: TemplateId,
    /// Hash of the graph the job is executing
    pub graph_hash: GraphHash,
    /// Human readable name
    pub name: String,
    /// Change number the job is building
    pub change: u32,
    /// Shelved change applied on top of the base change, if this is a preflight
    #[serde(default)]
    pub preflight_change: Option<u32>,
    /// User that started the job
    #[serde(default)]
    pub started_by: Option<UserId>,
    /// User that aborted the job, if any
    #[serde(default)]
    pub aborted_by: Option<UserId>,
    /// Time the job was created
    pub create_time: SystemTime,
    /// Time of the last modification
    pub update_time: SystemTime,
    /// Base priority requested for the job
    pub priority: Priority,
    /// Highest schedule priority across batches waiting for an agent
    #[serde(default)]
    pub schedule_priority: i32,
    /// Command line arguments, used to derive the set of target nodes
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Batches in creation order
    pub batches: Vec<Batch>,
    /// Next identifier to hand out for a batch or step
    #[serde(default)]
    pub next_sub_resource_id: SubResourceId,
    /// Nodes that have been put back in the queue for another attempt
    #[serde(default)]
    pub retried_nodes: Vec<RetriedNode>,
    /// Version stamp for conditional writes
    #[serde(default)]
    pub update_index: u64,
}

impl Job {
    pub fn new(
        id: JobId,
        stream_id: StreamId,
        template_id: TemplateId,
        graph_hash: GraphHash,
        name: impl Into<String>,
        change: u32,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            stream_id,
            template_id,
            graph_hash,
            name: name.into(),
            change,
            preflight_change: None,
            started_by: None,
            aborted_by: None,
            create_time: now,
            update_time: now,
            priority: Priority::default(),
            schedule_priority: 0,
            arguments: Vec::new(),
            batches: Vec::new(),
            next_sub_resource_id: SubResourceId::default(),
            retried_nodes: Vec::new(),
            update_index: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_preflight_change(mut self, change: u32) -> Self {
        self.preflight_change = Some(change);
        self
    }

    pub fn with_started_by(mut self, user_id: UserId) -> Self {
        self.started_by = Some(user_id);
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Hand out the next batch or step identifier
    pub fn allocate_sub_resource_id(&mut self) -> SubResourceId {
        self.next_sub_resource_id = self.next_sub_resource_id.next();
        self.next_sub_resource_id
    }

    /// Whether a user has asked for the whole job to stop
    pub fn is_aborted(&self) -> bool {
        self.aborted_by.is_some()
    }

    /// Look up a batch by id
    pub fn batch(&self, batch_id: SubResourceId) -> Option<&Batch> {
        self.batches.iter().find(|batch| batch.id == batch_id)
    }

    /// Look up a batch by id for modification
    pub fn batch_mut(&mut self, batch_id: SubResourceId) -> Option<&mut Batch> {
        self.batches.iter_mut().find(|batch| batch.id == batch_id)
    }

    /// Look up a step by batch and step id
    pub fn step(&self, batch_id: SubResourceId, step_id: SubResourceId) -> Option<&Step> {
        self.batch(batch_id).and_then(|batch| batch.step(step_id))
    }

    /// Number of times the given node has been put back in the queue
    pub fn retried_node_count(&self, node_ref: NodeRef) -> usize {
        self.retried_nodes
            .iter()
            .filter(|retried| retried.node_ref() == node_ref)
            .count()
    }

    /// Overall state, derived from the batches
    pub fn state(&self) -> JobState {
        if self.batches.iter().all(|batch| batch.state == BatchState::Complete) {
            return JobState::Complete;
        }
        let started = self.batches.iter().any(|batch| {
            batch.state >= BatchState::Starting
                || batch
                    .steps
                    .iter()
                    .any(|step| step.state == StepState::Running || step.state.is_terminal())
        });
        if started {
            JobState::Running
        } else {
            JobState::Waiting
        }
    }
}
