// Farm Service Library
// Core service for build automation job scheduling and execution tracking

pub mod changes;
pub mod error;
pub mod events;
pub mod graph;
pub mod jobs;
pub mod leases;
pub mod templates;

// Re-export commonly used types
pub use error::{InvalidReason, ServiceError, ServiceResult};

// Re-export graph types
pub use graph::{
    build_graph, Aggregate, AggregateDefinition, Graph, GraphHash, GraphRegistry, GroupDefinition,
    InMemoryGraphRegistry, Label, LabelDefinition, Node, NodeDefinition, NodeGroup, NodeRef,
    Priority,
};

// Re-export job types
pub use jobs::{
    Batch, BatchError, BatchState, BatchUpdate, CreateJobOptions, InMemoryJobStore, Job, JobFilter,
    JobId, JobService, JobState, JobStore, JobTiming, JobUpdate, LabelOutcome, LabelState,
    LabelStatus, Step, StepLocation, StepOutcome, StepState, StepUpdate, SubResourceId,
    TimingEstimator,
};

// Re-export identifier types
pub use jobs::{AgentId, LeaseId, LogId, SessionId, StreamId, TemplateId, UserId};

// Re-export event types
pub use events::{event_channel, event_stream, EventSender, JobEvent, JobEventReceiver, JobEventSender};

// Re-export change service types
pub use changes::{ChangeService, InMemoryChangeService, ShelfDetails};

// Re-export lease types
pub use leases::{InMemoryLeaseRegistry, Lease, LeasePayload, LeaseRegistry, LeaseState};

// Re-export template types
pub use templates::{parse_template, InMemoryTemplateRegistry, TemplateDocument, TemplateRegistry};
