// Jobs Module
// Job model, persistence, batch scheduling, updates, and derived views

pub mod job;
pub mod labels;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod timing;
pub mod types;
pub mod update;

pub use job::{Batch, Job, RetriedNode, Step};
pub use labels::{default_label_state, label_states, LabelStatus};
pub use retry::{locate_retried_step, StepLocation};
pub use service::{CreateJobOptions, JobFilter, JobService, JobUpdate};
pub use store::{InMemoryJobStore, JobStore};
pub use timing::{
    compute_job_timing, FixedTimingEstimator, JobTiming, NullTimingEstimator, StepEstimate,
    TimingEstimator, TimingInfo,
};
pub use types::{
    AgentId, BatchError, BatchState, JobId, JobState, LabelOutcome, LabelState, LeaseId, LogId,
    SessionId, StepOutcome, StepState, StreamId, SubResourceId, TemplateId, UserId,
};
pub use update::{apply_batch_updates, apply_step_updates, BatchUpdate, StepUpdate, UpdateEffects};
