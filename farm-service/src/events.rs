// Job Events
// Progress notifications emitted as jobs, batches, and steps change

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::graph::GraphHash;
use crate::jobs::{
    BatchState, JobId, JobState, StepOutcome, StepState, StreamId, SubResourceId, UserId,
};

/// Sender for job progress events
pub type JobEventSender = mpsc::UnboundedSender<JobEvent>;

/// Receiver for job progress events
pub type JobEventReceiver = mpsc::UnboundedReceiver<JobEvent>;

/// Create a new event channel
pub fn event_channel() -> (JobEventSender, JobEventReceiver) {
    mpsc::unbounded_channel()
}

/// Wrap a receiver for consumers that compose over streams
pub fn event_stream(receiver: JobEventReceiver) -> UnboundedReceiverStream<JobEvent> {
    UnboundedReceiverStream::new(receiver)
}

/// Events emitted by the job service
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A job was created
    JobCreated {
        job_id: JobId,
        stream_id: StreamId,
        change: u32,
    },

    /// A job's derived state changed
    JobStateChanged { job_id: JobId, state: JobState },

    /// A job was aborted
    JobAborted {
        job_id: JobId,
        aborted_by: Option<UserId>,
    },

    /// A batch moved to a new state
    BatchStateChanged {
        job_id: JobId,
        batch_id: SubResourceId,
        state: BatchState,
    },

    /// A step moved to a new state
    StepStateChanged {
        job_id: JobId,
        batch_id: SubResourceId,
        step_id: SubResourceId,
        state: StepState,
        outcome: StepOutcome,
    },

    /// A step was queued for another attempt
    StepRetried {
        job_id: JobId,
        batch_id: SubResourceId,
        step_id: SubResourceId,
        retried_by: UserId,
    },

    /// New groups were appended to a job's graph
    GroupsAppended {
        job_id: JobId,
        graph_hash: GraphHash,
    },
}

impl JobEvent {
    /// Create a job created event
    pub fn job_created(job_id: JobId, stream_id: StreamId, change: u32) -> Self {
        Self::JobCreated {
            job_id,
            stream_id,
            change,
        }
    }

    /// Create a job state change event
    pub fn job_state_changed(job_id: JobId, state: JobState) -> Self {
        Self::JobStateChanged { job_id, state }
    }

    /// Create a step state change event
    pub fn step_state_changed(
        job_id: JobId,
        batch_id: SubResourceId,
        step_id: SubResourceId,
        state: StepState,
        outcome: StepOutcome,
    ) -> Self {
        Self::StepStateChanged {
            job_id,
            batch_id,
            step_id,
            state,
            outcome,
        }
    }

    /// Create a step retried event
    pub fn step_retried(
        job_id: JobId,
        batch_id: SubResourceId,
        step_id: SubResourceId,
        retried_by: UserId,
    ) -> Self {
        Self::StepRetried {
            job_id,
            batch_id,
            step_id,
            retried_by,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: JobEvent);
}

impl EventSender for JobEventSender {
    fn send_event(&self, event: JobEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<JobEventSender> {
    fn send_event(&self, event: JobEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
