// Job Types
// Identifiers and state enums for jobs, batches, steps, and labels

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

static NEXT_JOB_SEQUENCE: AtomicU64 = AtomicU64::new(1);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new id from the current time and a process-wide counter
    pub fn generate() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let sequence = NEXT_JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("{:08x}{:016x}", secs as u32, sequence))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a batch or step, unique within one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubResourceId(pub u16);

impl SubResourceId {
    /// Allocate the next id. Ids stride by a fixed odd amount so that
    /// consecutive allocations are visually distinct and the sequence
    /// cycles through the full id space before repeating.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(389))
    }

    /// Parse from the four-digit hex form used on the wire
    pub fn parse(text: &str) -> Option<Self> {
        u16::from_str_radix(text, 16).ok().map(Self)
    }
}

impl Default for SubResourceId {
    fn default() -> Self {
        Self(0)
    }
}

impl fmt::Display for SubResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Execution state of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepState {
    /// Waiting on dependencies
    Waiting,
    /// Dependencies satisfied, eligible for execution
    Ready,
    /// Will not run because a dependency failed or was skipped
    Skipped,
    /// Currently executing on an agent
    Running,
    /// Finished executing
    Completed,
    /// Execution was aborted
    Aborted,
}

impl StepState {
    /// Whether the step has finished (no further transitions possible)
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Skipped | StepState::Completed | StepState::Aborted)
    }

    /// Whether the step still has work outstanding
    pub fn is_pending(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepState::Waiting => "Waiting",
            StepState::Ready => "Ready",
            StepState::Skipped => "Skipped",
            StepState::Running => "Running",
            StepState::Completed => "Completed",
            StepState::Aborted => "Aborted",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of a step's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepOutcome {
    /// Not yet determined
    Unspecified,
    Failure,
    Warnings,
    Success,
}

impl StepOutcome {
    fn severity(self) -> u8 {
        match self {
            StepOutcome::Unspecified => 0,
            StepOutcome::Success => 1,
            StepOutcome::Warnings => 2,
            StepOutcome::Failure => 3,
        }
    }

    /// Combine two outcomes, keeping the worse of the pair.
    /// Success < Warnings < Failure; Unspecified defers to the other side.
    pub fn worst(self, other: StepOutcome) -> StepOutcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl Default for StepOutcome {
    fn default() -> Self {
        StepOutcome::Unspecified
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepOutcome::Unspecified => "Unspecified",
            StepOutcome::Failure => "Failure",
            StepOutcome::Warnings => "Warnings",
            StepOutcome::Success => "Success",
        };
        write!(f, "{}", name)
    }
}

/// Execution state of a batch. Ordered; a batch only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchState {
    /// Waiting on dependencies of steps in the batch
    Waiting,
    /// Dependencies satisfied, waiting for an agent
    Ready,
    /// An agent has accepted the batch and is setting up
    Starting,
    /// Steps are executing
    Running,
    /// All steps have finished
    Complete,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Waiting => "Waiting",
            BatchState::Ready => "Ready",
            BatchState::Starting => "Starting",
            BatchState::Running => "Running",
            BatchState::Complete => "Complete",
        };
        write!(f, "{}", name)
    }
}

/// Error condition attached to a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchError {
    None,
    /// The batch is no longer needed and was cancelled
    Cancelled,
    /// The agent executing the batch stopped responding
    LostConnection,
    /// The agent gave up the batch before running all its steps
    Incomplete,
}

impl Default for BatchError {
    fn default() -> Self {
        BatchError::None
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchError::None => "None",
            BatchError::Cancelled => "Cancelled",
            BatchError::LostConnection => "LostConnection",
            BatchError::Incomplete => "Incomplete",
        };
        write!(f, "{}", name)
    }
}

/// Overall state of a job, derived from its steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    /// No step has started yet
    Waiting,
    /// At least one step has started
    Running,
    /// Every step has finished
    Complete,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Waiting => "Waiting",
            JobState::Running => "Running",
            JobState::Complete => "Complete",
        };
        write!(f, "{}", name)
    }
}

/// Progress state of a label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LabelState {
    /// None of the label's nodes are part of the job
    Unspecified,
    /// At least one included node has not finished
    Running,
    /// Every included node has finished
    Complete,
}

/// Aggregate outcome of a label. Final only once the label is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LabelOutcome {
    Unspecified,
    Failure,
    Warnings,
    Success,
}

/// Identifier for a stream of submitted changes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a job template
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub String);

impl TemplateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an agent session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an agent lease
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub String);

impl LeaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a log produced by an agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub String);

impl LogId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
