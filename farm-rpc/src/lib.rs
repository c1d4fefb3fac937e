pub mod api;
pub mod auth;
pub mod error;
pub mod handlers;

pub use api::RpcServer;
pub use auth::{CallerContext, Permission};
pub use error::{RpcError, RpcResult};
pub use handlers::{GraphHandler, JobHandler};

// Re-export types needed by clients
pub use farm_service::{
    BatchState, BatchUpdate, CreateJobOptions, JobEvent, JobFilter, JobId, JobState, JobUpdate,
    StepLocation, StepOutcome, StepState, StepUpdate,
};
pub use farm_service;
