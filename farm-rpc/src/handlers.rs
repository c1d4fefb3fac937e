pub mod graph_handler;
pub mod job_handler;

pub use graph_handler::GraphHandler;
pub use job_handler::JobHandler;
