use std::sync::Arc;

use farm_service::JobService;

use crate::handlers::{GraphHandler, JobHandler};

pub struct RpcServer {
    job_handler: JobHandler,
    graph_handler: GraphHandler,
}

impl RpcServer {
    pub fn new(service: Arc<JobService>) -> Self {
        Self {
            job_handler: JobHandler::new(service.clone()),
            graph_handler: GraphHandler::new(service),
        }
    }

    pub fn start(&self) {
        println!("RPC Server started");
        // Transport wiring (HTTP, gRPC, etc.) plugs in here
    }

    pub fn job_handler(&self) -> &JobHandler {
        &self.job_handler
    }

    pub fn graph_handler(&self) -> &GraphHandler {
        &self.graph_handler
    }
}
