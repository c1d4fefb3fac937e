// Graph Handler
// Graph projections for running jobs, plus graph growth for the few
// callers allowed to extend executing work

use std::sync::Arc;

use farm_service::jobs::{JobTiming, LabelStatus};
use farm_service::{
    AggregateDefinition, Batch, GroupDefinition, Job, JobId, JobService, LabelDefinition, Node,
    NodeGroup,
};

use crate::auth::{CallerContext, Permission};
use crate::error::RpcResult;

pub struct GraphHandler {
    service: Arc<JobService>,
}

impl GraphHandler {
    pub fn new(service: Arc<JobService>) -> Self {
        Self { service }
    }

    pub async fn get_job_groups(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
    ) -> RpcResult<Vec<NodeGroup>> {
        caller.require(Permission::View)?;
        let graph = self.service.get_job_graph(job_id).await?;
        Ok(graph.groups.clone())
    }

    pub async fn get_job_nodes(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
    ) -> RpcResult<Vec<Node>> {
        caller.require(Permission::View)?;
        let graph = self.service.get_job_graph(job_id).await?;
        Ok(graph
            .groups
            .iter()
            .flat_map(|group| group.nodes.iter().cloned())
            .collect())
    }

    pub async fn get_job_batches(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
    ) -> RpcResult<Vec<Batch>> {
        caller.require(Permission::View)?;
        let job = self.service.get_job(job_id).await?;
        Ok(job.batches)
    }

    /// Aggregate state of every label, plus the catch-all over nodes no
    /// label covers
    pub async fn get_job_labels(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
    ) -> RpcResult<Vec<LabelStatus>> {
        caller.require(Permission::View)?;
        Ok(self.service.get_label_states(job_id).await?)
    }

    pub async fn get_default_label(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
    ) -> RpcResult<(LabelStatus, Vec<String>)> {
        caller.require(Permission::View)?;
        Ok(self.service.get_default_label_state(job_id).await?)
    }

    pub async fn get_job_timing(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
    ) -> RpcResult<JobTiming> {
        caller.require(Permission::View)?;
        Ok(self.service.get_job_timing(job_id).await?)
    }

    /// Append groups to a running job's graph
    pub async fn append_job_groups(
        &self,
        caller: &CallerContext,
        job_id: &JobId,
        groups: Vec<GroupDefinition>,
        aggregates: Vec<AggregateDefinition>,
        labels: Vec<LabelDefinition>,
    ) -> RpcResult<Job> {
        caller.require(Permission::Execute)?;
        Ok(self
            .service
            .append_groups(job_id, groups, aggregates, labels)
            .await?)
    }
}
