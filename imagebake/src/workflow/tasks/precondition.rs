//! Task: Precondition check.
//!
//! Fails fast when the artifact already exists, before anything is created.

use super::{BakeCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use crate::provider::{ProvisioningApi, ResourceKind, ResourceLookup};
use crate::request::OutputMode;
use async_trait::async_trait;
use imagebake_shared::{BakeError, BakeResult};

pub struct PreconditionTask;

#[async_trait]
impl PipelineTask<BakeCtx> for PreconditionTask {
    async fn run(self: Box<Self>, ctx: BakeCtx) -> BakeResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let (api, output, target) = {
            let ctx = ctx.lock().await;
            let target = ctx
                .state
                .target
                .clone()
                .ok_or_else(|| BakeError::Internal("resolve task must run first".into()))?;
            (ctx.api.clone(), ctx.request.output.clone(), target)
        };

        let (kind, name) = match &output {
            OutputMode::Image => (ResourceKind::Image, target.name.as_str()),
            OutputMode::Tarball { destination } => {
                (ResourceKind::StorageObject, destination.as_str())
            }
        };

        ensure_absent(api.as_ref(), &target.project, kind, name)
            .await
            .inspect_err(|e| log_task_error(&run_id, task_name, e))
    }

    fn name(&self) -> &str {
        "precondition"
    }
}

pub async fn ensure_absent(
    api: &dyn ProvisioningApi,
    project: &str,
    kind: ResourceKind,
    name: &str,
) -> BakeResult<()> {
    tracing::info!(%kind, name, project, "Checking whether artifact already exists");
    match api.describe_resource(project, kind, name).await? {
        ResourceLookup::NotFound => Ok(()),
        ResourceLookup::Found(description) => Err(BakeError::Conflict(format!(
            "{} {:?} already exists in {}; delete it or choose a different name\n\n    {}",
            kind,
            name,
            project,
            description.trim_end().replace('\n', "\n    ")
        ))),
    }
}
