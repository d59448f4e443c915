//! Task: Image extraction.
//!
//! Deletes the prototype instance while keeping its boot disk, registers an
//! image from that disk, then deletes the disk. The image can only be taken
//! once the disk is detached, so the order is fixed.

use super::{BakeCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use crate::workflow::cleanup;
use crate::workflow::types::Artifact;
use async_trait::async_trait;
use imagebake_shared::{BakeError, BakeResult};

pub struct ExtractImageTask;

#[async_trait]
impl PipelineTask<BakeCtx> for ExtractImageTask {
    async fn run(self: Box<Self>, ctx: BakeCtx) -> BakeResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let (api, instance, target) = {
            let ctx = ctx.lock().await;
            let instance = ctx
                .state
                .instance
                .clone()
                .ok_or_else(|| BakeError::Internal("provision task must run first".into()))?;
            let target = ctx
                .state
                .target
                .clone()
                .ok_or_else(|| BakeError::Internal("resolve task must run first".into()))?;
            (ctx.api.clone(), instance, target)
        };

        tracing::info!(instance = %instance.name, "Extracting boot disk from instance");
        api.delete_instance(&instance.project, &instance.zone, &instance.name, true)
            .await
            .and_then(|out| out.check(BakeError::Provisioning))
            .inspect_err(|e| log_task_error(&run_id, task_name, e))?;
        {
            let mut ctx = ctx.lock().await;
            ctx.guard.instance_deleted_keeping_disk();
            ctx.state.instance = None;
        }

        // The retained boot disk carries the instance name.
        tracing::info!(image = %target.name, disk = %instance.name, "Creating image");
        api.create_image(&target.project, &target.name, &instance.name, &instance.zone)
            .await
            .and_then(|out| out.check(BakeError::Extraction))
            .inspect_err(|e| log_task_error(&run_id, task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.state.artifact = Some(Artifact::ImageResource {
            name: target.name,
            project: target.project,
        });

        tracing::info!(disk = %instance.name, "Cleaning up extracted boot disk");
        if let Some(disk) = ctx.guard.take_boot_disk()
            && let Some(failure) =
                cleanup::delete_disk(api.as_ref(), &instance.project, &instance.zone, &disk).await
        {
            ctx.guard.record_failures(vec![failure]);
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "extract_image"
    }
}
