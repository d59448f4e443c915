//! Task: Tarball extraction.
//!
//! Attaches a scratch disk to the still-running prototype, bundles the boot
//! disk onto it over the remote shell and copies the bundle to storage. The
//! scratch disk is detached and deleted whether or not bundling succeeds.

use super::{BakeCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use crate::request::tarball_file_name;
use crate::workflow::cleanup;
use crate::workflow::types::{Artifact, EphemeralDisk};
use async_trait::async_trait;
use imagebake_shared::{BakeError, BakeResult};

const SCRATCH_MOUNT: &str = "/mnt/tmp";
const BOOT_DEVICE: &str = "/dev/sda";

pub struct ExtractTarballTask;

#[async_trait]
impl PipelineTask<BakeCtx> for ExtractTarballTask {
    async fn run(self: Box<Self>, ctx: BakeCtx) -> BakeResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let (api, instance, destination, settings) = {
            let ctx = ctx.lock().await;
            let instance = ctx
                .state
                .instance
                .clone()
                .ok_or_else(|| BakeError::Internal("provision task must run first".into()))?;
            let destination = ctx
                .request
                .output
                .tarball_destination()
                .ok_or_else(|| BakeError::Internal("tarball task needs a destination".into()))?
                .to_string();
            (ctx.api.clone(), instance, destination, ctx.settings.clone())
        };

        let disk = EphemeralDisk {
            name: scratch_disk_name(&instance.name),
            device_name: settings.scratch_device_name.clone(),
            attached_to: None,
        };

        tracing::info!(disk = %disk.name, size_gb = settings.scratch_disk_size_gb, "Creating scratch disk");
        api.create_disk(
            &instance.project,
            &instance.zone,
            &disk.name,
            settings.scratch_disk_size_gb,
        )
        .await
        .and_then(|out| out.check(BakeError::Provisioning))
        .inspect_err(|e| log_task_error(&run_id, task_name, e))?;
        ctx.lock().await.guard.track_scratch_disk(disk.clone());

        tracing::info!(disk = %disk.name, instance = %instance.name, "Attaching scratch disk");
        api.attach_disk(
            &instance.project,
            &instance.zone,
            &instance.name,
            &disk.name,
            &disk.device_name,
        )
        .await
        .and_then(|out| out.check(BakeError::Provisioning))
        .inspect_err(|e| log_task_error(&run_id, task_name, e))?;
        ctx.lock().await.guard.mark_scratch_attached(&instance.name);

        tracing::info!(destination = %destination, "Creating image tarball");
        let script = bundle_script(&disk.device_name, &destination);
        let bundled = api
            .run_remote_command(&instance.project, &instance.zone, &instance.name, &script)
            .await
            .and_then(|out| out.check(BakeError::Extraction));

        {
            let mut ctx = ctx.lock().await;
            if let Some(disk) = ctx.guard.take_scratch_disk() {
                tracing::info!(disk = %disk.name, "Detaching and deleting scratch disk");
                let failures =
                    cleanup::release_scratch_disk(api.as_ref(), &instance.project, &instance.zone, &disk)
                        .await;
                ctx.guard.record_failures(failures);
            }
        }

        bundled.inspect_err(|e| log_task_error(&run_id, task_name, e))?;

        ctx.lock().await.state.artifact = Some(Artifact::TarballObject { path: destination });
        Ok(())
    }

    fn name(&self) -> &str {
        "extract_tarball"
    }
}

/// Scratch disk for one run. Instance names are unique per run, so this is
/// too.
pub fn scratch_disk_name(instance: &str) -> String {
    format!("{}-export", instance)
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Remote command that formats the scratch disk, bundles the boot device
/// into it and uploads the bundle. Any failing step fails the whole command.
pub fn bundle_script(device_name: &str, destination: &str) -> String {
    let tar_name = tarball_file_name(destination);
    let device = format!("/dev/disk/by-id/google-{}", device_name);
    [
        format!("sudo mkdir -p {}", SCRATCH_MOUNT),
        format!(
            "sudo /usr/share/google/safe_format_and_mount -m \"mkfs.ext4 -F\" {} {}",
            shell_quote(&device),
            SCRATCH_MOUNT
        ),
        "EXCLUDES=$(ls -d /home/* 2>/dev/null | paste -sd, -)".to_string(),
        format!(
            "sudo gcimagebundle -d {} -o {} --log_file=/tmp/export.log \
             --output_file_name={} --excludes=/tmp,$EXCLUDES",
            BOOT_DEVICE,
            SCRATCH_MOUNT,
            shell_quote(tar_name)
        ),
        format!(
            "gsutil -q cp {} {}",
            shell_quote(&format!("{}/{}", SCRATCH_MOUNT, tar_name)),
            shell_quote(destination)
        ),
    ]
    .join(" && ")
}
