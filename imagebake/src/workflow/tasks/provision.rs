//! Task: Prototype instance provisioning.
//!
//! Packages the installer scripts as instance metadata and creates the
//! instance from the resolved source image. The installer starts on boot;
//! waiting for it is the watch task's job.

use super::{BakeCtx, log_task_error, task_start};
use crate::packaging::{ExecutionEnvironment, ScriptRef, package};
use crate::pipeline::PipelineTask;
use crate::provider::{InstanceMetadata, InstanceSpec};
use crate::request::WorkflowRequest;
use crate::settings::{BakeSettings, InstallerLayout};
use crate::workflow::types::EphemeralInstance;
use async_trait::async_trait;
use imagebake_shared::{BakeError, BakeResult};
use tempfile::TempPath;

/// Metadata key of the script the instance runs at boot.
pub const STARTUP_SCRIPT_KEY: &str = "startup-script";
pub const STARTUP_COMMAND_KEY: &str = "startup_py_command";
pub const LOADER_FILES_KEY: &str = "startup_loader_files";

pub struct ProvisionTask;

#[async_trait]
impl PipelineTask<BakeCtx> for ProvisionTask {
    async fn run(self: Box<Self>, ctx: BakeCtx) -> BakeResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let (request, settings, api, source) = {
            let ctx = ctx.lock().await;
            let source = ctx
                .state
                .source
                .clone()
                .ok_or_else(|| BakeError::Internal("resolve task must run first".into()))?;
            (
                ctx.request.clone(),
                ctx.settings.clone(),
                ctx.api.clone(),
                source,
            )
        };

        let (metadata, staged) = build_metadata(&request, &settings.installer)
            .inspect_err(|e| log_task_error(&run_id, task_name, e))?;
        ctx.lock().await.guard.track_payloads(staged);

        let spec = InstanceSpec {
            project: request.target_project.clone(),
            zone: request.zone.clone(),
            name: request.instance_name.clone(),
            source_image: source,
            machine_type: settings.machine_type.clone(),
            scopes: settings.scopes.clone(),
            metadata,
        };

        tracing::info!(
            instance = %spec.name,
            image = %spec.source_image.name,
            machine_type = %spec.machine_type,
            "Creating prototype instance"
        );
        let result = api.create_instance(&spec).await;

        let mut ctx = ctx.lock().await;
        ctx.guard.release_payloads();

        result
            .and_then(|out| out.check(BakeError::Provisioning))
            .inspect_err(|e| log_task_error(&run_id, task_name, e))?;

        ctx.guard.track_instance(&spec.name);
        ctx.state.instance = Some(EphemeralInstance {
            name: spec.name,
            project: spec.project,
            zone: spec.zone,
        });

        Ok(())
    }

    fn name(&self) -> &str {
        "provision"
    }
}

/// Command line the loader runs once the payloads are in place.
pub fn startup_command(request: &WorkflowRequest, installer: &InstallerLayout) -> Vec<String> {
    let mut command = vec![
        installer.entry_point.clone(),
        "--package_manager".to_string(),
        format!("--release_path={}", request.release_path),
    ];
    if request.skip_components {
        command.push("--nospinnaker".to_string());
    }
    if request.skip_dependencies {
        command.push("--nodependencies".to_string());
    }
    if request.update_os {
        command.push("--update_os".to_string());
    }
    command.extend(request.extra_install_flags.iter().cloned());
    command
}

/// Build instance metadata and stage the payload files it references.
///
/// The returned temp paths must outlive the create call.
pub fn build_metadata(
    request: &WorkflowRequest,
    installer: &InstallerLayout,
) -> BakeResult<(InstanceMetadata, Vec<TempPath>)> {
    let verbatim = ExecutionEnvironment::verbatim();
    let flattened = ExecutionEnvironment::flattened(&installer.flatten_prefixes);

    let mut scripts = vec![(
        ScriptRef::new(
            STARTUP_SCRIPT_KEY,
            installer.install_dir.join(&installer.loader_script),
        ),
        &verbatim,
    )];
    for (key, file) in &installer.helper_modules {
        scripts.push((
            ScriptRef::new(key, installer.pylib_dir.join(file)),
            &verbatim,
        ));
    }
    for (key, file) in &installer.installer_modules {
        scripts.push((
            ScriptRef::new(key, installer.install_dir.join(file)),
            &flattened,
        ));
    }

    let mut metadata = InstanceMetadata::default();
    let mut staged = Vec::with_capacity(scripts.len());
    for (script, env) in scripts {
        let payload = package(&script, env)?;
        let path = payload.stage()?;
        metadata.files.insert(payload.key, path.to_path_buf());
        staged.push(path);
    }

    let loader_files: Vec<&str> = installer
        .helper_modules
        .iter()
        .chain(installer.installer_modules.iter())
        .map(|(key, _)| key.as_str())
        .collect();

    metadata.items.insert(
        STARTUP_COMMAND_KEY.to_string(),
        startup_command(request, installer).join("+"),
    );
    metadata
        .items
        .insert(LOADER_FILES_KEY.to_string(), loader_files.join("+"));

    Ok((metadata, staged))
}
