//! Task: Target resolution.
//!
//! Fixes the artifact name/project and the concrete source image. A family
//! selector is resolved to the newest matching image; the result is cached
//! in the workflow state so later lookups agree.

use super::{BakeCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use crate::provider::{ImageDescriptor, ProvisioningApi, SourceImage};
use crate::request::{SourceSelector, WorkflowRequest};
use crate::workflow::types::TargetImage;
use async_trait::async_trait;
use imagebake_shared::{BakeError, BakeResult};

pub struct ResolveTask;

#[async_trait]
impl PipelineTask<BakeCtx> for ResolveTask {
    async fn run(self: Box<Self>, ctx: BakeCtx) -> BakeResult<()> {
        let task_name = self.name();
        let run_id = task_start(&ctx, task_name).await;

        let (request, api, cached) = {
            let ctx = ctx.lock().await;
            (
                ctx.request.clone(),
                ctx.api.clone(),
                ctx.state.source.clone(),
            )
        };

        let target = resolve_target(&request);
        let mut cache = cached;
        let source = resolve_source(api.as_ref(), &request, &mut cache)
            .await
            .inspect_err(|e| log_task_error(&run_id, task_name, e))?;

        tracing::info!(
            target = %target.name,
            target_project = %target.project,
            source = %source.name,
            source_project = %source.project,
            "Resolved bake targets"
        );

        let mut ctx = ctx.lock().await;
        ctx.state.target = Some(target);
        ctx.state.source = cache;

        Ok(())
    }

    fn name(&self) -> &str {
        "resolve"
    }
}

pub fn resolve_target(request: &WorkflowRequest) -> TargetImage {
    TargetImage {
        name: request.target_image_name(),
        project: request.target_project.clone(),
    }
}

/// Resolve the source image, consulting and filling `cache`.
pub async fn resolve_source(
    api: &dyn ProvisioningApi,
    request: &WorkflowRequest,
    cache: &mut Option<SourceImage>,
) -> BakeResult<SourceImage> {
    if let Some(source) = cache {
        return Ok(source.clone());
    }

    let source = match &request.source {
        SourceSelector::Image(name) => SourceImage {
            name: name.clone(),
            project: request.source_image_project.clone(),
        },
        SourceSelector::Family(family) => {
            let images = api.list_images(&request.source_image_project).await?;
            let latest = latest_in_family(&images, family).ok_or_else(|| {
                let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
                BakeError::NotFound(format!(
                    "no images found for family {:?} in {}; available: [{}]",
                    family,
                    request.source_image_project,
                    names.join(", ")
                ))
            })?;
            SourceImage {
                name: latest.name.clone(),
                project: request.source_image_project.clone(),
            }
        }
    };

    *cache = Some(source.clone());
    Ok(source)
}

/// Newest image whose name starts with `family`. Ties go to the later name.
fn latest_in_family<'a>(
    images: &'a [ImageDescriptor],
    family: &str,
) -> Option<&'a ImageDescriptor> {
    images
        .iter()
        .filter(|image| image.name.starts_with(family))
        .max_by(|a, b| {
            a.creation_timestamp
                .cmp(&b.creation_timestamp)
                .then_with(|| a.name.cmp(&b.name))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::recording::{ApiCall, RecordingApi};
    use crate::settings::BakeSettings;
    use chrono::{TimeZone, Utc};

    fn image(name: &str, day: u32) -> ImageDescriptor {
        ImageDescriptor {
            name: name.to_string(),
            family: None,
            creation_timestamp: Utc.with_ymd_and_hms(2015, 11, day, 0, 0, 0).unwrap(),
        }
    }

    fn request() -> WorkflowRequest {
        WorkflowRequest::new(&BakeSettings::default(), "gs://r/my_release", "proj")
    }

    #[tokio::test]
    async fn test_family_picks_newest_match() {
        let api = RecordingApi::new(vec![
            image("ubuntu-1404-trusty-v20151101", 1),
            image("ubuntu-1404-trusty-v20151113", 13),
            image("ubuntu-1504-vivid-v20151120", 20),
            image("debian-8-jessie", 25),
        ]);
        let mut cache = None;
        let source = resolve_source(&api, &request(), &mut cache).await.unwrap();
        assert_eq!(source.name, "ubuntu-1404-trusty-v20151113");
        assert_eq!(source.project, "ubuntu-os-cloud");
    }

    #[tokio::test]
    async fn test_lookup_is_cached() {
        let api = RecordingApi::new(vec![image("ubuntu-1404-a", 1)]);
        let mut cache = None;
        let first = resolve_source(&api, &request(), &mut cache).await.unwrap();
        let second = resolve_source(&api, &request(), &mut cache).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(api.count(&ApiCall::ListImages), 1);
    }

    #[tokio::test]
    async fn test_no_match_is_not_found() {
        let api = RecordingApi::new(vec![image("debian-8", 1)]);
        let err = resolve_source(&api, &request(), &mut None).await.unwrap_err();
        assert!(matches!(err, BakeError::NotFound(_)));
        assert!(err.to_string().contains("debian-8"));
    }

    #[tokio::test]
    async fn test_explicit_image_skips_listing() {
        let api = RecordingApi::new(vec![]);
        let req = request().with_source(SourceSelector::Image("my-base".into()));
        let source = resolve_source(&api, &req, &mut None).await.unwrap();
        assert_eq!(source.name, "my-base");
        assert!(api.calls().is_empty());
    }

    #[test]
    fn test_target_from_release() {
        let target = resolve_target(&request());
        assert_eq!(target.name, "my-release");
        assert_eq!(target.project, "proj");
    }
}
