//! Type definitions for the bake pipeline.

use super::cleanup::CleanupGuard;
use super::tasks::watch::{PollFailureClassifier, SerialSink, WatchState};
use crate::provider::{ProvisioningApi, SourceImage};
use crate::request::WorkflowRequest;
use crate::settings::BakeSettings;
use std::sync::Arc;

/// Unique identifier of one bake run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(ulid::Ulid);

impl RunId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Image name and project the run writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetImage {
    pub name: String,
    pub project: String,
}

/// The disposable prototype instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralInstance {
    pub name: String,
    pub project: String,
    pub zone: String,
}

/// Scratch disk used to stage a tarball bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralDisk {
    pub name: String,
    pub device_name: String,
    /// Instance the disk is attached to, if any.
    pub attached_to: Option<String>,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    ImageResource { name: String, project: String },
    TarballObject { path: String },
}

impl Artifact {
    /// Follow-up instructions for using the artifact.
    pub fn next_steps(&self, zone: &str) -> String {
        match self {
            Artifact::ImageResource { name, project } => format!(
                "Created image {name}.\n\n\
                 Try something like:\n    \
                 gcloud compute instances create {name} \\\n        \
                 --project $PROJECT \\\n        \
                 --image {name} \\\n        \
                 --image-project {project} \\\n        \
                 --machine-type n1-standard-8 \\\n        \
                 --zone {zone} \\\n        \
                 --scopes=compute-rw\n"
            ),
            Artifact::TarballObject { path } => format!(
                "Wrote image tarball {path}.\n\n\
                 Register it as an image with:\n    \
                 gcloud compute images create IMAGE_NAME --source-uri {path}\n"
            ),
        }
    }
}

/// Everything the run discovers, threaded through the tasks.
#[derive(Debug, Default)]
pub struct WorkflowState {
    pub target: Option<TargetImage>,
    /// Resolved source image, looked up at most once per run.
    pub source: Option<SourceImage>,
    pub instance: Option<EphemeralInstance>,
    pub watch: WatchState,
    pub artifact: Option<Artifact>,
}

/// Shared pipeline context.
///
/// The request and settings are read-only; tasks write to `state` and
/// register ephemeral resources with `guard`.
pub struct BakePipelineContext {
    pub run_id: RunId,
    pub request: Arc<WorkflowRequest>,
    pub settings: Arc<BakeSettings>,
    pub api: Arc<dyn ProvisioningApi>,
    pub sink: Arc<dyn SerialSink>,
    pub classifier: Arc<dyn PollFailureClassifier>,
    pub state: WorkflowState,
    pub guard: CleanupGuard,
}

impl BakePipelineContext {
    pub fn new(
        run_id: RunId,
        request: Arc<WorkflowRequest>,
        settings: Arc<BakeSettings>,
        api: Arc<dyn ProvisioningApi>,
        sink: Arc<dyn SerialSink>,
        classifier: Arc<dyn PollFailureClassifier>,
    ) -> Self {
        let guard = CleanupGuard::new(request.target_project.clone(), request.zone.clone());
        Self {
            run_id,
            request,
            settings,
            api,
            sink,
            classifier,
            state: WorkflowState::default(),
            guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_steps_mentions_artifact() {
        let image = Artifact::ImageResource {
            name: "baked".into(),
            project: "proj".into(),
        };
        let text = image.next_steps("us-central1-c");
        assert!(text.starts_with("Created image baked."));
        assert!(text.contains("--image-project proj"));
        assert!(text.contains("--zone us-central1-c"));

        let tarball = Artifact::TarballObject {
            path: "gs://b/x.tar.gz".into(),
        };
        assert!(tarball.next_steps("z").contains("--source-uri gs://b/x.tar.gz"));
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
