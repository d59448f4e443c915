//! Per-run workflow input.
//!
//! A [`WorkflowRequest`] is built once, validated, and then only read.
//! Everything the run discovers along the way goes into
//! [`crate::workflow::WorkflowState`].

use crate::settings::{BakeSettings, STORAGE_SCHEME};
use imagebake_shared::{BakeError, BakeResult};

/// Where the source image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    /// Use this image verbatim.
    Image(String),
    /// Use the newest image whose name starts with this prefix.
    Family(String),
}

/// Which artifact the run produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Register a machine image from the boot disk.
    Image,
    /// Bundle the boot disk and copy it to a storage object.
    Tarball { destination: String },
}

impl OutputMode {
    pub fn label(&self) -> &'static str {
        match self {
            OutputMode::Image => "image",
            OutputMode::Tarball { .. } => "tarball",
        }
    }

    pub fn tarball_destination(&self) -> Option<&str> {
        match self {
            OutputMode::Image => None,
            OutputMode::Tarball { destination } => Some(destination),
        }
    }
}

/// Immutable description of one bake run.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    /// Release the installer deploys, e.g. `gs://bucket/my_release`.
    pub release_path: String,
    /// Explicit artifact name. Derived from `release_path` when absent.
    pub target_image: Option<String>,
    pub target_project: String,
    pub source: SourceSelector,
    pub source_image_project: String,
    pub zone: String,
    pub instance_name: String,
    pub output: OutputMode,
    pub extra_install_flags: Vec<String>,
    pub skip_components: bool,
    pub skip_dependencies: bool,
    pub update_os: bool,
    /// Stream the instance serial console while waiting.
    pub trace: bool,
}

impl WorkflowRequest {
    /// Request with defaults taken from `settings`.
    pub fn new(
        settings: &BakeSettings,
        release_path: impl Into<String>,
        target_project: impl Into<String>,
    ) -> Self {
        Self {
            release_path: release_path.into(),
            target_image: None,
            target_project: target_project.into(),
            source: SourceSelector::Family(settings.source_image_family.clone()),
            source_image_project: settings.source_image_project.clone(),
            zone: settings.zone.clone(),
            instance_name: default_instance_name(&current_user()),
            output: OutputMode::Image,
            extra_install_flags: Vec::new(),
            skip_components: false,
            skip_dependencies: false,
            update_os: false,
            trace: false,
        }
    }

    pub fn with_target_image(mut self, name: impl Into<String>) -> Self {
        self.target_image = Some(name.into());
        self
    }

    pub fn with_source(mut self, source: SourceSelector) -> Self {
        self.source = source;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    /// Name of the artifact this run creates.
    ///
    /// Falls back to the release basename with underscores turned into
    /// hyphens, since image names may not contain underscores.
    pub fn target_image_name(&self) -> String {
        match &self.target_image {
            Some(name) if !name.is_empty() => name.clone(),
            _ => derive_image_name(&self.release_path),
        }
    }

    /// Check every invariant that must hold before any resource is touched.
    pub fn validate(&self) -> BakeResult<()> {
        if self.release_path.is_empty() {
            return Err(BakeError::Validation(
                "release path cannot be empty; specify a release or a release path".into(),
            ));
        }
        if self.target_project.is_empty() {
            return Err(BakeError::Validation("target project cannot be empty".into()));
        }
        if self.target_image_name().is_empty() {
            return Err(BakeError::Validation(format!(
                "cannot derive an image name from release path {:?}",
                self.release_path
            )));
        }
        if self.instance_name.is_empty() {
            return Err(BakeError::Validation("instance name cannot be empty".into()));
        }
        if self.zone.is_empty() {
            return Err(BakeError::Validation("zone cannot be empty".into()));
        }
        match &self.source {
            SourceSelector::Image(name) | SourceSelector::Family(name) if name.is_empty() => {
                return Err(BakeError::Validation(
                    "source image or family cannot be empty".into(),
                ));
            }
            _ => {}
        }
        if let OutputMode::Tarball { destination } = &self.output {
            if !destination.starts_with(STORAGE_SCHEME) {
                return Err(BakeError::Validation(format!(
                    "tarball path must be a {} path, got {:?}",
                    STORAGE_SCHEME, destination
                )));
            }
            if let Some(bad) = destination.chars().find(|c| !is_object_path_char(*c)) {
                return Err(BakeError::Validation(format!(
                    "tarball path {:?} contains unsupported character {:?}",
                    destination, bad
                )));
            }
            if tarball_file_name(destination).is_empty() {
                return Err(BakeError::Validation(format!(
                    "tarball path {:?} has no object name",
                    destination
                )));
            }
        }
        Ok(())
    }
}

/// Characters allowed in a tarball destination. It ends up in a remote
/// shell command, so shell metacharacters and whitespace are rejected.
fn is_object_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_./:~@+=".contains(c)
}

/// Expand a bare release name against the release repository root.
pub fn release_path_for(repository: &str, release_name: &str) -> String {
    format!("{}{}", repository, release_name)
}

pub fn derive_image_name(release_path: &str) -> String {
    release_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .replace('_', "-")
}

/// Final path component of a storage destination.
pub fn tarball_file_name(destination: &str) -> &str {
    destination.rsplit('/').next().unwrap_or_default()
}

pub fn default_instance_name(user: &str) -> String {
    format!(
        "{}-build-image-{}",
        user,
        chrono::Local::now().format("%Y%m%d%H%M%S")
    )
}

fn current_user() -> String {
    std::env::var("USER")
        .ok()
        .filter(|user| !user.is_empty())
        .map(|user| user.to_lowercase().replace('_', "-"))
        .unwrap_or_else(|| "imagebake".to_string())
}
