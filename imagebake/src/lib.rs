//! imagebake: bake a cloud machine image with a release pre-installed.
//!
//! A run resolves its target and source image, refuses to overwrite an
//! existing artifact, boots a disposable prototype instance that installs
//! the release, waits for the installer to signal completion, and extracts
//! the result as either a registered image or a bundled tarball. Every
//! ephemeral resource is torn down afterwards, whatever the outcome.

pub mod logging;
pub mod packaging;
pub mod pipeline;
pub mod provider;
pub mod request;
pub mod settings;
pub mod workflow;

pub use imagebake_shared::{BakeError, BakeResult};
pub use provider::{GcloudCli, ProvisioningApi};
pub use request::{OutputMode, SourceSelector, WorkflowRequest};
pub use settings::BakeSettings;
pub use workflow::{Artifact, BakeOutcome, BakeWorkflow};
