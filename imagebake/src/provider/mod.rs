//! Provisioning API surface consumed by the workflow.
//!
//! ## Architecture
//!
//! - **ProvisioningApi**: Every cloud operation the workflow performs
//! - **GcloudCli**: Implementation backed by the vendor command-line tool
//!
//! Calls report the raw exit status with captured output in [`ApiOutput`].
//! The workflow decides which non-zero statuses are fatal, so the trait never
//! folds a failed call into an `Err`. `Err` means the call could not be made
//! at all.

mod gcloud;
#[cfg(test)]
pub(crate) mod recording;

pub use gcloud::GcloudCli;

use chrono::{DateTime, Utc};
use imagebake_shared::{BakeError, BakeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Exit status plus captured output of one API call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiOutput {
    pub status: i32,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Raw length of stdout before decoding. Serial offsets count these.
    pub stdout_bytes: usize,
    pub stderr: String,
}

impl ApiOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        let stdout = stdout.into();
        Self {
            status: 0,
            stdout_bytes: stdout.len(),
            stdout,
            stderr: String::new(),
        }
    }

    /// Output decoded from raw process bytes.
    pub fn from_raw(status: i32, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            status,
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stdout_bytes: stdout.len(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stdout_bytes: 0,
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero status into an error built by `err`.
    pub fn check(self, err: impl FnOnce(String) -> BakeError) -> BakeResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(err(format!(
                "exit status {}: {}",
                self.status,
                self.stderr.trim()
            )))
        }
    }
}

/// One entry from an image listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    pub creation_timestamp: DateTime<Utc>,
}

/// Fully qualified source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub name: String,
    pub project: String,
}

/// Metadata attached to a new instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceMetadata {
    /// Inline key/value pairs.
    pub items: BTreeMap<String, String>,
    /// Values read from local files at creation time.
    pub files: BTreeMap<String, PathBuf>,
}

/// Everything needed to create the prototype instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub project: String,
    pub zone: String,
    pub name: String,
    pub source_image: SourceImage,
    pub machine_type: String,
    pub scopes: Vec<String>,
    pub metadata: InstanceMetadata,
}

/// Resource kinds that can be probed for existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Image,
    StorageObject,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Image => write!(f, "image"),
            ResourceKind::StorageObject => write!(f, "storage object"),
        }
    }
}

/// Result of an existence probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceLookup {
    /// Resource exists; carries its description.
    Found(String),
    NotFound,
}

/// Cloud operations consumed by the workflow.
///
/// Implementations must be usable from a single task at a time; the
/// workflow never issues concurrent calls.
#[async_trait::async_trait]
pub trait ProvisioningApi: Send + Sync {
    /// List images visible from `project`.
    async fn list_images(&self, project: &str) -> BakeResult<Vec<ImageDescriptor>>;

    async fn create_instance(&self, spec: &InstanceSpec) -> BakeResult<ApiOutput>;

    /// Delete an instance. With `keep_boot_disk` the boot disk survives as a
    /// standalone disk named after the instance.
    async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        keep_boot_disk: bool,
    ) -> BakeResult<ApiOutput>;

    async fn create_image(
        &self,
        project: &str,
        name: &str,
        source_disk: &str,
        source_disk_zone: &str,
    ) -> BakeResult<ApiOutput>;

    async fn create_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        size_gb: u32,
    ) -> BakeResult<ApiOutput>;

    async fn attach_disk(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        disk: &str,
        device_name: &str,
    ) -> BakeResult<ApiOutput>;

    async fn detach_disk(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        disk: &str,
    ) -> BakeResult<ApiOutput>;

    async fn delete_disk(&self, project: &str, zone: &str, name: &str) -> BakeResult<ApiOutput>;

    /// Textual description of the instance, including its metadata.
    async fn describe_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> BakeResult<ApiOutput>;

    /// Serial console output starting at byte `offset`.
    async fn get_serial_output(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        offset: usize,
    ) -> BakeResult<ApiOutput>;

    /// Run `command` on the instance over the remote shell channel.
    async fn run_remote_command(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        command: &str,
    ) -> BakeResult<ApiOutput>;

    async fn describe_resource(
        &self,
        project: &str,
        kind: ResourceKind,
        name: &str,
    ) -> BakeResult<ResourceLookup>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_passes_success_through() {
        let out = ApiOutput::ok("done").check(BakeError::Provisioning).unwrap();
        assert_eq!(out.stdout, "done");
    }

    #[test]
    fn test_check_maps_failure() {
        let err = ApiOutput::failed(2, "quota exceeded\n")
            .check(BakeError::Provisioning)
            .unwrap_err();
        assert!(matches!(err, BakeError::Provisioning(_)));
        assert_eq!(
            err.to_string(),
            "provisioning failed: exit status 2: quota exceeded"
        );
    }

    #[test]
    fn test_raw_output_keeps_byte_count() {
        let out = ApiOutput::from_raw(0, b"\xff\xfeabc\n", b"");
        assert_eq!(out.stdout_bytes, 6);
        assert!(out.stdout.len() > 6);
        assert!(out.stdout.ends_with("abc\n"));
    }

    #[test]
    fn test_image_descriptor_from_listing_json() {
        let raw = r#"[{"name": "ubuntu-1404-trusty-v20151113", "family": "ubuntu-1404-lts",
                      "creationTimestamp": "2015-11-13T12:34:56.000-08:00", "status": "READY"}]"#;
        let images: Vec<ImageDescriptor> = serde_json::from_str(raw).unwrap();
        assert_eq!(images[0].name, "ubuntu-1404-trusty-v20151113");
        assert_eq!(images[0].family.as_deref(), Some("ubuntu-1404-lts"));
    }
}
