//! `ProvisioningApi` backed by the gcloud command-line tool.

use super::{
    ApiOutput, ImageDescriptor, InstanceSpec, ProvisioningApi, ResourceKind, ResourceLookup,
};
use imagebake_shared::{BakeError, BakeResult};
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Runs gcloud as a subprocess per call.
///
/// Arguments are passed as a vector, never through a local shell. A remote
/// command is still interpreted by the instance's shell; callers quote it.
#[derive(Debug, Clone)]
pub struct GcloudCli {
    binary: PathBuf,
}

impl GcloudCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Project configured as the gcloud default, if any.
    pub async fn default_project(&self) -> BakeResult<Option<String>> {
        let output = self
            .run(vec!["config".into(), "list".into()])
            .await?
            .check(BakeError::Validation)?;
        Ok(parse_default_project(&output.stdout))
    }

    async fn run(&self, args: Vec<String>) -> BakeResult<ApiOutput> {
        tracing::debug!(binary = %self.binary.display(), args = ?args, "Running gcloud");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            let err_msg = format!("Failed to run {}: {}", self.binary.display(), e);
            tracing::error!("{}", err_msg);
            BakeError::Provisioning(err_msg)
        })?;

        let result = ApiOutput::from_raw(
            output.status.code().unwrap_or(-1),
            &output.stdout,
            &output.stderr,
        );
        if !result.success() {
            tracing::debug!(status = result.status, stderr = %result.stderr.trim(), "gcloud call failed");
        }
        Ok(result)
    }
}

impl Default for GcloudCli {
    fn default() -> Self {
        Self::new("gcloud")
    }
}

fn parse_default_project(config_listing: &str) -> Option<String> {
    let re = Regex::new(r"(?m)^project = (.+)$").ok()?;
    re.captures(config_listing)
        .map(|caps| caps[1].trim().to_string())
        .filter(|project| !project.is_empty())
}

/// Whether a failed describe means the resource is absent, as opposed to an
/// auth, quota or network failure.
fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["was not found", "not found: 404", "notfound", "matched no objects"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

fn scoped(args: &[&str], project: &str, zone: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
    out.push(format!("--project={}", project));
    if let Some(zone) = zone {
        out.push(format!("--zone={}", zone));
    }
    out
}

fn join_pairs<'a, V: std::fmt::Display + 'a>(
    pairs: impl IntoIterator<Item = (&'a String, V)>,
) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

fn create_instance_args(spec: &InstanceSpec) -> Vec<String> {
    let mut args = scoped(
        &["compute", "instances", "create", &spec.name],
        &spec.project,
        Some(&spec.zone),
    );
    args.push(format!("--image={}", spec.source_image.name));
    args.push(format!("--image-project={}", spec.source_image.project));
    args.push(format!("--machine-type={}", spec.machine_type));
    args.push(format!("--scopes={}", spec.scopes.join(",")));
    if !spec.metadata.items.is_empty() {
        args.push(format!("--metadata={}", join_pairs(&spec.metadata.items)));
    }
    if !spec.metadata.files.is_empty() {
        args.push(format!(
            "--metadata-from-file={}",
            join_pairs(spec.metadata.files.iter().map(|(k, v)| (k, v.display())))
        ));
    }
    args
}

#[async_trait::async_trait]
impl ProvisioningApi for GcloudCli {
    async fn list_images(&self, project: &str) -> BakeResult<Vec<ImageDescriptor>> {
        let output = self
            .run(scoped(
                &["compute", "images", "list", "--format=json"],
                project,
                None,
            ))
            .await?
            .check(BakeError::Provisioning)?;
        serde_json::from_str(&output.stdout).map_err(|e| {
            BakeError::Provisioning(format!("Unparseable image listing for {}: {}", project, e))
        })
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> BakeResult<ApiOutput> {
        self.run(create_instance_args(spec)).await
    }

    async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        keep_boot_disk: bool,
    ) -> BakeResult<ApiOutput> {
        let disks = if keep_boot_disk {
            "--keep-disks=boot"
        } else {
            "--delete-disks=all"
        };
        self.run(scoped(
            &["compute", "instances", "delete", name, "--quiet", disks],
            project,
            Some(zone),
        ))
        .await
    }

    async fn create_image(
        &self,
        project: &str,
        name: &str,
        source_disk: &str,
        source_disk_zone: &str,
    ) -> BakeResult<ApiOutput> {
        let disk = format!("--source-disk={}", source_disk);
        let disk_zone = format!("--source-disk-zone={}", source_disk_zone);
        self.run(scoped(
            &["compute", "images", "create", name, &disk, &disk_zone],
            project,
            None,
        ))
        .await
    }

    async fn create_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        size_gb: u32,
    ) -> BakeResult<ApiOutput> {
        let size = format!("--size={}GB", size_gb);
        self.run(scoped(
            &["compute", "disks", "create", name, &size],
            project,
            Some(zone),
        ))
        .await
    }

    async fn attach_disk(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        disk: &str,
        device_name: &str,
    ) -> BakeResult<ApiOutput> {
        let disk = format!("--disk={}", disk);
        let device = format!("--device-name={}", device_name);
        self.run(scoped(
            &["compute", "instances", "attach-disk", instance, &disk, &device],
            project,
            Some(zone),
        ))
        .await
    }

    async fn detach_disk(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        disk: &str,
    ) -> BakeResult<ApiOutput> {
        let disk = format!("--disk={}", disk);
        self.run(scoped(
            &["compute", "instances", "detach-disk", instance, &disk, "--quiet"],
            project,
            Some(zone),
        ))
        .await
    }

    async fn delete_disk(&self, project: &str, zone: &str, name: &str) -> BakeResult<ApiOutput> {
        self.run(scoped(
            &["compute", "disks", "delete", name, "--quiet"],
            project,
            Some(zone),
        ))
        .await
    }

    async fn describe_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> BakeResult<ApiOutput> {
        self.run(scoped(
            &["compute", "instances", "describe", name],
            project,
            Some(zone),
        ))
        .await
    }

    async fn get_serial_output(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        offset: usize,
    ) -> BakeResult<ApiOutput> {
        let start = format!("--start={}", offset);
        self.run(scoped(
            &["compute", "instances", "get-serial-port-output", name, &start],
            project,
            Some(zone),
        ))
        .await
    }

    async fn run_remote_command(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        command: &str,
    ) -> BakeResult<ApiOutput> {
        let command = format!("--command={}", command);
        self.run(scoped(
            &["compute", "ssh", instance, &command],
            project,
            Some(zone),
        ))
        .await
    }

    async fn describe_resource(
        &self,
        project: &str,
        kind: ResourceKind,
        name: &str,
    ) -> BakeResult<ResourceLookup> {
        let args = match kind {
            ResourceKind::Image => scoped(&["compute", "images", "describe", name], project, None),
            ResourceKind::StorageObject => {
                scoped(&["storage", "objects", "describe", name], project, None)
            }
        };
        let output = self.run(args).await?;
        if output.success() {
            Ok(ResourceLookup::Found(output.stdout))
        } else if is_not_found(&output.stderr) {
            Ok(ResourceLookup::NotFound)
        } else {
            Err(BakeError::Provisioning(format!(
                "could not check whether {} {} exists: {}",
                kind,
                name,
                output.stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{InstanceMetadata, SourceImage};
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_default_project() {
        let listing = "[core]\naccount = dev@example.com\nproject = my-project\n";
        assert_eq!(parse_default_project(listing), Some("my-project".into()));
        assert_eq!(parse_default_project("[core]\naccount = x\n"), None);
    }

    #[test]
    fn test_create_instance_args() {
        let mut items = BTreeMap::new();
        items.insert("startup_py_command".to_string(), "a.py+--x".to_string());
        let mut files = BTreeMap::new();
        files.insert("startup-script".to_string(), PathBuf::from("/tmp/loader.py"));

        let spec = InstanceSpec {
            project: "proj".into(),
            zone: "us-central1-c".into(),
            name: "proto".into(),
            source_image: SourceImage {
                name: "ubuntu-1404-v1".into(),
                project: "ubuntu-os-cloud".into(),
            },
            machine_type: "n1-standard-1".into(),
            scopes: vec!["compute-rw".into(), "storage-rw".into()],
            metadata: InstanceMetadata { items, files },
        };

        let args = create_instance_args(&spec);
        assert_eq!(&args[..4], ["compute", "instances", "create", "proto"]);
        assert!(args.contains(&"--project=proj".to_string()));
        assert!(args.contains(&"--image-project=ubuntu-os-cloud".to_string()));
        assert!(args.contains(&"--scopes=compute-rw,storage-rw".to_string()));
        assert!(args.contains(&"--metadata=startup_py_command=a.py+--x".to_string()));
        assert!(args.contains(&"--metadata-from-file=startup-script=/tmp/loader.py".to_string()));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found(
            "ERROR: (gcloud.compute.images.describe) Could not fetch resource:\n \
             - The resource 'projects/p/global/images/x' was not found\n"
        ));
        assert!(is_not_found("ERROR: (gcloud.storage.objects.describe) gs://b/x.tar.gz not found: 404."));
        assert!(!is_not_found(
            "ERROR: (gcloud.compute.images.describe) There was a problem refreshing your current auth tokens"
        ));
        assert!(!is_not_found("ERROR: Quota exceeded for quota metric 'Read requests'"));
    }

    /// Executable standing in for gcloud that prints `body` via printf.
    #[cfg(unix)]
    fn fake_gcloud(dir: &std::path::Path, body: &str, status: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("gcloud");
        std::fs::write(&path, format!("#!/bin/sh\nprintf '{}'\nexit {}\n", body, status)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serial_output_counts_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let api = GcloudCli::new(fake_gcloud(dir.path(), "\\377\\376abc\\n", 0));

        let out = api.get_serial_output("proj", "zone", "proto", 0).await.unwrap();

        assert!(out.success());
        assert_eq!(out.stdout_bytes, 6);
        assert!(out.stdout.ends_with("abc\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_describe_resource_auth_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let api = GcloudCli::new(fake_gcloud(dir.path(), "", 1));

        // No not-found marker on stderr: the probe itself failed.
        let err = api
            .describe_resource("proj", ResourceKind::Image, "baked")
            .await
            .unwrap_err();
        assert!(matches!(err, BakeError::Provisioning(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_provisioning_error() {
        let api = GcloudCli::new("/nonexistent/gcloud-binary");
        let err = api
            .describe_instance("proj", "zone", "name")
            .await
            .unwrap_err();
        assert!(matches!(err, BakeError::Provisioning(_)));
    }
}
