//! Ephemeral resource tracking and teardown.
//!
//! Tasks register every resource they create with the [`CleanupGuard`]. The
//! workflow calls [`CleanupGuard::cleanup`] on every exit path. Teardown is
//! best-effort: failures are logged and collected into a [`CleanupReport`],
//! never returned as errors.

use super::types::EphemeralDisk;
use crate::provider::ProvisioningApi;
use tempfile::TempPath;

/// Failures encountered while tearing down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Tracks ephemeral resources for one run.
///
/// If dropped while still armed (the run future was cancelled before
/// `cleanup` ran), payload files are still removed but remote resources can
/// only be reported.
pub struct CleanupGuard {
    project: String,
    zone: String,
    payload_files: Vec<TempPath>,
    scratch_disk: Option<EphemeralDisk>,
    instance: Option<String>,
    boot_disk: Option<String>,
    failures: Vec<String>,
    armed: bool,
}

impl CleanupGuard {
    pub fn new(project: String, zone: String) -> Self {
        Self {
            project,
            zone,
            payload_files: Vec::new(),
            scratch_disk: None,
            instance: None,
            boot_disk: None,
            failures: Vec::new(),
            armed: true,
        }
    }

    /// Register staged metadata payload files.
    pub fn track_payloads(&mut self, files: Vec<TempPath>) {
        self.payload_files.extend(files);
    }

    /// Remove staged payload files now.
    pub fn release_payloads(&mut self) {
        for file in self.payload_files.drain(..) {
            let path = file.to_path_buf();
            if let Err(e) = file.close() {
                tracing::warn!(path = %path.display(), "Failed to remove payload file: {}", e);
                self.failures
                    .push(format!("payload file {}: {}", path.display(), e));
            }
        }
    }

    pub fn track_instance(&mut self, name: &str) {
        self.instance = Some(name.to_string());
    }

    /// The instance is gone but its boot disk was kept.
    pub fn instance_deleted_keeping_disk(&mut self) {
        if let Some(name) = self.instance.take() {
            self.boot_disk = Some(name);
        }
    }

    pub fn track_scratch_disk(&mut self, disk: EphemeralDisk) {
        self.scratch_disk = Some(disk);
    }

    pub fn mark_scratch_attached(&mut self, instance: &str) {
        if let Some(disk) = self.scratch_disk.as_mut() {
            disk.attached_to = Some(instance.to_string());
        }
    }

    /// Hand the scratch disk to the caller for scoped teardown.
    ///
    /// Once taken, `cleanup` no longer touches it.
    pub fn take_scratch_disk(&mut self) -> Option<EphemeralDisk> {
        self.scratch_disk.take()
    }

    pub fn take_boot_disk(&mut self) -> Option<String> {
        self.boot_disk.take()
    }

    /// Record teardown failures from scoped cleanup.
    pub fn record_failures(&mut self, failures: Vec<String>) {
        self.failures.extend(failures);
    }

    /// Tear down everything still registered.
    ///
    /// Order: payload files, scratch disk (detach, then delete), instance
    /// with all its disks, then a retained boot disk.
    pub async fn cleanup(&mut self, api: &dyn ProvisioningApi) -> CleanupReport {
        self.release_payloads();

        if let Some(disk) = self.scratch_disk.take() {
            let failures = release_scratch_disk(api, &self.project, &self.zone, &disk).await;
            self.failures.extend(failures);
        }

        if let Some(instance) = self.instance.take() {
            tracing::info!(instance = %instance, "Deleting prototype instance");
            if let Some(failure) = delete_instance(api, &self.project, &self.zone, &instance).await
            {
                self.failures.push(failure);
            }
        }

        if let Some(disk) = self.boot_disk.take()
            && let Some(failure) = delete_disk(api, &self.project, &self.zone, &disk).await
        {
            self.failures.push(failure);
        }

        self.armed = false;
        CleanupReport {
            failures: std::mem::take(&mut self.failures),
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut leaked = Vec::new();
        if let Some(instance) = &self.instance {
            leaked.push(format!("instance {}", instance));
        }
        if let Some(disk) = &self.scratch_disk {
            leaked.push(format!("disk {}", disk.name));
        }
        if let Some(disk) = &self.boot_disk {
            leaked.push(format!("disk {}", disk));
        }
        if !leaked.is_empty() {
            tracing::warn!(
                project = %self.project,
                zone = %self.zone,
                "Bake run dropped before cleanup, leaking: {}",
                leaked.join(", ")
            );
        }
    }
}

/// Detach (if attached) then delete a scratch disk. Returns failures.
pub async fn release_scratch_disk(
    api: &dyn ProvisioningApi,
    project: &str,
    zone: &str,
    disk: &EphemeralDisk,
) -> Vec<String> {
    let mut failures = Vec::new();

    if let Some(instance) = &disk.attached_to {
        tracing::info!(disk = %disk.name, instance = %instance, "Detaching scratch disk");
        match api.detach_disk(project, zone, instance, &disk.name).await {
            Ok(out) if out.success() => {}
            Ok(out) => {
                tracing::warn!(disk = %disk.name, status = out.status, "Failed to detach scratch disk: {}", out.stderr.trim());
                failures.push(format!("detach disk {}: {}", disk.name, out.stderr.trim()));
            }
            Err(e) => {
                tracing::warn!(disk = %disk.name, "Failed to detach scratch disk: {}", e);
                failures.push(format!("detach disk {}: {}", disk.name, e));
            }
        }
    }

    if let Some(failure) = delete_disk(api, project, zone, &disk.name).await {
        failures.push(failure);
    }
    failures
}

pub async fn delete_disk(
    api: &dyn ProvisioningApi,
    project: &str,
    zone: &str,
    disk: &str,
) -> Option<String> {
    tracing::info!(disk = %disk, "Deleting disk");
    match api.delete_disk(project, zone, disk).await {
        Ok(out) if out.success() => None,
        Ok(out) => {
            tracing::warn!(disk = %disk, status = out.status, "Failed to delete disk: {}", out.stderr.trim());
            Some(format!("delete disk {}: {}", disk, out.stderr.trim()))
        }
        Err(e) => {
            tracing::warn!(disk = %disk, "Failed to delete disk: {}", e);
            Some(format!("delete disk {}: {}", disk, e))
        }
    }
}

async fn delete_instance(
    api: &dyn ProvisioningApi,
    project: &str,
    zone: &str,
    instance: &str,
) -> Option<String> {
    match api.delete_instance(project, zone, instance, false).await {
        Ok(out) if out.success() => None,
        Ok(out) => {
            tracing::warn!(instance = %instance, status = out.status, "Failed to delete instance: {}", out.stderr.trim());
            Some(format!("delete instance {}: {}", instance, out.stderr.trim()))
        }
        Err(e) => {
            tracing::warn!(instance = %instance, "Failed to delete instance: {}", e);
            Some(format!("delete instance {}: {}", instance, e))
        }
    }
}
