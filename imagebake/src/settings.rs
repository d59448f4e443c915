//! Environment-wide settings for bake runs.
//!
//! Settings hold everything that does not change from one run to the next:
//! machine shape, polling cadence, installer layout. Per-run input lives in
//! [`crate::request::WorkflowRequest`].

use imagebake_shared::{BakeError, BakeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MACHINE_TYPE: &str = "n1-standard-1";
pub const DEFAULT_SOURCE_IMAGE_PROJECT: &str = "ubuntu-os-cloud";
pub const DEFAULT_SOURCE_IMAGE_FAMILY: &str = "ubuntu-1404";
pub const DEFAULT_ZONE: &str = "us-central1-c";
pub const DEFAULT_SENTINEL_KEY: &str = "spinnaker-sentinal";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 8;
pub const DEFAULT_SCRATCH_DISK_SIZE_GB: u32 = 10;
pub const DEFAULT_SCRATCH_DEVICE_NAME: &str = "export-disk";
pub const STORAGE_SCHEME: &str = "gs://";

/// Layout of the installer scripts shipped to the prototype instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallerLayout {
    /// Directory holding the loader and installer scripts.
    pub install_dir: PathBuf,
    /// Directory holding the helper modules.
    pub pylib_dir: PathBuf,
    /// Startup command entry point executed by the loader.
    pub entry_point: String,
    /// Loader executed as the instance startup script.
    pub loader_script: String,
    /// Helper modules shipped verbatim, keyed by metadata key.
    pub helper_modules: Vec<(String, String)>,
    /// Installer modules shipped after flattening, keyed by metadata key.
    pub installer_modules: Vec<(String, String)>,
    /// Module prefixes stripped so installer modules import flat.
    pub flatten_prefixes: Vec<(String, String)>,
}

impl Default for InstallerLayout {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("install"),
            pylib_dir: PathBuf::from("pylib"),
            entry_point: "install_spinnaker.py".to_string(),
            loader_script: "google_install_loader.py".to_string(),
            helper_modules: vec![
                ("py_fetch".to_string(), "fetch.py".to_string()),
                ("py_run".to_string(), "run.py".to_string()),
            ],
            installer_modules: vec![
                (
                    "py_install_spinnaker".to_string(),
                    "install_spinnaker.py".to_string(),
                ),
                (
                    "py_install_runtime_dependencies".to_string(),
                    "install_runtime_dependencies.py".to_string(),
                ),
            ],
            flatten_prefixes: vec![
                ("install.install".to_string(), "install".to_string()),
                ("pylib.".to_string(), String::new()),
            ],
        }
    }
}

/// Static settings shared by every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeSettings {
    pub machine_type: String,
    pub scopes: Vec<String>,
    pub source_image_project: String,
    pub source_image_family: String,
    pub zone: String,
    /// Metadata key the installer sets when it finishes.
    pub sentinel_key: String,
    pub poll_interval_secs: u64,
    /// Consecutive describe failures, or polling tool crashes, tolerated
    /// before the watch gives up.
    pub max_poll_failures: u32,
    /// Upper bound on the whole watch. `None` waits indefinitely.
    pub watch_deadline_secs: Option<u64>,
    pub scratch_disk_size_gb: u32,
    pub scratch_device_name: String,
    /// Root that bare release names are resolved against.
    pub release_repository: String,
    pub installer: InstallerLayout,
    pub gcloud_binary: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl Default for BakeSettings {
    fn default() -> Self {
        Self {
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
            scopes: vec!["compute-rw".to_string(), "storage-rw".to_string()],
            source_image_project: DEFAULT_SOURCE_IMAGE_PROJECT.to_string(),
            source_image_family: DEFAULT_SOURCE_IMAGE_FAMILY.to_string(),
            zone: DEFAULT_ZONE.to_string(),
            sentinel_key: DEFAULT_SENTINEL_KEY.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_poll_failures: 5,
            watch_deadline_secs: None,
            scratch_disk_size_gb: DEFAULT_SCRATCH_DISK_SIZE_GB,
            scratch_device_name: DEFAULT_SCRATCH_DEVICE_NAME.to_string(),
            release_repository: STORAGE_SCHEME.to_string(),
            installer: InstallerLayout::default(),
            gcloud_binary: PathBuf::from("gcloud"),
            log_dir: None,
        }
    }
}

impl BakeSettings {
    /// Load settings from a JSON file. Absent fields take their defaults.
    pub fn load(path: &Path) -> BakeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BakeError::Validation(format!(
                "Failed to read settings file {}: {}",
                path.display(),
                e
            ))
        })?;
        let settings: Self = serde_json::from_str(&raw).map_err(|e| {
            BakeError::Validation(format!(
                "Invalid settings file {}: {}",
                path.display(),
                e
            ))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> BakeResult<()> {
        if self.machine_type.is_empty() {
            return Err(BakeError::Validation("machine_type cannot be empty".into()));
        }
        if self.sentinel_key.is_empty() {
            return Err(BakeError::Validation("sentinel_key cannot be empty".into()));
        }
        if self.scratch_disk_size_gb == 0 {
            return Err(BakeError::Validation(
                "scratch_disk_size_gb must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn watch_deadline(&self) -> Option<Duration> {
        self.watch_deadline_secs.map(Duration::from_secs)
    }

    /// Default log directory: `$HOME/.imagebake/logs`.
    pub fn resolved_log_dir(&self) -> Option<PathBuf> {
        self.log_dir
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".imagebake").join("logs")))
    }
}
