//! In-memory `ProvisioningApi` that records every call.
//!
//! Simulates just enough cloud behavior for ordering and lifecycle checks:
//! instances own a boot disk named after them, attached disks cannot be
//! deleted or imaged, and the sentinel shows up on a chosen describe call.

use super::{
    ApiOutput, ImageDescriptor, InstanceSpec, ProvisioningApi, ResourceKind, ResourceLookup,
};
use imagebake_shared::BakeResult;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    ListImages,
    CreateInstance(String),
    DeleteInstance { name: String, keep_boot_disk: bool },
    CreateImage { name: String, source_disk: String },
    CreateDisk(String),
    AttachDisk { instance: String, disk: String },
    DetachDisk { instance: String, disk: String },
    DeleteDisk(String),
    DescribeInstance(String),
    GetSerialOutput { offset: usize },
    RunRemoteCommand(String),
    DescribeResource(String),
}

impl ApiCall {
    /// Whether the call changes cloud state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            ApiCall::ListImages
                | ApiCall::DescribeInstance(_)
                | ApiCall::GetSerialOutput { .. }
                | ApiCall::DescribeResource(_)
        )
    }
}

#[derive(Default)]
struct Cloud {
    calls: Vec<ApiCall>,
    instances: BTreeMap<String, BTreeSet<String>>,
    disks: BTreeSet<String>,
    images: BTreeSet<String>,
    objects: BTreeSet<String>,
    describes: usize,
    serial: VecDeque<ApiOutput>,
    instance_metadata: Vec<InstanceSpec>,
}

pub struct RecordingApi {
    listing: Vec<ImageDescriptor>,
    sentinel_key: String,
    sentinel_on_describe: Option<usize>,
    failing: HashSet<&'static str>,
    cloud: Mutex<Cloud>,
}

impl RecordingApi {
    pub fn new(listing: Vec<ImageDescriptor>) -> Self {
        Self {
            listing,
            sentinel_key: crate::settings::DEFAULT_SENTINEL_KEY.to_string(),
            sentinel_on_describe: Some(1),
            failing: HashSet::new(),
            cloud: Mutex::new(Cloud::default()),
        }
    }

    /// The sentinel appears on the `n`th describe call (1-based), or never.
    pub fn sentinel_on(mut self, n: Option<usize>) -> Self {
        self.sentinel_on_describe = n;
        self
    }

    /// Make the named operation return a non-zero status.
    pub fn failing(mut self, op: &'static str) -> Self {
        self.failing.insert(op);
        self
    }

    pub fn with_existing_image(self, name: &str) -> Self {
        self.cloud.lock().images.insert(name.to_string());
        self
    }

    pub fn with_existing_object(self, path: &str) -> Self {
        self.cloud.lock().objects.insert(path.to_string());
        self
    }

    /// Queue serial console responses, returned in order.
    pub fn with_serial(self, outputs: Vec<ApiOutput>) -> Self {
        self.cloud.lock().serial.extend(outputs);
        self
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.cloud.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<ApiCall> {
        self.calls().into_iter().filter(ApiCall::is_mutation).collect()
    }

    pub fn position(&self, call: &ApiCall) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn count(&self, call: &ApiCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn instances(&self) -> Vec<String> {
        self.cloud.lock().instances.keys().cloned().collect()
    }

    pub fn disks(&self) -> Vec<String> {
        self.cloud.lock().disks.iter().cloned().collect()
    }

    pub fn images(&self) -> Vec<String> {
        self.cloud.lock().images.iter().cloned().collect()
    }

    pub fn objects(&self) -> Vec<String> {
        self.cloud.lock().objects.iter().cloned().collect()
    }

    pub fn created_specs(&self) -> Vec<InstanceSpec> {
        self.cloud.lock().instance_metadata.clone()
    }

    fn outcome(&self, op: &'static str) -> Option<ApiOutput> {
        self.failing
            .contains(op)
            .then(|| ApiOutput::failed(1, format!("{} failed", op)))
    }

    fn is_attached(cloud: &Cloud, disk: &str) -> bool {
        cloud
            .instances
            .iter()
            .any(|(name, attached)| name == disk || attached.contains(disk))
    }
}

#[async_trait::async_trait]
impl ProvisioningApi for RecordingApi {
    async fn list_images(&self, _project: &str) -> BakeResult<Vec<ImageDescriptor>> {
        self.cloud.lock().calls.push(ApiCall::ListImages);
        Ok(self.listing.clone())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> BakeResult<ApiOutput> {
        let mut cloud = self.cloud.lock();
        cloud.calls.push(ApiCall::CreateInstance(spec.name.clone()));
        if let Some(failed) = self.outcome("create_instance") {
            return Ok(failed);
        }
        cloud.instance_metadata.push(spec.clone());
        cloud.instances.insert(spec.name.clone(), BTreeSet::new());
        cloud.disks.insert(spec.name.clone());
        Ok(ApiOutput::ok(""))
    }

    async fn delete_instance(
        &self,
        _project: &str,
        _zone: &str,
        name: &str,
        keep_boot_disk: bool,
    ) -> BakeResult<ApiOutput> {
        let mut cloud = self.cloud.lock();
        cloud.calls.push(ApiCall::DeleteInstance {
            name: name.to_string(),
            keep_boot_disk,
        });
        if let Some(failed) = self.outcome("delete_instance") {
            return Ok(failed);
        }
        if cloud.instances.remove(name).is_none() {
            return Ok(ApiOutput::failed(1, "instance not found"));
        }
        if !keep_boot_disk {
            cloud.disks.remove(name);
        }
        Ok(ApiOutput::ok(""))
    }

    async fn create_image(
        &self,
        _project: &str,
        name: &str,
        source_disk: &str,
        _source_disk_zone: &str,
    ) -> BakeResult<ApiOutput> {
        let mut cloud = self.cloud.lock();
        cloud.calls.push(ApiCall::CreateImage {
            name: name.to_string(),
            source_disk: source_disk.to_string(),
        });
        if let Some(failed) = self.outcome("create_image") {
            return Ok(failed);
        }
        if !cloud.disks.contains(source_disk) || Self::is_attached(&cloud, source_disk) {
            return Ok(ApiOutput::failed(1, "source disk unavailable"));
        }
        cloud.images.insert(name.to_string());
        Ok(ApiOutput::ok(""))
    }

    async fn create_disk(
        &self,
        _project: &str,
        _zone: &str,
        name: &str,
        _size_gb: u32,
    ) -> BakeResult<ApiOutput> {
        let mut cloud = self.cloud.lock();
        cloud.calls.push(ApiCall::CreateDisk(name.to_string()));
        if let Some(failed) = self.outcome("create_disk") {
            return Ok(failed);
        }
        cloud.disks.insert(name.to_string());
        Ok(ApiOutput::ok(""))
    }

    async fn attach_disk(
        &self,
        _project: &str,
        _zone: &str,
        instance: &str,
        disk: &str,
        _device_name: &str,
    ) -> BakeResult<ApiOutput> {
        let mut cloud = self.cloud.lock();
        cloud.calls.push(ApiCall::AttachDisk {
            instance: instance.to_string(),
            disk: disk.to_string(),
        });
        if let Some(failed) = self.outcome("attach_disk") {
            return Ok(failed);
        }
        match cloud.instances.get_mut(instance) {
            Some(attached) => {
                attached.insert(disk.to_string());
                Ok(ApiOutput::ok(""))
            }
            None => Ok(ApiOutput::failed(1, "instance not found")),
        }
    }

    async fn detach_disk(
        &self,
        _project: &str,
        _zone: &str,
        instance: &str,
        disk: &str,
    ) -> BakeResult<ApiOutput> {
        let mut cloud = self.cloud.lock();
        cloud.calls.push(ApiCall::DetachDisk {
            instance: instance.to_string(),
            disk: disk.to_string(),
        });
        if let Some(failed) = self.outcome("detach_disk") {
            return Ok(failed);
        }
        let removed = cloud
            .instances
            .get_mut(instance)
            .is_some_and(|attached| attached.remove(disk));
        if removed {
            Ok(ApiOutput::ok(""))
        } else {
            Ok(ApiOutput::failed(1, "disk not attached"))
        }
    }

    async fn delete_disk(&self, _project: &str, _zone: &str, name: &str) -> BakeResult<ApiOutput> {
        let mut cloud = self.cloud.lock();
        cloud.calls.push(ApiCall::DeleteDisk(name.to_string()));
        if let Some(failed) = self.outcome("delete_disk") {
            return Ok(failed);
        }
        if Self::is_attached(&cloud, name) || !cloud.disks.remove(name) {
            return Ok(ApiOutput::failed(1, "disk busy or missing"));
        }
        Ok(ApiOutput::ok(""))
    }

    async fn describe_instance(
        &self,
        _project: &str,
        _zone: &str,
        name: &str,
    ) -> BakeResult<ApiOutput> {
        let mut cloud = self.cloud.lock();
        cloud.calls.push(ApiCall::DescribeInstance(name.to_string()));
        cloud.describes += 1;
        if let Some(failed) = self.outcome("describe_instance") {
            return Ok(failed);
        }
        let mut text = format!("name: {}\nmetadata:\n  items:\n  - key: startup-script\n", name);
        if self
            .sentinel_on_describe
            .is_some_and(|n| cloud.describes >= n)
        {
            text.push_str(&format!("  - key: {}\n    value: done\n", self.sentinel_key));
        }
        Ok(ApiOutput::ok(text))
    }

    async fn get_serial_output(
        &self,
        _project: &str,
        _zone: &str,
        _name: &str,
        offset: usize,
    ) -> BakeResult<ApiOutput> {
        let mut cloud = self.cloud.lock();
        cloud.calls.push(ApiCall::GetSerialOutput { offset });
        Ok(cloud.serial.pop_front().unwrap_or_default())
    }

    async fn run_remote_command(
        &self,
        _project: &str,
        _zone: &str,
        _instance: &str,
        command: &str,
    ) -> BakeResult<ApiOutput> {
        let mut cloud = self.cloud.lock();
        cloud
            .calls
            .push(ApiCall::RunRemoteCommand(command.to_string()));
        if let Some(failed) = self.outcome("run_remote_command") {
            return Ok(failed);
        }
        if let Some(dest) = command
            .split_whitespace()
            .rev()
            .map(|word| word.trim_matches('\''))
            .find(|word| word.starts_with("gs://"))
        {
            cloud.objects.insert(dest.to_string());
        }
        Ok(ApiOutput::ok(""))
    }

    async fn describe_resource(
        &self,
        _project: &str,
        kind: ResourceKind,
        name: &str,
    ) -> BakeResult<ResourceLookup> {
        let mut cloud = self.cloud.lock();
        cloud.calls.push(ApiCall::DescribeResource(name.to_string()));
        let exists = match kind {
            ResourceKind::Image => cloud.images.contains(name),
            ResourceKind::StorageObject => cloud.objects.contains(name),
        };
        Ok(if exists {
            ResourceLookup::Found(format!("name: {}\nstatus: READY\n", name))
        } else {
            ResourceLookup::NotFound
        })
    }
}
