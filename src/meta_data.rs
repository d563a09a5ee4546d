//! Driver-wide context and shared volume meta data

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use super::backend::BackendApi;
use super::csi::volume_capability::access_mode::Mode;
use super::csi::volume_capability::AccessType;
use super::csi::{controller_service_capability, VolumeCapability};
use super::error::{DriverError, DriverResult};

/// Utility functions and const variables
pub mod util {
    use std::collections::HashMap;

    /// The default CSI plugin name
    pub const CSI_PLUGIN_NAME: &str = "csi.machina.io";
    /// The CSI plugin version
    pub const CSI_PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");
    /// The default socket file to communicate with the CSI sidecars
    pub const END_POINT: &str = "unix:///tmp/csi.sock";
    /// The default URL of the backend guest API
    pub const BACKEND_URL: &str = "http://127.0.0.1:8443";
    /// Default filesystem root under which custom-volume device paths are
    /// mounted on instances
    pub const MOUNT_ROOT: &str = "/mnt/machina-csi";
    /// Directory where the backend exposes attached volumes as device nodes
    /// inside an instance
    pub const DEVICE_DIR: &str = "/dev/machina";
    /// Suffix of the topology segment key carrying the cluster member name;
    /// the full key is `<driver-name>/cluster-member`
    pub const TOPOLOGY_SEGMENT_MEMBER: &str = "cluster-member";
    /// The storage class parameter naming the backend storage pool
    pub const PARAM_STORAGE_POOL: &str = "storagePool";
    /// Parameter namespace reserved by the CSI sidecars, ignored during
    /// parameter validation
    pub const CSI_PARAM_PREFIX: &str = "csi.storage.k8s.io/";
    /// Sidecar-provided PVC name parameter
    pub const PARAM_PVC_NAME: &str = "csi.storage.k8s.io/pvc/name";
    /// Sidecar-provided PVC namespace parameter
    pub const PARAM_PVC_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";
    /// Volume context key carrying the resolved backend storage driver
    pub const VOLUME_CTX_STORAGE_DRIVER: &str = "storageDriver";
    /// Publish context key carrying the in-instance device path
    pub const PUBLISH_CTX_DEVICE_PATH: &str = "devicePath";
    /// Stable prefix of the description given to driver-managed volumes
    pub const VOLUME_DESCRIPTION: &str = "managed by machina-csi";
    /// The object-storage-only backend driver the CSI cannot use
    pub const REJECTED_STORAGE_DRIVER: &str = "cephobject";
    /// Name prefix the orchestrator gives provisioned claims
    pub const PVC_NAME_PREFIX: &str = "pvc-";
    /// Filesystem used when a volume device carries no signature yet
    pub const DEFAULT_FS_TYPE: &str = "ext4";
    /// Instance device type used for attached volumes
    pub const DEVICE_TYPE_DISK: &str = "disk";

    /// The runtime role of the CSI plugin
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum RunAsRole {
        /// Run both controller and node service
        Both,
        /// Run controller service only
        Controller,
        /// Run node service only
        Node,
    }

    /// The device node path of an attached volume inside an instance
    pub fn device_path(vol_name: &str) -> String {
        format!("{}/{}", DEVICE_DIR, vol_name)
    }

    /// Build the description of a driver-managed volume, naming the claim
    /// when the sidecar passed its identity along
    pub fn volume_description(params: &HashMap<String, String>) -> String {
        match (params.get(PARAM_PVC_NAMESPACE), params.get(PARAM_PVC_NAME)) {
            (Some(namespace), Some(name)) => {
                format!("{} for {}/{}", VOLUME_DESCRIPTION, namespace, name)
            }
            _ => VOLUME_DESCRIPTION.to_owned(),
        }
    }
}

/// The content type of a custom volume
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    /// The volume holds a filesystem
    Filesystem,
    /// The volume is consumed as a raw block device
    Block,
}

impl ContentType {
    /// The backend wire name of this content type
    pub const fn as_str(self) -> &'static str {
        match self {
            ContentType::Filesystem => "filesystem",
            ContentType::Block => "block",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The volume identifier returned from `CreateVolume` and parsed in every
/// subsequent RPC. Encodes the backend cluster member holding the volume
/// (empty for remote storage drivers), the storage pool and the volume name,
/// serialized as `target/pool/name` or `pool/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VolumeId {
    /// Backend cluster member the volume is resident on, `None` when the
    /// volume lives on a globally accessible storage driver
    pub target: Option<String>,
    /// Backend storage pool name
    pub pool: String,
    /// Volume name within the pool
    pub name: String,
}

impl VolumeId {
    /// Compose a volume ID from its parts
    pub fn new(target: Option<String>, pool: String, name: String) -> Self {
        Self { target, pool, name }
    }

    /// Parse a volume ID string. Rejects everything that is not exactly
    /// `pool/name` or `target/pool/name` with non-empty components.
    pub fn parse(raw: &str) -> DriverResult<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        match parts.as_slice() {
            [pool, name] if !pool.is_empty() && !name.is_empty() => Ok(Self {
                target: None,
                pool: (*pool).to_owned(),
                name: (*name).to_owned(),
            }),
            [target, pool, name]
                if !target.is_empty() && !pool.is_empty() && !name.is_empty() =>
            {
                Ok(Self {
                    target: Some((*target).to_owned()),
                    pool: (*pool).to_owned(),
                    name: (*name).to_owned(),
                })
            }
            _ => Err(DriverError::InvalidInput(format!(
                "invalid volume ID {:?}, expected pool/name or target/pool/name",
                raw,
            ))),
        }
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}/{}/{}", target, self.pool, self.name),
            None => write!(f, "{}/{}", self.pool, self.name),
        }
    }
}

/// Derive the access type of a single volume capability
pub fn capability_content_type(cap: &VolumeCapability) -> DriverResult<ContentType> {
    match &cap.access_type {
        Some(AccessType::Mount(..)) => Ok(ContentType::Filesystem),
        Some(AccessType::Block(..)) => Ok(ContentType::Block),
        None => Err(DriverError::InvalidInput(
            "volume capability has neither mount nor block access type".to_owned(),
        )),
    }
}

/// Validate a capability set and derive the single content type shared by
/// all entries. Rejects an empty set, unknown access modes and a mix of
/// block and filesystem access types.
pub fn derive_content_type(caps: &[VolumeCapability]) -> DriverResult<ContentType> {
    if caps.is_empty() {
        return Err(DriverError::InvalidInput(
            "volume capabilities missing in request".to_owned(),
        ));
    }
    let mut content_type = None;
    for cap in caps {
        let mode = cap.access_mode.as_ref().ok_or_else(|| {
            DriverError::InvalidInput("volume capability has no access mode".to_owned())
        })?;
        if Mode::from_i32(mode.mode).map_or(true, |m| m == Mode::Unknown) {
            return Err(DriverError::InvalidInput(format!(
                "unknown volume access mode {}",
                mode.mode,
            )));
        }
        let this = capability_content_type(cap)?;
        match content_type {
            None => content_type = Some(this),
            Some(prev) if prev == this => {}
            Some(prev) => {
                return Err(DriverError::InvalidInput(format!(
                    "volume capabilities mix access types {} and {}",
                    prev, this,
                )));
            }
        }
    }
    content_type.ok_or_else(|| {
        DriverError::InvalidInput("volume capabilities missing in request".to_owned())
    })
}

/// Whether any capability asks for a multi-node access mode. Such modes are
/// only served by globally accessible storage drivers.
pub fn has_multi_node_mode(caps: &[VolumeCapability]) -> bool {
    caps.iter().any(|cap| {
        cap.access_mode.as_ref().map_or(false, |am| {
            matches!(
                Mode::from_i32(am.mode),
                Some(Mode::MultiNodeReaderOnly)
                    | Some(Mode::MultiNodeSingleWriter)
                    | Some(Mode::MultiNodeMultiWriter)
            )
        })
    })
}

/// Process-local registry serializing mutations per volume ID.
///
/// `try_lock` is non-blocking: when the key is already held the caller
/// reports `aborted` and relies on the sidecar retry loop instead of
/// queueing behind the in-flight RPC.
#[derive(Debug, Default)]
pub struct VolumeLockSet {
    held: Mutex<HashSet<String>>,
}

impl VolumeLockSet {
    /// Try to acquire the lock for `key`. Returns the releaser on success
    /// and `None` when the key is already held.
    pub fn try_lock(&self, key: &str) -> Option<VolumeLockGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.insert(key.to_owned()) {
            Some(VolumeLockGuard {
                set: self,
                key: key.to_owned(),
            })
        } else {
            None
        }
    }
}

/// Releaser for a held volume lock; releases on drop.
pub struct VolumeLockGuard<'a> {
    set: &'a VolumeLockSet,
    key: String,
}

impl Drop for VolumeLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .set
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
    }
}

/// Process-wide immutable driver context shared by all servers
pub struct MetaData {
    /// Plugin name returned by the identity service
    driver_name: String,
    /// Plugin version string
    version: String,
    /// Backend instance name this process represents
    node_id: String,
    /// Backend cluster member the instance runs on
    cluster_member: String,
    /// Optional prefix replacing the orchestrator `pvc-` name prefix
    volume_name_prefix: Option<String>,
    /// Filesystem root under which attached volumes are mounted on instances
    mount_root: String,
    /// Whether the backend runs in cluster mode
    clustered: bool,
    /// The controller capabilities this driver declares
    controller_caps: Vec<controller_service_capability::rpc::Type>,
    /// Client for the backend guest API
    backend: Arc<dyn BackendApi>,
    /// Per-volume-ID lock registry
    volume_locks: VolumeLockSet,
}

impl MetaData {
    /// Build the driver context
    pub fn new(
        driver_name: String,
        version: String,
        node_id: String,
        cluster_member: String,
        volume_name_prefix: Option<String>,
        mount_root: String,
        clustered: bool,
        backend: Arc<dyn BackendApi>,
    ) -> Self {
        Self {
            driver_name,
            version,
            node_id,
            cluster_member,
            volume_name_prefix,
            mount_root,
            clustered,
            controller_caps: vec![
                controller_service_capability::rpc::Type::CreateDeleteVolume,
                controller_service_capability::rpc::Type::PublishUnpublishVolume,
            ],
            backend,
            volume_locks: VolumeLockSet::default(),
        }
    }

    /// Get the driver name
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Get the driver version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the cluster member this node's instance runs on. Distinct from
    /// the node ID: volume placement routes on member names, not instance
    /// names.
    pub fn cluster_member(&self) -> &str {
        &self.cluster_member
    }

    /// Get the mount root for attached volumes
    pub fn mount_root(&self) -> &str {
        &self.mount_root
    }

    /// Whether the backend runs in cluster mode
    pub const fn is_clustered(&self) -> bool {
        self.clustered
    }

    /// The controller capabilities this driver declares
    pub fn controller_caps(&self) -> &[controller_service_capability::rpc::Type] {
        &self.controller_caps
    }

    /// The topology segment key carrying the cluster member name
    pub fn topology_key(&self) -> String {
        format!("{}/{}", self.driver_name, util::TOPOLOGY_SEGMENT_MEMBER)
    }

    /// The backend client
    pub fn backend(&self) -> Arc<dyn BackendApi> {
        Arc::clone(&self.backend)
    }

    /// The backend client routed to the volume target. Routing only applies
    /// when the backend is clustered; otherwise every member sees every
    /// pool anyway.
    pub fn backend_for(&self, target: Option<&str>) -> Arc<dyn BackendApi> {
        match target {
            Some(member) if self.clustered => self.backend.with_target(member),
            _ => Arc::clone(&self.backend),
        }
    }

    /// Normalize a requested volume name: when a volume name prefix is
    /// configured, the orchestrator `pvc-` prefix is replaced by it;
    /// otherwise the name is used verbatim.
    pub fn normalize_volume_name(&self, name: &str) -> String {
        match &self.volume_name_prefix {
            Some(prefix) => {
                let trimmed = name.strip_prefix(util::PVC_NAME_PREFIX).unwrap_or(name);
                format!("{}-{}", prefix, trimmed)
            }
            None => name.to_owned(),
        }
    }

    /// The path under the mount root where the backend mounts a
    /// filesystem-content volume inside an instance
    pub fn mount_path(&self, vol_name: &str) -> String {
        format!("{}/{}", self.mount_root, vol_name)
    }

    /// Try to acquire the mutation lock of the given volume
    pub fn try_lock_volume(&self, vol_id: &VolumeId) -> Option<VolumeLockGuard<'_>> {
        self.volume_locks.try_lock(&vol_id.to_string())
    }
}
