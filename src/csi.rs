// CSI v1 protocol messages, maintained by hand from the upstream
// container-storage-interface spec. Only the messages of the RPCs this
// driver serves are kept; anything else answers Unimplemented through the
// service router in `csi_grpc`.

use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPluginInfoRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPluginInfoResponse {
    /// Plugin name in reverse domain name notation. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Opaque vendor version. This field is REQUIRED.
    #[prost(string, tag = "2")]
    pub vendor_version: String,
    /// Optional opaque metadata.
    #[prost(map = "string, string", tag = "3")]
    pub manifest: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPluginCapabilitiesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPluginCapabilitiesResponse {
    /// All capabilities the plugin supports.
    #[prost(message, repeated, tag = "1")]
    pub capabilities: Vec<PluginCapability>,
}

/// Specifies a capability of the plugin.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PluginCapability {
    #[prost(oneof = "plugin_capability::Type", tags = "1")]
    pub r#type: Option<plugin_capability::Type>,
}

pub mod plugin_capability {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Service {
        #[prost(enumeration = "service::Type", tag = "1")]
        pub r#type: i32,
    }

    pub mod service {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum Type {
            Unknown = 0,
            /// The plugin provides RPCs for the controller service. The
            /// presence of this capability determines whether the CO will
            /// invoke controller RPCs.
            ControllerService = 1,
            /// Volumes for this plugin may not be equally accessible by all
            /// nodes in the cluster; the CO must use the reported topology
            /// when scheduling workloads.
            VolumeAccessibilityConstraints = 2,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        /// Service that the plugin supports.
        #[prost(message, tag = "1")]
        Service(Service),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProbeRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProbeResponse {
    /// Readiness of the plugin. When unset the CO assumes the plugin is
    /// ready.
    #[prost(message, optional, tag = "1")]
    pub ready: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateVolumeRequest {
    /// Suggested volume name, generated by the CO for idempotency.
    /// This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Capacity requirement of the volume to be provisioned.
    #[prost(message, optional, tag = "2")]
    pub capacity_range: Option<CapacityRange>,
    /// Capabilities the provisioned volume must have. This field is
    /// REQUIRED.
    #[prost(message, repeated, tag = "3")]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Plugin-specific parameters, opaque to the CO.
    #[prost(map = "string, string", tag = "4")]
    pub parameters: HashMap<String, String>,
    /// Secrets required to complete the call.
    #[prost(map = "string, string", tag = "5")]
    pub secrets: HashMap<String, String>,
    /// Source to pre-populate the new volume from.
    #[prost(message, optional, tag = "6")]
    pub volume_content_source: Option<VolumeContentSource>,
    /// Topological accessibility requirements for the provisioned volume.
    #[prost(message, optional, tag = "7")]
    pub accessibility_requirements: Option<TopologyRequirement>,
}

/// Specifies what source the volume will be created from.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeContentSource {
    #[prost(oneof = "volume_content_source::Type", tags = "1, 2")]
    pub r#type: Option<volume_content_source::Type>,
}

pub mod volume_content_source {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SnapshotSource {
        /// Identity of the existing source snapshot.
        #[prost(string, tag = "1")]
        pub snapshot_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VolumeSource {
        /// Identity of the existing source volume.
        #[prost(string, tag = "1")]
        pub volume_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "1")]
        Snapshot(SnapshotSource),
        #[prost(message, tag = "2")]
        Volume(VolumeSource),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateVolumeResponse {
    /// Attributes of the newly created volume. This field is REQUIRED.
    #[prost(message, optional, tag = "1")]
    pub volume: Option<Volume>,
}

/// Specify a capability of a volume.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeCapability {
    /// This is a REQUIRED field.
    #[prost(message, optional, tag = "3")]
    pub access_mode: Option<volume_capability::AccessMode>,
    /// Specifies what API the volume will be accessed using. One of the
    /// following fields MUST be specified.
    #[prost(oneof = "volume_capability::AccessType", tags = "1, 2")]
    pub access_type: Option<volume_capability::AccessType>,
}

pub mod volume_capability {
    /// The volume will be accessed via the block device API.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BlockVolume {}

    /// The volume will be accessed via the filesystem API.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MountVolume {
        /// The filesystem type. An empty string is equal to an unspecified
        /// field value.
        #[prost(string, tag = "1")]
        pub fs_type: String,
        /// Mount options for the volume.
        #[prost(string, repeated, tag = "2")]
        pub mount_flags: Vec<String>,
    }

    /// Specify how a volume can be accessed.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AccessMode {
        /// This field is REQUIRED.
        #[prost(enumeration = "access_mode::Mode", tag = "1")]
        pub mode: i32,
    }

    pub mod access_mode {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum Mode {
            Unknown = 0,
            /// Published once as read/write on a single node, at any given
            /// time.
            SingleNodeWriter = 1,
            /// Published once as readonly on a single node, at any given
            /// time.
            SingleNodeReaderOnly = 2,
            /// Published as readonly at multiple nodes simultaneously.
            MultiNodeReaderOnly = 3,
            /// Published at multiple nodes simultaneously, only one of them
            /// read/write.
            MultiNodeSingleWriter = 4,
            /// Published as read/write at multiple nodes simultaneously.
            MultiNodeMultiWriter = 5,
            /// Published once as read/write at a single workload on a
            /// single node, at any given time.
            SingleNodeSingleWriter = 6,
            /// Published as read/write at multiple workloads on a single
            /// node simultaneously.
            SingleNodeMultiWriter = 7,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum AccessType {
        #[prost(message, tag = "1")]
        Block(BlockVolume),
        #[prost(message, tag = "2")]
        Mount(MountVolume),
    }
}

/// The capacity of the storage space in bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CapacityRange {
    /// Volume MUST be at least this big. A value of 0 is equal to an
    /// unspecified field value.
    #[prost(int64, tag = "1")]
    pub required_bytes: i64,
    /// Volume MUST NOT be bigger than this.
    #[prost(int64, tag = "2")]
    pub limit_bytes: i64,
}

/// Information about a specific volume.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Volume {
    /// Capacity in bytes, 0 when unknown.
    #[prost(int64, tag = "1")]
    pub capacity_bytes: i64,
    /// Plugin-generated identifier used by the CO in all subsequent calls.
    /// This field is REQUIRED.
    #[prost(string, tag = "2")]
    pub volume_id: String,
    /// Opaque static properties of the volume, passed back to validation
    /// and publishing calls.
    #[prost(map = "string, string", tag = "3")]
    pub volume_context: HashMap<String, String>,
    /// Set when the volume is pre-populated from the specified source.
    #[prost(message, optional, tag = "4")]
    pub content_source: Option<VolumeContentSource>,
    /// Topologies the provisioned volume is accessible from.
    #[prost(message, repeated, tag = "5")]
    pub accessible_topology: Vec<Topology>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopologyRequirement {
    /// Topologies the provisioned volume MUST be accessible from.
    #[prost(message, repeated, tag = "1")]
    pub requisite: Vec<Topology>,
    /// Ordered preference list; the SP should satisfy the first preferred
    /// topology it can.
    #[prost(message, repeated, tag = "2")]
    pub preferred: Vec<Topology>,
}

/// Topology expressed as key/value segments.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Topology {
    #[prost(map = "string, string", tag = "1")]
    pub segments: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteVolumeRequest {
    /// The ID of the volume to be deprovisioned. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: String,
    /// Secrets required to complete the call.
    #[prost(map = "string, string", tag = "2")]
    pub secrets: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteVolumeResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControllerPublishVolumeRequest {
    /// The ID of the volume to be used on a node. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: String,
    /// The ID of the node, as returned by `NodeGetInfo`. This field is
    /// REQUIRED.
    #[prost(string, tag = "2")]
    pub node_id: String,
    /// How the CO intends to use the volume. This is a REQUIRED field.
    #[prost(message, optional, tag = "3")]
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the volume must be published in readonly mode.
    #[prost(bool, tag = "4")]
    pub readonly: bool,
    /// Secrets required to complete the call.
    #[prost(map = "string, string", tag = "5")]
    pub secrets: HashMap<String, String>,
    /// Volume context as returned by `CreateVolume`.
    #[prost(map = "string, string", tag = "6")]
    pub volume_context: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControllerPublishVolumeResponse {
    /// Opaque publish properties, passed to subsequent `NodeStageVolume`
    /// and `NodePublishVolume` calls.
    #[prost(map = "string, string", tag = "1")]
    pub publish_context: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControllerUnpublishVolumeRequest {
    /// The ID of the volume. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: String,
    /// The node to unpublish from, or empty to unpublish from all nodes.
    #[prost(string, tag = "2")]
    pub node_id: String,
    /// Secrets required to complete the call.
    #[prost(map = "string, string", tag = "3")]
    pub secrets: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControllerUnpublishVolumeResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValidateVolumeCapabilitiesRequest {
    /// The ID of the volume to check. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: String,
    /// Volume context as returned by `CreateVolume`.
    #[prost(map = "string, string", tag = "2")]
    pub volume_context: HashMap<String, String>,
    /// Capabilities the CO wants to check. This field is REQUIRED.
    #[prost(message, repeated, tag = "3")]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// See `CreateVolumeRequest.parameters`.
    #[prost(map = "string, string", tag = "4")]
    pub parameters: HashMap<String, String>,
    /// Secrets required to complete the call.
    #[prost(map = "string, string", tag = "5")]
    pub secrets: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// The set of capabilities the plugin validated; only set on success.
    #[prost(message, optional, tag = "1")]
    pub confirmed: Option<validate_volume_capabilities_response::Confirmed>,
    /// Message to the CO when `confirmed` is empty.
    #[prost(string, tag = "2")]
    pub message: String,
}

pub mod validate_volume_capabilities_response {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Confirmed {
        /// Volume context validated by the plugin.
        #[prost(map = "string, string", tag = "1")]
        pub volume_context: HashMap<String, String>,
        /// Volume capabilities supported by the plugin. This field is
        /// REQUIRED.
        #[prost(message, repeated, tag = "2")]
        pub volume_capabilities: Vec<super::VolumeCapability>,
        /// Creation parameters validated by the plugin.
        #[prost(map = "string, string", tag = "3")]
        pub parameters: HashMap<String, String>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControllerGetCapabilitiesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControllerGetCapabilitiesResponse {
    /// All capabilities the controller service supports.
    #[prost(message, repeated, tag = "1")]
    pub capabilities: Vec<ControllerServiceCapability>,
}

/// Specifies a capability of the controller service.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControllerServiceCapability {
    #[prost(oneof = "controller_service_capability::Type", tags = "1")]
    pub r#type: Option<controller_service_capability::Type>,
}

pub mod controller_service_capability {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Rpc {
        #[prost(enumeration = "rpc::Type", tag = "1")]
        pub r#type: i32,
    }

    pub mod rpc {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum Type {
            Unknown = 0,
            CreateDeleteVolume = 1,
            PublishUnpublishVolume = 2,
            ListVolumes = 3,
            GetCapacity = 4,
            CreateDeleteSnapshot = 5,
            ListSnapshots = 6,
            CloneVolume = 7,
            PublishReadonly = 8,
            ExpandVolume = 9,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        /// RPC that the controller supports.
        #[prost(message, tag = "1")]
        Rpc(Rpc),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeStageVolumeRequest {
    /// The ID of the volume to stage. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: String,
    /// Publish context as returned by `ControllerPublishVolume`.
    #[prost(map = "string, string", tag = "2")]
    pub publish_context: HashMap<String, String>,
    /// Absolute path to which the volume is staged. This is a REQUIRED
    /// field.
    #[prost(string, tag = "3")]
    pub staging_target_path: String,
    /// How the CO intends to use the volume. This is a REQUIRED field.
    #[prost(message, optional, tag = "4")]
    pub volume_capability: Option<VolumeCapability>,
    /// Secrets required to complete the call.
    #[prost(map = "string, string", tag = "5")]
    pub secrets: HashMap<String, String>,
    /// Volume context as returned by `CreateVolume`.
    #[prost(map = "string, string", tag = "6")]
    pub volume_context: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeStageVolumeResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnstageVolumeRequest {
    /// The ID of the volume. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: String,
    /// The path at which the volume was staged. This is a REQUIRED field.
    #[prost(string, tag = "2")]
    pub staging_target_path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnstageVolumeResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodePublishVolumeRequest {
    /// The ID of the volume to publish. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: String,
    /// Publish context as returned by `ControllerPublishVolume`.
    #[prost(map = "string, string", tag = "2")]
    pub publish_context: HashMap<String, String>,
    /// The path to which the volume was staged by `NodeStageVolume`.
    #[prost(string, tag = "3")]
    pub staging_target_path: String,
    /// The path to which the volume will be published. The SP is
    /// responsible for creating it. This is a REQUIRED field.
    #[prost(string, tag = "4")]
    pub target_path: String,
    /// How the CO intends to use the volume. This is a REQUIRED field.
    #[prost(message, optional, tag = "5")]
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the volume must be published in readonly mode.
    #[prost(bool, tag = "6")]
    pub readonly: bool,
    /// Secrets required to complete the call.
    #[prost(map = "string, string", tag = "7")]
    pub secrets: HashMap<String, String>,
    /// Volume context as returned by `CreateVolume`.
    #[prost(map = "string, string", tag = "8")]
    pub volume_context: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodePublishVolumeResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnpublishVolumeRequest {
    /// The ID of the volume. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: String,
    /// The path at which the volume was published. The SP deletes the file
    /// or directory it created at this path. This is a REQUIRED field.
    #[prost(string, tag = "2")]
    pub target_path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnpublishVolumeResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeGetCapabilitiesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeGetCapabilitiesResponse {
    /// All capabilities the node service supports.
    #[prost(message, repeated, tag = "1")]
    pub capabilities: Vec<NodeServiceCapability>,
}

/// Specifies a capability of the node service.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeServiceCapability {
    #[prost(oneof = "node_service_capability::Type", tags = "1")]
    pub r#type: Option<node_service_capability::Type>,
}

pub mod node_service_capability {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Rpc {
        #[prost(enumeration = "rpc::Type", tag = "1")]
        pub r#type: i32,
    }

    pub mod rpc {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum Type {
            Unknown = 0,
            StageUnstageVolume = 1,
            GetVolumeStats = 2,
            ExpandVolume = 3,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        /// RPC that the node supports.
        #[prost(message, tag = "1")]
        Rpc(Rpc),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeGetInfoRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeGetInfoResponse {
    /// The identifier of the node as understood by the SP, used by the CO
    /// in `ControllerPublishVolume`. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub node_id: String,
    /// Maximum number of volumes publishable to the node, 0 when the CO
    /// shall decide.
    #[prost(int64, tag = "2")]
    pub max_volumes_per_node: i64,
    /// Where the node is accessible from.
    #[prost(message, optional, tag = "3")]
    pub accessible_topology: Option<Topology>,
}
