//! The implementation for CSI node service

use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tonic::{Request, Response, Status};

use super::csi::node_service_capability::rpc::Type as RpcType;
use super::csi::volume_capability::AccessType;
use super::csi::{
    node_service_capability, NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse,
    NodeGetInfoRequest, NodeGetInfoResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, Topology,
};
use super::csi_grpc::node_server::Node;
use super::error::{DriverError, DriverResult};
use super::meta_data::{capability_content_type, util, ContentType, MetaData, VolumeId};
use super::mount;

/// for `NodeService` implementation
#[derive(Clone)]
pub struct NodeImpl {
    /// Node capabilities
    caps: Vec<NodeServiceCapability>,
    /// Volume meta data for this node
    meta_data: Arc<MetaData>,
}

impl NodeImpl {
    /// Create `NodeImpl`
    pub fn new(meta_data: Arc<MetaData>) -> Self {
        let cap_vec = vec![RpcType::StageUnstageVolume];
        let caps = cap_vec
            .into_iter()
            .map(|rpc_type| NodeServiceCapability {
                r#type: Some(node_service_capability::Type::Rpc(
                    node_service_capability::Rpc {
                        r#type: rpc_type as i32,
                    },
                )),
            })
            .collect();
        Self { caps, meta_data }
    }

    /// The in-instance device node backing the volume, as handed over by
    /// `ControllerPublishVolume`
    fn device_from_publish_context<'a>(
        publish_context: &'a HashMap<String, String>,
        vol_id: &VolumeId,
    ) -> DriverResult<&'a Path> {
        publish_context
            .get(util::PUBLISH_CTX_DEVICE_PATH)
            .map(Path::new)
            .ok_or_else(|| {
                DriverError::InvalidInput(format!(
                    "publish context of volume {} is missing {:?}",
                    vol_id,
                    util::PUBLISH_CTX_DEVICE_PATH,
                ))
            })
    }
}

#[tonic::async_trait]
impl Node for NodeImpl {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("node_stage_volume request: {:?}", req);

        // Check arguments
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "volume ID missing in request".to_owned(),
            )
            .into());
        }
        let vol_id = VolumeId::parse(&req.volume_id)?;
        if req.staging_target_path.is_empty() {
            return Err(DriverError::InvalidInput(
                "staging target path missing in request".to_owned(),
            )
            .into());
        }
        let cap = req.volume_capability.as_ref().ok_or_else(|| {
            DriverError::InvalidInput("volume capability missing in request".to_owned())
        })?;
        let content_type = capability_content_type(cap)?;
        let device = Self::device_from_publish_context(&req.publish_context, &vol_id)?;
        let staging = Path::new(&req.staging_target_path);

        match content_type {
            ContentType::Block => {
                mount::ensure_file(staging)?;
                if mount::is_mount_point(staging)? {
                    info!("volume ID={} already staged at {:?}", vol_id, staging);
                } else {
                    mount::bind_mount(device, staging, false)?;
                }
            }
            ContentType::Filesystem => {
                mount::ensure_dir(staging)?;
                if mount::is_mount_point(staging)? {
                    info!("volume ID={} already staged at {:?}", vol_id, staging);
                } else {
                    let (fs_type, options) = match &cap.access_type {
                        Some(AccessType::Mount(mnt)) if !mnt.fs_type.is_empty() => {
                            (mnt.fs_type.as_str(), mnt.mount_flags.as_slice())
                        }
                        Some(AccessType::Mount(mnt)) => {
                            (util::DEFAULT_FS_TYPE, mnt.mount_flags.as_slice())
                        }
                        _ => (util::DEFAULT_FS_TYPE, &[][..]),
                    };
                    // A device carrying a filesystem signature is mounted
                    // as-is, it must never be formatted again.
                    if !mount::has_filesystem_signature(device)? {
                        mount::format_device(device, fs_type)?;
                    }
                    mount::mount_device(device, staging, fs_type, options)?;
                }
            }
        }

        info!(
            "staged volume ID={} ({}) at {}",
            vol_id, content_type, req.staging_target_path,
        );
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("node_unstage_volume request: {:?}", req);

        // Check arguments
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "volume ID missing in request".to_owned(),
            )
            .into());
        }
        let vol_id = VolumeId::parse(&req.volume_id)?;
        if req.staging_target_path.is_empty() {
            return Err(DriverError::InvalidInput(
                "staging target path missing in request".to_owned(),
            )
            .into());
        }

        let staging = Path::new(&req.staging_target_path);
        mount::unmount(staging)?;
        mount::remove_mount_point(staging)?;

        info!(
            "unstaged volume ID={} from {}",
            vol_id, req.staging_target_path,
        );
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("node_publish_volume request: {:?}", req);

        // Check arguments
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "volume ID missing in request".to_owned(),
            )
            .into());
        }
        let vol_id = VolumeId::parse(&req.volume_id)?;
        if req.staging_target_path.is_empty() {
            return Err(DriverError::InvalidInput(
                "staging target path missing in request".to_owned(),
            )
            .into());
        }
        if req.target_path.is_empty() {
            return Err(DriverError::InvalidInput(
                "target path missing in request".to_owned(),
            )
            .into());
        }
        let cap = req.volume_capability.as_ref().ok_or_else(|| {
            DriverError::InvalidInput("volume capability missing in request".to_owned())
        })?;
        let content_type = capability_content_type(cap)?;

        let staging = Path::new(&req.staging_target_path);
        let target = Path::new(&req.target_path);

        match content_type {
            ContentType::Block => mount::ensure_file(target)?,
            ContentType::Filesystem => mount::ensure_dir(target)?,
        }
        if mount::is_mount_point(target)? {
            info!(
                "volume ID={} already published at {}",
                vol_id, req.target_path,
            );
            return Ok(Response::new(NodePublishVolumeResponse {}));
        }

        mount::bind_mount(staging, target, req.readonly)?;

        info!(
            "published volume ID={} at {} (readonly={})",
            vol_id, req.target_path, req.readonly,
        );
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("node_unpublish_volume request: {:?}", req);

        // Check arguments
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "volume ID missing in request".to_owned(),
            )
            .into());
        }
        let vol_id = VolumeId::parse(&req.volume_id)?;
        if req.target_path.is_empty() {
            return Err(DriverError::InvalidInput(
                "target path missing in request".to_owned(),
            )
            .into());
        }

        let target = Path::new(&req.target_path);
        mount::unmount(target)?;
        mount::remove_mount_point(target)?;

        info!(
            "unpublished volume ID={} from {}",
            vol_id, req.target_path,
        );
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        debug!("node_get_capabilities request: {:?}", request.get_ref());

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: self.caps.clone(),
        }))
    }

    async fn node_get_info(
        &self,
        request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        debug!("node_get_info request: {:?}", request.get_ref());

        // The topology segment carries the cluster member, not the instance
        // name: the scheduler hands it back in preferred topologies and the
        // controller routes volume placement on it.
        let mut segments = HashMap::new();
        segments.insert(
            self.meta_data.topology_key(),
            self.meta_data.cluster_member().to_owned(),
        );

        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.meta_data.node_id().to_owned(),
            max_volumes_per_node: 0,
            accessible_topology: Some(Topology { segments }),
        }))
    }
}
