//! The implementation for CSI controller service

use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::Arc;
use tonic::{Request, Response, Status};

use super::backend::{DeviceConfig, InstanceDevicePatch, StorageVolumesPost, VOLUME_TYPE_CUSTOM};
use super::csi::controller_service_capability::rpc::Type as RpcType;
use super::csi::{
    controller_service_capability, validate_volume_capabilities_response,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerServiceCapability, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateVolumeRequest, CreateVolumeResponse,
    DeleteVolumeRequest, DeleteVolumeResponse, Topology, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume,
};
use super::csi_grpc::controller_server::Controller;
use super::error::{DriverError, DriverResult};
use super::meta_data::{
    capability_content_type, derive_content_type, has_multi_node_mode, util, ContentType,
    MetaData, VolumeId,
};

/// for `ControllerService` implementation
#[derive(Clone)]
pub struct ControllerImpl {
    /// Controller capabilities
    caps: Vec<ControllerServiceCapability>,
    /// Volume meta data for controller
    meta_data: Arc<MetaData>,
}

impl ControllerImpl {
    /// Create `ControllerImpl`
    pub fn new(meta_data: Arc<MetaData>) -> Self {
        let caps = meta_data
            .controller_caps()
            .iter()
            .map(|rpc_type| ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(
                    controller_service_capability::Rpc {
                        r#type: *rpc_type as i32,
                    },
                )),
            })
            .collect();
        Self { caps, meta_data }
    }

    /// Validate request with controller capabilities
    fn validate_request_capability(&self, rpc_type: RpcType) -> DriverResult<()> {
        if self.meta_data.controller_caps().contains(&rpc_type) {
            Ok(())
        } else {
            Err(DriverError::InvalidInput(format!(
                "unsupported capability {:?}",
                rpc_type,
            )))
        }
    }

    /// Validate the storage class parameters and isolate the required
    /// storage pool name. Keys in the reserved sidecar namespace pass
    /// through untouched, anything else unknown is rejected.
    fn parse_parameters(params: &HashMap<String, String>) -> DriverResult<String> {
        let mut pool = None;
        for (key, value) in params {
            if key == util::PARAM_STORAGE_POOL {
                if value.is_empty() {
                    return Err(DriverError::InvalidInput(format!(
                        "storage class parameter {:?} cannot be empty",
                        util::PARAM_STORAGE_POOL,
                    )));
                }
                pool = Some(value.clone());
            } else if !key.starts_with(util::CSI_PARAM_PREFIX) {
                return Err(DriverError::InvalidInput(format!(
                    "invalid parameter {:?} in storage class",
                    key,
                )));
            }
        }
        pool.ok_or_else(|| {
            DriverError::InvalidInput(format!(
                "storage class parameter {:?} is required",
                util::PARAM_STORAGE_POOL,
            ))
        })
    }

    /// Pick the target cluster member for a local volume: the first entry of
    /// the preferred topology list carrying the cluster-member segment.
    ///
    /// With WaitForFirstConsumer binding that entry is the node the
    /// scheduler picked for the consuming workload; with Immediate binding
    /// the provisioner passes all cluster topologies and the volume lands on
    /// whichever member comes first.
    fn select_target(&self, req: &CreateVolumeRequest) -> Option<String> {
        let requirements = req.accessibility_requirements.as_ref()?;
        let key = self.meta_data.topology_key();
        requirements
            .preferred
            .iter()
            .find_map(|topology| topology.segments.get(&key).cloned())
    }
}

#[tonic::async_trait]
impl Controller for ControllerImpl {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("create_volume request: {:?}", req);

        self.validate_request_capability(RpcType::CreateDeleteVolume)?;

        if req.name.is_empty() {
            return Err(DriverError::InvalidInput(
                "volume name missing in request".to_owned(),
            )
            .into());
        }
        let vol_name = self.meta_data.normalize_volume_name(&req.name);

        let content_type = derive_content_type(&req.volume_capabilities)?;

        let required_bytes = req.capacity_range.as_ref().map_or(0, |r| r.required_bytes);
        if required_bytes < 1 {
            return Err(DriverError::InvalidInput(
                "volume size cannot be zero or negative".to_owned(),
            )
            .into());
        }

        let pool_name = Self::parse_parameters(&req.parameters)?;

        let backend = self.meta_data.backend();
        let pool = backend.storage_pool(&pool_name).await.map_err(|e| {
            e.context(format!("failed to retrieve storage pool {}", pool_name))
        })?;
        let state = backend
            .server_state()
            .await
            .map_err(|e| e.context("failed to retrieve backend server state"))?;
        let driver = state.storage_driver(&pool.driver).ok_or_else(|| {
            DriverError::InvalidInput(format!(
                "storage pool {} uses unsupported storage driver {}",
                pool_name, pool.driver,
            ))
        })?;
        if driver.name == util::REJECTED_STORAGE_DRIVER {
            return Err(DriverError::InvalidInput(format!(
                "storage driver {} cannot back CSI volumes",
                driver.name,
            ))
            .into());
        }

        if has_multi_node_mode(&req.volume_capabilities) && !driver.remote {
            return Err(DriverError::Unimplemented(format!(
                "multi-node access modes require a remote storage driver, \
                    pool {} uses {}",
                pool_name, driver.name,
            ))
            .into());
        }

        // Local pools are only addressable on the member holding them, so
        // the volume must be created where the consuming workload will run.
        let target = if driver.remote {
            None
        } else {
            self.select_target(&req)
        };
        let driver_name = driver.name.clone();

        let vol_id = VolumeId::new(target.clone(), pool_name.clone(), vol_name.clone());
        let _lock = self.meta_data.try_lock_volume(&vol_id).ok_or_else(|| {
            DriverError::Conflict(format!(
                "another operation on volume {} is in flight",
                vol_id,
            ))
        })?;

        let client = self.meta_data.backend_for(target.as_deref());

        match client.custom_volume(&pool_name, &vol_name).await {
            Ok(..) => {
                return Err(DriverError::AlreadyExists(format!(
                    "volume with the same name {} already exists in pool {}",
                    vol_name, pool_name,
                ))
                .into());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(e
                    .context(format!(
                        "failed to retrieve storage volume {} from pool {}",
                        vol_name, pool_name,
                    ))
                    .into());
            }
        }

        if req.volume_content_source.is_some() {
            return Err(DriverError::Unimplemented(
                "volume content source is not supported".to_owned(),
            )
            .into());
        }

        let mut config = HashMap::new();
        config.insert("size".to_owned(), required_bytes.to_string());
        let volume = StorageVolumesPost {
            name: vol_name.clone(),
            volume_type: VOLUME_TYPE_CUSTOM.to_owned(),
            content_type: content_type.as_str().to_owned(),
            description: util::volume_description(&req.parameters),
            config,
        };
        client.create_custom_volume(&pool_name, volume).await.map_err(|e| {
            e.context(format!(
                "failed to create volume {} in storage pool {}",
                vol_name, pool_name,
            ))
        })?;

        // The volume must be visible on the same target before its ID is
        // handed back to the orchestrator.
        if let Err(e) = client.custom_volume(&pool_name, &vol_name).await {
            if let Err(cleanup_e) = client.delete_custom_volume(&pool_name, &vol_name).await {
                error!(
                    "failed to clean up volume ID={} after failed \
                        verification, the error is: {}",
                    vol_id, cleanup_e,
                );
            }
            return Err(e
                .context(format!(
                    "created volume {} is not visible in pool {}",
                    vol_name, pool_name,
                ))
                .into());
        }
        info!(
            "created volume ID={} with content type {}",
            vol_id, content_type,
        );

        let mut volume_context = req.parameters.clone();
        volume_context.insert(
            util::VOLUME_CTX_STORAGE_DRIVER.to_owned(),
            driver_name,
        );

        let accessible_topology = match &target {
            Some(member) => {
                let mut segments = HashMap::new();
                segments.insert(self.meta_data.topology_key(), member.clone());
                vec![Topology { segments }]
            }
            None => Vec::new(),
        };

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: required_bytes,
                volume_id: vol_id.to_string(),
                volume_context,
                content_source: None,
                accessible_topology,
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("delete_volume request: {:?}", req);

        self.validate_request_capability(RpcType::CreateDeleteVolume)?;

        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "volume ID missing in request".to_owned(),
            )
            .into());
        }
        let vol_id = VolumeId::parse(&req.volume_id)?;

        let _lock = self.meta_data.try_lock_volume(&vol_id).ok_or_else(|| {
            DriverError::Conflict(format!(
                "another operation on volume {} is in flight",
                vol_id,
            ))
        })?;

        let client = self.meta_data.backend_for(vol_id.target.as_deref());
        match client.delete_custom_volume(&vol_id.pool, &vol_id.name).await {
            Ok(()) => info!("deleted volume ID={}", vol_id),
            // Absent volumes count as deleted for idempotency.
            Err(e) if e.is_not_found() => {
                debug!("volume ID={} not found, nothing to delete", vol_id);
            }
            Err(e) => {
                return Err(e
                    .context(format!(
                        "failed to delete volume {} from storage pool {}",
                        vol_id.name, vol_id.pool,
                    ))
                    .into());
            }
        }

        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("controller_publish_volume request: {:?}", req);

        self.validate_request_capability(RpcType::PublishUnpublishVolume)?;

        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "volume ID missing in request".to_owned(),
            )
            .into());
        }
        if req.node_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "node ID missing in request".to_owned(),
            )
            .into());
        }
        let vol_id = VolumeId::parse(&req.volume_id)?;
        let cap = req.volume_capability.as_ref().ok_or_else(|| {
            DriverError::InvalidInput("volume capability missing in request".to_owned())
        })?;
        let content_type = capability_content_type(cap)?;

        let _lock = self.meta_data.try_lock_volume(&vol_id).ok_or_else(|| {
            DriverError::Conflict(format!(
                "another operation on volume {} is in flight",
                vol_id,
            ))
        })?;

        let client = self.meta_data.backend_for(vol_id.target.as_deref());
        let (instance, etag) = client.instance(&req.node_id).await.map_err(|e| {
            e.context(format!("failed to retrieve instance {}", req.node_id))
        })?;

        let mut publish_context = HashMap::new();
        publish_context.insert(
            util::PUBLISH_CTX_DEVICE_PATH.to_owned(),
            util::device_path(&vol_id.name),
        );

        if let Some(existing) = instance.devices.get(&vol_id.name) {
            let unchanged = existing.get("type").map(String::as_str)
                == Some(util::DEVICE_TYPE_DISK)
                && existing.get("source") == Some(&vol_id.name)
                && existing.get("pool") == Some(&vol_id.pool);
            if unchanged {
                info!(
                    "volume ID={} already attached to instance {}",
                    vol_id, req.node_id,
                );
                return Ok(Response::new(ControllerPublishVolumeResponse {
                    publish_context,
                }));
            }
            return Err(DriverError::AlreadyExists(format!(
                "instance {} already has a conflicting device {}",
                req.node_id, vol_id.name,
            ))
            .into());
        }

        let mut device = DeviceConfig::new();
        device.insert("type".to_owned(), util::DEVICE_TYPE_DISK.to_owned());
        device.insert("source".to_owned(), vol_id.name.clone());
        device.insert("pool".to_owned(), vol_id.pool.clone());
        if content_type == ContentType::Filesystem {
            device.insert("path".to_owned(), self.meta_data.mount_path(&vol_id.name));
        }

        let mut patch = InstanceDevicePatch::default();
        patch.devices.insert(vol_id.name.clone(), Some(device));
        client
            .update_instance(&req.node_id, patch, &etag)
            .await
            .map_err(|e| {
                e.context(format!(
                    "failed to attach volume {} to instance {}",
                    vol_id, req.node_id,
                ))
            })?;
        info!("attached volume ID={} to instance {}", vol_id, req.node_id);

        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("controller_unpublish_volume request: {:?}", req);

        self.validate_request_capability(RpcType::PublishUnpublishVolume)?;

        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "volume ID missing in request".to_owned(),
            )
            .into());
        }
        if req.node_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "node ID missing in request".to_owned(),
            )
            .into());
        }
        let vol_id = VolumeId::parse(&req.volume_id)?;

        let _lock = self.meta_data.try_lock_volume(&vol_id).ok_or_else(|| {
            DriverError::Conflict(format!(
                "another operation on volume {} is in flight",
                vol_id,
            ))
        })?;

        // Read first to learn the current etag, then update against it.
        let client = self.meta_data.backend();
        let (instance, etag) = match client.instance(&req.node_id).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                debug!(
                    "instance {} not found, volume ID={} counts as detached",
                    req.node_id, vol_id,
                );
                return Ok(Response::new(ControllerUnpublishVolumeResponse {}));
            }
            Err(e) => {
                return Err(e
                    .context(format!("failed to retrieve instance {}", req.node_id))
                    .into());
            }
        };

        if !instance.devices.contains_key(&vol_id.name) {
            debug!(
                "instance {} has no device {}, nothing to detach",
                req.node_id, vol_id.name,
            );
            return Ok(Response::new(ControllerUnpublishVolumeResponse {}));
        }

        let mut patch = InstanceDevicePatch::default();
        patch.devices.insert(vol_id.name.clone(), None);
        match client.update_instance(&req.node_id, patch, &etag).await {
            Ok(()) => info!(
                "detached volume ID={} from instance {}",
                vol_id, req.node_id,
            ),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(e
                    .context(format!(
                        "failed to detach volume {} from instance {}",
                        vol_id, req.node_id,
                    ))
                    .into());
            }
        }

        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        debug!("validate_volume_capabilities request: {:?}", req);

        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "volume ID missing in request".to_owned(),
            )
            .into());
        }
        VolumeId::parse(&req.volume_id)?;
        if req.volume_capabilities.is_empty() {
            return Err(DriverError::InvalidInput(
                "volume capabilities missing in request".to_owned(),
            )
            .into());
        }

        // A pure check against the accepted capability set, no backend call.
        derive_content_type(&req.volume_capabilities)?;
        if has_multi_node_mode(&req.volume_capabilities) {
            return Ok(Response::new(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "multi-node access modes are only supported on remote \
                    storage drivers"
                    .to_owned(),
            }));
        }

        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        debug!("controller_get_capabilities request: {:?}", request.get_ref());

        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: self.caps.clone(),
        }))
    }
}

#[cfg(test)]
mod test {
    use super::super::backend::fake::{FakeBackend, FakeState};
    use super::super::backend::{
        BackendApi, Instance, ServerState, StorageDriverInfo, StoragePool,
    };
    use super::super::csi::volume_capability::access_mode::Mode;
    use super::super::csi::volume_capability::{self, AccessType, BlockVolume, MountVolume};
    use super::super::csi::{CapacityRange, VolumeCapability};
    use super::*;
    use tonic::Code;

    const TOPOLOGY_KEY: &str = "csi.machina.io/cluster-member";

    fn fake_state() -> FakeState {
        let mut state = FakeState::default();
        state.server = ServerState {
            instance_name: "node-a".to_owned(),
            location: "member-1".to_owned(),
            server_clustered: true,
            supported_storage_drivers: vec![
                StorageDriverInfo {
                    name: "zfs".to_owned(),
                    version: "2.1".to_owned(),
                    remote: false,
                },
                StorageDriverInfo {
                    name: "ceph".to_owned(),
                    version: "17.2".to_owned(),
                    remote: true,
                },
                StorageDriverInfo {
                    name: "cephobject".to_owned(),
                    version: "17.2".to_owned(),
                    remote: true,
                },
            ],
        };
        for (pool, driver) in &[("p", "zfs"), ("cp", "ceph"), ("op", "cephobject")] {
            state.pools.insert(
                (*pool).to_owned(),
                StoragePool {
                    name: (*pool).to_owned(),
                    driver: (*driver).to_owned(),
                    status: "Created".to_owned(),
                },
            );
        }
        state.instances.insert(
            "i".to_owned(),
            Instance {
                name: "i".to_owned(),
                devices: HashMap::new(),
                location: "member-1".to_owned(),
            },
        );
        state
    }

    fn controller_with(state: FakeState) -> (ControllerImpl, Arc<FakeBackend>, Arc<MetaData>) {
        let fake = Arc::new(FakeBackend::new(state));
        let backend: Arc<dyn BackendApi> = fake.clone();
        let meta_data = Arc::new(MetaData::new(
            util::CSI_PLUGIN_NAME.to_owned(),
            util::CSI_PLUGIN_VERSION.to_owned(),
            "node-a".to_owned(),
            "member-1".to_owned(),
            None,
            util::MOUNT_ROOT.to_owned(),
            true,
            backend,
        ));
        (
            ControllerImpl::new(Arc::clone(&meta_data)),
            fake,
            meta_data,
        )
    }

    fn mount_capability(mode: Mode) -> VolumeCapability {
        VolumeCapability {
            access_mode: Some(volume_capability::AccessMode { mode: mode as i32 }),
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            })),
        }
    }

    fn block_capability(mode: Mode) -> VolumeCapability {
        VolumeCapability {
            access_mode: Some(volume_capability::AccessMode { mode: mode as i32 }),
            access_type: Some(AccessType::Block(BlockVolume {})),
        }
    }

    fn create_req(
        name: &str,
        pool: &str,
        caps: Vec<VolumeCapability>,
        preferred_members: &[&str],
    ) -> CreateVolumeRequest {
        let mut parameters = HashMap::new();
        parameters.insert(util::PARAM_STORAGE_POOL.to_owned(), pool.to_owned());
        let preferred = preferred_members
            .iter()
            .map(|member| {
                let mut segments = HashMap::new();
                segments.insert(TOPOLOGY_KEY.to_owned(), (*member).to_owned());
                Topology { segments }
            })
            .collect();
        CreateVolumeRequest {
            name: name.to_owned(),
            capacity_range: Some(CapacityRange {
                required_bytes: 1024 * 1024 * 1024,
                limit_bytes: 0,
            }),
            volume_capabilities: caps,
            parameters,
            secrets: HashMap::new(),
            volume_content_source: None,
            accessibility_requirements: Some(super::super::csi::TopologyRequirement {
                requisite: Vec::new(),
                preferred,
            }),
        }
    }

    fn publish_req(
        volume_id: &str,
        node_id: &str,
        cap: VolumeCapability,
    ) -> ControllerPublishVolumeRequest {
        ControllerPublishVolumeRequest {
            volume_id: volume_id.to_owned(),
            node_id: node_id.to_owned(),
            volume_capability: Some(cap),
            readonly: false,
            secrets: HashMap::new(),
            volume_context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn local_pool_create_targets_preferred_member() {
        let (controller, fake, _) = controller_with(fake_state());
        let req = create_req(
            "v",
            "p",
            vec![mount_capability(Mode::SingleNodeWriter)],
            &["node-b", "node-a"],
        );
        let resp = controller
            .create_volume(Request::new(req))
            .await
            .expect("create volume")
            .into_inner();
        let volume = resp.volume.expect("volume in response");
        assert_eq!(volume.volume_id, "node-b/p/v");
        assert_eq!(volume.accessible_topology.len(), 1);
        assert_eq!(
            volume.accessible_topology[0].segments.get(TOPOLOGY_KEY),
            Some(&"node-b".to_owned()),
        );
        assert_eq!(
            volume.volume_context.get(util::VOLUME_CTX_STORAGE_DRIVER),
            Some(&"zfs".to_owned()),
        );
        fake.with_state(|s| {
            assert_eq!(s.create_targets, vec![Some("node-b".to_owned())]);
            let vol = s
                .volumes
                .get(&("p".to_owned(), "v".to_owned()))
                .expect("volume created");
            assert_eq!(vol.volume_type, VOLUME_TYPE_CUSTOM);
            assert_eq!(vol.content_type, "filesystem");
            assert_eq!(vol.config.get("size"), Some(&(1 << 30).to_string()));
            assert_eq!(vol.location, "node-b");
        });
    }

    #[tokio::test]
    async fn remote_pool_create_is_untargeted() {
        let (controller, fake, _) = controller_with(fake_state());
        let req = create_req(
            "v",
            "cp",
            vec![mount_capability(Mode::SingleNodeWriter)],
            &["node-b", "node-a"],
        );
        let resp = controller
            .create_volume(Request::new(req))
            .await
            .expect("create volume")
            .into_inner();
        let volume = resp.volume.expect("volume in response");
        assert_eq!(volume.volume_id, "cp/v");
        assert!(volume.accessible_topology.is_empty());
        fake.with_state(|s| {
            assert_eq!(s.create_targets, vec![None]);
        });
    }

    #[tokio::test]
    async fn local_pool_without_preferred_topology_stays_untargeted() {
        let (controller, _, _) = controller_with(fake_state());
        let req = create_req("v", "p", vec![mount_capability(Mode::SingleNodeWriter)], &[]);
        let resp = controller
            .create_volume(Request::new(req))
            .await
            .expect("create volume")
            .into_inner();
        assert_eq!(resp.volume.expect("volume in response").volume_id, "p/v");
    }

    #[tokio::test]
    async fn create_rejects_existing_volume_name() {
        let (controller, _, _) = controller_with(fake_state());
        let first = create_req("v", "p", vec![mount_capability(Mode::SingleNodeWriter)], &[]);
        controller
            .create_volume(Request::new(first))
            .await
            .expect("first create");
        let second = create_req("v", "p", vec![mount_capability(Mode::SingleNodeWriter)], &[]);
        let status = controller
            .create_volume(Request::new(second))
            .await
            .expect_err("name clash must fail");
        assert_eq!(status.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn create_rejects_unknown_parameter() {
        let (controller, _, _) = controller_with(fake_state());
        let mut req = create_req("v", "p", vec![mount_capability(Mode::SingleNodeWriter)], &[]);
        req.parameters.insert("foo".to_owned(), "bar".to_owned());
        let status = controller
            .create_volume(Request::new(req))
            .await
            .expect_err("unknown parameter must fail");
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_carries_claim_identity_into_description() {
        let (controller, fake, _) = controller_with(fake_state());
        let mut req = create_req("v", "p", vec![mount_capability(Mode::SingleNodeWriter)], &[]);
        req.parameters
            .insert(util::PARAM_PVC_NAME.to_owned(), "db".to_owned());
        req.parameters
            .insert(util::PARAM_PVC_NAMESPACE.to_owned(), "prod".to_owned());
        controller
            .create_volume(Request::new(req))
            .await
            .expect("create volume");
        fake.with_state(|s| {
            let vol = s
                .volumes
                .get(&("p".to_owned(), "v".to_owned()))
                .expect("volume created");
            assert!(vol.description.contains("prod/db"));
        });
    }

    #[tokio::test]
    async fn create_requires_storage_pool_parameter() {
        let (controller, _, _) = controller_with(fake_state());
        let mut req = create_req("v", "p", vec![mount_capability(Mode::SingleNodeWriter)], &[]);
        req.parameters.remove(util::PARAM_STORAGE_POOL);
        let status = controller
            .create_volume(Request::new(req))
            .await
            .expect_err("missing pool parameter must fail");
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_requires_positive_size() {
        let (controller, _, _) = controller_with(fake_state());
        let mut req = create_req("v", "p", vec![mount_capability(Mode::SingleNodeWriter)], &[]);
        req.capacity_range = Some(CapacityRange {
            required_bytes: 0,
            limit_bytes: 0,
        });
        let status = controller
            .create_volume(Request::new(req))
            .await
            .expect_err("zero size must fail");
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_rejects_object_storage_driver() {
        let (controller, _, _) = controller_with(fake_state());
        let req = create_req("v", "op", vec![mount_capability(Mode::SingleNodeWriter)], &[]);
        let status = controller
            .create_volume(Request::new(req))
            .await
            .expect_err("object storage driver must fail");
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_rejects_content_source() {
        let (controller, _, _) = controller_with(fake_state());
        let mut req = create_req("v", "p", vec![mount_capability(Mode::SingleNodeWriter)], &[]);
        req.volume_content_source = Some(super::super::csi::VolumeContentSource {
            r#type: Some(
                super::super::csi::volume_content_source::Type::Snapshot(
                    super::super::csi::volume_content_source::SnapshotSource {
                        snapshot_id: "snap-1".to_owned(),
                    },
                ),
            ),
        });
        let status = controller
            .create_volume(Request::new(req))
            .await
            .expect_err("content source must fail");
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn multi_node_mode_needs_remote_driver() {
        let (controller, _, _) = controller_with(fake_state());
        let req = create_req(
            "v",
            "p",
            vec![mount_capability(Mode::MultiNodeMultiWriter)],
            &[],
        );
        let status = controller
            .create_volume(Request::new(req))
            .await
            .expect_err("multi-node on local driver must fail");
        assert_eq!(status.code(), Code::Unimplemented);

        let req = create_req(
            "v",
            "cp",
            vec![mount_capability(Mode::MultiNodeMultiWriter)],
            &[],
        );
        controller
            .create_volume(Request::new(req))
            .await
            .expect("multi-node on remote driver");
    }

    #[tokio::test]
    async fn concurrent_create_provisions_exactly_one_volume() {
        let (controller, fake, _) = controller_with(fake_state());
        let req = || {
            Request::new(create_req(
                "v",
                "p",
                vec![mount_capability(Mode::SingleNodeWriter)],
                &["node-b"],
            ))
        };
        let (first, second) =
            tokio::join!(controller.create_volume(req()), controller.create_volume(req()));
        let failures: Vec<_> = vec![first, second]
            .into_iter()
            .filter_map(Result::err)
            .collect();
        assert_eq!(failures.len(), 1, "exactly one call must fail");
        assert!(matches!(
            failures[0].code(),
            Code::Aborted | Code::AlreadyExists
        ));
        fake.with_state(|s| assert_eq!(s.volumes.len(), 1));
    }

    #[tokio::test]
    async fn locked_volume_aborts_mutations() {
        let (controller, _, meta_data) = controller_with(fake_state());
        let vol_id = VolumeId::new(Some("node-b".to_owned()), "p".to_owned(), "v".to_owned());
        let _guard = meta_data.try_lock_volume(&vol_id).expect("hold the lock");
        let status = controller
            .delete_volume(Request::new(DeleteVolumeRequest {
                volume_id: "node-b/p/v".to_owned(),
                secrets: HashMap::new(),
            }))
            .await
            .expect_err("locked volume must abort");
        assert_eq!(status.code(), Code::Aborted);
    }

    #[tokio::test]
    async fn delete_volume_is_idempotent() {
        let (controller, fake, _) = controller_with(fake_state());
        let req = create_req("v", "p", vec![mount_capability(Mode::SingleNodeWriter)], &[]);
        controller
            .create_volume(Request::new(req))
            .await
            .expect("create volume");

        for _ in 0..2 {
            controller
                .delete_volume(Request::new(DeleteVolumeRequest {
                    volume_id: "p/v".to_owned(),
                    secrets: HashMap::new(),
                }))
                .await
                .expect("delete volume");
        }
        fake.with_state(|s| assert!(s.volumes.is_empty()));
    }

    #[tokio::test]
    async fn malformed_volume_ids_are_rejected() {
        let (controller, _, _) = controller_with(fake_state());
        for raw in &["", "a", "a/b/c/d"] {
            let status = controller
                .delete_volume(Request::new(DeleteVolumeRequest {
                    volume_id: (*raw).to_owned(),
                    secrets: HashMap::new(),
                }))
                .await
                .expect_err("malformed volume ID must fail");
            assert_eq!(status.code(), Code::InvalidArgument, "input {:?}", raw);

            let status = controller
                .controller_publish_volume(Request::new(publish_req(
                    raw,
                    "i",
                    mount_capability(Mode::SingleNodeWriter),
                )))
                .await
                .expect_err("malformed volume ID must fail");
            assert_eq!(status.code(), Code::InvalidArgument, "input {:?}", raw);

            let status = controller
                .controller_unpublish_volume(Request::new(ControllerUnpublishVolumeRequest {
                    volume_id: (*raw).to_owned(),
                    node_id: "i".to_owned(),
                    secrets: HashMap::new(),
                }))
                .await
                .expect_err("malformed volume ID must fail");
            assert_eq!(status.code(), Code::InvalidArgument, "input {:?}", raw);
        }
    }

    #[tokio::test]
    async fn publish_attaches_disk_device() {
        let (controller, fake, _) = controller_with(fake_state());
        controller
            .controller_publish_volume(Request::new(publish_req(
                "p/v",
                "i",
                mount_capability(Mode::SingleNodeWriter),
            )))
            .await
            .expect("publish volume");
        fake.with_state(|s| {
            let device = s.instances["i"].devices.get("v").expect("device attached");
            assert_eq!(device.get("type"), Some(&"disk".to_owned()));
            assert_eq!(device.get("source"), Some(&"v".to_owned()));
            assert_eq!(device.get("pool"), Some(&"p".to_owned()));
            // Filesystem volumes additionally get an in-instance mount path.
            assert_eq!(
                device.get("path"),
                Some(&format!("{}/v", util::MOUNT_ROOT)),
            );
            assert_eq!(s.update_count, 1);
        });
    }

    #[tokio::test]
    async fn publish_of_block_volume_has_no_mount_path() {
        let (controller, fake, _) = controller_with(fake_state());
        let resp = controller
            .controller_publish_volume(Request::new(publish_req(
                "p/v",
                "i",
                block_capability(Mode::SingleNodeWriter),
            )))
            .await
            .expect("publish volume")
            .into_inner();
        assert_eq!(
            resp.publish_context.get(util::PUBLISH_CTX_DEVICE_PATH),
            Some(&format!("{}/v", util::DEVICE_DIR)),
        );
        fake.with_state(|s| {
            let device = s.instances["i"].devices.get("v").expect("device attached");
            assert!(device.get("path").is_none());
        });
    }

    #[tokio::test]
    async fn publish_is_idempotent_for_matching_device() {
        let (controller, fake, _) = controller_with(fake_state());
        fake.with_state(|s| {
            let mut device = DeviceConfig::new();
            device.insert("type".to_owned(), "disk".to_owned());
            device.insert("source".to_owned(), "v".to_owned());
            device.insert("pool".to_owned(), "p".to_owned());
            s.instances
                .get_mut("i")
                .expect("instance seeded")
                .devices
                .insert("v".to_owned(), device);
        });
        let resp = controller
            .controller_publish_volume(Request::new(publish_req(
                "p/v",
                "i",
                block_capability(Mode::SingleNodeWriter),
            )))
            .await
            .expect("publish volume")
            .into_inner();
        assert!(resp
            .publish_context
            .contains_key(util::PUBLISH_CTX_DEVICE_PATH));
        // The matching device is kept as-is.
        fake.with_state(|s| assert_eq!(s.update_count, 0));
    }

    #[tokio::test]
    async fn publish_rejects_conflicting_device() {
        let (controller, fake, _) = controller_with(fake_state());
        fake.with_state(|s| {
            let mut device = DeviceConfig::new();
            device.insert("type".to_owned(), "disk".to_owned());
            device.insert("source".to_owned(), "v".to_owned());
            device.insert("pool".to_owned(), "q".to_owned());
            s.instances
                .get_mut("i")
                .expect("instance seeded")
                .devices
                .insert("v".to_owned(), device);
        });
        let status = controller
            .controller_publish_volume(Request::new(publish_req(
                "p/v",
                "i",
                block_capability(Mode::SingleNodeWriter),
            )))
            .await
            .expect_err("conflicting device must fail");
        assert_eq!(status.code(), Code::AlreadyExists);
        fake.with_state(|s| assert_eq!(s.update_count, 0));
    }

    #[tokio::test]
    async fn publish_of_unknown_instance_is_not_found() {
        let (controller, _, _) = controller_with(fake_state());
        let status = controller
            .controller_publish_volume(Request::new(publish_req(
                "p/v",
                "missing",
                block_capability(Mode::SingleNodeWriter),
            )))
            .await
            .expect_err("unknown instance must fail");
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn unpublish_detaches_device_and_is_idempotent() {
        let (controller, fake, _) = controller_with(fake_state());
        controller
            .controller_publish_volume(Request::new(publish_req(
                "p/v",
                "i",
                mount_capability(Mode::SingleNodeWriter),
            )))
            .await
            .expect("publish volume");

        let unpublish = || {
            Request::new(ControllerUnpublishVolumeRequest {
                volume_id: "p/v".to_owned(),
                node_id: "i".to_owned(),
                secrets: HashMap::new(),
            })
        };
        controller
            .controller_unpublish_volume(unpublish())
            .await
            .expect("unpublish volume");
        fake.with_state(|s| {
            assert!(s.instances["i"].devices.get("v").is_none());
            assert_eq!(s.update_count, 2);
        });

        // A second detach and a detach from a vanished instance both count
        // as success.
        controller
            .controller_unpublish_volume(unpublish())
            .await
            .expect("repeated unpublish");
        fake.with_state(|s| {
            assert_eq!(s.update_count, 2);
            s.instances.clear();
        });
        controller
            .controller_unpublish_volume(unpublish())
            .await
            .expect("unpublish with vanished instance");
    }

    #[tokio::test]
    async fn validate_confirms_single_node_capabilities() {
        let (controller, _, _) = controller_with(fake_state());
        let resp = controller
            .validate_volume_capabilities(Request::new(ValidateVolumeCapabilitiesRequest {
                volume_id: "p/v".to_owned(),
                volume_context: HashMap::new(),
                volume_capabilities: vec![mount_capability(Mode::SingleNodeWriter)],
                parameters: HashMap::new(),
                secrets: HashMap::new(),
            }))
            .await
            .expect("validate capabilities")
            .into_inner();
        assert!(resp.confirmed.is_some());

        let resp = controller
            .validate_volume_capabilities(Request::new(ValidateVolumeCapabilitiesRequest {
                volume_id: "p/v".to_owned(),
                volume_context: HashMap::new(),
                volume_capabilities: vec![mount_capability(Mode::MultiNodeMultiWriter)],
                parameters: HashMap::new(),
                secrets: HashMap::new(),
            }))
            .await
            .expect("validate capabilities")
            .into_inner();
        assert!(resp.confirmed.is_none());
        assert!(!resp.message.is_empty());
    }

    #[tokio::test]
    async fn controller_capabilities_cover_volume_and_publish_lifecycle() {
        let (controller, _, _) = controller_with(fake_state());
        let resp = controller
            .controller_get_capabilities(Request::new(ControllerGetCapabilitiesRequest {}))
            .await
            .expect("get capabilities")
            .into_inner();
        let types: Vec<i32> = resp
            .capabilities
            .iter()
            .filter_map(|cap| match &cap.r#type {
                Some(controller_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
                None => None,
            })
            .collect();
        assert_eq!(
            types,
            vec![
                RpcType::CreateDeleteVolume as i32,
                RpcType::PublishUnpublishVolume as i32,
            ],
        );
    }
}
