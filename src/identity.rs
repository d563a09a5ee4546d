//! The implementation for CSI identity service

use log::{debug, warn};
use std::sync::Arc;
use tonic::{Request, Response, Status};

use super::csi::plugin_capability::service::Type as ServiceType;
use super::csi::{
    plugin_capability, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse,
    GetPluginInfoRequest, GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};
use super::csi_grpc::identity_server::Identity;
use super::meta_data::MetaData;

/// for `IdentityService` implementation
#[derive(Clone)]
pub struct IdentityImpl {
    /// Volume meta data shared by all services
    meta_data: Arc<MetaData>,
}

impl IdentityImpl {
    /// Create `IdentityImpl`
    pub fn new(meta_data: Arc<MetaData>) -> Self {
        Self { meta_data }
    }
}

#[tonic::async_trait]
impl Identity for IdentityImpl {
    async fn get_plugin_info(
        &self,
        request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        debug!("get_plugin_info request: {:?}", request.get_ref());

        if self.meta_data.driver_name().is_empty() {
            return Err(Status::unavailable("driver is missing a name"));
        }
        if self.meta_data.version().is_empty() {
            return Err(Status::unavailable("driver is missing a version"));
        }

        Ok(Response::new(GetPluginInfoResponse {
            name: self.meta_data.driver_name().to_owned(),
            vendor_version: self.meta_data.version().to_owned(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        debug!("get_plugin_capabilities request: {:?}", request.get_ref());

        let capabilities = vec![PluginCapability {
            r#type: Some(plugin_capability::Type::Service(
                plugin_capability::Service {
                    r#type: ServiceType::ControllerService as i32,
                },
            )),
        }];
        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        debug!("probe request: {:?}", request.get_ref());

        // The backend client existing is enough to serve; a transient
        // backend outage must not flip the plugin to unhealthy.
        if let Err(e) = self.meta_data.backend().server_state().await {
            warn!("backend not reachable during probe, the error is: {}", e);
        }

        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod test {
    use super::super::backend::fake::{FakeBackend, FakeState};
    use super::super::meta_data::util;
    use super::*;

    fn identity() -> IdentityImpl {
        let meta_data = MetaData::new(
            util::CSI_PLUGIN_NAME.to_owned(),
            util::CSI_PLUGIN_VERSION.to_owned(),
            "node-a".to_owned(),
            "member-1".to_owned(),
            None,
            util::MOUNT_ROOT.to_owned(),
            false,
            Arc::new(FakeBackend::new(FakeState::default())),
        );
        IdentityImpl::new(Arc::new(meta_data))
    }

    #[tokio::test]
    async fn plugin_info_reports_name_and_version() {
        let resp = identity()
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .expect("get_plugin_info")
            .into_inner();
        assert_eq!(resp.name, util::CSI_PLUGIN_NAME);
        assert_eq!(resp.vendor_version, util::CSI_PLUGIN_VERSION);
    }

    #[tokio::test]
    async fn plugin_info_requires_a_name() {
        let meta_data = MetaData::new(
            String::new(),
            util::CSI_PLUGIN_VERSION.to_owned(),
            "node-a".to_owned(),
            "member-1".to_owned(),
            None,
            util::MOUNT_ROOT.to_owned(),
            false,
            Arc::new(FakeBackend::new(FakeState::default())),
        );
        let status = IdentityImpl::new(Arc::new(meta_data))
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .expect_err("empty driver name must fail");
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn plugin_advertises_controller_service() {
        let resp = identity()
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .expect("get_plugin_capabilities")
            .into_inner();
        let types: Vec<_> = resp
            .capabilities
            .iter()
            .filter_map(|cap| match &cap.r#type {
                Some(plugin_capability::Type::Service(svc)) => Some(svc.r#type),
                None => None,
            })
            .collect();
        assert_eq!(types, vec![ServiceType::ControllerService as i32]);
    }

    #[tokio::test]
    async fn probe_reports_ready() {
        let resp = identity()
            .probe(Request::new(ProbeRequest {}))
            .await
            .expect("probe")
            .into_inner();
        assert_eq!(resp.ready, Some(true));
    }
}
