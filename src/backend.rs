//! The machina backend REST client
//!
//! The driver talks to the machine manager through its guest-scoped HTTP API.
//! Every call goes through the [`BackendApi`] trait so that the controller
//! and node servers never depend on the concrete transport; tests plug an
//! in-memory implementation into the same seam.

use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::error::DriverError;

/// Volume type managed by this driver. Other backend volume types are never
/// touched.
pub const VOLUME_TYPE_CUSTOM: &str = "custom";

/// Request timeout towards the backend.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport-level failure statuses the driver distinguishes.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The named entity does not exist on the backend.
    #[error("{0}")]
    NotFound(String),
    /// The etag supplied with an update no longer matches.
    #[error("{0}")]
    PreconditionFailed(String),
    /// The backend rejected the credentials or the operation.
    #[error("{0}")]
    PermissionDenied(String),
    /// The backend could not be reached or the request timed out.
    #[error("{0}")]
    Unavailable(String),
    /// The backend rejected the request as malformed.
    #[error("{0}")]
    InvalidArgument(String),
    /// Any other backend failure.
    #[error("backend error {code}: {message}")]
    Api {
        /// HTTP status code reported by the backend.
        code: u16,
        /// Error string from the response envelope.
        message: String,
    },
}

impl BackendError {
    /// Whether this error means the named entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(..))
    }

    /// Lift to a driver error of the matching kind, prefixing the failed
    /// operation.
    pub fn context(self, msg: impl Into<String>) -> DriverError {
        let full = format!("{}, the error is: {}", msg.into(), self);
        match self {
            BackendError::NotFound(..) => DriverError::NotFound(full),
            BackendError::PreconditionFailed(..) => DriverError::Conflict(full),
            BackendError::Unavailable(..) => DriverError::Unavailable(full),
            BackendError::InvalidArgument(..) => DriverError::InvalidInput(full),
            BackendError::PermissionDenied(..) | BackendError::Api { .. } => {
                DriverError::Internal(full)
            }
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            BackendError::Unavailable(format!("backend unreachable: {}", err))
        } else {
            BackendError::Api {
                code: err.status().map_or(0, |s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

/// A storage driver supported by the backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageDriverInfo {
    /// Driver name, e.g. `zfs` or `ceph`.
    pub name: String,
    /// Driver version string.
    #[serde(default)]
    pub version: String,
    /// Whether pools of this driver are accessible from every cluster
    /// member.
    #[serde(default)]
    pub remote: bool,
}

/// Backend server state as reported by the guest API root endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerState {
    /// Name under which the calling instance is known to the backend.
    #[serde(default)]
    pub instance_name: String,
    /// Cluster member the calling instance runs on, empty when the backend
    /// is not clustered.
    #[serde(default)]
    pub location: String,
    /// Whether the backend runs in cluster mode.
    #[serde(default)]
    pub server_clustered: bool,
    /// Storage drivers the backend supports.
    #[serde(default)]
    pub supported_storage_drivers: Vec<StorageDriverInfo>,
}

impl ServerState {
    /// Find the descriptor of the given storage driver.
    pub fn storage_driver(&self, name: &str) -> Option<&StorageDriverInfo> {
        self.supported_storage_drivers.iter().find(|d| d.name == name)
    }
}

/// A backend storage pool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoragePool {
    /// Pool name.
    pub name: String,
    /// Storage driver backing the pool.
    pub driver: String,
    /// Pool status string.
    #[serde(default)]
    pub status: String,
}

/// A volume within a backend storage pool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageVolume {
    /// Volume name, unique within its pool.
    pub name: String,
    /// Backend volume type, always `custom` for driver-managed volumes.
    #[serde(rename = "type")]
    pub volume_type: String,
    /// Content type, `filesystem` or `block`.
    #[serde(default)]
    pub content_type: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Driver-specific configuration, including `size` in bytes.
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// Cluster member the volume is resident on, empty for remote pools.
    #[serde(default)]
    pub location: String,
}

/// Creation request for a custom storage volume.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageVolumesPost {
    /// Volume name.
    pub name: String,
    /// Backend volume type, always `custom`.
    #[serde(rename = "type")]
    pub volume_type: String,
    /// Content type, `filesystem` or `block`.
    pub content_type: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Driver-specific configuration, including `size` in bytes.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Configuration of a single instance device.
pub type DeviceConfig = HashMap<String, String>;

/// A backend instance record.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Instance {
    /// Instance name.
    pub name: String,
    /// Device map keyed by device name.
    #[serde(default)]
    pub devices: HashMap<String, DeviceConfig>,
    /// Cluster member the instance runs on.
    #[serde(default)]
    pub location: String,
}

/// Device patch for an instance update. A `None` value serializes to JSON
/// null, which the backend treats as device removal.
#[derive(Clone, Debug, Default, Serialize)]
pub struct InstanceDevicePatch {
    /// Devices to add, replace or remove.
    pub devices: HashMap<String, Option<DeviceConfig>>,
}

/// The narrow backend surface both CSI servers depend on.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Fetch the backend server state.
    async fn server_state(&self) -> Result<ServerState, BackendError>;

    /// Fetch a storage pool by name.
    async fn storage_pool(&self, pool: &str) -> Result<StoragePool, BackendError>;

    /// Fetch a custom volume from a pool.
    async fn custom_volume(&self, pool: &str, name: &str) -> Result<StorageVolume, BackendError>;

    /// Create a custom volume in a pool.
    async fn create_custom_volume(
        &self,
        pool: &str,
        volume: StorageVolumesPost,
    ) -> Result<(), BackendError>;

    /// Delete a custom volume from a pool.
    async fn delete_custom_volume(&self, pool: &str, name: &str) -> Result<(), BackendError>;

    /// Fetch an instance record together with its etag.
    async fn instance(&self, name: &str) -> Result<(Instance, String), BackendError>;

    /// Apply a device patch to an instance. The etag must be the one
    /// returned by a preceding [`BackendApi::instance`] call; the backend
    /// rejects the update when the record changed in between.
    async fn update_instance(
        &self,
        name: &str,
        patch: InstanceDevicePatch,
        etag: &str,
    ) -> Result<(), BackendError>;

    /// Derive a client that routes subsequent calls to the given cluster
    /// member.
    fn with_target(&self, member: &str) -> Arc<dyn BackendApi>;
}

/// Response envelope wrapping every backend API payload.
#[derive(Debug, Deserialize)]
struct ResponseEnvelope<T> {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    error: String,
    metadata: Option<T>,
}

/// HTTP implementation of [`BackendApi`].
#[derive(Clone, Debug)]
pub struct HttpBackendClient {
    http: reqwest::Client,
    base_url: reqwest::Url,
    target: Option<String>,
}

impl HttpBackendClient {
    /// Build a client for the backend reachable at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let base_url = reqwest::Url::parse(base_url).map_err(|e| {
            BackendError::InvalidArgument(format!(
                "invalid backend URL {}, the error is: {}",
                base_url, e,
            ))
        })?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                BackendError::InvalidArgument(format!(
                    "failed to build HTTP client, the error is: {}",
                    e,
                ))
            })?;
        Ok(Self {
            http,
            base_url,
            target: None,
        })
    }

    /// The cluster member subsequent calls are routed to, if any.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut url = self.base_url.clone();
        url.set_path(&format!("/1.0{}", path));
        let mut builder = self.http.request(method, url);
        if let Some(target) = &self.target {
            builder = builder.query(&[("target", target.as_str())]);
        }
        builder
    }

    /// Map a non-success response to the matching transport error.
    async fn error_from_response(resp: reqwest::Response) -> BackendError {
        let status = resp.status().as_u16();
        let message = match resp.json::<ResponseEnvelope<serde_json::Value>>().await {
            Ok(envelope) if !envelope.error.is_empty() => envelope.error,
            _ => format!("backend request failed with status {}", status),
        };
        match status {
            400 => BackendError::InvalidArgument(message),
            403 => BackendError::PermissionDenied(message),
            404 => BackendError::NotFound(message),
            412 => BackendError::PreconditionFailed(message),
            502..=504 => BackendError::Unavailable(message),
            code => BackendError::Api { code, message },
        }
    }

    /// Check the response status and unwrap the envelope payload, returning
    /// it together with the response etag.
    async fn finish<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<(T, String), BackendError> {
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        let envelope = resp.json::<ResponseEnvelope<T>>().await?;
        if envelope.kind == "error" {
            return Err(BackendError::Api {
                code: 0,
                message: envelope.error,
            });
        }
        let metadata = envelope.metadata.ok_or_else(|| BackendError::Api {
            code: 0,
            message: "response envelope carries no metadata".to_owned(),
        })?;
        Ok((metadata, etag))
    }

    /// Like [`Self::finish`] but for calls whose payload is irrelevant.
    async fn finish_empty(resp: reqwest::Response) -> Result<(), BackendError> {
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }
        Ok(())
    }
}

#[async_trait]
impl BackendApi for HttpBackendClient {
    async fn server_state(&self) -> Result<ServerState, BackendError> {
        let resp = self.request(reqwest::Method::GET, "").send().await?;
        let (state, _) = Self::finish::<ServerState>(resp).await?;
        Ok(state)
    }

    async fn storage_pool(&self, pool: &str) -> Result<StoragePool, BackendError> {
        let path = format!("/storage-pools/{}", pool);
        let resp = self.request(reqwest::Method::GET, &path).send().await?;
        let (pool, _) = Self::finish::<StoragePool>(resp).await?;
        Ok(pool)
    }

    async fn custom_volume(&self, pool: &str, name: &str) -> Result<StorageVolume, BackendError> {
        let path = format!(
            "/storage-pools/{}/volumes/{}/{}",
            pool, VOLUME_TYPE_CUSTOM, name,
        );
        let resp = self.request(reqwest::Method::GET, &path).send().await?;
        let (volume, _) = Self::finish::<StorageVolume>(resp).await?;
        Ok(volume)
    }

    async fn create_custom_volume(
        &self,
        pool: &str,
        volume: StorageVolumesPost,
    ) -> Result<(), BackendError> {
        debug!(
            "creating custom volume name={} in pool={} on target={:?}",
            volume.name, pool, self.target,
        );
        let path = format!("/storage-pools/{}/volumes/{}", pool, VOLUME_TYPE_CUSTOM);
        let resp = self
            .request(reqwest::Method::POST, &path)
            .json(&volume)
            .send()
            .await?;
        Self::finish_empty(resp).await
    }

    async fn delete_custom_volume(&self, pool: &str, name: &str) -> Result<(), BackendError> {
        debug!(
            "deleting custom volume name={} from pool={} on target={:?}",
            name, pool, self.target,
        );
        let path = format!(
            "/storage-pools/{}/volumes/{}/{}",
            pool, VOLUME_TYPE_CUSTOM, name,
        );
        let resp = self.request(reqwest::Method::DELETE, &path).send().await?;
        Self::finish_empty(resp).await
    }

    async fn instance(&self, name: &str) -> Result<(Instance, String), BackendError> {
        let path = format!("/instances/{}", name);
        let resp = self.request(reqwest::Method::GET, &path).send().await?;
        Self::finish::<Instance>(resp).await
    }

    async fn update_instance(
        &self,
        name: &str,
        patch: InstanceDevicePatch,
        etag: &str,
    ) -> Result<(), BackendError> {
        debug!("patching devices of instance name={}", name);
        let path = format!("/instances/{}", name);
        let mut builder = self.request(reqwest::Method::PATCH, &path).json(&patch);
        if !etag.is_empty() {
            builder = builder.header(reqwest::header::IF_MATCH, etag);
        }
        let resp = builder.send().await?;
        Self::finish_empty(resp).await
    }

    fn with_target(&self, member: &str) -> Arc<dyn BackendApi> {
        Arc::new(Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            target: Some(member.to_owned()),
        })
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory backend used by the server unit tests.

    use super::*;
    use std::sync::Mutex;

    /// Mutable state shared by a fake backend and all its targeted derivations.
    #[derive(Debug, Default)]
    pub struct FakeState {
        pub server: ServerState,
        pub pools: HashMap<String, StoragePool>,
        /// Volumes keyed by (pool, name).
        pub volumes: HashMap<(String, String), StorageVolume>,
        pub instances: HashMap<String, Instance>,
        /// Instance revision counters backing the etags.
        pub revisions: HashMap<String, u64>,
        /// Target recorded for every create call, in order.
        pub create_targets: Vec<Option<String>>,
        /// Number of instance updates applied.
        pub update_count: usize,
    }

    /// In-memory [`BackendApi`] implementation.
    #[derive(Debug, Default)]
    pub struct FakeBackend {
        state: Arc<Mutex<FakeState>>,
        target: Option<String>,
    }

    impl FakeBackend {
        pub fn new(state: FakeState) -> Self {
            Self {
                state: Arc::new(Mutex::new(state)),
                target: None,
            }
        }

        /// Run a closure against the shared state.
        pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut state)
        }

        fn etag(rev: u64) -> String {
            format!("rev-{}", rev)
        }
    }

    #[async_trait]
    impl BackendApi for FakeBackend {
        async fn server_state(&self) -> Result<ServerState, BackendError> {
            Ok(self.with_state(|s| s.server.clone()))
        }

        async fn storage_pool(&self, pool: &str) -> Result<StoragePool, BackendError> {
            self.with_state(|s| {
                s.pools
                    .get(pool)
                    .cloned()
                    .ok_or_else(|| BackendError::NotFound(format!("storage pool {}", pool)))
            })
        }

        async fn custom_volume(
            &self,
            pool: &str,
            name: &str,
        ) -> Result<StorageVolume, BackendError> {
            self.with_state(|s| {
                s.volumes
                    .get(&(pool.to_owned(), name.to_owned()))
                    .cloned()
                    .ok_or_else(|| {
                        BackendError::NotFound(format!("storage volume {}/{}", pool, name))
                    })
            })
        }

        async fn create_custom_volume(
            &self,
            pool: &str,
            volume: StorageVolumesPost,
        ) -> Result<(), BackendError> {
            let target = self.target.clone();
            self.with_state(|s| {
                let key = (pool.to_owned(), volume.name.clone());
                if s.volumes.contains_key(&key) {
                    return Err(BackendError::Api {
                        code: 409,
                        message: format!("volume {} already exists", volume.name),
                    });
                }
                s.create_targets.push(target.clone());
                s.volumes.insert(
                    key,
                    StorageVolume {
                        name: volume.name,
                        volume_type: volume.volume_type,
                        content_type: volume.content_type,
                        description: volume.description,
                        config: volume.config,
                        location: target.unwrap_or_default(),
                    },
                );
                Ok(())
            })
        }

        async fn delete_custom_volume(&self, pool: &str, name: &str) -> Result<(), BackendError> {
            self.with_state(|s| {
                s.volumes
                    .remove(&(pool.to_owned(), name.to_owned()))
                    .map(|_| ())
                    .ok_or_else(|| {
                        BackendError::NotFound(format!("storage volume {}/{}", pool, name))
                    })
            })
        }

        async fn instance(&self, name: &str) -> Result<(Instance, String), BackendError> {
            self.with_state(|s| {
                let instance = s
                    .instances
                    .get(name)
                    .cloned()
                    .ok_or_else(|| BackendError::NotFound(format!("instance {}", name)))?;
                let rev = s.revisions.get(name).copied().unwrap_or(0);
                Ok((instance, Self::etag(rev)))
            })
        }

        async fn update_instance(
            &self,
            name: &str,
            patch: InstanceDevicePatch,
            etag: &str,
        ) -> Result<(), BackendError> {
            self.with_state(|s| {
                let rev = s.revisions.get(name).copied().unwrap_or(0);
                if !s.instances.contains_key(name) {
                    return Err(BackendError::NotFound(format!("instance {}", name)));
                }
                if !etag.is_empty() && etag != Self::etag(rev) {
                    return Err(BackendError::PreconditionFailed(format!(
                        "etag mismatch on instance {}",
                        name,
                    )));
                }
                let instance = s
                    .instances
                    .get_mut(name)
                    .expect("instance presence checked above");
                for (device_name, config) in patch.devices {
                    match config {
                        Some(config) => {
                            instance.devices.insert(device_name, config);
                        }
                        None => {
                            instance.devices.remove(&device_name);
                        }
                    }
                }
                s.revisions.insert(name.to_owned(), rev + 1);
                s.update_count += 1;
                Ok(())
            })
        }

        fn with_target(&self, member: &str) -> Arc<dyn BackendApi> {
            Arc::new(Self {
                state: Arc::clone(&self.state),
                target: Some(member.to_owned()),
            })
        }
    }
}
