//! Machina CSI `gRPC` service
//!
//! Translates the CSI RPCs issued by the orchestrator sidecars into calls
//! against the machina backend: custom volumes are created in its storage
//! pools, attached to the instance a workload runs in, and mounted into the
//! workload by the node service.

#![deny(unsafe_code, unstable_features)]
#![warn(missing_docs, unused_import_braces)]

// Ignore format and lint for the protocol definition code
#[rustfmt::skip]
#[allow(missing_docs, clippy::all)]
mod csi;
#[rustfmt::skip]
#[allow(missing_docs, clippy::all)]
mod csi_grpc;

mod backend;
mod controller;
mod error;
mod identity;
mod meta_data;
mod mount;
mod node;

use anyhow::Context;
use clap::{App, Arg, ArgMatches};
use log::{debug, info};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::server::Connected;
use tonic::transport::Server;

/// Thin wrapper adapting `tokio::net::UnixStream` to tonic's `Connected`
/// trait, which is only implemented for TCP streams upstream.
struct UdsConnection(tokio::net::UnixStream);

impl Connected for UdsConnection {}

impl AsyncRead for UdsConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UdsConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

use backend::{BackendApi, HttpBackendClient};
use controller::ControllerImpl;
use csi_grpc::controller_server::ControllerServer;
use csi_grpc::identity_server::IdentityServer;
use csi_grpc::node_server::NodeServer;
use identity::IdentityImpl;
use meta_data::util::{self, RunAsRole};
use meta_data::MetaData;
use node::NodeImpl;

/// Argument name of end point
const END_POINT_ARG_NAME: &str = "endpoint";
/// Argument name of driver name
const DRIVER_NAME_ARG_NAME: &str = "driver-name";
/// Argument name of node ID
const NODE_ID_ARG_NAME: &str = "node-id";
/// Argument name of volume name prefix
const VOLUME_NAME_PREFIX_ARG_NAME: &str = "volume-name-prefix";
/// Argument name of mount root
const MOUNT_ROOT_ARG_NAME: &str = "mount-root";
/// Argument name of backend URL
const BACKEND_URL_ARG_NAME: &str = "backend-url";
/// Argument name of run as role
const RUN_AS_ARG_NAME: &str = "role";

/// Parse command line arguments
fn parse_args() -> ArgMatches<'static> {
    App::new("machina-csi")
        .about("CSI driver for machina managed storage volumes")
        .arg(
            Arg::with_name(END_POINT_ARG_NAME)
                .short("s")
                .long(END_POINT_ARG_NAME)
                .value_name("SOCKET_FILE")
                .takes_value(true)
                .help(&format!(
                    "Set the socket end point of CSI service, \
                        default as {}",
                    util::END_POINT,
                )),
        )
        .arg(
            Arg::with_name(DRIVER_NAME_ARG_NAME)
                .short("d")
                .long(DRIVER_NAME_ARG_NAME)
                .value_name("DRIVER NAME")
                .takes_value(true)
                .help(&format!(
                    "Set the CSI driver name, default as {}",
                    util::CSI_PLUGIN_NAME,
                )),
        )
        .arg(
            Arg::with_name(NODE_ID_ARG_NAME)
                .short("n")
                .long(NODE_ID_ARG_NAME)
                .value_name("NODE ID")
                .takes_value(true)
                .help(
                    "Set the backend instance name this process represents, \
                        discovered from the backend when omitted",
                ),
        )
        .arg(
            Arg::with_name(VOLUME_NAME_PREFIX_ARG_NAME)
                .long(VOLUME_NAME_PREFIX_ARG_NAME)
                .value_name("PREFIX")
                .takes_value(true)
                .help(
                    "Set the prefix applied to sanitized PVC names, \
                        no prefix by default",
                ),
        )
        .arg(
            Arg::with_name(MOUNT_ROOT_ARG_NAME)
                .long(MOUNT_ROOT_ARG_NAME)
                .value_name("MOUNT ROOT")
                .takes_value(true)
                .help(&format!(
                    "Set the filesystem root under which attached volumes \
                        are mounted on instances, default as {}",
                    util::MOUNT_ROOT,
                )),
        )
        .arg(
            Arg::with_name(BACKEND_URL_ARG_NAME)
                .short("b")
                .long(BACKEND_URL_ARG_NAME)
                .value_name("URL")
                .takes_value(true)
                .help(&format!(
                    "Set the URL of the backend guest API, default as {}",
                    util::BACKEND_URL,
                )),
        )
        .arg(
            Arg::with_name(RUN_AS_ARG_NAME)
                .short("r")
                .long(RUN_AS_ARG_NAME)
                .value_name("ROLE NAME")
                .takes_value(true)
                .help(
                    "Set the runtime service, \
                        set as controller, node or both, \
                        default as both",
                ),
        )
        .get_matches()
}

/// Remove existing socket file before run CSI `gRPC` server
fn remove_socket_file(sock: &str) -> anyhow::Result<()> {
    if Path::new(sock).exists() {
        std::fs::remove_file(sock)
            .context(format!("failed to remove existing socket file {}", sock))?;
    }
    Ok(())
}

/// Serve the CSI services selected by the runtime role on the given socket
async fn run_grpc_server(
    end_point: &str,
    run_as: RunAsRole,
    meta_data: Arc<MetaData>,
) -> anyhow::Result<()> {
    let sock_path = end_point.strip_prefix("unix://").ok_or_else(|| {
        anyhow::anyhow!(
            "invalid socket end point: {}, should start with unix://",
            end_point,
        )
    })?;
    if let Some(parent) = Path::new(sock_path).parent() {
        std::fs::create_dir_all(parent)
            .context(format!("failed to create socket directory {:?}", parent))?;
    }
    remove_socket_file(sock_path)?;

    let listener = UnixListener::bind(sock_path)
        .context(format!("failed to bind socket file {}", sock_path))?;
    let incoming = tokio_stream::StreamExt::map(UnixListenerStream::new(listener), |res| {
        res.map(UdsConnection)
    });
    info!("CSI gRPC server listening on {} as {:?}", end_point, run_as);

    let identity = IdentityServer::new(IdentityImpl::new(Arc::clone(&meta_data)));
    let serve_res = match run_as {
        RunAsRole::Controller => {
            Server::builder()
                .add_service(identity)
                .add_service(ControllerServer::new(ControllerImpl::new(meta_data)))
                .serve_with_incoming(incoming)
                .await
        }
        RunAsRole::Node => {
            Server::builder()
                .add_service(identity)
                .add_service(NodeServer::new(NodeImpl::new(meta_data)))
                .serve_with_incoming(incoming)
                .await
        }
        RunAsRole::Both => {
            Server::builder()
                .add_service(identity)
                .add_service(ControllerServer::new(ControllerImpl::new(Arc::clone(
                    &meta_data,
                ))))
                .add_service(NodeServer::new(NodeImpl::new(meta_data)))
                .serve_with_incoming(incoming)
                .await
        }
    };
    serve_res.context("CSI gRPC server failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = parse_args();
    let end_point = matches
        .value_of(END_POINT_ARG_NAME)
        .unwrap_or(util::END_POINT)
        .to_owned();
    let driver_name = matches
        .value_of(DRIVER_NAME_ARG_NAME)
        .unwrap_or(util::CSI_PLUGIN_NAME)
        .to_owned();
    let backend_url = matches
        .value_of(BACKEND_URL_ARG_NAME)
        .unwrap_or(util::BACKEND_URL)
        .to_owned();
    let mount_root = matches
        .value_of(MOUNT_ROOT_ARG_NAME)
        .unwrap_or(util::MOUNT_ROOT)
        .to_owned();
    let volume_name_prefix = matches
        .value_of(VOLUME_NAME_PREFIX_ARG_NAME)
        .map(std::borrow::ToOwned::to_owned);
    let node_id_arg = matches
        .value_of(NODE_ID_ARG_NAME)
        .map(std::borrow::ToOwned::to_owned);
    let run_as = match matches.value_of(RUN_AS_ARG_NAME) {
        Some("controller") => RunAsRole::Controller,
        Some("node") => RunAsRole::Node,
        Some("both") | None => RunAsRole::Both,
        Some(other) => anyhow::bail!(
            "invalid {} argument {}, must be one of both, controller, node",
            RUN_AS_ARG_NAME,
            other,
        ),
    };
    debug!(
        "{}={}, {}={}, {}={}, {}={}, {}={:?}, {}={:?}, {}={:?}",
        END_POINT_ARG_NAME,
        end_point,
        DRIVER_NAME_ARG_NAME,
        driver_name,
        BACKEND_URL_ARG_NAME,
        backend_url,
        MOUNT_ROOT_ARG_NAME,
        mount_root,
        VOLUME_NAME_PREFIX_ARG_NAME,
        volume_name_prefix,
        NODE_ID_ARG_NAME,
        node_id_arg,
        RUN_AS_ARG_NAME,
        run_as,
    );

    let client =
        HttpBackendClient::new(&backend_url).context("failed to build backend client")?;
    let backend: Arc<dyn BackendApi> = Arc::new(client);

    let state = backend
        .server_state()
        .await
        .context("failed to retrieve backend server state")?;
    let node_id = match node_id_arg {
        Some(id) => id,
        None => {
            let discovered = state.instance_name.clone();
            if discovered.is_empty() && run_as != RunAsRole::Controller {
                anyhow::bail!(
                    "failed to discover the node ID from the backend, \
                        set --{} explicitly",
                    NODE_ID_ARG_NAME,
                );
            }
            discovered
        }
    };
    // A non-clustered backend reports no location; the instance name then
    // stands in for the member.
    let cluster_member = if state.location.is_empty() {
        node_id.clone()
    } else {
        state.location.clone()
    };
    info!(
        "starting driver {} on node ID={} at cluster member={} \
            (backend clustered={})",
        driver_name, node_id, cluster_member, state.server_clustered,
    );

    let meta_data = Arc::new(MetaData::new(
        driver_name,
        util::CSI_PLUGIN_VERSION.to_owned(),
        node_id,
        cluster_member,
        volume_name_prefix,
        mount_root,
        state.server_clustered,
        backend,
    ));

    run_grpc_server(&end_point, run_as, meta_data).await
}
