//! Shared test utilities for mvirt-vde integration tests.

#![allow(dead_code)]

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use mvirt_vde::api::{bind_unix, ipam_router, network_router, serve};
use mvirt_vde::config::DriverConfig;
use mvirt_vde::protocol::{CreateNetworkRequest, EndpointRequest, IpamData, JoinRequest};
use mvirt_vde::test_util::FakeHost;
use mvirt_vde::{DriverState, IpamDriver, NetworkDriver};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

/// Drivers over a [`FakeHost`] with sockets in a temporary directory.
pub struct TestDriver {
    pub state: Arc<DriverState>,
    pub network: NetworkDriver,
    pub ipam: IpamDriver,
    pub host: Arc<FakeHost>,
    pub dir: TempDir,
}

impl TestDriver {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let host = Arc::new(FakeHost::new());
        let mut config = DriverConfig::new(dir.path().join("sockets"));
        config.switch_grace_period = Duration::from_millis(20);
        let state = DriverState::new(config, host.clone());
        Self {
            network: state.network_driver(),
            ipam: state.ipam_driver(),
            state,
            host,
            dir,
        }
    }

    pub fn socket_root(&self) -> PathBuf {
        self.dir.path().join("sockets")
    }
}

pub fn create_network_request(id: &str, pool: &str, gateway: &str) -> CreateNetworkRequest {
    CreateNetworkRequest {
        network_id: id.to_string(),
        options: None,
        ipv4_data: Some(vec![IpamData {
            address_space: "local".to_string(),
            pool: pool.to_string(),
            gateway: gateway.to_string(),
            aux_addresses: None,
        }]),
        ipv6_data: None,
    }
}

pub fn endpoint_request(network_id: &str, endpoint_id: &str) -> EndpointRequest {
    EndpointRequest {
        network_id: network_id.to_string(),
        endpoint_id: endpoint_id.to_string(),
    }
}

pub fn join_request(network_id: &str, endpoint_id: &str) -> JoinRequest {
    JoinRequest {
        network_id: network_id.to_string(),
        endpoint_id: endpoint_id.to_string(),
        sandbox_key: "/var/run/docker/netns/test".to_string(),
        options: None,
    }
}

/// Plugin servers on real unix sockets, backed by a [`FakeHost`].
pub struct TestPlugin {
    pub driver: TestDriver,
    pub network_sock: PathBuf,
    pub ipam_sock: PathBuf,
    shutdown_tx: watch::Sender<bool>,
}

impl TestPlugin {
    pub async fn spawn() -> Self {
        let driver = TestDriver::new();
        let network_sock = driver.dir.path().join("plugins").join("vde.sock");
        let ipam_sock = driver.dir.path().join("plugins").join("vde-ipam.sock");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = bind_unix(&network_sock).expect("Failed to bind network socket");
        tokio::spawn(serve(
            listener,
            network_router(driver.network.clone()),
            shutdown_rx.clone(),
        ));

        let listener = bind_unix(&ipam_sock).expect("Failed to bind IPAM socket");
        tokio::spawn(serve(
            listener,
            ipam_router(driver.ipam.clone()),
            shutdown_rx,
        ));

        Self {
            driver,
            network_sock,
            ipam_sock,
            shutdown_tx,
        }
    }

    pub async fn network(&self, method: &str, body: Value) -> (StatusCode, Value) {
        post(&self.network_sock, &format!("/NetworkDriver.{}", method), body).await
    }

    pub async fn ipam(&self, method: &str, body: Value) -> (StatusCode, Value) {
        post(&self.ipam_sock, &format!("/IpamDriver.{}", method), body).await
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for TestPlugin {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// POST a JSON body the way the docker daemon does and decode the reply.
pub async fn post(socket: &Path, path: &str, body: Value) -> (StatusCode, Value) {
    let client: Client<_, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(hyperlocal::UnixConnector);

    let req = Request::builder()
        .method(Method::POST)
        .uri(hyperlocal::Uri::new(socket, path))
        .header("Content-Type", "application/vnd.docker.plugins.v1.2+json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("Failed to build request");

    let resp = client.request(req).await.expect("Request failed");
    let status = resp.status();
    let content_type = resp
        .headers()
        .get("Content-Type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    assert_eq!(
        content_type.as_deref(),
        Some("application/vnd.docker.plugins.v1+json")
    );

    let bytes = resp
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let value = serde_json::from_slice(&bytes).expect("Response is not JSON");
    (status, value)
}
