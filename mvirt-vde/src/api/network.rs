//! `NetworkDriver.*` routes.

use super::{Empty, NETWORK_DRIVER, PluginError, PluginJson, activate, decode};
use crate::network::NetworkDriver;
use crate::protocol::{
    ActivateResponse, CapabilitiesResponse, CreateEndpointRequest, CreateEndpointResponse,
    CreateNetworkRequest, DeleteEndpointRequest, DeleteNetworkRequest, DiscoveryNotification,
    ExternalConnectivityRequest, InfoRequest, InfoResponse, JoinRequest, JoinResponse,
    LeaveRequest,
};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;

type Reply<T> = Result<PluginJson<T>, PluginError>;

pub fn network_router(driver: NetworkDriver) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(plugin_activate))
        .route("/NetworkDriver.GetCapabilities", post(get_capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .route("/NetworkDriver.DiscoverNew", post(discover_new))
        .route("/NetworkDriver.DiscoverDelete", post(discover_delete))
        .route(
            "/NetworkDriver.ProgramExternalConnectivity",
            post(program_external_connectivity),
        )
        .route(
            "/NetworkDriver.RevokeExternalConnectivity",
            post(revoke_external_connectivity),
        )
        .with_state(driver)
}

async fn plugin_activate() -> PluginJson<ActivateResponse> {
    activate(NETWORK_DRIVER)
}

async fn get_capabilities(State(driver): State<NetworkDriver>) -> PluginJson<CapabilitiesResponse> {
    PluginJson(driver.capabilities())
}

async fn create_network(State(driver): State<NetworkDriver>, body: Bytes) -> Reply<Empty> {
    let req: CreateNetworkRequest = decode(&body)?;
    driver.create_network(req).await?;
    Ok(PluginJson(Empty {}))
}

async fn delete_network(State(driver): State<NetworkDriver>, body: Bytes) -> Reply<Empty> {
    let req: DeleteNetworkRequest = decode(&body)?;
    driver.delete_network(req).await?;
    Ok(PluginJson(Empty {}))
}

async fn create_endpoint(
    State(driver): State<NetworkDriver>,
    body: Bytes,
) -> Reply<CreateEndpointResponse> {
    let req: CreateEndpointRequest = decode(&body)?;
    Ok(PluginJson(driver.create_endpoint(req).await?))
}

async fn endpoint_info(State(driver): State<NetworkDriver>, body: Bytes) -> Reply<InfoResponse> {
    let req: InfoRequest = decode(&body)?;
    Ok(PluginJson(driver.endpoint_info(req).await?))
}

async fn delete_endpoint(State(driver): State<NetworkDriver>, body: Bytes) -> Reply<Empty> {
    let req: DeleteEndpointRequest = decode(&body)?;
    driver.delete_endpoint(req).await?;
    Ok(PluginJson(Empty {}))
}

async fn join(State(driver): State<NetworkDriver>, body: Bytes) -> Reply<JoinResponse> {
    let req: JoinRequest = decode(&body)?;
    Ok(PluginJson(driver.join(req).await?))
}

async fn leave(State(driver): State<NetworkDriver>, body: Bytes) -> Reply<Empty> {
    let req: LeaveRequest = decode(&body)?;
    driver.leave(req).await?;
    Ok(PluginJson(Empty {}))
}

async fn discover_new(State(driver): State<NetworkDriver>, body: Bytes) -> Reply<Empty> {
    let req: DiscoveryNotification = decode(&body)?;
    driver.discover_new(req)?;
    Ok(PluginJson(Empty {}))
}

async fn discover_delete(State(driver): State<NetworkDriver>, body: Bytes) -> Reply<Empty> {
    let req: DiscoveryNotification = decode(&body)?;
    driver.discover_delete(req)?;
    Ok(PluginJson(Empty {}))
}

async fn program_external_connectivity(
    State(driver): State<NetworkDriver>,
    body: Bytes,
) -> Reply<Empty> {
    let req: ExternalConnectivityRequest = decode(&body)?;
    driver.program_external_connectivity(req)?;
    Ok(PluginJson(Empty {}))
}

async fn revoke_external_connectivity(
    State(driver): State<NetworkDriver>,
    body: Bytes,
) -> Reply<Empty> {
    let req: ExternalConnectivityRequest = decode(&body)?;
    driver.revoke_external_connectivity(req)?;
    Ok(PluginJson(Empty {}))
}
