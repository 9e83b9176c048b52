//! `IpamDriver.*` routes.

use super::{Empty, IPAM_DRIVER, PluginError, PluginJson, activate, decode};
use crate::ipam::IpamDriver;
use crate::protocol::{
    ActivateResponse, AddressSpacesResponse, IpamCapabilitiesResponse, ReleaseAddressRequest,
    ReleasePoolRequest, RequestAddressRequest, RequestAddressResponse, RequestPoolRequest,
    RequestPoolResponse,
};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;

type Reply<T> = Result<PluginJson<T>, PluginError>;

pub fn ipam_router(driver: IpamDriver) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(plugin_activate))
        .route("/IpamDriver.GetCapabilities", post(get_capabilities))
        .route(
            "/IpamDriver.GetDefaultAddressSpaces",
            post(get_default_address_spaces),
        )
        .route("/IpamDriver.RequestPool", post(request_pool))
        .route("/IpamDriver.ReleasePool", post(release_pool))
        .route("/IpamDriver.RequestAddress", post(request_address))
        .route("/IpamDriver.ReleaseAddress", post(release_address))
        .with_state(driver)
}

async fn plugin_activate() -> PluginJson<ActivateResponse> {
    activate(IPAM_DRIVER)
}

async fn get_capabilities(State(driver): State<IpamDriver>) -> PluginJson<IpamCapabilitiesResponse> {
    PluginJson(driver.capabilities())
}

async fn get_default_address_spaces(
    State(driver): State<IpamDriver>,
) -> PluginJson<AddressSpacesResponse> {
    PluginJson(driver.default_address_spaces())
}

async fn request_pool(State(driver): State<IpamDriver>, body: Bytes) -> Reply<RequestPoolResponse> {
    let req: RequestPoolRequest = decode(&body)?;
    Ok(PluginJson(driver.request_pool(req).await?))
}

async fn release_pool(State(driver): State<IpamDriver>, body: Bytes) -> Reply<Empty> {
    let req: ReleasePoolRequest = decode(&body)?;
    driver.release_pool(req).await?;
    Ok(PluginJson(Empty {}))
}

async fn request_address(
    State(driver): State<IpamDriver>,
    body: Bytes,
) -> Reply<RequestAddressResponse> {
    let req: RequestAddressRequest = decode(&body)?;
    Ok(PluginJson(driver.request_address(req).await?))
}

async fn release_address(State(driver): State<IpamDriver>, body: Bytes) -> Reply<Empty> {
    let req: ReleaseAddressRequest = decode(&body)?;
    driver.release_address(req).await?;
    Ok(PluginJson(Empty {}))
}
