//! Docker plugin protocol over HTTP on unix sockets.

mod ipam;
mod network;

pub use ipam::ipam_router;
pub use network::network_router;

use crate::error::{DriverError, ErrorKind};
use crate::host::shutdown_requested;
use crate::protocol::{ActivateResponse, ErrorResponse};
use axum::Router;
use axum::body::Bytes;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::path::Path;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Content type of every plugin response.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1+json";

pub const NETWORK_DRIVER: &str = "NetworkDriver";
pub const IPAM_DRIVER: &str = "IpamDriver";

/// JSON body with the plugin content type.
pub struct PluginJson<T>(pub T);

impl<T: Serialize> IntoResponse for PluginJson<T> {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self.0) {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)],
                body,
            )
                .into_response(),
            Err(e) => PluginError::internal(format!("Failed to encode response: {}", e)).into_response(),
        }
    }
}

/// Empty success body (`{}`).
#[derive(Debug, Default, Serialize)]
pub struct Empty {}

/// Error reply in the `{"Err": "..."}` shape docker expects.
#[derive(Debug)]
pub struct PluginError {
    status: StatusCode,
    message: String,
}

impl PluginError {
    pub fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    pub fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl IntoResponse for PluginError {
    fn into_response(self) -> Response {
        let body = serde_json::to_vec(&ErrorResponse {
            err: self.message.clone(),
        })
        .unwrap_or_else(|_| br#"{"Err":"internal error"}"#.to_vec());
        (
            self.status,
            [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)],
            body,
        )
            .into_response()
    }
}

impl From<DriverError> for PluginError {
    fn from(e: DriverError) -> Self {
        let status = match e.kind() {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::ResourceExhausted => StatusCode::INSUFFICIENT_STORAGE,
            ErrorKind::ExternalFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Interrupted => StatusCode::SERVICE_UNAVAILABLE,
        };
        if e.is_fatal() {
            warn!(error = %e, "Request aborted by shutdown");
        } else {
            error!(error = %e, "Request failed");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

/// Decode a request body whatever content type docker claims.
/// An empty body decodes to the request's default.
pub fn decode<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, PluginError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| PluginError::bad_request(format!("Malformed request body: {}", e)))
}

pub(crate) fn activate(implements: &str) -> PluginJson<ActivateResponse> {
    info!(implements, "Plugin.Activate request received");
    PluginJson(ActivateResponse {
        implements: vec![implements.to_string()],
    })
}

/// Bind a plugin socket, creating parent directories and replacing a stale socket file.
pub fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Serve `router` on `listener` until shutdown is requested.
pub async fn serve(
    listener: UnixListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_requested(&mut shutdown).await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JoinRequest;

    #[test]
    fn test_decode_empty_body() {
        let req: JoinRequest = decode(&Bytes::from_static(b"")).unwrap();
        assert!(req.network_id.is_empty());
        let req: JoinRequest = decode(&Bytes::from_static(b" \n")).unwrap();
        assert!(req.endpoint_id.is_empty());
    }

    #[test]
    fn test_decode_malformed_body() {
        let err = decode::<JoinRequest>(&Bytes::from_static(b"{not json")).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_driver_error_status() {
        let err: PluginError = DriverError::NetworkNotFound("n1".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "Network does not exist: n1");

        let err: PluginError = DriverError::NetworkInUse(1).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins").join("vde.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let _listener = bind_unix(&path).unwrap();
        });
        assert!(path.exists());
    }
}
