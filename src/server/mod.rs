//! Device-facing protocol server
//!
//! Serves the three protocol operations over mutual TLS. The TLS layer only
//! *requires* a peer certificate; whether it is acceptable is decided here,
//! per request, because the policy depends on the path: the registration
//! endpoint takes any certificate our CA signed (even expired), everything
//! else takes full verification.
//!
//! The accept loop terminates TLS itself so the verified peer certificates
//! can be threaded into the request pipeline; the authenticated principal
//! (the first peer certificate's Common Name) rides along as a request
//! extension from the middleware to the handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::mtls::{verify_request, AuthType, TrustChain};
use crate::pki;
use crate::protocol::{Handler, Message, Principal};
use crate::Error;

/// Path segment selecting the registration verification policy
const REGISTRATION_SEGMENT: &str = "registration";

/// DER-encoded peer certificates of one connection, attached to every
/// request arriving over it
#[derive(Clone, Default)]
pub struct PeerCertificates(pub Arc<Vec<Vec<u8>>>);

/// The request principal as established by the auth middleware: present
/// when the verified peer certificate carried a Common Name.
///
/// Always inserted, so its absence inside a handler means "no identity",
/// never "middleware did not run".
#[derive(Clone, Default)]
pub struct RequestPrincipal(pub Option<Principal>);

/// Shared state behind the device-facing routes
pub struct ServerState {
    /// The protocol handler
    pub handler: Handler,
    /// CA certificates trusted for peer verification
    pub chain: TrustChain,
}

/// Decide the verification policy from the request path: a trailing
/// `registration` segment selects the registration policy.
pub fn auth_type_for_path(path: &str) -> AuthType {
    match path.trim_end_matches('/').rsplit('/').next() {
        Some(REGISTRATION_SEGMENT) => AuthType::Registration,
        _ => AuthType::Normal,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Coarse codes only: internal detail stays on this side of the
        // trust boundary.
        let (status, message) = match &self {
            Error::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_string()),
            Error::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            e if e.is_not_found() => (StatusCode::NOT_FOUND, "not found".to_string()),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Build the device-facing router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(
            "/api/v1/devices/{device_id}/control-message",
            get(get_control_message),
        )
        .route(
            "/api/v1/devices/{device_id}/data-message",
            get(get_data_message).post(post_data_message),
        )
        .route(
            "/api/v1/devices/{device_id}/registration",
            post(post_data_message),
        )
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .with_state(state)
}

/// Per-request verification policy plus principal extraction.
///
/// Rejection is a plain 401; the handlers never see an unverified request.
async fn authenticate(
    State(state): State<Arc<ServerState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth = auth_type_for_path(request.uri().path());
    let peers = request
        .extensions()
        .get::<PeerCertificates>()
        .cloned()
        .unwrap_or_default();

    if !verify_request(&peers.0, auth, &state.chain) {
        debug!(path = %request.uri().path(), ?auth, "peer certificate rejected");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let principal = peers
        .0
        .first()
        .and_then(|der| pki::peer_common_name(der).ok().flatten())
        .map(Principal);
    request.extensions_mut().insert(RequestPrincipal(principal));

    next.run(request).await
}

async fn get_control_message(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
    Extension(RequestPrincipal(principal)): Extension<RequestPrincipal>,
) -> Result<Response, Error> {
    let response = state
        .handler
        .get_control_message(principal.as_ref(), &device_id)
        .await?;
    Ok(Json(response).into_response())
}

async fn get_data_message(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
    Extension(RequestPrincipal(principal)): Extension<RequestPrincipal>,
) -> Result<Response, Error> {
    let response = state
        .handler
        .get_data_message(principal.as_ref(), &device_id)
        .await?;
    Ok(Json(response).into_response())
}

async fn post_data_message(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
    Extension(RequestPrincipal(principal)): Extension<RequestPrincipal>,
    Json(message): Json<Message>,
) -> Result<Response, Error> {
    let response = state
        .handler
        .post_data_message(principal.as_ref(), &device_id, &message)
        .await?;
    Ok(Json(response).into_response())
}

/// Serve the device-facing API over mutual TLS.
///
/// Terminates TLS per connection, collects the peer certificates, and
/// serves the router with them attached as a connection-wide extension.
pub async fn serve(
    addr: SocketAddr,
    tls_config: Arc<ServerConfig>,
    state: Arc<ServerState>,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal(format!("cannot bind {addr}: {e}")))?;
    let acceptor = TlsAcceptor::from(tls_config);
    let app = router(state);

    info!(%addr, "device API listening");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!(%peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let peer_certs: Vec<Vec<u8>> = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default();

            let service = app.layer(Extension(PeerCertificates(Arc::new(peer_certs))));

            if let Err(e) = ConnectionBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(
                    TokioIo::new(tls_stream),
                    TowerToHyperService::new(service),
                )
                .await
            {
                debug!(%peer_addr, error = %e, "connection ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EdgeDevice, EdgeDeviceSpec};
    use crate::events::MockEventSink;
    use crate::pki::issue_test_client_cert;
    use crate::registry::MockRegistryAuth;
    use crate::repository::{MockDeploymentRepository, MockDeviceRepository};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use kube::api::ObjectMeta;
    use tower::ServiceExt;

    #[test]
    fn registration_paths_select_the_registration_policy() {
        assert_eq!(
            auth_type_for_path("/api/v1/devices/foo/registration"),
            AuthType::Registration
        );
        assert_eq!(
            auth_type_for_path("/api/v1/devices/foo/registration/"),
            AuthType::Registration
        );
        assert_eq!(
            auth_type_for_path("/api/v1/devices/foo/data-message"),
            AuthType::Normal
        );
        assert_eq!(auth_type_for_path("/"), AuthType::Normal);
    }

    #[test]
    fn errors_map_to_coarse_status_codes() {
        let cases = [
            (Error::Forbidden, StatusCode::FORBIDDEN),
            (
                Error::invalid_input("bad directive"),
                StatusCode::BAD_REQUEST,
            ),
            (Error::not_found("device"), StatusCode::NOT_FOUND),
            (
                Error::internal("store down"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                Error::Conflict("stale".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    fn sample_device(name: &str) -> EdgeDevice {
        EdgeDevice {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("fleet".to_string()),
                ..Default::default()
            },
            spec: EdgeDeviceSpec::default(),
            status: None,
        }
    }

    fn state_with_devices(
        devices: MockDeviceRepository,
        chain: TrustChain,
    ) -> Arc<ServerState> {
        let mut events = MockEventSink::new();
        events.expect_publish().times(0..).returning(|_, _, _, _| ());
        Arc::new(ServerState {
            handler: Handler::new(
                Arc::new(devices),
                Arc::new(MockDeploymentRepository::new()),
                "fleet",
                Arc::new(events),
                Arc::new(MockRegistryAuth::new()),
                None,
            ),
            chain,
        })
    }

    fn request_with_certs(path: &str, certs: Vec<Vec<u8>>) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(path)
            .extension(PeerCertificates(Arc::new(certs)))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn request_without_peer_certificate_is_unauthorized() {
        let ca = pki::generate_ca("Server CA").unwrap();
        let chain = TrustChain::new(vec![ca.cert_der().unwrap()]);
        let app = router(state_with_devices(MockDeviceRepository::new(), chain));

        let response = app
            .oneshot(request_with_certs(
                "/api/v1/devices/foo/control-message",
                vec![],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn device_certificate_reaches_its_own_device() {
        let ca = pki::generate_ca("Server CA").unwrap();
        let chain = TrustChain::new(vec![ca.cert_der().unwrap()]);

        let mut devices = MockDeviceRepository::new();
        devices
            .expect_read()
            .withf(|name, _| name == "foo")
            .returning(|name, _| Ok(sample_device(name)));

        let cert = issue_test_client_cert(&ca, "foo", 30);
        let app = router(state_with_devices(devices, chain));

        let response = app
            .oneshot(request_with_certs(
                "/api/v1/devices/foo/control-message",
                vec![cert.cert_der().unwrap()],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn device_certificate_cannot_reach_another_device() {
        let ca = pki::generate_ca("Server CA").unwrap();
        let chain = TrustChain::new(vec![ca.cert_der().unwrap()]);

        let cert = issue_test_client_cert(&ca, "someone-else", 30);
        let app = router(state_with_devices(MockDeviceRepository::new(), chain));

        let response = app
            .oneshot(request_with_certs(
                "/api/v1/devices/foo/control-message",
                vec![cert.cert_der().unwrap()],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn foreign_certificate_is_unauthorized() {
        let ca = pki::generate_ca("Server CA").unwrap();
        let foreign = pki::generate_ca("Foreign CA").unwrap();
        let chain = TrustChain::new(vec![ca.cert_der().unwrap()]);

        let cert = issue_test_client_cert(&foreign, "foo", 30);
        let app = router(state_with_devices(MockDeviceRepository::new(), chain));

        let response = app
            .oneshot(request_with_certs(
                "/api/v1/devices/foo/control-message",
                vec![cert.cert_der().unwrap()],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn expired_certificate_is_rejected_outside_registration() {
        let ca = pki::generate_ca("Server CA").unwrap();
        let chain = TrustChain::new(vec![ca.cert_der().unwrap()]);

        let expired = issue_test_client_cert(&ca, "foo", -1);
        let app = router(state_with_devices(MockDeviceRepository::new(), chain));

        let response = app
            .oneshot(request_with_certs(
                "/api/v1/devices/foo/data-message",
                vec![expired.cert_der().unwrap()],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn expired_certificate_still_registers() {
        let ca = pki::generate_ca("Server CA").unwrap();
        let chain = TrustChain::new(vec![ca.cert_der().unwrap()]);

        let mut devices = MockDeviceRepository::new();
        devices
            .expect_read()
            .returning(|name, _| Err(Error::not_found(name.to_string())));
        devices.expect_create().returning(|_| Ok(()));
        devices.expect_patch_status().returning(|_| Ok(()));

        let expired = issue_test_client_cert(&ca, "foo", -1);
        let app = router(state_with_devices(devices, chain));

        let body = serde_json::json!({
            "directive": "registration",
            "content": {"osImageId": "img-1"}
        });
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/api/v1/devices/foo/registration")
            .header("content-type", "application/json")
            .extension(PeerCertificates(Arc::new(vec![
                expired.cert_der().unwrap()
            ])))
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
