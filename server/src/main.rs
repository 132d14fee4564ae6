//! token-bureau: exchanges GitHub Actions identity tokens for GitHub App
//! installation tokens scoped to the calling repository.
//!
//! Lightweight HTTP/1 server using hyper on a multi-threaded tokio runtime.
//! Every connection is served by its own task.

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use token_bureau_core::config::Config;
use token_bureau_core::error::{ApiError, ErrorResponse};
use token_bureau_core::github::auth::PemJwtSigner;
use token_bureau_core::oidc::KeyCache;
use token_bureau_core::permissions::{ConfiguredScoper, PermissionScoper};
use token_bureau_core::platform::{Clock, HttpClient, JwtSigner};
use token_bureau_core::sts::exchange::{self, Exchange, ExchangeRequest, Stage};

mod platform;

use platform::{ProcessEnv, ReqwestHttpClient, SystemClock};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 100 * 1024;

const DEFAULT_PORT: u16 = 8080;

/// Shared application state
struct AppState {
    config: Config,
    keys: KeyCache,
    http: Arc<dyn HttpClient>,
    clock: Box<dyn Clock>,
    signer: Box<dyn JwtSigner>,
    scoper: Box<dyn PermissionScoper>,
}

impl AppState {
    fn new(
        config: Config,
        http: Arc<dyn HttpClient>,
        clock: Box<dyn Clock>,
    ) -> Result<Self, ApiError> {
        let signer = PemJwtSigner::new(&config.github_app_id, &config.github_app_private_key)?;
        Ok(Self {
            keys: KeyCache::new(config.jwks_uri.clone(), http.clone()),
            scoper: Box::new(ConfiguredScoper::new(config.permissions.clone())),
            signer: Box::new(signer),
            http,
            clock,
            config,
        })
    }

    fn exchange(&self) -> Exchange<'_> {
        Exchange {
            config: &self.config,
            keys: &self.keys,
            http: self.http.as_ref(),
            clock: self.clock.as_ref(),
            signer: self.signer.as_ref(),
            scoper: self.scoper.as_ref(),
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(e) = run().await {
        tracing::error!("token-bureau failed: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let port: u16 = match std::env::var("PORT") {
        Ok(port) => port.parse().map_err(|_| format!("PORT must be a number, got '{}'", port))?,
        Err(_) => DEFAULT_PORT,
    };

    let config = Config::from_env(&ProcessEnv)?;
    tracing::info!(
        app_id = %config.github_app_id,
        audience = %config.oidc_audience,
        default_permissions = %config.permissions.default,
        maximum_permissions = %config.permissions.maximum,
        "configuration loaded"
    );

    let state = Arc::new(AppState::new(
        config,
        Arc::new(ReqwestHttpClient::new()),
        Box::new(SystemClock),
    )?);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "token-bureau listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut connections = tokio::task::JoinSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let state = state.clone();
                let mut shutdown = shutdown_rx.clone();
                connections.spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { handle_request(req, &state).await }
                    });
                    let conn = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);

                    let result = tokio::select! {
                        result = conn.as_mut() => result,
                        _ = shutdown.changed() => {
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                    };
                    if let Err(e) = result {
                        tracing::debug!(%peer, error = %e, "connection error");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut ctrl_c => {
                tracing::info!("shutdown signal received, draining connections");
                break;
            }
        }
    }

    drop(listener);
    let _ = shutdown_tx.send(true);
    while connections.join_next().await.is_some() {}

    tracing::info!("token-bureau stopped");
    Ok(())
}

type HyperResponse = Response<Full<Bytes>>;

async fn handle_request(
    req: Request<Incoming>,
    state: &AppState,
) -> Result<HyperResponse, std::convert::Infallible> {
    let started = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let span = tracing::info_span!("request", request_id = %request_id);

    async move {
        let authorization = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| ApiError::invalid_request(format!("failed to read request body: {}", e)));

        let mut response = dispatch(&method, &path, authorization.as_deref(), body, state).await;

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("X-Request-Id", value);
        }

        if !is_health_check(&path) {
            log_request(&method, &path, response.status(), started);
        }
        Ok(response)
    }
    .instrument(span)
    .await
}

fn is_health_check(path: &str) -> bool {
    path == "/health" || path == "/"
}

fn log_request(method: &Method, path: &str, status: StatusCode, started: Instant) {
    let duration_ms = started.elapsed().as_millis() as u64;
    let status = status.as_u16();
    match status {
        500.. => tracing::error!(%method, path, status, duration_ms, "request completed"),
        400..=499 => tracing::warn!(%method, path, status, duration_ms, "request completed"),
        _ => tracing::info!(%method, path, status, duration_ms, "request completed"),
    }
}

/// Route a fully-read request
async fn dispatch(
    method: &Method,
    path: &str,
    authorization: Option<&str>,
    body: Result<Bytes, ApiError>,
    state: &AppState,
) -> HyperResponse {
    match (method, path) {
        (&Method::GET, "/health") | (&Method::GET, "/") => handle_health(),
        (&Method::POST, "/generate-token") => {
            handle_generate_token(authorization, body, state).await
        }
        _ => json_response(
            StatusCode::NOT_FOUND,
            &ErrorResponse {
                error: "Not found".to_string(),
                details: format!("no route for {} {}", method, path),
            },
        ),
    }
}

fn handle_health() -> HyperResponse {
    json_response(StatusCode::OK, &serde_json::json!({"status": "ok"}))
}

async fn handle_generate_token(
    authorization: Option<&str>,
    body: Result<Bytes, ApiError>,
    state: &AppState,
) -> HyperResponse {
    // The header is reported before any body problem
    let request = match body {
        Ok(body) => ExchangeRequest::from_parts(authorization, &body),
        Err(e) => exchange::extract_bearer_token(authorization).and(Err(e)),
    };

    let request = match request {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(
                stage = %Stage::ReceivedRequest,
                error_kind = e.error_key(),
                "token exchange failed: {}",
                e
            );
            return error_response(&e);
        }
    };

    match exchange::handle(request, &state.exchange()).await {
        Ok(credential) => json_response(StatusCode::OK, &credential),
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &ApiError) -> HyperResponse {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &ErrorResponse::from(err))
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> HyperResponse {
    let json = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use token_bureau_core::config::{GITHUB_ACTIONS_ISSUER, GITHUB_ACTIONS_JWKS_URI};
    use token_bureau_core::permissions::PermissionsConfig;
    use token_bureau_core::platform::HttpResponse;
    use token_bureau_core::test_support::{
        json_response as mock_json, other_key, test_key, workflow_claims, MockClock, MockHttp,
        TEST_AUDIENCE, TEST_NOW,
    };

    fn routes() -> Vec<(String, HttpResponse)> {
        vec![
            (
                "/.well-known/jwks".to_string(),
                HttpResponse {
                    status: 200,
                    body: test_key().jwks_json().into_bytes(),
                },
            ),
            (
                "/app/installations?".to_string(),
                mock_json(200, serde_json::json!([{"id": 42, "account": {"login": "Acme"}}])),
            ),
            (
                "/app/installations/42/access_tokens".to_string(),
                mock_json(
                    201,
                    serde_json::json!({
                        "token": "ghs_minted",
                        "expires_at": "2024-02-02T19:53:20Z"
                    }),
                ),
            ),
            (
                "/repos/acme/widgets".to_string(),
                mock_json(200, serde_json::json!({"id": 1296269, "full_name": "acme/widgets"})),
            ),
        ]
    }

    fn state(http: Arc<MockHttp>) -> AppState {
        let config = Config {
            github_app_id: "12345".to_string(),
            github_app_private_key: test_key().private_pem().to_string(),
            oidc_audience: TEST_AUDIENCE.to_string(),
            oidc_issuer: GITHUB_ACTIONS_ISSUER.to_string(),
            jwks_uri: GITHUB_ACTIONS_JWKS_URI.to_string(),
            permissions: PermissionsConfig::from_yaml(
                &serde_json::json!({
                    "default": {"contents": "read"},
                    "maximum": {"issues": "write", "contents": "read"}
                })
                .to_string(),
            )
            .unwrap(),
        };
        AppState::new(config, http, Box::new(MockClock(TEST_NOW))).unwrap()
    }

    async fn body_json(response: HyperResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn generate(
        http: &Arc<MockHttp>,
        authorization: Option<&str>,
        body: &'static str,
    ) -> (StatusCode, serde_json::Value) {
        let state = state(http.clone());
        let response = dispatch(
            &Method::POST,
            "/generate-token",
            authorization,
            Ok(Bytes::from_static(body.as_bytes())),
            &state,
        )
        .await;
        (response.status(), body_json(response).await)
    }

    #[tokio::test]
    async fn test_health() {
        let http = Arc::new(MockHttp::new(vec![]));
        let state = state(http);

        for path in ["/health", "/"] {
            let response = dispatch(&Method::GET, path, None, Ok(Bytes::new()), &state).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
            assert_eq!(body_json(response).await, serde_json::json!({"status": "ok"}));
        }
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let http = Arc::new(MockHttp::new(vec![]));
        let state = state(http);

        let response =
            dispatch(&Method::GET, "/generate-token", None, Ok(Bytes::new()), &state).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "Not found");
    }

    #[tokio::test]
    async fn test_generate_token() {
        let http = Arc::new(MockHttp::new(routes()));
        let header = format!("Bearer {}", test_key().sign(&workflow_claims()));

        let request = r#"{"permissions": {"issues": "write"}}"#;
        let (status, body) = generate(&http, Some(header.as_str()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!({
                "token": "ghs_minted",
                "expires_at": "2024-02-02T19:53:20Z",
                "installation_id": 42
            })
        );
    }

    #[tokio::test]
    async fn test_missing_header_is_rejected_before_any_call() {
        let http = Arc::new(MockHttp::new(routes()));

        let (status, body) = generate(&http, None, "").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Failed to process request");
        assert!(body["details"].as_str().unwrap().contains("authorization header"));
        assert_eq!(http.call_count(""), 0);
    }

    #[tokio::test]
    async fn test_header_checked_before_unreadable_body() {
        let http = Arc::new(MockHttp::new(routes()));
        let state = state(http.clone());
        let body_error = || {
            Err(ApiError::invalid_request("failed to read request body: length limit exceeded"))
        };

        let response =
            dispatch(&Method::POST, "/generate-token", Some("Basic abc"), body_error(), &state)
                .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["details"]
            .as_str()
            .unwrap()
            .starts_with("invalid authorization header"));

        let response =
            dispatch(&Method::POST, "/generate-token", Some("Bearer a.b.c"), body_error(), &state)
                .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["details"]
            .as_str()
            .unwrap()
            .contains("length limit exceeded"));
    }

    #[tokio::test]
    async fn test_non_object_permissions() {
        let http = Arc::new(MockHttp::new(routes()));
        let header = format!("Bearer {}", test_key().sign(&workflow_claims()));

        let request = r#"{"permissions": ["issues"]}"#;
        let (status, body) = generate(&http, Some(header.as_str()), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Failed to process request");
        assert_eq!(http.call_count(""), 0);
    }

    #[tokio::test]
    async fn test_untrusted_signature_is_forbidden() {
        let http = Arc::new(MockHttp::new(routes()));
        let header = format!(
            "Bearer {}",
            other_key().sign_with_kid(&workflow_claims(), test_key().kid())
        );

        let (status, body) = generate(&http, Some(header.as_str()), "").await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Token verification failed");
        assert_eq!(http.call_count("api.github.com"), 0);
    }

    #[tokio::test]
    async fn test_unknown_owner_is_server_error() {
        let mut routes = routes();
        routes[1] = (
            "/app/installations?".to_string(),
            mock_json(200, serde_json::json!([])),
        );
        let http = Arc::new(MockHttp::new(routes));
        let header = format!("Bearer {}", test_key().sign(&workflow_claims()));

        let (status, body) = generate(&http, Some(header.as_str()), "").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to generate token");
        assert_eq!(body["details"], "no installation found for owner 'acme'");
    }
}
