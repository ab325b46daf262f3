//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. One task per connection;
//! streaming responses keep their connection task alive until the stream ends
//! or the client goes away.

use chrono::Duration as ChronoDuration;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::Args;
use crate::connections::{
    spawn_connection_sweep_task, ConnectionConfig, ConnectionLifecycleManager, CredentialVault,
    HttpOAuthProvider, InMemoryConnectionStore, LoopbackProvider, OAuthClientConfig,
    OAuthProvider, ProviderRegistry, ServiceName,
};
use crate::identity::{spawn_identity_sweep_task, IdentityService, SessionTokens};
use crate::jobs::{
    ContentEngine, GenerationJobOrchestrator, HttpContentEngine, InMemoryJobStore,
    OrchestratorConfig, OutlineEngine,
};
use crate::routes::{self, response};
use crate::sources::{DriveSource, GmailSource, SourceRegistry};
use crate::stream::StreamHub;
use crate::types::CasebookError;

const LOGIN_SCOPES: &[&str] = &["openid", "email", "profile"];

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub identity: Arc<IdentityService>,
    pub connections: Arc<ConnectionLifecycleManager>,
    pub jobs: Arc<GenerationJobOrchestrator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        args: Args,
        identity: Arc<IdentityService>,
        connections: Arc<ConnectionLifecycleManager>,
        jobs: Arc<GenerationJobOrchestrator>,
    ) -> Self {
        Self {
            args,
            identity,
            connections,
            jobs,
            started_at: Instant::now(),
        }
    }

    /// Wire every component from configuration
    pub fn from_args(args: Args) -> Result<Self, CasebookError> {
        let engine: Arc<dyn ContentEngine> = match &args.engine_url {
            Some(url) => Arc::new(
                HttpContentEngine::new(url, Duration::from_millis(args.engine_connect_timeout_ms))
                    .map_err(|e| CasebookError::Config(e.to_string()))?,
            ),
            None => {
                warn!("ENGINE_URL not set, sections are composed by the outline engine");
                Arc::new(OutlineEngine::new())
            }
        };
        Self::with_engine(args, engine)
    }

    /// Wire every component, generating with `engine`
    pub fn with_engine(args: Args, engine: Arc<dyn ContentEngine>) -> Result<Self, CasebookError> {
        let vault = match args.credential_key_bytes().map_err(CasebookError::Config)? {
            Some(key) => CredentialVault::new(key),
            None => {
                warn!("CREDENTIAL_KEY not set, sealing credentials with an ephemeral key");
                CredentialVault::ephemeral()
            }
        };

        let (login_provider, providers) = build_providers(&args)?;

        let sessions = match &args.jwt_secret {
            Some(secret) => {
                SessionTokens::new(secret.clone(), args.session_ttl_secs, !args.dev_mode)?
            }
            None => SessionTokens::new_dev(args.session_ttl_secs),
        };
        let identity = Arc::new(IdentityService::new(
            sessions,
            login_provider,
            ChronoDuration::seconds(args.pending_grant_ttl_secs),
        ));

        let connections = Arc::new(ConnectionLifecycleManager::new(
            ConnectionConfig {
                refresh_buffer: ChronoDuration::seconds(args.token_refresh_buffer_secs),
                pending_grant_ttl: ChronoDuration::seconds(args.pending_grant_ttl_secs),
                expired_retention: ChronoDuration::days(args.expired_retention_days),
            },
            Arc::new(InMemoryConnectionStore::new()),
            providers,
            Arc::new(vault),
        ));

        let hub = Arc::new(StreamHub::new(args.stream_buffer, args.channel_retention()));
        let jobs = Arc::new(
            GenerationJobOrchestrator::new(
                OrchestratorConfig {
                    default_model: args.default_model.clone(),
                    ..Default::default()
                },
                Arc::new(InMemoryJobStore::new()),
                Arc::clone(&connections),
                engine,
                hub,
            )
            .with_sources(build_sources(&args)?),
        );

        Ok(Self::new(args, identity, connections, jobs))
    }
}

/// Login provider plus one provider per connectable service
fn build_providers(
    args: &Args,
) -> Result<(Arc<dyn OAuthProvider>, ProviderRegistry), CasebookError> {
    let http_provider = |redirect_uri: String, scopes: &[&str]| -> Result<Arc<dyn OAuthProvider>, CasebookError> {
        let config = OAuthClientConfig::from_args(&args.oauth, redirect_uri, scopes)
            .ok_or_else(|| CasebookError::Config("OAuth client is not configured".into()))?;
        let provider =
            HttpOAuthProvider::new(config).map_err(|e| CasebookError::Config(e.to_string()))?;
        Ok(Arc::new(provider))
    };

    let mut registry = ProviderRegistry::new();
    if args.oauth.is_configured() {
        let login = http_provider(args.login_redirect_uri(), LOGIN_SCOPES)?;
        for service in ServiceName::ALL {
            let redirect_uri = args.connection_redirect_uri(service.as_str());
            registry = registry.with(service, http_provider(redirect_uri, service.scopes())?);
        }
        return Ok((login, registry));
    }

    warn!("OAuth client not configured, consent is answered by the loopback provider");
    let login: Arc<dyn OAuthProvider> = Arc::new(LoopbackProvider::new(args.login_redirect_uri()));
    for service in ServiceName::ALL {
        let redirect_uri = args.connection_redirect_uri(service.as_str());
        registry = registry.with(service, Arc::new(LoopbackProvider::new(redirect_uri)));
    }
    Ok((login, registry))
}

/// Google API sources when OAuth is configured, loopback sources otherwise
fn build_sources(args: &Args) -> Result<SourceRegistry, CasebookError> {
    if !args.oauth.is_configured() {
        return Ok(SourceRegistry::loopback());
    }
    let timeout = Duration::from_millis(args.source_timeout_ms);
    let gmail = GmailSource::new(&args.gmail_api_url, timeout)
        .map_err(|e| CasebookError::Config(e.to_string()))?;
    let drive = DriveSource::new(&args.drive_api_url, timeout)
        .map_err(|e| CasebookError::Config(e.to_string()))?;
    Ok(SourceRegistry::new()
        .with(Arc::new(gmail))
        .with(Arc::new(drive)))
}

/// Run the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<(), CasebookError> {
    let listener = TcpListener::bind(state.args.listen).await?;
    info!("Casebook listening on {}", state.args.listen);

    if state.args.dev_mode {
        warn!("Development mode enabled - insecure cookies and dev secrets allowed");
    }

    spawn_connection_sweep_task(Arc::clone(&state.connections), state.args.sweep_interval());
    spawn_identity_sweep_task(Arc::clone(&state.identity), state.args.sweep_interval());

    serve(listener, state).await
}

/// Accept connections on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<(), CasebookError> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        debug!("Connection from {} ended with error: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<response::BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, peer = %addr, "Request");

    let response = if method == Method::OPTIONS {
        preflight_response()
    } else {
        match (&method, path.as_str()) {
            (&Method::GET, "/health") => routes::health_check(&state),
            (&Method::GET, "/version") => routes::version_info(),

            (_, p) if p.starts_with("/auth/") => {
                routes::handle_auth_request(req, Arc::clone(&state))
                    .await
                    .unwrap_or_else(|| response::not_found_response(&path))
            }

            (_, p) if p.starts_with("/data/") => {
                routes::handle_data_request(req, Arc::clone(&state))
                    .await
                    .unwrap_or_else(|| response::not_found_response(&path))
            }

            (_, p) if p.starts_with("/case-study") => {
                routes::handle_case_study_request(req, Arc::clone(&state))
                    .await
                    .unwrap_or_else(|| response::not_found_response(&path))
            }

            _ => response::not_found_response(&path),
        }
    };

    Ok(with_cors(response, &state.args.frontend_url))
}

fn preflight_response() -> Response<response::BoxBody> {
    let mut response = response::no_content();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

/// Credentialed CORS for the configured frontend origin
fn with_cors(mut response: Response<response::BoxBody>, frontend_url: &str) -> Response<response::BoxBody> {
    response::set_header(
        &mut response,
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        frontend_url.trim_end_matches('/'),
    );
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    response
}
