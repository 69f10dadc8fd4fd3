mod presence;
mod push;
mod registry;
mod relay;

use self::presence::{PresenceStore, PresenceTracker};
use self::push::{NotificationDispatcher, NullPushGateway, PushGateway, WebhookPushGateway};
use self::registry::{CONNECTION_QUEUE_DEPTH, ConnectionRegistry};
use self::relay::{GroupDirectory, MessageRelay, RelayError, RelayStore, deliver_frame};
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::util::generate_id;
use chrono::{Duration, Utc};
use futures_util::{SinkExt, StreamExt};
use pingora::apps::{HttpServerApp, HttpServerOptions};
use pingora::http::ResponseHeader;
use pingora::protocols::Stream;
use pingora::protocols::http::ServerSession;
use pingora::protocols::http::v2::server::H2Options;
use pingora::server::ShutdownWatch;
use sealgram_proto::{
    AckFrame, ClientFrame, ErrorFrame, FrameError, MAX_INBOUND_FRAME_LEN, ServerFrame,
    decode_client_frame,
};
use sealgram_storage::{OneTimePrekey, Storage, StorageError, connect};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Utf8Bytes, handshake::derive_accept_key};
use tracing::{debug, error, info, warn};

const LANDING_PAGE: &str = "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\" />\n<title>Sealgram</title>\n<style>body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',sans-serif;background:#10131a;color:#f4f6fb;margin:0;display:flex;align-items:center;justify-content:center;height:100vh;}main{max-width:480px;text-align:center;padding:2rem;background:rgba(22,27,38,0.9);border-radius:20px;}h1{font-size:2.25rem;margin-bottom:0.5rem;}p{margin:0.75rem 0;color:#aeb8d0;}a{color:#4cc2ff;text-decoration:none;}a:hover{text-decoration:underline;}</style>\n</head>\n<body>\n<main>\n<h1>Sealgram Relay</h1>\n<p>End-to-end encrypted message relay and key distribution.</p>\n<p><a href=\"/healthz\">Health</a> · <a href=\"/readyz\">Readiness</a></p>\n</main>\n</body>\n</html>\n";
const MAX_BODY_SIZE: usize = 1024 * 1024;
const MAX_PREKEYS_PER_UPLOAD: usize = 200;
const CLEANUP_INTERVAL_SECS: u64 = 60;

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Invalid,
    Io,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Invalid => write!(f, "invalid request"),
            Self::Io => write!(f, "io failure"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(_: StorageError) -> Self {
        Self::Storage
    }
}

#[derive(Debug)]
enum ApiError {
    Unauthorized(Option<String>),
    Forbidden,
    BadRequest(String),
    NotFound,
    Conflict(String),
    Internal,
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::Forbidden => 403,
            Self::BadRequest(_) => 400,
            Self::NotFound => 404,
            Self::Conflict(_) => 409,
            Self::Internal => 500,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::Internal => "InternalError",
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Missing => Self::NotFound,
            StorageError::Invalid => Self::Conflict("resource is not in a valid state".to_string()),
            _ => Self::Internal,
        }
    }
}

#[derive(Debug, Clone)]
struct SessionContext {
    user_id: i64,
    device_id: Option<i64>,
}

impl SessionContext {
    fn device_id(&self) -> Result<i64, ApiError> {
        self.device_id.ok_or_else(|| {
            ApiError::BadRequest("session is not bound to a device".to_string())
        })
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub metrics: Arc<Metrics>,
    pub registry: Arc<ConnectionRegistry>,
    pub relay: MessageRelay,
    pub presence: PresenceTracker,
    pub push: Arc<NotificationDispatcher>,
    pub started_at: Instant,
}

pub struct SealgramApp {
    state: Arc<AppState>,
    http_server_options: HttpServerOptions,
}

impl SealgramApp {
    pub fn new(state: Arc<AppState>) -> Self {
        let http_server_options = HttpServerOptions::default();
        Self {
            state,
            http_server_options,
        }
    }

    pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
        let storage = Arc::new(connect(&config.postgres_dsn, &config.redis_url).await?);
        storage.migrate().await?;
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let gateway: Arc<dyn PushGateway> = match config.push.endpoint.clone() {
            Some(endpoint) => {
                info!(endpoint = %endpoint, "push gateway enabled");
                Arc::new(
                    WebhookPushGateway::new(endpoint, config.push.auth_token.clone())
                        .map_err(|_| ServerError::Invalid)?,
                )
            }
            None => Arc::new(NullPushGateway),
        };
        let push = Arc::new(NotificationDispatcher::spawn(
            gateway,
            Arc::clone(&metrics),
        ));
        let relay = MessageRelay::new(
            Arc::clone(&storage) as Arc<dyn RelayStore>,
            Arc::clone(&storage) as Arc<dyn GroupDirectory>,
            Arc::clone(&registry),
            Arc::clone(&push),
            Arc::clone(&metrics),
            config.relay_ttl_seconds,
        );
        let presence = PresenceTracker::new(
            Arc::clone(&storage) as Arc<dyn PresenceStore>,
            config.presence_ttl_seconds,
        );
        let state = Arc::new(AppState {
            storage: Arc::clone(&storage),
            metrics,
            registry,
            relay,
            presence,
            push,
            started_at: Instant::now(),
            config,
        });
        let cleanup_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = interval(StdDuration::from_secs(CLEANUP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                match cleanup_state.storage.purge_expired_linking_sessions().await {
                    Ok(purged) if purged > 0 => {
                        info!(sessions = purged, "expired linking sessions purged")
                    }
                    Ok(_) => {}
                    Err(err) => warn!("linking session cleanup failed: {}", err),
                }
                match cleanup_state.storage.purge_expired_messages().await {
                    Ok(purged) if purged > 0 => {
                        info!(messages = purged, "expired messages purged")
                    }
                    Ok(_) => {}
                    Err(err) => warn!("message cleanup failed: {}", err),
                }
            }
        });
        Ok(state)
    }
}

impl HttpServerApp for SealgramApp {
    fn process_new_http<'life0, 'life1, 'async_trait>(
        self: &'life0 Arc<Self>,
        session: ServerSession,
        shutdown: &'life1 ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = Option<Stream>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move { self.handle_session(session, shutdown).await })
    }

    fn h2_options(&self) -> Option<H2Options> {
        None
    }

    fn server_options(&self) -> Option<&HttpServerOptions> {
        Some(&self.http_server_options)
    }
}

impl SealgramApp {
    async fn handle_session(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        match session.read_request().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                error!("failed to read request: {}", err);
                return None;
            }
        }
        let path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.to_string();
        match path.as_str() {
            "/" | "/index.html" => {
                self.state.metrics.mark_ingress();
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response
                    .append_header("content-type", "text/html; charset=utf-8")
                    .ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(Vec::from(LANDING_PAGE.as_bytes()).into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            "/healthz" => {
                self.state.metrics.mark_ingress();
                let health = json!({
                    "status": "healthy",
                    "domain": self.state.config.domain,
                    "uptime_seconds": self.state.started_at.elapsed().as_secs(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "connections": self.state.metrics.connections_active(),
                    "frames_ingress": self.state.metrics.frames_ingress(),
                    "frames_egress": self.state.metrics.frames_egress(),
                });
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response
                    .append_header("content-type", "application/json")
                    .ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(health.to_string().into_bytes().into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            "/readyz" => {
                let (status, body) = if self.state.storage.readiness().await.is_ok() {
                    (200, "ready")
                } else {
                    (503, "degraded")
                };
                let mut response = ResponseHeader::build_no_case(status, None).ok()?;
                response.append_header("content-type", "text/plain").ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(Vec::from(body.as_bytes()).into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            "/metrics" => {
                if !self.authorize_admin(&session) {
                    let _ = self
                        .respond_api_error(&mut session, ApiError::Unauthorized(None))
                        .await;
                    return None;
                }
                let payload = self.state.metrics.encode_prometheus();
                let mut response = ResponseHeader::build_no_case(200, None).ok()?;
                response
                    .append_header("content-type", "text/plain; version=0.0.4")
                    .ok()?;
                session
                    .write_response_header(Box::new(response))
                    .await
                    .ok()?;
                session
                    .write_response_body(payload.into_bytes().into(), true)
                    .await
                    .ok()?;
                session.finish().await.ok()?;
                return None;
            }
            _ => {}
        }
        if path == "/connect" && method == "GET" {
            return self.process_connect(session, shutdown).await;
        }
        let routed = self.route_api(&mut session, &path, &method).await;
        match routed {
            Some(Ok(())) => return None,
            Some(Err(err)) => {
                let _ = self.respond_api_error(&mut session, err).await;
                return None;
            }
            None => {}
        }
        let mut response = ResponseHeader::build_no_case(404, None).ok()?;
        response
            .append_header("content-type", "application/problem+json")
            .ok()?;
        let body = json!({
            "type": "about:blank",
            "title": "Not Found",
            "status": 404,
        })
        .to_string();
        session
            .write_response_header(Box::new(response))
            .await
            .ok()?;
        session
            .write_response_body(body.into_bytes().into(), true)
            .await
            .ok()?;
        session.finish().await.ok()?;
        None
    }

    /// Dispatches the HTTP API surface. Returns None when no route matches.
    async fn route_api(
        self: &Arc<Self>,
        session: &mut ServerSession,
        path: &str,
        method: &str,
    ) -> Option<Result<(), ApiError>> {
        if path == "/api/keys/upload" && method == "POST" {
            self.state.metrics.mark_ingress();
            return Some(self.handle_bundle_upload(session).await);
        }
        if path == "/api/keys/count" && method == "GET" {
            self.state.metrics.mark_ingress();
            return Some(self.handle_prekey_count(session).await);
        }
        if let Some(rest) = path.strip_prefix("/api/keys/") {
            match method {
                "GET" => {
                    self.state.metrics.mark_ingress();
                    return Some(self.handle_bundle_fetch(session, rest).await);
                }
                "DELETE" => {
                    self.state.metrics.mark_ingress();
                    return Some(self.handle_device_revoke(session, rest).await);
                }
                _ => {}
            }
        }
        if path == "/api/devices" && method == "GET" {
            self.state.metrics.mark_ingress();
            return Some(self.handle_devices_list(session).await);
        }
        if path == "/api/devices/token" && method == "POST" {
            self.state.metrics.mark_ingress();
            return Some(self.handle_push_token(session).await);
        }
        if path == "/api/linking/request" && method == "POST" {
            self.state.metrics.mark_ingress();
            return Some(self.handle_link_request(session).await);
        }
        if let Some(rest) = path.strip_prefix("/api/linking/") {
            if let Some(code) = rest.strip_suffix("/approve") {
                if method == "POST" {
                    self.state.metrics.mark_ingress();
                    return Some(self.handle_link_approve(session, code).await);
                }
            } else if method == "GET" {
                self.state.metrics.mark_ingress();
                return Some(self.handle_link_poll(session, rest).await);
            }
        }
        if path == "/api/messages/pending" && method == "GET" {
            self.state.metrics.mark_ingress();
            return Some(self.handle_pending_messages(session).await);
        }
        if path == "/api/messages/starred" && method == "GET" {
            self.state.metrics.mark_ingress();
            return Some(self.handle_starred_list(session).await);
        }
        if let Some(rest) = path.strip_prefix("/api/messages/") {
            if let Some(raw_id) = rest.strip_suffix("/reaction") {
                self.state.metrics.mark_ingress();
                return Some(self.handle_reactions(session, raw_id, method).await);
            }
            if let Some(raw_id) = rest.strip_suffix("/star") {
                self.state.metrics.mark_ingress();
                return Some(self.handle_star(session, raw_id, method).await);
            }
        }
        if let Some(raw) = path.strip_prefix("/api/presence/") {
            if method == "GET" {
                self.state.metrics.mark_ingress();
                return Some(self.handle_presence_query(session, raw).await);
            }
        }
        None
    }

    fn authorize_admin(&self, session: &ServerSession) -> bool {
        let Some(expected) = self.state.config.admin_token.as_deref() else {
            return true;
        };
        let header = session
            .req_header()
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        match header {
            Some(value) => value.trim().strip_prefix("Bearer ") == Some(expected),
            None => false,
        }
    }

    async fn authenticate_session(
        &self,
        session: &ServerSession,
    ) -> Result<SessionContext, ApiError> {
        let header = session
            .req_header()
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                debug!("authentication failed: missing authorization header");
                ApiError::Unauthorized(Some("missing Authorization header".to_string()))
            })?;
        let token = header
            .trim()
            .strip_prefix("Bearer ")
            .unwrap_or(header.trim());
        self.resolve_token(token).await
    }

    async fn resolve_token(&self, token: &str) -> Result<SessionContext, ApiError> {
        if token.is_empty() {
            debug!("authentication failed: empty token");
            return Err(ApiError::Unauthorized(Some(
                "empty token provided".to_string(),
            )));
        }
        let record = self
            .state
            .storage
            .load_session(token)
            .await
            .map_err(|err| match err {
                StorageError::Missing => {
                    debug!("authentication failed: session not found");
                    ApiError::Unauthorized(Some("session not found or expired".to_string()))
                }
                _ => {
                    error!("authentication failed: storage error loading session");
                    ApiError::Internal
                }
            })?;
        let expiry = record.created_at + Duration::seconds(record.ttl_seconds);
        if expiry <= Utc::now() {
            debug!(user_id = record.user_id, "authentication failed: session expired");
            return Err(ApiError::Unauthorized(Some(
                "session expired, please reconnect".to_string(),
            )));
        }
        Ok(SessionContext {
            user_id: record.user_id,
            device_id: record.device_id,
        })
    }

    async fn respond_json(
        &self,
        session: &mut ServerSession,
        status: u16,
        payload: Value,
        content_type: &str,
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", content_type)
            .map_err(|_| ServerError::Invalid)?;
        response
            .append_header("cache-control", "no-store")
            .map_err(|_| ServerError::Invalid)?;
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(payload.to_string().into_bytes().into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        self.state.metrics.mark_egress();
        Ok(())
    }

    async fn respond_api_error(
        &self,
        session: &mut ServerSession,
        error: ApiError,
    ) -> Result<(), ServerError> {
        let status = error.status();
        let title = error.title();
        let detail = match &error {
            ApiError::Unauthorized(reason) => {
                Some(reason.as_deref().unwrap_or("authorization required"))
            }
            ApiError::Forbidden => Some("access denied"),
            ApiError::NotFound => Some("resource not found"),
            ApiError::Internal => Some("internal server error"),
            ApiError::BadRequest(reason) => Some(reason.as_str()),
            ApiError::Conflict(reason) => Some(reason.as_str()),
        };
        let mut body = json!({
            "type": "about:blank",
            "title": title,
            "status": status,
        });
        if let Some(message) = detail {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("detail".to_string(), json!(message));
            }
        }
        self.respond_json(session, status, body, "application/problem+json")
            .await
    }

    async fn read_body(session: &mut ServerSession) -> Result<Vec<u8>, ApiError> {
        let mut body = Vec::new();
        loop {
            match session.read_request_body().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > MAX_BODY_SIZE {
                        return Err(ApiError::BadRequest(format!(
                            "request body too large (max {} KiB)",
                            MAX_BODY_SIZE / 1024
                        )));
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(err) => {
                    error!("error reading request body: {}", err);
                    return Err(ApiError::Internal);
                }
            }
        }
        Ok(body)
    }

    async fn read_json_body(session: &mut ServerSession) -> Result<Value, ApiError> {
        let body = Self::read_body(session).await?;
        serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))
    }

    async fn handle_bundle_upload(
        self: &Arc<Self>,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let root = Self::read_json_body(session).await?;
        let device_id = match root.get("device_id").and_then(|v| v.as_i64()) {
            Some(id) if id > 0 => id,
            Some(_) => return Err(ApiError::BadRequest("device_id must be positive".to_string())),
            None => context.device_id()?,
        };
        if let Some(bound) = context.device_id {
            if bound != device_id {
                return Err(ApiError::Forbidden);
            }
        }
        let device_name = root.get("device_name").and_then(|v| v.as_str());
        let bundle = root
            .get("bundle")
            .filter(|v| v.is_object())
            .ok_or_else(|| ApiError::BadRequest("\"bundle\" must be a JSON object".to_string()))?;
        let prekeys = parse_prekeys(root.get("one_time_prekeys"))?;
        self.state
            .storage
            .upsert_bundle(context.user_id, device_id, device_name, bundle, &prekeys)
            .await?;
        let remaining = self
            .state
            .storage
            .count_one_time_prekeys(context.user_id, device_id)
            .await?;
        info!(
            user_id = context.user_id,
            device_id,
            uploaded = prekeys.len(),
            pool = remaining,
            "key bundle stored"
        );
        self.respond_json(
            session,
            200,
            json!({
                "device_id": device_id,
                "one_time_prekeys": remaining,
            }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn handle_bundle_fetch(
        self: &Arc<Self>,
        session: &mut ServerSession,
        raw_user: &str,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let user_id = parse_id(raw_user, "user id")?;
        let bundles = self.state.storage.fetch_bundles(user_id).await?;
        let devices = bundles
            .iter()
            .map(|bundle| {
                let mut entry = json!({
                    "device_id": bundle.device_id,
                    "bundle": bundle.bundle,
                });
                if let Some(prekey) = bundle.one_time_prekey.as_ref() {
                    if let Some(obj) = entry.as_object_mut() {
                        obj.insert(
                            "one_time_prekey".to_string(),
                            json!({
                                "key_id": prekey.key_id,
                                "public_key": prekey.public_key,
                            }),
                        );
                    }
                }
                entry
            })
            .collect::<Vec<_>>();
        debug!(
            requester = context.user_id,
            user_id,
            devices = devices.len(),
            "key bundles fetched"
        );
        self.respond_json(
            session,
            200,
            json!({
                "user_id": user_id,
                "devices": devices,
            }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn handle_prekey_count(
        self: &Arc<Self>,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let device_id = match query_param(session, "device_id") {
            Some(raw) => parse_id(&raw, "device id")?,
            None => context.device_id()?,
        };
        let count = self
            .state
            .storage
            .count_one_time_prekeys(context.user_id, device_id)
            .await?;
        self.respond_json(
            session,
            200,
            json!({
                "device_id": device_id,
                "count": count,
            }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn handle_devices_list(
        self: &Arc<Self>,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let devices = self.state.storage.list_devices(context.user_id).await?;
        let online = self.state.registry.online_devices(context.user_id).await;
        let payload = devices
            .iter()
            .map(|device| {
                json!({
                    "device_id": device.device_id,
                    "device_name": device.device_name,
                    "created_at": device.created_at.to_rfc3339(),
                    "has_bundle": device.bundle.is_some(),
                    "push_registered": device.push_token.is_some(),
                    "online": online.contains(&device.device_id),
                })
            })
            .collect::<Vec<_>>();
        self.respond_json(
            session,
            200,
            json!({ "devices": payload }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    /// `DELETE /api/keys/{user_id}/{device_id}`. Own devices only.
    async fn handle_device_revoke(
        self: &Arc<Self>,
        session: &mut ServerSession,
        rest: &str,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let mut segments = rest.split('/');
        let user_id = parse_id(segments.next().unwrap_or_default(), "user id")?;
        let device_id = parse_id(segments.next().unwrap_or_default(), "device id")?;
        if segments.next().is_some() {
            return Err(ApiError::NotFound);
        }
        if user_id != context.user_id {
            return Err(ApiError::Forbidden);
        }
        self.state
            .storage
            .revoke_device(context.user_id, device_id)
            .await?;
        // The revoked device loses its live connection immediately; the
        // prekey pool is removed by the storage cascade.
        let evicted = self.state.registry.evict(context.user_id, device_id).await;
        info!(
            user_id = context.user_id,
            device_id, evicted, "device revoked"
        );
        self.respond_json(
            session,
            200,
            json!({
                "device_id": device_id,
                "revoked": true,
            }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn handle_push_token(
        self: &Arc<Self>,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let root = Self::read_json_body(session).await?;
        let device_id = match root.get("device_id").and_then(|v| v.as_i64()) {
            Some(id) if id > 0 => id,
            Some(_) => return Err(ApiError::BadRequest("device_id must be positive".to_string())),
            None => context.device_id()?,
        };
        let push_token = match root.get("push_token") {
            Some(Value::Null) | None => None,
            Some(Value::String(token)) if !token.trim().is_empty() => Some(token.trim()),
            Some(_) => {
                return Err(ApiError::BadRequest(
                    "\"push_token\" must be a non-empty string or null".to_string(),
                ));
            }
        };
        self.state
            .storage
            .set_push_token(context.user_id, device_id, push_token)
            .await?;
        self.respond_json(
            session,
            200,
            json!({
                "device_id": device_id,
                "push_registered": push_token.is_some(),
            }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn handle_link_request(
        self: &Arc<Self>,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        let root = Self::read_json_body(session).await?;
        let ephemeral_public_key = root
            .get("ephemeral_public_key")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ApiError::BadRequest("\"ephemeral_public_key\" is required".to_string())
            })?;
        let ttl = root
            .get("ttl_seconds")
            .and_then(|v| v.as_i64())
            .unwrap_or(self.state.config.linking_ttl_seconds);
        let record = self
            .state
            .storage
            .create_linking_session(ephemeral_public_key, ttl)
            .await?;
        info!(code = %record.linking_code, "linking session opened");
        self.respond_json(
            session,
            201,
            json!({
                "linking_code": record.linking_code,
                "expires_at": record.expires_at.to_rfc3339(),
            }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn handle_link_poll(
        self: &Arc<Self>,
        session: &mut ServerSession,
        code: &str,
    ) -> Result<(), ApiError> {
        let record = self.state.storage.load_linking_session(code.trim()).await?;
        let mut payload = json!({
            "status": record.status,
            "expires_at": record.expires_at.to_rfc3339(),
        });
        if record.status == "approved" {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert(
                    "provisioning_payload".to_string(),
                    json!(record.provisioning_payload),
                );
                obj.insert("user_id".to_string(), json!(record.user_id));
            }
        }
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    async fn handle_link_approve(
        self: &Arc<Self>,
        session: &mut ServerSession,
        code: &str,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let code = code.trim();
        if code.is_empty() {
            return Err(ApiError::BadRequest("linking code is required".to_string()));
        }
        let root = Self::read_json_body(session).await?;
        let payload = root
            .get("provisioning_payload")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ApiError::BadRequest("\"provisioning_payload\" is required".to_string())
            })?;
        let record = self
            .state
            .storage
            .approve_linking_session(code, context.user_id, payload)
            .await
            .map_err(|err| match err {
                StorageError::Invalid => {
                    ApiError::Conflict("linking code already approved".to_string())
                }
                other => ApiError::from(other),
            })?;
        info!(
            user_id = context.user_id,
            code = %record.linking_code,
            "linking session approved"
        );
        self.respond_json(
            session,
            200,
            json!({
                "linking_code": record.linking_code,
                "status": record.status,
            }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn handle_pending_messages(
        self: &Arc<Self>,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let device_id = context.device_id()?;
        let records = self
            .state
            .storage
            .pending_messages_for_device(
                context.user_id,
                device_id,
                self.state.config.pending_fetch_limit,
            )
            .await?;
        // Claim each row before returning it, so a copy another path already
        // queued to a live connection is not served a second time here.
        let mut messages = Vec::with_capacity(records.len());
        for record in records.iter() {
            if self.state.storage.mark_delivered(record.message_id).await? {
                self.state.metrics.mark_relay_delivered();
                messages.push(ServerFrame::Deliver(deliver_frame(record)).to_value());
            }
        }
        debug!(
            user_id = context.user_id,
            device_id,
            count = messages.len(),
            "pending messages drained over http"
        );
        self.respond_json(
            session,
            200,
            json!({ "messages": messages }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn handle_reactions(
        self: &Arc<Self>,
        session: &mut ServerSession,
        raw_id: &str,
        method: &str,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let message_id = parse_id(raw_id, "message id")?;
        match method {
            "GET" => {
                let reactions = self.state.storage.list_reactions(message_id).await?;
                let payload = reactions
                    .iter()
                    .map(|reaction| {
                        json!({
                            "user_id": reaction.user_id,
                            "emoji": reaction.emoji,
                            "created_at": reaction.created_at.to_rfc3339(),
                        })
                    })
                    .collect::<Vec<_>>();
                self.respond_json(
                    session,
                    200,
                    json!({ "reactions": payload }),
                    "application/json",
                )
                .await
                .map_err(|_| ApiError::Internal)
            }
            "POST" | "DELETE" => {
                let root = Self::read_json_body(session).await?;
                let emoji = root
                    .get("emoji")
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty() && s.len() <= 32)
                    .ok_or_else(|| ApiError::BadRequest("\"emoji\" is required".to_string()))?;
                // Reacting to an unknown message must not silently succeed.
                self.state.storage.load_message(message_id).await?;
                if method == "POST" {
                    self.state
                        .storage
                        .add_reaction(message_id, context.user_id, emoji)
                        .await?;
                } else {
                    self.state
                        .storage
                        .remove_reaction(message_id, context.user_id, emoji)
                        .await?;
                }
                self.respond_json(
                    session,
                    200,
                    json!({ "message_id": message_id, "emoji": emoji }),
                    "application/json",
                )
                .await
                .map_err(|_| ApiError::Internal)
            }
            _ => Err(ApiError::BadRequest("unsupported method".to_string())),
        }
    }

    async fn handle_star(
        self: &Arc<Self>,
        session: &mut ServerSession,
        raw_id: &str,
        method: &str,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let message_id = parse_id(raw_id, "message id")?;
        self.state.storage.load_message(message_id).await?;
        match method {
            "POST" => {
                self.state
                    .storage
                    .star_message(message_id, context.user_id)
                    .await?;
            }
            "DELETE" => {
                self.state
                    .storage
                    .unstar_message(message_id, context.user_id)
                    .await?;
            }
            _ => return Err(ApiError::BadRequest("unsupported method".to_string())),
        }
        self.respond_json(
            session,
            200,
            json!({
                "message_id": message_id,
                "starred": method == "POST",
            }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn handle_starred_list(
        self: &Arc<Self>,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        let context = self.authenticate_session(session).await?;
        let message_ids = self.state.storage.list_starred(context.user_id).await?;
        self.respond_json(
            session,
            200,
            json!({ "message_ids": message_ids }),
            "application/json",
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn handle_presence_query(
        self: &Arc<Self>,
        session: &mut ServerSession,
        raw_user: &str,
    ) -> Result<(), ApiError> {
        self.authenticate_session(session).await?;
        let user_id = parse_id(raw_user, "user id")?;
        let snapshot = self
            .state
            .presence
            .snapshot(user_id)
            .await
            .map_err(|_| ApiError::Internal)?;
        let mut payload = json!({
            "user_id": user_id,
            "state": snapshot.state,
        });
        if let Some(last_seen) = snapshot.last_seen_at {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("last_seen_at".to_string(), json!(last_seen.to_rfc3339()));
            }
        }
        self.respond_json(session, 200, payload, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }
}

enum FrameOutcome {
    Continue,
    Close(CloseFrame),
}

impl SealgramApp {
    async fn process_connect(
        self: &Arc<Self>,
        session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        let token = bearer_or_query_token(&session);
        let context = match token {
            Some(token) => match self.resolve_token(&token).await {
                Ok(context) => context,
                Err(err) => {
                    let mut session = session;
                    let _ = self.respond_api_error(&mut session, err).await;
                    return None;
                }
            },
            None => {
                let mut session = session;
                let _ = self
                    .respond_api_error(
                        &mut session,
                        ApiError::Unauthorized(Some("missing token".to_string())),
                    )
                    .await;
                return None;
            }
        };
        let device_id = match context
            .device_id
            .or_else(|| query_param(&session, "device_id").and_then(|raw| raw.parse().ok()))
        {
            Some(id) if id > 0 => id,
            _ => {
                let mut session = session;
                let _ = self
                    .respond_api_error(
                        &mut session,
                        ApiError::BadRequest("device_id is required".to_string()),
                    )
                    .await;
                return None;
            }
        };
        let user_id = context.user_id;
        let remote_addr = session
            .client_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let trace_id = generate_id(&format!("connect:{}:{}", user_id, device_id));

        let mut websocket = match upgrade_websocket(session).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(remote_addr = %remote_addr, error = %err, "websocket upgrade failed");
                return None;
            }
        };
        info!(
            remote_addr = %remote_addr,
            user_id,
            device_id,
            trace = %trace_id,
            "connection established"
        );

        // Claim and flush the backlog before registering for live traffic.
        // Each row is claimed before it is written, so a message relayed
        // while the drain runs is either queued live after registration or
        // left pending for the next drain, never handed to the device twice.
        match self
            .state
            .relay
            .drain_backlog(user_id, device_id, self.state.config.pending_fetch_limit)
            .await
        {
            Ok(frames) => {
                let drained = frames.len();
                for frame in frames {
                    if websocket
                        .send(Message::Text(Utf8Bytes::from(
                            ServerFrame::Deliver(frame).encode(),
                        )))
                        .await
                        .is_err()
                    {
                        info!(user_id, device_id, "connection lost during backlog flush");
                        return None;
                    }
                    self.state.metrics.mark_egress();
                }
                if drained > 0 {
                    debug!(user_id, device_id, drained, "pending backlog flushed");
                }
            }
            Err(err) => warn!(user_id, device_id, "pending drain failed: {}", err),
        }

        let (tx_out, mut rx_out) = mpsc::channel::<ServerFrame>(CONNECTION_QUEUE_DEPTH);
        let connection_id = self.state.registry.register(user_id, device_id, tx_out).await;
        self.state.metrics.incr_connections();
        self.state.presence.mark_online(user_id).await;

        let mut shutdown = shutdown.clone();
        let keepalive_secs = self.state.config.connection_keepalive.max(5);
        let mut keepalive = interval(StdDuration::from_secs(keepalive_secs));
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = websocket
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Restart,
                                reason: Utf8Bytes::from_static("server shutting down"),
                            })))
                            .await;
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    if websocket.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    self.state.presence.refresh(user_id).await;
                }
                outbound = rx_out.recv() => {
                    match outbound {
                        Some(frame) => {
                            if websocket
                                .send(Message::Text(Utf8Bytes::from(frame.encode())))
                                .await
                                .is_err()
                            {
                                break;
                            }
                            self.state.metrics.mark_egress();
                        }
                        // The registry dropped this connection's sender:
                        // either the device reconnected elsewhere or it was
                        // revoked.
                        None => {
                            let _ = websocket
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Policy,
                                    reason: Utf8Bytes::from_static("connection superseded"),
                                })))
                                .await;
                            break;
                        }
                    }
                }
                inbound = websocket.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            self.state.metrics.mark_ingress();
                            match self.handle_client_text(user_id, device_id, text.as_str()).await {
                                FrameOutcome::Continue => {}
                                FrameOutcome::Close(frame) => {
                                    let _ = websocket.send(Message::Close(Some(frame))).await;
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let _ = websocket
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Unsupported,
                                    reason: Utf8Bytes::from_static("text frames only"),
                                })))
                                .await;
                            break;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if websocket.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(WsError::Capacity(_))) => {
                            let _ = websocket
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Size,
                                    reason: Utf8Bytes::from_static("frame too large"),
                                })))
                                .await;
                            break;
                        }
                        Some(Err(err)) => {
                            debug!(user_id, device_id, "websocket read failed: {}", err);
                            break;
                        }
                    }
                }
            }
        }

        self.state
            .registry
            .unregister(user_id, device_id, connection_id)
            .await;
        self.state.metrics.decr_connections();
        if !self.state.registry.is_user_online(user_id).await {
            self.state.presence.mark_offline(user_id).await;
        }
        info!(user_id, device_id, trace = %trace_id, "connection closed");
        None
    }

    async fn handle_client_text(
        self: &Arc<Self>,
        user_id: i64,
        device_id: i64,
        text: &str,
    ) -> FrameOutcome {
        if text.len() > MAX_INBOUND_FRAME_LEN {
            return FrameOutcome::Close(CloseFrame {
                code: CloseCode::Size,
                reason: Utf8Bytes::from_static("frame too large"),
            });
        }
        let frame = match decode_client_frame(text) {
            Ok(frame) => frame,
            Err(FrameError::FrameTooLarge | FrameError::CiphertextTooLarge) => {
                return FrameOutcome::Close(CloseFrame {
                    code: CloseCode::Size,
                    reason: Utf8Bytes::from_static("frame too large"),
                });
            }
            Err(err) => {
                debug!(user_id, device_id, "malformed frame: {}", err);
                return FrameOutcome::Close(CloseFrame {
                    code: CloseCode::Invalid,
                    reason: Utf8Bytes::from_static("malformed frame"),
                });
            }
        };
        match frame {
            ClientFrame::Message(message) => {
                match self.state.relay.relay_message(user_id, &message).await {
                    Ok(message_ids) => {
                        self.reply(
                            user_id,
                            device_id,
                            ServerFrame::Ack(AckFrame {
                                status: "sent_to_relay".to_string(),
                                message_ids,
                            }),
                        )
                        .await;
                    }
                    Err(err) => self.reply_relay_error(user_id, device_id, err).await,
                }
            }
            ClientFrame::Edit(edit) => {
                match self.state.relay.relay_edit(user_id, &edit).await {
                    Ok(record) => {
                        self.reply(
                            user_id,
                            device_id,
                            ServerFrame::Ack(AckFrame {
                                status: "edited".to_string(),
                                message_ids: vec![record.message_id],
                            }),
                        )
                        .await;
                    }
                    Err(err) => self.reply_relay_error(user_id, device_id, err).await,
                }
            }
            ClientFrame::Delete(delete) => {
                match self.state.relay.relay_delete(user_id, &delete).await {
                    Ok(_) => {
                        self.reply(
                            user_id,
                            device_id,
                            ServerFrame::Ack(AckFrame {
                                status: "deleted".to_string(),
                                message_ids: vec![delete.message_id],
                            }),
                        )
                        .await;
                    }
                    Err(err) => self.reply_relay_error(user_id, device_id, err).await,
                }
            }
            ClientFrame::Status(status) => {
                if let Err(err) = self.state.relay.relay_status(user_id, &status).await {
                    self.reply_relay_error(user_id, device_id, err).await;
                }
            }
            ClientFrame::Typing(typing) => {
                if let Err(err) = self.state.relay.relay_typing(user_id, &typing).await {
                    debug!(user_id, "typing relay skipped: {}", err);
                }
            }
            ClientFrame::Presence => {
                self.state.presence.refresh(user_id).await;
            }
        }
        FrameOutcome::Continue
    }

    async fn reply(&self, user_id: i64, device_id: i64, frame: ServerFrame) {
        if !self
            .state
            .registry
            .send_to_device(user_id, device_id, frame)
            .await
        {
            debug!(user_id, device_id, "reply dropped, connection gone");
        }
    }

    async fn reply_relay_error(&self, user_id: i64, device_id: i64, error: RelayError) {
        let frame = match error {
            RelayError::Invalid(reason) => ServerFrame::Error(ErrorFrame {
                code: "invalid".to_string(),
                detail: reason.to_string(),
            }),
            RelayError::Storage => ServerFrame::Error(ErrorFrame {
                code: "internal".to_string(),
                detail: "relay storage failure".to_string(),
            }),
        };
        self.reply(user_id, device_id, frame).await;
    }
}

async fn upgrade_websocket(
    session: ServerSession,
) -> Result<WebSocketStream<pingora::protocols::Stream>, ServerError> {
    match session {
        ServerSession::H1(mut h1) => {
            let req = h1.req_header();
            let upgrade_ok = req
                .headers
                .get("Upgrade")
                .map(|value| value.as_bytes())
                .map(|bytes| std::str::from_utf8(bytes).unwrap_or(""))
                .map(|value| value.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false);
            let version_ok = req
                .headers
                .get("Sec-WebSocket-Version")
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim() == "13")
                .unwrap_or(false);
            if !upgrade_ok || !version_ok {
                let mut session = ServerSession::H1(h1);
                let _ = session.respond_error(400).await;
                return Err(ServerError::Invalid);
            }
            let key = match req
                .headers
                .get("Sec-WebSocket-Key")
                .and_then(|value| std::str::from_utf8(value.as_bytes()).ok())
            {
                Some(value) => value.trim().to_string(),
                None => {
                    let mut session = ServerSession::H1(h1);
                    let _ = session.respond_error(400).await;
                    return Err(ServerError::Invalid);
                }
            };
            let accept_key = derive_accept_key(key.as_bytes());
            let mut response =
                ResponseHeader::build_no_case(101, None).map_err(|_| ServerError::Invalid)?;
            response
                .append_header("upgrade", "websocket")
                .map_err(|_| ServerError::Invalid)?;
            response
                .append_header("connection", "Upgrade")
                .map_err(|_| ServerError::Invalid)?;
            response
                .append_header("sec-websocket-accept", &accept_key)
                .map_err(|_| ServerError::Invalid)?;
            h1.write_response_header(Box::new(response))
                .await
                .map_err(|_| ServerError::Io)?;
            let stream = h1.into_inner();
            // Cap the assembled message size at the protocol ceiling so an
            // oversized frame is refused while buffering, not after.
            let ws_config = WebSocketConfig::default()
                .max_message_size(Some(MAX_INBOUND_FRAME_LEN))
                .max_frame_size(Some(MAX_INBOUND_FRAME_LEN));
            Ok(WebSocketStream::from_raw_socket(stream, Role::Server, Some(ws_config)).await)
        }
        other => {
            let mut session = other;
            let _ = session.respond_error(400).await;
            Err(ServerError::Invalid)
        }
    }
}

fn bearer_or_query_token(session: &ServerSession) -> Option<String> {
    let header = session
        .req_header()
        .headers
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    if let Some(value) = header {
        let token = value.trim().strip_prefix("Bearer ").unwrap_or(value.trim());
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    query_param(session, "token")
}

fn query_param(session: &ServerSession, name: &str) -> Option<String> {
    session
        .req_header()
        .uri
        .path_and_query()
        .and_then(|pq| pq.query())
        .and_then(|query| {
            query.split('&').find_map(|pair| {
                let mut parts = pair.splitn(2, '=');
                let key = parts.next()?;
                let value = parts.next().unwrap_or("");
                if key == name && !value.is_empty() {
                    Some(value.to_string())
                } else {
                    None
                }
            })
        })
}

fn parse_id(raw: &str, label: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid {}", label)))
}

fn parse_prekeys(value: Option<&Value>) -> Result<Vec<OneTimePrekey>, ApiError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let entries = value
        .as_array()
        .ok_or_else(|| ApiError::BadRequest("\"one_time_prekeys\" must be an array".to_string()))?;
    if entries.len() > MAX_PREKEYS_PER_UPLOAD {
        return Err(ApiError::BadRequest(format!(
            "at most {} one-time prekeys per upload",
            MAX_PREKEYS_PER_UPLOAD
        )));
    }
    let mut prekeys = Vec::with_capacity(entries.len());
    for entry in entries {
        let key_id = entry
            .get("key_id")
            .and_then(|v| v.as_i64())
            .filter(|id| *id > 0)
            .ok_or_else(|| {
                ApiError::BadRequest("one-time prekey requires a positive key_id".to_string())
            })?;
        let public_key = entry
            .get("public_key")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ApiError::BadRequest("one-time prekey requires a public_key".to_string())
            })?;
        prekeys.push(OneTimePrekey {
            key_id,
            public_key: public_key.to_string(),
        });
    }
    Ok(prekeys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prekey_parsing_validates_entries() {
        assert!(parse_prekeys(None).unwrap().is_empty());
        let parsed = parse_prekeys(Some(&json!([
            {"key_id": 1, "public_key": "pk1"},
            {"key_id": 2, "public_key": "pk2"},
        ])))
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].key_id, 1);

        assert!(parse_prekeys(Some(&json!([{"key_id": 0, "public_key": "pk"}]))).is_err());
        assert!(parse_prekeys(Some(&json!([{"key_id": 3}]))).is_err());
        assert!(parse_prekeys(Some(&json!("nope"))).is_err());
    }

    #[test]
    fn id_parsing_rejects_garbage() {
        assert_eq!(parse_id("42", "user id").unwrap(), 42);
        assert!(parse_id("0", "user id").is_err());
        assert!(parse_id("-3", "user id").is_err());
        assert!(parse_id("abc", "user id").is_err());
    }

    #[test]
    fn api_error_statuses() {
        assert_eq!(ApiError::Unauthorized(None).status(), 401);
        assert_eq!(ApiError::Forbidden.status(), 403);
        assert_eq!(ApiError::BadRequest(String::new()).status(), 400);
        assert_eq!(ApiError::NotFound.status(), 404);
        assert_eq!(ApiError::Conflict(String::new()).status(), 409);
        assert_eq!(ApiError::Internal.status(), 500);
        assert_eq!(ApiError::from(StorageError::Missing).status(), 404);
        assert_eq!(ApiError::from(StorageError::Invalid).status(), 409);
        assert_eq!(ApiError::from(StorageError::Postgres).status(), 500);
    }
}
