//! Web server entrypoints live here.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{MatchedPath, Path, Query},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize, de::Deserializer};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{
    add_extension::AddExtensionLayer,
    classify::ServerErrorsFailureClass,
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::catalog::{
    Archive, ArchiveApi, ArchiveFile, ArchiveStatus, ArchiveType, CatalogError, CatalogErrorKind,
    ListParams, PAGE_SIZE_DEFAULT, PAGE_SIZE_MAX, Page, SetQuerySubmission, SortDirection,
    SortField,
};
use crate::config::{CorsConfig, ServerConfig};

const HEALTHZ_PATH: &str = "/v1/healthz";
const ALL_ARCHIVES_PATH: &str = "/v1/archives/all";
const ALL_ARCHIVE_PATH: &str = "/v1/archives/all/{id}";
const SET_ARCHIVES_PATH: &str = "/v1/archives/set-query";
const SET_ARCHIVE_PATH: &str = "/v1/archives/set-query/{id}";
const LATEST_FILE_PATH: &str = "/v1/files";
const FILE_PATH: &str = "/v1/files/{id}";
const EVENTS_PATH: &str = "/v1/events";
const HEALTHZ_OK: &str = "ok";
const HEALTHZ_DEGRADED: &str = "degraded";
const MAX_SORT_COUNT: usize = 2;
const ERROR_INVALID_PARAMETER: &str = "invalid_parameter";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_CONFLICT: &str = "conflict";
const ERROR_UNAVAILABLE: &str = "unavailable";
const ERROR_METHOD_NOT_ALLOWED: &str = "method_not_allowed";
const ERROR_INTERNAL: &str = "internal_server_error";
const REQUEST_ID_HEADER: &str = "x-request-id";
const UNAVAILABLE_HEADER: &str = "x-archive-unavailable";
const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    status: Option<String>,
    id: Option<String>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    size: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    sort: Vec<String>,
}

pub type DynArchiveApi = Arc<dyn ArchiveApi>;
type ApiStateHandle = Arc<ApiState>;

#[derive(Clone)]
struct ApiState {
    api: DynArchiveApi,
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    status: u16,
    message: String,
    #[serde(rename = "errorInfo", skip_serializing_if = "Option::is_none")]
    error_info: Option<Value>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    error: &'static str,
    field: Option<String>,
    unavailable_reason: Option<String>,
    body: ApiErrorBody,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CORS configuration: {reason}")]
    CorsConfig { reason: String },
}

impl ListQuery {
    fn into_params(self, archive_type: ArchiveType) -> Result<ListParams, ApiError> {
        let status = match sanitize_optional(self.status) {
            Some(raw) => Some(parse_status(&raw)?),
            None => None,
        };
        let id = match sanitize_optional(self.id) {
            Some(raw) => Some(parse_id("id", &raw)?),
            None => None,
        };
        let size = self.size.unwrap_or(PAGE_SIZE_DEFAULT);
        ensure_range("size", size, 1, PAGE_SIZE_MAX)?;

        let sort = expand_csv(self.sort);
        if sort.len() > MAX_SORT_COUNT {
            return Err(ApiError::invalid_param(
                "sort",
                "expected `sort=<field>[,asc|desc]`",
            ));
        }
        let sort_field = match sort.first() {
            Some(raw) => SortField::parse(raw).ok_or_else(|| {
                ApiError::invalid_param("sort", format!("unknown sort field `{raw}`"))
            })?,
            None => SortField::default(),
        };
        let sort_dir = match sort.get(1) {
            Some(raw) => SortDirection::parse(raw).ok_or_else(|| {
                ApiError::invalid_param("sort", format!("unknown sort direction `{raw}`"))
            })?,
            None => SortDirection::default(),
        };

        Ok(ListParams {
            archive_type,
            status,
            id,
            offset: self.offset.unwrap_or(0),
            size,
            sort_field,
            sort_dir,
        })
    }
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            error,
            field: None,
            unavailable_reason: None,
            body: ApiErrorBody {
                status: status.as_u16(),
                message: message.into(),
                error_info: None,
                request_id: None,
            },
        }
    }

    fn with_field(mut self, field: &str) -> Self {
        debug_assert!(!field.is_empty());
        self.field = Some(field.to_string());
        self
    }

    fn with_request_id(mut self, request_id: Option<&str>) -> Self {
        if let Some(id) = request_id {
            debug_assert!(!id.is_empty());
            self.body.request_id = Some(id.to_string());
        }
        self
    }

    fn invalid_param(field: &str, message: impl Into<String>) -> Self {
        debug_assert!(!field.is_empty());
        ApiError::new(StatusCode::BAD_REQUEST, ERROR_INVALID_PARAMETER, message).with_field(field)
    }

    fn not_found(field: &str, message: impl Into<String>) -> Self {
        debug_assert!(!field.is_empty());
        ApiError::new(StatusCode::NOT_FOUND, ERROR_NOT_FOUND, message).with_field(field)
    }

    fn conflict(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::CONFLICT, ERROR_CONFLICT, message)
    }

    fn unavailable(reason: String) -> Self {
        let mut api = ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            ERROR_UNAVAILABLE,
            reason.clone(),
        );
        api.unavailable_reason = Some(reason);
        api
    }

    fn internal() -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ERROR_INTERNAL,
            "internal server error",
        )
    }

    fn resource_not_found(path: &str) -> Self {
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::NOT_FOUND,
            ERROR_NOT_FOUND,
            format!("resource `{path}` not found"),
        )
    }

    fn method_not_allowed(method: &str, path: &str) -> Self {
        debug_assert!(!method.is_empty());
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            ERROR_METHOD_NOT_ALLOWED,
            format!("method `{method}` not allowed for `{path}`"),
        )
    }
}

impl From<CatalogError> for ApiError {
    fn from(error: CatalogError) -> Self {
        match error.kind {
            CatalogErrorKind::InvalidParameter { field } => {
                ApiError::invalid_param(&field, error.message)
            }
            CatalogErrorKind::NotFound { resource } => ApiError::not_found(&resource, error.message),
            CatalogErrorKind::Conflict => ApiError::conflict(error.message),
            CatalogErrorKind::Unavailable { reason } => ApiError::unavailable(reason),
            CatalogErrorKind::Internal => {
                tracing::error!(message = %error.message, "archive request failed");
                ApiError::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = self.body;
        let mut info = json!({ "error": self.error });
        if let Some(field) = self.field {
            info["field"] = Value::String(field);
        }
        body.error_info = Some(info);

        let mut response = (self.status, Json(body)).into_response();
        if let Some(reason) = self.unavailable_reason {
            let value = HeaderValue::from_str(&reason)
                .unwrap_or_else(|_| HeaderValue::from_static("unavailable"));
            response
                .headers_mut()
                .insert(HeaderName::from_static(UNAVAILABLE_HEADER), value);
        }
        response
    }
}

fn sanitize_optional(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_status(raw: &str) -> Result<ArchiveStatus, ApiError> {
    raw.to_ascii_uppercase()
        .parse::<ArchiveStatus>()
        .map_err(|_| ApiError::invalid_param("status", format!("unknown status `{raw}`")))
}

fn parse_id(field: &str, raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::invalid_param(field, format!("`{raw}` is not a valid archive id")))
}

fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => Ok(vec![value]),
        OneOrMany::Many(values) => Ok(values),
    }
}

fn expand_csv(values: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        for part in value.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            out.push(trimmed.to_string());
        }
    }
    out
}

fn ensure_range(field: &str, value: usize, min: usize, max: usize) -> Result<(), ApiError> {
    debug_assert!(min <= max);
    if value < min || value > max {
        return Err(ApiError::invalid_param(
            field,
            format!("must be between {min} and {max}"),
        ));
    }
    Ok(())
}

/// Routes with the archive API attached; no tracing, CORS or request ids.
pub fn build_api_router(api: DynArchiveApi) -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));
    debug_assert!(PAGE_SIZE_DEFAULT <= PAGE_SIZE_MAX);

    let state: ApiStateHandle = Arc::new(ApiState { api });
    Router::new()
        .route(
            HEALTHZ_PATH,
            get(healthz).fallback(method_not_allowed_handler),
        )
        .route(
            ALL_ARCHIVES_PATH,
            get(list_all_archives).fallback(method_not_allowed_handler),
        )
        .route(
            ALL_ARCHIVE_PATH,
            get(get_all_archive).fallback(method_not_allowed_handler),
        )
        .route(
            SET_ARCHIVES_PATH,
            get(list_set_archives).fallback(method_not_allowed_handler),
        )
        .route(
            SET_ARCHIVE_PATH,
            get(get_set_archive)
                .post(submit_set_query)
                .fallback(method_not_allowed_handler),
        )
        .route(
            LATEST_FILE_PATH,
            get(download_latest).fallback(method_not_allowed_handler),
        )
        .route(
            FILE_PATH,
            get(download_by_id).fallback(method_not_allowed_handler),
        )
        .route(
            EVENTS_PATH,
            post(post_event).fallback(method_not_allowed_handler),
        )
        .fallback(not_found_handler)
        .layer(AddExtensionLayer::new(state))
}

pub async fn serve(config: ServerConfig, api: DynArchiveApi) -> Result<(), ServerError> {
    debug_assert!(config.listen_addr.len() <= 128);
    debug_assert!(!config.listen_addr.contains('\n'));

    let listen_addr = parse_listen_addr(&config.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "archivist server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_app_router(&config, api)?;

    let mut server_future = Box::pin(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx, config.drain_timeout()));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

fn build_app_router(config: &ServerConfig, api: DynArchiveApi) -> Result<Router, ServerError> {
    let mut router = build_api_router(api);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let path = matched_path_or_uri(request);
            let request_id =
                header_request_id(request.headers()).unwrap_or_else(|| "-".to_string());
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %path,
                request_id = %request_id
            )
        })
        .on_response(|response: &Response, latency: Duration, span: &tracing::Span| {
            let status = response.status().as_u16();
            let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
            tracing::info!(parent: span, status, latency_ms, "request completed");
        })
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::error!(parent: span, latency_ms, error = %error, "request failed");
            },
        );

    if config.cors.enabled {
        let cors_layer = build_cors_layer(&config.cors)?;
        router = router.layer(cors_layer);
    }

    router = router.layer(trace_layer);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);
    router = router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(
            request_id_header,
            MakeRequestUuid::default(),
        ));

    Ok(router)
}

fn build_cors_layer(config: &CorsConfig) -> Result<CorsLayer, ServerError> {
    if config.allow_origins.is_empty() {
        return Err(ServerError::CorsConfig {
            reason: "allow_origins must list at least one origin".to_string(),
        });
    }
    let origins: Vec<HeaderValue> = config
        .allow_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|err| ServerError::CorsConfig {
                reason: format!("origin `{origin}` is not a valid header value: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let methods: Vec<Method> = config
        .allow_methods
        .iter()
        .map(|method| {
            crate::config::parse_method(method).map_err(|reason| ServerError::CorsConfig { reason })
        })
        .collect::<Result<_, _>>()?;

    let allow_headers: Vec<HeaderName> = config
        .allow_headers
        .iter()
        .map(|name| {
            crate::config::parse_header(name).map_err(|reason| ServerError::CorsConfig { reason })
        })
        .collect::<Result<_, _>>()?;

    let expose_headers: Vec<HeaderName> = config
        .expose_headers
        .iter()
        .map(|name| {
            crate::config::parse_header(name).map_err(|reason| ServerError::CorsConfig { reason })
        })
        .collect::<Result<_, _>>()?;

    let mut cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list(methods))
        .allow_credentials(config.allow_credentials)
        .max_age(Duration::from_secs(config.max_age_secs));

    if !allow_headers.is_empty() {
        cors = cors.allow_headers(AllowHeaders::list(allow_headers));
    }

    if !expose_headers.is_empty() {
        cors = cors.expose_headers(ExposeHeaders::list(expose_headers));
    }

    Ok(cors)
}

async fn healthz(Extension(state): Extension<ApiStateHandle>) -> Response {
    let report = state.api.health().await;
    if report.healthy {
        return Json(HealthzResponse {
            status: HEALTHZ_OK,
            reason: None,
        })
        .into_response();
    }
    debug_assert!(report.reason.is_some());
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(HealthzResponse {
            status: HEALTHZ_DEGRADED,
            reason: report.reason,
        }),
    )
        .into_response()
}

async fn list_archives(
    state: &ApiState,
    archive_type: ArchiveType,
    query: ListQuery,
) -> Result<Json<Page<Archive>>, ApiError> {
    let params = query.into_params(archive_type)?;
    let page = state.api.list(params).await?;
    debug_assert!(page.content.len() <= page.size);
    Ok(Json(page))
}

async fn list_all_archives(
    Extension(state): Extension<ApiStateHandle>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<Archive>>, ApiError> {
    list_archives(&state, ArchiveType::All, query).await
}

async fn list_set_archives(
    Extension(state): Extension<ApiStateHandle>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<Archive>>, ApiError> {
    list_archives(&state, ArchiveType::SetQuery, query).await
}

async fn get_all_archive(
    Extension(state): Extension<ApiStateHandle>,
    Path(id): Path<String>,
) -> Result<Json<Archive>, ApiError> {
    let id = parse_id("id", &id)?;
    Ok(Json(state.api.get(ArchiveType::All, id).await?))
}

async fn get_set_archive(
    Extension(state): Extension<ApiStateHandle>,
    Path(id): Path<String>,
) -> Result<Json<Archive>, ApiError> {
    let id = parse_id("id", &id)?;
    Ok(Json(state.api.get(ArchiveType::SetQuery, id).await?))
}

async fn submit_set_query(
    Extension(state): Extension<ApiStateHandle>,
    Path(set_id): Path<String>,
) -> Result<Response, ApiError> {
    let set_id = set_id.trim();
    if set_id.is_empty() {
        return Err(ApiError::invalid_param("set_id", "must not be empty"));
    }
    match state.api.request_set_query(set_id).await? {
        SetQuerySubmission::Accepted(archive) => {
            Ok((StatusCode::ACCEPTED, Json(archive)).into_response())
        }
        SetQuerySubmission::Reused(archive) => Ok((StatusCode::OK, Json(archive)).into_response()),
    }
}

async fn download_latest(Extension(state): Extension<ApiStateHandle>) -> Result<Response, ApiError> {
    let file = state.api.latest_download().await?;
    Ok(file_response(file))
}

async fn download_by_id(
    Extension(state): Extension<ApiStateHandle>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id("id", &id)?;
    let file = state.api.download(id).await?;
    Ok(file_response(file))
}

async fn post_event(Extension(state): Extension<ApiStateHandle>) -> Result<StatusCode, ApiError> {
    state.api.trigger_build().await?;
    Ok(StatusCode::ACCEPTED)
}

fn file_response(file: ArchiveFile) -> Response {
    let file_name = file.archive.file_name();
    let mut response = Body::from_stream(file.stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(ARCHIVE_CONTENT_TYPE),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(size) = file.size_bytes {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    response
}

async fn method_not_allowed_handler(request: Request<Body>) -> Response {
    debug_assert!(request.uri().path().starts_with('/'));
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::method_not_allowed(&method, &path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

async fn not_found_handler(request: Request<Body>) -> Response {
    debug_assert!(request.uri().path().starts_with('/'));
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::resource_not_found(&path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

fn matched_path_or_uri<B>(request: &Request<B>) -> String {
    if let Some(path) = request.extensions().get::<MatchedPath>() {
        return path.as_str().to_string();
    }
    request.uri().path().to_string()
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    debug_assert!(!sender.is_closed());
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
    timeout: Duration,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            debug_assert!(event != ShutdownEvent::Pending);
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(timeout).await;
            tracing::warn!(
                ?event,
                seconds = timeout.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}
