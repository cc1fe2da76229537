use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderValue, StatusCode};
use seedbridge_protocol::{
    decode_metainfo, hash_string, numeric_id, project, torrent_info, RpcRequest, RpcResponse,
    SessionInfo, TorrentAddArguments, TorrentAdded, TorrentGetArguments, TorrentRemoveArguments,
    METHOD_SESSION_GET, METHOD_TORRENT_ADD, METHOD_TORRENT_GET, METHOD_TORRENT_REMOVE,
};
use seedbridge_remote::{fetch_tagged_transfers, RemoteError, SeedboxClient};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const RPC_PATH: &str = "/transmission/rpc";
pub const SESSION_ID_HEADER: &str = "x-transmission-session-id";
pub const RPC_VERSION: u32 = 17;
pub const RPC_VERSION_MINIMUM: u32 = 14;

const ENVELOPE_HEADROOM: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct RpcSettings {
    /// Label applied to created transfers and used to list them back.
    pub tag: String,
    /// Reported as every torrent's download directory.
    pub download_dir: String,
    pub max_metainfo_bytes: usize,
    pub credentials: Option<Credentials>,
}

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<dyn SeedboxClient>,
    pub settings: Arc<RpcSettings>,
    pub session_id: Arc<String>,
}

impl AppState {
    pub fn new(client: Arc<dyn SeedboxClient>, settings: RpcSettings) -> Self {
        Self {
            client,
            settings: Arc::new(settings),
            session_id: Arc::new(Uuid::now_v7().simple().to_string()),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = request_body_limit(state.settings.max_metainfo_bytes);
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route(RPC_PATH, post(rpc))
        .route_layer(middleware::map_response_with_state(
            state.clone(),
            decorate_response,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Largest request body accepted: a maximal payload after base64 expansion
/// by a third, with room for line breaks and the envelope.
fn request_body_limit(max_metainfo_bytes: usize) -> usize {
    max_metainfo_bytes
        .saturating_mul(3)
        .saturating_div(2)
        .saturating_add(ENVELOPE_HEADROOM)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state
        .client
        .list_tagged_transfers(&state.settings.tag)
        .await
        .is_ok();
    let payload = Json(json!({
        "status": if ready { "ready" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339()
    }));

    if ready {
        (StatusCode::OK, payload).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, payload).into_response()
    }
}

/// Every response carries the session id; authentication failures also
/// carry the basic-auth challenge.
async fn decorate_response(State(state): State<AppState>, mut response: Response) -> Response {
    if let Ok(value) = HeaderValue::from_str(&state.session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    if response.status() == StatusCode::UNAUTHORIZED {
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"seedbridge\""),
        );
    }
    response
}

async fn rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers)?;

    let request: RpcRequest = serde_json::from_slice(&body).map_err(|err| {
        warn!(error = %err, "unparseable rpc request");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_request", "detail": err.to_string() })),
        )
    })?;

    let response = dispatch(&state, &request)
        .await
        .map_err(internal_error)?
        .with_tag(request.tag.clone());
    if !response.is_success() {
        info!(method = %request.method, reason = %response.result, "rpc request failed");
    }

    let encoded = serde_json::to_vec(&response).map_err(|e| internal_error(e.into()))?;
    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        encoded,
    ))
}

/// Protocol-level failures come back as a response; `Err` is reserved for
/// local faults and becomes a 500.
async fn dispatch(state: &AppState, request: &RpcRequest) -> anyhow::Result<RpcResponse> {
    debug!(method = %request.method, "rpc request");
    let response = match request.method.as_str() {
        METHOD_TORRENT_ADD => torrent_add(state, &request.arguments).await,
        METHOD_TORRENT_GET => torrent_get(state, &request.arguments).await?,
        METHOD_TORRENT_REMOVE => torrent_remove(state, &request.arguments).await,
        METHOD_SESSION_GET => session_get(state)?,
        other => {
            warn!(method = %other, "unsupported rpc method");
            RpcResponse::failure("method not recognized")
        }
    };
    Ok(response)
}

/// Absent or null arguments read as the method's defaults.
fn parse_arguments<T: DeserializeOwned + Default>(
    method: &str,
    arguments: &Value,
) -> Result<T, RpcResponse> {
    if arguments.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(arguments.clone()).map_err(|err| {
        RpcResponse::failure(format!("invalid {method} arguments: {err}"))
    })
}

async fn torrent_add(state: &AppState, arguments: &Value) -> RpcResponse {
    let arguments: TorrentAddArguments = match parse_arguments(METHOD_TORRENT_ADD, arguments) {
        Ok(arguments) => arguments,
        Err(rejected) => return rejected,
    };
    let tag = state.settings.tag.as_str();

    if let Some(encoded) = arguments.payload() {
        if arguments.link().is_some() {
            debug!("metainfo present; ignoring filename");
        }
        let metainfo = match decode_metainfo(encoded, state.settings.max_metainfo_bytes) {
            Ok(metainfo) => metainfo,
            Err(err) => {
                warn!(error = %err, "rejected torrent payload");
                return RpcResponse::failure(err.to_string());
            }
        };
        let Some(uploader) = state.client.payload_uploader() else {
            return RpcResponse::failure(RemoteError::Unsupported("torrent file uploads").to_string());
        };

        let filename = metainfo.filename();
        return match uploader
            .create_transfer_from_payload(&filename, metainfo.into_bytes(), tag)
            .await
        {
            Ok(transfer) => {
                info!(transfer_id = %transfer.id, filename = %filename, "transfer created from torrent file");
                added(&transfer.id, &transfer.name)
            }
            Err(err) => {
                error!(filename = %filename, error = %err, "torrent file upload failed");
                RpcResponse::failure(format!("torrent file upload failed: {err}"))
            }
        };
    }

    let Some(link) = arguments.link() else {
        return RpcResponse::failure("torrent-add requires filename or metainfo");
    };
    match state.client.create_transfer_from_link(link, tag).await {
        Ok(transfer) => {
            info!(transfer_id = %transfer.id, "transfer created from link");
            added(&transfer.id, &transfer.name)
        }
        Err(err) => {
            error!(error = %err, "transfer creation from link failed");
            RpcResponse::failure(format!("transfer creation failed: {err}"))
        }
    }
}

fn added(transfer_id: &str, name: &str) -> RpcResponse {
    let added = TorrentAdded {
        id: numeric_id(transfer_id),
        name: name.to_string(),
        hash_string: hash_string(transfer_id),
    };
    RpcResponse::success(json!({ "torrent-added": added }))
}

/// Read path: every tagged transfer, whatever its claim state.
async fn torrent_get(state: &AppState, arguments: &Value) -> anyhow::Result<RpcResponse> {
    let arguments: TorrentGetArguments = match parse_arguments(METHOD_TORRENT_GET, arguments) {
        Ok(arguments) => arguments,
        Err(rejected) => return Ok(rejected),
    };
    let settings = state.settings.as_ref();

    let transfers = match fetch_tagged_transfers(state.client.as_ref(), &settings.tag).await {
        Ok(transfers) => transfers,
        Err(err) => {
            error!(tag = %settings.tag, error = %err, "listing tagged transfers failed");
            return Ok(RpcResponse::failure(format!("listing transfers failed: {err}")));
        }
    };

    let torrents = transfers
        .iter()
        .map(|transfer| torrent_info(transfer, &settings.download_dir, &settings.tag))
        .filter(|info| {
            arguments
                .ids
                .as_ref()
                .map_or(true, |ids| ids.selects(info.id, &info.hash_string))
        })
        .map(|info| project(&info, &arguments.fields))
        .collect::<Result<Vec<Value>, _>>()
        .context("encoding torrent fields")?;

    Ok(RpcResponse::success(json!({ "torrents": torrents })))
}

async fn torrent_remove(state: &AppState, arguments: &Value) -> RpcResponse {
    let arguments: TorrentRemoveArguments =
        match parse_arguments(METHOD_TORRENT_REMOVE, arguments) {
            Ok(arguments) => arguments,
            Err(rejected) => return rejected,
        };
    let Some(ids) = arguments.ids else {
        return RpcResponse::failure("torrent-remove requires ids");
    };

    let transfers = match state
        .client
        .list_tagged_transfers(&state.settings.tag)
        .await
    {
        Ok(transfers) => transfers,
        Err(err) => return RpcResponse::failure(format!("listing transfers failed: {err}")),
    };

    for transfer in transfers
        .iter()
        .filter(|t| ids.selects(numeric_id(&t.id), &hash_string(&t.id)))
    {
        match state.client.remove_transfer(&transfer.id).await {
            Ok(removed) => info!(
                transfer_id = %transfer.id,
                removed,
                delete_local_data = arguments.delete_local_data,
                "torrent-remove handled"
            ),
            Err(err) => {
                error!(transfer_id = %transfer.id, error = %err, "remote removal failed");
                return RpcResponse::failure(format!("removing {} failed: {err}", transfer.name));
            }
        }
    }

    RpcResponse::success(json!({}))
}

fn session_get(state: &AppState) -> anyhow::Result<RpcResponse> {
    let session = SessionInfo {
        version: format!("seedbridge {}", env!("CARGO_PKG_VERSION")),
        rpc_version: RPC_VERSION,
        rpc_version_minimum: RPC_VERSION_MINIMUM,
        download_dir: state.settings.download_dir.clone(),
    };
    let arguments = serde_json::to_value(session).context("encoding session")?;
    Ok(RpcResponse::success(arguments))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(expected) = &state.settings.credentials else {
        return Ok(());
    };

    match basic_credentials(headers) {
        Some(provided) if credentials_match(&provided, expected) => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_or_missing_credentials"})),
        )),
    }
}

/// Compares fixed-size digests in constant time so the response time does not
/// reveal how much of a guess was right.
fn credentials_match(provided: &Credentials, expected: &Credentials) -> bool {
    let username = constant_time_eq(
        &Sha256::digest(&provided.username),
        &Sha256::digest(&expected.username),
    );
    let password = constant_time_eq(
        &Sha256::digest(&provided.password),
        &Sha256::digest(&expected.password),
    );
    username & password
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .fold(0u8, |diff, (l, r)| diff | (l ^ r))
            == 0
}

fn basic_credentials(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

fn internal_error(error: anyhow::Error) -> (StatusCode, Json<Value>) {
    error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal_error", "detail": error.to_string() })),
    )
}
