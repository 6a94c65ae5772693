mod config;
mod http;
mod idempotency;
mod metrics;
mod models;
mod onboarding;
mod remote;
mod security;
mod sessions;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use config::EngineConfig;
use eyre::WrapErr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, CreateWizardRequest, FieldQuery, FieldUpdate, LocateRequest, NearbyRequest,
    RemoveAssetRequest, SubmissionReceipt, UploadRequest, WizardResponse,
};
use onboarding::{
    NearbyDistance, OnboardingContext, Wizard, WizardError, WizardErrorKind,
    inventory::InventoryPatch,
    persistence::{MemorySnapshotStore, RedisSnapshotStore, SnapshotStore},
    submission,
    upload::{UploadManager, UploadSlot},
};
use remote::{Category, Coordinates, RemoteError, Remotes, UploadFile};
use security::{AuthContext, AuthState, require_api_auth};
use serde_json::{Value, json};
use sessions::{Lookup, SessionRegistry, SharedWizard};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "onboarding.api", "server crashed: {err:#}");
        return Err(err);
    }
    Ok(())
}

async fn run() -> eyre::Result<()> {
    let config = Arc::new(EngineConfig::load());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let snapshots: Arc<dyn SnapshotStore> = match &redis {
        Some(client) => Arc::new(RedisSnapshotStore::new(
            client.clone(),
            config.snapshot_ttl_secs,
        )),
        None => {
            info!(target = "onboarding.api", "REDIS_URL unset; draft snapshots kept in memory");
            Arc::new(MemorySnapshotStore::default())
        }
    };
    let state = AppState {
        onboarding: OnboardingContext {
            remotes: Remotes::from_env(),
            snapshots,
            config,
        },
        sessions: SessionRegistry::default(),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };
    let app = build_router(state, AuthState::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "onboarding.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    onboarding: OnboardingContext,
    sessions: SessionRegistry,
    idempotency: Arc<Mutex<HashMap<String, SubmissionReceipt>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

fn build_router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let wizard_routes = Router::new()
        .route("/", post(create_wizard))
        .route("/{id}", get(get_wizard).delete(exit_wizard))
        .route("/{id}/draft", patch(set_field).get(get_field))
        .route("/{id}/next", post(next_step))
        .route("/{id}/back", post(previous_step))
        .route("/{id}/goto/{step}", post(go_to_step))
        .route("/{id}/locate", post(locate))
        .route("/{id}/nearby", post(add_nearby))
        .route("/{id}/nearby/{index}", axum::routing::delete(remove_nearby))
        .route(
            "/{id}/uploads/{slot}",
            post(upload_assets).delete(remove_asset),
        )
        .route("/{id}/inventory", post(start_add_item))
        .route("/{id}/inventory/editing", patch(patch_item))
        .route("/{id}/inventory/save", post(save_item))
        .route("/{id}/inventory/cancel", post(cancel_item))
        .route("/{id}/inventory/{local_id}/edit", post(start_edit_item))
        .route(
            "/{id}/inventory/{local_id}",
            axum::routing::delete(delete_item),
        )
        .route("/{id}/submit", post(submit));

    let protected = Router::new()
        .route("/categories", get(list_categories))
        .nest("/wizards", wizard_routes)
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "property-onboarding",
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64 * 1024 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state.prometheus_handle.render();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn list_categories(
    State(state): State<AppState>,
) -> Result<Json<Vec<Category>>, AppError> {
    crate::metrics::inc_requests("/categories");
    let categories = state
        .onboarding
        .remotes
        .categories
        .list_active_categories()
        .await?;
    Ok(Json(categories))
}

/// Open a wizard session.
///
/// - Method: `POST`
/// - Path: `/wizards`
/// - Body: `CreateWizardRequest`; `propertyId` opens an existing record in
///   edit mode, otherwise the category label (or the label looked up from
///   `categoryId`) picks the property kind.
/// - Response: `201` with the wizard view, or `200` with the live session
///   already editing the same draft
async fn create_wizard(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(request): Json<CreateWizardRequest>,
) -> Result<(StatusCode, Json<WizardResponse>), AppError> {
    crate::metrics::inc_requests("/wizards");
    let scope = context.partner_id.as_str();
    let key = Wizard::key_for(
        &state.onboarding,
        scope,
        request.property_id.as_deref(),
        request.category_id.as_deref(),
    );
    if let Some((id, wizard)) = state.sessions.find_live(scope, &key).await {
        info!(target = "onboarding.api", partner_id = %context.partner_id, %id, "wizard session resumed");
        let wizard = wizard.lock().await;
        return Ok((StatusCode::OK, respond(id, &wizard)));
    }
    let wizard = match request.property_id.as_deref() {
        Some(property_id) => Wizard::open_existing(&state.onboarding, scope, property_id).await?,
        None => {
            let label = resolve_label(&state, &request).await?;
            Wizard::create(&state.onboarding, scope, request.category_id.clone(), label).await
        }
    };
    let (id, wizard, opened) = state.sessions.open(scope, wizard).await;
    let view = wizard.lock().await.view();
    info!(
        target = "onboarding.api",
        partner_id = %context.partner_id,
        api_key = %context.api_key_id,
        %id,
        kind = view.kind.as_str(),
        edit_mode = view.edit_mode,
        opened,
        "wizard session created",
    );
    let status = if opened { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(WizardResponse { id, view })))
}

async fn resolve_label(state: &AppState, request: &CreateWizardRequest) -> Result<String, AppError> {
    if let Some(label) = request
        .category_label
        .as_deref()
        .map(str::trim)
        .filter(|label| !label.is_empty())
    {
        return Ok(label.to_string());
    }
    let Some(category_id) = request.category_id.as_deref() else {
        return Err(AppError::BadRequest(
            "categoryId or categoryLabel is required".into(),
        ));
    };
    let categories = state
        .onboarding
        .remotes
        .categories
        .list_active_categories()
        .await?;
    categories
        .iter()
        .find(|category| category.id == category_id)
        .map(|category| category.label().to_string())
        .ok_or_else(|| AppError::BadRequest(format!("unknown category `{category_id}`")))
}

fn parse_id(id: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(id).map_err(|_| AppError::BadRequest(format!("invalid wizard id `{id}`")))
}

async fn session(state: &AppState, id: &str, context: &AuthContext) -> Result<(Uuid, SharedWizard), AppError> {
    let uuid = parse_id(id)?;
    live_session(state, uuid, context)
        .await
        .map(|wizard| (uuid, wizard))
}

async fn live_session(state: &AppState, uuid: Uuid, context: &AuthContext) -> Result<SharedWizard, AppError> {
    match state.sessions.get(uuid, &context.partner_id).await {
        Some(Lookup::Live(wizard)) => Ok(wizard),
        Some(Lookup::Submitted { .. }) => Err(WizardError::AlreadySubmitted.into()),
        None => Err(AppError::UnknownSession(uuid)),
    }
}

fn respond(id: Uuid, wizard: &Wizard) -> Json<WizardResponse> {
    Json(WizardResponse {
        id,
        view: wizard.view(),
    })
}

async fn get_wizard(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let wizard = wizard.lock().await;
    Ok(respond(id, &wizard))
}

/// Abandon a session and drop its saved draft.
async fn exit_wizard(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    crate::metrics::inc_requests("/wizards/exit");
    let id = parse_id(&id)?;
    match state.sessions.remove(id, &context.partner_id).await {
        Some(Some(wizard)) => {
            wizard.lock().await.exit().await;
        }
        Some(None) => {}
        None => return Err(AppError::UnknownSession(id)),
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn set_field(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(update): Json<FieldUpdate>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.set_field(&update.path, update.value)?;
    Ok(respond(id, &wizard))
}

async fn get_field(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(query): Query<FieldQuery>,
) -> Result<Json<Value>, AppError> {
    let (_, wizard) = session(&state, &id, &context).await?;
    let value = wizard.lock().await.get_field(&query.path)?;
    Ok(Json(value))
}

async fn next_step(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.next()?;
    Ok(respond(id, &wizard))
}

async fn previous_step(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.back()?;
    Ok(respond(id, &wizard))
}

async fn go_to_step(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((id, step)): Path<(String, usize)>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.go_to(step)?;
    Ok(respond(id, &wizard))
}

async fn locate(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(request): Json<LocateRequest>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let geocoder = state.onboarding.remotes.geocoder.clone();
    let resolved = Wizard::reverse_geocode(geocoder.as_deref(), request.lat, request.lng).await?;
    let mut wizard = wizard.lock().await;
    wizard.locate(request.lat, request.lng, resolved)?;
    Ok(respond(id, &wizard))
}

async fn add_nearby(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(request): Json<NearbyRequest>,
) -> Result<Json<WizardResponse>, AppError> {
    let distance = match (request.distance_km, request.lat, request.lng) {
        (Some(km), _, _) => NearbyDistance::Km(km),
        (None, Some(lat), Some(lng)) => NearbyDistance::At(Coordinates { lat, lng }),
        _ => {
            return Err(AppError::BadRequest(
                "provide distanceKm or lat and lng".into(),
            ));
        }
    };
    let (id, wizard) = session(&state, &id, &context).await?;
    let geocoder = state.onboarding.remotes.geocoder.clone();
    let origin = wizard.lock().await.nearby_origin()?;
    let distance_km = Wizard::measure(geocoder.as_deref(), origin, distance).await?;
    let mut wizard = wizard.lock().await;
    wizard.add_nearby(request.name, request.kind, distance_km)?;
    Ok(respond(id, &wizard))
}

async fn remove_nearby(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((id, index)): Path<(String, usize)>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.remove_nearby(index)?;
    Ok(respond(id, &wizard))
}

fn parse_slot(raw: &str) -> Result<UploadSlot, AppError> {
    UploadSlot::parse(raw).ok_or_else(|| AppError::BadRequest(format!("unknown upload slot `{raw}`")))
}

/// Upload files into a slot. The session lock is released while the asset
/// store is busy; the slot stays marked busy until the upload settles.
async fn upload_assets(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((id, slot)): Path<(String, String)>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<WizardResponse>, AppError> {
    crate::metrics::inc_requests("/wizards/uploads");
    let slot = parse_slot(&slot)?;
    let files = request
        .files
        .into_iter()
        .map(|file| -> Result<UploadFile, AppError> {
            let bytes = BASE64.decode(file.data.trim()).map_err(|err| {
                AppError::BadRequest(format!("`{}` is not valid base64: {err}", file.file_name))
            })?;
            Ok(UploadFile {
                file_name: file.file_name,
                mime_type: file.mime_type,
                bytes,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    crate::metrics::upload_bytes(&slot.to_string(), files.iter().map(|f| f.bytes.len()).sum());

    let (id, wizard) = session(&state, &id, &context).await?;
    let ticket = wizard.lock().await.begin_upload(slot, files)?;
    let outcome = state
        .onboarding
        .remotes
        .assets
        .upload_images(&ticket.files)
        .await;
    let mut wizard = wizard.lock().await;
    let settled = wizard.finish_upload(ticket, outcome);
    match settled {
        Ok(_) => Ok(respond(id, &wizard)),
        Err(WizardError::UploadTargetGone(orphaned)) => {
            drop(wizard);
            for asset in &orphaned {
                UploadManager::remove(&*state.onboarding.remotes.assets, asset, slot).await;
            }
            Err(WizardError::UploadTargetGone(orphaned).into())
        }
        Err(err) => Err(err.into()),
    }
}

async fn remove_asset(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((id, slot)): Path<(String, String)>,
    Json(request): Json<RemoveAssetRequest>,
) -> Result<Json<WizardResponse>, AppError> {
    let slot = parse_slot(&slot)?;
    let (id, wizard) = session(&state, &id, &context).await?;
    let asset = wizard.lock().await.detach_asset(slot, &request.url)?;
    UploadManager::remove(&*state.onboarding.remotes.assets, &asset, slot).await;
    let wizard = wizard.lock().await;
    Ok(respond(id, &wizard))
}

async fn start_add_item(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.start_add_item()?;
    Ok(respond(id, &wizard))
}

async fn start_edit_item(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((id, local_id)): Path<(String, String)>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.start_edit_item(&local_id)?;
    Ok(respond(id, &wizard))
}

async fn patch_item(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(patch): Json<InventoryPatch>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.patch_item(patch)?;
    Ok(respond(id, &wizard))
}

async fn save_item(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.save_item()?;
    Ok(respond(id, &wizard))
}

async fn cancel_item(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.cancel_item()?;
    Ok(respond(id, &wizard))
}

async fn delete_item(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((id, local_id)): Path<(String, String)>,
) -> Result<Json<WizardResponse>, AppError> {
    let (id, wizard) = session(&state, &id, &context).await?;
    let mut wizard = wizard.lock().await;
    wizard.delete_item(&local_id)?;
    Ok(respond(id, &wizard))
}

/// Submit the draft.
///
/// - Method: `POST`
/// - Path: `/wizards/{id}/submit`
/// - Headers: optional `Idempotency-Key`; a repeated key returns the cached
///   receipt without touching the property store
/// - Response: `SubmissionReceipt` (property id, mode and per-stage transcript)
async fn submit(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SubmissionReceipt>, AppError> {
    crate::metrics::inc_requests("/wizards/submit");
    let id = parse_id(&id)?;
    let cache_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|key| idempotency::receipt_key(&context.partner_id, id, &key));

    if let Some(key) = &cache_key {
        let cached = match &state.redis {
            Some(client) => idempotency::redis_get::<SubmissionReceipt>(client, key).await,
            None => state.idempotency.lock().await.get(key).cloned(),
        };
        if let Some(receipt) = cached {
            info!(target = "onboarding.api", %id, "returning cached submission receipt");
            return Ok(Json(receipt));
        }
    }

    let wizard = live_session(&state, id, &context).await?;
    let plan = wizard.lock().await.begin_submission()?;
    let report = submission::execute(&plan, &state.onboarding.remotes).await;
    let receipt = wizard.lock().await.finish_submission(report).await?;
    if let Some(key) = cache_key {
        match &state.redis {
            Some(client) => {
                let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(3600);
                idempotency::redis_set(client, &key, &receipt, ttl).await;
            }
            None => {
                state.idempotency.lock().await.insert(key, receipt.clone());
            }
        }
    }
    drop(wizard);
    state
        .sessions
        .mark_submitted(id, &context.partner_id, &receipt.property_id)
        .await;
    info!(
        target = "onboarding.api",
        partner_id = %context.partner_id,
        %id,
        property_id = %receipt.property_id,
        "submission completed",
    );
    Ok(Json(receipt))
}

#[derive(Debug)]
enum AppError {
    Wizard(WizardError),
    Remote(RemoteError),
    UnknownSession(Uuid),
    BadRequest(String),
}

impl From<WizardError> for AppError {
    fn from(value: WizardError) -> Self {
        Self::Wizard(value)
    }
}

impl From<RemoteError> for AppError {
    fn from(value: RemoteError) -> Self {
        Self::Remote(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::Wizard(err) => {
                let status = match err.kind() {
                    WizardErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    WizardErrorKind::Conflict => StatusCode::CONFLICT,
                    WizardErrorKind::NotFound => StatusCode::NOT_FOUND,
                    WizardErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                };
                (status, err.code().to_string(), err.to_string())
            }
            AppError::Remote(RemoteError::NotFound(what)) => (
                StatusCode::NOT_FOUND,
                "not_found".to_string(),
                format!("{what} was not found"),
            ),
            AppError::Remote(err) => (StatusCode::BAD_GATEWAY, "remote".to_string(), err.to_string()),
            AppError::UnknownSession(id) => (
                StatusCode::NOT_FOUND,
                "unknown_session".to_string(),
                format!("no wizard session {id}"),
            ),
            AppError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, "invalid_input".to_string(), detail)
            }
        };
        if status.is_server_error() {
            warn!(target = "onboarding.api", %status, %error, %detail, "request failed");
        }
        let payload = ApiError {
            error,
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{
        InMemoryAssetStore, InMemoryPropertyStore, OfflineGeocoder, StaticCategorySource,
        StoreCall,
    };
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    const KEY: &str = "k-acme";

    struct Harness {
        app: Router,
        store: InMemoryPropertyStore,
    }

    fn harness() -> Harness {
        let store = InMemoryPropertyStore::default();
        let state = AppState {
            onboarding: OnboardingContext {
                remotes: Remotes {
                    properties: Arc::new(store.clone()),
                    assets: Arc::new(InMemoryAssetStore::default()),
                    geocoder: Some(Arc::new(OfflineGeocoder::default())),
                    categories: Arc::new(StaticCategorySource::default()),
                },
                snapshots: Arc::new(MemorySnapshotStore::default()),
                config: Arc::new(EngineConfig::default()),
            },
            sessions: SessionRegistry::default(),
            idempotency: Arc::new(Mutex::new(HashMap::new())),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
            redis: None,
        };
        let auth = AuthState::from_keys("acme:k-acme,globex:k-globex");
        Harness {
            app: build_router(state, auth),
            store,
        }
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("X-Partner-Key", key);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn file(name: &str, mime: &str) -> Value {
        json!({ "fileName": name, "mimeType": mime, "data": BASE64.encode(b"fake bytes") })
    }

    #[tokio::test]
    async fn health_is_public_and_wizards_need_a_key() {
        let h = harness();
        let (status, body) = call(&h.app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&h.app, Method::POST, "/wizards", None, Some(json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_api_key");
    }

    #[tokio::test]
    async fn sessions_are_scoped_to_the_partner() {
        let h = harness();
        let (status, body) = call(
            &h.app,
            Method::POST,
            "/wizards",
            Some(KEY),
            Some(json!({ "categoryId": "cat-hotel" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["kind"], "hotel");
        assert_eq!(body["categoryLabel"], "Hotel / Resort");
        let id = body["id"].clone();
        let uri = format!("/wizards/{}", id.as_str().unwrap());

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/wizards",
            Some(KEY),
            Some(json!({ "categoryId": "cat-hotel" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id);

        let (status, _) = call(&h.app, Method::GET, &uri, Some("k-globex"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = call(&h.app, Method::GET, "/wizards/nope", Some(KEY), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");

        let (status, body) = call(&h.app, Method::POST, &format!("{uri}/next"), Some(KEY), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");

        let (status, _) = call(&h.app, Method::DELETE, &uri, Some(KEY), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&h.app, Method::GET, &uri, Some(KEY), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_category_and_slot_are_rejected() {
        let h = harness();
        let (status, _) = call(
            &h.app,
            Method::POST,
            "/wizards",
            Some(KEY),
            Some(json!({ "categoryId": "cat-castle" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(
            &h.app,
            Method::POST,
            "/wizards",
            Some(KEY),
            Some(json!({ "categoryLabel": "Boutique Hotel" })),
        )
        .await;
        let uri = format!("/wizards/{}/uploads/poster", body["id"].as_str().unwrap());
        let (status, _) = call(
            &h.app,
            Method::POST,
            &uri,
            Some(KEY),
            Some(json!({ "files": [file("a.jpg", "image/jpeg")] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn plot_listing_submits_once_per_idempotency_key() {
        let h = harness();
        let (status, body) = call(
            &h.app,
            Method::POST,
            "/wizards",
            Some(KEY),
            Some(json!({ "categoryId": "cat-plot" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["kind"], "plot");
        assert_eq!(body["steps"].as_array().map(Vec::len), Some(6));
        let uri = format!("/wizards/{}", body["id"].as_str().unwrap());

        for (path, value) in [
            ("identity.name", json!("Riverside Plot 7")),
            ("details.plotArea", json!(1800)),
            ("details.areaUnit", json!("sqft")),
            ("details.pricePerUnit", json!(4200)),
            ("address.fullAddress", json!("Plot 7, Riverside Layout, Mysuru")),
        ] {
            let (status, body) = call(
                &h.app,
                Method::PATCH,
                &format!("{uri}/draft"),
                Some(KEY),
                Some(json!({ "path": path, "value": value })),
            )
            .await;
            assert_eq!(status, StatusCode::OK, "{path}: {body}");
        }

        let uploads = [
            ("cover", vec![file("cover.jpg", "image/jpeg")]),
            (
                "gallery",
                (0..4).map(|i| file(&format!("g{i}.jpg"), "image/jpeg")).collect(),
            ),
            ("document-0", vec![file("deed.pdf", "application/pdf")]),
            ("document-2", vec![file("owner.pdf", "application/pdf")]),
        ];
        for (slot, files) in uploads {
            let (status, body) = call(
                &h.app,
                Method::POST,
                &format!("{uri}/uploads/{slot}"),
                Some(KEY),
                Some(json!({ "files": files })),
            )
            .await;
            assert_eq!(status, StatusCode::OK, "{slot}: {body}");
        }

        for _ in 0..5 {
            let (status, body) =
                call(&h.app, Method::POST, &format!("{uri}/next"), Some(KEY), None).await;
            assert_eq!(status, StatusCode::OK, "{body}");
        }
        let (_, body) = call(&h.app, Method::GET, &uri, Some(KEY), None).await;
        assert_eq!(body["currentKey"], "review");

        let submit = || {
            let request = Request::builder()
                .method(Method::POST)
                .uri(format!("{uri}/submit"))
                .header("X-Partner-Key", KEY)
                .header("Idempotency-Key", "submit-1")
                .body(Body::empty())
                .unwrap();
            h.app.clone().oneshot(request)
        };
        let first = submit().await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first: Value =
            serde_json::from_slice(&to_bytes(first.into_body(), usize::MAX).await.unwrap()).unwrap();
        let second = submit().await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let second: Value =
            serde_json::from_slice(&to_bytes(second.into_body(), usize::MAX).await.unwrap())
                .unwrap();
        assert_eq!(first["propertyId"], second["propertyId"]);
        assert_eq!(first["mode"], "create");

        let creates = h
            .store
            .calls()
            .into_iter()
            .filter(|call| matches!(call, StoreCall::CreateProperty { .. }))
            .count();
        assert_eq!(creates, 1);

        let (status, body) = call(&h.app, Method::POST, &format!("{uri}/submit"), Some(KEY), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_submitted");

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/wizards",
            Some(KEY),
            Some(json!({ "categoryId": "cat-plot" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_ne!(format!("/wizards/{}", body["id"].as_str().unwrap()), uri);
        assert_eq!(body["draft"]["identity"]["name"], "");

        let (status, _) = call(&h.app, Method::DELETE, &uri, Some(KEY), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&h.app, Method::GET, &uri, Some(KEY), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
