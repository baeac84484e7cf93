use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{Config, StoreBackend};
use crate::conversations;
use crate::error::ApiError;
use crate::logging::init_tracing;
use crate::media::{
    content_type_from_extension, is_safe_path_segment, LocalObjectStore, MediaFetcher, ObjectStore,
};
use crate::outbound::{self, SendRequest};
use crate::pipeline::Ingestion;
use crate::provider::{Provider, WhatsAppCloud};
use crate::signature::{verify_signature, SIGNATURE_HEADER};
use crate::store::{MemoryStore, PgStore, SeedData, Store};
use crate::types::{now_iso, Agent, ConversationPatch};
use crate::webhook::WebhookPayload;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn Provider>,
    pub objects: Arc<dyn ObjectStore>,
    pub ingestion: Ingestion,
    pub app_secret: String,
    pub verify_token: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        objects: Arc<dyn ObjectStore>,
        app_secret: impl Into<String>,
        verify_token: impl Into<String>,
    ) -> Self {
        let media = MediaFetcher::new(provider.clone(), objects.clone());
        Self {
            ingestion: Ingestion::new(store.clone(), provider.clone(), media),
            store,
            provider,
            objects,
            app_secret: app_secret.into(),
            verify_token: verify_token.into(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/whatsapp",
            get(whatsapp_webhook_verify).post(whatsapp_webhook_event),
        )
        .route(
            "/api/conversations/{conversation_id}",
            get(get_conversation).patch(patch_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/messages",
            axum::routing::post(send_conversation_message),
        )
        .route(
            "/api/media/{conversation_id}/{file_name}",
            get(serve_stored_media),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

async fn auth_agent_from_headers(state: &AppState, headers: &HeaderMap) -> Result<Agent, ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Err(ApiError::Unauthorized("missing bearer token".into()));
    };
    state
        .store
        .agent_for_token(&token)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid token".into()))
}

fn query_param<'a>(params: &'a HashMap<String, String>, keys: &[&str]) -> &'a str {
    keys.iter()
        .find_map(|key| params.get(*key))
        .map(String::as_str)
        .unwrap_or_default()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn whatsapp_webhook_verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = query_param(&params, &["hub.mode", "mode"]);
    let token = query_param(&params, &["hub.verify_token", "verify_token"]);
    let challenge = query_param(&params, &["hub.challenge", "challenge"]);

    if mode == "subscribe" && !state.verify_token.is_empty() && token == state.verify_token {
        info!("whatsapp webhook verified");
        return (StatusCode::OK, challenge.to_string()).into_response();
    }
    warn!(mode, "whatsapp webhook verification rejected");
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "invalid webhook verification token" })),
    )
        .into_response()
}

/// Verifies and acknowledges at once; the payload is ingested in the
/// background so slow provider calls never delay the 200.
async fn whatsapp_webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if !verify_signature(&state.app_secret, signature, &body) {
        warn!(has_signature = signature.is_some(), "rejected webhook with bad signature");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let payload = match serde_json::from_slice::<WebhookPayload>(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "malformed webhook payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid webhook payload" })),
            )
                .into_response();
        }
    };

    let ingestion = state.ingestion.clone();
    let span = info_span!("ingest", entries = payload.entry.len());
    tokio::spawn(
        async move {
            ingestion.process(payload).await;
        }
        .instrument(span),
    );

    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent = auth_agent_from_headers(&state, &headers).await?;
    let conversation = conversations::scoped_conversation(
        state.store.as_ref(),
        &agent.organization_id,
        &conversation_id,
    )
    .await?;
    let messages = state.store.conversation_messages(&conversation.id).await?;
    Ok(Json(json!({
        "conversation": conversation,
        "messages": messages,
    })))
}

async fn patch_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent = auth_agent_from_headers(&state, &headers).await?;
    let patch: ConversationPatch = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("invalid body: {err}")))?;
    let conversation =
        conversations::update(state.store.as_ref(), &agent, &conversation_id, &patch).await?;
    Ok(Json(json!({ "conversation": conversation })))
}

async fn send_conversation_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent = auth_agent_from_headers(&state, &headers).await?;
    let request: SendRequest = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("invalid body: {err}")))?;
    let message = outbound::send_as_agent(
        state.store.as_ref(),
        state.provider.as_ref(),
        &agent,
        &conversation_id,
        request,
    )
    .await?;
    Ok(Json(json!({ "message": message })))
}

async fn serve_stored_media(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, file_name)): Path<(String, String)>,
) -> Response {
    if !is_safe_path_segment(&conversation_id) || !is_safe_path_segment(&file_name) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid media path" })),
        )
            .into_response();
    }

    let bytes = match state.objects.get(&conversation_id, &file_name).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "media file not found" })),
            )
                .into_response();
        }
        Err(err) => {
            error!(error = %err, "failed to read stored media");
            return ApiError::Internal("failed to read media".into()).into_response();
        }
    };

    let extension = file_name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    let mut response = Response::new(axum::body::Body::from(bytes));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_from_extension(extension)),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    response
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    init_tracing(&config);

    if config.app_secret.is_empty() {
        warn!("WHATSAPP_APP_SECRET is not set, every webhook delivery will be rejected");
    }

    tokio::fs::create_dir_all(&config.media_storage_dir)
        .await
        .expect("failed to create media storage dir");

    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Postgres => {
            let db = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(&config.database_url)
                .await
                .expect("failed to connect postgres");
            sqlx::migrate!("./migrations")
                .run(&db)
                .await
                .expect("failed to run migrations");
            Arc::new(PgStore::new(db))
        }
        StoreBackend::Memory => {
            let seed = match &config.seed_file {
                Some(path) => SeedData::from_file(path)
                    .await
                    .expect("failed to load seed file"),
                None => SeedData::default(),
            };
            warn!("using in-memory store, data is lost on restart");
            Arc::new(MemoryStore::from_seed(seed))
        }
    };

    let provider: Arc<dyn Provider> = Arc::new(
        WhatsAppCloud::new(config.graph_api_url.clone(), config.provider_timeout)
            .expect("failed to build whatsapp client"),
    );
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
        config.media_storage_dir.clone(),
        config.public_base_url.clone(),
    ));

    let state = Arc::new(AppState::new(
        store,
        provider,
        objects,
        config.app_secret.clone(),
        config.verify_token.clone(),
    ));
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .expect("failed to bind server port");
    info!(%addr, backend = ?config.store_backend, "server listening");
    axum::serve(listener, app).await.expect("server failed");
}
